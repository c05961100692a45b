//! Configuration management
//!
//! Values come from an optional YAML file overlaid with flat environment
//! variables (`KIBANA_TARGET`, `ELASTIC_PASS`, ...), which are mapped onto the
//! nested keys below. The result is immutable and handed to components at
//! construction.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Environment variables and the config keys they set
pub const ENV_KEYS: &[(&str, &str)] = &[
    ("KIBANA_TARGET", "kibana.target"),
    ("KIBANA_TIMEOUT_MS", "kibana.timeout_ms"),
    ("ELASTIC_TARGET", "elastic.target"),
    ("ELASTIC_USER", "elastic.username"),
    ("ELASTIC_PASS", "elastic.password"),
    ("ELASTIC_TIMEOUT_MS", "elastic.timeout_ms"),
    ("ALLOWED_EMAIL_DOMAINS", "auth.allowed_email_domains"),
    ("PROVISIONING_SINGLE_FLIGHT", "auth.single_flight"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
];

/// Keys whose environment values are parsed as numbers or booleans
///
/// Every other key takes the variable's text verbatim, so `ELASTIC_PASS=007`
/// stays `"007"`.
pub const TYPED_KEYS: &[&str] = &[
    "kibana.timeout_ms",
    "elastic.timeout_ms",
    "auth.single_flight",
    "server.port",
];

/// Config key set by environment variable `name`, if any
#[must_use]
pub fn env_key(name: &str) -> Option<&'static str> {
    ENV_KEYS
        .iter()
        .find(|(var, _)| var.eq_ignore_ascii_case(name))
        .map(|(_, key)| *key)
}

fn is_typed(key: &str) -> bool {
    TYPED_KEYS.contains(&key)
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Kibana backend
    pub kibana: KibanaConfig,
    /// Elasticsearch user directory
    pub elastic: ElasticConfig,
    /// Identity assertion policy
    pub auth: AuthConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(with = "lenient_string")]
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Kibana backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KibanaConfig {
    /// Base URL of Kibana
    #[serde(with = "lenient_string")]
    pub target: String,
    /// Deadline for a proxied response head, in milliseconds
    pub timeout_ms: u64,
}

impl Default for KibanaConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            timeout_ms: 60_000,
        }
    }
}

impl KibanaConfig {
    /// Parsed target URL
    pub fn target_url(&self) -> Result<Url> {
        parse_target("KIBANA_TARGET", &self.target)
    }

    /// Proxy deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Elasticsearch directory settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// Base URL of Elasticsearch
    #[serde(with = "lenient_string")]
    pub target: String,
    /// Service account user
    #[serde(with = "lenient_string")]
    pub username: String,
    /// Service account password
    #[serde(with = "lenient_string")]
    pub password: String,
    /// Deadline for each directory or login call, in milliseconds
    pub timeout_ms: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_ms: 10_000,
        }
    }
}

impl std::fmt::Debug for ElasticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticConfig")
            .field("target", &self.target)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl ElasticConfig {
    /// Parsed target URL
    pub fn target_url(&self) -> Result<Url> {
        parse_target("ELASTIC_TARGET", &self.target)
    }

    /// Per-call deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Identity assertion policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted email domains (exact, case-sensitive)
    #[serde(with = "domain_list")]
    pub allowed_email_domains: Vec<String>,
    /// Coalesce concurrent provisioning for the same user
    pub single_flight: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allowed_email_domains: Vec::new(),
            single_flight: false,
        }
    }
}

fn parse_target(var: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("Invalid {var} '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "Invalid {var} '{raw}': unsupported scheme '{other}' (expected http or https)"
        ))),
    }
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(
            Env::raw().filter_map(|k| env_key(k.as_str()).filter(|key| is_typed(key)).map(Into::into)),
        );

        // Text keys bypass figment's scalar parsing
        for (name, value) in std::env::vars_os() {
            let (Some(name), Some(value)) = (name.to_str(), value.to_str()) else {
                continue;
            };
            if let Some(key) = env_key(name).filter(|key| !is_typed(key)) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that everything needed to serve is present and well formed
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("KIBANA_TARGET", self.kibana.target.is_empty()),
            ("ELASTIC_TARGET", self.elastic.target.is_empty()),
            ("ELASTIC_USER", self.elastic.username.is_empty()),
            ("ELASTIC_PASS", self.elastic.password.is_empty()),
            (
                "ALLOWED_EMAIL_DOMAINS",
                self.auth.allowed_email_domains.is_empty(),
            ),
        ]
        .into_iter()
        .filter_map(|(var, absent)| absent.then_some(var))
        .collect();

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        self.kibana.target_url()?;
        self.elastic.target_url()?;

        if self.kibana.timeout_ms == 0 {
            return Err(Error::Config("KIBANA_TIMEOUT_MS must be greater than 0".to_string()));
        }
        if self.elastic.timeout_ms == 0 {
            return Err(Error::Config("ELASTIC_TIMEOUT_MS must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Human-readable summary with the password left out
    #[must_use]
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("listen", format!("{}:{}", self.server.host, self.server.port)),
            ("kibana.target", self.kibana.target.clone()),
            ("kibana.timeout_ms", self.kibana.timeout_ms.to_string()),
            ("elastic.target", self.elastic.target.clone()),
            ("elastic.username", self.elastic.username.clone()),
            ("elastic.timeout_ms", self.elastic.timeout_ms.to_string()),
            (
                "auth.allowed_email_domains",
                self.auth.allowed_email_domains.join(", "),
            ),
            ("auth.single_flight", self.auth.single_flight.to_string()),
        ]
    }
}

/// Accept strings, numbers and booleans as a string
///
/// YAML scalars such as `password: 12345` arrive typed as numbers; quote them
/// in the file to keep leading zeros.
pub mod lenient_string {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        UInt(u64),
        Float(f64),
        Bool(bool),
    }

    /// Serialize as a plain string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    /// Deserialize any scalar into its string form
    ///
    /// # Errors
    ///
    /// Returns a deserialization error for non-scalar input.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Scalar::deserialize(deserializer)? {
            Scalar::Str(s) => s,
            Scalar::Int(n) => n.to_string(),
            Scalar::UInt(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        })
    }
}

/// Domain allowlist: a comma-separated string or a list
///
/// Entries are trimmed and empty entries dropped.
pub mod domain_list {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Domains {
        Joined(String),
        List(Vec<String>),
    }

    /// Split and clean a comma-separated list
    #[must_use]
    pub fn split(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Serialize as a comma-separated string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(domains: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&domains.join(","))
    }

    /// Deserialize from a string or a sequence
    ///
    /// # Errors
    ///
    /// Returns a deserialization error for other shapes.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Domains::deserialize(deserializer)? {
            Domains::Joined(raw) => split(&raw),
            Domains::List(list) => list
                .iter()
                .flat_map(|entry| split(entry))
                .collect(),
        })
    }
}
