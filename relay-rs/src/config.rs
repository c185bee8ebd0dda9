use crate::error::{RelayRsError, Result};
use serde::{Deserialize, Serialize};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;

/// Listen address used when neither the config file nor `ADDR` sets one
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1025";

/// Region used when neither the config file nor the environment sets one
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Domain announced in the greeting and EHLO reply
    #[serde(default = "default_domain")]
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Offer and accept AUTH on plaintext connections
    #[serde(default = "default_true")]
    pub allow_insecure_auth: bool,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProvider {
    /// AWS SES `SendRawEmail`
    Ses,
    /// Dry run: log and hand back a generated delivery id
    Mock,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_provider")]
    pub provider: RelayProvider,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides `https://email.{region}.amazonaws.com/`
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_line_length() -> usize {
    1000
}

fn default_provider() -> RelayProvider {
    RelayProvider::Ses
}

fn default_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| DEFAULT_REGION.to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            allow_insecure_auth: true,
            max_line_length: default_max_line_length(),
        }
    }
}

impl SmtpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            region: default_region(),
            endpoint: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            smtp: SmtpConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayRsError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RelayRsError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply process environment overrides (`ADDR`, `AWS_REGION`)
    pub fn apply_env(self) -> Self {
        self.apply_overrides(std::env::var("ADDR").ok(), std::env::var("AWS_REGION").ok())
    }

    fn apply_overrides(mut self, addr: Option<String>, region: Option<String>) -> Self {
        if let Some(addr) = addr.filter(|a| !a.is_empty()) {
            self.smtp.listen_addr = addr;
        }
        if let Some(region) = region.filter(|r| !r.is_empty()) {
            self.relay.region = region;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        // Host names are allowed, the way TcpListener::bind resolves them
        let resolved = self
            .smtp
            .listen_addr
            .to_socket_addrs()
            .map_err(|e| {
                RelayRsError::Config(format!(
                    "Invalid listen address '{}': {}",
                    self.smtp.listen_addr, e
                ))
            })?
            .next();
        if resolved.is_none() {
            return Err(RelayRsError::Config(format!(
                "Listen address '{}' resolves to nothing",
                self.smtp.listen_addr
            )));
        }

        if self.relay.region.is_empty() {
            return Err(RelayRsError::Config("Relay region is empty".to_string()));
        }

        if let Some(ref endpoint) = self.relay.endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                RelayRsError::Config(format!("Invalid relay endpoint '{}': {}", endpoint, e))
            })?;
        }

        if self.smtp.max_line_length < 512 {
            return Err(RelayRsError::Config(
                "max_line_length must be at least 512".to_string(),
            ));
        }

        Ok(())
    }
}
