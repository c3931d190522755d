//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "forum.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://forum.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// How public activities on federated topics are re-propagated.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingPolicy {
    /// Forward every publicly addressed activity to the topic audience,
    /// even when the audience was not explicitly addressed.
    #[default]
    AllPublic,
    /// Forward only when the audience's followers collection is addressed.
    AddressedOnly,
}

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Accept inbound activities at all
    pub enabled: bool,
    /// Require valid HTTP signatures on inbound POSTs
    pub verify_signatures: bool,
    /// Allow dereferencing loopback/private hosts (tests and local setups)
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// Delay applied to scheduled deliveries so later edits can supersede them
    pub delivery_delay_seconds: u64,
    /// Distinct failure days before a domain is quarantined
    pub failure_days_threshold: u32,
    /// Maximum remote hops walked by the context resolver
    pub max_reply_depth: usize,
    #[serde(default)]
    pub forwarding_policy: ForwardingPolicy,
    /// Timeout for outbound requests in seconds
    pub fetch_timeout_seconds: u64,
    /// Maximum inbound requests per sender per window
    pub rate_limit_max_requests: u32,
    /// Inbound rate limit window in seconds
    pub rate_limit_window_seconds: u64,
}

impl FederationConfig {
    pub fn delivery_delay(&self) -> Option<Duration> {
        (self.delivery_delay_seconds > 0).then(|| Duration::from_secs(self.delivery_delay_seconds))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_signatures: true,
            allow_private_hosts: false,
            delivery_delay_seconds: 30,
            failure_days_threshold: crate::federation::DEFAULT_FAILURE_DAYS_THRESHOLD,
            max_reply_depth: crate::federation::MAX_REPLY_DEPTH,
            forwarding_policy: ForwardingPolicy::AllPublic,
            fetch_timeout_seconds: 30,
            rate_limit_max_requests: 100,
            rate_limit_window_seconds: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (TOPICFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/topicfed.db")?
            .set_default("federation.enabled", defaults.enabled)?
            .set_default("federation.verify_signatures", defaults.verify_signatures)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default(
                "federation.delivery_delay_seconds",
                defaults.delivery_delay_seconds,
            )?
            .set_default(
                "federation.failure_days_threshold",
                defaults.failure_days_threshold,
            )?
            .set_default("federation.max_reply_depth", defaults.max_reply_depth as u64)?
            .set_default("federation.forwarding_policy", "all_public")?
            .set_default(
                "federation.fetch_timeout_seconds",
                defaults.fetch_timeout_seconds,
            )?
            .set_default(
                "federation.rate_limit_max_requests",
                defaults.rate_limit_max_requests,
            )?
            .set_default(
                "federation.rate_limit_window_seconds",
                defaults.rate_limit_window_seconds,
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("TOPICFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.federation.failure_days_threshold == 0 {
            return Err(AppError::Config(
                "federation.failure_days_threshold must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_reply_depth == 0 {
            return Err(AppError::Config(
                "federation.max_reply_depth must be greater than 0".to_string(),
            ));
        }

        if self.federation.rate_limit_max_requests == 0 {
            return Err(AppError::Config(
                "federation.rate_limit_max_requests must be greater than 0".to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain)
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("Dereferencing of private and loopback hosts is enabled");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
