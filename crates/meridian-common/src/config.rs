//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::models::KeyChangePolicy;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init(file: &str) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(file, true)?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global.
///
/// `with_env` controls whether `MERIDIAN__*` environment variables are layered on top.
pub fn load(file: &str, with_env: bool) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        // Defaults
        .set_default("server.name", "localhost")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8448)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 2)?
        .set_default("auth.jwt_secret", "")?
        .set_default("federation.attempt_timeout_secs", 15)?
        .set_default("federation.max_attempts", 8)?
        .set_default("federation.backoff_base_secs", 30)?
        .set_default("federation.backoff_max_secs", 3600)?
        .set_default("federation.scan_interval_secs", 20)?
        .set_default("federation.scan_batch", 100)?
        .set_default("federation.worker_concurrency", 16)?
        .set_default("federation.key_change_policy", "block")?
        .set_default("federation.discovery_ttl_secs", 86_400)?
        .set_default("bridges.connect_timeout_secs", 10)?
        .set_default("log.format", "pretty")?
        // Optional config file
        .add_source(config::File::with_name(file).required(false));

    if with_env {
        // Environment variables (MERIDIAN__SERVER__NAME, MERIDIAN__DATABASE__URL, etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("MERIDIAN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
    }

    builder.build()?.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub federation: FederationConfig,
    pub bridges: BridgesConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name used for federation (e.g. "chat.example.org").
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Omit for lite / in-process-only mode.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HS256 secret shared with the auth service that issues operator tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    /// Per-call timeout for every outbound delivery attempt.
    pub attempt_timeout_secs: u64,
    /// Automatic retries stop once a receipt reaches this many attempts.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// How often the retry scanner looks for due receipts.
    pub scan_interval_secs: u64,
    /// Maximum receipts picked up per scan.
    pub scan_batch: u32,
    /// Number of concurrent delivery workers.
    pub worker_concurrency: usize,
    pub key_change_policy: KeyChangePolicy,
    /// Hex-encoded 32-byte Ed25519 seed. Lite mode only; otherwise the key is stored.
    pub signing_key_seed: Option<String>,
    pub discovery_ttl_secs: u64,
    /// Server name to base URL, bypassing discovery for these peers.
    #[serde(default)]
    pub peer_overrides: HashMap<String, String>,
}

impl FederationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgesConfig {
    /// Timeout for connector probes and sends.
    pub connect_timeout_secs: u64,
}

impl BridgesConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
}
