use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub runtime: RuntimeConfig,
    pub ai: AiConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub api_port: u16,
    pub ws_port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub session_root_path: PathBuf,
    pub media_root_path: PathBuf,
    /// Optional Redis backplane for the rate limiter across processes.
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Base64 32-byte key for credential blobs at rest. Required in production.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_key: String,
    #[serde(default)]
    pub production: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub default_reconnect_cap: u32,
    pub default_execution_timeout_ms: u64,
    pub max_concurrent_executions_per_agent: usize,
    pub inbound_queue_size: usize,
    pub outbound_queue_size: usize,
    pub shutdown_grace_ms: u64,
    /// Messages per active chat included in a subscriber snapshot.
    pub snapshot_message_count: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AiConfig {
    pub probe_interval_secs: u64,
    pub unhealthy_threshold: u32,
    pub recovery_secs: u64,
    pub classification_cache_ttl_secs: u64,
    /// Provider backends, walked in failover order per tier.
    #[serde(default)]
    pub providers: Vec<crate::ai::types::ProviderProfile>,
    #[serde(default)]
    pub failover: crate::ai::types::FailoverHierarchy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    pub ttl_secs: u64,
    pub max_bytes_per_agent: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let hub_dir = home_dir.join(".swarmhub");

        Self {
            server: ServerConfig {
                api_port: 8600,
                ws_port: 8601,
                cors_origins: Vec::new(),
                jwt_secret: String::new(),
            },
            storage: StorageConfig {
                database_path: hub_dir.join("swarmhub.db"),
                session_root_path: hub_dir.join("sessions"),
                media_root_path: hub_dir.join("media"),
                redis_url: None,
            },
            security: SecurityConfig {
                encryption_key: String::new(),
                production: false,
            },
            runtime: RuntimeConfig {
                default_reconnect_cap: 10,
                default_execution_timeout_ms: 300_000,
                max_concurrent_executions_per_agent: 10,
                inbound_queue_size: 256,
                outbound_queue_size: 256,
                shutdown_grace_ms: 5_000,
                snapshot_message_count: 20,
            },
            ai: AiConfig {
                probe_interval_secs: 60,
                unhealthy_threshold: 3,
                recovery_secs: 60,
                classification_cache_ttl_secs: 86_400,
                providers: Vec::new(),
                failover: Default::default(),
            },
            media: MediaConfig {
                ttl_secs: 3_600,
                max_bytes_per_agent: 64 * 1024 * 1024,
            },
            logging: LoggingConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_file = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("Loading configuration from: {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn config_dir() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".swarmhub")
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let mut content = String::new();
        content.push_str("# Swarmhub Configuration\n");
        content.push_str("# \n");
        content.push_str("# Sensitive values (encryption key, JWT secret) should be set in\n");
        content.push_str("# environment variables instead of this file:\n");
        content.push_str("# \n");
        content.push_str("#   SWARMHUB_ENCRYPTION_KEY=\"base64 32-byte key\"\n");
        content.push_str("#   SWARMHUB_JWT_SECRET=\"secret\"\n");
        content.push_str("#   SWARMHUB_REDIS_URL=\"redis://127.0.0.1/\"\n");
        content.push_str("\n");

        let config_content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        content.push_str(&config_content);

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn load_from_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("SWARMHUB_API_PORT") {
            self.server.api_port = port
                .parse()
                .with_context(|| format!("Invalid SWARMHUB_API_PORT: {}", port))?;
        }
        if let Ok(port) = std::env::var("SWARMHUB_WS_PORT") {
            self.server.ws_port = port
                .parse()
                .with_context(|| format!("Invalid SWARMHUB_WS_PORT: {}", port))?;
        }
        if let Ok(origins) = std::env::var("SWARMHUB_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(secret) = std::env::var("SWARMHUB_JWT_SECRET") {
            self.server.jwt_secret = secret;
        }
        if let Ok(path) = std::env::var("SWARMHUB_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SWARMHUB_SESSION_ROOT") {
            self.storage.session_root_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SWARMHUB_MEDIA_ROOT") {
            self.storage.media_root_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("SWARMHUB_REDIS_URL") {
            if !url.is_empty() {
                self.storage.redis_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("SWARMHUB_ENCRYPTION_KEY") {
            self.security.encryption_key = key;
        }
        if let Ok(env) = std::env::var("SWARMHUB_ENV") {
            self.security.production = env.eq_ignore_ascii_case("production");
        }
        if let Ok(cap) = std::env::var("SWARMHUB_RECONNECT_CAP") {
            self.runtime.default_reconnect_cap = cap
                .parse()
                .with_context(|| format!("Invalid SWARMHUB_RECONNECT_CAP: {}", cap))?;
        }
        if let Ok(timeout) = std::env::var("SWARMHUB_EXECUTION_TIMEOUT_MS") {
            self.runtime.default_execution_timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid SWARMHUB_EXECUTION_TIMEOUT_MS: {}", timeout))?;
        }
        if let Ok(level) = std::env::var("SWARMHUB_LOG_LEVEL") {
            self.logging.log_level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.api_port == self.server.ws_port {
            bail!("api_port and ws_port must differ");
        }
        if self.security.production && self.security.encryption_key.is_empty() {
            bail!("encryption_key is required in production");
        }
        if self.runtime.default_reconnect_cap == 0 {
            bail!("default_reconnect_cap must be at least 1");
        }
        if self.runtime.inbound_queue_size == 0 || self.runtime.outbound_queue_size == 0 {
            bail!("queue sizes must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.default_reconnect_cap, 10);
        assert_eq!(config.runtime.default_execution_timeout_ms, 300_000);
    }

    #[test]
    fn production_requires_encryption_key() {
        let mut config = Config::default();
        config.security.production = true;
        assert!(config.validate().is_err());

        config.security.encryption_key = "AAAA".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.api_port, config.server.api_port);
        assert_eq!(parsed.media.ttl_secs, config.media.ttl_secs);
    }
}
