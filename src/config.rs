use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{info, error};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,
    pub cloud_pod: Option<String>,

    /// JWT secret key
    pub cloud_auth_jwt_secret: Option<String>,

    /// Accept `?user=` identities without a token. Only honoured in
    /// development and only while no JWT secret is set.
    #[serde(default)]
    pub dev_auth_bypass: bool,

    /// Database URL; in-memory storage is used when absent
    pub db_url: Option<String>,

    /// Mirror presence into durable storage
    #[serde(default = "default_presence_mirror")]
    pub presence_mirror: bool,

    /// Seconds an empty workspace stays loaded before eviction
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,

    /// Data messages kept for bookmark replay
    #[serde(default = "default_data_log_retention")]
    pub data_log_retention: usize,

    /// Frames queued per connection before deliveries are dropped
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// How long a verified token stays cached
    #[serde(default = "default_identity_cache_ttl_secs")]
    pub identity_cache_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Whether unauthenticated development identities are accepted
    pub fn allows_dev_identities(&self) -> bool {
        self.dev_auth_bypass && self.is_development() && self.cloud_auth_jwt_secret.is_none()
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_pod: None,
            cloud_auth_jwt_secret: None,
            dev_auth_bypass: false,
            db_url: None,
            presence_mirror: default_presence_mirror(),
            idle_grace_secs: default_idle_grace_secs(),
            data_log_retention: default_data_log_retention(),
            outbox_capacity: default_outbox_capacity(),
            command_queue_capacity: default_command_queue_capacity(),
            identity_cache_ttl_secs: default_identity_cache_ttl_secs(),
        }
    }
}

/// Install the process-wide configuration. Later calls are ignored.
pub fn init_config(config: Config) -> &'static Config {
    CONFIG.get_or_init(|| config)
}

/// The process-wide configuration, or defaults when none was installed.
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-workspace".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_presence_mirror() -> bool {
    true
}

fn default_idle_grace_secs() -> u64 {
    60
}

fn default_data_log_retention() -> usize {
    256
}

fn default_outbox_capacity() -> usize {
    64
}

fn default_command_queue_capacity() -> usize {
    256
}

fn default_identity_cache_ttl_secs() -> u64 {
    5 * 60
}
