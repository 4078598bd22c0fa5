//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/emissor/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/emissor/` (~/.config/emissor/)
//! - Data: `$XDG_DATA_HOME/emissor/` (~/.local/share/emissor/)
//! - State/Logs: `$XDG_STATE_HOME/emissor/` (~/.local/state/emissor/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Database location override
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Delivery client settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Queue processing settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Receiver registry settings
    #[serde(default)]
    pub receivers: ReceiversConfig,

    /// Credential vault settings
    #[serde(default)]
    pub vault: VaultConfig,

    /// Report store settings
    #[serde(default)]
    pub reports: ReportsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Machine translation of post fields (optional)
    #[serde(default)]
    pub translation: Option<TranslationConfig>,
}

/// Database configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct DatabaseConfig {
    /// Explicit database path; defaults to the XDG data directory
    pub path: Option<PathBuf>,
}

/// Delivery client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Per-attempt timeout for send/update-status/delete, in seconds
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Timeout for the check-token call, in seconds
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Total attempts for `send` (other operations always make one)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// User-Agent header sent on write operations
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout(),
            test_timeout_secs: default_test_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl DeliveryConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.test_timeout_secs == 0 {
            return Err(Error::Config(
                "delivery timeouts must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Longest one delivery to one receiver can take: every attempt timing
    /// out plus the backoff waits between them.
    pub fn worst_case_delivery(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let timeouts = self.timeout().saturating_mul(attempts);
        // base * (2^0 + ... + 2^(n-2)) = base * (2^(n-1) - 1)
        let doublings = 1u32
            .checked_shl(attempts - 1)
            .map_or(u32::MAX, |n| n - 1);
        timeouts.saturating_add(self.backoff_base().saturating_mul(doublings))
    }
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_test_timeout() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!("Emissor/{}", env!("CARGO_PKG_VERSION"))
}

/// Queue processing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Jobs claimed per processing cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between processing cycles in `run` mode
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Days a completed job is kept before cleanup removes it
    #[serde(default = "default_queue_retention")]
    pub retention_days: u32,

    /// Seconds after which an in-flight claim is considered abandoned
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,

    /// Seconds between retention sweeps in `run` mode
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_secs: default_interval(),
            retention_days: default_queue_retention(),
            claim_timeout_secs: default_claim_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl QueueConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > 100 {
            return Err(Error::Config(
                "queue.batch_size must be between 1 and 100".to_string(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(Error::Config(
                "queue.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.claim_timeout_secs == 0 {
            return Err(Error::Config(
                "queue.claim_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// A claim is refreshed before each delivery, so it must outlive the
    /// slowest single delivery or a live claim would be released.
    pub fn validate_claim_timeout(&self, delivery: &DeliveryConfig) -> Result<()> {
        let floor = delivery.worst_case_delivery();
        if self.claim_timeout() <= floor {
            return Err(Error::Config(format!(
                "queue.claim_timeout_secs ({}) must exceed the slowest delivery ({}s: \
                 {} attempts of {}s plus backoff)",
                self.claim_timeout_secs,
                floor.as_secs_f64().ceil(),
                delivery.max_attempts,
                delivery.timeout_secs,
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_interval() -> u64 {
    60
}

fn default_queue_retention() -> u32 {
    7
}

fn default_claim_timeout() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Receiver registry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReceiversConfig {
    /// Lifetime of the decrypted receiver list cache, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Accept plain `http://` receiver URLs
    #[serde(default = "default_allow_http")]
    pub allow_http: bool,
}

impl Default for ReceiversConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            allow_http: default_allow_http(),
        }
    }
}

impl ReceiversConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_cache_ttl() -> u64 {
    15 * 60
}

fn default_allow_http() -> bool {
    true
}

/// Credential vault configuration
///
/// `encrypt_tokens = false` selects the pass-through mode: tokens are stored
/// unmodified. It exists for installations that cannot keep a stable
/// installation secret and is reported loudly at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default = "default_encrypt_tokens")]
    pub encrypt_tokens: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            encrypt_tokens: default_encrypt_tokens(),
        }
    }
}

fn default_encrypt_tokens() -> bool {
    true
}

/// Report store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    /// How long a "just happened" notification stays readable
    #[serde(default = "default_notification_ttl")]
    pub notification_ttl_hours: u32,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            notification_ttl_hours: default_notification_ttl(),
        }
    }
}

fn default_notification_ttl() -> u32 {
    12
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Days persisted activity log entries are kept
    #[serde(default = "default_log_retention")]
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            retention_days: default_log_retention(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

fn default_log_retention() -> u32 {
    30
}

/// Translation provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TranslationConfig {
    /// Provider type
    pub provider: TranslationProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_translation_timeout")]
    pub timeout_secs: u64,
    /// Attempts per field before giving up and keeping the original text
    #[serde(default = "default_translation_attempts")]
    pub max_attempts: u32,
    /// Locale of the origin site (e.g. `pt_BR`)
    pub source_language: String,
    /// Locale receivers expect (e.g. `en_US`)
    pub target_language: String,
}

fn default_translation_timeout() -> u64 {
    20
}

fn default_translation_attempts() -> u32 {
    3
}

/// Supported translation providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranslationProvider {
    Ollama,
    Claude,
    OpenAI,
}

impl TranslationProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            TranslationProvider::Ollama => "http://localhost:11434",
            TranslationProvider::Claude => "https://api.anthropic.com",
            TranslationProvider::OpenAI => "https://api.openai.com",
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections that carry constraints
    pub fn validate(&self) -> Result<()> {
        self.delivery.validate()?;
        self.queue.validate()?;
        self.queue.validate_claim_timeout(&self.delivery)?;
        Ok(())
    }

    /// Database file to open, honouring `[database] path`
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/emissor/config.toml` (~/.config/emissor/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("emissor").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/emissor/` (~/.local/share/emissor/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("emissor")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/emissor/` (~/.local/state/emissor/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("emissor")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/emissor/data.db` (~/.local/share/emissor/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/emissor/emissor.log` (~/.local/state/emissor/emissor.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("emissor.log")
    }
}
