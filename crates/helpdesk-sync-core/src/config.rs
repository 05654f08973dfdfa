//! Configuration management for the helpdesk sync worker

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Ticket store / department registry database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Credential decryption
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// IMAP timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Control surface
    #[serde(default)]
    pub control: ControlConfig,

    /// Ticket notifications
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Console log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Also write a daily-rolling log file under `<data_dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_to_file: false,
            data_dir: default_data_dir(),
        }
    }
}

/// Console log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Direct database URL (optional if url_env is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Environment variable containing the database URL
    #[serde(default = "default_database_url_env")]
    pub url_env: String,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Create tables, constraints and the ticket number sequence if missing
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_env: default_database_url_env(),
            max_connections: default_max_connections(),
            ensure_schema: true,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the database URL from the config or the environment
    pub fn resolve_url(&self) -> Result<String> {
        self.url
            .clone()
            .or_else(|| std::env::var(&self.url_env).ok())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "database.url or the {} environment variable is required",
                    self.url_env
                ))
            })
    }
}

/// Credential decryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Environment variable holding the mailbox password encryption key
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

/// What to do with a mailbox message once it produced a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterTicketAction {
    /// Leave the message untouched
    Keep,
    /// Set the \Seen flag
    #[default]
    MarkSeen,
    /// Move the message to `processed_folder`
    Move,
}

/// Sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Period of the shared scheduler timer (seconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Department interval used when the department leaves it unset (seconds)
    #[serde(default = "default_poll_interval")]
    pub default_interval_secs: u64,

    /// Lower bound for any department interval (seconds)
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Folder the ticket pipeline reads
    #[serde(default = "default_inbox_folder")]
    pub inbox_folder: String,

    /// Most recent UIDs considered on a department's first pass
    #[serde(default = "default_initial_backfill")]
    pub initial_backfill: usize,

    /// Oldest-first cap on UIDs worked by one steady-state pass; already claimed UIDs do not count
    #[serde(default = "default_max_messages_per_pass")]
    pub max_messages_per_pass: usize,

    /// Extra connect attempts after the first failure
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// First backoff delay between connect attempts (milliseconds)
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Worker-wide IMAP command budget (commands per second)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,

    /// Budget per IMAP server host, shared by departments on that host; zero disables it
    #[serde(default = "default_host_rate_limit")]
    pub host_rate_limit_per_second: u32,

    /// Mailbox action after a ticket is created
    #[serde(default)]
    pub after_ticket: AfterTicketAction,

    /// Destination folder for `after_ticket = "move"`
    #[serde(default = "default_processed_folder")]
    pub processed_folder: String,

    /// Append replies to existing tickets instead of opening new ones
    #[serde(default = "default_true")]
    pub thread_replies: bool,

    /// Do not open tickets for auto-replies
    #[serde(default = "default_true")]
    pub skip_auto_replies: bool,

    /// Description length limit (characters)
    #[serde(default = "default_max_description_chars")]
    pub max_description_chars: usize,

    /// Consecutive registry failures tolerated before the worker gives up
    #[serde(default = "default_max_registry_failures")]
    pub max_registry_failures: u32,

    /// Failed passes over one UID before it is recorded as skipped
    #[serde(default = "default_max_message_attempts")]
    pub max_message_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            default_interval_secs: default_poll_interval(),
            min_interval_secs: default_min_interval(),
            inbox_folder: default_inbox_folder(),
            initial_backfill: default_initial_backfill(),
            max_messages_per_pass: default_max_messages_per_pass(),
            connect_retries: default_connect_retries(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            rate_limit_per_second: default_rate_limit(),
            host_rate_limit_per_second: default_host_rate_limit(),
            after_ticket: AfterTicketAction::default(),
            processed_folder: default_processed_folder(),
            thread_replies: true,
            skip_auto_replies: true,
            max_description_chars: default_max_description_chars(),
            max_registry_failures: default_max_registry_failures(),
            max_message_attempts: default_max_message_attempts(),
        }
    }
}

/// IMAP timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP + TLS connect
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Server greeting and login
    #[serde(default = "default_greeting_timeout")]
    pub greeting_secs: u64,

    /// Any single command on an established session
    #[serde(default = "default_socket_timeout")]
    pub socket_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            greeting_secs: default_greeting_timeout(),
            socket_secs: default_socket_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn greeting(&self) -> Duration {
        Duration::from_secs(self.greeting_secs)
    }

    pub fn socket(&self) -> Duration {
        Duration::from_secs(self.socket_secs)
    }
}

/// Control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Serve the control protocol
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_control_bind")]
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_control_bind(),
        }
    }
}

/// Ticket notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// POST a JSON payload here for every new ticket or reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Webhook request timeout (milliseconds)
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    get_data_dir()
}

fn default_true() -> bool {
    true
}

fn default_database_url_env() -> String {
    "DATABASE_URL".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_encryption_key_env() -> String {
    "HELPDESK_SYNC_ENCRYPTION_KEY".to_string()
}

fn default_tick_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    300
}

fn default_min_interval() -> u64 {
    30
}

fn default_inbox_folder() -> String {
    "INBOX".to_string()
}

fn default_initial_backfill() -> usize {
    10
}

fn default_max_messages_per_pass() -> usize {
    50
}

fn default_connect_retries() -> u32 {
    2
}

fn default_retry_initial_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    30000
}

fn default_rate_limit() -> u32 {
    10
}

fn default_processed_folder() -> String {
    "Processed".to_string()
}

fn default_max_description_chars() -> usize {
    5000
}

fn default_max_registry_failures() -> u32 {
    3
}

fn default_host_rate_limit() -> u32 {
    5
}

fn default_max_message_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_greeting_timeout() -> u64 {
    15
}

fn default_socket_timeout() -> u64 {
    45
}

fn default_control_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_webhook_timeout() -> u64 {
    5000
}

/// Get the data directory (XDG: ~/.local/share/helpdesk-sync)
fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join(crate::APP_NAME)
}

/// Get the config directory (XDG: ~/.config/helpdesk-sync)
fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(crate::APP_NAME)
}

impl Config {
    /// Default config file path
    pub fn default_path() -> PathBuf {
        get_config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            info!("Loaded configuration from {:?}", path);
            config
        } else {
            info!("No config file found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| Error::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.sync.tick_interval_secs == 0 {
            return Err(invalid("sync.tick_interval_secs", "must be greater than zero"));
        }
        if self.timeouts.connect_secs == 0
            || self.timeouts.greeting_secs == 0
            || self.timeouts.socket_secs == 0
        {
            return Err(invalid("timeouts", "every IMAP timeout must be greater than zero"));
        }
        if self.sync.max_message_attempts == 0 {
            return Err(invalid("sync.max_message_attempts", "must be greater than zero"));
        }
        if self.sync.inbox_folder.trim().is_empty() {
            return Err(invalid("sync.inbox_folder", "must not be empty"));
        }
        if self.sync.after_ticket == AfterTicketAction::Move
            && self.sync.processed_folder.trim().is_empty()
        {
            return Err(invalid(
                "sync.processed_folder",
                "required when after_ticket = \"move\"",
            ));
        }
        Ok(())
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.general.data_dir.join("logs")
    }

    /// Shared timer period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.sync.tick_interval_secs)
    }
}
