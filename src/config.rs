//! Configuration loader and validator for the order watch bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    pub telegram: Telegram,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the daemon re-reads the store registry and the job ledger.
    pub registry_refresh_seconds: u64,
    /// Size of the worker pool running full-history jobs.
    pub history_workers: usize,
    /// Poll interval used when neither the store nor the settings table set one.
    pub default_check_interval_minutes: u64,
}

/// Remote order API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub timeout_seconds: u64,
    pub page_size: u32,
    pub history_page_size: u32,
    /// First incremental run looks this many days back.
    pub initial_lookback_days: i64,
    /// Look up product images for line items that arrive without one.
    #[serde(default)]
    pub fetch_product_images: bool,
}

/// System Telegram channel and default message templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    pub send_delay_seconds: u64,
    pub bot_username: String,
    pub templates: Templates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Templates {
    pub new_order: String,
    pub system_test: String,
    pub user_test: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Default database URL inside the data directory.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/watchbot.db", self.app.resolved_data_dir())
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.registry_refresh_seconds == 0 {
        return Err(ConfigError::Invalid("app.registry_refresh_seconds must be > 0"));
    }
    if cfg.app.history_workers == 0 {
        return Err(ConfigError::Invalid("app.history_workers must be > 0"));
    }
    if cfg.app.default_check_interval_minutes == 0 {
        return Err(ConfigError::Invalid("app.default_check_interval_minutes must be > 0"));
    }

    if cfg.remote.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("remote.timeout_seconds must be > 0"));
    }
    // The order API caps per_page at 100.
    if !(1..=100).contains(&cfg.remote.page_size) {
        return Err(ConfigError::Invalid("remote.page_size must be within 1..=100"));
    }
    if !(1..=100).contains(&cfg.remote.history_page_size) {
        return Err(ConfigError::Invalid("remote.history_page_size must be within 1..=100"));
    }
    if cfg.remote.initial_lookback_days < 0 {
        return Err(ConfigError::Invalid("remote.initial_lookback_days must be >= 0"));
    }

    // An empty system token/chat simply disables the system channel.
    if cfg.telegram.bot_username.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_username must be non-empty"));
    }
    let t = &cfg.telegram.templates;
    if t.new_order.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.templates.new_order must be non-empty"));
    }
    if t.system_test.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.templates.system_test must be non-empty"));
    }
    if t.user_test.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.templates.user_test must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  registry_refresh_seconds: 30
  history_workers: 5
  default_check_interval_minutes: 5

remote:
  timeout_seconds: 20
  page_size: 100
  history_page_size: 100
  initial_lookback_days: 7
  fetch_product_images: false

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  chat_id: "-1001234567890"
  send_delay_seconds: 2
  bot_username: "OrderWatchBot"
  templates:
    new_order: |
      🛍️ Store *{{ store_name }}* has a new order\!
      Order: `{{ order_id }}`
      Customer: `{{ customer_name }}`
      Total: *{{ total_amount }} {{ currency }}*
      Status: `{{ status }}`
      Items:
      {{ product_list }}
    system_test: |
      🎉 Test message from @{{ bot_username }}\. The *system* channel works\!
    user_test: |
      🎉 Test message for {{ username }}\. Your Telegram settings work\!
"#
}
