//! Runtime settings: the `settings` table layered over the YAML defaults.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::Store;
use crate::notify::ChannelDefaults;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const CHECK_INTERVAL_MINUTES: &str = "CHECK_INTERVAL_MINUTES";
pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
pub const TELEGRAM_SEND_DELAY_SECONDS: &str = "TELEGRAM_SEND_DELAY_SECONDS";
pub const DEFAULT_TELEGRAM_TEMPLATE_NEW_ORDER: &str = "DEFAULT_TELEGRAM_TEMPLATE_NEW_ORDER";
pub const DEFAULT_TELEGRAM_TEMPLATE_SYSTEM_TEST: &str = "DEFAULT_TELEGRAM_TEMPLATE_SYSTEM_TEST";
pub const DEFAULT_TELEGRAM_TEMPLATE_USER_TEST: &str = "DEFAULT_TELEGRAM_TEMPLATE_USER_TEST";
pub const FETCH_PRODUCT_IMAGES: &str = "FETCH_PRODUCT_IMAGES";

#[derive(Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub check_interval_minutes: u64,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub send_delay_seconds: u64,
    pub bot_username: String,
    pub template_new_order: String,
    pub template_system_test: String,
    pub template_user_test: String,
    pub fetch_product_images: bool,
}

impl fmt::Debug for EffectiveSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveSettings")
            .field("check_interval_minutes", &self.check_interval_minutes)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("send_delay_seconds", &self.send_delay_seconds)
            .field("fetch_product_images", &self.fetch_product_images)
            .finish_non_exhaustive()
    }
}

impl EffectiveSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            check_interval_minutes: cfg.app.default_check_interval_minutes,
            bot_token: non_blank(&cfg.telegram.bot_token),
            chat_id: non_blank(&cfg.telegram.chat_id),
            send_delay_seconds: cfg.telegram.send_delay_seconds,
            bot_username: cfg.telegram.bot_username.clone(),
            template_new_order: cfg.telegram.templates.new_order.clone(),
            template_system_test: cfg.telegram.templates.system_test.clone(),
            template_user_test: cfg.telegram.templates.user_test.clone(),
            fetch_product_images: cfg.remote.fetch_product_images,
        }
    }

    /// Non-empty stored values win; values that do not parse keep the YAML default.
    pub fn merge(cfg: &Config, stored: &HashMap<String, String>) -> Self {
        let mut eff = Self::from_config(cfg);
        let get = |key: &str| stored.get(key).and_then(|v| non_blank(v));

        if let Some(v) = get(CHECK_INTERVAL_MINUTES) {
            match v.parse::<u64>() {
                Ok(n) if n > 0 => eff.check_interval_minutes = n,
                _ => warn!(key = CHECK_INTERVAL_MINUTES, value = %v, "ignoring invalid setting"),
            }
        }
        if let Some(v) = get(TELEGRAM_SEND_DELAY_SECONDS) {
            match v.parse::<u64>() {
                Ok(n) => eff.send_delay_seconds = n,
                Err(_) => warn!(
                    key = TELEGRAM_SEND_DELAY_SECONDS,
                    value = %v,
                    "ignoring invalid setting"
                ),
            }
        }
        if let Some(v) = get(FETCH_PRODUCT_IMAGES) {
            match parse_flag(&v) {
                Some(flag) => eff.fetch_product_images = flag,
                None => warn!(key = FETCH_PRODUCT_IMAGES, value = %v, "ignoring invalid setting"),
            }
        }
        if let Some(v) = get(TELEGRAM_BOT_TOKEN) {
            eff.bot_token = Some(v);
        }
        if let Some(v) = get(TELEGRAM_CHAT_ID) {
            eff.chat_id = Some(v);
        }
        if let Some(v) = get(DEFAULT_TELEGRAM_TEMPLATE_NEW_ORDER) {
            eff.template_new_order = v;
        }
        if let Some(v) = get(DEFAULT_TELEGRAM_TEMPLATE_SYSTEM_TEST) {
            eff.template_system_test = v;
        }
        if let Some(v) = get(DEFAULT_TELEGRAM_TEMPLATE_USER_TEST) {
            eff.template_user_test = v;
        }
        eff
    }

    #[instrument(skip_all)]
    pub async fn load(pool: &Pool, cfg: &Config) -> Result<Self> {
        let stored = db::all_settings(pool).await?;
        Ok(Self::merge(cfg, &stored))
    }

    /// Poll interval of one store: its own value, else the global one.
    pub fn interval_for(&self, store: &Store) -> Duration {
        let minutes = store
            .check_interval_minutes
            .filter(|m| *m > 0)
            .map(|m| m as u64)
            .unwrap_or(self.check_interval_minutes);
        Duration::from_secs(minutes * 60)
    }

    pub fn channel_defaults(&self) -> ChannelDefaults {
        ChannelDefaults {
            bot_token: self.bot_token.clone(),
            chat_id: self.chat_id.clone(),
            delay_secs: self.send_delay_seconds,
            bot_username: self.bot_username.clone(),
            template_new_order: Some(self.template_new_order.clone()),
            template_system_test: Some(self.template_system_test.clone()),
            template_user_test: Some(self.template_user_test.clone()),
        }
    }
}

/// Write the YAML defaults for every key the table does not have yet.
/// Returns how many keys were inserted.
#[instrument(skip_all)]
pub async fn seed_defaults(pool: &Pool, cfg: &Config) -> Result<usize> {
    let defaults = [
        (CHECK_INTERVAL_MINUTES, cfg.app.default_check_interval_minutes.to_string()),
        (TELEGRAM_BOT_TOKEN, cfg.telegram.bot_token.clone()),
        (TELEGRAM_CHAT_ID, cfg.telegram.chat_id.clone()),
        (TELEGRAM_SEND_DELAY_SECONDS, cfg.telegram.send_delay_seconds.to_string()),
        (DEFAULT_TELEGRAM_TEMPLATE_NEW_ORDER, cfg.telegram.templates.new_order.clone()),
        (DEFAULT_TELEGRAM_TEMPLATE_SYSTEM_TEST, cfg.telegram.templates.system_test.clone()),
        (DEFAULT_TELEGRAM_TEMPLATE_USER_TEST, cfg.telegram.templates.user_test.clone()),
        (FETCH_PRODUCT_IMAGES, cfg.remote.fetch_product_images.to_string()),
    ];
    let mut inserted = 0;
    for (key, value) in defaults {
        if db::insert_setting_if_missing(pool, key, &value).await? {
            inserted += 1;
        }
    }
    if inserted > 0 {
        info!(inserted, "seeded default settings");
    }
    Ok(inserted)
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_blank(v: &str) -> Option<String> {
    let t = v.trim();
    (!t.is_empty()).then(|| t.to_string())
}
