//! Notification fan-out over Telegram.
//!
//! A dispatch resolves the recipients of one event into a deduplicated list
//! of [`NotificationTarget`]s, renders each target's template over the
//! escaped payload and delivers the messages one after another, sleeping the
//! target's delay between sends. Delivery failures are logged and counted,
//! never returned.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{EventKind, LineItem, Order, UserProfile};
use crate::settings::EffectiveSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode, Recipient};
use teloxide::utils::markdown;
use tracing::{debug, info, instrument, warn};

/// System-wide channel and default templates.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ChannelDefaults {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub delay_secs: u64,
    pub bot_username: String,
    pub template_new_order: Option<String>,
    pub template_system_test: Option<String>,
    pub template_user_test: Option<String>,
}

impl fmt::Debug for ChannelDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDefaults")
            .field("chat_id", &self.chat_id)
            .field("delay_secs", &self.delay_secs)
            .finish_non_exhaustive()
    }
}

impl ChannelDefaults {
    pub fn template(&self, event: EventKind) -> Option<&str> {
        match event {
            EventKind::NewOrder => self.template_new_order.as_deref(),
            EventKind::UserTest => self.template_user_test.as_deref(),
            EventKind::SystemTest => self.template_system_test.as_deref(),
        }
    }
}

/// One physical message destination. Equality covers every field, so two
/// candidates that would produce the same message on the same chat collapse.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NotificationTarget {
    pub bot_token: String,
    pub chat_id: String,
    pub delay_secs: u64,
    pub template: String,
}

impl fmt::Debug for NotificationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationTarget")
            .field("chat_id", &self.chat_id)
            .field("delay_secs", &self.delay_secs)
            .finish_non_exhaustive()
    }
}

/// Personal template override gated by the customization entitlement.
#[derive(Debug, Clone, Copy)]
pub struct TemplateChoice<'a> {
    pub personal: Option<&'a str>,
    pub system: Option<&'a str>,
    pub entitled: bool,
}

impl<'a> TemplateChoice<'a> {
    pub fn effective(&self) -> Option<&'a str> {
        let personal = self
            .personal
            .filter(|t| self.entitled && !t.trim().is_empty());
        personal
            .or(self.system)
            .filter(|t| !t.trim().is_empty())
    }
}

/// Target for a user's personal channel, or `None` when the user cannot be
/// messaged for this event.
pub fn resolve_user_target(
    user: &UserProfile,
    event: EventKind,
    defaults: &ChannelDefaults,
) -> Option<NotificationTarget> {
    if !user.telegram_enabled {
        return None;
    }
    let chat_id = user.telegram_chat_id.clone()?;
    let bot_token = user
        .telegram_bot_token
        .clone()
        .or_else(|| defaults.bot_token.clone())?;
    let delay_secs = match user.telegram_send_delay_seconds {
        Some(d) if user.can_customize_telegram_delay && d >= 0 => d as u64,
        _ => defaults.delay_secs,
    };
    let template = TemplateChoice {
        personal: user.personal_template(event),
        system: defaults.template(event),
        entitled: user.can_customize_telegram_templates,
    }
    .effective()?;
    Some(NotificationTarget {
        bot_token,
        chat_id,
        delay_secs,
        template: template.to_string(),
    })
}

pub fn resolve_system_target(
    event: EventKind,
    defaults: &ChannelDefaults,
) -> Option<NotificationTarget> {
    let template = TemplateChoice {
        personal: None,
        system: defaults.template(event),
        entitled: false,
    }
    .effective()?;
    Some(NotificationTarget {
        bot_token: defaults.bot_token.clone()?,
        chat_id: defaults.chat_id.clone()?,
        delay_secs: defaults.delay_secs,
        template: template.to_string(),
    })
}

/// Recipients of one event, in send order, without duplicates.
pub fn plan_targets(
    event: EventKind,
    owner: Option<&UserProfile>,
    manager: Option<&UserProfile>,
    defaults: &ChannelDefaults,
) -> Vec<NotificationTarget> {
    let candidates: Vec<Option<NotificationTarget>> = match event {
        EventKind::NewOrder => vec![
            owner.and_then(|u| resolve_user_target(u, event, defaults)),
            manager
                .filter(|m| m.role.is_manager())
                .and_then(|m| resolve_user_target(m, event, defaults)),
            resolve_system_target(event, defaults),
        ],
        EventKind::UserTest => vec![owner.and_then(|u| resolve_user_target(u, event, defaults))],
        EventKind::SystemTest => vec![resolve_system_target(event, defaults)],
    };

    let mut targets: Vec<NotificationTarget> = Vec::new();
    for target in candidates.into_iter().flatten() {
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Template data. `text` values are escaped for MarkdownV2 at render time;
/// `verbatim` values must already be escaped by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPayload {
    text: BTreeMap<String, String>,
    verbatim: BTreeMap<String, String>,
}

impl NotificationPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.text.insert(key.to_string(), value.into());
        self
    }

    pub fn verbatim(mut self, key: &str, value: impl Into<String>) -> Self {
        self.verbatim.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.text
            .get(key)
            .or_else(|| self.verbatim.get(key))
            .map(String::as_str)
    }

    fn text_if_absent(&mut self, key: &str, value: &str) {
        if !self.text.contains_key(key) && !self.verbatim.contains_key(key) {
            self.text.insert(key.to_string(), value.to_string());
        }
    }

    /// `new_order` data for an order of `store_name`.
    pub fn for_order(store_name: &str, order: &Order, items: &[LineItem]) -> Self {
        Self::new()
            .text("store_name", store_name)
            .text("order_id", order.external_order_id.to_string())
            .text(
                "customer_name",
                order.customer_name.clone().unwrap_or_else(|| "Guest".to_string()),
            )
            .text("total_amount", format_amount(order.total))
            .text("currency", order.currency.clone())
            .text("status", order.status.clone())
            .text(
                "payment_method",
                order.payment_method_title.clone().unwrap_or_else(|| "N/A".to_string()),
            )
            .verbatim("product_list", product_list(items))
    }

    fn context(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.text {
            map.insert(k.clone(), Value::String(markdown::escape(v)));
        }
        for (k, v) in &self.verbatim {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(map)
    }
}

/// One MarkdownV2 line per item: `\- name \(x qty\)`.
pub fn product_list(items: &[LineItem]) -> String {
    if items.is_empty() {
        return "\\- No products".to_string();
    }
    items
        .iter()
        .map(|i| format!("\\- {} \\(x {}\\)", markdown::escape(&i.name), i.quantity))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Two decimals with thousands separators: `1234.5` -> `1,234.50`.
pub fn format_amount(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

pub fn render(template: &str, payload: &NotificationPayload) -> Result<String> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.render_template(template, &payload.context())
        .context("failed to render notification template")
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<()>;
}

/// Sends MarkdownV2 messages through the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramSender {
    http: reqwest::Client,
}

impl fmt::Debug for TelegramSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramSender").finish_non_exhaustive()
    }
}

impl TelegramSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = teloxide::net::default_reqwest_settings()
            .timeout(timeout)
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self { http })
    }
}

fn recipient(chat_id: &str) -> Recipient {
    match chat_id.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(chat_id.trim().to_string()),
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<()> {
        let bot = Bot::with_client(bot_token, self.http.clone());
        bot.send_message(recipient(chat_id), text)
            .parse_mode(ParseMode::MarkdownV2)
            .await
            .with_context(|| format!("telegram send to {} failed", chat_id))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Render and send to every target in order. Never fails.
pub async fn deliver(
    sender: &dyn MessageSender,
    targets: &[NotificationTarget],
    payload: &NotificationPayload,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (idx, target) in targets.iter().enumerate() {
        let text = match render(&target.template, payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(chat_id = %target.chat_id, ?err, "skipping recipient with broken template");
                report.failed += 1;
                continue;
            }
        };
        match sender.send(&target.bot_token, &target.chat_id, &text).await {
            Ok(()) => {
                debug!(chat_id = %target.chat_id, "notification sent");
                report.sent += 1;
            }
            Err(err) => {
                warn!(chat_id = %target.chat_id, ?err, "notification delivery failed");
                report.failed += 1;
            }
        }
        if idx + 1 < targets.len() && target.delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(target.delay_secs)).await;
        }
    }
    report
}

#[async_trait]
pub trait Notify: Send + Sync {
    async fn dispatch(
        &self,
        event: EventKind,
        payload: NotificationPayload,
        user_id: Option<i64>,
    ) -> Result<DispatchReport>;
}

/// Database-backed dispatcher: reads the current settings and user profiles
/// on every dispatch.
pub struct Dispatcher {
    pool: Pool,
    config: Arc<Config>,
    sender: Arc<dyn MessageSender>,
}

impl Dispatcher {
    pub fn new(pool: Pool, config: Arc<Config>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            pool,
            config,
            sender,
        }
    }
}

#[async_trait]
impl Notify for Dispatcher {
    #[instrument(skip_all, fields(event = event.as_str(), user_id = ?user_id))]
    async fn dispatch(
        &self,
        event: EventKind,
        mut payload: NotificationPayload,
        user_id: Option<i64>,
    ) -> Result<DispatchReport> {
        let defaults = EffectiveSettings::load(&self.pool, &self.config)
            .await?
            .channel_defaults();

        let owner = match user_id {
            Some(id) => db::get_user_profile(&self.pool, id).await?,
            None => None,
        };
        let manager = match (event, owner.as_ref().and_then(|o| o.manager_id)) {
            (EventKind::NewOrder, Some(manager_id)) => {
                db::get_user_profile(&self.pool, manager_id).await?
            }
            _ => None,
        };

        let targets = plan_targets(event, owner.as_ref(), manager.as_ref(), &defaults);
        if targets.is_empty() {
            info!("no notification recipients");
            return Ok(DispatchReport::default());
        }

        payload.text_if_absent(
            "username",
            owner.as_ref().map(|o| o.username.as_str()).unwrap_or("system"),
        );
        payload.text_if_absent("bot_username", &defaults.bot_username);

        let report = deliver(self.sender.as_ref(), &targets, &payload).await;
        info!(sent = report.sent, failed = report.failed, "dispatch finished");
        Ok(report)
    }
}
