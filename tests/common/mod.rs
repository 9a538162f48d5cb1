#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use order_watchbot::db::{self, NewStore, Pool};
use order_watchbot::ledger::InMemoryCancellation;
use order_watchbot::model::{EventKind, Role, Store, UserProfile};
use order_watchbot::notify::{DispatchReport, MessageSender, NotificationPayload, Notify};
use order_watchbot::remote::{OrderQuery, OrderSource, SourceFactory};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{Mutex, Semaphore};

pub async fn setup_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/it.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub async fn add_store(
    pool: &Pool,
    base_url: &str,
    owner: Option<i64>,
    last_checked: Option<DateTime<Utc>>,
) -> i64 {
    db::insert_store(
        pool,
        &NewStore {
            name: "Corner Shop".into(),
            base_url: base_url.into(),
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            user_id: owner,
            active: true,
            check_interval_minutes: None,
            last_checked,
        },
    )
    .await
    .unwrap()
}

pub fn profile(username: &str, role: Role, chat_id: Option<&str>) -> UserProfile {
    UserProfile {
        id: 0,
        username: username.into(),
        role,
        manager_id: None,
        telegram_enabled: true,
        telegram_bot_token: None,
        telegram_chat_id: chat_id.map(str::to_string),
        telegram_send_delay_seconds: None,
        can_customize_telegram_delay: false,
        can_customize_telegram_templates: false,
        telegram_template_new_order: None,
        telegram_template_user_test: None,
    }
}

pub async fn add_user(pool: &Pool, username: &str, chat_id: Option<&str>) -> i64 {
    db::insert_user(pool, &profile(username, Role::User, chat_id))
        .await
        .unwrap()
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Storefront order JSON with GMT dates in the remote's naive format.
pub fn order_json(id: i64, modified: &str, items: &[(&str, i64)]) -> Value {
    let modified = modified.trim_end_matches('Z');
    json!({
        "id": id,
        "status": "processing",
        "currency": "USD",
        "total": format!("{}.00", id),
        "date_created_gmt": modified,
        "date_modified_gmt": modified,
        "billing": {"first_name": "Ann", "last_name": "Lee"},
        "line_items": items.iter().map(|(name, qty)| json!({
            "name": name,
            "product_id": 10,
            "quantity": qty,
            "price": "5.00",
            "meta_data": [{"key": "size", "value": "M"}]
        })).collect::<Vec<_>>()
    })
}

pub fn history_page(start_id: i64, count: usize) -> Vec<Value> {
    (0..count as i64)
        .map(|i| order_json(start_id + i, "2024-01-01T00:00:00", &[("Mug", 1)]))
        .collect()
}

#[derive(Clone)]
pub enum PageHook {
    /// Flip an in-memory token while the page is in flight.
    Cancel(InMemoryCancellation),
    /// Ask the ledger to cancel the job while the page is in flight.
    RequestCancellation(Pool, String),
    /// Wait for a permit before answering.
    Gate(Arc<Semaphore>),
}

/// Order source answering from a fixed script of pages.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    pages: Arc<Mutex<HashMap<u32, Result<Vec<Value>, String>>>>,
    hooks: Arc<Mutex<HashMap<u32, PageHook>>>,
    pub total: Option<u64>,
    pub total_fails: bool,
    pub queries: Arc<Mutex<Vec<OrderQuery>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn page(&self, page: u32, orders: Vec<Value>) {
        self.pages.lock().await.insert(page, Ok(orders));
    }

    pub async fn failing_page(&self, page: u32, msg: &str) {
        self.pages.lock().await.insert(page, Err(msg.to_string()));
    }

    pub async fn hook(&self, page: u32, hook: PageHook) {
        self.hooks.lock().await.insert(page, hook);
    }

    pub async fn fetched_pages(&self) -> Vec<u32> {
        self.queries.lock().await.iter().map(|q| q.page).collect()
    }
}

#[async_trait]
impl OrderSource for ScriptedSource {
    async fn fetch_page(&self, query: &OrderQuery) -> Result<Vec<Value>> {
        self.queries.lock().await.push(query.clone());
        let hook = self.hooks.lock().await.get(&query.page).cloned();
        match hook {
            Some(PageHook::Cancel(token)) => token.cancel(),
            Some(PageHook::RequestCancellation(pool, job_id)) => {
                db::request_cancellation(&pool, &job_id).await?;
            }
            Some(PageHook::Gate(gate)) => {
                let _permit = gate.acquire().await?;
            }
            None => {}
        }
        match self.pages.lock().await.get(&query.page) {
            Some(Ok(orders)) => Ok(orders.clone()),
            Some(Err(msg)) => Err(anyhow!(msg.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn total_orders(&self) -> Result<Option<u64>> {
        if self.total_fails {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.total)
    }
}

pub struct FixedFactory(pub ScriptedSource);

impl SourceFactory for FixedFactory {
    fn orders(&self, _store: &Store) -> Result<Arc<dyn OrderSource>> {
        Ok(Arc::new(self.0.clone()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub calls: Arc<Mutex<Vec<(EventKind, NotificationPayload, Option<i64>)>>>,
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn dispatch(
        &self,
        event: EventKind,
        payload: NotificationPayload,
        user_id: Option<i64>,
    ) -> Result<DispatchReport> {
        self.calls.lock().await.push((event, payload, user_id));
        Ok(DispatchReport { sent: 1, failed: 0 })
    }
}

/// Notifier that holds every dispatch until a permit is added to `gate`.
#[derive(Clone)]
pub struct GatedNotifier {
    pub gate: Arc<Semaphore>,
    pub entered: Arc<Mutex<usize>>,
    pub calls: Arc<Mutex<Vec<(EventKind, NotificationPayload, Option<i64>)>>>,
}

impl GatedNotifier {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::default(),
            calls: Arc::default(),
        }
    }
}

#[async_trait]
impl Notify for GatedNotifier {
    async fn dispatch(
        &self,
        event: EventKind,
        payload: NotificationPayload,
        user_id: Option<i64>,
    ) -> Result<DispatchReport> {
        *self.entered.lock().await += 1;
        self.gate.acquire().await?.forget();
        self.calls.lock().await.push((event, payload, user_id));
        Ok(DispatchReport { sent: 1, failed: 0 })
    }
}

#[derive(Clone, Default)]
pub struct RecordingSender {
    pub sent: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((bot_token.to_string(), chat_id.to_string(), text.to_string()));
        Ok(())
    }
}
