//! Database insert payloads and view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business logic should live in higher layers.

use chrono::{DateTime, Utc};

/// Insert payload for a store. Store management lives outside the sync core;
/// this exists for operator tooling and tests.
#[derive(Debug, Clone)]
pub struct NewStore {
    pub name: String,
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub user_id: Option<i64>,
    pub active: bool,
    pub check_interval_minutes: Option<i64>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// An order row read back from the mirror.
#[derive(Debug, Clone)]
pub struct StoredOrder {
    pub id: i64,
    pub external_order_id: i64,
    pub store_id: i64,
    pub status: String,
    pub currency: String,
    pub total: f64,
    pub customer_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub items: Vec<StoredLineItem>,
}

#[derive(Debug, Clone)]
pub struct StoredLineItem {
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    pub image_url: Option<String>,
    pub variants: Vec<String>,
}
