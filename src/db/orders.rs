use super::model::{StoredLineItem, StoredOrder};
use super::repo::Pool;
use crate::model::{LineItem, NormalizedOrder};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

/// What an upsert did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }

    pub fn row_id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

/// Insert or replace one order and all its line items in a single transaction.
/// Starts with a write so the transaction takes the SQLite write lock up front.
#[instrument(skip_all, fields(store_id = store_id, order_id = normalized.order.external_order_id))]
pub async fn upsert_order(
    pool: &Pool,
    store_id: i64,
    normalized: &NormalizedOrder,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;
    let outcome = match insert_order_tx(&mut tx, store_id, normalized).await? {
        Some(id) => UpsertOutcome::Inserted(id),
        None => {
            let id = update_order_tx(&mut tx, store_id, normalized).await?;
            sqlx::query("DELETE FROM line_items WHERE order_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Updated(id)
        }
    };
    insert_line_items_tx(&mut tx, outcome.row_id(), &normalized.items).await?;
    tx.commit().await?;
    Ok(outcome)
}

/// Insert an order with its items unless the `(external_order_id, store_id)`
/// key is already present. Returns true when a row was inserted.
pub async fn insert_order_if_absent_tx(
    tx: &mut Transaction<'_, Sqlite>,
    store_id: i64,
    normalized: &NormalizedOrder,
) -> Result<bool> {
    match insert_order_tx(tx, store_id, normalized).await? {
        Some(id) => {
            insert_line_items_tx(tx, id, &normalized.items).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn insert_order_tx(
    tx: &mut Transaction<'_, Sqlite>,
    store_id: i64,
    normalized: &NormalizedOrder,
) -> Result<Option<i64>> {
    let o = &normalized.order;
    let row = sqlx::query(
        "INSERT INTO orders (external_order_id, store_id, status, currency, total, shipping_total, \
         customer_name, customer_phone, customer_email, billing_address, shipping_address, \
         payment_method_title, note, created_at, modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(external_order_id, store_id) DO NOTHING RETURNING id",
    )
    .bind(o.external_order_id)
    .bind(store_id)
    .bind(&o.status)
    .bind(&o.currency)
    .bind(o.total)
    .bind(o.shipping_total)
    .bind(&o.customer_name)
    .bind(&o.customer_phone)
    .bind(&o.customer_email)
    .bind(&o.billing_address)
    .bind(&o.shipping_address)
    .bind(&o.payment_method_title)
    .bind(&o.note)
    .bind(o.created_at)
    .bind(o.modified_at)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|r| r.get::<i64, _>("id")))
}

async fn update_order_tx(
    tx: &mut Transaction<'_, Sqlite>,
    store_id: i64,
    normalized: &NormalizedOrder,
) -> Result<i64> {
    let o = &normalized.order;
    let id = sqlx::query_scalar::<_, i64>(
        "UPDATE orders SET status = ?, currency = ?, total = ?, shipping_total = ?, customer_name = ?, \
         customer_phone = ?, customer_email = ?, billing_address = ?, shipping_address = ?, \
         payment_method_title = ?, note = ?, created_at = ?, modified_at = ?, synced_at = CURRENT_TIMESTAMP \
         WHERE external_order_id = ? AND store_id = ? RETURNING id",
    )
    .bind(&o.status)
    .bind(&o.currency)
    .bind(o.total)
    .bind(o.shipping_total)
    .bind(&o.customer_name)
    .bind(&o.customer_phone)
    .bind(&o.customer_email)
    .bind(&o.billing_address)
    .bind(&o.shipping_address)
    .bind(&o.payment_method_title)
    .bind(&o.note)
    .bind(o.created_at)
    .bind(o.modified_at)
    .bind(o.external_order_id)
    .bind(store_id)
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("failed to update order {}", o.external_order_id))?;
    Ok(id)
}

async fn insert_line_items_tx(
    tx: &mut Transaction<'_, Sqlite>,
    order_id: i64,
    items: &[LineItem],
) -> Result<()> {
    for (position, item) in items.iter().enumerate() {
        let variants = serde_json::to_string(&item.variants)?;
        sqlx::query(
            "INSERT INTO line_items (order_id, position, product_id, name, sku, quantity, unit_price, image_url, variants) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order_id)
        .bind(position as i64)
        .bind(item.product_id)
        .bind(&item.name)
        .bind(&item.sku)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(&item.image_url)
        .bind(variants)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_order(
    pool: &Pool,
    store_id: i64,
    external_order_id: i64,
) -> Result<Option<StoredOrder>> {
    let row = sqlx::query(
        "SELECT id, external_order_id, store_id, status, currency, total, customer_name, created_at, modified_at \
         FROM orders WHERE external_order_id = ? AND store_id = ?",
    )
    .bind(external_order_id)
    .bind(store_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let id: i64 = row.get("id");

    let item_rows = sqlx::query(
        "SELECT name, sku, quantity, unit_price, image_url, variants FROM line_items \
         WHERE order_id = ? ORDER BY position",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let items = item_rows
        .into_iter()
        .map(|r| {
            let variants: String = r.get("variants");
            Ok(StoredLineItem {
                name: r.get("name"),
                sku: r.try_get::<Option<String>, _>("sku").ok().flatten(),
                quantity: r.get("quantity"),
                unit_price: r.get("unit_price"),
                image_url: r.try_get::<Option<String>, _>("image_url").ok().flatten(),
                variants: serde_json::from_str(&variants)
                    .with_context(|| format!("corrupt variants on order row {}", id))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(StoredOrder {
        id,
        external_order_id: row.get("external_order_id"),
        store_id: row.get("store_id"),
        status: row.get("status"),
        currency: row.get("currency"),
        total: row.get("total"),
        customer_name: row.try_get::<Option<String>, _>("customer_name").ok().flatten(),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        modified_at: row.get::<DateTime<Utc>, _>("modified_at"),
        items,
    }))
}

pub async fn count_orders(pool: &Pool, store_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE store_id = ?")
        .bind(store_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn list_external_order_ids(pool: &Pool, store_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT external_order_id FROM orders WHERE store_id = ? ORDER BY external_order_id",
    )
    .bind(store_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_pool, insert_store, run_migrations, NewStore};
    use crate::model::Order;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Pool, i64) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/orders.db", dir.path().display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store_id = insert_store(
            &pool,
            &NewStore {
                name: "Shop".into(),
                base_url: "https://shop.example".into(),
                consumer_key: "ck".into(),
                consumer_secret: "cs".into(),
                user_id: None,
                active: true,
                check_interval_minutes: None,
                last_checked: None,
            },
        )
        .await
        .unwrap();
        (dir, pool, store_id)
    }

    fn sample(id: i64, items: &[&str]) -> NormalizedOrder {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        NormalizedOrder {
            order: Order {
                external_order_id: id,
                status: "processing".into(),
                currency: "USD".into(),
                total: 10.0,
                shipping_total: 0.0,
                customer_name: Some("Ann Lee".into()),
                customer_phone: None,
                customer_email: None,
                billing_address: None,
                shipping_address: None,
                payment_method_title: None,
                note: None,
                created_at: ts,
                modified_at: ts,
            },
            items: items
                .iter()
                .map(|name| LineItem {
                    product_id: Some(1),
                    name: name.to_string(),
                    sku: None,
                    quantity: 1,
                    unit_price: 5.0,
                    image_url: None,
                    variants: vec!["Red".into()],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_line_items() {
        let (_dir, pool, store_id) = setup().await;
        let first = upsert_order(&pool, store_id, &sample(7, &["Mug", "Cap"])).await.unwrap();
        assert!(first.is_new());

        let mut changed = sample(7, &["Poster"]);
        changed.order.status = "completed".into();
        let second = upsert_order(&pool, store_id, &changed).await.unwrap();
        assert!(!second.is_new());

        let stored = fetch_order(&pool, store_id, 7).await.unwrap().unwrap();
        assert_eq!(stored.status, "completed");
        let names: Vec<&str> = stored.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Poster"]);
        assert_eq!(stored.items[0].variants, vec!["Red".to_string()]);

        let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM line_items")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(leftover, 1);
    }

    #[tokio::test]
    async fn insert_if_absent_skips_existing_key() {
        let (_dir, pool, store_id) = setup().await;
        let mut tx = pool.begin().await.unwrap();
        assert!(insert_order_if_absent_tx(&mut tx, store_id, &sample(1, &["A"])).await.unwrap());
        let again = sample(1, &["B", "C"]);
        assert!(!insert_order_if_absent_tx(&mut tx, store_id, &again).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(count_orders(&pool, store_id).await.unwrap(), 1);
        let stored = fetch_order(&pool, store_id, 1).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(list_external_order_ids(&pool, store_id).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn deleting_order_cascades_to_items() {
        let (_dir, pool, store_id) = setup().await;
        let outcome = upsert_order(&pool, store_id, &sample(3, &["A", "B"])).await.unwrap();
        let UpsertOutcome::Inserted(id) = outcome else { panic!("expected insert") };
        sqlx::query("DELETE FROM orders WHERE id = ?").bind(id).execute(&pool).await.unwrap();
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM line_items")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }
}
