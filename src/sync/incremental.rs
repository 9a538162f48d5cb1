//! Watermark-driven delta sync of one store.

use crate::db::{self, Pool};
use crate::model::{EventKind, LineItem, NormalizedOrder, Store};
use crate::normalize::normalize;
use crate::notify::{NotificationPayload, Notify};
use crate::remote::{ImageLookup, OrderQuery, SortKey, SourceFactory};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementalReport {
    /// The run did nothing: store missing, inactive or backfilling.
    pub skipped: bool,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub notified: usize,
    pub last_checked: Option<DateTime<Utc>>,
}

pub struct IncrementalSync {
    pool: Pool,
    sources: Arc<dyn SourceFactory>,
    notifier: Arc<dyn Notify>,
    page_size: u32,
    lookback: Duration,
}

impl IncrementalSync {
    pub fn new(
        pool: Pool,
        sources: Arc<dyn SourceFactory>,
        notifier: Arc<dyn Notify>,
        page_size: u32,
        lookback_days: i64,
    ) -> Self {
        Self {
            pool,
            sources,
            notifier,
            page_size: page_size.max(1),
            lookback: Duration::days(lookback_days),
        }
    }

    /// Fetch every order modified since the store's watermark, mirror it and
    /// notify the store owner about orders seen for the first time.
    #[instrument(skip_all, fields(store_id = store_id))]
    pub async fn run(&self, store_id: i64, fetch_images: bool) -> Result<IncrementalReport> {
        let mut report = IncrementalReport::default();
        let Some(store) = db::get_store(&self.pool, store_id).await? else {
            debug!("store vanished, skipping");
            report.skipped = true;
            return Ok(report);
        };
        if !store.active || store.syncing {
            debug!(active = store.active, syncing = store.syncing, "skipping store");
            report.skipped = true;
            return Ok(report);
        }

        let since = store
            .last_checked
            .unwrap_or_else(|| Utc::now() - self.lookback);
        let source = self.sources.orders(&store)?;
        let images = if fetch_images {
            self.sources.images(&store)?
        } else {
            None
        };
        let mut image_cache: HashMap<i64, Option<String>> = HashMap::new();

        let mut new_orders: Vec<NormalizedOrder> = Vec::new();
        // Highest modified_at committed before the first failure of this run.
        let mut watermark: Option<DateTime<Utc>> = None;
        let mut blocked = false;
        let mut page = 1;

        loop {
            let query = OrderQuery {
                page,
                per_page: self.page_size,
                modified_after: Some(since),
                sort: SortKey::Modified,
            };
            let orders = match source.fetch_page(&query).await {
                Ok(orders) => orders,
                Err(err) => {
                    warn!(page, ?err, "order page fetch failed, ending run");
                    break;
                }
            };
            let count = orders.len();
            report.fetched += count;

            for raw in &orders {
                let mut normalized = match normalize(raw) {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(order_id = %raw["id"], ?err, "skipping unreadable order");
                        report.failed += 1;
                        blocked = true;
                        continue;
                    }
                };
                if let Some(lookup) = images.as_deref() {
                    fill_images(lookup, &mut normalized.items, &mut image_cache).await;
                }

                match db::upsert_order(&self.pool, store.id, &normalized).await {
                    Ok(outcome) => {
                        if outcome.is_new() {
                            report.inserted += 1;
                            new_orders.push(normalized.clone());
                        } else {
                            report.updated += 1;
                        }
                        if !blocked {
                            let modified = normalized.order.modified_at;
                            watermark = Some(watermark.map_or(modified, |w| w.max(modified)));
                        }
                    }
                    Err(err) => {
                        warn!(
                            order_id = normalized.order.external_order_id,
                            ?err,
                            "failed to store order"
                        );
                        report.failed += 1;
                        blocked = true;
                    }
                }
            }

            if count < self.page_size as usize {
                break;
            }
            page += 1;
        }

        // A first run with nothing to do still pins the lookback start.
        let target = watermark.or(store.last_checked.is_none().then_some(since));
        report.last_checked = match target {
            Some(ts) => db::set_last_checked(&self.pool, store.id, ts).await?,
            None => store.last_checked,
        };

        report.notified = self.notify_new_orders(&store, &new_orders).await;

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            notified = report.notified,
            "incremental sync finished"
        );
        Ok(report)
    }

    async fn notify_new_orders(&self, store: &Store, orders: &[NormalizedOrder]) -> usize {
        let Some(owner_id) = store.user_id else {
            if !orders.is_empty() {
                debug!(count = orders.len(), "store has no owner, not notifying");
            }
            return 0;
        };
        let mut notified = 0;
        for n in orders {
            let payload = NotificationPayload::for_order(&store.name, &n.order, &n.items);
            match self
                .notifier
                .dispatch(EventKind::NewOrder, payload, Some(owner_id))
                .await
            {
                Ok(_) => {
                    notified += 1;
                    if let Err(err) =
                        db::set_last_notified_cursor(&self.pool, store.id, n.order.created_at).await
                    {
                        warn!(?err, "failed to advance notification cursor");
                    }
                }
                Err(err) => {
                    warn!(order_id = n.order.external_order_id, ?err, "dispatch failed");
                }
            }
        }
        notified
    }
}

async fn fill_images(
    lookup: &dyn ImageLookup,
    items: &mut [LineItem],
    cache: &mut HashMap<i64, Option<String>>,
) {
    for item in items.iter_mut().filter(|i| i.image_url.is_none()) {
        let Some(product_id) = item.product_id else {
            continue;
        };
        if let Some(cached) = cache.get(&product_id) {
            item.image_url = cached.clone();
            continue;
        }
        let found = match lookup.product_image(product_id).await {
            Ok(found) => found,
            Err(err) => {
                debug!(product_id, ?err, "product image lookup failed");
                None
            }
        };
        cache.insert(product_id, found.clone());
        item.image_url = found;
    }
}
