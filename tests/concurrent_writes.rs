mod common;

use chrono::Duration;
use common::*;
use order_watchbot::db;
use order_watchbot::normalize::normalize;

const ORDERS: i64 = 30;
const ROUNDS: i64 = 8;

async fn churn(pool: db::Pool, store_id: i64) -> Vec<String> {
    let base = ts("2024-03-01T00:00:00Z");
    let mut errors = Vec::new();
    for round in 0..ROUNDS {
        for id in 1..=ORDERS {
            let modified = base + Duration::minutes(round * ORDERS + id);
            let raw = order_json(
                id,
                &modified.format("%Y-%m-%dT%H:%M:%S").to_string(),
                &[("Mug", round + 1)],
            );
            let normalized = normalize(&raw).unwrap();
            if let Err(err) = db::upsert_order(&pool, store_id, &normalized).await {
                errors.push(format!("upsert: {:#}", err));
            }
            if let Err(err) = db::set_last_checked(&pool, store_id, modified).await {
                errors.push(format!("cursor: {:#}", err));
            }
        }
    }
    errors
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_stores_write_in_parallel_without_lock_errors() {
    let (_dir, pool) = setup_pool().await;
    let a = add_store(&pool, "https://a.example", None, None).await;
    let b = add_store(&pool, "https://b.example", None, None).await;

    let left = tokio::spawn(churn(pool.clone(), a));
    let right = tokio::spawn(churn(pool.clone(), b));
    let (left, right) = (left.await.unwrap(), right.await.unwrap());
    assert!(left.is_empty(), "store a: {:?}", left.first());
    assert!(right.is_empty(), "store b: {:?}", right.first());

    let last = ts("2024-03-01T00:00:00Z") + Duration::minutes((ROUNDS - 1) * ORDERS + ORDERS);
    for store_id in [a, b] {
        assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), ORDERS);
        let store = db::get_store(&pool, store_id).await.unwrap().unwrap();
        assert_eq!(store.last_checked, Some(last));
        let order = db::fetch_order(&pool, store_id, 5).await.unwrap().unwrap();
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].quantity, ROUNDS);
    }
}
