mod common;

use common::*;
use order_watchbot::db;
use order_watchbot::ledger::InMemoryCancellation;
use order_watchbot::model::JobStatus;
use order_watchbot::remote::SortKey;
use order_watchbot::sync::HistorySync;
use std::sync::Arc;

fn engine(pool: &db::Pool, source: &ScriptedSource, page_size: u32) -> HistorySync {
    HistorySync::new(pool.clone(), Arc::new(FixedFactory(source.clone()))).with_page_size(page_size)
}

#[tokio::test]
async fn cancellation_during_second_page_discards_it() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://a.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let mut source = ScriptedSource::new();
    source.total = Some(100);
    source.page(1, history_page(1, 50)).await;
    source.page(2, history_page(51, 50)).await;
    source
        .hook(2, PageHook::RequestCancellation(pool.clone(), job_id.clone()))
        .await;

    let report = engine(&pool, &source, 50).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.scanned, 50);
    assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), 50);

    let job = db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress, 50);
    assert_eq!(job.log.as_deref(), Some("Cancelled after 50 orders"));
    assert!(job.cancellation_requested);
    assert!(job.end_time.is_some());

    let store = db::get_store(&pool, store_id).await.unwrap().unwrap();
    assert!(!store.syncing);
}

#[tokio::test]
async fn backfill_runs_to_completion() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://b.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let mut source = ScriptedSource::new();
    source.total = Some(5);
    source.page(1, history_page(1, 3)).await;
    source.page(2, history_page(4, 2)).await;

    let report = engine(&pool, &source, 3).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(report.scanned, 5);
    assert_eq!(report.inserted, 5);

    let job = db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.progress, 5);
    assert_eq!(job.total, Some(5));
    assert_eq!(job.log.as_deref(), Some("Sync complete: 5 orders scanned, 5 new"));
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());

    let queries = source.queries.lock().await;
    assert_eq!(queries.len(), 2);
    assert!(queries.iter().all(|q| q.sort == SortKey::Date && q.modified_after.is_none()));
    drop(queries);

    assert_eq!(db::list_external_order_ids(&pool, store_id).await.unwrap(), vec![1, 2, 3, 4, 5]);
    let store = db::get_store(&pool, store_id).await.unwrap().unwrap();
    assert!(!store.syncing);
}

#[tokio::test]
async fn rerun_only_counts_new_orders() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://c.example", None, None).await;
    let source = ScriptedSource::new();
    source.page(1, history_page(1, 4)).await;
    let sync = engine(&pool, &source, 10);

    let first = db::create_job(&pool, store_id, None, "first").await.unwrap();
    sync.run(store_id, &first).await.unwrap();

    source.page(1, history_page(1, 6)).await;
    let second = db::create_job(&pool, store_id, None, "second").await.unwrap();
    let report = sync.run(store_id, &second).await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(report.scanned, 6);
    assert_eq!(report.inserted, 2);
    assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), 6);

    let job = db::get_job(&pool, &second).await.unwrap().unwrap();
    assert_eq!(job.log.as_deref(), Some("Sync complete: 6 orders scanned, 2 new"));
    // without a total from the remote, the total becomes the scanned count
    assert_eq!(job.total, Some(6));
}

#[tokio::test]
async fn failing_total_count_fails_the_job_and_releases_the_store() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://d.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let mut source = ScriptedSource::new();
    source.total_fails = true;

    let report = engine(&pool, &source, 50).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);

    let job = db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let log = job.log.unwrap();
    assert!(log.starts_with("Error: "), "{}", log);
    assert!(log.contains("connection refused"), "{}", log);

    let store = db::get_store(&pool, store_id).await.unwrap().unwrap();
    assert!(!store.syncing);
    assert!(source.queries.lock().await.is_empty());
}

#[tokio::test]
async fn single_failing_page_is_skipped() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://e.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let source = ScriptedSource::new();
    source.page(1, history_page(1, 2)).await;
    source.failing_page(2, "500 Internal Server Error").await;
    source.page(3, history_page(5, 1)).await;

    let report = engine(&pool, &source, 2).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(report.scanned, 3);
    assert_eq!(source.fetched_pages().await, vec![1, 2, 3]);
    assert_eq!(db::list_external_order_ids(&pool, store_id).await.unwrap(), vec![1, 2, 5]);
}

#[tokio::test]
async fn three_failing_pages_in_a_row_fail_the_job() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://f.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let source = ScriptedSource::new();
    source.page(1, history_page(1, 2)).await;
    for page in 2..=4 {
        source.failing_page(page, "timed out").await;
    }
    source.page(5, history_page(9, 2)).await;

    let report = engine(&pool, &source, 2).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.scanned, 2);
    assert_eq!(source.fetched_pages().await, vec![1, 2, 3, 4]);

    let job = db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 2);
    assert!(job.log.unwrap().contains("3 consecutive page fetches failed"));
    assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), 2);
}

#[tokio::test]
async fn job_cancelled_while_queued_never_starts() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://g.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();
    assert_eq!(
        db::request_cancellation(&pool, &job_id).await.unwrap(),
        JobStatus::Cancelled
    );

    let source = ScriptedSource::new();
    source.page(1, history_page(1, 2)).await;
    let report = engine(&pool, &source, 50).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert!(source.queries.lock().await.is_empty());
    assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), 0);
}

#[tokio::test]
async fn finished_job_cannot_be_rerun() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://h.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();
    let source = ScriptedSource::new();
    let sync = engine(&pool, &source, 50);

    assert_eq!(sync.run(store_id, &job_id).await.unwrap().status, JobStatus::Complete);
    assert!(sync.run(store_id, &job_id).await.is_err());
}

#[tokio::test]
async fn in_memory_token_stops_before_committing() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://i.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();

    let token = InMemoryCancellation::new();
    let source = ScriptedSource::new();
    source.page(1, history_page(1, 5)).await;
    source.hook(1, PageHook::Cancel(token.clone())).await;

    let report = engine(&pool, &source, 50)
        .run_with_token(store_id, &job_id, &token)
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.scanned, 0);
    assert_eq!(db::count_orders(&pool, store_id).await.unwrap(), 0);
    let job = db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.log.as_deref(), Some("Cancelled after 0 orders"));
}

#[tokio::test]
async fn busy_store_fails_the_job() {
    let (_dir, pool) = setup_pool().await;
    let store_id = add_store(&pool, "https://j.example", None, None).await;
    let job_id = db::create_job(&pool, store_id, None, "Full sync").await.unwrap();
    assert!(db::try_begin_syncing(&pool, store_id).await.unwrap());

    let source = ScriptedSource::new();
    let report = engine(&pool, &source, 50).run(store_id, &job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    // the flag belongs to whoever raised it
    let store = db::get_store(&pool, store_id).await.unwrap().unwrap();
    assert!(store.syncing);
}
