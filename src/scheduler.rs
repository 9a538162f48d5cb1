//! Per-store poll timers plus a bounded pool for backfill jobs.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::Store;
use crate::settings::EffectiveSettings;
use crate::sync::{HistoryReport, HistorySync, IncrementalReport, IncrementalSync};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

struct TimerEntry {
    interval: Duration,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimerEntry {
    /// Ask the timer task to exit. A run in flight is finished first.
    fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

pub struct Scheduler {
    pool: Pool,
    config: Arc<Config>,
    incremental: Arc<IncrementalSync>,
    history: Arc<HistorySync>,
    timers: Mutex<HashMap<i64, TimerEntry>>,
    /// Held by whichever engine is working on the store. Entries nobody holds
    /// are pruned.
    store_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    workers: Arc<Semaphore>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    submitted: Mutex<HashSet<String>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        config: Arc<Config>,
        incremental: Arc<IncrementalSync>,
        history: Arc<HistorySync>,
    ) -> Arc<Self> {
        let workers = config.app.history_workers.max(1);
        Arc::new(Self {
            pool,
            config,
            incremental,
            history,
            timers: Mutex::new(HashMap::new()),
            store_locks: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(workers)),
            jobs: Mutex::new(Vec::new()),
            submitted: Mutex::new(HashSet::new()),
        })
    }

    fn store_lock(&self, store_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.store_locks)
            .entry(store_id)
            .or_default()
            .clone()
    }

    fn prune_lock(&self, store_id: i64) {
        let mut locks = guard(&self.store_locks);
        if locks
            .get(&store_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&store_id);
        }
    }

    /// Install or re-install the poll timer of a store. Inactive stores lose
    /// their timer. The first tick fires one interval from now. A replaced
    /// timer finishes its in-flight run before it exits.
    pub fn add_or_update(self: &Arc<Self>, store: &Store, interval: Duration) {
        if !store.active {
            self.remove(store.id);
            return;
        }
        let mut timers = guard(&self.timers);
        if let Some(entry) = timers.get(&store.id) {
            if entry.interval == interval && !entry.handle.is_finished() {
                return;
            }
        }
        if let Some(old) = timers.remove(&store.id) {
            old.stop();
        }

        let this = Arc::clone(self);
        let store_id = store.id;
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        this.run_incremental(store_id).await;
                    }
                }
            }
            debug!(store_id, "store timer stopped");
        });
        info!(store_id, interval_secs = interval.as_secs(), "store timer installed");
        timers.insert(
            store.id,
            TimerEntry {
                interval,
                stop,
                handle,
            },
        );
    }

    /// Stop the poll timer of a store. A run in flight is left to finish.
    pub fn remove(&self, store_id: i64) -> bool {
        let removed = guard(&self.timers).remove(&store_id);
        self.prune_lock(store_id);
        match removed {
            Some(entry) => {
                entry.stop();
                info!(store_id, "store timer removed");
                true
            }
            None => false,
        }
    }

    pub fn scheduled_stores(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = guard(&self.timers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// One incremental run, unless one is already in flight for the store.
    /// Returns `None` when the trigger was suppressed or the run errored.
    pub async fn run_incremental(&self, store_id: i64) -> Option<IncrementalReport> {
        let lock = self.store_lock(store_id);
        let report = match lock.try_lock() {
            Ok(_running) => self.run_incremental_locked(store_id).await,
            Err(_) => {
                debug!(store_id, "store busy, dropping trigger");
                None
            }
        };
        drop(lock);
        self.prune_lock(store_id);
        report
    }

    async fn run_incremental_locked(&self, store_id: i64) -> Option<IncrementalReport> {
        let fetch_images = match EffectiveSettings::load(&self.pool, &self.config).await {
            Ok(settings) => settings.fetch_product_images,
            Err(err) => {
                warn!(?err, "failed to load settings, images disabled for this run");
                false
            }
        };
        match self.incremental.run(store_id, fetch_images).await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(store_id, ?err, "incremental sync failed");
                None
            }
        }
    }

    /// Operator "fetch now": run outside the timer, same one-in-flight rule.
    pub fn trigger_now(self: &Arc<Self>, store_id: i64) -> JoinHandle<Option<IncrementalReport>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_incremental(store_id).await })
    }

    /// Queue a backfill on the worker pool. Returns false if this job id was
    /// already submitted and has not finished.
    pub fn submit_history(self: &Arc<Self>, job_id: String, store_id: i64) -> bool {
        if !guard(&self.submitted).insert(job_id.clone()) {
            return false;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let report = this.run_history(store_id, &job_id).await;
            match report {
                Ok(report) => info!(
                    store_id,
                    job_id = %job_id,
                    status = report.status.as_str(),
                    scanned = report.scanned,
                    "history job finished"
                ),
                Err(err) => error!(store_id, job_id = %job_id, ?err, "history job errored"),
            }
            guard(&this.submitted).remove(&job_id);
        });
        let mut jobs = guard(&self.jobs);
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
        true
    }

    async fn run_history(&self, store_id: i64, job_id: &str) -> Result<HistoryReport> {
        let _permit = Arc::clone(&self.workers).acquire_owned().await?;
        let lock = self.store_lock(store_id);
        let report = {
            let _store = lock.lock().await;
            self.history.run(store_id, job_id).await
        };
        drop(lock);
        self.prune_lock(store_id);
        report
    }

    /// Bring timers in line with the store registry and pick up queued jobs.
    #[instrument(skip_all)]
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let settings = EffectiveSettings::load(&self.pool, &self.config).await?;
        let stores = db::list_stores(&self.pool).await?;

        let mut active = HashSet::new();
        for store in &stores {
            if store.active {
                active.insert(store.id);
                self.add_or_update(store, settings.interval_for(store));
            }
        }
        let stale: Vec<i64> = guard(&self.timers)
            .keys()
            .copied()
            .filter(|id| !active.contains(id))
            .collect();
        for store_id in stale {
            self.remove(store_id);
        }

        for job in db::list_queued_jobs(&self.pool).await? {
            if self.submit_history(job.job_id.clone(), job.store_id) {
                info!(job_id = %job.job_id, store_id = job.store_id, "picked up queued job");
            }
        }
        Ok(())
    }

    /// Wait for every submitted backfill job to finish.
    pub async fn drain_jobs(&self) {
        let handles: Vec<JoinHandle<()>> = guard(&self.jobs).drain(..).collect();
        for res in futures::future::join_all(handles).await {
            if let Err(err) = res {
                warn!(?err, "history task ended abnormally");
            }
        }
    }

    /// Stop all timers, letting in-flight incremental runs finish, and abort
    /// in-flight jobs. Interrupted jobs are failed by the start-up recovery of
    /// the next process.
    pub async fn shutdown(&self) {
        let timers: Vec<TimerEntry> = guard(&self.timers).drain().map(|(_, e)| e).collect();
        for entry in &timers {
            entry.stop();
        }
        let handles: Vec<JoinHandle<()>> = guard(&self.jobs).drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        let all = timers
            .into_iter()
            .map(|e| e.handle)
            .chain(handles)
            .collect::<Vec<_>>();
        let _ = futures::future::join_all(all).await;
        guard(&self.store_locks).clear();
        info!("scheduler stopped");
    }
}
