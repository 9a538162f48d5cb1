use super::model::NewStore;
use crate::model::{Role, Store, UserProfile};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with full durability; line items rely on foreign-key cascades.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store registry
// ---------------------------------------------------------------------------

const STORE_COLUMNS: &str = "id, name, base_url, consumer_key, consumer_secret, user_id, active, \
     syncing, check_interval_minutes, last_checked, last_notified_cursor";

fn store_from_row(row: &SqliteRow) -> Store {
    Store {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        consumer_key: row.get("consumer_key"),
        consumer_secret: row.get("consumer_secret"),
        user_id: row.try_get::<Option<i64>, _>("user_id").ok().flatten(),
        active: row.get::<bool, _>("active"),
        syncing: row.get::<bool, _>("syncing"),
        check_interval_minutes: row
            .try_get::<Option<i64>, _>("check_interval_minutes")
            .ok()
            .flatten(),
        last_checked: row
            .try_get::<Option<DateTime<Utc>>, _>("last_checked")
            .ok()
            .flatten(),
        last_notified_cursor: row
            .try_get::<Option<DateTime<Utc>>, _>("last_notified_cursor")
            .ok()
            .flatten(),
    }
}

#[instrument(skip_all)]
pub async fn insert_store(pool: &Pool, store: &NewStore) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO stores (name, base_url, consumer_key, consumer_secret, user_id, active, check_interval_minutes, last_checked) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&store.name)
    .bind(&store.base_url)
    .bind(&store.consumer_key)
    .bind(&store.consumer_secret)
    .bind(store.user_id)
    .bind(store.active)
    .bind(store.check_interval_minutes)
    .bind(store.last_checked)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_store(pool: &Pool, store_id: i64) -> Result<Option<Store>> {
    let row = sqlx::query(&format!("SELECT {} FROM stores WHERE id = ?", STORE_COLUMNS))
        .bind(store_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(store_from_row))
}

#[instrument(skip_all)]
pub async fn list_stores(pool: &Pool) -> Result<Vec<Store>> {
    let rows = sqlx::query(&format!("SELECT {} FROM stores ORDER BY id", STORE_COLUMNS))
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(store_from_row).collect())
}

#[instrument(skip_all)]
pub async fn list_active_stores(pool: &Pool) -> Result<Vec<Store>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stores WHERE active = 1 ORDER BY id",
        STORE_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(store_from_row).collect())
}

pub async fn set_store_active(pool: &Pool, store_id: i64, active: bool) -> Result<()> {
    sqlx::query("UPDATE stores SET active = ? WHERE id = ?")
        .bind(active)
        .bind(store_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Advance `last_checked` to `ts` unless it already is at or beyond it.
/// Returns the value stored afterwards.
#[instrument(skip_all)]
pub async fn set_last_checked(
    pool: &Pool,
    store_id: i64,
    ts: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    advance_store_cursor(pool, store_id, "last_checked", ts).await
}

/// Advance `last_notified_cursor` monotonically, like [`set_last_checked`].
#[instrument(skip_all)]
pub async fn set_last_notified_cursor(
    pool: &Pool,
    store_id: i64,
    ts: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    advance_store_cursor(pool, store_id, "last_notified_cursor", ts).await
}

async fn advance_store_cursor(
    pool: &Pool,
    store_id: i64,
    column: &'static str,
    ts: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    // One guarded statement: no read-then-write window for a concurrent writer.
    // Stored text timestamps are not reliably ordered lexically, so compare as julian days.
    sqlx::query(&format!(
        "UPDATE stores SET {col} = ? WHERE id = ? AND ({col} IS NULL OR julianday({col}) < julianday(?))",
        col = column
    ))
    .bind(ts)
    .bind(store_id)
    .bind(ts)
    .execute(pool)
    .await
    .with_context(|| format!("failed to advance {} for store {}", column, store_id))?;

    let current: Option<DateTime<Utc>> = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(&format!(
        "SELECT {} FROM stores WHERE id = ?",
        column
    ))
    .bind(store_id)
    .fetch_optional(pool)
    .await?
    .flatten();
    Ok(current)
}

/// Raise the `syncing` flag. Returns false if it was already raised.
#[instrument(skip_all)]
pub async fn try_begin_syncing(pool: &Pool, store_id: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE stores SET syncing = 1 WHERE id = ? AND syncing = 0")
        .bind(store_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn end_syncing(pool: &Pool, store_id: i64) -> Result<()> {
    sqlx::query("UPDATE stores SET syncing = 0 WHERE id = ?")
        .bind(store_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear flags left behind by a process that died mid-backfill.
#[instrument(skip_all)]
pub async fn reset_syncing_flags(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE stores SET syncing = 0 WHERE syncing = 1")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_user(pool: &Pool, user: &UserProfile) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO users (username, role, manager_id, telegram_enabled, telegram_bot_token, telegram_chat_id, \
         telegram_send_delay_seconds, can_customize_telegram_delay, can_customize_telegram_templates, \
         telegram_template_new_order, telegram_template_user_test) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&user.username)
    .bind(user.role.as_str())
    .bind(user.manager_id)
    .bind(user.telegram_enabled)
    .bind(&user.telegram_bot_token)
    .bind(&user.telegram_chat_id)
    .bind(user.telegram_send_delay_seconds)
    .bind(user.can_customize_telegram_delay)
    .bind(user.can_customize_telegram_templates)
    .bind(&user.telegram_template_new_order)
    .bind(&user.telegram_template_user_test)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_user_profile(pool: &Pool, user_id: i64) -> Result<Option<UserProfile>> {
    let row = sqlx::query(
        "SELECT id, username, role, manager_id, telegram_enabled, telegram_bot_token, telegram_chat_id, \
         telegram_send_delay_seconds, can_customize_telegram_delay, can_customize_telegram_templates, \
         telegram_template_new_order, telegram_template_user_test \
         FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let opt_text = |col: &str| -> Option<String> {
        row.try_get::<Option<String>, _>(col)
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty())
    };

    Ok(Some(UserProfile {
        id: row.get("id"),
        username: row.get("username"),
        role: Role::parse_role(&row.get::<String, _>("role")),
        manager_id: row.try_get::<Option<i64>, _>("manager_id").ok().flatten(),
        telegram_enabled: row.get::<bool, _>("telegram_enabled"),
        telegram_bot_token: opt_text("telegram_bot_token"),
        telegram_chat_id: opt_text("telegram_chat_id"),
        telegram_send_delay_seconds: row
            .try_get::<Option<i64>, _>("telegram_send_delay_seconds")
            .ok()
            .flatten(),
        can_customize_telegram_delay: row.get::<bool, _>("can_customize_telegram_delay"),
        can_customize_telegram_templates: row.get::<bool, _>("can_customize_telegram_templates"),
        telegram_template_new_order: opt_text("telegram_template_new_order"),
        telegram_template_user_test: opt_text("telegram_template_user_test"),
    }))
}

// ---------------------------------------------------------------------------
// Settings store
// ---------------------------------------------------------------------------

pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

pub async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns true if the key was absent and has been inserted.
pub async fn insert_setting_if_missing(pool: &Pool, key: &str, value: &str) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn all_settings(pool: &Pool) -> Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let key: String = row.get("key");
            let value: Option<String> = row.try_get("value").ok().flatten();
            value.map(|v| (key, v))
        })
        .collect())
}
