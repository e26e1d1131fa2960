//! SQLite-backed window store shared by every worker process

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;

use super::{evaluate_windows, Decision, LimitKey, Penalty, RateLimitStore};
use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::WindowSpec;

/// Window entries live in `rate_limit_entries`; each check runs in one
/// `BEGIN IMMEDIATE` transaction so the prune, count and insert are atomic
/// across processes.
#[derive(Clone)]
pub struct SqliteWindowStore {
    db: Database,
}

impl SqliteWindowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RateLimitStore for SqliteWindowStore {
    async fn check_and_record(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        now: i64,
    ) -> Result<Decision> {
        let mut tx = self.db.begin_immediate().await?;

        let mut timestamps = Vec::with_capacity(windows.len());
        for spec in windows {
            prune_window(&mut tx, key, spec, now).await?;
            timestamps.push(window_timestamps(&mut tx, key, spec).await?);
        }

        let penalty = load_penalty(&mut tx, key).await?;
        let decision = evaluate_windows(windows, &timestamps, penalty.as_ref(), now);

        if decision.is_allowed() {
            let nonce = uuid::Uuid::new_v4().to_string();
            for spec in windows {
                insert_entry(&mut tx, key, spec, now, &nonce).await?;
            }
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn penalize(
        &self,
        key: &LimitKey<'_>,
        windows: &[WindowSpec],
        retry_after_ms: Option<i64>,
        now: i64,
    ) -> Result<Penalty> {
        let mut tx = self.db.begin_immediate().await?;

        let previous = load_penalty(&mut tx, key).await?;
        let penalty = Penalty::escalate(previous, windows, retry_after_ms, now);
        save_penalty(&mut tx, key, &penalty).await?;

        tx.commit().await?;
        Ok(penalty)
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let entries = sqlx::query("DELETE FROM rate_limit_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let penalties = sqlx::query("DELETE FROM rate_limit_penalties WHERE expires_at <= ?")
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(entries.rows_affected() + penalties.rows_affected())
    }
}

/// Remove entries that have slid out of the window
async fn prune_window(
    conn: &mut SqliteConnection,
    key: &LimitKey<'_>,
    spec: &WindowSpec,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM rate_limit_entries
        WHERE platform = ? AND token_id = ? AND endpoint = ?
          AND window_kind = ? AND window_ms = ? AND ts <= ?
        "#,
    )
    .bind(key.platform.as_str())
    .bind(key.token_id)
    .bind(key.endpoint)
    .bind(spec.kind.as_str())
    .bind(spec.window_ms)
    .bind(now - spec.window_ms)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

async fn window_timestamps(
    conn: &mut SqliteConnection,
    key: &LimitKey<'_>,
    spec: &WindowSpec,
) -> Result<Vec<i64>> {
    let rows = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT ts FROM rate_limit_entries
        WHERE platform = ? AND token_id = ? AND endpoint = ?
          AND window_kind = ? AND window_ms = ?
        ORDER BY ts ASC
        "#,
    )
    .bind(key.platform.as_str())
    .bind(key.token_id)
    .bind(key.endpoint)
    .bind(spec.kind.as_str())
    .bind(spec.window_ms)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(rows.into_iter().map(|(ts,)| ts).collect())
}

async fn insert_entry(
    conn: &mut SqliteConnection,
    key: &LimitKey<'_>,
    spec: &WindowSpec,
    now: i64,
    nonce: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_entries
            (platform, token_id, endpoint, window_kind, window_ms, ts, nonce, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key.platform.as_str())
    .bind(key.token_id)
    .bind(key.endpoint)
    .bind(spec.kind.as_str())
    .bind(spec.window_ms)
    .bind(now)
    .bind(nonce)
    .bind(now + 2 * spec.window_ms)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

async fn load_penalty(conn: &mut SqliteConnection, key: &LimitKey<'_>) -> Result<Option<Penalty>> {
    let row = sqlx::query_as::<_, (i64, i64, i64)>(
        r#"
        SELECT blocked_until, reduction, expires_at FROM rate_limit_penalties
        WHERE platform = ? AND token_id = ? AND endpoint = ?
        "#,
    )
    .bind(key.platform.as_str())
    .bind(key.token_id)
    .bind(key.endpoint)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(row.map(|(blocked_until, reduction, expires_at)| Penalty {
        blocked_until,
        reduction: u32::try_from(reduction).unwrap_or(0),
        expires_at,
    }))
}

async fn save_penalty(
    conn: &mut SqliteConnection,
    key: &LimitKey<'_>,
    penalty: &Penalty,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_penalties (platform, token_id, endpoint, blocked_until, reduction, expires_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(platform, token_id, endpoint) DO UPDATE SET
            blocked_until = excluded.blocked_until,
            reduction = excluded.reduction,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(key.platform.as_str())
    .bind(key.token_id)
    .bind(key.endpoint)
    .bind(penalty.blocked_until)
    .bind(penalty.reduction as i64)
    .bind(penalty.expires_at)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}
