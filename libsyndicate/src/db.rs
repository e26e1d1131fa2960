//! Database operations for Syndicate
//!
//! SQLite is the shared store every worker coordinates through. Multi-statement
//! check-and-act sequences run inside [`ImmediateTx`], which takes the write
//! lock up front so two workers cannot interleave between the read and the
//! write.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{CircuitState, JobPayload, JobStatus, Platform, PublishJob, TokenRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 8;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a write transaction that holds the database write lock
    pub async fn begin_immediate(&self) -> Result<ImmediateTx> {
        ImmediateTx::begin(&self.pool).await
    }

    // ----- token records -----

    /// Insert a token record, or re-activate an existing one keeping its
    /// tuning and counters
    pub async fn upsert_token_record(&self, record: &TokenRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::SqlxError)?;
        upsert_token_record_in(&mut conn, record).await
    }

    pub async fn get_token_record(&self, token_id: &str) -> Result<Option<TokenRecord>> {
        let row = sqlx::query("SELECT * FROM token_records WHERE token_id = ?")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(token_record_from_row).transpose()
    }

    /// All token records, optionally for one platform, ordered by id
    pub async fn list_token_records(&self, platform: Option<Platform>) -> Result<Vec<TokenRecord>> {
        let rows = match platform {
            Some(p) => {
                sqlx::query("SELECT * FROM token_records WHERE platform = ? ORDER BY token_id")
                    .bind(p.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM token_records ORDER BY platform, token_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(token_record_from_row).collect()
    }

    pub async fn set_token_active(&self, token_id: &str, active: bool, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE token_records SET is_active = ?, updated_at = ? WHERE token_id = ?",
        )
        .bind(active)
        .bind(now)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Change scheduling knobs; `None` leaves a field untouched and
    /// `Some(None)` clears the cooldown
    pub async fn update_token_tuning(
        &self,
        token_id: &str,
        priority: Option<i64>,
        weight: Option<i64>,
        cooldown_until: Option<Option<i64>>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE token_records SET
                priority = COALESCE(?, priority),
                weight = COALESCE(?, weight),
                cooldown_until = CASE WHEN ? THEN ? ELSE cooldown_until END,
                updated_at = ?
            WHERE token_id = ?
            "#,
        )
        .bind(priority)
        .bind(weight)
        .bind(cooldown_until.is_some())
        .bind(cooldown_until.flatten())
        .bind(now)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record that the token was picked to run
    pub async fn touch_last_scheduled(&self, token_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE token_records
            SET last_scheduled_at = ?, total_jobs_scheduled = total_jobs_scheduled + 1, updated_at = ?
            WHERE token_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Move `last_scheduled_at` forward after a successful publish
    pub async fn mark_token_published(&self, token_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE token_records
            SET last_scheduled_at = MAX(COALESCE(last_scheduled_at, 0), ?), updated_at = ?
            WHERE token_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ----- publish jobs -----

    /// Insert a job unless its dedupe key already exists. Returns whether a
    /// row was written.
    pub async fn insert_job(&self, job: &PublishJob) -> Result<bool> {
        let payload = serde_json::to_string(&job.payload).map_err(|e| DbError::InvalidRow {
            table: "publish_jobs",
            reason: format!("payload not serialisable: {}", e),
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO publish_jobs (
                job_id, token_id, platform, payload, scheduled_at, status, attempts,
                dedupe_key, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedupe_key) DO NOTHING
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.token_id)
        .bind(job.platform.as_str())
        .bind(payload)
        .bind(job.scheduled_at)
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(&job.dedupe_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<PublishJob>> {
        let row = sqlx::query("SELECT * FROM publish_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn find_job_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<PublishJob>> {
        let row = sqlx::query("SELECT * FROM publish_jobs WHERE dedupe_key = ?")
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs matching the filter, newest first
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<PublishJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM publish_jobs
            WHERE (? IS NULL OR token_id = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR platform = ?)
            ORDER BY created_at DESC, job_id
            LIMIT ?
            "#,
        )
        .bind(filter.token_id.as_deref())
        .bind(filter.token_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.platform.map(|p| p.as_str()))
        .bind(filter.platform.map(|p| p.as_str()))
        .bind(filter.limit.unwrap_or(100) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Earliest due pending job for one token
    pub async fn next_due_job(&self, token_id: &str, now: i64) -> Result<Option<PublishJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM publish_jobs
            WHERE token_id = ? AND status = 'pending' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC, created_at ASC, job_id ASC
            LIMIT 1
            "#,
        )
        .bind(token_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Atomic pending → running transition for a due job.
    ///
    /// Exactly one caller gets the row back, as it stands after the claim.
    /// A job that is not pending or whose `scheduled_at` is still ahead of
    /// `now` yields `None`.
    pub async fn claim_job(&self, job_id: &str, now: i64) -> Result<Option<PublishJob>> {
        let row = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'running', claimed_at = ?, updated_at = ?
            WHERE job_id = ? AND status = 'pending' AND scheduled_at <= ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Put a running job back to pending without counting an attempt
    pub async fn release_job(&self, job_id: &str, run_at: i64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'pending', scheduled_at = ?, claimed_at = NULL, updated_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(run_at)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Put a running job back to pending after a failed attempt
    pub async fn retry_job(&self, job_id: &str, update: &AttemptUpdate<'_>, run_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'pending', scheduled_at = ?, attempts = ?, error_code = ?,
                last_error = ?, claimed_at = NULL, updated_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(run_at)
        .bind(update.attempts as i64)
        .bind(update.error_code)
        .bind(update.last_error)
        .bind(update.now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn fail_job(&self, job_id: &str, update: &AttemptUpdate<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'failed', attempts = ?, error_code = ?, last_error = ?,
                completed_at = ?, updated_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(update.attempts as i64)
        .bind(update.error_code)
        .bind(update.last_error)
        .bind(update.now)
        .bind(update.now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn complete_job(
        &self,
        job_id: &str,
        attempts: u32,
        external_id: &str,
        external_url: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'succeeded', attempts = ?, external_id = ?, external_url = ?,
                error_code = NULL, completed_at = ?, updated_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(attempts as i64)
        .bind(external_id)
        .bind(external_url)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Cancel a pending job. Running and terminal jobs are left alone.
    pub async fn cancel_job(&self, job_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publish_jobs
            SET status = 'cancelled', completed_at = ?, updated_at = ?
            WHERE job_id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Running jobs claimed at or before `claimed_before`
    pub async fn list_stale_running(&self, claimed_before: i64) -> Result<Vec<PublishJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM publish_jobs
            WHERE status = 'running' AND claimed_at <= ?
            ORDER BY claimed_at ASC
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Job totals per status, for the health report
    pub async fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM publish_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
                let count: i64 = row.try_get("n").map_err(DbError::SqlxError)?;
                Ok((parse_column("publish_jobs", &status)?, count))
            })
            .collect()
    }

    // ----- metric totals -----

    /// Add counter deltas to the shared totals in one transaction
    pub async fn add_metric_totals(&self, deltas: &[(&str, u64)], now: i64) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        for (name, delta) in deltas.iter().filter(|(_, d)| *d > 0) {
            sqlx::query(
                r#"
                INSERT INTO metric_totals (name, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    value = value + excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(*name)
            .bind(i64::try_from(*delta).unwrap_or(i64::MAX))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }
        tx.commit().await
    }

    pub async fn load_metric_totals(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT name, value FROM metric_totals")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(DbError::SqlxError)?;
                let value: i64 = row.try_get("value").map_err(DbError::SqlxError)?;
                Ok((name, value.max(0) as u64))
            })
            .collect()
    }
}

/// Filters for [`Database::list_jobs`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub token_id: Option<String>,
    pub platform: Option<Platform>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

/// Attempt bookkeeping written when a job fails or is retried
#[derive(Debug, Clone, Copy)]
pub struct AttemptUpdate<'a> {
    pub attempts: u32,
    pub error_code: &'a str,
    pub last_error: &'a str,
    pub now: i64,
}

/// A pooled connection inside `BEGIN IMMEDIATE`.
///
/// Dropping it without [`commit`](Self::commit) closes the connection, which
/// discards the open transaction instead of returning it to the pool.
pub struct ImmediateTx {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTx {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await.map_err(DbError::SqlxError)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(Self {
            conn,
            finished: false,
        })
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(DbError::SqlxError)?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(DbError::SqlxError)?;
        self.finished = true;
        Ok(())
    }
}

impl Deref for ImmediateTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl DerefMut for ImmediateTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

/// Token record upsert usable inside a caller's transaction
pub(crate) async fn upsert_token_record_in(
    conn: &mut SqliteConnection,
    record: &TokenRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO token_records (
            token_id, platform, priority, weight, is_active,
            last_scheduled_at, cooldown_until, circuit_breaker_state,
            circuit_breaker_failures, circuit_opened_at, trial_in_flight,
            total_jobs_scheduled, total_jobs_failed, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(token_id) DO UPDATE SET
            is_active = excluded.is_active,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.token_id)
    .bind(record.platform.as_str())
    .bind(record.priority)
    .bind(record.weight)
    .bind(record.is_active)
    .bind(record.last_scheduled_at)
    .bind(record.cooldown_until)
    .bind(record.circuit_breaker_state.as_str())
    .bind(record.circuit_breaker_failures as i64)
    .bind(record.circuit_opened_at)
    .bind(record.trial_in_flight)
    .bind(record.total_jobs_scheduled)
    .bind(record.total_jobs_failed)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

/// Load a token record inside an open transaction
pub(crate) async fn fetch_token_record(
    conn: &mut SqliteConnection,
    token_id: &str,
) -> Result<Option<TokenRecord>> {
    let row = sqlx::query("SELECT * FROM token_records WHERE token_id = ?")
        .bind(token_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    row.as_ref().map(token_record_from_row).transpose()
}

fn parse_column<T>(table: &'static str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        DbError::InvalidRow {
            table,
            reason: e.to_string(),
        }
        .into()
    })
}

fn non_negative(table: &'static str, column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        DbError::InvalidRow {
            table,
            reason: format!("{} out of range: {}", column, value),
        }
        .into()
    })
}

pub(crate) fn token_record_from_row(row: &SqliteRow) -> Result<TokenRecord> {
    let get_i64 = |name: &str| -> Result<i64> { Ok(row.try_get(name).map_err(DbError::SqlxError)?) };
    let get_opt = |name: &str| -> Result<Option<i64>> {
        Ok(row.try_get(name).map_err(DbError::SqlxError)?)
    };

    let platform: String = row.try_get("platform").map_err(DbError::SqlxError)?;
    let state: String = row
        .try_get("circuit_breaker_state")
        .map_err(DbError::SqlxError)?;

    Ok(TokenRecord {
        token_id: row.try_get("token_id").map_err(DbError::SqlxError)?,
        platform: parse_column::<Platform>("token_records", &platform)?,
        priority: get_i64("priority")?,
        weight: get_i64("weight")?,
        is_active: get_i64("is_active")? != 0,
        last_scheduled_at: get_opt("last_scheduled_at")?,
        cooldown_until: get_opt("cooldown_until")?,
        circuit_breaker_state: parse_column::<CircuitState>("token_records", &state)?,
        circuit_breaker_failures: non_negative(
            "token_records",
            "circuit_breaker_failures",
            get_i64("circuit_breaker_failures")?,
        )?,
        circuit_opened_at: get_opt("circuit_opened_at")?,
        trial_in_flight: get_i64("trial_in_flight")? != 0,
        total_jobs_scheduled: get_i64("total_jobs_scheduled")?,
        total_jobs_failed: get_i64("total_jobs_failed")?,
        created_at: get_i64("created_at")?,
        updated_at: get_i64("updated_at")?,
    })
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<PublishJob> {
    let get_opt_str = |name: &str| -> Result<Option<String>> {
        Ok(row.try_get(name).map_err(DbError::SqlxError)?)
    };
    let get_i64 = |name: &str| -> Result<i64> { Ok(row.try_get(name).map_err(DbError::SqlxError)?) };
    let get_opt = |name: &str| -> Result<Option<i64>> {
        Ok(row.try_get(name).map_err(DbError::SqlxError)?)
    };

    let platform: String = row.try_get("platform").map_err(DbError::SqlxError)?;
    let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
    let payload_json: String = row.try_get("payload").map_err(DbError::SqlxError)?;
    let payload: JobPayload =
        serde_json::from_str(&payload_json).map_err(|e| DbError::InvalidRow {
            table: "publish_jobs",
            reason: format!("payload: {}", e),
        })?;

    Ok(PublishJob {
        job_id: row.try_get("job_id").map_err(DbError::SqlxError)?,
        token_id: row.try_get("token_id").map_err(DbError::SqlxError)?,
        platform: parse_column::<Platform>("publish_jobs", &platform)?,
        payload,
        scheduled_at: get_i64("scheduled_at")?,
        status: parse_column::<JobStatus>("publish_jobs", &status)?,
        attempts: non_negative("publish_jobs", "attempts", get_i64("attempts")?)?,
        error_code: get_opt_str("error_code")?,
        last_error: get_opt_str("last_error")?,
        dedupe_key: row.try_get("dedupe_key").map_err(DbError::SqlxError)?,
        external_id: get_opt_str("external_id")?,
        external_url: get_opt_str("external_url")?,
        created_at: get_i64("created_at")?,
        updated_at: get_i64("updated_at")?,
        claimed_at: get_opt("claimed_at")?,
        completed_at: get_opt("completed_at")?,
    })
}
