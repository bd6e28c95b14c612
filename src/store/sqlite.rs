use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, instrument};

use super::{JobPage, JobStore, ListFilter};
use crate::error::{Result, SyncError};
use crate::model::{
    ChannelKind, ChannelResult, ErrorClass, JobId, JobStatus, JobSummary, Outcome, SyncJob,
};

pub type Pool = SqlitePool;

const JOB_COLUMNS: &str = "job_id, document_ref, correlation_id, status, created_at, \
                           scheduled_for, started_at, completed_at, parent_job_id";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = prepare_sqlite_url(database_url);
    let in_memory = url.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    // A shared-cache in-memory database locks whole tables; one connection
    // keeps writers queued on the pool instead.
    let pool = if in_memory {
        // The database lives and dies with its only connection.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    }
    .connect_with(options)
    .await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| SyncError::Storage(e.into()))?;
    Ok(())
}

fn corrupt(job_id: &str, what: &str, value: &str) -> SyncError {
    SyncError::Corrupt(format!("job {}: bad {} `{}`", job_id, what, value))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse().map_err(|_| corrupt(raw, "job id", raw))
}

fn result_from_row(job_id: &str, row: &SqliteRow) -> Result<(ChannelKind, ChannelResult)> {
    let channel: String = row.try_get("channel")?;
    let channel = channel
        .parse::<ChannelKind>()
        .map_err(|_| corrupt(job_id, "channel", &channel))?;
    let outcome: String = row.try_get("outcome")?;
    let outcome = Outcome::parse_outcome(&outcome).ok_or_else(|| corrupt(job_id, "outcome", &outcome))?;
    let error_class = match row.try_get::<Option<String>, _>("error_class")? {
        Some(raw) => Some(ErrorClass::parse_class(&raw).ok_or_else(|| corrupt(job_id, "error class", &raw))?),
        None => None,
    };
    let attempts: i64 = row.try_get("attempts")?;

    Ok((
        channel,
        ChannelResult {
            outcome,
            delivery_ref: row.try_get("delivery_ref")?,
            error: row.try_get("error")?,
            error_class,
            attempts: attempts.max(0) as u32,
            correlation_id: row.try_get("correlation_id")?,
            recorded_at: row.try_get("recorded_at")?,
        },
    ))
}

fn summary_from_row(row: &SqliteRow) -> Result<JobSummary> {
    let key: String = row.try_get("job_id")?;
    let channels = row
        .try_get::<Option<String>, _>("channels")?
        .unwrap_or_default()
        .split(',')
        .filter(|c| !c.is_empty())
        .map(|c| c.parse::<ChannelKind>().map_err(|_| corrupt(&key, "channel", c)))
        .collect::<Result<BTreeSet<_>>>()?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse_status(&status).ok_or_else(|| corrupt(&key, "status", &status))?;
    let parent_job_id = match row.try_get::<Option<String>, _>("parent_job_id")? {
        Some(raw) => Some(parse_job_id(&raw)?),
        None => None,
    };

    Ok(JobSummary {
        job_id: parse_job_id(&key)?,
        document_ref: row.try_get("document_ref")?,
        status,
        channels,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        parent_job_id,
    })
}

async fn load_job(conn: &mut SqliteConnection, job_id: JobId) -> Result<Option<SyncJob>> {
    let key = job_id.to_string();
    let row = sqlx::query(&format!("SELECT {} FROM sync_jobs WHERE job_id = ?", JOB_COLUMNS))
        .bind(&key)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let channel_names: Vec<String> =
        sqlx::query_scalar("SELECT channel FROM job_channels WHERE job_id = ?")
            .bind(&key)
            .fetch_all(&mut *conn)
            .await?;
    let channels = channel_names
        .iter()
        .map(|c| c.parse::<ChannelKind>().map_err(|_| corrupt(&key, "channel", c)))
        .collect::<Result<BTreeSet<_>>>()?;

    let result_rows = sqlx::query(
        "SELECT channel, outcome, delivery_ref, error, error_class, attempts, correlation_id, recorded_at \
         FROM channel_results WHERE job_id = ?",
    )
    .bind(&key)
    .fetch_all(&mut *conn)
    .await?;
    let channel_results = result_rows
        .iter()
        .map(|r| result_from_row(&key, r))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let status: String = row.try_get("status")?;
    let status = JobStatus::parse_status(&status).ok_or_else(|| corrupt(&key, "status", &status))?;
    let parent_job_id = match row.try_get::<Option<String>, _>("parent_job_id")? {
        Some(raw) => Some(parse_job_id(&raw)?),
        None => None,
    };

    Ok(Some(SyncJob {
        job_id,
        document_ref: row.try_get("document_ref")?,
        channels,
        correlation_id: row.try_get("correlation_id")?,
        status,
        created_at: row.try_get("created_at")?,
        scheduled_for: row.try_get("scheduled_for")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        channel_results,
        parent_job_id,
    }))
}

async fn persist_lifecycle(conn: &mut SqliteConnection, job: &SyncJob) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET status = ?, started_at = ?, completed_at = ? WHERE job_id = ?")
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.job_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Job store backed by SQLite.
///
/// Writers queue on one in-process lock, and every write transaction opens
/// with a write statement so it takes SQLite's write lock up front. A
/// transaction never reads a snapshot it later has to upgrade, which SQLite
/// would reject with `SQLITE_BUSY` regardless of `busy_timeout`. Writers in
/// other processes are waited for through `busy_timeout`.
pub struct SqliteJobStore {
    pool: Pool,
    write_lock: tokio::sync::Mutex<()>,
}

impl SqliteJobStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Begin a transaction already holding the database write lock on
    /// `job_id`'s row. `Ok(None)` when the job does not exist.
    async fn begin_write(&self, job_id: JobId) -> Result<Option<Transaction<'static, Sqlite>>> {
        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query("UPDATE sync_jobs SET status = status WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        Ok(Some(tx))
    }

    async fn transition(
        &self,
        job_id: JobId,
        apply: impl FnOnce(&mut SyncJob) -> Result<Option<(ChannelKind, ChannelResult)>>,
    ) -> Result<SyncJob> {
        let _writer = self.write_lock.lock().await;

        let mut tx = self
            .begin_write(job_id)
            .await?
            .ok_or(SyncError::NotFound(job_id))?;
        let mut job = load_job(&mut tx, job_id)
            .await?
            .ok_or(SyncError::NotFound(job_id))?;
        if let Some((channel, result)) = apply(&mut job)? {
            sqlx::query(
                "INSERT OR REPLACE INTO channel_results \
                 (job_id, channel, outcome, delivery_ref, error, error_class, attempts, correlation_id, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(job_id.to_string())
            .bind(channel.as_str())
            .bind(result.outcome.as_str())
            .bind(&result.delivery_ref)
            .bind(&result.error)
            .bind(result.error_class.map(|c| c.as_str()))
            .bind(result.attempts as i64)
            .bind(&result.correlation_id)
            .bind(result.recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        persist_lifecycle(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(job_id = %job.job_id))]
    async fn create(&self, job: &SyncJob) -> Result<()> {
        let key = job.job_id.to_string();
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // The insert is the first statement so the write lock is taken up front.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO sync_jobs \
             (job_id, document_ref, correlation_id, status, created_at, scheduled_for, started_at, completed_at, parent_job_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key)
        .bind(&job.document_ref)
        .bind(&job.correlation_id)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.parent_job_id.map(|p| p.to_string()))
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(SyncError::DuplicateId(job.job_id));
        }

        for channel in &job.channels {
            sqlx::query("INSERT INTO job_channels (job_id, channel) VALUES (?, ?)")
                .bind(&key)
                .bind(channel.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<SyncJob> {
        let mut conn = self.pool.acquire().await?;
        load_job(&mut conn, job_id)
            .await?
            .ok_or(SyncError::NotFound(job_id))
    }

    #[instrument(skip_all)]
    async fn list(&self, filter: &ListFilter) -> Result<JobPage> {
        let limit = filter.effective_limit();
        let status = filter.status.map(|s| s.as_str());
        let channel = filter.channel.map(|c| c.as_str());
        let predicate = "(? IS NULL OR j.status = ?) AND (? IS NULL OR EXISTS \
                         (SELECT 1 FROM job_channels c WHERE c.job_id = j.job_id AND c.channel = ?))";

        let mut conn = self.pool.acquire().await?;
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM sync_jobs j WHERE {}",
            predicate
        ))
        .bind(status)
        .bind(status)
        .bind(channel)
        .bind(channel)
        .fetch_one(&mut *conn)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT j.job_id, j.document_ref, j.correlation_id, j.status, j.created_at, \
             j.completed_at, j.parent_job_id, \
             (SELECT GROUP_CONCAT(c.channel, ',') FROM job_channels c WHERE c.job_id = j.job_id) AS channels \
             FROM sync_jobs j WHERE {} ORDER BY j.created_at DESC, j.seq DESC LIMIT ? OFFSET ?",
            predicate
        ))
        .bind(status)
        .bind(status)
        .bind(channel)
        .bind(channel)
        .bind(limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
        let jobs = rows
            .iter()
            .map(summary_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
            limit,
            offset: filter.offset,
        })
    }

    #[instrument(skip_all, fields(%job_id, %channel))]
    async fn update_result(
        &self,
        job_id: JobId,
        channel: ChannelKind,
        result: ChannelResult,
    ) -> Result<JobStatus> {
        let job = self
            .transition(job_id, |job| {
                job.apply_result(channel, result.clone())
                    .map(|_| Some((channel, result)))
            })
            .await
            .map_err(|err| {
                if matches!(err, SyncError::InvalidState { .. }) {
                    error!(%err, "rejected channel result for settled job");
                }
                err
            })?;
        Ok(job.status)
    }

    #[instrument(skip_all, fields(%job_id))]
    async fn mark_started(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, |job| job.start(at).map(|_| None))
            .await
            .map(|_| ())
    }

    #[instrument(skip_all, fields(%job_id))]
    async fn cancel(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, |job| job.cancel(at).map(|_| None))
            .await
            .map(|_| ())
    }

    async fn snapshot(&self) -> Result<Vec<SyncJob>> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT job_id FROM sync_jobs ORDER BY seq")
            .fetch_all(&mut *conn)
            .await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            if let Some(job) = load_job(&mut conn, parse_job_id(&raw)?).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_url_normalizes_file_paths() {
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested").join("relay.db");
        let url = prepare_sqlite_url(&format!("sqlite:{}?mode=rwc", db.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(db.parent().unwrap().exists());
    }
}
