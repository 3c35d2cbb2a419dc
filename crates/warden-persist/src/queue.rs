//! SQLite job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{Executor, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;
use warden_queue::{
    GarbageCollector, JobFilter, JobId, JobRow, JobStatus, JobStore, NewJob, OrderBy, QueueError,
    QueueStat,
};

const COLUMNS: &str = "id, type, reference, args, scheduled_at, next_run_at, last_run_at, \
                       locked_at, locked_until, locked_by, error_count, successful, finished_at";

/// Insert a new job through `executor`, which may be the pool or an open
/// transaction, so the enqueue commits together with the caller's writes.
///
/// Fails with [`QueueError::Duplicate`] if `(type, reference)` exists.
pub async fn enqueue<'e, E>(
    executor: E,
    job: NewJob,
    now: DateTime<Utc>,
) -> Result<JobRow, QueueError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let args = serde_json::to_string(&job.args)?;
    let sql = format!(
        "INSERT INTO jobs (id, type, reference, args, scheduled_at, next_run_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
        COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(&job.job_type)
        .bind(&job.reference)
        .bind(args)
        .bind(now.timestamp_millis())
        .bind(job.run_at.timestamp_millis())
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => QueueError::Duplicate {
                job_type: job.job_type.clone(),
                reference: job.reference.clone(),
            },
            e => map_sqlx_error(e),
        })?;

    decode_row(&row)
}

/// Delete finished rows past the collector's retention through `executor`.
///
/// Unfinished rows are never touched. When other tables reference jobs, the
/// caller sequences this against their collection inside one transaction.
pub async fn garbage_collect<'e, E>(
    executor: E,
    now: DateTime<Utc>,
    collector: &GarbageCollector,
) -> Result<u64, QueueError>
where
    E: Executor<'e, Database = Sqlite>,
{
    delete_finished_before(executor, collector.cutoff(now)).await
}

async fn delete_finished_before<'e, E>(
    executor: E,
    older_than: DateTime<Utc>,
) -> Result<u64, QueueError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM jobs WHERE finished_at IS NOT NULL AND finished_at < ?")
        .bind(older_than.timestamp_millis())
        .execute(executor)
        .await
        .map_err(map_sqlx_error)?;

    Ok(result.rows_affected())
}

/// Durable queue backend using SQLite
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The connection pool, for callers enqueueing inside their own
    /// transactions.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRow, QueueError> {
        enqueue(&self.pool, job, now).await
    }

    async fn claim(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRow>, QueueError> {
        let types = if types.is_empty() {
            None
        } else {
            Some(serde_json::to_string(types)?)
        };
        let until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // jobs_waiting index backs the inner select
        let sql = format!(
            r#"
            UPDATE jobs
            SET locked_at = ?1,
                locked_until = ?2,
                locked_by = ?3,
                last_run_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE successful IS NULL
                  AND next_run_at <= ?1
                  AND (locked_until IS NULL OR locked_until <= ?1)
                  AND (?4 IS NULL OR type IN (SELECT value FROM json_each(?4)))
                ORDER BY next_run_at ASC, scheduled_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(until.timestamp_millis())
            .bind(worker)
            .bind(types)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn release(&self, row: &JobRow) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL,
                locked_until = NULL,
                locked_by = NULL,
                next_run_at = ?,
                error_count = ?,
                successful = ?,
                finished_at = ?
            WHERE id = ?
              AND successful IS NULL
              AND (locked_by = ? OR locked_by IS NULL)
            "#,
        )
        .bind(row.next_run_at.timestamp_millis())
        .bind(i64::from(row.error_count))
        .bind(row.successful)
        .bind(row.finished_at.map(|t| t.timestamp_millis()))
        .bind(row.id.to_string())
        .bind(row.locked_by.as_deref())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            // distinguish a vanished row from one re-claimed or finished by another worker
            self.by_id(row.id).await?;
            return Err(QueueError::LockLost(row.id));
        }
        Ok(())
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL,
                locked_until = NULL,
                locked_by = NULL
            WHERE (locked_at IS NOT NULL OR locked_by IS NOT NULL)
              AND locked_until <= ?
            "#,
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        delete_finished_before(&self.pool, older_than).await
    }

    async fn by_id(&self, id: JobId) -> Result<JobRow, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(QueueError::NotFound)?;

        decode_row(&row)
    }

    async fn by_reference(&self, job_type: &str, reference: &str) -> Result<JobRow, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE type = ? AND reference = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_type)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(QueueError::NotFound)?;

        decode_row(&row)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRow>, QueueError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", COLUMNS));

        if !filter.types.is_empty() {
            qb.push(" AND type IN (");
            let mut set = qb.separated(", ");
            for ty in &filter.types {
                set.push_bind(ty);
            }
            set.push_unseparated(")");
        }
        if !filter.references.is_empty() {
            qb.push(" AND reference IN (");
            let mut set = qb.separated(", ");
            for reference in &filter.references {
                set.push_bind(reference);
            }
            set.push_unseparated(")");
        }
        match filter.status {
            None => {}
            Some(JobStatus::Queued) => {
                qb.push(" AND successful IS NULL AND locked_by IS NULL");
            }
            Some(JobStatus::Running) => {
                qb.push(" AND successful IS NULL AND locked_by IS NOT NULL");
            }
            Some(JobStatus::Done) => {
                qb.push(" AND successful = 1");
            }
            Some(JobStatus::Failed) => {
                qb.push(" AND successful = 0");
            }
        }

        let order = match filter.order_by {
            OrderBy::Id => "id",
            OrderBy::ScheduledAt => "scheduled_at",
            OrderBy::LockedAt => "locked_at",
            OrderBy::NextRunAt => "next_run_at",
            OrderBy::FinishedAt => "finished_at",
            OrderBy::Reference => "reference",
        };
        qb.push(format!(" ORDER BY {} DESC LIMIT ", order));
        qb.push_bind(i64::try_from(filter.limit).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn are_ready(
        &self,
        references: &[String],
        max_age: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(successful IS NOT NULL OR scheduled_at < ?), 0) AS ready
            FROM jobs
            WHERE reference IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(max_age.timestamp_millis())
        .bind(serde_json::to_string(references)?)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let total: i64 = row.try_get("total").map_err(map_sqlx_error)?;
        let ready: i64 = row.try_get("ready").map_err(map_sqlx_error)?;

        if total == 0 {
            Ok(references.is_empty())
        } else {
            Ok(ready == total)
        }
    }

    async fn stats(&self) -> Result<Vec<QueueStat>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT
                type,
                successful,
                locked_by IS NOT NULL AS locked,
                COUNT(*) AS job_count
            FROM jobs
            GROUP BY type, successful, locked
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut counts: BTreeMap<(String, &'static str), u64> = BTreeMap::new();
        for row in rows {
            let job_type: String = row.try_get("type").map_err(map_sqlx_error)?;
            let successful: Option<bool> = row.try_get("successful").map_err(map_sqlx_error)?;
            let locked: bool = row.try_get("locked").map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("job_count").map_err(map_sqlx_error)?;

            let state = match successful {
                Some(true) => JobStatus::Done,
                Some(false) => JobStatus::Failed,
                None if locked => JobStatus::Running,
                None => JobStatus::Queued,
            };
            *counts.entry((job_type, state.as_state())).or_default() += count as u64;
        }

        Ok(counts
            .into_iter()
            .map(|((job_type, state), count)| QueueStat {
                job_type,
                state: state.to_string(),
                count,
            })
            .collect())
    }
}

pub(crate) fn map_sqlx_error(e: sqlx::Error) -> QueueError {
    match e {
        sqlx::Error::PoolClosed => QueueError::Closed,
        sqlx::Error::RowNotFound => QueueError::NotFound,
        e => QueueError::Backend(e.to_string()),
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| QueueError::Backend(format!("Invalid timestamp in DB: {}", millis)))
}

fn optional_timestamp(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    millis.map(timestamp).transpose()
}

fn decode_row(row: &SqliteRow) -> Result<JobRow, QueueError> {
    let id: String = row.try_get("id").map_err(map_sqlx_error)?;
    let id = Uuid::parse_str(&id).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;
    let args: String = row.try_get("args").map_err(map_sqlx_error)?;
    let error_count: i64 = row.try_get("error_count").map_err(map_sqlx_error)?;

    Ok(JobRow {
        id,
        job_type: row.try_get("type").map_err(map_sqlx_error)?,
        reference: row.try_get("reference").map_err(map_sqlx_error)?,
        args: serde_json::from_str(&args)?,
        scheduled_at: timestamp(row.try_get("scheduled_at").map_err(map_sqlx_error)?)?,
        next_run_at: timestamp(row.try_get("next_run_at").map_err(map_sqlx_error)?)?,
        last_run_at: optional_timestamp(row.try_get("last_run_at").map_err(map_sqlx_error)?)?,
        locked_at: optional_timestamp(row.try_get("locked_at").map_err(map_sqlx_error)?)?,
        locked_until: optional_timestamp(row.try_get("locked_until").map_err(map_sqlx_error)?)?,
        locked_by: row.try_get("locked_by").map_err(map_sqlx_error)?,
        error_count: u32::try_from(error_count)
            .map_err(|_| QueueError::Backend("Invalid error_count in DB".into()))?,
        successful: row.try_get("successful").map_err(map_sqlx_error)?,
        finished_at: optional_timestamp(row.try_get("finished_at").map_err(map_sqlx_error)?)?,
    })
}
