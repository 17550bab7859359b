//! PostgreSQL job store implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::{Duration, Instant};
use tracing::info;

use crate::job::{JobRecord, JobStatus, Priority};
use crate::storage::{
    config::PostgresConfig,
    error::{StorageError, StorageResult},
    traits::JobStore,
};

const JOB_COLUMNS: &str = "id, owner_id, connection_id, status, priority, settings, created_at, \
     started_at, completed_at, error_message, retry_count, last_retry_at, queue_name, integrity_hash";

/// PostgreSQL job store
pub struct PostgresJobStore {
    pool: PgPool,
    schema: String,
}

impl PostgresJobStore {
    /// Connect and bootstrap the schema
    pub async fn new(config: &PostgresConfig, timeout: Duration) -> StorageResult<Self> {
        info!("Initializing PostgreSQL job store");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(timeout)
            .idle_timeout(Some(Duration::from_secs(600)))
            .test_before_acquire(true)
            .connect(&config.connection_string)
            .await
            .map_err(|e| StorageError::connection(format!("Failed to connect to database: {}", e)))?;

        let store = Self {
            pool,
            schema: config.schema.clone(),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        info!("Initializing PostgreSQL schema: {}", self.schema);

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id BIGINT PRIMARY KEY,
                    owner_id BIGINT NOT NULL
                )
                "#,
                self.table("connections")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(64) PRIMARY KEY,
                    owner_id BIGINT NOT NULL,
                    connection_id BIGINT NOT NULL,
                    status VARCHAR(20) NOT NULL,
                    priority VARCHAR(20) NOT NULL,
                    settings TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    error_message TEXT NOT NULL DEFAULT '[]',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_retry_at TIMESTAMPTZ,
                    queue_name VARCHAR(255) NOT NULL,
                    integrity_hash VARCHAR(64)
                )
                "#,
                self.table("jobs")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON {} (status, created_at)",
                self.table("jobs")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Register a target connection as belonging to `owner_id`
    pub async fn add_connection(&self, connection_id: i64, owner_id: i64) -> StorageResult<()> {
        let query = format!(
            "INSERT INTO {} (id, owner_id) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET owner_id = EXCLUDED.owner_id",
            self.table("connections")
        );
        sqlx::query(&query)
            .bind(connection_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_job(row: &PgRow) -> StorageResult<JobRecord> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let settings: String = row.try_get("settings")?;
    let errors: String = row.try_get("error_message")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(JobRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        connection_id: row.try_get("connection_id")?,
        status: status
            .parse::<JobStatus>()
            .map_err(StorageError::serialization)?,
        priority: priority
            .parse::<Priority>()
            .map_err(StorageError::serialization)?,
        settings: serde_json::from_str(&settings)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: serde_json::from_str(&errors)?,
        retry_count: retry_count.max(0) as u32,
        last_retry_at: row.try_get("last_retry_at")?,
        queue_name: row.try_get("queue_name")?,
        integrity_hash: row.try_get("integrity_hash")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &JobRecord) -> StorageResult<()> {
        let query = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            self.table("jobs"),
            JOB_COLUMNS
        );
        sqlx::query(&query)
            .bind(&job.id)
            .bind(job.owner_id)
            .bind(job.connection_id)
            .bind(job.status.as_str())
            .bind(job.priority.as_str())
            .bind(serde_json::to_string(&job.settings)?)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(serde_json::to_string(&job.error_message)?)
            .bind(job.retry_count as i32)
            .bind(job.last_retry_at)
            .bind(&job.queue_name)
            .bind(&job.integrity_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<JobRecord>> {
        let query = format!("SELECT {} FROM {} WHERE id = $1", JOB_COLUMNS, self.table("jobs"));
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update(&self, job: &JobRecord) -> StorageResult<()> {
        let query = format!(
            "UPDATE {} SET owner_id = $2, connection_id = $3, status = $4, priority = $5, \
             settings = $6, created_at = $7, started_at = $8, completed_at = $9, \
             error_message = $10, retry_count = $11, last_retry_at = $12, queue_name = $13, \
             integrity_hash = $14 WHERE id = $1",
            self.table("jobs")
        );
        let result = sqlx::query(&query)
            .bind(&job.id)
            .bind(job.owner_id)
            .bind(job.connection_id)
            .bind(job.status.as_str())
            .bind(job.priority.as_str())
            .bind(serde_json::to_string(&job.settings)?)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(serde_json::to_string(&job.error_message)?)
            .bind(job.retry_count as i32)
            .bind(job.last_retry_at)
            .bind(&job.queue_name)
            .bind(&job.integrity_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let query = format!("SELECT 1 FROM {} WHERE id = $1", self.table("jobs"));
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn connection_owner(&self, connection_id: i64) -> StorageResult<Option<i64>> {
        let query = format!(
            "SELECT owner_id FROM {} WHERE id = $1",
            self.table("connections")
        );
        let row = sqlx::query(&query)
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("owner_id")?),
            None => None,
        })
    }

    async fn connections_for_owner(&self, owner_id: i64) -> StorageResult<Vec<i64>> {
        let query = format!(
            "SELECT id FROM {} WHERE owner_id = $1 ORDER BY id",
            self.table("connections")
        );
        let rows = sqlx::query(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StorageError::from))
            .collect()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        let query = format!(
            "SELECT {} FROM {} WHERE status = $1 AND ($2::timestamptz IS NULL OR created_at >= $2) \
             ORDER BY created_at DESC LIMIT $3",
            JOB_COLUMNS,
            self.table("jobs")
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(since)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> StorageResult<Vec<JobRecord>> {
        let query = format!(
            "SELECT {} FROM {} WHERE status = $1 AND started_at < $2",
            JOB_COLUMNS,
            self.table("jobs")
        );
        let rows = sqlx::query(&query)
            .bind(JobStatus::Running.as_str())
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn count_by_status_since(
        &self,
        status: JobStatus,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let column = if status.is_terminal() {
            "COALESCE(completed_at, created_at)"
        } else {
            "created_at"
        };
        let query = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE status = $1 AND {} >= $2",
            self.table("jobs"),
            column
        );
        let row = sqlx::query(&query)
            .bind(status.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count.max(0) as u64)
    }

    async fn processing_times_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<f64>> {
        let query = format!(
            "SELECT EXTRACT(EPOCH FROM (completed_at - started_at))::float8 AS secs FROM {} \
             WHERE status = $1 AND completed_at >= $2 AND started_at IS NOT NULL",
            self.table("jobs")
        );
        let rows = sqlx::query(&query)
            .bind(JobStatus::Completed.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<f64, _>("secs").map_err(StorageError::from))
            .collect()
    }

    async fn ping(&self) -> StorageResult<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(start.elapsed())
    }
}
