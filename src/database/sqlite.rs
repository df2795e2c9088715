//! SQLite database implementation.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use uuid::Uuid;

use super::Database;
use super::DatabaseError;
use super::Result;
use super::models::CancelRequest;
use super::models::JobRequest;
use super::models::ServiceStatusRecord;
use crate::backend::Job;
use crate::runner::Inputs;
use crate::status::JobStatus;
use crate::status::ServiceStatus;

/// Default page size for the service status history.
const DEFAULT_PAGE_SIZE: i64 = 100;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Store temporary tables and indices in memory for faster operations.
const SQLITE_TEMP_STORE: &str = "memory";

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Configure 5-second timeout when database is locked to prevent spurious
/// failures.
///
/// The scheduler and the command line write to the same file.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Allocate approximately 8MB for SQLite page cache for improved query
/// performance.
const SQLITE_CACHE_SIZE: &str = "2000";

/// The columns of a job request row.
const REQUEST_COLUMNS: &str =
    "id, service, inputs, status, runner, job_id, work_dir, timestamp, completion_time";

/// The columns of a service status row.
const SERVICE_STATUS_COLUMNS: &str = "id, service, runner, status, message, timestamp";

/// SQLite database implementation.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection from a path.
    ///
    /// Migrations are run upon a successful connection pool being established.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("{}//{}", SQLITE_CONNECTION_PREFIX, path.display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", SQLITE_TEMP_STORE)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT)
            .pragma("cache_size", SQLITE_CACHE_SIZE);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Creates a new SQLite connection from an existing pool.
    ///
    /// This method also runs the embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn create_request(
        &self,
        id: Uuid,
        service: &str,
        inputs: &Inputs,
    ) -> Result<JobRequest> {
        if service.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`service` cannot be empty for a job request",
            )));
        }

        sqlx::query("insert into requests (id, service, inputs, status) values (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(service)
            .bind(serde_json::to_string(inputs)?)
            .bind(JobStatus::Pending)
            .execute(&self.pool)
            .await?;

        let request: JobRequest =
            sqlx::query_as(&format!("select {REQUEST_COLUMNS} from requests where id = ?"))
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?;

        Ok(request)
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<JobRequest>> {
        let request: Option<JobRequest> =
            sqlx::query_as(&format!("select {REQUEST_COLUMNS} from requests where id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(request)
    }

    async fn list_requests(&self, statuses: &[JobStatus]) -> Result<Vec<JobRequest>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query = format!(
            "select {REQUEST_COLUMNS} from requests where status in ({placeholders}) order by \
             timestamp, rowid"
        );

        let mut q = sqlx::query_as(&query);
        for status in statuses {
            q = q.bind(*status);
        }

        let requests: Vec<JobRequest> = q.fetch_all(&self.pool).await?;
        Ok(requests)
    }

    async fn set_accepted(&self, id: Uuid, runner: &str) -> Result<()> {
        sqlx::query("update requests set status = ?, runner = ? where id = ?")
            .bind(JobStatus::Accepted)
            .bind(runner)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_job(&self, id: Uuid, job: &Job) -> Result<()> {
        sqlx::query("update requests set status = ?, job_id = ?, work_dir = ? where id = ?")
            .bind(JobStatus::Queued)
            .bind(&job.id)
            .bind(job.cwd.to_string_lossy().into_owned())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        if status.is_finished() {
            sqlx::query(
                "update requests set status = ?, completion_time = coalesce(completion_time, ?) \
                 where id = ?",
            )
            .bind(status)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("update requests set status = ? where id = ?")
                .bind(status)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn create_cancel_request(&self, request_id: Uuid) -> Result<CancelRequest> {
        let result = sqlx::query("insert into cancel_requests (request_id) values (?)")
            .bind(request_id.to_string())
            .execute(&self.pool)
            .await?;

        let request: CancelRequest = sqlx::query_as(
            "select id, request_id, created_at from cancel_requests where id = ?",
        )
        .bind(result.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;

        Ok(request)
    }

    async fn list_cancel_requests(&self) -> Result<Vec<CancelRequest>> {
        let requests: Vec<CancelRequest> =
            sqlx::query_as("select id, request_id, created_at from cancel_requests order by id")
                .fetch_all(&self.pool)
                .await?;

        Ok(requests)
    }

    async fn delete_cancel_request(&self, id: i64) -> Result<()> {
        sqlx::query("delete from cancel_requests where id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_service_status(
        &self,
        service: &str,
        runner: &str,
        status: ServiceStatus,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ServiceStatusRecord> {
        let result = sqlx::query(
            "insert into service_status (service, runner, status, message, timestamp) values (?, \
             ?, ?, ?, ?)",
        )
        .bind(service)
        .bind(runner)
        .bind(status)
        .bind(message)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        let record: ServiceStatusRecord = sqlx::query_as(&format!(
            "select {SERVICE_STATUS_COLUMNS} from service_status where id = ?"
        ))
        .bind(result.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_current_service_statuses(&self) -> Result<Vec<ServiceStatusRecord>> {
        let records: Vec<ServiceStatusRecord> = sqlx::query_as(&format!(
            "select {SERVICE_STATUS_COLUMNS} from service_status s where id = (select id from \
             service_status t where t.service = s.service and t.runner = s.runner order by \
             timestamp desc, id desc limit 1) order by service, runner"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_service_statuses(
        &self,
        service: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<ServiceStatusRecord>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);

        let records: Vec<ServiceStatusRecord> = if let Some(service) = service {
            sqlx::query_as(&format!(
                "select {SERVICE_STATUS_COLUMNS} from service_status where service = ? order by \
                 timestamp desc, id desc limit ?"
            ))
            .bind(service)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "select {SERVICE_STATUS_COLUMNS} from service_status order by timestamp desc, id \
                 desc limit ?"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(records)
    }
}
