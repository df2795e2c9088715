//! Database abstraction layer.
//!
//! The database holds the job requests, the pending cancellations and the
//! history of service health tests.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::Job;
use crate::runner::Inputs;
use crate::status::JobStatus;
use crate::status::ServiceStatus;

pub mod models;
pub mod sqlite;

pub use models::CancelRequest;
pub use models::JobRequest;
pub use models::ServiceStatusRecord;
pub use sqlite::SqliteDatabase;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// The operations needed by the scheduler and the command line.
#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    /// Creates a new pending job request.
    async fn create_request(&self, id: Uuid, service: &str, inputs: &Inputs)
    -> Result<JobRequest>;

    /// Gets a job request by ID.
    async fn get_request(&self, id: Uuid) -> Result<Option<JobRequest>>;

    /// Lists the job requests in any of the given statuses, oldest first.
    async fn list_requests(&self, statuses: &[JobStatus]) -> Result<Vec<JobRequest>>;

    /// Marks a request as accepted by a runner.
    async fn set_accepted(&self, id: Uuid, runner: &str) -> Result<()>;

    /// Records the job of a started request and marks it as queued.
    async fn set_job(&self, id: Uuid, job: &Job) -> Result<()>;

    /// Updates the status of a request.
    ///
    /// The completion time is set when the status is finished.
    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<()>;

    /// Creates a cancel request for a job request.
    async fn create_cancel_request(&self, request_id: Uuid) -> Result<CancelRequest>;

    /// Lists the pending cancel requests, oldest first.
    async fn list_cancel_requests(&self) -> Result<Vec<CancelRequest>>;

    /// Deletes a cancel request.
    async fn delete_cancel_request(&self, id: i64) -> Result<()>;

    /// Records the result of a service test.
    async fn insert_service_status(
        &self,
        service: &str,
        runner: &str,
        status: ServiceStatus,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ServiceStatusRecord>;

    /// Lists the most recent status of every tested service runner.
    async fn list_current_service_statuses(&self) -> Result<Vec<ServiceStatusRecord>>;

    /// Lists the status history, newest first.
    async fn list_service_statuses(
        &self,
        service: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<ServiceStatusRecord>>;
}
