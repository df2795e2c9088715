//! Models that back database entities.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::backend::Job;
use crate::runner::Inputs;
use crate::status::JobStatus;
use crate::status::ServiceStatus;

/// A request to run a service with a set of inputs.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct JobRequest {
    /// Unique identifier.
    #[sqlx(try_from = "String")]
    pub id: Uuid,
    /// The name of the service.
    pub service: String,
    /// The inputs by argument ID.
    #[sqlx(json)]
    pub inputs: Inputs,
    /// The current status.
    pub status: JobStatus,
    /// The runner chosen for the request.
    pub runner: Option<String>,
    /// The backend identifier of the started job.
    pub job_id: Option<String>,
    /// The working directory of the started job.
    pub work_dir: Option<String>,
    /// Timestamp when the request was created.
    pub timestamp: DateTime<Utc>,
    /// Timestamp when the request reached a finished status.
    pub completion_time: Option<DateTime<Utc>>,
}

impl JobRequest {
    /// Gets the job of the request if it was started.
    pub fn job(&self) -> Option<Job> {
        match (&self.job_id, &self.work_dir) {
            (Some(id), Some(cwd)) => Some(Job::new(id.clone(), PathBuf::from(cwd))),
            _ => None,
        }
    }
}

/// A pending cancellation of a job request.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CancelRequest {
    /// Auto-increment ID.
    pub id: i64,
    /// The job request to cancel.
    #[sqlx(try_from = "String")]
    pub request_id: Uuid,
    /// Timestamp when the cancellation was requested.
    pub created_at: DateTime<Utc>,
}

/// The result of one service test.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServiceStatusRecord {
    /// Auto-increment ID.
    pub id: i64,
    /// The name of the service.
    pub service: String,
    /// The name of the runner.
    pub runner: String,
    /// The determined status.
    pub status: ServiceStatus,
    /// A human readable explanation.
    pub message: String,
    /// Timestamp of the test.
    pub timestamp: DateTime<Utc>,
}
