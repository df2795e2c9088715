//! Job and service status values shared by the scheduler, the backends and
//! the local queue wire protocol.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sqlx::Type as SqlxType;

/// The lifecycle state of a job request or a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The request has been created but no runner has been chosen yet.
    Pending,
    /// No runner accepted the request.
    Rejected,
    /// A runner was chosen and the job is waiting to be submitted.
    Accepted,
    /// The job was submitted and waits for execution.
    Queued,
    /// The job is executing.
    Running,
    /// The job finished successfully.
    Completed,
    /// The job was stopped before it could finish.
    Interrupted,
    /// The job was removed from the execution system.
    Deleted,
    /// The job exited with a non-zero code.
    Failed,
    /// The job could not run due to a system error.
    Error,
    /// The state of the job can't be determined.
    Unknown,
    /// A cancellation was sent and the backend has not confirmed it yet.
    Cancelling,
}

impl JobStatus {
    /// All of the job statuses.
    pub const ALL: [JobStatus; 12] = [
        JobStatus::Pending,
        JobStatus::Rejected,
        JobStatus::Accepted,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Interrupted,
        JobStatus::Deleted,
        JobStatus::Failed,
        JobStatus::Error,
        JobStatus::Unknown,
        JobStatus::Cancelling,
    ];

    /// Returns `true` if no further transitions are expected.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Rejected
                | Self::Completed
                | Self::Interrupted
                | Self::Deleted
                | Self::Failed
                | Self::Error
        )
    }

    /// Classifies a process exit code.
    ///
    /// Negative codes are signals and `127` is the shell's "command not
    /// found".
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Completed,
            127 => Self::Error,
            c if c < 0 => Self::Interrupted,
            _ => Self::Failed,
        }
    }

    /// Gets the canonical name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Rejected => "REJECTED",
            Self::Accepted => "ACCEPTED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Interrupted => "INTERRUPTED",
            Self::Deleted => "DELETED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
            Self::Cancelling => "CANCELLING",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid job status: {s}"))
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

/// The health of a service runner as determined by its periodic test job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// The runner has not been tested yet.
    Undefined,
    /// The test job completed.
    Ok,
    /// The test job timed out or was removed.
    Warning,
    /// The test job could not run or did not complete successfully.
    Down,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "UNDEFINED"),
            Self::Ok => write!(f, "OK"),
            Self::Warning => write!(f, "WARNING"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDEFINED" => Ok(Self::Undefined),
            "OK" => Ok(Self::Ok),
            "WARNING" => Ok(Self::Warning),
            "DOWN" => Ok(Self::Down),
            _ => Err(format!("invalid service status: {s}")),
        }
    }
}

impl TryFrom<String> for ServiceStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}
