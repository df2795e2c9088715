//! Implementation of job execution backends.
//!
//! A backend submits commands, reports the status of the jobs it submitted
//! and cancels them. Every batched operation answers in the order of its
//! input.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::config::BackendConfig;
use crate::config::LocalQueueConfig;
use crate::status::JobStatus;

pub mod grid_engine;
pub mod local_queue;
pub mod lsf;
pub mod script;
pub mod shell;
pub mod slurm;

pub use grid_engine::GridEngineBackend;
pub use local_queue::LocalQueueBackend;
pub use lsf::LsfBackend;
pub use shell::ShellBackend;
pub use slurm::SlurmBackend;

/// A command ready to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program and its arguments.
    pub args: Vec<String>,
    /// The working directory.
    pub cwd: PathBuf,
    /// The complete environment of the command.
    pub env: IndexMap<String, String>,
}

impl Command {
    /// Renders the arguments as a single shell-quoted command line.
    pub fn shell_line(&self) -> Result<String> {
        shlex::try_join(self.args.iter().map(String::as_str))
            .map_err(|e| {
                anyhow::anyhow!("failed to quote command `{args:?}`: {e}", args = self.args)
            })
    }
}

/// A handle to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    /// The backend-specific job identifier.
    pub id: String,
    /// The working directory of the job.
    pub cwd: PathBuf,
}

impl Job {
    /// Constructs a new job handle.
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            cwd: cwd.into(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{id} ({cwd})", id = self.id, cwd = self.cwd.display())
    }
}

/// A job execution backend.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Gets the name of the backend for logging.
    fn name(&self) -> &'static str;

    /// Submits the commands and returns one job per command, in order.
    ///
    /// An error aborts the whole batch and the jobs submitted before it are
    /// cancelled.
    async fn start(&self, commands: &[Command]) -> Result<Vec<Job>>;

    /// Gets the status of each job.
    async fn status(&self, jobs: &[Job]) -> Result<Vec<JobStatus>>;

    /// Requests cancellation of the jobs.
    ///
    /// Does not wait for the jobs to stop.
    async fn cancel(&self, jobs: &[Job]) -> Result<()>;
}

/// Cancels the jobs of a batch that failed part way through.
///
/// Returns `error`, the failure that stopped the batch.
pub(crate) async fn abandon_batch(
    backend: &dyn Backend,
    jobs: &[Job],
    error: anyhow::Error,
) -> anyhow::Error {
    if jobs.is_empty() {
        return error;
    }

    warn!(
        backend = backend.name(),
        "cancelling {count} job(s) of a failed batch: {error:#}",
        count = jobs.len()
    );
    if let Err(e) = backend.cancel(jobs).await {
        warn!(
            backend = backend.name(),
            "failed to cancel the jobs of a failed batch: {e:#}"
        );
    }

    error
}

/// Creates the backend described by a runner configuration.
pub fn create_backend(
    config: &BackendConfig,
    local_queue: &LocalQueueConfig,
) -> Result<Arc<dyn Backend>> {
    Ok(match config {
        BackendConfig::Shell => Arc::new(ShellBackend::new()),
        BackendConfig::LocalQueue(config) => {
            let address = config
                .address
                .clone()
                .unwrap_or_else(|| local_queue.address.clone());
            Arc::new(LocalQueueBackend::new(
                address.parse()?,
                local_queue.secret.clone(),
            ))
        }
        BackendConfig::GridEngine(config) => Arc::new(GridEngineBackend::new(config.args.clone())),
        BackendConfig::Lsf(config) => Arc::new(LsfBackend::new(config.args.clone())),
        BackendConfig::Slurm(config) => Arc::new(SlurmBackend::new(config.args.clone())),
    })
}
