//! Implementation of the local queue backend.
//!
//! Commands are forwarded to a running local queue broker, which executes
//! them with a bounded number of workers.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use tracing::warn;

use super::Backend;
use super::Command;
use super::Job;
use super::abandon_batch;
use crate::local_queue::Address;
use crate::local_queue::Client;
use crate::status::JobStatus;

/// A backend submitting jobs to the local queue broker.
#[derive(Debug)]
pub struct LocalQueueBackend {
    /// The broker client.
    client: Client,
}

impl LocalQueueBackend {
    /// Constructs a new local queue backend.
    ///
    /// No connection is made until the first request.
    pub fn new(address: Address, secret: Option<SecretString>) -> Self {
        Self {
            client: Client::new(address, secret.as_ref()),
        }
    }

    /// Submits a single command.
    async fn submit(&self, command: &Command) -> Result<Job> {
        let id = self
            .client
            .submit(command.shell_line()?, &command.cwd, command.env.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to submit a job to the local queue at `{address}`",
                    address = self.client.address()
                )
            })?;
        Ok(Job::new(id.to_string(), &command.cwd))
    }

    /// Parses the broker identifier of a job.
    fn job_id(job: &Job) -> Result<u64> {
        job.id
            .parse()
            .with_context(|| format!("invalid local queue job identifier `{id}`", id = job.id))
    }
}

#[async_trait]
impl Backend for LocalQueueBackend {
    fn name(&self) -> &'static str {
        "local-queue"
    }

    async fn start(&self, commands: &[Command]) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(commands.len());
        for command in commands {
            match self.submit(command).await {
                Ok(job) => jobs.push(job),
                Err(e) => return Err(abandon_batch(self, &jobs, e).await),
            }
        }
        Ok(jobs)
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<JobStatus>> {
        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            let state = self.client.get(Self::job_id(job)?).await.with_context(|| {
                format!("failed to get the state of local queue job `{id}`", id = job.id)
            })?;
            statuses.push(state.state);
        }
        Ok(statuses)
    }

    async fn cancel(&self, jobs: &[Job]) -> Result<()> {
        for job in jobs {
            let id = Self::job_id(job)?;
            if let Err(e) = self.client.cancel(id).await {
                warn!("failed to cancel local queue job `{id}`: {e:#}");
            }
        }
        Ok(())
    }
}
