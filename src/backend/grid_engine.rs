//! Implementation of the Grid Engine backend.

use std::collections::HashMap;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::sync::LazyLock;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use super::Backend;
use super::Command;
use super::Job;
use super::abandon_batch;
use super::script::StateCodes;
use super::script::read_exit_code;
use super::script::run_tool;
use super::script::status_from_exit_code;
use super::script::submission_env;
use super::script::username;
use super::script::wrapper_script;
use crate::status::JobStatus;

/// The maximum number of `qsub` invocations running at once.
pub const QSUB_LIMIT: usize = 100;

/// The name of the job script written to the working directory.
const SCRIPT_FILE_NAME: &str = "run.sh";

/// The prefixes of ambient variables passed to `qsub`.
const ENV_PREFIXES: &[&str] = &["SGE"];

/// Matches the job identifier in the output of `qsub`.
static SUBMITTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"Your job (\d+) \(.+\) has been submitted").unwrap()
});

/// Matches a job line in the output of `qstat`.
static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?m)^\s*(\d+)\s+\d+\.\d*\s+\S+\s+\S+\s+(\w+)").unwrap()
});

/// The Grid Engine state codes.
static STATE_CODES: LazyLock<StateCodes> = LazyLock::new(|| {
    StateCodes::new(&[
        ("r", JobStatus::Running),
        ("t", JobStatus::Running),
        ("s", JobStatus::Running),
        ("qw", JobStatus::Queued),
        ("T", JobStatus::Queued),
        ("d", JobStatus::Deleted),
        ("dr", JobStatus::Deleted),
        ("E", JobStatus::Error),
        ("Eqw", JobStatus::Error),
    ])
});

/// Parses the output of `qstat`.
pub fn parse_qstat(stdout: &str) -> HashMap<String, JobStatus> {
    STATUS_REGEX
        .captures_iter(stdout)
        .map(|caps| (caps[1].to_string(), STATE_CODES.get(&caps[2])))
        .collect()
}

/// Parses the job identifier from the output of `qsub`.
pub fn parse_qsub(stdout: &str) -> Option<String> {
    SUBMITTED_REGEX
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// A backend submitting jobs to Grid Engine.
#[derive(Debug)]
pub struct GridEngineBackend {
    /// Extra arguments passed to `qsub`.
    qsub_args: Vec<String>,
}

impl GridEngineBackend {
    /// Constructs a new Grid Engine backend.
    pub fn new(qsub_args: Vec<String>) -> Self {
        Self { qsub_args }
    }

    /// Submits a single command.
    async fn submit(&self, command: &Command) -> Result<Job> {
        let path = command.cwd.join(SCRIPT_FILE_NAME);
        fs::write(&path, wrapper_script(command, None)?)
            .await
            .with_context(|| {
                format!(
                    "failed to write job script `{path}`",
                    path = path.display()
                )
            })?;
        fs::set_permissions(&path, Permissions::from_mode(0o755)).await?;

        let mut args: Vec<String> = ["-V", "-cwd", "-o", "stdout", "-e", "stderr"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.qsub_args.iter().cloned());
        args.push(path.to_string_lossy().into_owned());

        let env = submission_env(command, ENV_PREFIXES);
        let output = run_tool("qsub", &args, Some(&command.cwd), Some(&env), None).await?;
        let id = parse_qsub(&output.stdout).with_context(|| {
            format!(
                "failed to parse the job identifier from `qsub` output `{stdout}`",
                stdout = output.stdout.trim()
            )
        })?;

        debug!("submitted Grid Engine job {id}");
        Ok(Job::new(id, &command.cwd))
    }
}

#[async_trait]
impl Backend for GridEngineBackend {
    fn name(&self) -> &'static str {
        "grid-engine"
    }

    async fn start(&self, commands: &[Command]) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(commands.len());
        for chunk in commands.chunks(QSUB_LIMIT) {
            let mut failure = None;
            for result in join_all(chunk.iter().map(|c| self.submit(c))).await {
                match result {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = failure {
                return Err(abandon_batch(self, &jobs, e).await);
            }
        }
        Ok(jobs)
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<JobStatus>> {
        let args = [String::from("-u"), username()?];
        let output = run_tool("qstat", &args, None, None, None).await?;
        let listing = parse_qstat(&output.stdout);

        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            let status = match listing.get(&job.id) {
                Some(status) => *status,
                None => match read_exit_code(&job.cwd).await? {
                    Some(code) => status_from_exit_code(code),
                    None => JobStatus::Interrupted,
                },
            };
            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn cancel(&self, jobs: &[Job]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let ids: Vec<_> = jobs.iter().map(|j| j.id.clone()).collect();
        if let Err(e) = run_tool("qdel", &ids, None, None, None).await {
            warn!("failed to cancel Grid Engine jobs: {e:#}");
        }

        Ok(())
    }
}
