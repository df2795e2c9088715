//! Implementation of the Slurm backend.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use tracing::warn;

use super::Backend;
use super::Command;
use super::Job;
use super::abandon_batch;
use super::script::CachedListing;
use super::script::GRACE_PERIOD;
use super::script::LISTING_TTL;
use super::script::MarkerFallback;
use super::script::StateCodes;
use super::script::run_tool;
use super::script::submission_env;
use super::script::username;
use super::script::wrapper_script;
use crate::status::JobStatus;

/// The prefixes of ambient variables passed to `sbatch`.
const ENV_PREFIXES: &[&str] = &["SLURM"];

/// Matches the job identifier in the output of `sbatch --parsable`.
static SUBMITTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"^(\w+)").unwrap()
});

/// Matches a job line in the output of `squeue`.
static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?m)^(\w+) ([A-Z]+)$").unwrap()
});

/// The Slurm job state codes.
static STATE_CODES: LazyLock<StateCodes> = LazyLock::new(|| {
    StateCodes::new(&[
        ("BF", JobStatus::Error),
        ("CA", JobStatus::Interrupted),
        ("CD", JobStatus::Completed),
        ("CF", JobStatus::Queued),
        ("CG", JobStatus::Running),
        ("DL", JobStatus::Deleted),
        ("F", JobStatus::Failed),
        ("NF", JobStatus::Error),
        ("OOM", JobStatus::Error),
        ("PD", JobStatus::Queued),
        ("PR", JobStatus::Deleted),
        ("R", JobStatus::Running),
        ("RD", JobStatus::Queued),
        ("RF", JobStatus::Queued),
        ("RH", JobStatus::Queued),
        ("RQ", JobStatus::Queued),
        ("RS", JobStatus::Queued),
        ("SI", JobStatus::Cancelling),
        ("ST", JobStatus::Interrupted),
        ("S", JobStatus::Queued),
        ("TO", JobStatus::Interrupted),
    ])
});

/// Parses the output of `squeue --format='%i %t'`.
pub fn parse_squeue(stdout: &str) -> HashMap<String, JobStatus> {
    STATUS_REGEX
        .captures_iter(stdout)
        .map(|caps| (caps[1].to_string(), STATE_CODES.get(&caps[2])))
        .collect()
}

/// Parses the job identifier from the output of `sbatch --parsable`.
pub fn parse_sbatch(stdout: &str) -> Option<String> {
    SUBMITTED_REGEX
        .captures(stdout.trim_start())
        .map(|caps| caps[1].to_string())
}

/// A backend submitting jobs to Slurm.
#[derive(Debug)]
pub struct SlurmBackend {
    /// Extra arguments passed to `sbatch`.
    sbatch_args: Vec<String>,
    /// The cached `squeue` listing.
    listing: CachedListing,
    /// Resolves jobs that left the listing.
    fallback: MarkerFallback,
}

impl SlurmBackend {
    /// Constructs a new Slurm backend.
    pub fn new(sbatch_args: Vec<String>) -> Self {
        Self {
            sbatch_args,
            listing: CachedListing::new(LISTING_TTL),
            fallback: MarkerFallback::new(GRACE_PERIOD),
        }
    }

    /// Submits a single command.
    async fn submit(&self, command: &Command) -> Result<Job> {
        let script = wrapper_script(command, None)?;
        let mut args: Vec<String> = ["--output=stdout", "--error=stderr", "--parsable"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.sbatch_args.iter().cloned());

        let env = submission_env(command, ENV_PREFIXES);
        let output =
            run_tool("sbatch", &args, Some(&command.cwd), Some(&env), Some(&script)).await?;
        let id = parse_sbatch(&output.stdout).with_context(|| {
            format!(
                "failed to parse the job identifier from `sbatch` output `{stdout}`",
                stdout = output.stdout.trim()
            )
        })?;

        debug!("submitted Slurm job {id}");
        Ok(Job::new(id, &command.cwd))
    }
}

#[async_trait]
impl Backend for SlurmBackend {
    fn name(&self) -> &'static str {
        "slurm"
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
        let listing = self
            .listing
            .get(|| async {
                let args = [
                    String::from("--array"),
                    String::from("--format=%i %t"),
                    String::from("--noheader"),
                    String::from("--states=all"),
                    format!("--user={user}", user = username()?),
                ];
                let output = run_tool("squeue", &args, None, None, None).await?;
                anyhow::Ok(parse_squeue(&output.stdout))
            })
            .await?;

        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            let status = match listing.get(&job.id) {
                Some(status) if *status != JobStatus::Completed => *status,
                _ => self.fallback.resolve(job).await?,
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
        if let Err(e) = run_tool("scancel", &ids, None, None, None).await {
            warn!("failed to cancel Slurm jobs: {e:#}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_squeue() {
        let stdout = "700 R\n701 PD\n702 CD\n703 OOM\n704 SI\n705 XX\n";
        let listing = parse_squeue(stdout);
        assert_eq!(listing["700"], JobStatus::Running);
        assert_eq!(listing["701"], JobStatus::Queued);
        assert_eq!(listing["702"], JobStatus::Completed);
        assert_eq!(listing["703"], JobStatus::Error);
        assert_eq!(listing["704"], JobStatus::Cancelling);
        assert_eq!(listing["705"], JobStatus::Unknown);
    }

    #[test]
    fn parses_sbatch() {
        assert_eq!(parse_sbatch("9001\n").as_deref(), Some("9001"));
        assert_eq!(parse_sbatch("9002;cluster\n").as_deref(), Some("9002"));
        assert_eq!(parse_sbatch(""), None);
    }
}
