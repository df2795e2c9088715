//! Implementation of the LSF backend.
//!
//! `bsub -o` receives LSF's job report rather than the output of the job, so
//! the job script redirects the standard output of the command itself.

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
use super::script::wrapper_script;
use crate::status::JobStatus;

/// The prefixes of ambient variables passed to `bsub`.
const ENV_PREFIXES: &[&str] = &["LSF", "LSB"];

/// Matches the job identifier in the output of `bsub`.
static SUBMITTED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"^Job <(\d+)>").unwrap()
});

/// Matches a job line in the output of `bjobs`.
static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?m)^(\w+)\s+\w+\s+([A-Z]+)").unwrap()
});

/// The LSF job states.
static STATE_CODES: LazyLock<StateCodes> = LazyLock::new(|| {
    StateCodes::new(&[
        ("PEND", JobStatus::Queued),
        ("PROV", JobStatus::Queued),
        ("PSUSP", JobStatus::Unknown),
        ("RUN", JobStatus::Running),
        ("USUSP", JobStatus::Unknown),
        ("SSUSP", JobStatus::Unknown),
        ("DONE", JobStatus::Completed),
        ("EXIT", JobStatus::Error),
        ("UNKWN", JobStatus::Unknown),
        ("WAIT", JobStatus::Queued),
        ("ZOMBI", JobStatus::Error),
    ])
});

/// Parses the output of `bjobs -noheader -w`.
pub fn parse_bjobs(stdout: &str) -> HashMap<String, JobStatus> {
    STATUS_REGEX
        .captures_iter(stdout)
        .map(|caps| (caps[1].to_string(), STATE_CODES.get(&caps[2])))
        .collect()
}

/// Parses the job identifier from the output of `bsub`.
pub fn parse_bsub(stdout: &str) -> Option<String> {
    SUBMITTED_REGEX
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// A backend submitting jobs to LSF.
#[derive(Debug)]
pub struct LsfBackend {
    /// Extra arguments passed to `bsub`.
    bsub_args: Vec<String>,
    /// The cached `bjobs` listing.
    listing: CachedListing,
    /// Resolves jobs that left the listing.
    fallback: MarkerFallback,
}

impl LsfBackend {
    /// Constructs a new LSF backend.
    pub fn new(bsub_args: Vec<String>) -> Self {
        Self {
            bsub_args,
            listing: CachedListing::new(LISTING_TTL),
            fallback: MarkerFallback::new(GRACE_PERIOD),
        }
    }

    /// Submits a single command.
    async fn submit(&self, command: &Command) -> Result<Job> {
        let script = wrapper_script(command, Some("stdout"))?;
        let mut args: Vec<String> = ["-o", "stdout.lsf", "-e", "stderr"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.bsub_args.iter().cloned());

        let env = submission_env(command, ENV_PREFIXES);
        let output = run_tool("bsub", &args, Some(&command.cwd), Some(&env), Some(&script)).await?;
        let id = parse_bsub(&output.stdout).with_context(|| {
            format!(
                "failed to parse the job identifier from `bsub` output `{stdout}`",
                stdout = output.stdout.trim()
            )
        })?;

        debug!("submitted LSF job {id}");
        Ok(Job::new(id, &command.cwd))
    }
}

#[async_trait]
impl Backend for LsfBackend {
    fn name(&self) -> &'static str {
        "lsf"
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
                let args = [String::from("-noheader"), String::from("-w")];
                let output = run_tool("bjobs", &args, None, None, None).await?;
                anyhow::Ok(parse_bjobs(&output.stdout))
            })
            .await?;

        let mut statuses = Vec::with_capacity(jobs.len());
        for job in jobs {
            // `DONE` only means the script exited, the marker holds the code.
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
        if let Err(e) = run_tool("bkill", &ids, None, None, None).await {
            warn!("failed to cancel LSF jobs: {e:#}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bjobs() {
        let stdout = "\
5001    slivka  RUN   normal     host-1      host-2      job        May  1 10:00
5002    slivka  PEND  normal     host-1                  job        May  1 10:01
5003    slivka  EXIT  normal     host-1      host-2      job        May  1 10:02
5004    slivka  DONE  normal     host-1      host-2      job        May  1 10:03
5005    slivka  USUSP normal     host-1      host-2      job        May  1 10:03
";
        let listing = parse_bjobs(stdout);
        assert_eq!(listing["5001"], JobStatus::Running);
        assert_eq!(listing["5002"], JobStatus::Queued);
        assert_eq!(listing["5003"], JobStatus::Error);
        assert_eq!(listing["5004"], JobStatus::Completed);
        assert_eq!(listing["5005"], JobStatus::Unknown);
    }

    #[test]
    fn parses_bsub() {
        assert_eq!(
            parse_bsub("Job <123> is submitted to default queue <normal>.\n").as_deref(),
            Some("123")
        );
        assert_eq!(parse_bsub("Request aborted by esub."), None);
    }
}
