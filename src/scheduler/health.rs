//! Periodic service health tests.
//!
//! Each runner with a configured test runs a job with the test inputs. The
//! outcome is recorded as the current status of the runner.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::TestConfig;
use crate::database::Database;
use crate::runner::Runner;
use crate::status::JobStatus;
use crate::status::ServiceStatus;

/// The test of one runner.
#[derive(Debug, Clone)]
pub struct ServiceTest {
    /// The runner under test.
    pub runner: Arc<Runner>,
    /// The test configuration.
    pub config: TestConfig,
}

/// The outcome of a service test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    /// The determined status.
    pub status: ServiceStatus,
    /// A human readable explanation.
    pub message: String,
}

impl TestOutcome {
    /// Constructs a new outcome.
    fn new(status: ServiceStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Runs the service tests on an interval.
#[derive(Debug)]
pub struct HealthMonitor {
    /// The tests to run.
    tests: Vec<ServiceTest>,
    /// The database receiving the results.
    database: Arc<dyn Database>,
    /// The directory test jobs run in.
    directory: PathBuf,
    /// The time between rounds of tests.
    interval: Duration,
    /// The time between status checks of a test job.
    poll_interval: Duration,
}

impl HealthMonitor {
    /// Constructs a new monitor.
    pub fn new(
        tests: Vec<ServiceTest>,
        database: Arc<dyn Database>,
        directory: PathBuf,
        interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tests,
            database,
            directory,
            interval,
            poll_interval,
        }
    }

    /// Runs a round of tests immediately and then on every interval until
    /// `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        if self.tests.is_empty() {
            return;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.run_once() => {}
            }
        }
    }

    /// Runs every test once and records the results.
    pub async fn run_once(&self) {
        let outcomes = join_all(self.tests.iter().map(|test| {
            run_test(
                &test.runner,
                &test.config,
                &self.directory,
                self.poll_interval,
            )
        }))
        .await;

        for (test, outcome) in self.tests.iter().zip(outcomes) {
            let runner = &test.runner;
            match outcome.status {
                ServiceStatus::Ok => debug!(
                    service = runner.service(),
                    runner = runner.name(),
                    "service test passed"
                ),
                status => warn!(
                    service = runner.service(),
                    runner = runner.name(),
                    "service test reported {status}: {message}",
                    message = outcome.message
                ),
            }

            if let Err(e) = self
                .database
                .insert_service_status(
                    runner.service(),
                    runner.name(),
                    outcome.status,
                    &outcome.message,
                    Utc::now(),
                )
                .await
            {
                error!("failed to record the service status: {e}");
            }
        }
    }
}

/// Runs the test of a runner in a temporary directory.
pub async fn run_test(
    runner: &Runner,
    config: &TestConfig,
    directory: &Path,
    poll_interval: Duration,
) -> TestOutcome {
    let cwd = match create_directory(directory) {
        Ok(cwd) => cwd,
        Err(e) => return TestOutcome::new(ServiceStatus::Down, format!("{e:#}")),
    };

    info!(
        service = runner.service(),
        runner = runner.name(),
        "starting service test"
    );

    let job = match runner.start(&config.inputs, cwd.path()).await {
        Ok(job) => job,
        Err(e) => {
            return TestOutcome::new(
                ServiceStatus::Down,
                format!("failed to start the test job: {e:#}"),
            );
        }
    };

    let wait = async {
        loop {
            match runner.status(std::slice::from_ref(&job)).await {
                Ok(statuses) => match statuses.first() {
                    Some(status) if status.is_finished() => return Ok(*status),
                    _ => tokio::time::sleep(poll_interval).await,
                },
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(config.timeout(), wait).await {
        Ok(Ok(status)) => outcome(status),
        Ok(Err(e)) => TestOutcome::new(
            ServiceStatus::Down,
            format!("failed to get the status of the test job: {e:#}"),
        ),
        Err(_) => {
            if let Err(e) = runner.cancel(std::slice::from_ref(&job)).await {
                warn!("failed to cancel the test job `{job}`: {e:#}");
            }
            TestOutcome::new(
                ServiceStatus::Warning,
                format!(
                    "the test job did not finish within {secs} seconds",
                    secs = config.timeout().as_secs()
                ),
            )
        }
    }
}

/// Maps the final status of a test job to a service status.
fn outcome(status: JobStatus) -> TestOutcome {
    match status {
        JobStatus::Completed => TestOutcome::new(ServiceStatus::Ok, "OK"),
        JobStatus::Interrupted | JobStatus::Deleted => TestOutcome::new(
            ServiceStatus::Warning,
            format!("the test job finished as {status}"),
        ),
        status => TestOutcome::new(
            ServiceStatus::Down,
            format!("the test job finished as {status}"),
        ),
    }
}

/// Creates a temporary directory for a test job.
fn create_directory(directory: &Path) -> Result<tempfile::TempDir> {
    std::fs::create_dir_all(directory).with_context(|| {
        format!(
            "failed to create directory `{path}`",
            path = directory.display()
        )
    })?;

    tempfile::Builder::new()
        .prefix("test-")
        .tempdir_in(directory)
        .with_context(|| {
            format!(
                "failed to create a test directory in `{path}`",
                path = directory.display()
            )
        })
}
