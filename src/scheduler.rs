//! Implementation of the scheduler.
//!
//! The scheduler moves job requests through their lifecycle. Every tick it
//!
//! 1. assigns a runner to each pending request,
//! 2. starts the accepted requests in batches per runner,
//! 3. processes cancel requests, and
//! 4. polls the status of the started jobs.
//!
//! Ticks run one after another on a single task. Service tests run on their
//! own task.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::config::DEFAULT_MAX_RETRIES;
use crate::database::Database;
use crate::database::JobRequest;
use crate::runner::Inputs;
use crate::runner::Runner;
use crate::selector::DefaultSelector;
use crate::selector::Selector;
use crate::selector::SelectorContext;
use crate::selector::create_selector;
use crate::status::JobStatus;

pub mod backoff;
pub mod health;

pub use backoff::BackoffCounter;
pub use health::HealthMonitor;
pub use health::ServiceTest;

/// The default time between ticks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The default time between service tests.
const DEFAULT_TEST_INTERVAL: Duration = Duration::from_secs(3600);

/// Identifies a runner of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId {
    /// The name of the service.
    pub service: String,
    /// The name of the runner.
    pub runner: String,
}

impl RunnerId {
    /// Constructs a new runner identifier.
    pub fn new(service: impl Into<String>, runner: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            runner: runner.into(),
        }
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{service}/{runner}", service = self.service, runner = self.runner)
    }
}

/// Gets the working directory of a job request.
///
/// Directories are spread over subdirectories named after the first two
/// characters of the identifier.
pub fn work_dir(jobs_directory: &Path, id: Uuid) -> PathBuf {
    let name = id.simple().to_string();
    jobs_directory.join(&name[..2]).join(&name)
}

/// Groups requests by their runner, keeping the order of first appearance.
///
/// Requests without a runner are returned separately.
fn group_by_runner(
    requests: Vec<JobRequest>,
) -> (IndexMap<RunnerId, Vec<JobRequest>>, Vec<JobRequest>) {
    let mut groups: IndexMap<RunnerId, Vec<JobRequest>> = IndexMap::new();
    let mut orphans = Vec::new();
    for request in requests {
        match &request.runner {
            Some(runner) => groups
                .entry(RunnerId::new(&request.service, runner))
                .or_default()
                .push(request),
            None => orphans.push(request),
        }
    }
    (groups, orphans)
}

/// The scheduler.
pub struct Scheduler {
    /// The database holding the requests.
    database: Arc<dyn Database>,
    /// The directory the working directories are created in.
    jobs_directory: PathBuf,
    /// The runners.
    runners: IndexMap<RunnerId, Arc<Runner>>,
    /// The selectors by service name.
    ///
    /// Services without a selector use [`DefaultSelector`].
    selectors: HashMap<String, Arc<dyn Selector>>,
    /// The service tests.
    tests: Vec<ServiceTest>,
    /// The number of failures tolerated before giving up.
    max_retries: u32,
    /// The time between ticks.
    poll_interval: Duration,
    /// The time between service tests.
    test_interval: Duration,
    /// The backoff of job submission per runner.
    start_backoff: HashMap<RunnerId, BackoffCounter>,
    /// The backoff of status polling per runner.
    poll_backoff: HashMap<RunnerId, BackoffCounter>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs_directory", &self.jobs_directory)
            .field("runners", &self.runners.keys().collect::<Vec<_>>())
            .field("selectors", &self.selectors.keys().collect::<Vec<_>>())
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Constructs a scheduler without runners.
    pub fn new(database: Arc<dyn Database>, jobs_directory: impl Into<PathBuf>) -> Self {
        Self {
            database,
            jobs_directory: jobs_directory.into(),
            runners: IndexMap::new(),
            selectors: HashMap::new(),
            tests: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            test_interval: DEFAULT_TEST_INTERVAL,
            start_backoff: HashMap::new(),
            poll_backoff: HashMap::new(),
        }
    }

    /// Constructs a scheduler with the runners, selectors and tests of every
    /// configured service.
    ///
    /// `home` is the project directory.
    pub fn from_config(
        config: &Config,
        home: &Path,
        database: Arc<dyn Database>,
    ) -> Result<Self> {
        let mut scheduler = Self::new(database, &config.scheduler.jobs_directory)
            .with_max_retries(config.scheduler.max_retries)
            .with_poll_interval(config.scheduler.poll_interval())
            .with_test_interval(config.scheduler.test_interval());

        for (service_name, service) in &config.services {
            scheduler
                .selectors
                .insert(service_name.clone(), create_selector(service));

            for (runner_name, runner) in &service.runners {
                let runner = Runner::from_config(
                    service_name,
                    runner_name,
                    service,
                    runner,
                    &config.local_queue,
                    home,
                )
                .with_context(|| {
                    format!("failed to create runner `{runner_name}` of service `{service_name}`")
                })?;

                let runner = scheduler.add_runner(runner);
                if let Some(test) = &service.test {
                    scheduler.tests.push(ServiceTest {
                        runner,
                        config: test.clone(),
                    });
                }
            }
        }

        Ok(scheduler)
    }

    /// Sets the number of failures tolerated before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the time between ticks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the time between service tests.
    pub fn with_test_interval(mut self, interval: Duration) -> Self {
        self.test_interval = interval;
        self
    }

    /// Sets the selector of a service.
    pub fn with_selector(
        mut self,
        service: impl Into<String>,
        selector: impl Selector + 'static,
    ) -> Self {
        self.selectors.insert(service.into(), Arc::new(selector));
        self
    }

    /// Adds a runner, replacing any runner with the same service and name.
    pub fn add_runner(&mut self, runner: Runner) -> Arc<Runner> {
        let runner = Arc::new(runner);
        self.runners.insert(
            RunnerId::new(runner.service(), runner.name()),
            runner.clone(),
        );
        runner
    }

    /// Gets a runner.
    pub fn runner(&self, id: &RunnerId) -> Option<&Arc<Runner>> {
        self.runners.get(id)
    }

    /// Runs ticks until `token` is cancelled.
    ///
    /// A failing tick is logged and the next tick runs as usual.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(
            runners = self.runners.len(),
            "scheduler started with a poll interval of {interval:?}",
            interval = self.poll_interval
        );

        let monitor = HealthMonitor::new(
            std::mem::take(&mut self.tests),
            self.database.clone(),
            self.jobs_directory.join("tests"),
            self.test_interval,
            self.poll_interval,
        );
        let health = tokio::spawn(monitor.run(token.child_token()));

        loop {
            if let Err(e) = self.run_cycle().await {
                error!("scheduler tick failed: {e:#}");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("scheduler stopping");
        health.await.context("the service test task failed")?;
        Ok(())
    }

    /// Runs a single tick.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.assign_runners().await?;
        self.start_accepted().await?;
        self.process_cancellations().await?;
        self.poll_running().await?;
        Ok(())
    }

    /// Builds the selector context of a service.
    fn selector_context(&self, service: &str) -> SelectorContext {
        let runners = self.runners.values().filter(|r| r.service() == service);
        SelectorContext {
            service: service.to_string(),
            runners: runners.clone().map(|r| r.name().to_string()).collect(),
            options: runners
                .map(|r| (r.name().to_string(), r.selector_options().clone()))
                .collect(),
        }
    }

    /// Selects a runner for each pending request.
    async fn assign_runners(&mut self) -> Result<()> {
        let pending = self
            .database
            .list_requests(&[JobStatus::Pending])
            .await
            .context("failed to fetch pending requests")?;

        let mut contexts: HashMap<String, SelectorContext> = HashMap::new();
        for request in pending {
            let selector = self
                .selectors
                .get(&request.service)
                .cloned()
                .unwrap_or_else(|| Arc::new(DefaultSelector));
            let context = contexts
                .entry(request.service.clone())
                .or_insert_with(|| self.selector_context(&request.service));

            let status = match selector.select(&request.inputs, context) {
                Ok(None) => {
                    info!(request = %request.id, service = request.service, "request rejected");
                    JobStatus::Rejected
                }
                Ok(Some(runner)) => {
                    if self
                        .runners
                        .contains_key(&RunnerId::new(&request.service, &runner))
                    {
                        debug!(
                            request = %request.id,
                            service = request.service,
                            runner,
                            "request accepted"
                        );
                        self.database.set_accepted(request.id, &runner).await?;
                        continue;
                    }

                    error!(
                        request = %request.id,
                        "runner `{runner}` does not exist for service `{service}`",
                        service = request.service
                    );
                    JobStatus::Error
                }
                Err(e) => {
                    error!(
                        request = %request.id,
                        "selector of service `{service}` failed: {e:#}",
                        service = request.service
                    );
                    JobStatus::Error
                }
            };

            self.database.update_status(request.id, status).await?;
        }

        Ok(())
    }

    /// Starts the accepted requests in batches per runner.
    async fn start_accepted(&mut self) -> Result<()> {
        let accepted = self
            .database
            .list_requests(&[JobStatus::Accepted])
            .await
            .context("failed to fetch accepted requests")?;

        let (groups, orphans) = group_by_runner(accepted);
        for request in orphans {
            error!(request = %request.id, "accepted request has no runner");
            self.database
                .update_status(request.id, JobStatus::Error)
                .await?;
        }

        for (id, requests) in groups {
            let Some(runner) = self.runners.get(&id).cloned() else {
                error!("runner `{id}` does not exist");
                set_all(&*self.database, &requests, JobStatus::Error).await?;
                continue;
            };

            let counter = self
                .start_backoff
                .entry(id.clone())
                .or_insert_with(|| BackoffCounter::new(self.max_retries));
            if counter.skip() {
                debug!(runner = %id, "job submission deferred by backoff");
                continue;
            }

            let dirs: Vec<PathBuf> = requests
                .iter()
                .map(|r| work_dir(&self.jobs_directory, r.id))
                .collect();
            let batch: Vec<(&Inputs, &Path)> = requests
                .iter()
                .zip(&dirs)
                .map(|(r, d)| (&r.inputs, d.as_path()))
                .collect();

            match runner.batch_start(&batch).await {
                Ok(jobs) => {
                    counter.reset();
                    for (request, job) in requests.iter().zip(&jobs) {
                        info!(request = %request.id, runner = %id, "started job {job}");
                        self.database.set_job(request.id, job).await?;
                    }
                }
                Err(e) => {
                    counter.failure();
                    if counter.give_up() {
                        counter.reset();
                        error!(runner = %id, "starting jobs failed, giving up: {e:#}");
                        set_all(&*self.database, &requests, JobStatus::Error).await?;
                    } else {
                        warn!(
                            runner = %id,
                            failures = counter.failures(),
                            "starting jobs failed, will retry: {e:#}"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Processes the pending cancel requests.
    async fn process_cancellations(&mut self) -> Result<()> {
        let cancellations = self
            .database
            .list_cancel_requests()
            .await
            .context("failed to fetch cancel requests")?;

        for cancellation in cancellations {
            if let Some(request) = self.database.get_request(cancellation.request_id).await? {
                self.cancel(&request).await?;
            } else {
                warn!(request = %cancellation.request_id, "cancel request for an unknown request");
            }

            self.database.delete_cancel_request(cancellation.id).await?;
        }

        Ok(())
    }

    /// Cancels a single request.
    async fn cancel(&self, request: &JobRequest) -> Result<()> {
        let status = match request.status {
            JobStatus::Pending | JobStatus::Accepted => JobStatus::Deleted,
            JobStatus::Queued | JobStatus::Running => {
                let Some(job) = request.job() else {
                    self.database
                        .update_status(request.id, JobStatus::Deleted)
                        .await?;
                    return Ok(());
                };

                let runner = request
                    .runner
                    .as_ref()
                    .and_then(|r| self.runners.get(&RunnerId::new(&request.service, r)));
                match runner {
                    Some(runner) => {
                        if let Err(e) = runner.cancel(&[job]).await {
                            warn!(request = %request.id, "failed to cancel the job: {e:#}");
                        }
                    }
                    None => {
                        warn!(request = %request.id, "the runner of the request does not exist")
                    }
                }
                JobStatus::Cancelling
            }
            _ => return Ok(()),
        };

        info!(request = %request.id, "request is {status}");
        self.database.update_status(request.id, status).await?;
        Ok(())
    }

    /// Polls the status of started jobs per runner.
    async fn poll_running(&mut self) -> Result<()> {
        let active = self
            .database
            .list_requests(&[JobStatus::Queued, JobStatus::Running, JobStatus::Cancelling])
            .await
            .context("failed to fetch running requests")?;

        let (groups, orphans) = group_by_runner(active);
        set_all(&*self.database, &orphans, JobStatus::Error).await?;

        for (id, requests) in groups {
            let Some(runner) = self.runners.get(&id).cloned() else {
                error!("runner `{id}` does not exist");
                set_all(&*self.database, &requests, JobStatus::Error).await?;
                continue;
            };

            let (requests, broken): (Vec<_>, Vec<_>) =
                requests.into_iter().partition(|r| r.job().is_some());
            set_all(&*self.database, &broken, JobStatus::Error).await?;

            let counter = self
                .poll_backoff
                .entry(id.clone())
                .or_insert_with(|| BackoffCounter::new(self.max_retries));
            if requests.is_empty() || counter.skip() {
                continue;
            }

            let jobs: Vec<_> = requests.iter().filter_map(JobRequest::job).collect();
            match runner.status(&jobs).await {
                Ok(statuses) => {
                    let mut changed = Vec::new();
                    for (request, status) in requests.iter().zip(statuses) {
                        if request.status == JobStatus::Cancelling && !status.is_finished() {
                            continue;
                        }

                        if request.status != status {
                            debug!(request = %request.id, "job status changed to {status}");
                            self.database.update_status(request.id, status).await?;
                            changed.push(status);
                        }
                    }

                    if !changed.is_empty() && changed.iter().all(|s| *s == JobStatus::Error) {
                        warn!(runner = %id, "all updated jobs ended with an error");
                        counter.failure();
                    } else {
                        counter.reset();
                    }
                }
                Err(e) => {
                    counter.failure();
                    if counter.give_up() {
                        counter.reset();
                        error!(runner = %id, "checking job status failed, giving up: {e:#}");
                        set_all(&*self.database, &requests, JobStatus::Error).await?;
                    } else {
                        warn!(
                            runner = %id,
                            failures = counter.failures(),
                            "checking job status failed: {e:#}"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Sets the status of every request.
async fn set_all(
    database: &dyn Database,
    requests: &[JobRequest],
    status: JobStatus,
) -> Result<()> {
    for request in requests {
        database.update_status(request.id, status).await?;
    }
    Ok(())
}
