//! Configuration of the scheduler, the local queue and the services.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

use crate::runner::InputValue;
use crate::selector::Bound;

/// The name of the configuration file inside the project directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The environment variable naming the project directory.
pub const HOME_ENV_VAR: &str = "SLIVKA_HOME";

/// The environment variable holding the local queue secret.
pub const SECRET_ENV_VAR: &str = "SLIVKA_SECRET";

/// Default jobs directory, relative to the project directory.
const DEFAULT_JOBS_DIRECTORY: &str = "jobs";

/// Default scheduler tick interval in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default number of retries before a runner's requests are failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default interval between service tests in seconds.
const DEFAULT_TEST_INTERVAL_SECS: u64 = 3600;

/// Default service test timeout in seconds.
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 900;

/// Default database file, relative to the project directory.
const DEFAULT_DATABASE_PATH: &str = "slivka.db";

/// Default local queue address.
const DEFAULT_LOCAL_QUEUE_ADDRESS: &str = "127.0.0.1:4196";

/// Default number of local queue workers.
const DEFAULT_LOCAL_QUEUE_WORKERS: usize = 2;

/// Default number of jobs the local queue remembers.
const DEFAULT_LOCAL_QUEUE_MAX_JOBS: usize = 100_000;

/// The top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Local queue settings.
    #[serde(default)]
    pub local_queue: LocalQueueConfig,
    /// The services, by name.
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// The directory job working directories are created in (default:
    /// `jobs`).
    #[serde(default = "default_jobs_directory")]
    pub jobs_directory: PathBuf,
    /// The sleep between two scheduler ticks in milliseconds (default:
    /// `1000`).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// The number of consecutive failures tolerated for a runner before its
    /// requests fail (default: `5`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The interval between service tests in seconds (default: `3600`).
    #[serde(default = "default_test_interval_secs")]
    pub test_interval_secs: u64,
}

impl SchedulerConfig {
    /// Gets the sleep between two scheduler ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gets the interval between service tests.
    pub fn test_interval(&self) -> Duration {
        Duration::from_secs(self.test_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jobs_directory: default_jobs_directory(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            test_interval_secs: DEFAULT_TEST_INTERVAL_SECS,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DatabaseConfig {
    /// The path to the SQLite database file (default: `slivka.db`).
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Local queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalQueueConfig {
    /// The address the broker listens on (default: `127.0.0.1:4196`).
    ///
    /// Either `host:port` or a unix socket path (`unix:///path` or any value
    /// containing a `/`).
    #[serde(default = "default_local_queue_address")]
    pub address: String,
    /// The maximum number of jobs executed at once (default: `2`).
    #[serde(default = "default_local_queue_workers")]
    pub workers: usize,
    /// The number of jobs kept in the job table (default: `100000`).
    #[serde(default = "default_local_queue_max_jobs")]
    pub max_jobs: usize,
    /// The secret used to sign requests.
    ///
    /// Usually supplied with the `SLIVKA_SECRET` environment variable.
    #[serde(default)]
    pub secret: Option<SecretString>,
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        Self {
            address: default_local_queue_address(),
            workers: DEFAULT_LOCAL_QUEUE_WORKERS,
            max_jobs: DEFAULT_LOCAL_QUEUE_MAX_JOBS,
            secret: None,
        }
    }
}

/// The configuration of a single service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ServiceConfig {
    /// The base command.
    pub command: CommandConfig,
    /// The arguments, in the order they appear on the command line.
    #[serde(default)]
    pub arguments: Vec<ArgumentConfig>,
    /// Environment variables added to the job environment.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// The files produced by the service.
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    /// The runners able to execute the service, by name.
    pub runners: IndexMap<String, RunnerConfig>,
    /// The selector choosing the runner of each request (default:
    /// `default`).
    #[serde(default)]
    pub selector: SelectorConfig,
    /// The periodic test of the service.
    #[serde(default)]
    pub test: Option<TestConfig>,
}

/// The selectors a service can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorConfig {
    /// Always picks the runner named `default`.
    #[default]
    Default,
    /// Picks the first runner whose `selector_options` bounds admit the
    /// request inputs.
    ///
    /// Each option maps an input identifier to a maximum or to a table with
    /// `min` and `max` keys. Numbers are compared by value while strings and
    /// lists are compared by length.
    Limits,
}

/// A base command given either as a shell-style string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// A command line split with shell quoting rules.
    Line(String),
    /// An already split command line.
    Args(Vec<String>),
}

/// The configuration of a single command line argument.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ArgumentConfig {
    /// The identifier of the input the argument reads.
    pub id: String,
    /// The argument template.
    ///
    /// `$(value)` is replaced by the input value and `$VAR`/`${VAR}` by the
    /// runner environment.
    pub arg: String,
    /// The value used when the input is not provided.
    #[serde(default)]
    pub default: Option<InputValue>,
    /// The file name the input file is linked to in the working directory.
    #[serde(default)]
    pub symlink: Option<String>,
    /// The separator joining list values.
    #[serde(default)]
    pub join: Option<String>,
}

/// A file produced by a service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OutputConfig {
    /// The identifier of the output.
    pub id: String,
    /// The path of the file, relative to the working directory.
    ///
    /// May contain glob characters.
    pub path: String,
    /// The media type of the file.
    #[serde(default)]
    pub media_type: Option<String>,
}

/// The configuration of a runner of a service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RunnerConfig {
    /// The backend executing the jobs.
    pub backend: BackendConfig,
    /// Options handed to the service's selector for this runner.
    #[serde(default)]
    pub selector_options: IndexMap<String, serde_json::Value>,
}

/// The configuration of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    /// Runs jobs as child processes of the scheduler.
    Shell,
    /// Sends jobs to the local queue broker.
    LocalQueue(LocalQueueBackendConfig),
    /// Submits jobs with `qsub`.
    GridEngine(BatchBackendConfig),
    /// Submits jobs with `bsub`.
    Lsf(BatchBackendConfig),
    /// Submits jobs with `sbatch`.
    Slurm(BatchBackendConfig),
}

/// Configuration of the local queue backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalQueueBackendConfig {
    /// The broker address (default: the `[local_queue]` address).
    #[serde(default)]
    pub address: Option<String>,
}

/// Configuration shared by the batch scheduler backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BatchBackendConfig {
    /// Extra arguments passed to the submission command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// The configuration of a service test.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TestConfig {
    /// The inputs of the test job.
    #[serde(default)]
    pub inputs: IndexMap<String, InputValue>,
    /// The time the test job is given to complete in seconds (default:
    /// `900`).
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

impl TestConfig {
    /// Gets the time the test job is given to complete.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Default jobs directory function for serde.
fn default_jobs_directory() -> PathBuf {
    PathBuf::from(DEFAULT_JOBS_DIRECTORY)
}

/// Default poll interval function for serde.
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Default retry budget function for serde.
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Default test interval function for serde.
fn default_test_interval_secs() -> u64 {
    DEFAULT_TEST_INTERVAL_SECS
}

/// Default test timeout function for serde.
fn default_test_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT_SECS
}

/// Default database path function for serde.
fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

/// Default local queue address function for serde.
fn default_local_queue_address() -> String {
    String::from(DEFAULT_LOCAL_QUEUE_ADDRESS)
}

/// Default local queue worker count function for serde.
fn default_local_queue_workers() -> usize {
    DEFAULT_LOCAL_QUEUE_WORKERS
}

/// Default local queue table size function for serde.
fn default_local_queue_max_jobs() -> usize {
    DEFAULT_LOCAL_QUEUE_MAX_JOBS
}

impl Config {
    /// Parses a configuration from TOML text.
    ///
    /// The configuration is validated after parsing.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Relative paths in the file are resolved against `home`.
    pub fn from_file(path: &Path, home: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;
        let mut config = Self::from_toml(&contents).with_context(|| {
            format!(
                "invalid configuration file `{path}`",
                path = path.display()
            )
        })?;
        config.resolve_paths(home);
        Ok(config)
    }

    /// Resolves relative paths against the project directory.
    pub fn resolve_paths(&mut self, home: &Path) {
        if self.scheduler.jobs_directory.is_relative() {
            self.scheduler.jobs_directory = home.join(&self.scheduler.jobs_directory);
        }

        if self.database.path.is_relative() {
            self.database.path = home.join(&self.database.path);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.local_queue.workers == 0 {
            bail!("`local_queue.workers` must be at least 1");
        }

        if self.local_queue.max_jobs == 0 {
            bail!("`local_queue.max_jobs` must be at least 1");
        }

        for (name, service) in &self.services {
            service
                .validate()
                .with_context(|| format!("invalid configuration for service `{name}`"))?;
        }

        Ok(())
    }
}

impl ServiceConfig {
    /// Validates the service configuration.
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            CommandConfig::Line(line) if line.trim().is_empty() => bail!("`command` is empty"),
            CommandConfig::Args(args) if args.is_empty() => bail!("`command` is empty"),
            _ => {}
        }

        if self.runners.is_empty() {
            bail!("at least one runner must be configured");
        }

        for (i, argument) in self.arguments.iter().enumerate() {
            if self.arguments[..i].iter().any(|a| a.id == argument.id) {
                bail!("argument `{id}` is declared more than once", id = argument.id);
            }
        }

        if self.selector == SelectorConfig::Limits {
            for (name, runner) in &self.runners {
                for (id, value) in &runner.selector_options {
                    Bound::from_value(value).with_context(|| {
                        format!("invalid selector option `{id}` of runner `{name}`")
                    })?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const EXAMPLE: &str = r#"
[scheduler]
poll_interval_ms = 250
max_retries = 2

[local_queue]
address = "unix:///tmp/slivka.sock"
workers = 4

[services.clustalo]
command = "clustalo --threads=${THREADS}"
env = { THREADS = "2" }

[[services.clustalo.arguments]]
id = "input"
arg = "--infile=$(value)"
symlink = "input.txt"

[[services.clustalo.arguments]]
id = "iterations"
arg = "--iter=$(value)"
default = 1

[[services.clustalo.outputs]]
id = "alignment"
path = "output.aln"

[services.clustalo.runners.default]
backend = { type = "shell" }

[services.clustalo.runners.cluster]
backend = { type = "slurm", args = ["--partition=short"] }
selector_options = { max_size = 1000 }

[services.clustalo.test]
inputs = { input = "/srv/test.fa" }
timeout_secs = 60
"#;

    #[test]
    fn parses_example() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.scheduler.max_retries, 2);
        assert_eq!(config.scheduler.test_interval_secs, DEFAULT_TEST_INTERVAL_SECS);
        assert_eq!(config.local_queue.workers, 4);
        assert_eq!(config.local_queue.max_jobs, DEFAULT_LOCAL_QUEUE_MAX_JOBS);

        let service = &config.services["clustalo"];
        assert_eq!(
            service.command,
            CommandConfig::Line(String::from("clustalo --threads=${THREADS}"))
        );
        assert_eq!(service.arguments.len(), 2);
        assert_eq!(service.arguments[1].default, Some(InputValue::Integer(1)));
        assert_eq!(service.runners["default"].backend, BackendConfig::Shell);
        assert_eq!(
            service.runners["cluster"].backend,
            BackendConfig::Slurm(BatchBackendConfig {
                args: vec![String::from("--partition=short")]
            })
        );
        assert_eq!(
            service.runners["cluster"].selector_options["max_size"],
            serde_json::json!(1000)
        );
        assert_eq!(
            service.test.as_ref().unwrap().timeout(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.scheduler.jobs_directory, PathBuf::from("jobs"));
        assert_eq!(config.database.path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(config.local_queue.address, DEFAULT_LOCAL_QUEUE_ADDRESS);
        assert!(config.services.is_empty());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let text = r#"
[services.s]
command = ["true"]
runners.default.backend = { type = "pbs" }
"#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_toml("[scheduler]\npoll = 1").is_err());
    }

    #[test]
    fn service_without_runners_is_rejected() {
        let text = r#"
[services.s]
command = ["true"]
runners = {}
"#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(format!("{err:#}").contains("at least one runner"));
    }

    #[test]
    fn duplicate_arguments_are_rejected() {
        let text = r#"
[services.s]
command = "true"
arguments = [{ id = "a", arg = "-a" }, { id = "a", arg = "-b" }]
runners.default.backend = { type = "shell" }
"#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn selectors_are_configured_per_service() {
        let text = r#"
[services.plain]
command = "true"
runners.default.backend = { type = "shell" }

[services.sized]
command = "true"
selector = "limits"
runners.small = { backend = { type = "shell" }, selector_options = { size = 10 } }
runners.large = { backend = { type = "shell" }, selector_options = { size = { min = 11 } } }
"#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.services["plain"].selector, SelectorConfig::Default);
        assert_eq!(config.services["sized"].selector, SelectorConfig::Limits);
    }

    #[test]
    fn unknown_selectors_are_rejected() {
        let text = r#"
[services.s]
command = "true"
selector = "random"
runners.default.backend = { type = "shell" }
"#;
        assert!(Config::from_toml(text).is_err());
    }

    #[test]
    fn malformed_limits_are_rejected() {
        let text = r#"
[services.s]
command = "true"
selector = "limits"
runners.default = { backend = { type = "shell" }, selector_options = { size = "big" } }
"#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(format!("{err:#}").contains("selector option `size`"));
    }

    #[test]
    fn relative_paths_are_resolved() {
        let mut config = Config::default();
        config.resolve_paths(Path::new("/srv/slivka"));
        assert_eq!(
            config.scheduler.jobs_directory,
            PathBuf::from("/srv/slivka/jobs")
        );
        assert_eq!(
            config.database.path,
            PathBuf::from("/srv/slivka/slivka.db")
        );
    }
}
