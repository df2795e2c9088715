//! Support shared by the batch scheduler backends.
//!
//! Batch jobs run inside a wrapper script that drops a `started` marker in
//! the working directory and writes the exit code of the command to a
//! `finished` marker. Schedulers purge completed jobs from their listings,
//! so the markers are what tells a finished job apart from a lost one.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::error;
use tracing::trace;

use super::Command;
use super::Job;
use crate::status::JobStatus;

/// The name of the marker created when a job starts.
pub const STARTED_FILE_NAME: &str = "started";

/// The name of the marker holding the exit code of a job.
pub const FINISHED_FILE_NAME: &str = "finished";

/// How long a job listing stays fresh.
pub const LISTING_TTL: Duration = Duration::from_secs(5);

/// How long a job missing from both the listing and the markers is still
/// considered running.
pub const GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Renders the wrapper script for a command.
///
/// If `stdout` is set, the standard output of the command is redirected to
/// that file by the script itself.
pub fn wrapper_script(command: &Command, stdout: Option<&str>) -> Result<String> {
    let line = command.shell_line()?;
    let mut script = String::new();
    writeln!(&mut script, "#!/usr/bin/env sh")?;
    writeln!(&mut script, "touch {STARTED_FILE_NAME}")?;
    match stdout {
        Some(path) => writeln!(&mut script, "{line} > {path}")?,
        None => writeln!(&mut script, "{line}")?,
    }
    writeln!(&mut script, "echo $? > {FINISHED_FILE_NAME}")?;
    Ok(script)
}

/// Builds the environment of a submission command.
///
/// Ambient variables whose names start with one of `prefixes` are added to
/// the job environment so the scheduler's client tools find their
/// configuration.
pub fn submission_env(command: &Command, prefixes: &[&str]) -> IndexMap<String, String> {
    let mut env = command.env.clone();
    for (key, value) in std::env::vars() {
        if prefixes.iter().any(|p| key.starts_with(p)) {
            env.entry(key).or_insert(value);
        }
    }
    env
}

/// The output of a scheduler tool.
#[derive(Debug)]
pub struct ToolOutput {
    /// The standard output.
    pub stdout: String,
    /// The standard error.
    pub stderr: String,
}

/// Runs a scheduler tool and fails if it exits unsuccessfully.
///
/// `input` is written to the standard input of the tool.
pub async fn run_tool(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: Option<&IndexMap<String, String>>,
    input: Option<&str>,
) -> Result<ToolOutput> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    if let Some(env) = env {
        command.env_clear().envs(env);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn `{program}`"))?;

    if let Some(input) = input {
        let mut stdin = child
            .stdin
            .take()
            .with_context(|| format!("failed to open the standard input of `{program}`"))?;
        stdin
            .write_all(input.as_bytes())
            .await
            .with_context(|| format!("failed to write the job script to `{program}`"))?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for `{program}`"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    for line in stderr.lines() {
        trace!("{program} stderr: {line}");
    }

    if !output.status.success() {
        error!(
            "`{program}` exited with {status}, stdout: `{stdout}`, stderr: `{stderr}`",
            status = output.status,
            stdout = stdout.trim(),
            stderr = stderr.trim()
        );
        bail!(
            "`{program}` exited with {status}: {stderr}",
            status = output.status,
            stderr = stderr.trim()
        );
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Reads the exit code from the `finished` marker of a job.
///
/// Returns `None` if the job has not written the marker.
pub async fn read_exit_code(cwd: &Path) -> Result<Option<i32>> {
    let path = cwd.join(FINISHED_FILE_NAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let code = contents.trim().parse().with_context(|| {
                format!(
                    "invalid exit code `{contents}` in `{path}`",
                    contents = contents.trim(),
                    path = path.display()
                )
            })?;
            Ok(Some(code))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| {
            format!(
                "failed to read the finished marker `{path}`",
                path = path.display()
            )
        }),
    }
}

/// Classifies the exit code written to a `finished` marker.
///
/// Shells report a command killed by a signal as `128 + signal`.
pub fn status_from_exit_code(code: i32) -> JobStatus {
    match code {
        0 => JobStatus::Completed,
        127 => JobStatus::Error,
        c if c >= 128 || c < 0 => JobStatus::Interrupted,
        _ => JobStatus::Failed,
    }
}

/// Maps scheduler state codes to job statuses.
///
/// Codes missing from the table are logged and reported as unknown.
#[derive(Debug)]
pub struct StateCodes(HashMap<&'static str, JobStatus>);

impl StateCodes {
    /// Constructs the table from `(code, status)` pairs.
    pub fn new(pairs: &[(&'static str, JobStatus)]) -> Self {
        Self(pairs.iter().copied().collect())
    }

    /// Gets the status for a state code.
    pub fn get(&self, code: &str) -> JobStatus {
        match self.0.get(code) {
            Some(status) => *status,
            None => {
                error!("state code `{code}` is undefined");
                JobStatus::Unknown
            }
        }
    }
}

/// A scheduler job listing cached for a limited time.
#[derive(Debug)]
pub struct CachedListing {
    /// The time a listing stays fresh.
    ttl: Duration,
    /// The last listing and the time it was taken.
    entry: tokio::sync::Mutex<Option<(Instant, HashMap<String, JobStatus>)>>,
}

impl CachedListing {
    /// Constructs an empty listing cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Default::default(),
        }
    }

    /// Gets the cached listing or refreshes it with `fetch`.
    pub async fn get<F, Fut>(&self, fetch: F) -> Result<HashMap<String, JobStatus>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, JobStatus>>>,
    {
        let mut entry = self.entry.lock().await;
        if let Some((taken, listing)) = entry.as_ref()
            && taken.elapsed() < self.ttl
        {
            return Ok(listing.clone());
        }

        let listing = fetch().await?;
        *entry = Some((Instant::now(), listing.clone()));
        Ok(listing)
    }
}

/// Resolves the status of jobs missing from a scheduler listing.
///
/// A job without a `finished` marker is reported as running until it has
/// been missing for the grace period, after which it is interrupted.
#[derive(Debug)]
pub struct MarkerFallback {
    /// How long a missing job is still considered running.
    grace: Duration,
    /// When each missing job was first seen without a marker.
    first_missing: Mutex<HashMap<String, Instant>>,
}

impl MarkerFallback {
    /// Constructs a fallback with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            first_missing: Default::default(),
        }
    }

    /// Determines the status of a job from its markers.
    pub async fn resolve(&self, job: &Job) -> Result<JobStatus> {
        match read_exit_code(&job.cwd).await? {
            Some(code) => {
                self.first_missing.lock().remove(&job.id);
                Ok(status_from_exit_code(code))
            }
            None => {
                let mut first_missing = self.first_missing.lock();
                let since = *first_missing
                    .entry(job.id.clone())
                    .or_insert_with(Instant::now);
                if since.elapsed() < self.grace {
                    Ok(JobStatus::Running)
                } else {
                    first_missing.remove(&job.id);
                    Ok(JobStatus::Interrupted)
                }
            }
        }
    }
}

/// Gets the name of the user running the scheduler.
pub fn username() -> Result<String> {
    whoami::username().map_err(|e| anyhow::anyhow!("failed to determine the current user: {e}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn command() -> Command {
        Command {
            args: vec![String::from("echo"), String::from("a b")],
            cwd: PathBuf::from("/tmp"),
            env: IndexMap::new(),
        }
    }

    #[test]
    fn script_writes_markers() {
        let script = wrapper_script(&command(), None).unwrap();
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines[0], "#!/usr/bin/env sh");
        assert_eq!(lines[1], "touch started");
        assert_eq!(shlex::split(lines[2]).unwrap(), ["echo", "a b"]);
        assert_eq!(lines[3], "echo $? > finished");
    }

    #[test]
    fn script_redirects_stdout() {
        let script = wrapper_script(&command(), Some("stdout")).unwrap();
        assert!(script.lines().nth(2).unwrap().ends_with(" > stdout"));
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(status_from_exit_code(0), JobStatus::Completed);
        assert_eq!(status_from_exit_code(1), JobStatus::Failed);
        assert_eq!(status_from_exit_code(127), JobStatus::Error);
        assert_eq!(status_from_exit_code(130), JobStatus::Interrupted);
        assert_eq!(status_from_exit_code(-1), JobStatus::Interrupted);
    }

    #[test]
    fn unknown_state_codes() {
        let codes = StateCodes::new(&[("R", JobStatus::Running)]);
        assert_eq!(codes.get("R"), JobStatus::Running);
        assert_eq!(codes.get("XYZ"), JobStatus::Unknown);
    }

    #[tokio::test]
    async fn wrapper_script_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = command();
        command.cwd = dir.path().to_path_buf();
        let script = wrapper_script(&command, Some("stdout")).unwrap();
        run_tool("sh", &[], Some(dir.path()), None, Some(&script))
            .await
            .unwrap();

        assert!(dir.path().join(STARTED_FILE_NAME).exists());
        assert_eq!(read_exit_code(dir.path()).await.unwrap(), Some(0));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stdout")).unwrap(),
            "a b\n"
        );
    }

    #[tokio::test]
    async fn failing_tool_is_an_error() {
        let args = [String::from("-c"), String::from("echo no >&2; exit 2")];
        let err = run_tool("sh", &args, None, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no"));
    }

    #[tokio::test]
    async fn marker_fallback_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("42", dir.path());

        let fallback = MarkerFallback::new(Duration::from_secs(60));
        assert_eq!(fallback.resolve(&job).await.unwrap(), JobStatus::Running);

        let expired = MarkerFallback::new(Duration::ZERO);
        assert_eq!(
            expired.resolve(&job).await.unwrap(),
            JobStatus::Interrupted
        );

        std::fs::write(dir.path().join(FINISHED_FILE_NAME), "3\n").unwrap();
        assert_eq!(fallback.resolve(&job).await.unwrap(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn listing_is_cached() {
        let cache = CachedListing::new(Duration::from_secs(60));
        let first = cache
            .get(|| async { anyhow::Ok(HashMap::from([(String::from("1"), JobStatus::Running)])) })
            .await
            .unwrap();
        let second = cache
            .get(|| async { anyhow::Ok(HashMap::new()) })
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
