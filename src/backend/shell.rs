//! Implementation of the shell backend.
//!
//! Jobs are spawned as child processes of the scheduler. Their handles are
//! lost when the scheduler exits.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Child;
use tracing::info;
use tracing::warn;

use super::Backend;
use super::Command;
use super::Job;
use crate::status::JobStatus;

/// The name of the file receiving the standard output of a job.
pub const STDOUT_FILE_NAME: &str = "stdout";

/// The name of the file receiving the standard error of a job.
pub const STDERR_FILE_NAME: &str = "stderr";

/// Gets the return code of an exited process.
///
/// A process killed by a signal gets the negated signal number.
pub fn return_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

/// Opens the output files of a job in its working directory.
pub fn open_output_files(cwd: &Path) -> Result<(File, File)> {
    let stdout_path = cwd.join(STDOUT_FILE_NAME);
    let stdout = File::create(&stdout_path).with_context(|| {
        format!(
            "failed to create stdout file `{path}`",
            path = stdout_path.display()
        )
    })?;

    let stderr_path = cwd.join(STDERR_FILE_NAME);
    let stderr = File::create(&stderr_path).with_context(|| {
        format!(
            "failed to create stderr file `{path}`",
            path = stderr_path.display()
        )
    })?;

    Ok((stdout, stderr))
}

/// A backend running jobs as child processes.
#[derive(Debug, Default)]
pub struct ShellBackend {
    /// The spawned processes by job identifier.
    children: Mutex<HashMap<String, Child>>,
}

impl ShellBackend {
    /// Constructs a new shell backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a single command.
    fn spawn(&self, command: &Command) -> Result<Job> {
        let (program, args) = command
            .args
            .split_first()
            .context("cannot spawn an empty command")?;
        let (stdout, stderr) = open_output_files(&command.cwd)?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&command.cwd)
            .env_clear()
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))?;

        let id = child
            .id()
            .context("spawned process has no identifier")?
            .to_string();
        info!("spawned process {id} for `{program}`");

        self.children.lock().insert(id.clone(), child);
        Ok(Job::new(id, &command.cwd))
    }
}

#[async_trait]
impl Backend for ShellBackend {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn start(&self, commands: &[Command]) -> Result<Vec<Job>> {
        commands.iter().map(|c| self.spawn(c)).collect()
    }

    async fn status(&self, jobs: &[Job]) -> Result<Vec<JobStatus>> {
        let mut children = self.children.lock();
        jobs.iter()
            .map(|job| {
                let Some(child) = children.get_mut(&job.id) else {
                    return Ok(JobStatus::Interrupted);
                };

                Ok(
                    match child.try_wait().with_context(|| {
                        format!("failed to poll process {id}", id = job.id)
                    })? {
                        Some(status) => JobStatus::from_exit_code(return_code(&status)),
                        None => JobStatus::Running,
                    },
                )
            })
            .collect()
    }

    async fn cancel(&self, jobs: &[Job]) -> Result<()> {
        let mut children = self.children.lock();
        for job in jobs {
            if let Some(child) = children.get_mut(&job.id)
                && let Err(e) = child.start_kill()
            {
                warn!("failed to kill process {id}: {e}", id = job.id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::*;

    fn command(args: &[&str], cwd: &std::path::Path) -> Command {
        let mut env = IndexMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert(String::from("PATH"), path);
        }
        Command {
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env,
        }
    }

    async fn wait_finished(backend: &ShellBackend, jobs: &[Job]) -> Vec<JobStatus> {
        for _ in 0..200 {
            let statuses = backend.status(jobs).await.unwrap();
            if statuses.iter().all(|s| s.is_finished()) {
                return statuses;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("jobs did not finish in time");
    }

    #[tokio::test]
    async fn runs_commands_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ShellBackend::new();
        let commands = [
            command(&["echo", "hello"], dir.path()),
            command(&["sh", "-c", "exit 3"], dir.path()),
            command(&["sh", "-c", "exit 127"], dir.path()),
        ];

        let jobs = backend.start(&commands).await.unwrap();
        assert_eq!(jobs.len(), 3);

        let statuses = wait_finished(&backend, &jobs).await;
        assert_eq!(
            statuses,
            [JobStatus::Completed, JobStatus::Failed, JobStatus::Error]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(STDOUT_FILE_NAME)).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn unknown_job_is_interrupted() {
        let backend = ShellBackend::new();
        let statuses = backend
            .status(&[Job::new("0", "/nonexistent")])
            .await
            .unwrap();
        assert_eq!(statuses, [JobStatus::Interrupted]);
    }

    #[tokio::test]
    async fn cancel_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ShellBackend::new();
        let jobs = backend
            .start(&[command(&["sleep", "30"], dir.path())])
            .await
            .unwrap();
        assert_eq!(backend.status(&jobs).await.unwrap(), [JobStatus::Running]);

        backend.cancel(&jobs).await.unwrap();
        assert_eq!(
            wait_finished(&backend, &jobs).await,
            [JobStatus::Interrupted]
        );
    }

    #[tokio::test]
    async fn missing_program_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ShellBackend::new();
        assert!(
            backend
                .start(&[command(&["/no/such/program"], dir.path())])
                .await
                .is_err()
        );
    }
}
