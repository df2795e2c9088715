//! Implementation of the `scheduler` subcommand.

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ProjectArgs;
use super::open_database;
use crate::Config;
use crate::scheduler::Scheduler;

/// Arguments to the `scheduler` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The project arguments.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// The path to the database file.
    #[arg(long, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// The directory job working directories are created in.
    #[arg(long, value_name = "DIR")]
    pub jobs_directory: Option<PathBuf>,

    /// The time between scheduler ticks in milliseconds.
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// The number of failures tolerated before requests are marked as errors.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl Args {
    /// Applies the arguments to the configuration.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(database) = self.database {
            config.database.path = database;
        }

        if let Some(jobs_directory) = self.jobs_directory {
            config.scheduler.jobs_directory = jobs_directory;
        }

        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.scheduler.poll_interval_ms = poll_interval_ms;
        }

        if let Some(max_retries) = self.max_retries {
            config.scheduler.max_retries = max_retries;
        }

        config
    }

    /// Loads the project configuration with the arguments applied.
    ///
    /// Relative paths given on the command line are resolved against the
    /// project directory like the ones in the configuration file.
    pub fn load(self) -> Result<(PathBuf, Config)> {
        let (home, config) = self.project.load()?;
        let mut config = self.apply(config);
        config.resolve_paths(&home);
        Ok((home, config))
    }
}

/// The main function for the `scheduler` subcommand.
pub async fn scheduler(args: Args) -> Result<()> {
    let (home, config) = args.load()?;

    let database = Arc::new(open_database(&config).await?);
    let scheduler = Scheduler::from_config(&config, &home, database)?;

    let token = CancellationToken::new();
    let mut run = pin!(scheduler.run(token.clone()));

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => {
                info!("received Ctrl-C: waiting for the current tick to finish");
                token.cancel();
            }
            res = &mut run => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn overrides_are_resolved_against_home() {
        let home = tempfile::tempdir().unwrap();
        let home_arg = home.path().to_str().unwrap();
        let args = Args::parse_from([
            "scheduler",
            "--home",
            home_arg,
            "--database",
            "custom.db",
            "--jobs-directory",
            "/srv/jobs",
            "--max-retries",
            "1",
        ]);

        let (home, config) = args.load().unwrap();
        assert_eq!(config.database.path, home.join("custom.db"));
        assert_eq!(config.scheduler.jobs_directory, PathBuf::from("/srv/jobs"));
        assert_eq!(config.scheduler.max_retries, 1);
    }

    #[test]
    fn configured_paths_are_kept_without_overrides() {
        let home = tempfile::tempdir().unwrap();
        let home_arg = home.path().to_str().unwrap();
        let args = Args::parse_from(["scheduler", "--home", home_arg]);

        let (home, config) = args.load().unwrap();
        assert_eq!(config.database.path, home.join("slivka.db"));
        assert_eq!(config.scheduler.jobs_directory, home.join("jobs"));
    }
}
