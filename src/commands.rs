//! Implementation of slivka CLI commands.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args as ClapArgs;
use secrecy::SecretString;
use tracing::warn;

use crate::config::CONFIG_FILE_NAME;
use crate::config::Config;
use crate::config::HOME_ENV_VAR;
use crate::config::SECRET_ENV_VAR;
use crate::database::SqliteDatabase;

pub mod cancel;
pub mod local_queue;
pub mod scheduler;
pub mod status;
pub mod submit;

/// Arguments locating the project and its configuration.
#[derive(ClapArgs, Debug)]
pub struct ProjectArgs {
    /// The project directory.
    #[arg(long, env = HOME_ENV_VAR, value_name = "DIR", default_value = ".")]
    pub home: PathBuf,

    /// The configuration file (default: `<home>/config.toml`).
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The secret shared with the local queue.
    #[arg(long, env = SECRET_ENV_VAR, hide_env_values = true)]
    pub secret: Option<String>,
}

impl ProjectArgs {
    /// Loads the configuration, returning the absolute project directory
    /// alongside it.
    ///
    /// A missing default configuration file is treated as an empty one.
    pub fn load(&self) -> Result<(PathBuf, Config)> {
        let home = std::path::absolute(&self.home).with_context(|| {
            format!(
                "failed to resolve project directory `{path}`",
                path = self.home.display()
            )
        })?;

        let path = self
            .config
            .clone()
            .unwrap_or_else(|| home.join(CONFIG_FILE_NAME));

        let mut config = if self.config.is_none() && !path.exists() {
            warn!(
                "configuration file `{path}` does not exist: using defaults",
                path = path.display()
            );
            let mut config = Config::default();
            config.resolve_paths(&home);
            config
        } else {
            Config::from_file(&path, &home)?
        };

        if let Some(secret) = &self.secret {
            config.local_queue.secret = Some(SecretString::from(secret.clone()));
        }

        Ok((home, config))
    }
}

/// Opens the database of a configuration.
pub async fn open_database(config: &Config) -> Result<SqliteDatabase> {
    SqliteDatabase::new(&config.database.path)
        .await
        .with_context(|| {
            format!(
                "failed to open database `{path}`",
                path = config.database.path.display()
            )
        })
}
