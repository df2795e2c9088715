//! Implementation of the `local-queue` subcommand.

use std::pin::pin;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ProjectArgs;
use crate::Config;
use crate::local_queue::Address;
use crate::local_queue::Server;

/// Arguments to the `local-queue` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The project arguments.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// The address to listen on (`host:port` or a unix socket path).
    #[arg(short, long)]
    pub address: Option<String>,

    /// The maximum number of jobs executed at once.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// The number of jobs remembered by the queue.
    #[arg(long)]
    pub max_jobs: Option<usize>,
}

impl Args {
    /// Applies the arguments to the configuration.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(address) = self.address {
            config.local_queue.address = address;
        }

        if let Some(workers) = self.workers {
            config.local_queue.workers = workers;
        }

        if let Some(max_jobs) = self.max_jobs {
            config.local_queue.max_jobs = max_jobs;
        }

        config
    }
}

/// The main function for the `local-queue` subcommand.
pub async fn local_queue(args: Args) -> Result<()> {
    let (_, config) = args.project.load()?;
    let config = args.apply(config);

    let address: Address = config
        .local_queue
        .address
        .parse()
        .with_context(|| format!("invalid address `{}`", config.local_queue.address))?;

    let server = Server::new(
        address,
        config.local_queue.workers,
        config.local_queue.max_jobs,
        config.local_queue.secret,
    );

    let token = CancellationToken::new();
    let mut run = pin!(server.run(token.clone()));

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => {
                info!("received Ctrl-C: stopping running jobs");
                token.cancel();
            }
            res = &mut run => return res,
        }
    }
}
