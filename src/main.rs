//! The slivka command line tool.

use std::io::IsTerminal;
use std::io::stderr;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use slivka::commands;
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand)]
enum Commands {
    /// Runs the scheduler that executes submitted requests.
    Scheduler(commands::scheduler::Args),

    /// Runs the local queue that executes jobs of `local-queue` runners.
    LocalQueue(commands::local_queue::Args),

    /// Submits a request to a service and prints its identifier.
    Submit(commands::submit::Args),

    /// Requests cancellation of a submitted request.
    Cancel(commands::cancel::Args),

    /// Shows a request or the health of the services.
    Status(commands::status::Args),
}

#[derive(Parser)]
#[command(author, version, propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    // `RUST_LOG` takes precedence over the verbosity flags.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(cli.verbose.log_level_filter().as_trace().into())
    });

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Scheduler(args) => commands::scheduler::scheduler(args).await,
        Commands::LocalQueue(args) => commands::local_queue::local_queue(args).await,
        Commands::Submit(args) => commands::submit::submit(args).await,
        Commands::Cancel(args) => commands::cancel::cancel(args).await,
        Commands::Status(args) => commands::status::status(args).await,
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
