//! Implementation of the `status` subcommand.

use std::io::IsTerminal;
use std::io::stdout;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use colored::Colorize;
use uuid::Uuid;

use super::ProjectArgs;
use super::open_database;
use crate::database::Database;
use crate::database::ServiceStatusRecord;
use crate::status::ServiceStatus;

/// Arguments to the `status` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The project arguments.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// The request to show; shows the health of the services if omitted.
    pub id: Option<Uuid>,

    /// Shows past test results instead of the current ones.
    #[arg(long, conflicts_with = "id")]
    pub history: bool,

    /// Restricts the test results to one service.
    #[arg(long, conflicts_with = "id")]
    pub service: Option<String>,

    /// The maximum number of past test results to show.
    #[arg(long, default_value_t = 20, requires = "history")]
    pub limit: i64,
}

/// Colors a service status for display.
fn colorize(status: ServiceStatus) -> String {
    let text = status.to_string();
    if !stdout().is_terminal() {
        return text;
    }

    match status {
        ServiceStatus::Undefined => text.dimmed().to_string(),
        ServiceStatus::Ok => text.green().to_string(),
        ServiceStatus::Warning => text.yellow().to_string(),
        ServiceStatus::Down => text.red().bold().to_string(),
    }
}

/// Prints a single test result.
fn print_record(record: &ServiceStatusRecord) {
    println!(
        "{timestamp}  {service}/{runner}  {status}  {message}",
        timestamp = record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        service = record.service,
        runner = record.runner,
        status = colorize(record.status),
        message = record.message,
    );
}

/// The main function for the `status` subcommand.
pub async fn status(args: Args) -> Result<()> {
    let (_, config) = args.project.load()?;
    let database = open_database(&config).await?;

    if let Some(id) = args.id {
        let Some(request) = database.get_request(id).await? else {
            bail!("request `{id}` does not exist");
        };

        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    if args.history {
        for record in database
            .list_service_statuses(args.service.as_deref(), Some(args.limit))
            .await?
        {
            print_record(&record);
        }
        return Ok(());
    }

    let current = database.list_current_service_statuses().await?;
    for (service, service_config) in &config.services {
        if args.service.as_ref().is_some_and(|s| s != service) {
            continue;
        }

        for runner in service_config.runners.keys() {
            match current
                .iter()
                .find(|r| &r.service == service && &r.runner == runner)
            {
                Some(record) => print_record(record),
                None => println!(
                    "{placeholder:19}  {service}/{runner}  {status}",
                    placeholder = "-",
                    status = colorize(ServiceStatus::Undefined),
                ),
            }
        }
    }

    Ok(())
}
