//! Implementation of the `cancel` subcommand.

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use uuid::Uuid;

use super::ProjectArgs;
use super::open_database;
use crate::database::Database;

/// Arguments to the `cancel` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The project arguments.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// The identifier of the request to cancel.
    pub id: Uuid,
}

/// The main function for the `cancel` subcommand.
///
/// The cancellation is carried out by the scheduler on its next tick.
pub async fn cancel(args: Args) -> Result<()> {
    let (_, config) = args.project.load()?;
    let database = open_database(&config).await?;

    let Some(request) = database.get_request(args.id).await? else {
        bail!("request `{id}` does not exist", id = args.id);
    };

    if request.status.is_finished() {
        bail!(
            "request `{id}` has already finished with status {status}",
            id = args.id,
            status = request.status
        );
    }

    database.create_cancel_request(args.id).await?;
    println!("cancellation of `{id}` requested", id = args.id);
    Ok(())
}
