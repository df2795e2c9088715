//! Implementation of the `submit` subcommand.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use indexmap::map::Entry;
use uuid::Uuid;

use super::ProjectArgs;
use super::open_database;
use crate::database::Database;
use crate::runner::InputValue;
use crate::runner::Inputs;

/// Arguments to the `submit` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The project arguments.
    #[command(flatten)]
    pub project: ProjectArgs,

    /// The service to run.
    pub service: String,

    /// An input of the request.
    ///
    /// Values are parsed as JSON, falling back to a plain string. Repeating
    /// an input makes a list.
    #[arg(short, long = "input", value_name = "ID=VALUE")]
    pub inputs: Vec<String>,
}

/// Parses `ID=VALUE` pairs into request inputs.
pub fn parse_inputs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Inputs> {
    let mut inputs = Inputs::new();
    for pair in pairs {
        let Some((id, value)) = pair.split_once('=') else {
            bail!("invalid input `{pair}`: expected `ID=VALUE`");
        };

        if id.is_empty() {
            bail!("invalid input `{pair}`: the input identifier is empty");
        }

        let value = serde_json::from_str::<InputValue>(value)
            .unwrap_or_else(|_| InputValue::String(value.to_string()));

        match inputs.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                InputValue::List(items) => items.push(value),
                existing => {
                    let first = std::mem::replace(existing, InputValue::Null);
                    *existing = InputValue::List(vec![first, value]);
                }
            },
        }
    }

    Ok(inputs)
}

/// The main function for the `submit` subcommand.
pub async fn submit(args: Args) -> Result<()> {
    let (_, config) = args.project.load()?;

    if !config.services.contains_key(&args.service) {
        bail!(
            "service `{service}` is not defined in the configuration",
            service = args.service
        );
    }

    let inputs = parse_inputs(args.inputs.iter().map(String::as_str))?;
    let database = open_database(&config).await?;

    let id = Uuid::new_v4();
    database
        .create_request(id, &args.service, &inputs)
        .await
        .with_context(|| format!("failed to submit request to `{}`", args.service))?;

    println!("{id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn values_are_json_or_strings() {
        let inputs = parse_inputs(["n=3", "flag=true", "name=hello world", "x=1.5"]).unwrap();
        assert_eq!(inputs["n"], InputValue::Integer(3));
        assert_eq!(inputs["flag"], InputValue::Bool(true));
        assert_eq!(inputs["name"], InputValue::String("hello world".into()));
        assert_eq!(inputs["x"], InputValue::Float(1.5));
    }

    #[test]
    fn repeated_inputs_make_lists() {
        let inputs = parse_inputs(["f=a", "f=b", "f=c"]).unwrap();
        assert_eq!(
            inputs["f"],
            InputValue::List(vec![
                InputValue::String("a".into()),
                InputValue::String("b".into()),
                InputValue::String("c".into()),
            ])
        );
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_inputs(["novalue"]).is_err());
        assert!(parse_inputs(["=x"]).is_err());
    }
}
