//! Interpolation of request inputs into command line arguments.

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;

use super::env::expand;
use super::value::InputValue;
use crate::config::ArgumentConfig;

/// The marker replaced by an argument's value.
pub const VALUE_MARKER: &str = "$(value)";

/// An argument template ready for interpolation.
///
/// Environment references in the template are resolved and the template is
/// split into tokens once, when the runner is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// The identifier of the input this argument reads.
    id: String,
    /// The template tokens.
    tokens: Vec<String>,
    /// The value used when the input is not provided.
    default: Option<InputValue>,
    /// The file name the input is linked to in the working directory.
    symlink: Option<String>,
    /// The separator used to join list values into a single value.
    join: Option<String>,
}

impl Argument {
    /// Compiles an argument from its configuration.
    pub fn new(config: &ArgumentConfig, env: &IndexMap<String, String>) -> Result<Self> {
        let expanded = expand(&config.arg, env);
        let tokens = shlex::split(&expanded).with_context(|| {
            format!(
                "failed to split the template of argument `{id}`: `{arg}`",
                id = config.id,
                arg = config.arg
            )
        })?;

        Ok(Self {
            id: config.id.clone(),
            tokens,
            default: config.default.clone(),
            symlink: config.symlink.clone(),
            join: config.join.clone(),
        })
    }

    /// Gets the identifier of the input this argument reads.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the file name the input is linked to, if any.
    pub fn symlink(&self) -> Option<&str> {
        self.symlink.as_deref()
    }

    /// Gets the template tokens.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Selects the effective value for this argument.
    ///
    /// Returns `None` if neither the input nor the default provides one.
    pub fn effective_value<'a>(&'a self, value: Option<&'a InputValue>) -> Option<&'a InputValue> {
        value
            .filter(|v| !v.is_missing())
            .or_else(|| self.default.as_ref().filter(|v| !v.is_missing()))
    }

    /// Appends the tokens produced by `value` to `out`.
    pub fn interpolate(&self, value: Option<&InputValue>, out: &mut Vec<String>) {
        let Some(value) = self.effective_value(value) else {
            return;
        };

        let value = match (&self.symlink, value) {
            (Some(name), InputValue::List(items)) => InputValue::List(
                (0..items.len())
                    .map(|i| InputValue::String(format!("{name}.{i:04}")))
                    .collect(),
            ),
            (Some(name), _) => InputValue::String(name.clone()),
            (None, value) => value.clone(),
        };

        let value = match (&self.join, value) {
            (Some(separator), InputValue::List(items)) => InputValue::String(
                items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(separator),
            ),
            (_, value) => value,
        };

        if !self.tokens.iter().any(|t| t.contains(VALUE_MARKER)) {
            if value.is_truthy() {
                out.extend(self.tokens.iter().cloned());
            }
            return;
        }

        match &value {
            InputValue::List(items) => {
                for item in items {
                    self.substitute(&item.to_string(), out);
                }
            }
            value => self.substitute(&value.to_string(), out),
        }
    }

    /// Appends the template tokens with the marker replaced by `value`.
    fn substitute(&self, value: &str, out: &mut Vec<String>) {
        out.extend(self.tokens.iter().map(|t| t.replace(VALUE_MARKER, value)));
    }
}

/// Interpolates every argument in declaration order.
pub fn interpolate_all(
    arguments: &[Argument],
    inputs: &IndexMap<String, InputValue>,
) -> Vec<String> {
    let mut out = Vec::new();
    for argument in arguments {
        argument.interpolate(inputs.get(argument.id()), &mut out);
    }
    out
}
