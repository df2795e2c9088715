//! Implementation of runner selectors.
//!
//! A selector picks the runner a request is executed with, or rejects the
//! request by selecting nothing.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use serde_json::Value;

use crate::config::SelectorConfig;
use crate::config::ServiceConfig;
use crate::runner::InputValue;
use crate::runner::Inputs;

/// The selector options of one runner.
pub type Options = IndexMap<String, serde_json::Value>;

/// The name of the runner picked by [`DefaultSelector`].
pub const DEFAULT_RUNNER: &str = "default";

/// Information about the service a selector chooses for.
#[derive(Debug, Clone, Default)]
pub struct SelectorContext {
    /// The name of the service.
    pub service: String,
    /// The runners of the service in configuration order.
    pub runners: Vec<String>,
    /// The selector options by runner name.
    pub options: IndexMap<String, Options>,
}

impl SelectorContext {
    /// Gets the selector options of a runner.
    ///
    /// Runners without options get an empty set.
    pub fn options(&self, runner: &str) -> &Options {
        static EMPTY: std::sync::LazyLock<Options> = std::sync::LazyLock::new(Options::new);
        self.options.get(runner).unwrap_or(&EMPTY)
    }
}

/// Selects the runner of a request.
pub trait Selector: Send + Sync {
    /// Selects a runner by name.
    ///
    /// Returns `None` to reject the request.
    fn select(&self, inputs: &Inputs, context: &SelectorContext) -> Result<Option<String>>;
}

/// A selector that always picks the `default` runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSelector;

impl Selector for DefaultSelector {
    fn select(&self, _: &Inputs, _: &SelectorContext) -> Result<Option<String>> {
        Ok(Some(String::from(DEFAULT_RUNNER)))
    }
}

/// Computes data shared by the limits of one selection.
type Setup<S> = Box<dyn Fn(&Inputs) -> Result<S> + Send + Sync>;

/// Decides whether a request fits a runner.
type Limit<S> = Box<dyn Fn(&Inputs, &S, &Options) -> Result<bool> + Send + Sync>;

/// A selector picking the first runner whose limit accepts the request.
///
/// The setup step runs once per selection and its result is handed to every
/// limit. Limits are tried in the order they were added.
pub struct Limits<S> {
    /// The setup step.
    setup: Setup<S>,
    /// The limits by runner name.
    limits: Vec<(String, Limit<S>)>,
}

impl Limits<()> {
    /// Constructs a selector without a setup step.
    pub fn new() -> Self {
        Self::with_setup(|_| Ok(()))
    }
}

impl<S> Limits<S> {
    /// Constructs a selector with a setup step.
    pub fn with_setup(setup: impl Fn(&Inputs) -> Result<S> + Send + Sync + 'static) -> Self {
        Self {
            setup: Box::new(setup),
            limits: Vec::new(),
        }
    }

    /// Adds the limit of a runner.
    pub fn limit(
        mut self,
        runner: impl Into<String>,
        limit: impl Fn(&Inputs, &S, &Options) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.limits.push((runner.into(), Box::new(limit)));
        self
    }
}

impl<S> fmt::Debug for Limits<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limits")
            .field(
                "runners",
                &self.limits.iter().map(|(r, _)| r).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<S> Selector for Limits<S> {
    fn select(&self, inputs: &Inputs, context: &SelectorContext) -> Result<Option<String>> {
        let data = (self.setup)(inputs)?;
        for (runner, limit) in &self.limits {
            if limit(inputs, &data, context.options(runner))? {
                return Ok(Some(runner.clone()));
            }
        }

        Ok(None)
    }
}

/// An inclusive range an input must fall in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    /// The smallest admitted measure.
    pub min: Option<f64>,
    /// The largest admitted measure.
    pub max: Option<f64>,
}

impl Bound {
    /// Parses a bound from a selector option.
    ///
    /// A number is a maximum; a table may hold `min` and `max` numbers.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(max) => Ok(Self {
                min: None,
                max: max.as_f64(),
            }),
            Value::Object(table) => {
                let number = |key: &str| -> Result<Option<f64>> {
                    match table.get(key) {
                        None | Some(Value::Null) => Ok(None),
                        Some(Value::Number(n)) => Ok(n.as_f64()),
                        Some(other) => bail!("`{key}` must be a number, got `{other}`"),
                    }
                };

                if let Some(key) = table.keys().find(|k| *k != "min" && *k != "max") {
                    bail!("unknown bound key `{key}`");
                }

                Ok(Self {
                    min: number("min")?,
                    max: number("max")?,
                })
            }
            other => bail!("expected a number or a table with `min` and `max`, got `{other}`"),
        }
    }

    /// Returns `true` if the measure lies within the bound.
    pub fn contains(&self, measure: f64) -> bool {
        self.min.is_none_or(|min| measure >= min) && self.max.is_none_or(|max| measure <= max)
    }
}

/// Measures an input for comparison against a [`Bound`].
///
/// Returns `None` for values that are not bounded.
fn measure(value: &InputValue) -> Option<f64> {
    match value {
        InputValue::Integer(n) => Some(*n as f64),
        InputValue::Float(n) => Some(*n),
        InputValue::String(s) => Some(s.chars().count() as f64),
        InputValue::List(values) => Some(values.len() as f64),
        InputValue::Null | InputValue::Bool(_) => None,
    }
}

/// The limit of [`SelectorConfig::Limits`] runners.
///
/// Every input named in the runner's options must lie within its bound.
/// Inputs that are missing or cannot be measured pass.
fn within_bounds(inputs: &Inputs, _: &(), options: &Options) -> Result<bool> {
    for (id, value) in options {
        let bound = Bound::from_value(value)
            .with_context(|| format!("invalid selector option `{id}`"))?;
        if let Some(measure) = inputs.get(id).and_then(measure)
            && !bound.contains(measure)
        {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Creates the selector a service is configured with.
pub fn create_selector(service: &ServiceConfig) -> Arc<dyn Selector> {
    match service.selector {
        SelectorConfig::Default => Arc::new(DefaultSelector),
        SelectorConfig::Limits => Arc::new(
            service
                .runners
                .keys()
                .fold(Limits::new(), |selector, runner| {
                    selector.limit(runner.clone(), within_bounds)
                }),
        ),
    }
}
