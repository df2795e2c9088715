//! Environment variable expansion for runner templates.

use std::borrow::Cow;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Captures;
use regex::Regex;

/// Matches `$$`, `$NAME` and `${NAME}`.
static VARIABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: this is checked statically with tests to always unwrap.
    Regex::new(r"(?i)\$(?:(\$)|([_a-z]\w*)|\{([_a-z]\w*)\})").unwrap()
});

/// Expands variable references in `template` using only `env`.
///
/// Unknown variables expand to an empty string and `$$` produces a literal
/// `$`.
pub fn expand<'a>(template: &'a str, env: &IndexMap<String, String>) -> Cow<'a, str> {
    VARIABLE_REGEX.replace_all(template, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            return String::from("$");
        }

        let name = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        env.get(name).cloned().unwrap_or_default()
    })
}

/// Builds a runner environment.
///
/// The base environment holds `PATH` and `SLIVKA_HOME` and every declared
/// entry is expanded against the entries resolved before it, in
/// declaration order.
pub fn resolve(
    base: IndexMap<String, String>,
    declared: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let mut env = base;
    for (key, value) in declared {
        let value = expand(value, &env).into_owned();
        env.insert(key.clone(), value);
    }
    env
}

/// Reads the ambient variables every runner environment starts from.
pub fn base_environment(home: &std::path::Path) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    if let Some(path) = std::env::var_os("PATH") {
        env.insert(String::from("PATH"), path.to_string_lossy().into_owned());
    }
    env.insert(
        String::from("SLIVKA_HOME"),
        home.to_string_lossy().into_owned(),
    );
    env
}
