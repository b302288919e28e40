//! `${{ vars.NAME }}` interpolation.
//!
//! Workflow content is interpolated with repository and owner variables before
//! it is parsed. Unknown variables expand to the empty string.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static VARS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*vars\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid vars regex")
});

/// Replace every `${{ vars.NAME }}` in `input`.
pub fn interpolate_vars(input: &str, vars: &BTreeMap<String, String>) -> String {
    VARS_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Names of all variables referenced in `input`.
pub fn referenced_vars(input: &str) -> Vec<String> {
    VARS_REGEX
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .collect()
}
