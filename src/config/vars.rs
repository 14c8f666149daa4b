//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` and `${VAR}` substitute the value, missing variables are errors
//! - `${VAR:-fallback}` uses the fallback when VAR is unset or empty
//! - `${VAR-fallback}` uses the fallback only when VAR is unset
//! - `$$` is a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found; all are collected so users fix them in one pass.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();
    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures| resolve(caps, &mut errors))
        .into_owned();
    InterpolationResult { text, errors }
}

fn resolve(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if whole == "$$" {
        return "$".to_string();
    }

    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return whole.to_string();
    };
    let name = name.as_str();
    let op = caps.name("op").map(|m| m.as_str());
    let fallback = caps.name("fallback").map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            whole.to_string()
        }
        Ok(value) if value.is_empty() && op == Some(":-") => fallback.unwrap_or("").to_string(),
        Ok(value) => value,
        Err(_) => match fallback {
            Some(fallback) => fallback.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                whole.to_string()
            }
        },
    }
}
