//! Secret references in `config.toml`.
//!
//! A value may point at a secret kept outside the file:
//!
//! - `env::VAR` reads `$VAR`
//! - `pass::entry` runs `pass show entry` and keeps the first line
//!
//! Anything else is the secret itself.

use std::process::Command;

/// Where a configured value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef<'a> {
    Plain(&'a str),
    Env(&'a str),
    Pass(&'a str),
}

impl<'a> SecretRef<'a> {
    pub fn parse(value: &'a str) -> Self {
        if let Some(var) = value.strip_prefix("env::") {
            Self::Env(var)
        } else if let Some(entry) = value.strip_prefix("pass::") {
            Self::Pass(entry)
        } else {
            Self::Plain(value)
        }
    }

    pub fn resolve(&self) -> Result<String, String> {
        match self {
            Self::Plain(value) => Ok((*value).to_string()),
            Self::Env(var) => {
                std::env::var(var).map_err(|_| format!("environment variable `{}` is not set", var))
            }
            Self::Pass(entry) => pass_show(entry),
        }
    }
}

/// Resolves `value`, following a secret reference if it is one.
pub fn resolve(value: &str) -> Result<String, String> {
    SecretRef::parse(value).resolve()
}

fn pass_show(entry: &str) -> Result<String, String> {
    let output = Command::new("pass")
        .args(["show", entry])
        .output()
        .map_err(|e| format!("failed to run `pass show {}`: {}", entry, e))?;
    if !output.status.success() {
        return Err(format!(
            "`pass show {}` failed ({}): {}",
            entry,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::to_string)
        .ok_or_else(|| format!("`pass show {}` printed nothing", entry))
}
