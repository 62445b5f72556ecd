//! Environment, credential and caller-variable helpers.
//!
//! Settings are layered: a value in the request wins over an environment
//! variable, which wins over the built-in default. Backends read the
//! environment through the helpers here so that empty variables are
//! treated the same as unset ones everywhere.

use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Value;

use crate::error::ProvisionError;

/// Returns the value of `name` if it is set and not empty.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Returns true if `name` is set to exactly `expected`.
pub fn env_is(name: &str, expected: &str) -> bool {
    env_var(name).as_deref() == Some(expected)
}

/// Parses the value of `name`, failing with [`ProvisionError::Config`] on malformed input.
pub fn env_parse<T>(name: &str) -> Result<Option<T>, ProvisionError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                ProvisionError::Config(format!("invalid value for {}: {:?}: {}", name, raw, e))
            })
        })
        .transpose()
}

/// The invoking user's login name, as recorded in job tags.
pub fn login_user() -> String {
    env_var("USER")
        .or_else(|| env_var("USERNAME"))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Path of the credentials file, `~/.fog`.
pub fn fogfile_path() -> Result<Utf8PathBuf, ProvisionError> {
    let home = dirs::home_dir()
        .ok_or_else(|| ProvisionError::Config("cannot determine home directory".to_string()))?;
    let home = Utf8PathBuf::try_from(home).map_err(|e| {
        ProvisionError::Config(format!("home directory is not valid UTF-8: {}", e))
    })?;
    Ok(home.join(".fog"))
}

/// Reads the `<provider>_token` entry of the default section of `~/.fog`.
pub fn token_from_fogfile(provider: &str) -> Result<String, ProvisionError> {
    token_from_file(&fogfile_path()?, provider)
}

/// Reads a provider token from a fog-style YAML file.
///
/// The file uses Ruby symbol keys, so the lookup is `:default:` then
/// `:<provider>_token:`.
pub fn token_from_file(path: &Utf8Path, provider: &str) -> Result<String, ProvisionError> {
    if !path.is_file() {
        return Err(ProvisionError::Config(format!("cannot find fog file at {}", path)));
    }
    let content = fs::read_to_string(path)
        .map_err(|e| ProvisionError::io(format!("failed to read fog file: {}", path), e))?;
    let contents: Value = serde_yaml::from_str(&content)
        .map_err(|e| ProvisionError::Parse(format!("failed to parse fog file {}: {}", path, e)))?;

    let key = format!(":{}_token", provider);
    contents
        .get(":default")
        .and_then(|section| section.get(key.as_str()))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProvisionError::Config(format!("could not obtain {} token from fog file {}", provider, path))
        })
}

/// Decodes the caller-supplied `vars` string.
///
/// `vars` is YAML (JSON being a subset of it); absent or blank input yields
/// `None`. Anything that does not decode is a validation error.
pub fn parse_vars(vars: Option<&str>) -> Result<Option<Value>, ProvisionError> {
    let Some(raw) = vars.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    let value: Value = serde_yaml::from_str(raw)
        .map_err(|e| ProvisionError::Validation(format!("vars is not valid YAML: {}", e)))?;
    Ok(match value {
        Value::Null => None,
        other => Some(other),
    })
}

/// Looks up a string entry of decoded `vars`.
pub fn var_str<'v>(vars: Option<&'v Value>, key: &str) -> Option<&'v str> {
    vars?.get(key)?.as_str()
}
