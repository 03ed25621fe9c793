//! Environment lookup helpers shared by the config resolvers.
//!
//! Empty or whitespace-only values are treated as unset.

use std::str::FromStr;

use secrecy::SecretString;

use crate::error::ConfigError;

#[cfg(test)]
thread_local! {
    static OVERRIDES: std::cell::RefCell<std::collections::HashMap<String, Option<String>>> =
        std::cell::RefCell::new(std::collections::HashMap::new());
}

/// Run `f` with `vars` layered over the process environment on this thread.
/// A `None` value masks the variable as unset.
#[cfg(test)]
pub(crate) fn with_env_overrides<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
    OVERRIDES.with(|cell| {
        let mut map = cell.borrow_mut();
        map.clear();
        for (key, value) in vars {
            map.insert((*key).to_string(), value.map(str::to_string));
        }
    });
    let result = f();
    OVERRIDES.with(|cell| cell.borrow_mut().clear());
    result
}

fn lookup(key: &str) -> Result<Option<String>, ConfigError> {
    #[cfg(test)]
    {
        let injected = OVERRIDES.with(|cell| cell.borrow().get(key).cloned());
        if let Some(value) = injected {
            return Ok(value);
        }
    }
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Read an environment variable, trimming it and mapping empty to `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    Ok(lookup(key)?
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty()))
}

pub(crate) fn parse_string_env(key: &str, default: String) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or(default))
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

pub(crate) fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

pub(crate) fn optional_secret_env(key: &str) -> Result<Option<SecretString>, ConfigError> {
    Ok(optional_env(key)?.map(SecretString::from))
}
