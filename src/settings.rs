//! File-backed settings.
//!
//! Every field has a default, so an absent or partial TOML file is valid.
//! Environment variables override these values in `crate::config`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an optional TOML settings file.
pub const SETTINGS_PATH_ENV: &str = "PARTS_LEDGER_SETTINGS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub ledger: LedgerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// `postgres` or `libsql`.
    pub backend: String,
    pub pool_size: usize,
    pub libsql_path: Option<PathBuf>,
    pub libsql_url: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            pool_size: 10,
            libsql_path: None,
            libsql_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub rollback_window_minutes: i64,
    pub match_threshold: f64,
    pub recent_actions_limit: i64,
    pub rollback_candidate_limit: i64,
    pub split_confidence_penalty: f64,
    pub created_by: String,
    pub dev_mode: bool,
    pub owner_id: Option<String>,
    pub spool: SpoolSettings,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            rollback_window_minutes: 30,
            match_threshold: 0.3,
            recent_actions_limit: 10,
            rollback_candidate_limit: 50,
            split_confidence_penalty: 0.1,
            created_by: "agent".to_string(),
            dev_mode: false,
            owner_id: None,
            spool: SpoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "logs/action_spool.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load from `PARTS_LEDGER_SETTINGS` if set, otherwise defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match crate::config::helpers::optional_env(SETTINGS_PATH_ENV)? {
            Some(path) => {
                tracing::debug!(path = %path, "loading ledger settings file");
                Self::load_from(Path::new(&path))
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [ledger]
            match_threshold = 0.5

            [ledger.spool]
            enabled = true
            "#,
        )
        .expect("parse");
        assert_eq!(settings.ledger.match_threshold, 0.5);
        assert_eq!(settings.ledger.rollback_window_minutes, 30);
        assert!(settings.ledger.spool.enabled);
        assert!(settings.ledger.spool.hash_chain);
        assert_eq!(settings.database.backend, "libsql");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Settings::from_toml_str("[ledger\nmatch_threshold = ").expect_err("invalid");
        assert!(matches!(err, crate::error::ConfigError::ParseError(_)));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "[ledger]\ncreated_by = \"reviewer\"\n").expect("write");
        let settings = Settings::load_from(&path).expect("load");
        assert_eq!(settings.ledger.created_by, "reviewer");
    }
}
