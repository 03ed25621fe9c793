use std::path::{Component, PathBuf};

use secrecy::SecretString;

use crate::config::helpers::{
    optional_env, optional_secret_env, parse_bool_env, parse_env, parse_string_env,
};
use crate::error::ConfigError;
use crate::ledger::TrustLevel;
use crate::settings::Settings;

/// Local spool for action records the datastore refused.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

/// Tunables for the mutation ledger, rollback engine and proposal workflow.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub rollback_window_minutes: i64,
    pub match_threshold: f64,
    pub recent_actions_limit: i64,
    pub rollback_candidate_limit: i64,
    pub split_confidence_penalty: f64,
    pub created_by: String,
    pub owner_id: Option<String>,
    pub dev_mode: bool,
    pub service_role_key: Option<SecretString>,
    pub spool: SpoolConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rollback_window_minutes: 30,
            match_threshold: 0.3,
            recent_actions_limit: 10,
            rollback_candidate_limit: 50,
            split_confidence_penalty: 0.1,
            created_by: "agent".to_string(),
            owner_id: None,
            dev_mode: false,
            service_role_key: None,
            spool: SpoolConfig {
                enabled: false,
                path: PathBuf::from("logs/action_spool.jsonl"),
                hash_chain: true,
            },
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn validate_spool_path(raw: &str) -> Result<PathBuf, ConfigError> {
    const KEY: &str = "LEDGER_SPOOL_PATH";
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(KEY, "spool path must not be empty"));
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(invalid(KEY, "spool path must be relative to the working directory"));
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid(KEY, "spool path must not contain '..' components"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(
                    KEY,
                    "spool path must be relative to the working directory",
                ));
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(invalid(
            KEY,
            "spool path must be under 'logs/' and include a filename",
        ));
    }

    Ok(normalized)
}

impl LedgerConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let ledger = &settings.ledger;

        let rollback_window_minutes = parse_env(
            "LEDGER_ROLLBACK_WINDOW_MINUTES",
            ledger.rollback_window_minutes,
        )?;
        if rollback_window_minutes <= 0 {
            return Err(invalid(
                "LEDGER_ROLLBACK_WINDOW_MINUTES",
                "must be a positive number of minutes",
            ));
        }

        let match_threshold = parse_env("LEDGER_MATCH_THRESHOLD", ledger.match_threshold)?;
        if !(0.0..1.0).contains(&match_threshold) {
            return Err(invalid("LEDGER_MATCH_THRESHOLD", "must be in [0, 1)"));
        }

        let recent_actions_limit =
            parse_env("LEDGER_RECENT_ACTIONS_LIMIT", ledger.recent_actions_limit)?;
        if !(1..=50).contains(&recent_actions_limit) {
            return Err(invalid("LEDGER_RECENT_ACTIONS_LIMIT", "must be between 1 and 50"));
        }

        let rollback_candidate_limit = parse_env(
            "LEDGER_ROLLBACK_CANDIDATE_LIMIT",
            ledger.rollback_candidate_limit,
        )?;
        if rollback_candidate_limit < 1 {
            return Err(invalid("LEDGER_ROLLBACK_CANDIDATE_LIMIT", "must be at least 1"));
        }

        let split_confidence_penalty = parse_env(
            "LEDGER_SPLIT_CONFIDENCE_PENALTY",
            ledger.split_confidence_penalty,
        )?;
        if !(0.0..=1.0).contains(&split_confidence_penalty) {
            return Err(invalid("LEDGER_SPLIT_CONFIDENCE_PENALTY", "must be in [0, 1]"));
        }

        let created_by = parse_string_env("LEDGER_CREATED_BY", ledger.created_by.clone())?;
        if created_by.trim().is_empty() {
            return Err(invalid("LEDGER_CREATED_BY", "must not be empty"));
        }

        Ok(Self {
            rollback_window_minutes,
            match_threshold,
            recent_actions_limit,
            rollback_candidate_limit,
            split_confidence_penalty,
            created_by,
            owner_id: optional_env("LEDGER_OWNER_ID")?.or_else(|| ledger.owner_id.clone()),
            dev_mode: parse_bool_env("DEV_MODE", ledger.dev_mode)?,
            service_role_key: optional_secret_env("SUPABASE_SERVICE_ROLE_KEY")?,
            spool: SpoolConfig {
                enabled: parse_bool_env("LEDGER_SPOOL_ENABLED", ledger.spool.enabled)?,
                path: {
                    let raw = parse_string_env("LEDGER_SPOOL_PATH", ledger.spool.path.clone())?;
                    validate_spool_path(&raw)?
                },
                hash_chain: parse_bool_env("LEDGER_SPOOL_HASH_CHAIN", ledger.spool.hash_chain)?,
            },
        })
    }

    /// Elevated only when dev mode and a service-role key are both present.
    /// Otherwise scoped to `owner_id`, falling back to the configured owner.
    pub fn trust_level(&self, owner_id: Option<&str>) -> Result<TrustLevel, ConfigError> {
        if self.dev_mode && self.service_role_key.is_some() {
            tracing::warn!("dev mode with service-role key: action lookups are not owner-scoped");
            return Ok(TrustLevel::Elevated);
        }
        let owner = owner_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.owner_id.clone())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "LEDGER_OWNER_ID".to_string(),
                hint: "a scoped ledger needs an owner id".to_string(),
            })?;
        Ok(TrustLevel::Scoped { owner_id: owner })
    }
}
