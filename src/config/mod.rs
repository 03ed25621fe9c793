//! Configuration.
//!
//! Resolution order: `.env` (via dotenvy), then the optional TOML settings
//! file, then process environment variables, which win.

pub(crate) mod helpers;
mod ledger;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, optional_secret_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

pub use self::ledger::{LedgerConfig, SpoolConfig};

/// Which datastore backs the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    LibSql,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "turso" | "sqlite" => Ok(Self::LibSql),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::LibSql => "libsql",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub libsql_path: Option<PathBuf>,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = DatabaseBackend::from_str(&parse_string_env(
            "DATABASE_BACKEND",
            settings.database.backend.clone(),
        )?)?;

        let url = optional_secret_env("DATABASE_URL")?;
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "set DATABASE_URL or use DATABASE_BACKEND=libsql".to_string(),
            });
        }

        let pool_size = parse_env("DATABASE_POOL_SIZE", settings.database.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.libsql_url.clone());
        let libsql_auth_token = optional_secret_env("LIBSQL_AUTH_TOKEN")?;
        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "LIBSQL_AUTH_TOKEN".to_string(),
                hint: "required when LIBSQL_URL is set".to_string(),
            });
        }

        Ok(Self {
            backend,
            url,
            pool_size,
            libsql_path: optional_env("LIBSQL_PATH")?
                .map(PathBuf::from)
                .or_else(|| settings.database.libsql_path.clone()),
            libsql_url,
            libsql_auth_token,
        })
    }
}

/// Default embedded database location under the platform data directory.
pub fn default_libsql_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parts-ledger")
        .join("ledger.db")
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
}

impl Config {
    /// Load `.env`, the settings file and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "failed to load .env file");
        }
        let settings = Settings::load()?;
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            ledger: LedgerConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret as _;

    use super::{DatabaseBackend, DatabaseConfig};
    use crate::config::helpers::with_env_overrides;
    use crate::error::ConfigError;
    use crate::settings::Settings;

    const CLEAR: &[(&str, Option<&str>)] = &[
        ("DATABASE_BACKEND", None),
        ("DATABASE_URL", None),
        ("DATABASE_POOL_SIZE", None),
        ("LIBSQL_PATH", None),
        ("LIBSQL_URL", None),
        ("LIBSQL_AUTH_TOKEN", None),
    ];

    fn with_vars<R>(vars: &[(&'static str, Option<&'static str>)], f: impl FnOnce() -> R) -> R {
        let mut all: Vec<(&str, Option<&str>)> = CLEAR.to_vec();
        all.extend_from_slice(vars);
        with_env_overrides(&all, f)
    }

    #[test]
    fn libsql_is_the_default_backend() {
        let config = with_vars(&[], || DatabaseConfig::resolve(&Settings::default()))
            .expect("database config");
        assert_eq!(config.backend, DatabaseBackend::LibSql);
        assert_eq!(config.pool_size, 10);
        assert!(config.libsql_path.is_none());
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = with_vars(&[("DATABASE_BACKEND", Some("postgres"))], || {
            DatabaseConfig::resolve(&Settings::default())
        })
        .expect_err("url required");
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "DATABASE_URL"));

        let config = with_vars(
            &[
                ("DATABASE_BACKEND", Some("pg")),
                ("DATABASE_URL", Some("postgres://localhost/ledger")),
            ],
            || DatabaseConfig::resolve(&Settings::default()),
        )
        .expect("config");
        assert_eq!(config.backend, DatabaseBackend::Postgres);
        assert_eq!(
            config.url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("postgres://localhost/ledger".to_string())
        );
    }

    #[test]
    fn remote_replica_requires_token() {
        let err = with_vars(&[("LIBSQL_URL", Some("libsql://ledger.turso.io"))], || {
            DatabaseConfig::resolve(&Settings::default())
        })
        .expect_err("token required");
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "LIBSQL_AUTH_TOKEN"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = with_vars(&[("DATABASE_BACKEND", Some("mongo"))], || {
            DatabaseConfig::resolve(&Settings::default())
        })
        .expect_err("unsupported");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "DATABASE_BACKEND");
        assert!(message.contains("mongo"), "unexpected message: {message}");
    }
}
