//! Error types for the ledger, its datastore boundary and configuration.

use std::fmt;

use uuid::Uuid;

use crate::db::{ActionKind, ProposalStatus};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Datastore errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Unique-index violation on a caller-supplied idempotency key.
    #[error("Duplicate key violates unique constraint {constraint}")]
    Duplicate { constraint: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool checkout failed: {0}")]
    PoolCheckout(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Which datastore call failed underneath a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStage {
    Fetch,
    Insert,
    Update,
    Delete,
    Lookup,
    Transition,
}

impl StoreStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Lookup => "lookup",
            Self::Transition => "transition",
        }
    }
}

impl fmt::Display for StoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the mutation ledger, rollback engine and proposal workflow.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("proposal {id} is not {expected} (status: {actual})")]
    InvalidState {
        id: Uuid,
        expected: ProposalStatus,
        actual: ProposalStatus,
    },

    #[error("invalid proposal {id}: {reason}")]
    InvalidProposal { id: Uuid, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("action {0} has already been rolled back")]
    AlreadyRolledBack(Uuid),

    #[error("action {id} ({kind}) cannot be rolled back")]
    NotReversible { id: Uuid, kind: ActionKind },

    #[error("store error during {stage}: {source}")]
    Store {
        stage: StoreStage,
        #[source]
        source: DatabaseError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub(crate) fn store(stage: StoreStage) -> impl FnOnce(DatabaseError) -> Self {
        move |source| Self::Store { stage, source }
    }
}
