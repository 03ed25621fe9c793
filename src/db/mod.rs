//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations the ledger needs. Two implementations exist behind feature flags:
//!
//! - `postgres` (default): Uses `deadpool-postgres` + `tokio-postgres`
//! - `libsql`: Uses libSQL (Turso's SQLite fork) for embedded/edge deployment
//!
//! Every call is a single statement against a single row (or a single
//! filtered read). No multi-statement transaction is exposed, so callers must
//! not assume atomicity across calls.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Name of the unique index guarding proposal idempotency keys.
pub const PROPOSAL_IDEMPOTENCY_CONSTRAINT: &str = "uq_part_change_proposals_idem";

/// Table holding structural-change proposals.
pub const PROPOSALS_TABLE: &str = "part_change_proposals";

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret as _;

            let default_path = crate::config::default_libsql_path();
            let db_path = config
                .libsql_path
                .as_deref()
                .unwrap_or(default_path.as_path());

            let backend = if let Some(ref url) = config.libsql_url {
                let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                    DatabaseError::Pool(
                        "LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string(),
                    )
                })?;
                libsql::LibSqlBackend::new_remote_replica(db_path, url, token.expose_secret())
                    .await?
            } else {
                libsql::LibSqlBackend::new_local(db_path).await?
            };
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        _ => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[cfg(not(feature = "postgres"))]
        _ => Err(DatabaseError::Pool(
            "No database backend available. Enable 'postgres' or 'libsql' feature.".to_string(),
        )),
    }
}

/// Tables whose rows the ledger may mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Parts,
    PartRelationships,
}

impl EntityTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parts => "parts",
            Self::PartRelationships => "part_relationships",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "parts" => Some(Self::Parts),
            "part_relationships" => Some(Self::PartRelationships),
            _ => None,
        }
    }

    /// Singular label used in error messages.
    pub fn entity_label(self) -> &'static str {
        match self {
            Self::Parts => "part",
            Self::PartRelationships => "relationship",
        }
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of mutations the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateEmergingPart,
    UpdatePartAttributes,
    UpdatePartConfidence,
    UpdatePartCategory,
    UpdatePartCharge,
    AddPartEvidence,
    AcknowledgePart,
    CreateRelationship,
    UpdateRelationship,
    CreateProposal,
    ApproveProposal,
    RejectProposal,
    ExecuteSplit,
    ExecuteMerge,
}

impl ActionKind {
    pub const ALL: [ActionKind; 14] = [
        Self::CreateEmergingPart,
        Self::UpdatePartAttributes,
        Self::UpdatePartConfidence,
        Self::UpdatePartCategory,
        Self::UpdatePartCharge,
        Self::AddPartEvidence,
        Self::AcknowledgePart,
        Self::CreateRelationship,
        Self::UpdateRelationship,
        Self::CreateProposal,
        Self::ApproveProposal,
        Self::RejectProposal,
        Self::ExecuteSplit,
        Self::ExecuteMerge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateEmergingPart => "create_emerging_part",
            Self::UpdatePartAttributes => "update_part_attributes",
            Self::UpdatePartConfidence => "update_part_confidence",
            Self::UpdatePartCategory => "update_part_category",
            Self::UpdatePartCharge => "update_part_charge",
            Self::AddPartEvidence => "add_part_evidence",
            Self::AcknowledgePart => "acknowledge_part",
            Self::CreateRelationship => "create_relationship",
            Self::UpdateRelationship => "update_relationship",
            Self::CreateProposal => "create_proposal",
            Self::ApproveProposal => "approve_proposal",
            Self::RejectProposal => "reject_proposal",
            Self::ExecuteSplit => "execute_split",
            Self::ExecuteMerge => "execute_merge",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Proposal lifecycle entries are audit-only: proposals are never deleted
    /// or rewound, so those records cannot be rolled back.
    pub fn is_reversible(self) -> bool {
        !matches!(
            self,
            Self::CreateProposal | Self::ApproveProposal | Self::RejectProposal
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalType {
    Split,
    Merge,
}

impl ProposalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Merge => "merge",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "split" => Some(Self::Split),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proposal lifecycle state.
///
/// `pending → approved → executed` and `pending → rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executed" => Some(Self::Executed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Executed)
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, owner-scoped row the ledger can mutate.
///
/// `superseded_by` is lineage: forward pointers to the entities that replaced
/// this one through a split or merge. It lives beside the attribute blob, not
/// inside it, so attribute writes cannot clobber it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: Uuid,
    pub user_id: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub superseded_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn state(&self) -> EntityState {
        EntityState {
            attributes: self.attributes.clone(),
            superseded_by: self.superseded_by.clone(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(|v| v.as_f64())
    }

    pub fn name(&self) -> Option<&str> {
        self.attribute_str("name")
    }

    /// JSON snapshot stored in action records.
    pub fn snapshot(&self) -> Result<serde_json::Value, DatabaseError> {
        serde_json::to_value(self).map_err(|e| DatabaseError::Serialization(e.to_string()))
    }

    pub fn from_snapshot(value: &serde_json::Value) -> Result<Self, DatabaseError> {
        serde_json::from_value(value.clone())
            .map_err(|e| DatabaseError::Serialization(format!("invalid entity snapshot: {}", e)))
    }
}

/// Full mutable contents of an entity row.
///
/// Writes replace the row's attributes and lineage wholesale with this state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub superseded_by: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Free-form metadata attached to an action record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_changed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_added: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_change: Option<CategoryChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_type: Option<ProposalType>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ActionMetadata {
    pub fn for_part(part_name: impl Into<String>) -> Self {
        Self {
            part_name: Some(part_name.into()),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.change_description = Some(description.into());
        self
    }

    pub fn with_proposal(mut self, id: Uuid, proposal_type: ProposalType) -> Self {
        self.proposal_id = Some(id);
        self.proposal_type = Some(proposal_type);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryChange {
    pub from: String,
    pub to: String,
}

/// Immutable audit entry for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub action_kind: ActionKind,
    pub target_table: String,
    pub target_id: Uuid,
    /// `None` exactly when the action created the target row.
    pub old_state: Option<serde_json::Value>,
    pub new_state: serde_json::Value,
    pub metadata: ActionMetadata,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
    pub rollback_at: Option<DateTime<Utc>>,
}

impl ActionRecord {
    pub fn is_creation(&self) -> bool {
        self.old_state.is_none()
    }

    pub fn entity_table(&self) -> Option<EntityTable> {
        EntityTable::from_db_value(&self.target_table)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewActionRecord {
    pub user_id: String,
    pub action_kind: ActionKind,
    pub target_table: String,
    pub target_id: Uuid,
    pub old_state: Option<serde_json::Value>,
    pub new_state: serde_json::Value,
    pub metadata: ActionMetadata,
    pub created_by: String,
}

/// Filter for listing recent action records, newest first.
#[derive(Debug, Clone)]
pub struct ActionQuery {
    pub limit: i64,
    pub kinds: Vec<ActionKind>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub include_rolled_back: bool,
}

impl Default for ActionQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            kinds: Vec::new(),
            session_id: None,
            since: None,
            include_rolled_back: true,
        }
    }
}

/// Persisted structural-change proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: Uuid,
    pub user_id: String,
    pub proposal_type: ProposalType,
    pub payload: serde_json::Value,
    pub rationale: String,
    pub idempotency_key: Option<String>,
    pub status: ProposalStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub executed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProposalRecord {
    pub fn snapshot(&self) -> Result<serde_json::Value, DatabaseError> {
        serde_json::to_value(self).map_err(|e| DatabaseError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub proposal_type: ProposalType,
    pub payload: serde_json::Value,
    pub rationale: String,
    pub idempotency_key: Option<String>,
}

/// Compare-and-set status change. Applied only while the row is still in `from`.
#[derive(Debug, Clone)]
pub struct ProposalTransition {
    pub from: ProposalStatus,
    pub to: ProposalStatus,
    pub actor: String,
    pub at: DateTime<Utc>,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database` supertrait
// combines them all; leaf consumers can depend on a specific sub-trait instead.

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        input: &NewEntity,
    ) -> Result<EntityRecord, DatabaseError>;
    async fn get_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<EntityRecord>, DatabaseError>;
    /// Overwrite the row's attributes and lineage. Returns `None` when the row
    /// is absent or owned by someone else.
    async fn update_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
        state: &EntityState,
    ) -> Result<Option<EntityRecord>, DatabaseError>;
    async fn delete_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<bool, DatabaseError>;
    /// Rows whose top-level string attribute `key` equals `value`, newest first.
    async fn find_entities_by_attribute(
        &self,
        table: EntityTable,
        user_id: &str,
        key: &str,
        value: &str,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, DatabaseError>;
}

#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn append_action(&self, input: &NewActionRecord) -> Result<ActionRecord, DatabaseError>;
    /// `user_id = None` reads across owners (elevated callers only).
    async fn get_action(
        &self,
        user_id: Option<&str>,
        id: Uuid,
    ) -> Result<Option<ActionRecord>, DatabaseError>;
    async fn list_actions(
        &self,
        user_id: &str,
        query: &ActionQuery,
    ) -> Result<Vec<ActionRecord>, DatabaseError>;
    /// Flip the rollback triple. Returns `false` if the record was already
    /// rolled back (or does not exist).
    async fn mark_action_rolled_back(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Fails with `DatabaseError::Duplicate` when the idempotency key is taken.
    async fn insert_proposal(
        &self,
        user_id: &str,
        input: &NewProposal,
    ) -> Result<ProposalRecord, DatabaseError>;
    async fn get_proposal(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<ProposalRecord>, DatabaseError>;
    async fn find_proposal_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ProposalRecord>, DatabaseError>;
    /// Returns `None` when the row was not in `transition.from`.
    async fn transition_proposal(
        &self,
        user_id: &str,
        id: Uuid,
        transition: &ProposalTransition,
    ) -> Result<Option<ProposalRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: EntityStore + ActionStore + ProposalStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
