//! Mutation ledger.
//!
//! Every insert or update of a tracked entity goes through [`MutationLedger`],
//! which appends an immutable [`ActionRecord`] describing the change. The
//! primary write always wins: if the audit append fails the mutation still
//! succeeds and the failure is only logged (and spooled, when configured).

mod matching;
mod patch;
mod rollback;
mod spool;
mod summary;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::{
    ActionKind, ActionMetadata, ActionQuery, ActionRecord, Database, EntityRecord, EntityTable,
    NewActionRecord, NewEntity,
};
use crate::error::{LedgerError, StoreStage};

pub use self::matching::{SimilarityScorer, WordOverlapScorer, best_match};
pub use self::patch::{EntityPatch, RESERVED_KEYS};
pub use self::rollback::{RollbackEngine, RollbackOutcome};
pub use self::spool::ActionSpool;
pub use self::summary::{ActionSummary, summarize};

/// Upper bound on `get_recent_actions` page size.
pub const MAX_RECENT_ACTIONS: i64 = 50;

/// Who the ledger acts for.
///
/// `Scoped` ledgers only accept calls for their own owner. `Elevated` ledgers
/// accept any owner and may look up action records across owners. Entity
/// reads and writes are owner-scoped at either level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustLevel {
    Scoped { owner_id: String },
    Elevated,
}

impl TrustLevel {
    pub fn scoped(owner_id: impl Into<String>) -> Self {
        Self::Scoped {
            owner_id: owner_id.into(),
        }
    }

    /// Fail fast, before touching the datastore, on a missing or foreign owner.
    pub fn authorize(&self, owner_id: &str) -> Result<(), LedgerError> {
        if owner_id.trim().is_empty() {
            return Err(LedgerError::Config("owner id is required".to_string()));
        }
        match self {
            Self::Scoped { owner_id: scoped } if scoped != owner_id => Err(LedgerError::Config(
                format!("ledger is scoped to a different owner than '{owner_id}'"),
            )),
            _ => Ok(()),
        }
    }

    /// Owner filter for action-record lookups by id.
    pub fn action_scope(&self) -> Option<&str> {
        match self {
            Self::Scoped { owner_id } => Some(owner_id),
            Self::Elevated => None,
        }
    }
}

/// Patch and audit details computed from the row a logged update fetched.
#[derive(Debug, Clone)]
pub struct PlannedUpdate {
    pub patch: EntityPatch,
    pub kind: ActionKind,
    pub metadata: ActionMetadata,
}

/// Filter for [`MutationLedger::get_recent_actions`].
#[derive(Debug, Clone, Default)]
pub struct RecentActionsQuery {
    pub limit: Option<i64>,
    pub kinds: Vec<ActionKind>,
    pub session_id: Option<String>,
    pub within_minutes: Option<i64>,
}

pub struct MutationLedger {
    db: Arc<dyn Database>,
    trust: TrustLevel,
    created_by: String,
    recent_actions_limit: i64,
    rollback_window_minutes: i64,
    spool: Option<Arc<ActionSpool>>,
}

impl MutationLedger {
    pub fn new(db: Arc<dyn Database>, trust: TrustLevel) -> Self {
        let defaults = LedgerConfig::default();
        Self {
            db,
            trust,
            created_by: defaults.created_by,
            recent_actions_limit: defaults.recent_actions_limit,
            rollback_window_minutes: defaults.rollback_window_minutes,
            spool: None,
        }
    }

    pub fn from_config(db: Arc<dyn Database>, trust: TrustLevel, config: &LedgerConfig) -> Self {
        Self {
            db,
            trust,
            created_by: config.created_by.clone(),
            recent_actions_limit: config.recent_actions_limit,
            rollback_window_minutes: config.rollback_window_minutes,
            spool: ActionSpool::from_config(&config.spool).map(Arc::new),
        }
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_spool(mut self, spool: ActionSpool) -> Self {
        self.spool = Some(Arc::new(spool));
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn trust(&self) -> &TrustLevel {
        &self.trust
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Owner-scoped fetch. Absent and foreign rows are both `NotFound`.
    pub async fn get_entity(
        &self,
        table: EntityTable,
        owner_id: &str,
        id: Uuid,
    ) -> Result<EntityRecord, LedgerError> {
        self.trust.authorize(owner_id)?;
        self.db
            .get_entity(table, owner_id, id)
            .await
            .map_err(LedgerError::store(StoreStage::Fetch))?
            .ok_or(LedgerError::NotFound {
                entity: table.entity_label(),
                id,
            })
    }

    /// Insert a row and record a creation action (`old_state = None`).
    ///
    /// An insert failure propagates and writes no record.
    pub async fn logged_insert(
        &self,
        table: EntityTable,
        data: Map<String, Value>,
        owner_id: &str,
        kind: ActionKind,
        metadata: ActionMetadata,
    ) -> Result<EntityRecord, LedgerError> {
        self.trust.authorize(owner_id)?;
        if let Some(key) = data.keys().find(|key| RESERVED_KEYS.contains(&key.as_str())) {
            return Err(LedgerError::Validation(format!(
                "insert data may not set reserved field '{}'",
                key
            )));
        }

        let inserted = self
            .db
            .insert_entity(table, owner_id, &NewEntity { attributes: data })
            .await
            .map_err(LedgerError::store(StoreStage::Insert))?;

        tracing::debug!(
            table = %table,
            id = %inserted.id,
            action = %kind,
            "logged insert"
        );

        match inserted.snapshot() {
            Ok(new_state) => {
                self.record_action(NewActionRecord {
                    user_id: owner_id.to_string(),
                    action_kind: kind,
                    target_table: table.as_str().to_string(),
                    target_id: inserted.id,
                    old_state: None,
                    new_state,
                    metadata,
                    created_by: self.created_by.clone(),
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(id = %inserted.id, "Failed to snapshot inserted row for action log: {}", e);
            }
        }
        Ok(inserted)
    }

    /// Fetch the row, apply `patch`, write the result, then record an update
    /// action with the before and after snapshots.
    ///
    /// The fetch and the write are separate statements. A concurrent writer
    /// between them is overwritten (last writer wins).
    pub async fn logged_update(
        &self,
        table: EntityTable,
        id: Uuid,
        patch: &EntityPatch,
        owner_id: &str,
        kind: ActionKind,
        metadata: ActionMetadata,
    ) -> Result<EntityRecord, LedgerError> {
        patch.validate()?;
        self.logged_update_with(table, id, owner_id, |_| {
            Ok(PlannedUpdate {
                patch: patch.clone(),
                kind,
                metadata,
            })
        })
        .await
    }

    /// Like [`logged_update`](Self::logged_update), but the patch, action
    /// kind and metadata are derived from the fetched row.
    pub async fn logged_update_with<F>(
        &self,
        table: EntityTable,
        id: Uuid,
        owner_id: &str,
        plan: F,
    ) -> Result<EntityRecord, LedgerError>
    where
        F: FnOnce(&EntityRecord) -> Result<PlannedUpdate, LedgerError>,
    {
        self.trust.authorize(owner_id)?;

        let before = self.get_entity(table, owner_id, id).await?;
        let PlannedUpdate {
            patch,
            kind,
            metadata,
        } = plan(&before)?;
        let state = patch.apply(&before)?;

        let after = self
            .db
            .update_entity(table, owner_id, id, &state)
            .await
            .map_err(LedgerError::store(StoreStage::Update))?
            .ok_or(LedgerError::NotFound {
                entity: table.entity_label(),
                id,
            })?;

        tracing::debug!(table = %table, id = %id, action = %kind, "logged update");

        match (before.snapshot(), after.snapshot()) {
            (Ok(old_state), Ok(new_state)) => {
                self.record_action(NewActionRecord {
                    user_id: owner_id.to_string(),
                    action_kind: kind,
                    target_table: table.as_str().to_string(),
                    target_id: id,
                    old_state: Some(old_state),
                    new_state,
                    metadata,
                    created_by: self.created_by.clone(),
                })
                .await;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(id = %id, "Failed to snapshot updated row for action log: {}", e);
            }
        }
        Ok(after)
    }

    /// Append an action record. Never fails: a refused write is logged and,
    /// when a spool is configured, written there instead.
    pub(crate) async fn record_action(&self, input: NewActionRecord) -> Option<ActionRecord> {
        match self.db.append_action(&input).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    action = %input.action_kind,
                    target_id = %input.target_id,
                    "Failed to write action record: {}",
                    e
                );
                if let Some(spool) = &self.spool
                    && spool.append(&input, &e.to_string())
                {
                    tracing::info!(path = ?spool.path(), "spooled unwritten action record");
                }
                None
            }
        }
    }

    /// Recent actions for `owner_id`, newest first. Rolled-back records are
    /// included and flagged `can_rollback = false`.
    pub async fn get_recent_actions(
        &self,
        owner_id: &str,
        query: &RecentActionsQuery,
    ) -> Result<Vec<ActionSummary>, LedgerError> {
        self.trust.authorize(owner_id)?;
        let limit = query
            .limit
            .unwrap_or(self.recent_actions_limit)
            .clamp(1, MAX_RECENT_ACTIONS);
        let window = query.within_minutes.unwrap_or(self.rollback_window_minutes);

        let records = self
            .db
            .list_actions(
                owner_id,
                &ActionQuery {
                    limit,
                    kinds: query.kinds.clone(),
                    session_id: query.session_id.clone(),
                    since: Some(Utc::now() - Duration::minutes(window)),
                    include_rolled_back: true,
                },
            )
            .await
            .map_err(LedgerError::store(StoreStage::Lookup))?;

        Ok(records.iter().map(ActionSummary::from_record).collect())
    }
}
