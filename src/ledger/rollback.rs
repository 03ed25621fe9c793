//! Undo of ledgered mutations.
//!
//! A rollback restores the captured `old_state` (or deletes the row for a
//! creation) and then flips the record's rollback triple. The restore is not
//! itself ledgered. If the restore fails the triple is left untouched, so the
//! record stays eligible for a retry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::{
    ActionKind, ActionQuery, ActionRecord, Database, EntityRecord, EntityState, EntityTable,
};
use crate::error::{DatabaseError, LedgerError, StoreStage};
use crate::ledger::matching::{SimilarityScorer, WordOverlapScorer, best_match};
use crate::ledger::summary::summarize;
use crate::ledger::TrustLevel;

/// Result shape for rollback calls. Rollbacks report failure here instead of
/// returning an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_kind: Option<ActionKind>,
}

impl RollbackOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            action_id: None,
            action_kind: None,
        }
    }
}

pub struct RollbackEngine {
    db: Arc<dyn Database>,
    trust: TrustLevel,
    scorer: Arc<dyn SimilarityScorer>,
    match_threshold: f64,
    candidate_limit: i64,
    default_window_minutes: i64,
}

impl RollbackEngine {
    pub fn new(db: Arc<dyn Database>, trust: TrustLevel) -> Self {
        let defaults = LedgerConfig::default();
        Self {
            db,
            trust,
            scorer: Arc::new(WordOverlapScorer),
            match_threshold: defaults.match_threshold,
            candidate_limit: defaults.rollback_candidate_limit,
            default_window_minutes: defaults.rollback_window_minutes,
        }
    }

    pub fn from_config(db: Arc<dyn Database>, trust: TrustLevel, config: &LedgerConfig) -> Self {
        Self {
            match_threshold: config.match_threshold,
            candidate_limit: config.rollback_candidate_limit,
            default_window_minutes: config.rollback_window_minutes,
            ..Self::new(db, trust)
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    /// Undo one action, returning the record as marked rolled back.
    pub async fn try_rollback_action(
        &self,
        action_id: Uuid,
        reason: &str,
    ) -> Result<ActionRecord, LedgerError> {
        let record = self
            .db
            .get_action(self.trust.action_scope(), action_id)
            .await
            .map_err(LedgerError::store(StoreStage::Lookup))?
            .ok_or(LedgerError::NotFound {
                entity: "action",
                id: action_id,
            })?;

        if record.rolled_back {
            return Err(LedgerError::AlreadyRolledBack(action_id));
        }
        if !record.action_kind.is_reversible() {
            return Err(LedgerError::NotReversible {
                id: action_id,
                kind: record.action_kind,
            });
        }
        let table = record.entity_table().ok_or_else(|| {
            LedgerError::Validation(format!(
                "action {} targets unsupported table '{}'",
                action_id, record.target_table
            ))
        })?;

        if record.is_creation() {
            let deleted = self
                .db
                .delete_entity(table, &record.user_id, record.target_id)
                .await
                .map_err(LedgerError::store(StoreStage::Delete))?;
            if !deleted {
                tracing::warn!(
                    action_id = %action_id,
                    target_id = %record.target_id,
                    "created row already gone; marking creation rolled back"
                );
            }
        } else {
            self.restore(&record, table).await?;
        }

        let now = Utc::now();
        let flipped = self
            .db
            .mark_action_rolled_back(action_id, reason, now)
            .await
            .map_err(LedgerError::store(StoreStage::Transition))?;
        if !flipped {
            return Err(LedgerError::AlreadyRolledBack(action_id));
        }

        tracing::info!(
            action_id = %action_id,
            action = %record.action_kind,
            target_id = %record.target_id,
            "rolled back action"
        );

        Ok(ActionRecord {
            rolled_back: true,
            rollback_reason: Some(reason.to_string()),
            rollback_at: Some(now),
            ..record
        })
    }

    /// Put back the attributes captured before `record`. Lineage is not
    /// restored wholesale: only the successors this action added are removed,
    /// so pointers appended by later splits or merges survive.
    async fn restore(&self, record: &ActionRecord, table: EntityTable) -> Result<(), LedgerError> {
        let corrupt = |e: DatabaseError| {
            LedgerError::Validation(format!("action {} has a corrupt snapshot: {}", record.id, e))
        };
        let before = record
            .old_state
            .as_ref()
            .map(EntityRecord::from_snapshot)
            .transpose()
            .map_err(corrupt)?
            .ok_or_else(|| {
                LedgerError::Validation(format!("action {} has no prior state", record.id))
            })?;
        let after = EntityRecord::from_snapshot(&record.new_state).map_err(corrupt)?;

        let current = self
            .db
            .get_entity(table, &record.user_id, record.target_id)
            .await
            .map_err(LedgerError::store(StoreStage::Fetch))?
            .ok_or(LedgerError::NotFound {
                entity: table.entity_label(),
                id: record.target_id,
            })?;

        let added: Vec<Uuid> = after
            .superseded_by
            .iter()
            .filter(|id| !before.superseded_by.contains(*id))
            .copied()
            .collect();
        let state = EntityState {
            attributes: before.attributes,
            superseded_by: current
                .superseded_by
                .into_iter()
                .filter(|id| !added.contains(id))
                .collect(),
        };

        self.db
            .update_entity(table, &record.user_id, record.target_id, &state)
            .await
            .map_err(LedgerError::store(StoreStage::Update))?
            .ok_or(LedgerError::NotFound {
                entity: table.entity_label(),
                id: record.target_id,
            })?;
        Ok(())
    }

    /// Undo one action, reporting the outcome instead of erroring.
    pub async fn rollback_action(&self, action_id: Uuid, reason: &str) -> RollbackOutcome {
        match self.try_rollback_action(action_id, reason).await {
            Ok(record) => RollbackOutcome {
                success: true,
                message: format!(
                    "Rolled back: {}",
                    summarize(record.action_kind, &record.metadata)
                ),
                action_id: Some(record.id),
                action_kind: Some(record.action_kind),
            },
            Err(e) => {
                tracing::debug!(action_id = %action_id, "rollback failed: {}", e);
                RollbackOutcome {
                    action_id: Some(action_id),
                    ..RollbackOutcome::failed(e.to_string())
                }
            }
        }
    }

    /// Resolve `description` to the best-matching recent action and undo it.
    ///
    /// Candidates are the owner's reversible, not-yet-rolled-back actions in
    /// the last `within_minutes` (default from config), newest first.
    pub async fn rollback_by_description(
        &self,
        owner_id: &str,
        description: &str,
        reason: &str,
        within_minutes: Option<i64>,
    ) -> RollbackOutcome {
        if let Err(e) = self.trust.authorize(owner_id) {
            return RollbackOutcome::failed(e.to_string());
        }
        let window = within_minutes.unwrap_or(self.default_window_minutes);

        let candidates = match self
            .db
            .list_actions(
                owner_id,
                &ActionQuery {
                    limit: self.candidate_limit,
                    kinds: ActionKind::ALL
                        .into_iter()
                        .filter(|kind| kind.is_reversible())
                        .collect(),
                    session_id: None,
                    since: Some(Utc::now() - Duration::minutes(window)),
                    include_rolled_back: false,
                },
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                return RollbackOutcome::failed(
                    LedgerError::store(StoreStage::Lookup)(e).to_string(),
                );
            }
        };

        if candidates.is_empty() {
            return RollbackOutcome::failed(format!(
                "No recent actions to roll back in the last {window} minutes"
            ));
        }

        let summaries: Vec<String> = candidates
            .iter()
            .map(|r| summarize(r.action_kind, &r.metadata))
            .collect();
        let Some((idx, score)) = best_match(
            self.scorer.as_ref(),
            &summaries,
            description,
            self.match_threshold,
        ) else {
            return RollbackOutcome::failed(format!(
                "No action matching \"{description}\" found in the last {window} minutes"
            ));
        };

        let chosen = &candidates[idx];
        tracing::info!(
            action_id = %chosen.id,
            score,
            summary = %summaries[idx],
            "matched rollback description"
        );
        self.rollback_action(chosen.id, reason).await
    }
}
