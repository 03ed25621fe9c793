//! Split/merge proposal lifecycle.
//!
//! `pending → approved → executed`, or `pending → rejected`. Every transition
//! is a compare-and-set on the stored status, so two callers racing on the
//! same proposal cannot both win. Creation, approval and rejection are written
//! to the action log against the proposals table; those records are never
//! rollback candidates.

mod execute;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::{
    ActionKind, ActionMetadata, NewActionRecord, NewProposal, PROPOSALS_TABLE, ProposalRecord,
    ProposalStatus, ProposalTransition, ProposalType,
};
use crate::error::{DatabaseError, LedgerError, StoreStage};
use crate::ledger::MutationLedger;
use crate::parts::MAX_PART_NAME_LEN;

pub use self::execute::{MergeOutcome, SplitOutcome};

const MIN_RATIONALE_LEN: usize = 3;
const MAX_RATIONALE_LEN: usize = 2000;
const MIN_IDEMPOTENCY_KEY_LEN: usize = 8;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// One successor in a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SplitChild {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f64>,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

impl SplitChild {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: None,
            age: None,
            evidence_ids: Vec::new(),
        }
    }
}

/// Stored payload of a split proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPayload {
    pub parent_part_id: Uuid,
    pub children: Vec<SplitChild>,
}

/// Stored payload of a merge proposal. The first id is the survivor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePayload {
    pub part_ids: Vec<Uuid>,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeSplit {
    pub parent_part_id: Uuid,
    pub children: Vec<SplitChild>,
    pub rationale: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeMerge {
    pub part_ids: Vec<Uuid>,
    pub canonical_name: String,
    pub rationale: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn invalid(message: impl Into<String>) -> LedgerError {
    LedgerError::Validation(message.into())
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), LedgerError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(invalid(format!(
            "{} must be {}-{} characters (got {})",
            field, min, max, len
        )));
    }
    Ok(())
}

fn validate_common(rationale: &str, idempotency_key: Option<&str>) -> Result<(), LedgerError> {
    check_len("rationale", rationale, MIN_RATIONALE_LEN, MAX_RATIONALE_LEN)?;
    if let Some(key) = idempotency_key {
        check_len(
            "idempotencyKey",
            key,
            MIN_IDEMPOTENCY_KEY_LEN,
            MAX_IDEMPOTENCY_KEY_LEN,
        )?;
    }
    Ok(())
}

impl ProposeSplit {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.children.len() < 2 {
            return Err(invalid("a split needs at least 2 children"));
        }
        for child in &self.children {
            check_len("child name", &child.name, 1, MAX_PART_NAME_LEN)?;
            if let Some(age) = child.age
                && !(0.0..=100.0).contains(&age)
            {
                return Err(invalid(format!("child age must be in [0, 100], got {}", age)));
            }
        }
        validate_common(&self.rationale, self.idempotency_key.as_deref())
    }
}

impl ProposeMerge {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.part_ids.len() < 2 {
            return Err(invalid("a merge needs at least 2 parts"));
        }
        let distinct: HashSet<&Uuid> = self.part_ids.iter().collect();
        if distinct.len() != self.part_ids.len() {
            return Err(invalid("merge part ids must be distinct"));
        }
        check_len("canonicalName", &self.canonical_name, 1, MAX_PART_NAME_LEN)?;
        validate_common(&self.rationale, self.idempotency_key.as_deref())
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(proposal: &ProposalRecord) -> Result<T, LedgerError> {
    serde_json::from_value(proposal.payload.clone()).map_err(|e| LedgerError::InvalidProposal {
        id: proposal.id,
        reason: format!("malformed {} payload: {}", proposal.proposal_type, e),
    })
}

pub struct ProposalWorkflow {
    ledger: Arc<MutationLedger>,
    split_confidence_penalty: f64,
}

impl ProposalWorkflow {
    pub fn new(ledger: Arc<MutationLedger>) -> Self {
        Self {
            ledger,
            split_confidence_penalty: LedgerConfig::default().split_confidence_penalty,
        }
    }

    pub fn from_config(ledger: Arc<MutationLedger>, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            split_confidence_penalty: config.split_confidence_penalty,
        }
    }

    pub fn ledger(&self) -> &Arc<MutationLedger> {
        &self.ledger
    }

    pub async fn propose_split(
        &self,
        owner_id: &str,
        request: ProposeSplit,
    ) -> Result<ProposalRecord, LedgerError> {
        self.ledger.trust().authorize(owner_id)?;
        request.validate()?;
        let payload = SplitPayload {
            parent_part_id: request.parent_part_id,
            children: request.children,
        };
        self.submit(
            owner_id,
            ProposalType::Split,
            serde_json::to_value(&payload).map_err(|e| invalid(e.to_string()))?,
            request.rationale,
            request.idempotency_key,
        )
        .await
    }

    pub async fn propose_merge(
        &self,
        owner_id: &str,
        request: ProposeMerge,
    ) -> Result<ProposalRecord, LedgerError> {
        self.ledger.trust().authorize(owner_id)?;
        request.validate()?;
        let payload = MergePayload {
            part_ids: request.part_ids,
            canonical_name: request.canonical_name,
        };
        self.submit(
            owner_id,
            ProposalType::Merge,
            serde_json::to_value(&payload).map_err(|e| invalid(e.to_string()))?,
            request.rationale,
            request.idempotency_key,
        )
        .await
    }

    /// Insert a pending proposal. A resubmission with a known idempotency key
    /// returns the stored proposal and writes nothing.
    async fn submit(
        &self,
        owner_id: &str,
        proposal_type: ProposalType,
        payload: serde_json::Value,
        rationale: String,
        idempotency_key: Option<String>,
    ) -> Result<ProposalRecord, LedgerError> {
        let input = NewProposal {
            proposal_type,
            payload,
            rationale,
            idempotency_key,
        };

        let proposal = match self.ledger.db().insert_proposal(owner_id, &input).await {
            Ok(proposal) => proposal,
            Err(DatabaseError::Duplicate { .. }) => {
                let key = input.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .ledger
                    .db()
                    .find_proposal_by_idempotency_key(owner_id, key)
                    .await
                    .map_err(LedgerError::store(StoreStage::Lookup))?;
                return match existing {
                    Some(existing) => {
                        tracing::debug!(
                            proposal_id = %existing.id,
                            "idempotent proposal resubmission"
                        );
                        Ok(existing)
                    }
                    None => Err(LedgerError::Store {
                        stage: StoreStage::Lookup,
                        source: DatabaseError::NotFound {
                            entity: "proposal".to_string(),
                            id: key.to_string(),
                        },
                    }),
                };
            }
            Err(e) => return Err(LedgerError::store(StoreStage::Insert)(e)),
        };

        tracing::info!(
            proposal_id = %proposal.id,
            proposal_type = %proposal_type,
            "created proposal"
        );
        self.log_proposal_action(ActionKind::CreateProposal, None, &proposal)
            .await;
        Ok(proposal)
    }

    pub async fn approve(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
        approved_by: &str,
    ) -> Result<ProposalRecord, LedgerError> {
        self.decide(owner_id, proposal_id, approved_by, ProposalStatus::Approved)
            .await
    }

    pub async fn reject(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
        approved_by: &str,
    ) -> Result<ProposalRecord, LedgerError> {
        self.decide(owner_id, proposal_id, approved_by, ProposalStatus::Rejected)
            .await
    }

    async fn decide(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
        actor: &str,
        to: ProposalStatus,
    ) -> Result<ProposalRecord, LedgerError> {
        self.ledger.trust().authorize(owner_id)?;
        if actor.trim().is_empty() {
            return Err(invalid("approvedBy is required"));
        }

        let before = self.load(owner_id, proposal_id).await?;
        let after = self
            .transition(owner_id, &before, ProposalStatus::Pending, to, actor)
            .await?;

        let kind = match to {
            ProposalStatus::Rejected => ActionKind::RejectProposal,
            _ => ActionKind::ApproveProposal,
        };
        tracing::info!(proposal_id = %proposal_id, status = %to, actor, "proposal decided");
        self.log_proposal_action(kind, Some(&before), &after).await;
        Ok(after)
    }

    /// Owner-scoped proposal fetch.
    pub async fn load(&self, owner_id: &str, proposal_id: Uuid) -> Result<ProposalRecord, LedgerError> {
        self.ledger
            .db()
            .get_proposal(owner_id, proposal_id)
            .await
            .map_err(LedgerError::store(StoreStage::Fetch))?
            .ok_or(LedgerError::NotFound {
                entity: "proposal",
                id: proposal_id,
            })
    }

    /// Compare-and-set `from → to`. A stale or lost race is `InvalidState`
    /// carrying the status actually stored.
    async fn transition(
        &self,
        owner_id: &str,
        proposal: &ProposalRecord,
        from: ProposalStatus,
        to: ProposalStatus,
        actor: &str,
    ) -> Result<ProposalRecord, LedgerError> {
        if !from.can_transition_to(to) {
            return Err(invalid(format!(
                "proposal cannot move from {} to {}",
                from, to
            )));
        }
        if proposal.status != from {
            return Err(LedgerError::InvalidState {
                id: proposal.id,
                expected: from,
                actual: proposal.status,
            });
        }

        let transition = ProposalTransition {
            from,
            to,
            actor: actor.to_string(),
            at: Utc::now(),
        };
        let updated = self
            .ledger
            .db()
            .transition_proposal(owner_id, proposal.id, &transition)
            .await
            .map_err(LedgerError::store(StoreStage::Transition))?;

        match updated {
            Some(updated) => Ok(updated),
            None => {
                let current = self.load(owner_id, proposal.id).await?;
                Err(LedgerError::InvalidState {
                    id: proposal.id,
                    expected: from,
                    actual: current.status,
                })
            }
        }
    }

    async fn log_proposal_action(
        &self,
        kind: ActionKind,
        before: Option<&ProposalRecord>,
        after: &ProposalRecord,
    ) {
        let old_state = match before.map(ProposalRecord::snapshot).transpose() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(proposal_id = %after.id, "Failed to snapshot proposal: {}", e);
                return;
            }
        };
        let new_state = match after.snapshot() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(proposal_id = %after.id, "Failed to snapshot proposal: {}", e);
                return;
            }
        };
        let metadata = ActionMetadata::default()
            .with_proposal(after.id, after.proposal_type)
            .with_description(after.rationale.clone());

        self.ledger
            .record_action(NewActionRecord {
                user_id: after.user_id.clone(),
                action_kind: kind,
                target_table: PROPOSALS_TABLE.to_string(),
                target_id: after.id,
                old_state,
                new_state,
                metadata,
                created_by: self.ledger.created_by().to_string(),
            })
            .await;
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::{ProposalWorkflow, ProposeMerge, ProposeSplit, SplitChild};
    use crate::db::{ActionKind, ActionQuery, Database, ProposalStatus};
    use crate::error::LedgerError;
    use crate::ledger::{MutationLedger, RecentActionsQuery, TrustLevel};
    use crate::testing::test_db;

    fn workflow(db: Arc<dyn Database>) -> ProposalWorkflow {
        ProposalWorkflow::new(Arc::new(MutationLedger::new(db, TrustLevel::scoped("user-a"))))
    }

    fn split(key: Option<&str>) -> ProposeSplit {
        ProposeSplit {
            parent_part_id: Uuid::new_v4(),
            children: vec![SplitChild::named("Critic A"), SplitChild::named("Critic B")],
            rationale: "two distinct voices".to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn propose_split_creates_pending_and_logs() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());

        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.payload["children"][1]["name"], "Critic B");

        let actions = db
            .list_actions("user-a", &ActionQuery::default())
            .await
            .expect("list");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_kind, ActionKind::CreateProposal);
        assert_eq!(actions[0].target_table, "part_change_proposals");
        assert!(actions[0].old_state.is_none());
    }

    #[tokio::test]
    async fn resubmission_with_same_key_returns_existing() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());

        let first = flow
            .propose_split("user-a", split(Some("retry-key-1")))
            .await
            .expect("first");
        let second = flow
            .propose_split("user-a", split(Some("retry-key-1")))
            .await
            .expect("second");
        assert_eq!(first.id, second.id);

        let creations = db
            .list_actions("user-a", &ActionQuery::default())
            .await
            .expect("list");
        assert_eq!(creations.len(), 1);
    }

    #[tokio::test]
    async fn payload_shape_is_validated() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());

        let mut lonely = split(None);
        lonely.children.truncate(1);
        assert!(matches!(
            flow.propose_split("user-a", lonely).await,
            Err(LedgerError::Validation(_))
        ));

        assert!(matches!(
            flow.propose_split("user-a", split(Some("short"))).await,
            Err(LedgerError::Validation(_))
        ));

        let id = Uuid::new_v4();
        let merge = ProposeMerge {
            part_ids: vec![id, id],
            canonical_name: "Unified".to_string(),
            rationale: "same part".to_string(),
            idempotency_key: None,
        };
        assert!(matches!(
            flow.propose_merge("user-a", merge).await,
            Err(LedgerError::Validation(_))
        ));

        let mut terse = split(None);
        terse.rationale = "no".to_string();
        assert!(flow.propose_split("user-a", terse).await.is_err());
    }

    #[tokio::test]
    async fn decisions_only_apply_to_pending_proposals() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());
        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");

        let approved = flow
            .approve("user-a", proposal.id, "therapist")
            .await
            .expect("approve");
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("therapist"));
        assert!(approved.approved_at.is_some());

        for result in [
            flow.approve("user-a", proposal.id, "therapist").await,
            flow.reject("user-a", proposal.id, "therapist").await,
        ] {
            let err = result.expect_err("not pending");
            assert!(
                matches!(
                    err,
                    LedgerError::InvalidState {
                        expected: ProposalStatus::Pending,
                        actual: ProposalStatus::Approved,
                        ..
                    }
                ),
                "{err}"
            );
            assert!(err.to_string().contains("is not pending (status: approved)"));
        }
    }

    #[tokio::test]
    async fn skipping_approval_is_refused_before_touching_the_store() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());
        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");

        let err = flow
            .transition(
                "user-a",
                &proposal,
                ProposalStatus::Pending,
                ProposalStatus::Executed,
                "agent",
            )
            .await
            .expect_err("pending cannot jump to executed");
        assert!(matches!(err, LedgerError::Validation(_)), "{err}");
        assert!(err.to_string().contains("from pending to executed"));

        let stored = flow.load("user-a", proposal.id).await.expect("load");
        assert_eq!(stored.status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_not_rollbackable() {
        let (db, _dir) = test_db().await;
        let ledger = Arc::new(MutationLedger::new(db.clone(), TrustLevel::scoped("user-a")));
        let flow = ProposalWorkflow::new(ledger.clone());
        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");

        let rejected = flow
            .reject("user-a", proposal.id, "user")
            .await
            .expect("reject");
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert!(flow.approve("user-a", proposal.id, "user").await.is_err());

        let recent = ledger
            .get_recent_actions("user-a", &RecentActionsQuery::default())
            .await
            .expect("recent");
        assert_eq!(recent[0].action_kind, ActionKind::RejectProposal);
        assert!(recent.iter().all(|a| !a.can_rollback));
    }

    #[tokio::test]
    async fn foreign_and_missing_proposals_are_not_found() {
        let (db, _dir) = test_db().await;
        let flow = workflow(db.clone());
        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");

        let other = ProposalWorkflow::new(Arc::new(MutationLedger::new(
            db.clone(),
            TrustLevel::Elevated,
        )));
        let err = other
            .approve("user-b", proposal.id, "someone")
            .await
            .expect_err("foreign");
        assert!(matches!(err, LedgerError::NotFound { entity: "proposal", .. }));

        let err = flow
            .approve("user-a", Uuid::new_v4(), "someone")
            .await
            .expect_err("missing");
        assert!(matches!(err, LedgerError::NotFound { .. }));

        assert!(matches!(
            flow.approve("user-a", proposal.id, " ").await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_approvals_have_one_winner() {
        let (db, _dir) = test_db().await;
        let flow = Arc::new(workflow(db.clone()));
        let proposal = flow
            .propose_split("user-a", split(None))
            .await
            .expect("propose");
        let id = proposal.id;

        let approve = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.approve("user-a", id, "a").await })
        };
        let reject = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.reject("user-a", id, "b").await })
        };
        let results = [
            approve.await.expect("join").is_ok(),
            reject.await.expect("join").is_ok(),
        ];
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }
}
