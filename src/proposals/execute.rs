//! Applying approved proposals.
//!
//! Execution is a sequence of independent ledgered writes with no enclosing
//! transaction. When a step fails the proposal stays `approved` and earlier
//! steps stay applied; each of those writes has its own action record and can
//! be rolled back individually. Re-running a partially executed proposal is
//! not safe.

use chrono::Utc;
use uuid::Uuid;

use crate::db::{
    ActionKind, ActionMetadata, EntityRecord, EntityTable, ProposalRecord, ProposalStatus,
    ProposalType,
};
use crate::error::LedgerError;
use crate::ledger::EntityPatch;
use crate::parts::{EvolutionEntry, PartAttributes, PartStatus};
use crate::proposals::{MergePayload, ProposalWorkflow, SplitPayload, parse_payload};

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub proposal: ProposalRecord,
    pub parent: EntityRecord,
    pub children: Vec<EntityRecord>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub proposal: ProposalRecord,
    pub canonical: EntityRecord,
    pub merged: Vec<EntityRecord>,
}

impl ProposalWorkflow {
    async fn load_approved(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
        expected: ProposalType,
    ) -> Result<ProposalRecord, LedgerError> {
        self.ledger.trust().authorize(owner_id)?;
        let proposal = self.load(owner_id, proposal_id).await?;
        if proposal.proposal_type != expected {
            return Err(LedgerError::InvalidProposal {
                id: proposal_id,
                reason: format!(
                    "expected a {} proposal, found {}",
                    expected, proposal.proposal_type
                ),
            });
        }
        if proposal.status != ProposalStatus::Approved {
            return Err(LedgerError::InvalidState {
                id: proposal_id,
                expected: ProposalStatus::Approved,
                actual: proposal.status,
            });
        }
        Ok(proposal)
    }

    async fn mark_executed(
        &self,
        owner_id: &str,
        proposal: &ProposalRecord,
    ) -> Result<ProposalRecord, LedgerError> {
        let actor = self.ledger.created_by().to_string();
        self.transition(
            owner_id,
            proposal,
            ProposalStatus::Approved,
            ProposalStatus::Executed,
            &actor,
        )
        .await
        .inspect_err(|e| {
            tracing::warn!(
                proposal_id = %proposal.id,
                "split/merge applied but proposal not marked executed: {}",
                e
            );
        })
    }

    /// Replace the parent part with the proposed children.
    ///
    /// Children inherit the parent's profile with reduced confidence and empty
    /// evidence. The parent's lineage then gains every child id.
    pub async fn execute_split(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
    ) -> Result<SplitOutcome, LedgerError> {
        let proposal = self
            .load_approved(owner_id, proposal_id, ProposalType::Split)
            .await?;
        let payload: SplitPayload = parse_payload(&proposal)?;
        if payload.children.len() < 2 {
            return Err(LedgerError::InvalidProposal {
                id: proposal_id,
                reason: "split payload has fewer than 2 children".to_string(),
            });
        }

        let parent = self
            .ledger
            .get_entity(EntityTable::Parts, owner_id, payload.parent_part_id)
            .await?;
        let template = PartAttributes::from_record(&parent)?;
        let confidence = (template.confidence - self.split_confidence_penalty).clamp(0.0, 1.0);
        let now = Utc::now();

        let mut children = Vec::with_capacity(payload.children.len());
        for requested in &payload.children {
            let child = PartAttributes {
                name: requested.name.clone(),
                status: PartStatus::Emerging,
                age: requested.age.or(template.age),
                role: requested.role.clone().or_else(|| template.role.clone()),
                confidence,
                evidence_count: 0,
                recent_evidence: Vec::new(),
                story: template.story.clone().with_entry(EvolutionEntry::now(
                    format!("Split from {}", template.name),
                    "Split execution",
                )),
                acknowledged_at: None,
                last_active: Some(now),
                last_charged_at: None,
                last_charge_intensity: None,
                ..template.clone()
            };
            let metadata = ActionMetadata::for_part(requested.name.as_str())
                .with_proposal(proposal_id, ProposalType::Split)
                .with_description(format!("Split from {}", template.name));

            let created = self
                .ledger
                .logged_insert(
                    EntityTable::Parts,
                    child.into_attributes()?,
                    owner_id,
                    ActionKind::CreateEmergingPart,
                    metadata,
                )
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        proposal_id = %proposal_id,
                        created = children.len(),
                        "split aborted while creating children: {}",
                        e
                    );
                })?;
            children.push(created);
        }

        let child_ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();
        let parent = self
            .ledger
            .logged_update(
                EntityTable::Parts,
                parent.id,
                &EntityPatch::new().supersede(child_ids.iter().copied()),
                owner_id,
                ActionKind::ExecuteSplit,
                ActionMetadata::for_part(template.name.as_str())
                    .with_proposal(proposal_id, ProposalType::Split)
                    .with_description("Updated lineage after split"),
            )
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    proposal_id = %proposal_id,
                    orphaned = ?child_ids,
                    "split children created but parent lineage not updated: {}",
                    e
                );
            })?;

        let proposal = self.mark_executed(owner_id, &proposal).await?;
        tracing::info!(
            proposal_id = %proposal_id,
            parent_id = %parent.id,
            children = children.len(),
            "executed split"
        );
        Ok(SplitOutcome {
            proposal,
            parent,
            children,
        })
    }

    /// Rename the first listed part and supersede the rest by it.
    ///
    /// Every source must exist before anything is written. Superseded parts
    /// are kept, not deleted.
    pub async fn execute_merge(
        &self,
        owner_id: &str,
        proposal_id: Uuid,
    ) -> Result<MergeOutcome, LedgerError> {
        let proposal = self
            .load_approved(owner_id, proposal_id, ProposalType::Merge)
            .await?;
        let payload: MergePayload = parse_payload(&proposal)?;
        let Some((&canonical_id, rest)) = payload.part_ids.split_first() else {
            return Err(LedgerError::InvalidProposal {
                id: proposal_id,
                reason: "merge payload lists no parts".to_string(),
            });
        };
        if rest.is_empty() || rest.contains(&canonical_id) {
            return Err(LedgerError::InvalidProposal {
                id: proposal_id,
                reason: "merge needs at least 2 distinct parts".to_string(),
            });
        }

        let mut sources = Vec::with_capacity(payload.part_ids.len());
        for id in &payload.part_ids {
            sources.push(
                self.ledger
                    .get_entity(EntityTable::Parts, owner_id, *id)
                    .await?,
            );
        }

        let canonical_name = payload.canonical_name.as_str();
        let previous_name = sources[0].name().unwrap_or_default().to_string();
        let canonical = self
            .ledger
            .logged_update(
                EntityTable::Parts,
                canonical_id,
                &EntityPatch::new().set("name", canonical_name),
                owner_id,
                ActionKind::UpdatePartAttributes,
                ActionMetadata::for_part(previous_name)
                    .with_proposal(proposal_id, ProposalType::Merge)
                    .with_description(format!("Renamed to {} during merge", canonical_name)),
            )
            .await?;

        let mut merged = Vec::with_capacity(rest.len());
        for source in &sources[1..] {
            let superseded = self
                .ledger
                .logged_update(
                    EntityTable::Parts,
                    source.id,
                    &EntityPatch::new().supersede([canonical.id]),
                    owner_id,
                    ActionKind::ExecuteMerge,
                    ActionMetadata::for_part(canonical_name)
                        .with_proposal(proposal_id, ProposalType::Merge)
                        .with_description(format!(
                            "Superseded {} by {}",
                            source.name().unwrap_or_default(),
                            canonical_name
                        )),
                )
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        proposal_id = %proposal_id,
                        superseded = merged.len(),
                        "merge aborted partway: {}",
                        e
                    );
                })?;
            merged.push(superseded);
        }

        let proposal = self.mark_executed(owner_id, &proposal).await?;
        tracing::info!(
            proposal_id = %proposal_id,
            canonical_id = %canonical.id,
            merged = merged.len(),
            "executed merge"
        );
        Ok(MergeOutcome {
            proposal,
            canonical,
            merged,
        })
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    use crate::db::{
        ActionKind, ActionMetadata, ActionQuery, Database, EntityRecord, EntityTable,
        ProposalStatus,
    };
    use crate::error::{LedgerError, StoreStage};
    use crate::ledger::{MutationLedger, TrustLevel};
    use crate::parts::PartAttributes;
    use crate::proposals::{ProposalWorkflow, ProposeMerge, ProposeSplit, SplitChild};
    use crate::testing::{FaultyDb, test_db};

    async fn seed_part(ledger: &MutationLedger, name: &str) -> EntityRecord {
        let attrs = json!({
            "name": name,
            "category": "manager",
            "confidence": 0.6,
            "evidence_count": 4,
            "triggers": ["criticism"],
            "role": "keeps standards",
            "story": {"evolution": [{"timestamp": "2026-01-01T00:00:00Z", "change": "Part created", "trigger": "seed"}]}
        });
        ledger
            .logged_insert(
                EntityTable::Parts,
                attrs.as_object().cloned().expect("object"),
                "user-a",
                ActionKind::CreateEmergingPart,
                ActionMetadata::for_part(name),
            )
            .await
            .expect("seed part")
    }

    async fn approved_split(flow: &ProposalWorkflow, parent: Uuid) -> Uuid {
        let proposal = flow
            .propose_split(
                "user-a",
                ProposeSplit {
                    parent_part_id: parent,
                    children: vec![
                        SplitChild {
                            role: Some("protects".to_string()),
                            ..SplitChild::named("Critic A")
                        },
                        SplitChild::named("Critic B"),
                    ],
                    rationale: "two voices".to_string(),
                    idempotency_key: None,
                },
            )
            .await
            .expect("propose");
        flow.approve("user-a", proposal.id, "user")
            .await
            .expect("approve");
        proposal.id
    }

    #[tokio::test]
    async fn split_children_inherit_with_penalty() {
        let (db, _dir) = test_db().await;
        let ledger = Arc::new(MutationLedger::new(db.clone(), TrustLevel::scoped("user-a")));
        let flow = ProposalWorkflow::new(ledger.clone());
        let parent = seed_part(&ledger, "Critic").await;
        let proposal_id = approved_split(&flow, parent.id).await;

        let outcome = flow
            .execute_split("user-a", proposal_id)
            .await
            .expect("execute");
        assert_eq!(outcome.proposal.status, ProposalStatus::Executed);
        assert_eq!(outcome.proposal.executed_by.as_deref(), Some("agent"));
        assert_eq!(
            outcome.parent.superseded_by,
            outcome.children.iter().map(|c| c.id).collect::<Vec<_>>()
        );

        let first = PartAttributes::from_record(&outcome.children[0]).expect("attrs");
        assert!((first.confidence - 0.5).abs() < 1e-9);
        assert_eq!(first.role.as_deref(), Some("protects"));
        assert_eq!(first.triggers, vec!["criticism".to_string()]);
        assert_eq!(first.evidence_count, 0);
        assert_eq!(first.story.evolution.len(), 2);
        assert_eq!(first.story.evolution[1].change, "Split from Critic");

        let second = PartAttributes::from_record(&outcome.children[1]).expect("attrs");
        assert_eq!(second.role.as_deref(), Some("keeps standards"));

        let actions = db
            .list_actions("user-a", &ActionQuery { limit: 20, ..ActionQuery::default() })
            .await
            .expect("list");
        assert_eq!(actions[0].action_kind, ActionKind::ExecuteSplit);
        let child_records = actions
            .iter()
            .filter(|a| a.metadata.proposal_id == Some(proposal_id))
            .filter(|a| a.action_kind == ActionKind::CreateEmergingPart)
            .count();
        assert_eq!(child_records, 2);
    }

    #[tokio::test]
    async fn execute_requires_approval_and_matching_type() {
        let (db, _dir) = test_db().await;
        let ledger = Arc::new(MutationLedger::new(db.clone(), TrustLevel::scoped("user-a")));
        let flow = ProposalWorkflow::new(ledger.clone());
        let a = seed_part(&ledger, "Critic").await;
        let b = seed_part(&ledger, "Judge").await;

        let pending = flow
            .propose_merge(
                "user-a",
                ProposeMerge {
                    part_ids: vec![a.id, b.id],
                    canonical_name: "Unified".to_string(),
                    rationale: "same voice".to_string(),
                    idempotency_key: None,
                },
            )
            .await
            .expect("propose");
        let err = flow
            .execute_merge("user-a", pending.id)
            .await
            .expect_err("pending");
        assert!(matches!(
            err,
            LedgerError::InvalidState {
                expected: ProposalStatus::Approved,
                actual: ProposalStatus::Pending,
                ..
            }
        ));

        flow.approve("user-a", pending.id, "user").await.expect("approve");
        let err = flow
            .execute_split("user-a", pending.id)
            .await
            .expect_err("wrong type");
        assert!(matches!(err, LedgerError::InvalidProposal { .. }));

        flow.execute_merge("user-a", pending.id).await.expect("execute");
        let err = flow
            .execute_merge("user-a", pending.id)
            .await
            .expect_err("already executed");
        assert!(matches!(
            err,
            LedgerError::InvalidState {
                actual: ProposalStatus::Executed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn merge_with_a_missing_source_mutates_nothing() {
        let (db, _dir) = test_db().await;
        let ledger = Arc::new(MutationLedger::new(db.clone(), TrustLevel::scoped("user-a")));
        let flow = ProposalWorkflow::new(ledger.clone());
        let a = seed_part(&ledger, "Critic").await;

        let proposal = flow
            .propose_merge(
                "user-a",
                ProposeMerge {
                    part_ids: vec![a.id, Uuid::new_v4()],
                    canonical_name: "Unified".to_string(),
                    rationale: "same voice".to_string(),
                    idempotency_key: None,
                },
            )
            .await
            .expect("propose");
        flow.approve("user-a", proposal.id, "user").await.expect("approve");

        let err = flow
            .execute_merge("user-a", proposal.id)
            .await
            .expect_err("missing part");
        assert!(matches!(err, LedgerError::NotFound { entity: "part", .. }));

        let unchanged = ledger
            .get_entity(EntityTable::Parts, "user-a", a.id)
            .await
            .expect("get");
        assert_eq!(unchanged.name(), Some("Critic"));
        assert_eq!(
            flow.load("user-a", proposal.id).await.expect("load").status,
            ProposalStatus::Approved
        );
    }

    #[tokio::test]
    async fn partial_split_failure_leaves_proposal_approved() {
        let (inner, _dir) = test_db().await;
        let faulty = Arc::new(FaultyDb::new(inner.clone()));
        let ledger = Arc::new(MutationLedger::new(faulty.clone(), TrustLevel::scoped("user-a")));
        let flow = ProposalWorkflow::new(ledger.clone());
        let parent = seed_part(&ledger, "Critic").await;
        let proposal_id = approved_split(&flow, parent.id).await;

        faulty.fail_insert_number(2);
        let err = flow
            .execute_split("user-a", proposal_id)
            .await
            .expect_err("second child fails");
        assert!(matches!(
            err,
            LedgerError::Store {
                stage: StoreStage::Insert,
                ..
            }
        ));

        assert_eq!(
            flow.load("user-a", proposal_id).await.expect("load").status,
            ProposalStatus::Approved
        );
        let parent_now = inner
            .get_entity(EntityTable::Parts, "user-a", parent.id)
            .await
            .expect("get")
            .expect("present");
        assert!(parent_now.superseded_by.is_empty());

        let orphans = inner
            .find_entities_by_attribute(EntityTable::Parts, "user-a", "name", "Critic A", 10)
            .await
            .expect("find");
        assert_eq!(orphans.len(), 1);
    }
}
