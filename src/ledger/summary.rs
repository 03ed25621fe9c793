use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{ActionKind, ActionMetadata, ActionRecord};

const UNKNOWN_PART: &str = "Unknown Part";

/// Listing view of an action record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub id: Uuid,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub can_rollback: bool,
    pub action_kind: ActionKind,
    pub metadata: ActionMetadata,
}

impl ActionSummary {
    pub fn from_record(record: &ActionRecord) -> Self {
        Self {
            id: record.id,
            summary: summarize(record.action_kind, &record.metadata),
            timestamp: record.created_at,
            can_rollback: !record.rolled_back && record.action_kind.is_reversible(),
            action_kind: record.action_kind,
            metadata: record.metadata.clone(),
        }
    }
}

/// One-line human description of an action. Deterministic in `kind` and
/// `metadata`; this is the text natural-language rollback matches against.
pub fn summarize(kind: ActionKind, metadata: &ActionMetadata) -> String {
    let part = metadata.part_name.as_deref().unwrap_or(UNKNOWN_PART);
    let description = metadata.change_description.as_deref();

    match kind {
        ActionKind::CreateEmergingPart => format!("Created emerging part \"{part}\""),
        ActionKind::UpdatePartConfidence => {
            let delta = metadata.confidence_delta.unwrap_or(0.0);
            let direction = if delta > 0.0 { "Increased" } else { "Decreased" };
            format!("{direction} confidence for \"{part}\" by {}", delta.abs())
        }
        ActionKind::UpdatePartCategory => match &metadata.category_change {
            Some(change) => format!(
                "Changed \"{part}\" category from {} to {}",
                change.from, change.to
            ),
            None => format!("Updated category for \"{part}\""),
        },
        ActionKind::UpdatePartAttributes => format!(
            "Updated attributes for \"{part}\": {}",
            description.unwrap_or("multiple fields")
        ),
        ActionKind::UpdatePartCharge => format!("Updated charge for \"{part}\""),
        ActionKind::AddPartEvidence => format!("Added evidence for \"{part}\""),
        ActionKind::AcknowledgePart => format!("Acknowledged part \"{part}\""),
        ActionKind::CreateRelationship => {
            let relationship_type = metadata
                .extra
                .get("relationshipType")
                .and_then(|v| v.as_str())
                .unwrap_or("new");
            format!(
                "Created {relationship_type} relationship: {}",
                description.unwrap_or("between parts")
            )
        }
        ActionKind::UpdateRelationship => format!(
            "Updated relationship: {}",
            description.unwrap_or("relationship details")
        ),
        ActionKind::CreateProposal => format!(
            "Created {} proposal",
            metadata
                .proposal_type
                .map(|t| t.as_str())
                .unwrap_or("change")
        ),
        ActionKind::ApproveProposal => format!("Approved proposal {}", proposal_label(metadata)),
        ActionKind::RejectProposal => format!("Rejected proposal {}", proposal_label(metadata)),
        ActionKind::ExecuteSplit => format!("Executed split for \"{part}\""),
        ActionKind::ExecuteMerge => format!("Executed merge into \"{part}\""),
    }
}

fn proposal_label(metadata: &ActionMetadata) -> String {
    metadata
        .proposal_id
        .map(|id| id.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::summarize;
    use crate::db::{ActionKind, ActionMetadata, CategoryChange, ProposalType};

    #[test]
    fn confidence_summary_reports_direction_and_magnitude() {
        let mut meta = ActionMetadata::for_part("Critic");
        meta.confidence_delta = Some(0.2);
        assert_eq!(
            summarize(ActionKind::UpdatePartConfidence, &meta),
            "Increased confidence for \"Critic\" by 0.2"
        );
        meta.confidence_delta = Some(-0.15);
        assert_eq!(
            summarize(ActionKind::UpdatePartConfidence, &meta),
            "Decreased confidence for \"Critic\" by 0.15"
        );
    }

    #[test]
    fn missing_part_name_falls_back() {
        assert_eq!(
            summarize(ActionKind::CreateEmergingPart, &ActionMetadata::default()),
            "Created emerging part \"Unknown Part\""
        );
    }

    #[test]
    fn category_summary_uses_change_when_present() {
        let mut meta = ActionMetadata::for_part("Critic");
        assert_eq!(
            summarize(ActionKind::UpdatePartCategory, &meta),
            "Updated category for \"Critic\""
        );
        meta.category_change = Some(CategoryChange {
            from: "manager".to_string(),
            to: "firefighter".to_string(),
        });
        assert_eq!(
            summarize(ActionKind::UpdatePartCategory, &meta),
            "Changed \"Critic\" category from manager to firefighter"
        );
    }

    #[test]
    fn attribute_summary_defaults_description() {
        let meta = ActionMetadata::for_part("Critic");
        assert_eq!(
            summarize(ActionKind::UpdatePartAttributes, &meta),
            "Updated attributes for \"Critic\": multiple fields"
        );
    }

    #[test]
    fn proposal_summaries() {
        let id = Uuid::new_v4();
        let meta = ActionMetadata::default().with_proposal(id, ProposalType::Merge);
        assert_eq!(
            summarize(ActionKind::CreateProposal, &meta),
            "Created merge proposal"
        );
        assert_eq!(
            summarize(ActionKind::ApproveProposal, &meta),
            format!("Approved proposal {id}")
        );
        assert_eq!(
            summarize(ActionKind::CreateProposal, &ActionMetadata::default()),
            "Created change proposal"
        );
    }

    #[test]
    fn relationship_summary_reads_type_from_metadata() {
        let meta = ActionMetadata::default()
            .with_description("Critic protects Exile")
            .with_extra("relationshipType", "protector-exile");
        assert_eq!(
            summarize(ActionKind::CreateRelationship, &meta),
            "Created protector-exile relationship: Critic protects Exile"
        );
    }
}
