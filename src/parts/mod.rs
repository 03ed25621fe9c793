//! Part operations that drive the mutation ledger.
//!
//! Each call here is one ledgered mutation: the row write goes through
//! [`MutationLedger`] so it lands in the action log with enough state to undo.

mod model;
mod relationship;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ActionKind, ActionMetadata, CategoryChange, EntityRecord, EntityTable};
use crate::error::{LedgerError, StoreStage};
use crate::ledger::{EntityPatch, MutationLedger, PlannedUpdate};

pub use self::model::{
    Evidence, EvidenceType, EvolutionEntry, MAX_INITIAL_CONFIDENCE, MAX_PART_NAME_LEN,
    MAX_RECENT_EVIDENCE, MIN_CREATION_EVIDENCE, PartAttributes, PartCategory, PartStatus, Story,
    Visualization,
};
pub use self::relationship::{
    LogRelationship, RelationshipAttributes, RelationshipDynamic, RelationshipStatus,
    RelationshipType,
};

use self::model::{to_json, validate_age, validate_name, validate_unit};

/// Input for [`PartService::create_emerging_part`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmergingPart {
    pub name: String,
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub category: PartCategory,
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub beliefs: Vec<String>,
    #[serde(default)]
    pub somatic_markers: Vec<String>,
    pub user_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationUpdate {
    pub emoji: String,
    pub color: String,
}

/// Field changes for [`PartService::update_part`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUpdates {
    pub name: Option<String>,
    pub status: Option<PartStatus>,
    pub category: Option<PartCategory>,
    pub age: Option<f64>,
    pub role: Option<String>,
    pub triggers: Option<Vec<String>>,
    pub emotions: Option<Vec<String>>,
    pub beliefs: Option<Vec<String>>,
    pub somatic_markers: Option<Vec<String>>,
    pub visualization: Option<VisualizationUpdate>,
    /// Signed adjustment to identification confidence.
    pub confidence_boost: Option<f64>,
    pub last_charged_at: Option<DateTime<Utc>>,
    pub last_charge_intensity: Option<f64>,
}

impl PartUpdates {
    fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let checks = [
            ("name", self.name.is_some()),
            ("status", self.status.is_some()),
            ("category", self.category.is_some()),
            ("age", self.age.is_some()),
            ("role", self.role.is_some()),
            ("triggers", self.triggers.is_some()),
            ("emotions", self.emotions.is_some()),
            ("beliefs", self.beliefs.is_some()),
            ("somaticMarkers", self.somatic_markers.is_some()),
            ("visualization", self.visualization.is_some()),
            ("confidenceBoost", self.confidence_boost.is_some()),
            ("last_charged_at", self.last_charged_at.is_some()),
            ("last_charge_intensity", self.last_charge_intensity.is_some()),
        ];
        for (field, present) in checks {
            if present {
                fields.push(field);
            }
        }
        fields
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        validate_age(self.age)?;
        if let Some(boost) = self.confidence_boost
            && !(-1.0..=1.0).contains(&boost)
        {
            return Err(LedgerError::Validation(format!(
                "confidence boost must be in [-1, 1], got {}",
                boost
            )));
        }
        if let Some(intensity) = self.last_charge_intensity {
            validate_unit("last_charge_intensity", intensity)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePart {
    pub updates: PartUpdates,
    #[serde(default)]
    pub evidence: Option<Evidence>,
    #[serde(default)]
    pub audit_note: Option<String>,
}

pub struct PartService {
    ledger: Arc<MutationLedger>,
}

impl PartService {
    pub fn new(ledger: Arc<MutationLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<MutationLedger> {
        &self.ledger
    }

    /// Create a part once the user has confirmed it and enough evidence exists.
    pub async fn create_emerging_part(
        &self,
        owner_id: &str,
        input: NewEmergingPart,
    ) -> Result<EntityRecord, LedgerError> {
        self.ledger.trust().authorize(owner_id)?;
        validate_name(&input.name)?;
        validate_age(input.age)?;
        if input.evidence.len() < MIN_CREATION_EVIDENCE {
            return Err(LedgerError::Validation(format!(
                "Cannot create emerging part: At least {} pieces of evidence are required",
                MIN_CREATION_EVIDENCE
            )));
        }
        for evidence in &input.evidence {
            evidence.validate()?;
        }
        if !input.user_confirmed {
            return Err(LedgerError::Validation(
                "Cannot create emerging part: User confirmation is required through chat interaction"
                    .to_string(),
            ));
        }

        let existing = self
            .ledger
            .db()
            .find_entities_by_attribute(EntityTable::Parts, owner_id, "name", &input.name, 1)
            .await
            .map_err(LedgerError::store(StoreStage::Lookup))?;
        if !existing.is_empty() {
            return Err(LedgerError::Validation(format!(
                "A part named \"{}\" already exists for this user",
                input.name
            )));
        }

        let evidence_count = input.evidence.len();
        let mean = input.evidence.iter().map(|e| e.confidence).sum::<f64>() / evidence_count as f64;
        let confidence = (mean * 0.8).min(MAX_INITIAL_CONFIDENCE);
        let session_id = input.evidence.first().map(|e| e.session_id.clone());
        let now = Utc::now();

        let attributes = PartAttributes {
            name: input.name.clone(),
            status: PartStatus::Emerging,
            category: input.category,
            age: input.age,
            role: input.role.clone(),
            triggers: input.triggers,
            emotions: input.emotions,
            beliefs: input.beliefs,
            somatic_markers: input.somatic_markers,
            confidence,
            evidence_count: evidence_count as u64,
            recent_evidence: input.evidence,
            story: Story {
                current_state: Some(format!(
                    "Newly discovered part with {} pieces of evidence",
                    evidence_count
                )),
                purpose: input.role,
                ..Story::default()
            }
            .with_entry(EvolutionEntry::now("Part created", "Evidence threshold reached")),
            visualization: Visualization::default(),
            first_noticed: Some(now),
            last_active: Some(now),
            ..PartAttributes::default()
        };

        let mut metadata = ActionMetadata::for_part(input.name.as_str())
            .with_description(format!(
                "Created emerging part with {} pieces of evidence",
                evidence_count
            ))
            .with_extra("evidenceCount", evidence_count)
            .with_extra("category", input.category.as_str())
            .with_extra("confidence", confidence);
        metadata.session_id = session_id;

        self.ledger
            .logged_insert(
                EntityTable::Parts,
                attributes.into_attributes()?,
                owner_id,
                ActionKind::CreateEmergingPart,
                metadata,
            )
            .await
    }

    /// Apply field changes, optional new evidence and a story entry.
    ///
    /// The recorded action kind follows the most significant change: rename,
    /// visualization, charge, confidence, category, evidence, then plain
    /// attributes.
    pub async fn update_part(
        &self,
        owner_id: &str,
        part_id: Uuid,
        input: UpdatePart,
    ) -> Result<EntityRecord, LedgerError> {
        input.updates.validate()?;
        if let Some(evidence) = &input.evidence {
            evidence.validate()?;
        }

        self.ledger
            .logged_update_with(EntityTable::Parts, part_id, owner_id, |current| {
                plan_part_update(current, &input)
            })
            .await
    }

    /// Mark a part as acknowledged by the user.
    pub async fn acknowledge_part(
        &self,
        owner_id: &str,
        part_id: Uuid,
    ) -> Result<EntityRecord, LedgerError> {
        self.ledger
            .logged_update_with(EntityTable::Parts, part_id, owner_id, |current| {
                let now = to_json(&Utc::now())?;
                let name = current.name().unwrap_or_default().to_string();
                Ok(PlannedUpdate {
                    patch: EntityPatch::new()
                        .set("status", PartStatus::Acknowledged.as_str())
                        .set("acknowledged_at", now.clone())
                        .set("last_active", now),
                    kind: ActionKind::AcknowledgePart,
                    metadata: ActionMetadata::for_part(name)
                        .with_description("Acknowledged part"),
                })
            })
            .await
    }
}

fn plan_part_update(current: &EntityRecord, input: &UpdatePart) -> Result<PlannedUpdate, LedgerError> {
    let part = PartAttributes::from_record(current)?;
    let updates = &input.updates;
    let now = Utc::now();
    let mut patch = EntityPatch::new().set("last_active", to_json(&now)?);

    if let Some(name) = &updates.name {
        patch = patch.set("name", name.as_str());
    }
    if let Some(status) = updates.status {
        patch = patch.set("status", status.as_str());
    }
    if let Some(category) = updates.category {
        patch = patch.set("category", category.as_str());
    }
    if let Some(age) = updates.age {
        patch = patch.set("age", age);
    }
    if let Some(role) = &updates.role {
        patch = patch.set("role", role.as_str());
    }
    for (key, list) in [
        ("triggers", &updates.triggers),
        ("emotions", &updates.emotions),
        ("beliefs", &updates.beliefs),
        ("somatic_markers", &updates.somatic_markers),
    ] {
        if let Some(list) = list {
            patch = patch.set(key, to_json(list)?);
        }
    }
    if let Some(visualization) = &updates.visualization {
        let merged = Visualization {
            emoji: visualization.emoji.clone(),
            color: visualization.color.clone(),
            energy_level: part.visualization.energy_level,
        };
        patch = patch.set("visualization", to_json(&merged)?);
    }
    let new_confidence = updates
        .confidence_boost
        .map(|boost| (part.confidence + boost).clamp(0.0, 1.0));
    if let Some(confidence) = new_confidence {
        patch = patch.set("confidence", confidence);
    }
    if let Some(at) = updates.last_charged_at {
        patch = patch.set("last_charged_at", to_json(&at)?);
    }
    if let Some(intensity) = updates.last_charge_intensity {
        patch = patch.set("last_charge_intensity", intensity);
    }
    if let Some(evidence) = &input.evidence {
        let mut recent = part.recent_evidence.clone();
        recent.push(evidence.clone());
        let overflow = recent.len().saturating_sub(MAX_RECENT_EVIDENCE);
        recent.drain(..overflow);
        patch = patch
            .set("recent_evidence", to_json(&recent)?)
            .set("evidence_count", part.evidence_count + 1);
    }

    let story = part.story.clone().with_entry(EvolutionEntry::now(
        input.audit_note.as_deref().unwrap_or("Part updated"),
        "Agent tool update",
    ));
    patch = patch.set("story", to_json(&story)?);

    let renamed = updates
        .name
        .as_deref()
        .filter(|name| *name != part.name);
    let recategorized = updates.category.filter(|category| *category != part.category);

    let (kind, description) = if let Some(name) = renamed {
        (
            ActionKind::UpdatePartAttributes,
            format!("renamed part from \"{}\" to \"{}\"", part.name, name),
        )
    } else if updates.visualization.is_some() {
        (
            ActionKind::UpdatePartAttributes,
            "updated part visualization".to_string(),
        )
    } else if let Some(intensity) = updates.last_charge_intensity {
        (
            ActionKind::UpdatePartCharge,
            format!("updated part charge to {:.2}", intensity),
        )
    } else if let (Some(boost), Some(to)) = (updates.confidence_boost, new_confidence) {
        let direction = if boost >= 0.0 { "increased" } else { "decreased" };
        (
            ActionKind::UpdatePartConfidence,
            format!("{} confidence from {} to {}", direction, part.confidence, to),
        )
    } else if let Some(category) = recategorized {
        (
            ActionKind::UpdatePartCategory,
            format!("changed category from {} to {}", part.category, category),
        )
    } else if let Some(evidence) = &input.evidence {
        let preview: String = evidence.content.chars().take(50).collect();
        (
            ActionKind::AddPartEvidence,
            format!("added evidence: {}...", preview),
        )
    } else {
        (
            ActionKind::UpdatePartAttributes,
            "Updated part attributes".to_string(),
        )
    };

    let mut metadata = ActionMetadata::for_part(part.name.as_str()).with_description(description);
    metadata.confidence_delta = updates.confidence_boost;
    metadata.category_change = updates.category.map(|to| CategoryChange {
        from: part.category.to_string(),
        to: to.to_string(),
    });
    metadata.evidence_added = Some(input.evidence.is_some());
    metadata.field_changed = Some(updates.changed_fields().join(", "));
    if let Some(note) = &input.audit_note {
        metadata = metadata.with_extra("auditNote", note.as_str());
    }

    Ok(PlannedUpdate {
        patch,
        kind,
        metadata,
    })
}
