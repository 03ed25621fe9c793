use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::{ActionKind, ActionMetadata, EntityRecord, EntityTable};
use crate::error::{LedgerError, StoreStage};
use crate::ledger::{EntityPatch, PlannedUpdate};
use crate::parts::PartService;
use crate::parts::model::{to_json, validate_unit};

/// Relationships of one type scanned when looking for an existing pair.
const RELATIONSHIP_SCAN_LIMIT: i64 = 50;

const DEFAULT_POLARIZATION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    Polarized,
    ProtectorExile,
    Allied,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polarized => "polarized",
            Self::ProtectorExile => "protector-exile",
            Self::Allied => "allied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    #[default]
    Active,
    Healing,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDynamic {
    pub observation: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarization_change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Stored shape of a relationship row's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipAttributes {
    pub parts: Vec<Uuid>,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_ground: Option<String>,
    #[serde(default)]
    pub dynamics: Vec<RelationshipDynamic>,
    #[serde(default)]
    pub status: RelationshipStatus,
    #[serde(default = "default_polarization")]
    pub polarization_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_addressed: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_polarization() -> f64 {
    DEFAULT_POLARIZATION
}

impl RelationshipAttributes {
    pub fn from_record(record: &EntityRecord) -> Result<Self, LedgerError> {
        serde_json::from_value(Value::Object(record.attributes.clone())).map_err(|e| {
            LedgerError::Validation(format!(
                "relationship {} has malformed attributes: {}",
                record.id, e
            ))
        })
    }

    fn pair(&self) -> Option<[Uuid; 2]> {
        match self.parts.as_slice() {
            [a, b] => Some(sorted_pair([*a, *b])),
            _ => None,
        }
    }
}

/// Input for [`PartService::log_relationship`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRelationship {
    pub part_ids: [Uuid; 2],
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub common_ground: Option<String>,
    #[serde(default)]
    pub status: Option<RelationshipStatus>,
    /// Absolute level; wins over a dynamic's relative change.
    #[serde(default)]
    pub polarization_level: Option<f64>,
    #[serde(default)]
    pub dynamic: Option<RelationshipDynamic>,
    #[serde(default)]
    pub last_addressed: Option<DateTime<Utc>>,
    #[serde(default = "default_upsert")]
    pub upsert: bool,
}

fn default_upsert() -> bool {
    true
}

impl LogRelationship {
    pub fn new(part_ids: [Uuid; 2], relationship_type: RelationshipType) -> Self {
        Self {
            part_ids,
            relationship_type,
            description: None,
            issue: None,
            common_ground: None,
            status: None,
            polarization_level: None,
            dynamic: None,
            last_addressed: None,
            upsert: true,
        }
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.part_ids[0] == self.part_ids[1] {
            return Err(LedgerError::Validation(
                "a relationship needs two distinct parts".to_string(),
            ));
        }
        if let Some(level) = self.polarization_level {
            validate_unit("polarization_level", level)?;
        }
        if let Some(change) = self.dynamic.as_ref().and_then(|d| d.polarization_change)
            && !(-1.0..=1.0).contains(&change)
        {
            return Err(LedgerError::Validation(format!(
                "polarization change must be in [-1, 1], got {}",
                change
            )));
        }
        Ok(())
    }
}

fn sorted_pair(mut pair: [Uuid; 2]) -> [Uuid; 2] {
    pair.sort();
    pair
}

impl PartService {
    /// Record an observed relationship between two parts.
    ///
    /// With `upsert` set, an existing relationship of the same type over the
    /// same unordered pair is updated instead of duplicated.
    pub async fn log_relationship(
        &self,
        owner_id: &str,
        input: LogRelationship,
    ) -> Result<EntityRecord, LedgerError> {
        self.ledger().trust().authorize(owner_id)?;
        input.validate()?;

        let pair = sorted_pair(input.part_ids);
        let dynamic = input.dynamic.clone().map(|mut d| {
            d.timestamp.get_or_insert_with(Utc::now);
            d
        });

        let existing = if input.upsert {
            self.find_relationship(owner_id, input.relationship_type, pair)
                .await?
        } else {
            None
        };

        let mut metadata = ActionMetadata::default()
            .with_extra("relationshipType", input.relationship_type.as_str())
            .with_extra("partIds", to_json(&pair)?);

        match existing {
            Some(existing) => {
                let polarization_delta = dynamic.as_ref().and_then(|d| d.polarization_change);
                metadata.change_description = Some(match &dynamic {
                    Some(d) => {
                        let preview: String = d.observation.chars().take(60).collect();
                        format!("Appended dynamic: {}...", preview)
                    }
                    None => "Updated relationship fields".to_string(),
                });
                if let Some(delta) = polarization_delta {
                    metadata = metadata.with_extra("polarizationDelta", delta);
                }

                self.ledger()
                    .logged_update_with(
                        EntityTable::PartRelationships,
                        existing,
                        owner_id,
                        |current| {
                            plan_relationship_update(current, &input, dynamic.as_ref(), metadata)
                        },
                    )
                    .await
            }
            None => {
                let last_addressed = input
                    .last_addressed
                    .or_else(|| dynamic.as_ref().and_then(|d| d.timestamp));
                let attributes = RelationshipAttributes {
                    parts: pair.to_vec(),
                    relationship_type: input.relationship_type,
                    description: input.description.clone(),
                    issue: input.issue.clone(),
                    common_ground: input.common_ground.clone(),
                    dynamics: dynamic.into_iter().collect(),
                    status: input.status.unwrap_or_default(),
                    polarization_level: input.polarization_level.unwrap_or(DEFAULT_POLARIZATION),
                    last_addressed,
                    extra: Map::new(),
                };
                let data = match to_json(&attributes)? {
                    Value::Object(map) => map,
                    _ => {
                        return Err(LedgerError::Validation(
                            "relationship attributes did not serialize to an object".to_string(),
                        ));
                    }
                };
                metadata.change_description = input.description.clone();

                self.ledger()
                    .logged_insert(
                        EntityTable::PartRelationships,
                        data,
                        owner_id,
                        ActionKind::CreateRelationship,
                        metadata,
                    )
                    .await
            }
        }
    }

    async fn find_relationship(
        &self,
        owner_id: &str,
        relationship_type: RelationshipType,
        pair: [Uuid; 2],
    ) -> Result<Option<Uuid>, LedgerError> {
        let candidates = self
            .ledger()
            .db()
            .find_entities_by_attribute(
                EntityTable::PartRelationships,
                owner_id,
                "type",
                relationship_type.as_str(),
                RELATIONSHIP_SCAN_LIMIT,
            )
            .await
            .map_err(LedgerError::store(StoreStage::Lookup))?;

        for candidate in &candidates {
            match RelationshipAttributes::from_record(candidate) {
                Ok(attrs) if attrs.pair() == Some(pair) => return Ok(Some(candidate.id)),
                Ok(_) => {}
                Err(e) => tracing::debug!(id = %candidate.id, "skipping relationship: {}", e),
            }
        }
        Ok(None)
    }
}

fn plan_relationship_update(
    current: &EntityRecord,
    input: &LogRelationship,
    dynamic: Option<&RelationshipDynamic>,
    metadata: ActionMetadata,
) -> Result<PlannedUpdate, LedgerError> {
    let relationship = RelationshipAttributes::from_record(current)?;
    let mut patch = EntityPatch::new();

    if let Some(dynamic) = dynamic {
        let mut dynamics = relationship.dynamics.clone();
        dynamics.push(dynamic.clone());
        patch = patch.set("dynamics", to_json(&dynamics)?);
    }
    if let Some(at) = input
        .last_addressed
        .or_else(|| dynamic.and_then(|d| d.timestamp))
    {
        patch = patch.set("last_addressed", to_json(&at)?);
    }
    if let Some(description) = &input.description {
        patch = patch.set("description", description.as_str());
    }
    if let Some(issue) = &input.issue {
        patch = patch.set("issue", issue.as_str());
    }
    if let Some(common_ground) = &input.common_ground {
        patch = patch.set("common_ground", common_ground.as_str());
    }
    if let Some(status) = input.status {
        patch = patch.set("status", to_json(&status)?);
    }

    let current_level = relationship.polarization_level;
    let level = match (
        input.polarization_level,
        dynamic.and_then(|d| d.polarization_change),
    ) {
        (Some(absolute), _) => absolute,
        (None, Some(delta)) => (current_level + delta).clamp(0.0, 1.0),
        (None, None) => current_level,
    };
    if level != current_level {
        patch = patch.set("polarization_level", level);
    }

    Ok(PlannedUpdate {
        patch,
        kind: ActionKind::UpdateRelationship,
        metadata,
    })
}
