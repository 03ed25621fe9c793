use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::EntityRecord;
use crate::error::LedgerError;

/// Recent evidence kept on a part.
pub const MAX_RECENT_EVIDENCE: usize = 10;

/// Evidence required before a part can be created.
pub const MIN_CREATION_EVIDENCE: usize = 3;

/// Ceiling on the confidence assigned to a newly created part.
pub const MAX_INITIAL_CONFIDENCE: f64 = 0.95;

pub const MAX_PART_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    #[default]
    Emerging,
    Acknowledged,
    Active,
    Integrated,
}

impl PartStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emerging => "emerging",
            Self::Acknowledged => "acknowledged",
            Self::Active => "active",
            Self::Integrated => "integrated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartCategory {
    Manager,
    Firefighter,
    Exile,
    #[default]
    Unknown,
}

impl PartCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Firefighter => "firefighter",
            Self::Exile => "exile",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PartCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    DirectMention,
    Pattern,
    Behavior,
    Emotion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub content: String,
    pub confidence: f64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Evidence {
    pub(crate) fn validate(&self) -> Result<(), LedgerError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(LedgerError::Validation(format!(
                "evidence confidence must be in [0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionEntry {
    pub timestamp: DateTime<Utc>,
    pub change: String,
    pub trigger: String,
}

impl EvolutionEntry {
    pub fn now(change: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            change: change.into(),
            trigger: trigger.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub evolution: Vec<EvolutionEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Story {
    pub fn with_entry(mut self, entry: EvolutionEntry) -> Self {
        self.evolution.push(entry);
        self
    }
}

fn default_energy_level() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visualization {
    pub emoji: String,
    pub color: String,
    #[serde(default = "default_energy_level")]
    pub energy_level: f64,
}

impl Default for Visualization {
    fn default() -> Self {
        Self {
            emoji: "🤗".to_string(),
            color: "#6B7280".to_string(),
            energy_level: default_energy_level(),
        }
    }
}

/// Typed view of a part's attribute blob.
///
/// Unknown keys survive a read/write cycle through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartAttributes {
    pub name: String,
    #[serde(default)]
    pub status: PartStatus,
    #[serde(default)]
    pub category: PartCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub beliefs: Vec<String>,
    #[serde(default)]
    pub somatic_markers: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub evidence_count: u64,
    #[serde(default)]
    pub recent_evidence: Vec<Evidence>,
    #[serde(default)]
    pub story: Story,
    #[serde(default)]
    pub visualization: Visualization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_noticed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_charged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_charge_intensity: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PartAttributes {
    pub fn from_record(record: &EntityRecord) -> Result<Self, LedgerError> {
        serde_json::from_value(Value::Object(record.attributes.clone())).map_err(|e| {
            LedgerError::Validation(format!("part {} has malformed attributes: {}", record.id, e))
        })
    }

    pub fn into_attributes(self) -> Result<Map<String, Value>, LedgerError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(LedgerError::Validation(
                "part attributes did not serialize to an object".to_string(),
            )),
            Err(e) => Err(LedgerError::Validation(format!(
                "failed to serialize part attributes: {}",
                e
            ))),
        }
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, LedgerError> {
    serde_json::to_value(value)
        .map_err(|e| LedgerError::Validation(format!("failed to serialize value: {}", e)))
}

pub(crate) fn validate_name(name: &str) -> Result<(), LedgerError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_PART_NAME_LEN {
        return Err(LedgerError::Validation(format!(
            "part name must be 1-{} characters",
            MAX_PART_NAME_LEN
        )));
    }
    Ok(())
}

pub(crate) fn validate_age(age: Option<f64>) -> Result<(), LedgerError> {
    match age {
        Some(age) if !(0.0..=100.0).contains(&age) => Err(LedgerError::Validation(format!(
            "age must be in [0, 100], got {}",
            age
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_unit(key: &str, value: f64) -> Result<(), LedgerError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(LedgerError::Validation(format!(
            "{} must be in [0, 1], got {}",
            key, value
        )));
    }
    Ok(())
}
