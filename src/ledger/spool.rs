//! Local JSONL spool for action records the datastore refused.
//!
//! Primary mutations succeed even when their audit write fails. When a spool
//! is configured, the unwritten record lands here so an operator can replay
//! it. Nothing in this module surfaces errors: every failure is a warning.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::SpoolConfig;
use crate::db::NewActionRecord;

#[derive(Debug, Serialize)]
struct SpoolEntry<'a> {
    ts: String,
    error: &'a str,
    record: &'a NewActionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

pub struct ActionSpool {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Mutex<Option<String>>,
}

impl ActionSpool {
    pub fn new(path: impl Into<PathBuf>, hash_chain: bool) -> Self {
        Self {
            path: path.into(),
            hash_chain,
            last_hash: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SpoolConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.path.clone(), config.hash_chain))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record` with the datastore error that kept it out of the ledger.
    /// Returns whether a line was written.
    pub fn append(&self, record: &NewActionRecord, error: &str) -> bool {
        // Held through the write so the chain order matches file order.
        let mut last_hash = match self.last_hash.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("Action spool lock poisoned: {}", e);
                return false;
            }
        };

        let mut entry = SpoolEntry {
            ts: Utc::now().to_rfc3339(),
            error,
            record,
            prev_hash: last_hash.clone(),
            hash: None,
        };

        let mut next_hash = None;
        if self.hash_chain {
            let to_hash = match serde_json::to_string(&entry) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to serialize spool entry for hashing: {}", e);
                    return false;
                }
            };
            let hash = format!("{:x}", Sha256::digest(to_hash.as_bytes()));
            entry.hash = Some(hash.clone());
            next_hash = Some(hash);
        }

        let line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to serialize spool entry: {}", e);
                return false;
            }
        };

        if let Some(parent) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create action spool dir {:?}: {}", parent, e);
            return false;
        }

        // Owner read/write only; refuse a pre-existing file with a broader mode.
        let mut open_opts = OpenOptions::new();
        open_opts.create(true).append(true);
        #[cfg(unix)]
        open_opts.mode(0o600);
        let mut file = match open_opts.open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Failed to open action spool {:?}: {}", self.path, e);
                return false;
            }
        };
        #[cfg(unix)]
        {
            let mode = match file.metadata() {
                Ok(meta) => meta.permissions().mode() & 0o777,
                Err(e) => {
                    tracing::warn!(
                        "Failed to read permissions for action spool {:?}: {}",
                        self.path,
                        e
                    );
                    return false;
                }
            };
            if mode != 0o600 {
                tracing::warn!(
                    "Refusing to spool action; insecure mode {:o} on {:?} (expected 600)",
                    mode,
                    self.path
                );
                return false;
            }
        }
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!("Failed to append to action spool: {}", e);
            return false;
        }

        if next_hash.is_some() {
            *last_hash = next_hash;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::ActionSpool;
    use crate::db::{ActionKind, ActionMetadata, NewActionRecord};

    fn record() -> NewActionRecord {
        NewActionRecord {
            user_id: "user-a".to_string(),
            action_kind: ActionKind::UpdatePartConfidence,
            target_table: "parts".to_string(),
            target_id: Uuid::new_v4(),
            old_state: Some(json!({"confidence": 0.2})),
            new_state: json!({"confidence": 0.4}),
            metadata: ActionMetadata::for_part("Critic"),
            created_by: "agent".to_string(),
        }
    }

    #[test]
    fn hash_chain_links_consecutive_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("spool.jsonl");
        let spool = ActionSpool::new(path.clone(), true);

        assert!(spool.append(&record(), "connection reset"));
        assert!(spool.append(&record(), "connection reset"));

        let raw = fs::read_to_string(path).expect("read spool");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).expect("first line json");
        let second: Value = serde_json::from_str(lines[1]).expect("second line json");
        assert_eq!(first["record"]["action_kind"], "update_part_confidence");
        assert_eq!(first["error"], "connection reset");
        assert!(first.get("prev_hash").is_none());
        assert_eq!(second["prev_hash"], first["hash"]);
    }

    #[test]
    fn without_hash_chain_entries_carry_no_hashes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spool.jsonl");
        let spool = ActionSpool::new(path.clone(), false);
        assert!(spool.append(&record(), "boom"));

        let raw = fs::read_to_string(path).expect("read spool");
        let line: Value = serde_json::from_str(raw.trim()).expect("json");
        assert!(line.get("hash").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn append_refuses_existing_file_with_broad_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spool.jsonl");
        fs::write(&path, "existing\n").expect("seed");
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let spool = ActionSpool::new(path.clone(), false);
        assert!(!spool.append(&record(), "boom"));
        assert_eq!(fs::read_to_string(&path).expect("read"), "existing\n");
    }

    #[cfg(unix)]
    #[test]
    fn new_spool_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spool-new.jsonl");
        let spool = ActionSpool::new(path.clone(), false);
        assert!(spool.append(&record(), "boom"));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
