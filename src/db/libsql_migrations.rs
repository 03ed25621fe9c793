//! SQLite-dialect schema for the libSQL backend.
//!
//! Mirrors `migrations/V1__parts_ledger.sql` (PostgreSQL). Executed with
//! `execute_batch` on every startup, so every statement is idempotent.
//! Timestamps are RFC 3339 text, UUIDs are text, JSON is text.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS parts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    superseded_by TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_parts_user ON parts(user_id, created_at);

CREATE TABLE IF NOT EXISTS part_relationships (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    superseded_by TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_part_relationships_user ON part_relationships(user_id, created_at);

CREATE TABLE IF NOT EXISTS agent_actions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    action_kind TEXT NOT NULL,
    target_table TEXT NOT NULL,
    target_id TEXT NOT NULL,
    old_state TEXT,
    new_state TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    session_id TEXT,
    created_at TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT 'agent',
    rolled_back INTEGER NOT NULL DEFAULT 0,
    rollback_reason TEXT,
    rollback_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_actions_user_created ON agent_actions(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_agent_actions_target ON agent_actions(target_id);

CREATE TABLE IF NOT EXISTS part_change_proposals (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    proposal_type TEXT NOT NULL CHECK (proposal_type IN ('split', 'merge')),
    payload TEXT NOT NULL,
    rationale TEXT NOT NULL,
    idempotency_key TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'approved', 'rejected', 'executed')),
    approved_at TEXT,
    approved_by TEXT,
    executed_at TEXT,
    executed_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_part_change_proposals_idem
    ON part_change_proposals(user_id, idempotency_key)
    WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_part_change_proposals_user_status
    ON part_change_proposals(user_id, status);
"#;
