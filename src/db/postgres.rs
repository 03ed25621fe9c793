//! PostgreSQL backend for the Database trait.
//!
//! Uses a `deadpool-postgres` pool; the schema lives in `migrations/` and is
//! embedded at compile time with refinery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use secrecy::ExposeSecret as _;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    ActionKind, ActionMetadata, ActionQuery, ActionRecord, ActionStore, Database, EntityRecord,
    EntityState, EntityStore, EntityTable, NewActionRecord, NewEntity, NewProposal,
    PROPOSAL_IDEMPOTENCY_CONSTRAINT, ProposalRecord, ProposalStatus, ProposalStore,
    ProposalTransition, ProposalType,
};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const ENTITY_COLUMNS: &str = "id, user_id, attributes, superseded_by, created_at, updated_at";

const ACTION_COLUMNS: &str = "id, user_id, action_kind, target_table, target_id, old_state, \
     new_state, metadata, created_at, created_by, rolled_back, rollback_reason, rollback_at";

const PROPOSAL_COLUMNS: &str = "id, user_id, proposal_type, payload, rationale, idempotency_key, \
     status, approved_at, approved_by, executed_at, executed_by, created_at, updated_at";

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config.url.as_ref().ok_or_else(|| {
            DatabaseError::Pool("DATABASE_URL is required for the postgres backend".to_string())
        })?;

        let mut cfg = Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(config.pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(format!("Failed to create pool: {}", e)))?;

        // Fail at startup rather than on the first ledger call.
        let _ = pool.get().await?;
        Ok(Self { pool })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> Result<Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn row_to_entity_record(row: &tokio_postgres::Row) -> Result<EntityRecord, DatabaseError> {
    let attributes = match row.try_get::<_, serde_json::Value>("attributes")? {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(DatabaseError::Serialization(format!(
                "attributes must be a json object, got {}",
                other
            )));
        }
    };
    Ok(EntityRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        attributes,
        superseded_by: row.try_get("superseded_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_action_record(row: &tokio_postgres::Row) -> Result<ActionRecord, DatabaseError> {
    let kind_raw: String = row.try_get("action_kind")?;
    let action_kind = ActionKind::from_db_value(&kind_raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid action_kind '{}'", kind_raw)))?;
    let metadata: ActionMetadata = serde_json::from_value(row.try_get("metadata")?)
        .map_err(|e| DatabaseError::Serialization(format!("invalid metadata: {}", e)))?;

    Ok(ActionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        action_kind,
        target_table: row.try_get("target_table")?,
        target_id: row.try_get("target_id")?,
        old_state: row.try_get("old_state")?,
        new_state: row.try_get("new_state")?,
        metadata,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        rolled_back: row.try_get("rolled_back")?,
        rollback_reason: row.try_get("rollback_reason")?,
        rollback_at: row.try_get("rollback_at")?,
    })
}

fn row_to_proposal_record(row: &tokio_postgres::Row) -> Result<ProposalRecord, DatabaseError> {
    let type_raw: String = row.try_get("proposal_type")?;
    let status_raw: String = row.try_get("status")?;
    Ok(ProposalRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        proposal_type: ProposalType::from_db_value(&type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid proposal_type '{}'", type_raw))
        })?,
        payload: row.try_get("payload")?,
        rationale: row.try_get("rationale")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: ProposalStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid proposal status '{}'", status_raw))
        })?,
        approved_at: row.try_get("approved_at")?,
        approved_by: row.try_get("approved_by")?,
        executed_at: row.try_get("executed_at")?,
        executed_by: row.try_get("executed_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_proposal_insert_error(err: tokio_postgres::Error) -> DatabaseError {
    if let Some(db_err) = err.as_db_error()
        && *db_err.code() == SqlState::UNIQUE_VIOLATION
        && db_err.constraint() == Some(PROPOSAL_IDEMPOTENCY_CONSTRAINT)
    {
        return DatabaseError::Duplicate {
            constraint: PROPOSAL_IDEMPOTENCY_CONSTRAINT.to_string(),
        };
    }
    DatabaseError::Postgres(err)
}

fn attributes_value(attributes: &serde_json::Map<String, serde_json::Value>) -> serde_json::Value {
    serde_json::Value::Object(attributes.clone())
}

// ==================== Database (supertrait) ====================

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ==================== EntityStore ====================

#[async_trait]
impl EntityStore for PgBackend {
    async fn insert_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        input: &NewEntity,
    ) -> Result<EntityRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO {} (id, user_id, attributes) VALUES ($1, $2, $3) RETURNING {}",
                    table.as_str(),
                    ENTITY_COLUMNS
                ),
                &[&Uuid::new_v4(), &user_id, &attributes_value(&input.attributes)],
            )
            .await?;
        row_to_entity_record(&row)
    }

    async fn get_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE id = $1 AND user_id = $2",
                    ENTITY_COLUMNS,
                    table.as_str()
                ),
                &[&id, &user_id],
            )
            .await?;
        row.as_ref().map(row_to_entity_record).transpose()
    }

    async fn update_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
        state: &EntityState,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE {} SET attributes = $3, superseded_by = $4, updated_at = NOW() \
                     WHERE id = $1 AND user_id = $2 RETURNING {}",
                    table.as_str(),
                    ENTITY_COLUMNS
                ),
                &[
                    &id,
                    &user_id,
                    &attributes_value(&state.attributes),
                    &state.superseded_by,
                ],
            )
            .await?;
        row.as_ref().map(row_to_entity_record).transpose()
    }

    async fn delete_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = $1 AND user_id = $2",
                    table.as_str()
                ),
                &[&id, &user_id],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn find_entities_by_attribute(
        &self,
        table: EntityTable,
        user_id: &str,
        key: &str,
        value: &str,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE user_id = $1 AND attributes ->> $2 = $3 \
                     ORDER BY created_at DESC LIMIT $4",
                    ENTITY_COLUMNS,
                    table.as_str()
                ),
                &[&user_id, &key, &value, &limit],
            )
            .await?;
        rows.iter().map(row_to_entity_record).collect()
    }
}

// ==================== ActionStore ====================

#[async_trait]
impl ActionStore for PgBackend {
    async fn append_action(&self, input: &NewActionRecord) -> Result<ActionRecord, DatabaseError> {
        let metadata = serde_json::to_value(&input.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO agent_actions \
                     (id, user_id, action_kind, target_table, target_id, old_state, new_state, \
                      metadata, session_id, created_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     RETURNING {}",
                    ACTION_COLUMNS
                ),
                &[
                    &Uuid::new_v4(),
                    &input.user_id,
                    &input.action_kind.as_str(),
                    &input.target_table,
                    &input.target_id,
                    &input.old_state,
                    &input.new_state,
                    &metadata,
                    &input.metadata.session_id,
                    &input.created_by,
                ],
            )
            .await?;
        row_to_action_record(&row)
    }

    async fn get_action(
        &self,
        user_id: Option<&str>,
        id: Uuid,
    ) -> Result<Option<ActionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM agent_actions \
                     WHERE id = $1 AND ($2::text IS NULL OR user_id = $2)",
                    ACTION_COLUMNS
                ),
                &[&id, &user_id],
            )
            .await?;
        row.as_ref().map(row_to_action_record).transpose()
    }

    async fn list_actions(
        &self,
        user_id: &str,
        query: &ActionQuery,
    ) -> Result<Vec<ActionRecord>, DatabaseError> {
        let kinds: Option<Vec<&str>> = if query.kinds.is_empty() {
            None
        } else {
            Some(query.kinds.iter().map(|kind| kind.as_str()).collect())
        };
        let limit = query.limit.max(0);

        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM agent_actions \
                     WHERE user_id = $1 \
                       AND ($2::text[] IS NULL OR action_kind = ANY($2)) \
                       AND ($3::text IS NULL OR session_id = $3) \
                       AND ($4::timestamptz IS NULL OR created_at >= $4) \
                       AND ($5 OR NOT rolled_back) \
                     ORDER BY created_at DESC, seq DESC LIMIT $6",
                    ACTION_COLUMNS
                ),
                &[
                    &user_id,
                    &kinds,
                    &query.session_id,
                    &query.since,
                    &query.include_rolled_back,
                    &limit,
                ],
            )
            .await?;
        rows.iter().map(row_to_action_record).collect()
    }

    async fn mark_action_rolled_back(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE agent_actions SET rolled_back = TRUE, rollback_reason = $2, rollback_at = $3 \
                 WHERE id = $1 AND rolled_back = FALSE",
                &[&id, &reason, &at],
            )
            .await?;
        Ok(affected > 0)
    }
}

// ==================== ProposalStore ====================

#[async_trait]
impl ProposalStore for PgBackend {
    async fn insert_proposal(
        &self,
        user_id: &str,
        input: &NewProposal,
    ) -> Result<ProposalRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO part_change_proposals \
                     (id, user_id, proposal_type, payload, rationale, idempotency_key) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
                    PROPOSAL_COLUMNS
                ),
                &[
                    &Uuid::new_v4(),
                    &user_id,
                    &input.proposal_type.as_str(),
                    &input.payload,
                    &input.rationale,
                    &input.idempotency_key,
                ],
            )
            .await
            .map_err(map_proposal_insert_error)?;
        row_to_proposal_record(&row)
    }

    async fn get_proposal(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM part_change_proposals WHERE id = $1 AND user_id = $2",
                    PROPOSAL_COLUMNS
                ),
                &[&id, &user_id],
            )
            .await?;
        row.as_ref().map(row_to_proposal_record).transpose()
    }

    async fn find_proposal_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM part_change_proposals \
                     WHERE user_id = $1 AND idempotency_key = $2",
                    PROPOSAL_COLUMNS
                ),
                &[&user_id, &key],
            )
            .await?;
        row.as_ref().map(row_to_proposal_record).transpose()
    }

    async fn transition_proposal(
        &self,
        user_id: &str,
        id: Uuid,
        transition: &ProposalTransition,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let set_clause = match transition.to {
            ProposalStatus::Approved | ProposalStatus::Rejected => {
                "approved_at = $4, approved_by = $5"
            }
            ProposalStatus::Executed => "executed_at = $4, executed_by = $5",
            ProposalStatus::Pending => {
                return Err(DatabaseError::Constraint(
                    "proposals cannot transition back to pending".to_string(),
                ));
            }
        };

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE part_change_proposals \
                     SET status = $3, {}, updated_at = $4 \
                     WHERE id = $1 AND user_id = $2 AND status = $6 \
                     RETURNING {}",
                    set_clause, PROPOSAL_COLUMNS
                ),
                &[
                    &id,
                    &user_id,
                    &transition.to.as_str(),
                    &transition.at,
                    &transition.actor,
                    &transition.from.as_str(),
                ],
            )
            .await?;
        row.as_ref().map(row_to_proposal_record).transpose()
    }
}
