use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    NewProposal, PROPOSAL_IDEMPOTENCY_CONSTRAINT, ProposalRecord, ProposalStatus, ProposalStore,
    ProposalTransition, ProposalType,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_opt_text, get_text, opt_text, parse_dt_opt, parse_json,
    parse_ts_column, parse_uuid, to_json_text,
};

const PROPOSAL_COLUMNS: &str = "id, user_id, proposal_type, payload, rationale, idempotency_key, \
     status, approved_at, approved_by, executed_at, executed_by, created_at, updated_at";

fn row_to_proposal_record(row: &libsql::Row) -> Result<ProposalRecord, DatabaseError> {
    let type_raw = get_text(row, 2);
    let status_raw = get_text(row, 6);
    Ok(ProposalRecord {
        id: parse_uuid(&get_text(row, 0), "proposal.id")?,
        user_id: get_text(row, 1),
        proposal_type: ProposalType::from_db_value(&type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid proposal_type '{}'", type_raw))
        })?,
        payload: parse_json(&get_text(row, 3), "payload")?,
        rationale: get_text(row, 4),
        idempotency_key: get_opt_text(row, 5),
        status: ProposalStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid proposal status '{}'", status_raw))
        })?,
        approved_at: parse_dt_opt(get_opt_text(row, 7))?,
        approved_by: get_opt_text(row, 8),
        executed_at: parse_dt_opt(get_opt_text(row, 9))?,
        executed_by: get_opt_text(row, 10),
        created_at: parse_ts_column(&get_text(row, 11), "created_at")?,
        updated_at: parse_ts_column(&get_text(row, 12), "updated_at")?,
    })
}

/// SQLite reports unique-index violations by column list, not index name:
/// `UNIQUE constraint failed: part_change_proposals.user_id, part_change_proposals.idempotency_key`.
fn map_insert_error(err: libsql::Error) -> DatabaseError {
    let message = err.to_string();
    if message.contains("UNIQUE constraint failed")
        && message.contains("part_change_proposals.idempotency_key")
    {
        return DatabaseError::Duplicate {
            constraint: PROPOSAL_IDEMPOTENCY_CONSTRAINT.to_string(),
        };
    }
    DatabaseError::LibSql(err)
}

impl LibSqlBackend {
    async fn fetch_proposal(
        &self,
        conn: &libsql::Connection,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM part_change_proposals WHERE id = ?1 AND user_id = ?2",
                    PROPOSAL_COLUMNS
                ),
                params![id.to_string(), user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_proposal_record(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl ProposalStore for LibSqlBackend {
    async fn insert_proposal(
        &self,
        user_id: &str,
        input: &NewProposal,
    ) -> Result<ProposalRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());

        conn.execute(
            "INSERT INTO part_change_proposals \
             (id, user_id, proposal_type, payload, rationale, idempotency_key, status, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            params![
                id.to_string(),
                user_id,
                input.proposal_type.as_str(),
                to_json_text(&input.payload)?,
                input.rationale.as_str(),
                opt_text(input.idempotency_key.as_deref()),
                now,
            ],
        )
        .await
        .map_err(map_insert_error)?;

        self.fetch_proposal(&conn, user_id, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "proposal".to_string(),
                id: id.to_string(),
            })
    }

    async fn get_proposal(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let conn = self.connect().await?;
        self.fetch_proposal(&conn, user_id, id).await
    }

    async fn find_proposal_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM part_change_proposals \
                     WHERE user_id = ?1 AND idempotency_key = ?2",
                    PROPOSAL_COLUMNS
                ),
                params![user_id, key],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_proposal_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn transition_proposal(
        &self,
        user_id: &str,
        id: Uuid,
        transition: &ProposalTransition,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let at = fmt_ts(&transition.at);
        let sql = match transition.to {
            ProposalStatus::Approved | ProposalStatus::Rejected => {
                "UPDATE part_change_proposals \
                 SET status = ?3, approved_at = ?4, approved_by = ?5, updated_at = ?4 \
                 WHERE id = ?1 AND user_id = ?2 AND status = ?6"
            }
            ProposalStatus::Executed => {
                "UPDATE part_change_proposals \
                 SET status = ?3, executed_at = ?4, executed_by = ?5, updated_at = ?4 \
                 WHERE id = ?1 AND user_id = ?2 AND status = ?6"
            }
            ProposalStatus::Pending => {
                return Err(DatabaseError::Constraint(
                    "proposals cannot transition back to pending".to_string(),
                ));
            }
        };

        let affected = conn
            .execute(
                sql,
                params![
                    id.to_string(),
                    user_id,
                    transition.to.as_str(),
                    at,
                    transition.actor.as_str(),
                    transition.from.as_str(),
                ],
            )
            .await?;
        if affected == 0 {
            return Ok(None);
        }
        self.fetch_proposal(&conn, user_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::db::libsql::LibSqlBackend;
    use crate::db::{
        Database, NewProposal, ProposalStatus, ProposalStore, ProposalTransition, ProposalType,
    };
    use crate::error::DatabaseError;

    struct TestBackend {
        backend: LibSqlBackend,
        _tmpdir: TempDir,
    }

    async fn setup_backend() -> TestBackend {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let db_path = tmpdir.path().join("proposals.db");
        let backend = LibSqlBackend::new_local(&db_path)
            .await
            .expect("libsql backend");
        backend.run_migrations().await.expect("migrations");
        TestBackend {
            backend,
            _tmpdir: tmpdir,
        }
    }

    fn new_split(key: Option<&str>) -> NewProposal {
        NewProposal {
            proposal_type: ProposalType::Split,
            payload: json!({"parentPartId": uuid::Uuid::new_v4(), "children": []}),
            rationale: "two voices".to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    fn transition(from: ProposalStatus, to: ProposalStatus) -> ProposalTransition {
        ProposalTransition {
            from,
            to,
            actor: "reviewer".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_maps_to_duplicate_error() {
        let test = setup_backend().await;
        let first = test
            .backend
            .insert_proposal("user-a", &new_split(Some("split-key-1")))
            .await
            .expect("first insert");
        assert_eq!(first.status, ProposalStatus::Pending);

        let err = test
            .backend
            .insert_proposal("user-a", &new_split(Some("split-key-1")))
            .await
            .expect_err("duplicate rejected");
        assert!(matches!(err, DatabaseError::Duplicate { ref constraint } if constraint == "uq_part_change_proposals_idem"));

        // Same key under another owner is fine; keys are unique per owner.
        test.backend
            .insert_proposal("user-b", &new_split(Some("split-key-1")))
            .await
            .expect("other owner");

        // Proposals without keys never collide.
        test.backend
            .insert_proposal("user-a", &new_split(None))
            .await
            .expect("keyless 1");
        test.backend
            .insert_proposal("user-a", &new_split(None))
            .await
            .expect("keyless 2");

        let found = test
            .backend
            .find_proposal_by_idempotency_key("user-a", "split-key-1")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() {
        let test = setup_backend().await;
        let proposal = test
            .backend
            .insert_proposal("user-a", &new_split(None))
            .await
            .expect("insert");

        let approved = test
            .backend
            .transition_proposal(
                "user-a",
                proposal.id,
                &transition(ProposalStatus::Pending, ProposalStatus::Approved),
            )
            .await
            .expect("approve")
            .expect("applied");
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("reviewer"));
        assert!(approved.approved_at.is_some());

        let lost_race = test
            .backend
            .transition_proposal(
                "user-a",
                proposal.id,
                &transition(ProposalStatus::Pending, ProposalStatus::Rejected),
            )
            .await
            .expect("reject attempt");
        assert!(lost_race.is_none());

        let executed = test
            .backend
            .transition_proposal(
                "user-a",
                proposal.id,
                &transition(ProposalStatus::Approved, ProposalStatus::Executed),
            )
            .await
            .expect("execute")
            .expect("applied");
        assert_eq!(executed.status, ProposalStatus::Executed);
        assert_eq!(executed.executed_by.as_deref(), Some("reviewer"));
        assert_eq!(executed.approved_by.as_deref(), Some("reviewer"));
    }
}
