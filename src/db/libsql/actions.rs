use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    ActionKind, ActionMetadata, ActionQuery, ActionRecord, ActionStore, NewActionRecord,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, opt_text, opt_text_owned,
    parse_dt_opt, parse_json, parse_ts_column, parse_uuid, to_json_text,
};

const ACTION_COLUMNS: &str = "id, user_id, action_kind, target_table, target_id, old_state, \
     new_state, metadata, created_at, created_by, rolled_back, rollback_reason, rollback_at";

fn parse_action_kind(raw: &str) -> Result<ActionKind, DatabaseError> {
    ActionKind::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid action_kind '{}'", raw)))
}

fn row_to_action_record(row: &libsql::Row) -> Result<ActionRecord, DatabaseError> {
    let old_state = match get_opt_text(row, 5) {
        Some(raw) => Some(parse_json(&raw, "old_state")?),
        None => None,
    };
    let metadata: ActionMetadata = serde_json::from_str(&get_text(row, 7))
        .map_err(|e| DatabaseError::Serialization(format!("invalid metadata: {}", e)))?;

    Ok(ActionRecord {
        id: parse_uuid(&get_text(row, 0), "action.id")?,
        user_id: get_text(row, 1),
        action_kind: parse_action_kind(&get_text(row, 2))?,
        target_table: get_text(row, 3),
        target_id: parse_uuid(&get_text(row, 4), "action.target_id")?,
        old_state,
        new_state: parse_json(&get_text(row, 6), "new_state")?,
        metadata,
        created_at: parse_ts_column(&get_text(row, 8), "created_at")?,
        created_by: get_text(row, 9),
        rolled_back: get_i64(row, 10) != 0,
        rollback_reason: get_opt_text(row, 11),
        rollback_at: parse_dt_opt(get_opt_text(row, 12))?,
    })
}

#[async_trait::async_trait]
impl ActionStore for LibSqlBackend {
    async fn append_action(&self, input: &NewActionRecord) -> Result<ActionRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let old_state = match &input.old_state {
            Some(value) => Some(to_json_text(value)?),
            None => None,
        };

        conn.execute(
            "INSERT INTO agent_actions \
             (id, user_id, action_kind, target_table, target_id, old_state, new_state, \
              metadata, session_id, created_at, created_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.to_string(),
                input.user_id.as_str(),
                input.action_kind.as_str(),
                input.target_table.as_str(),
                input.target_id.to_string(),
                opt_text_owned(old_state),
                to_json_text(&input.new_state)?,
                to_json_text(&input.metadata)?,
                opt_text(input.metadata.session_id.as_deref()),
                fmt_ts(&Utc::now()),
                input.created_by.as_str(),
            ],
        )
        .await?;

        self.get_action(Some(&input.user_id), id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "action".to_string(),
                id: id.to_string(),
            })
    }

    async fn get_action(
        &self,
        user_id: Option<&str>,
        id: Uuid,
    ) -> Result<Option<ActionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = match user_id {
            Some(user_id) => {
                conn.query(
                    &format!(
                        "SELECT {} FROM agent_actions WHERE id = ?1 AND user_id = ?2",
                        ACTION_COLUMNS
                    ),
                    params![id.to_string(), user_id],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!("SELECT {} FROM agent_actions WHERE id = ?1", ACTION_COLUMNS),
                    params![id.to_string()],
                )
                .await?
            }
        };
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_action_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_actions(
        &self,
        user_id: &str,
        query: &ActionQuery,
    ) -> Result<Vec<ActionRecord>, DatabaseError> {
        let mut sql = format!(
            "SELECT {} FROM agent_actions WHERE user_id = ?1",
            ACTION_COLUMNS
        );
        let mut values: Vec<libsql::Value> = vec![libsql::Value::Text(user_id.to_string())];

        if !query.kinds.is_empty() {
            let start = values.len() + 1;
            let placeholders = (0..query.kinds.len())
                .map(|i| format!("?{}", start + i))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND action_kind IN ({})", placeholders));
            values.extend(
                query
                    .kinds
                    .iter()
                    .map(|kind| libsql::Value::Text(kind.as_str().to_string())),
            );
        }
        if let Some(session_id) = &query.session_id {
            values.push(libsql::Value::Text(session_id.clone()));
            sql.push_str(&format!(" AND session_id = ?{}", values.len()));
        }
        if let Some(since) = &query.since {
            values.push(libsql::Value::Text(fmt_ts(since)));
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        if !query.include_rolled_back {
            sql.push_str(" AND rolled_back = 0");
        }
        values.push(libsql::Value::Integer(query.limit.max(0)));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            values.len()
        ));

        let conn = self.connect().await?;
        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_action_record(&row)?);
        }
        Ok(out)
    }

    async fn mark_action_rolled_back(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE agent_actions SET rolled_back = 1, rollback_reason = ?2, rollback_at = ?3 \
                 WHERE id = ?1 AND rolled_back = 0",
                params![id.to_string(), reason, fmt_ts(&at)],
            )
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::db::libsql::LibSqlBackend;
    use crate::db::{
        ActionKind, ActionMetadata, ActionQuery, ActionStore, Database, NewActionRecord,
    };

    struct TestBackend {
        backend: LibSqlBackend,
        _tmpdir: TempDir,
    }

    async fn setup_backend() -> TestBackend {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let db_path = tmpdir.path().join("actions.db");
        let backend = LibSqlBackend::new_local(&db_path)
            .await
            .expect("libsql backend");
        backend.run_migrations().await.expect("migrations");
        TestBackend {
            backend,
            _tmpdir: tmpdir,
        }
    }

    fn record(user_id: &str, kind: ActionKind, session: Option<&str>) -> NewActionRecord {
        let mut metadata = ActionMetadata::for_part("Critic");
        metadata.session_id = session.map(str::to_string);
        NewActionRecord {
            user_id: user_id.to_string(),
            action_kind: kind,
            target_table: "parts".to_string(),
            target_id: Uuid::new_v4(),
            old_state: Some(json!({"confidence": 0.3})),
            new_state: json!({"confidence": 0.5}),
            metadata,
            created_by: "agent".to_string(),
        }
    }

    #[tokio::test]
    async fn append_and_get_round_trip_states_and_metadata() {
        let test = setup_backend().await;
        let input = record("user-a", ActionKind::UpdatePartConfidence, Some("s1"));
        let stored = test.backend.append_action(&input).await.expect("append");

        assert_eq!(stored.action_kind, ActionKind::UpdatePartConfidence);
        assert_eq!(stored.old_state, Some(json!({"confidence": 0.3})));
        assert_eq!(stored.metadata.part_name.as_deref(), Some("Critic"));
        assert!(!stored.rolled_back);

        let scoped = test
            .backend
            .get_action(Some("user-b"), stored.id)
            .await
            .expect("scoped get");
        assert!(scoped.is_none());
        let elevated = test
            .backend
            .get_action(None, stored.id)
            .await
            .expect("elevated get");
        assert_eq!(elevated.map(|r| r.id), Some(stored.id));
    }

    #[tokio::test]
    async fn creation_records_keep_null_old_state() {
        let test = setup_backend().await;
        let mut input = record("user-a", ActionKind::CreateEmergingPart, None);
        input.old_state = None;
        let stored = test.backend.append_action(&input).await.expect("append");
        assert!(stored.is_creation());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let test = setup_backend().await;
        let first = test
            .backend
            .append_action(&record("user-a", ActionKind::CreateEmergingPart, Some("s1")))
            .await
            .expect("first");
        let second = test
            .backend
            .append_action(&record("user-a", ActionKind::UpdatePartConfidence, Some("s1")))
            .await
            .expect("second");
        let third = test
            .backend
            .append_action(&record("user-a", ActionKind::UpdatePartConfidence, Some("s2")))
            .await
            .expect("third");
        test.backend
            .append_action(&record("user-b", ActionKind::UpdatePartConfidence, Some("s1")))
            .await
            .expect("foreign");

        let all = test
            .backend
            .list_actions("user-a", &ActionQuery::default())
            .await
            .expect("list");
        let ids: Vec<_> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let by_kind_and_session = test
            .backend
            .list_actions(
                "user-a",
                &ActionQuery {
                    kinds: vec![ActionKind::UpdatePartConfidence],
                    session_id: Some("s1".to_string()),
                    ..ActionQuery::default()
                },
            )
            .await
            .expect("filtered");
        assert_eq!(by_kind_and_session.len(), 1);
        assert_eq!(by_kind_and_session[0].id, second.id);

        let future = test
            .backend
            .list_actions(
                "user-a",
                &ActionQuery {
                    since: Some(Utc::now() + Duration::minutes(5)),
                    ..ActionQuery::default()
                },
            )
            .await
            .expect("since");
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn rollback_flag_flips_exactly_once() {
        let test = setup_backend().await;
        let stored = test
            .backend
            .append_action(&record("user-a", ActionKind::UpdatePartConfidence, None))
            .await
            .expect("append");

        let now = Utc::now();
        assert!(
            test.backend
                .mark_action_rolled_back(stored.id, "undo", now)
                .await
                .expect("first flip")
        );
        assert!(
            !test
                .backend
                .mark_action_rolled_back(stored.id, "again", now)
                .await
                .expect("second flip")
        );

        let reloaded = test
            .backend
            .get_action(None, stored.id)
            .await
            .expect("get")
            .expect("present");
        assert!(reloaded.rolled_back);
        assert_eq!(reloaded.rollback_reason.as_deref(), Some("undo"));
        assert!(reloaded.rollback_at.is_some());

        let live_only = test
            .backend
            .list_actions(
                "user-a",
                &ActionQuery {
                    include_rolled_back: false,
                    ..ActionQuery::default()
                },
            )
            .await
            .expect("list");
        assert!(live_only.is_empty());
    }
}
