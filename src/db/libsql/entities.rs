use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{EntityRecord, EntityState, EntityStore, EntityTable, NewEntity};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_text, parse_json, parse_ts_column, parse_uuid, to_json_text,
};

const ENTITY_COLUMNS: &str = "id, user_id, attributes, superseded_by, created_at, updated_at";

fn row_to_entity_record(row: &libsql::Row) -> Result<EntityRecord, DatabaseError> {
    let attributes = match parse_json(&get_text(row, 2), "attributes")? {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(DatabaseError::Serialization(format!(
                "attributes must be a json object, got {}",
                other
            )));
        }
    };
    let superseded_raw = get_text(row, 3);
    let superseded_by: Vec<Uuid> = if superseded_raw.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&superseded_raw)
            .map_err(|e| DatabaseError::Serialization(format!("invalid superseded_by: {}", e)))?
    };

    Ok(EntityRecord {
        id: parse_uuid(&get_text(row, 0), "entity.id")?,
        user_id: get_text(row, 1),
        attributes,
        superseded_by,
        created_at: parse_ts_column(&get_text(row, 4), "created_at")?,
        updated_at: parse_ts_column(&get_text(row, 5), "updated_at")?,
    })
}

/// Attribute keys are interpolated into a JSON path, so only plain
/// identifiers are accepted.
fn json_path_for_key(key: &str) -> Result<String, DatabaseError> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Query(format!(
            "invalid attribute key '{}'",
            key
        )));
    }
    Ok(format!("$.{}", key))
}

#[async_trait::async_trait]
impl EntityStore for LibSqlBackend {
    async fn insert_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        input: &NewEntity,
    ) -> Result<EntityRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        let attributes = to_json_text(&input.attributes)?;

        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, '[]', ?4, ?4)",
                table.as_str(),
                ENTITY_COLUMNS
            ),
            params![id.to_string(), user_id, attributes, now],
        )
        .await?;

        self.get_entity(table, user_id, id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: table.entity_label().to_string(),
                id: id.to_string(),
            })
    }

    async fn get_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1 AND user_id = ?2",
                    ENTITY_COLUMNS,
                    table.as_str()
                ),
                params![id.to_string(), user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_entity_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
        state: &EntityState,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let attributes = to_json_text(&state.attributes)?;
        let superseded_by = to_json_text(&state.superseded_by)?;

        let affected = conn
            .execute(
                &format!(
                    "UPDATE {} SET attributes = ?3, superseded_by = ?4, updated_at = ?5 \
                     WHERE id = ?1 AND user_id = ?2",
                    table.as_str()
                ),
                params![
                    id.to_string(),
                    user_id,
                    attributes,
                    superseded_by,
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_entity(table, user_id, id).await
    }

    async fn delete_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = ?1 AND user_id = ?2",
                    table.as_str()
                ),
                params![id.to_string(), user_id],
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
        let path = json_path_for_key(key)?;
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {} \
                     WHERE user_id = ?1 AND json_extract(attributes, ?2) = ?3 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?4",
                    ENTITY_COLUMNS,
                    table.as_str()
                ),
                params![user_id, path, value, limit],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_entity_record(&row)?);
        }
        Ok(out)
    }
}
