// ABOUTME: Queries against the warp_pipe.changesets audit table
// ABOUTME: Paginated backfill reads, point lookups, and audit-row decoding

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::{Client, Row};

use crate::changeset::{Changeset, ChangesetColumn, ChangesetKind, ColumnValue};

/// Rows fetched per backfill batch.
pub const BACKFILL_BATCH_SIZE: i64 = 500;

const EVENT_COLUMNS: &str =
    "id, ts, action, schema_name, table_name, relid, new_values::text, old_values::text";

/// One stored row of the audit table.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub schema_name: String,
    pub table_name: String,
    pub relid: u32,
    pub new_values: Option<String>,
    pub old_values: Option<String>,
}

impl StoredEvent {
    fn from_row(row: &Row) -> StoredEvent {
        StoredEvent {
            id: row.get(0),
            timestamp: row.get(1),
            action: row.get(2),
            schema_name: row.get(3),
            table_name: row.get(4),
            relid: row.get(5),
            new_values: row.get(6),
            old_values: row.get(7),
        }
    }

    /// Decode the stored JSON payloads into a changeset.
    pub fn into_changeset(self) -> Result<Changeset> {
        let kind = ChangesetKind::parse(&self.action)
            .ok_or_else(|| anyhow!("unknown changeset action '{}'", self.action))?;

        let new_values = match &self.new_values {
            Some(json) => decode_values(json)
                .with_context(|| format!("failed to decode new values for changeset {}", self.id))?,
            None => Vec::new(),
        };
        let old_values = match &self.old_values {
            Some(json) => decode_values(json)
                .with_context(|| format!("failed to decode old values for changeset {}", self.id))?,
            None => Vec::new(),
        };

        Ok(Changeset {
            id: self.id,
            kind,
            schema: self.schema_name,
            table: self.table_name,
            timestamp: self.timestamp,
            new_values,
            old_values,
        })
    }
}

/// Decode a `row_to_json` object into an ordered column list.
///
/// The document is parsed twice: once into ordered values, once into raw
/// fragments, so that object-valued cells (embedded JSON/JSONB) keep their
/// original text instead of being re-serialized.
fn decode_values(json: &str) -> Result<Vec<ChangesetColumn>> {
    let values: Map<String, Value> =
        serde_json::from_str(json).context("audit payload is not a JSON object")?;
    let raw_values: HashMap<String, Box<RawValue>> =
        serde_json::from_str(json).context("audit payload is not a JSON object")?;

    let mut columns = Vec::with_capacity(values.len());
    for (name, value) in &values {
        let column_value = match value {
            Value::Object(_) => {
                let raw = raw_values
                    .get(name)
                    .ok_or_else(|| anyhow!("missing raw fragment for column {}", name))?;
                ColumnValue::RawJson(raw.get().to_string())
            }
            other => ColumnValue::from_json(other)
                .with_context(|| format!("column {}", name))?,
        };
        columns.push(ChangesetColumn {
            column: name.clone(),
            value: column_value,
            r#type: String::new(),
        });
    }

    Ok(columns)
}

/// Access to the audit table on one source connection.
#[derive(Clone)]
pub struct ChangesetStore {
    client: Arc<Client>,
}

impl ChangesetStore {
    pub fn new(client: Arc<Client>) -> Self {
        ChangesetStore { client }
    }

    /// Fetch a single event by id. Missing rows are an error: the
    /// notification named an id the table no longer holds.
    pub async fn get_by_id(&self, id: i64) -> Result<StoredEvent> {
        let sql = format!(
            "SELECT {} FROM warp_pipe.changesets WHERE id = $1",
            EVENT_COLUMNS
        );
        let rows = self
            .client
            .query(&sql, &[&id])
            .await
            .with_context(|| format!("failed to fetch changeset {}", id))?;
        let row = rows
            .first()
            .ok_or_else(|| anyhow!("changeset {} not found", id))?;
        Ok(StoredEvent::from_row(row))
    }

    /// Fetch one backfill batch of events with id greater than `since`.
    pub async fn batch_since_id(&self, since: i64, offset: i64) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {} FROM warp_pipe.changesets WHERE id > $1 ORDER BY id LIMIT {} OFFSET $2",
            EVENT_COLUMNS, BACKFILL_BATCH_SIZE
        );
        let rows = self
            .client
            .query(&sql, &[&since, &offset])
            .await
            .context("failed to read changesets since id")?;
        Ok(rows.iter().map(StoredEvent::from_row).collect())
    }

    /// Fetch one backfill batch of events at or after `since`.
    ///
    /// Ordered by `ts, id`: ids break ties between events sharing a
    /// timestamp, so a resume never interleaves them differently run to run.
    pub async fn batch_since_timestamp(
        &self,
        since: DateTime<Utc>,
        offset: i64,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {} FROM warp_pipe.changesets WHERE ts >= $1 ORDER BY ts, id LIMIT {} OFFSET $2",
            EVENT_COLUMNS, BACKFILL_BATCH_SIZE
        );
        let rows = self
            .client
            .query(&sql, &[&since, &offset])
            .await
            .context("failed to read changesets since timestamp")?;
        Ok(rows.iter().map(StoredEvent::from_row).collect())
    }

    /// Id of the newest stored changeset, if any.
    pub async fn latest_id(&self) -> Result<Option<i64>> {
        let rows = self
            .client
            .query(
                "SELECT id FROM warp_pipe.changesets ORDER BY id DESC LIMIT 1",
                &[],
            )
            .await
            .context("failed to read latest changeset id")?;
        Ok(rows.first().map(|row| row.get(0)))
    }

    /// Total number of stored changesets.
    pub async fn count(&self) -> Result<i64> {
        changeset_count(&self.client).await
    }
}

/// Count the audit rows on one side; used for the startup catch-up probe.
pub async fn changeset_count(client: &Client) -> Result<i64> {
    let row = client
        .query_one("SELECT count(id) FROM warp_pipe.changesets", &[])
        .await
        .context("failed to count changesets")?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_values_preserves_order() {
        let columns =
            decode_values(r#"{"id":1,"first_name":"Han","last_name":"Solo"}"#).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(names, vec!["id", "first_name", "last_name"]);
        assert_eq!(columns[0].value, ColumnValue::Int(1));
        assert_eq!(columns[1].value, ColumnValue::Text("Han".to_string()));
    }

    #[test]
    fn test_decode_values_keeps_embedded_json_raw() {
        let columns =
            decode_values(r#"{"id":2,"profile":{"name":"Alice","age":31}}"#).unwrap();
        assert_eq!(
            columns[1].value,
            ColumnValue::RawJson(r#"{"name":"Alice","age":31}"#.to_string())
        );
    }

    #[test]
    fn test_decode_values_handles_nulls_and_arrays() {
        let columns = decode_values(r#"{"tags":["a","b"],"note":null}"#).unwrap();
        assert_eq!(
            columns[0].value,
            ColumnValue::Array(vec![
                ColumnValue::Text("a".to_string()),
                ColumnValue::Text("b".to_string()),
            ])
        );
        assert_eq!(columns[1].value, ColumnValue::Null);
    }

    #[test]
    fn test_decode_values_rejects_non_object_payload() {
        assert!(decode_values("[1,2,3]").is_err());
    }

    #[test]
    fn test_into_changeset_maps_action_and_payloads() {
        let event = StoredEvent {
            id: 3,
            timestamp: Utc::now(),
            action: "UPDATE".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            relid: 16384,
            new_values: Some(r#"{"id":3,"email":"leia@test.com"}"#.to_string()),
            old_values: Some(r#"{"id":3,"email":"leia@old.com"}"#.to_string()),
        };
        let change = event.into_changeset().unwrap();
        assert_eq!(change.kind, ChangesetKind::Update);
        assert_eq!(change.new_values.len(), 2);
        assert_eq!(change.old_values.len(), 2);
        assert_eq!(
            change.new_column_value("email"),
            Some(&ColumnValue::Text("leia@test.com".to_string()))
        );
    }

    #[test]
    fn test_into_changeset_rejects_unknown_action() {
        let event = StoredEvent {
            id: 4,
            timestamp: Utc::now(),
            action: "TRUNCATE".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            relid: 16384,
            new_values: None,
            old_values: None,
        };
        assert!(event.into_changeset().is_err());
    }
}
