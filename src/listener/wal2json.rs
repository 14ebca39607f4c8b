// ABOUTME: serde model for wal2json output frames
// ABOUTME: Converts decoded WAL messages into changesets and handles LSN text forms

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::changeset::{Changeset, ChangesetColumn, ChangesetKind, ColumnValue};

/// One JSON frame produced by the wal2json output plugin.
///
/// With `include-lsn` on, every frame carries the `nextlsn` to report back
/// to the server once the frame is processed.
#[derive(Debug, Deserialize)]
pub struct Wal2JsonMessage {
    #[serde(rename = "change", default)]
    pub changes: Vec<Wal2JsonChange>,
    pub nextlsn: Option<String>,
    pub timestamp: Option<String>,
}

/// A single row change within a frame.
#[derive(Debug, Deserialize)]
pub struct Wal2JsonChange {
    pub kind: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Box<RawValue>>,
    pub oldkeys: Option<Wal2JsonOldKeys>,
}

/// Replica-identity columns reported for updates and deletes.
#[derive(Debug, Deserialize)]
pub struct Wal2JsonOldKeys {
    pub keynames: Vec<String>,
    pub keytypes: Vec<String>,
    pub keyvalues: Vec<Box<RawValue>>,
}

impl Wal2JsonMessage {
    pub fn decode(payload: &str) -> Result<Wal2JsonMessage> {
        serde_json::from_str(payload).context("failed to parse wal2json message")
    }

    /// Convert the frame into one changeset per change entry.
    pub fn to_changesets(&self) -> Result<Vec<Changeset>> {
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(DateTime::UNIX_EPOCH);

        self.changes
            .iter()
            .map(|change| change.to_changeset(timestamp))
            .collect()
    }
}

impl Wal2JsonChange {
    fn to_changeset(&self, timestamp: DateTime<Utc>) -> Result<Changeset> {
        let kind = ChangesetKind::parse(&self.kind)
            .ok_or_else(|| anyhow!("unknown wal2json change kind '{}'", self.kind))?;

        let new_values = zip_columns(&self.columnnames, &self.columntypes, &self.columnvalues)
            .with_context(|| {
                format!("bad column data for \"{}\".\"{}\"", self.schema, self.table)
            })?;

        let old_values = match &self.oldkeys {
            Some(keys) => zip_columns(&keys.keynames, &keys.keytypes, &keys.keyvalues)
                .with_context(|| {
                    format!("bad oldkeys data for \"{}\".\"{}\"", self.schema, self.table)
                })?,
            None => Vec::new(),
        };

        Ok(Changeset {
            id: 0,
            kind,
            schema: self.schema.clone(),
            table: self.table.clone(),
            timestamp,
            new_values,
            old_values,
        })
    }
}

fn zip_columns(
    names: &[String],
    types: &[String],
    values: &[Box<RawValue>],
) -> Result<Vec<ChangesetColumn>> {
    if names.len() != values.len() || names.len() != types.len() {
        bail!(
            "column name/type/value arity mismatch: {}/{}/{}",
            names.len(),
            types.len(),
            values.len()
        );
    }

    names
        .iter()
        .zip(types)
        .zip(values)
        .map(|((name, r#type), raw)| {
            Ok(ChangesetColumn {
                column: name.clone(),
                value: ColumnValue::from_raw(raw)
                    .with_context(|| format!("column {}", name))?,
                r#type: r#type.clone(),
            })
        })
        .collect()
}

/// Parse wal2json's `include-timestamp` form, e.g.
/// `2023-06-01 12:00:00.123456+00`.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an LSN in its `X/Y` text form into a 64-bit WAL position.
pub fn parse_lsn(text: &str) -> Result<u64> {
    let (hi, lo) = text
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed LSN '{}'", text))?;
    let hi = u64::from_str_radix(hi, 16)
        .with_context(|| format!("malformed LSN '{}'", text))?;
    let lo = u64::from_str_radix(lo, 16)
        .with_context(|| format!("malformed LSN '{}'", text))?;
    Ok((hi << 32) | lo)
}

/// Format a 64-bit WAL position as `X/Y`.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_FRAME: &str = r#"{
        "change": [{
            "kind": "insert",
            "schema": "public",
            "table": "users",
            "columnnames": ["id", "first_name", "last_name", "email"],
            "columntypes": ["integer", "text", "text", "text"],
            "columnvalues": [1, "Han", "Solo", "han@test.com"]
        }],
        "nextlsn": "0/16D1918",
        "timestamp": "2023-06-01 12:00:00.123456+00"
    }"#;

    const DELETE_FRAME: &str = r#"{
        "change": [{
            "kind": "delete",
            "schema": "public",
            "table": "users",
            "oldkeys": {
                "keynames": ["id"],
                "keytypes": ["integer"],
                "keyvalues": [1]
            }
        }],
        "nextlsn": "0/16D1A20"
    }"#;

    #[test]
    fn test_decode_insert_frame() {
        let message = Wal2JsonMessage::decode(INSERT_FRAME).unwrap();
        assert_eq!(message.nextlsn.as_deref(), Some("0/16D1918"));

        let changesets = message.to_changesets().unwrap();
        assert_eq!(changesets.len(), 1);

        let change = &changesets[0];
        assert_eq!(change.kind, ChangesetKind::Insert);
        assert_eq!(change.schema, "public");
        assert_eq!(change.table, "users");
        assert_eq!(change.new_values.len(), 4);
        assert_eq!(change.new_values[1].column, "first_name");
        assert_eq!(change.new_values[1].r#type, "text");
        assert_eq!(
            change.new_values[1].value,
            ColumnValue::Text("Han".to_string())
        );
        assert!(change.old_values.is_empty());
    }

    #[test]
    fn test_decode_delete_frame_uses_oldkeys() {
        let message = Wal2JsonMessage::decode(DELETE_FRAME).unwrap();
        let changesets = message.to_changesets().unwrap();
        let change = &changesets[0];

        assert_eq!(change.kind, ChangesetKind::Delete);
        assert!(change.new_values.is_empty());
        assert_eq!(change.old_values.len(), 1);
        assert_eq!(change.old_values[0].column, "id");
        assert_eq!(change.old_values[0].r#type, "integer");
        assert_eq!(change.old_values[0].value, ColumnValue::Int(1));
    }

    #[test]
    fn test_embedded_json_document_stays_raw() {
        let frame = r#"{
            "change": [{
                "kind": "insert",
                "schema": "public",
                "table": "profiles",
                "columnnames": ["id", "data"],
                "columntypes": ["integer", "jsonb"],
                "columnvalues": [1, {"name":"Alice","age":31}]
            }],
            "nextlsn": "0/1"
        }"#;
        let changesets = Wal2JsonMessage::decode(frame)
            .unwrap()
            .to_changesets()
            .unwrap();
        assert_eq!(
            changesets[0].new_values[1].value,
            ColumnValue::RawJson(r#"{"name":"Alice","age":31}"#.to_string())
        );
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let frame = r#"{
            "change": [{
                "kind": "insert",
                "schema": "public",
                "table": "users",
                "columnnames": ["id"],
                "columntypes": ["integer", "text"],
                "columnvalues": [1]
            }]
        }"#;
        let message = Wal2JsonMessage::decode(frame).unwrap();
        assert!(message.to_changesets().is_err());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let frame = r#"{
            "change": [{"kind": "message", "schema": "public", "table": "t"}]
        }"#;
        let message = Wal2JsonMessage::decode(frame).unwrap();
        assert!(message.to_changesets().is_err());
    }

    #[test]
    fn test_frame_timestamp_is_parsed() {
        let message = Wal2JsonMessage::decode(INSERT_FRAME).unwrap();
        let changesets = message.to_changesets().unwrap();
        assert_eq!(
            changesets[0].timestamp.to_rfc3339(),
            "2023-06-01T12:00:00.123456+00:00"
        );
    }

    #[test]
    fn test_parse_lsn_round_trip() {
        let lsn = parse_lsn("16/B374D848").unwrap();
        assert_eq!(lsn, (0x16u64 << 32) | 0xB374D848);
        assert_eq!(format_lsn(lsn), "16/B374D848");
    }

    #[test]
    fn test_parse_lsn_zero() {
        assert_eq!(parse_lsn("0/0").unwrap(), 0);
        assert_eq!(format_lsn(0), "0/0");
    }

    #[test]
    fn test_parse_lsn_rejects_malformed() {
        assert!(parse_lsn("deadbeef").is_err());
        assert!(parse_lsn("x/y").is_err());
    }
}
