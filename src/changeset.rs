use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::value::RawValue;
use serde_json::Value;
use std::fmt;

/// The kind of row mutation a changeset describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetKind {
    Insert,
    Update,
    Delete,
}

impl ChangesetKind {
    /// Parse a changeset kind from the audit `action` column or a wal2json
    /// `kind` field. Matching is case-insensitive.
    pub fn parse(kind: &str) -> Option<ChangesetKind> {
        match kind.to_ascii_lowercase().as_str() {
            "insert" => Some(ChangesetKind::Insert),
            "update" => Some(ChangesetKind::Update),
            "delete" => Some(ChangesetKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetKind::Insert => "insert",
            ChangesetKind::Update => "update",
            ChangesetKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangesetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dynamically typed column value.
///
/// Embedded JSON documents are carried as their original raw text in the
/// `RawJson` variant. Re-serializing a decoded document can reorder keys or
/// change whitespace, which breaks md5 checksum verification against the
/// source, so the raw text must survive end to end.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    RawJson(String),
    Array(Vec<ColumnValue>),
}

impl ColumnValue {
    /// Convert a raw JSON value into a column value, preserving object
    /// documents as their original text.
    pub fn from_raw(raw: &RawValue) -> Result<ColumnValue> {
        let value: Value = serde_json::from_str(raw.get())?;
        match value {
            Value::Object(_) => Ok(ColumnValue::RawJson(raw.get().to_string())),
            other => ColumnValue::from_json(&other),
        }
    }

    /// Convert a decoded JSON value into a column value.
    ///
    /// A nested mapping is rejected here: by the time a value is decoded into
    /// a `serde_json` object its original text is gone, and only the raw form
    /// is safe to replay (see `from_raw`).
    pub fn from_json(value: &Value) -> Result<ColumnValue> {
        match value {
            Value::Null => Ok(ColumnValue::Null),
            Value::Bool(b) => Ok(ColumnValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ColumnValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ColumnValue::Float(f))
                } else {
                    bail!("numeric value {} out of range", n)
                }
            }
            Value::String(s) => Ok(ColumnValue::Text(s.clone())),
            Value::Array(items) => {
                let values = items
                    .iter()
                    .map(ColumnValue::from_json)
                    .collect::<Result<Vec<_>>>()?;
                Ok(ColumnValue::Array(values))
            }
            Value::Object(_) => bail!("raw JSON string expected"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => f.write_str("NULL"),
            ColumnValue::Bool(b) => write!(f, "{}", b),
            ColumnValue::Int(i) => write!(f, "{}", i),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Text(s) => f.write_str(s),
            ColumnValue::RawJson(s) => f.write_str(s),
            ColumnValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A named, typed value within a changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetColumn {
    pub column: String,
    pub value: ColumnValue,
    /// PostgreSQL type name (e.g. `text`, `bytea`, `jsonb`, `int4[]`).
    /// Empty until resolved; the notify path fills it in from the
    /// pre-loaded column-type map, the replication path carries it inline.
    pub r#type: String,
}

/// A single row-level mutation observed on the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    /// Monotone id assigned by the audit table. Zero in replication mode,
    /// where ordering comes from the WAL position instead.
    pub id: i64,
    pub kind: ChangesetKind,
    pub schema: String,
    pub table: String,
    pub timestamp: DateTime<Utc>,
    /// Column values after the mutation. Empty for deletes.
    pub new_values: Vec<ChangesetColumn>,
    /// Column values before the mutation. Empty for inserts; at least the
    /// primary-key columns for updates and deletes.
    pub old_values: Vec<ChangesetColumn>,
}

impl Changeset {
    /// Look up a column in the new values.
    pub fn new_column_value(&self, column: &str) -> Option<&ColumnValue> {
        self.new_values
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }

    /// Look up a column in the old values.
    pub fn old_column_value(&self, column: &str) -> Option<&ColumnValue> {
        self.old_values
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id: {}, kind: {}, table: \"{}\".\"{}\"",
            self.id, self.kind, self.schema, self.table
        )?;
        if !self.new_values.is_empty() {
            f.write_str(", new: {")?;
            for (i, c) in self.new_values.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", c.column, c.value)?;
            }
            f.write_str("}")?;
        }
        if !self.old_values.is_empty() {
            f.write_str(", old: {")?;
            for (i, c) in self.old_values.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", c.column, c.value)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}
