// ABOUTME: SQL synthesis for replaying changesets against the target
// ABOUTME: Insert/upsert/delete builders and text-format parameter rendering

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};

use crate::changeset::{Changeset, ChangesetColumn, ColumnValue};

/// A parameter bound in the PostgreSQL text format.
///
/// Changeset values arrive as JSON scalars without knowing the target
/// column's wire type, so each value is rendered to its text representation
/// and the server parses it against the actual column type. `accepts`
/// is unconditional for the same reason.
#[derive(Debug, Clone)]
pub struct TextParam(pub Option<String>);

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match &self.0 {
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Render a column value to its PostgreSQL text form. `None` is SQL NULL.
pub fn render_text(value: &ColumnValue) -> Option<String> {
    match value {
        ColumnValue::Null => None,
        ColumnValue::Bool(b) => Some(b.to_string()),
        ColumnValue::Int(i) => Some(i.to_string()),
        ColumnValue::Float(f) => Some(f.to_string()),
        ColumnValue::Text(s) => Some(s.clone()),
        ColumnValue::RawJson(s) => Some(s.clone()),
        ColumnValue::Array(items) => Some(render_array_literal(items)),
    }
}

/// Render an array value as a PostgreSQL array literal.
///
/// An empty array renders as the literal `{}`, which the server accepts for
/// any element type; anything element-typed would fail on an empty
/// `character varying[]`.
fn render_array_literal(items: &[ColumnValue]) -> String {
    let elements: Vec<String> = items.iter().map(render_array_element).collect();
    format!("{{{}}}", elements.join(","))
}

fn render_array_element(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Bool(b) => b.to_string(),
        ColumnValue::Int(i) => i.to_string(),
        ColumnValue::Float(f) => f.to_string(),
        ColumnValue::Text(s) | ColumnValue::RawJson(s) => quote_array_element(s),
        ColumnValue::Array(items) => render_array_literal(items),
    }
}

fn quote_array_element(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Columns prepared for a statement: names, value expressions (either a
/// `$n` placeholder or an inlined literal), and the bound parameters.
struct PreparedColumns {
    names: Vec<String>,
    exprs: Vec<String>,
    params: Vec<TextParam>,
}

/// Build placeholders and parameters for a column list.
///
/// `bytea` values are inlined as single-quoted literals instead of bound:
/// the binding path hands the hex text to the server as the column's wire
/// type, where it is misread as a binary literal at parse time.
fn prepare_columns(columns: &[ChangesetColumn]) -> PreparedColumns {
    let mut prepared = PreparedColumns {
        names: Vec::with_capacity(columns.len()),
        exprs: Vec::with_capacity(columns.len()),
        params: Vec::new(),
    };

    for column in columns {
        let rendered = render_text(&column.value);
        prepared.names.push(quote_ident(&column.column));

        match (&rendered, column.r#type.as_str()) {
            (Some(text), "bytea") => {
                prepared.exprs.push(format!("'{}'", text));
            }
            _ => {
                prepared.params.push(TextParam(rendered));
                prepared.exprs.push(format!("${}", prepared.params.len()));
            }
        }
    }

    prepared
}

/// `INSERT INTO "schema"."table" (cols) VALUES (exprs)`.
pub fn build_insert(change: &Changeset) -> (String, Vec<TextParam>) {
    let prepared = prepare_columns(&change.new_values);
    let sql = format!(
        "INSERT INTO {}.{} ({}) VALUES ({})",
        quote_ident(&change.schema),
        quote_ident(&change.table),
        prepared.names.join(", "),
        prepared.exprs.join(", "),
    );
    (sql, prepared.params)
}

/// Upsert for replayed updates: insert the new row and take the update path
/// on primary-key conflict, guarded so only the conflicting row moves.
pub fn build_upsert(change: &Changeset, primary_key: &[String]) -> Result<(String, Vec<TextParam>)> {
    let prepared = prepare_columns(&change.new_values);

    let set_clauses: Vec<String> = change
        .new_values
        .iter()
        .filter(|c| !primary_key.contains(&c.column))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(&c.column), quote_ident(&c.column)))
        .collect();

    let mut where_clauses = Vec::with_capacity(primary_key.len());
    for pk in primary_key {
        let position = change
            .new_values
            .iter()
            .position(|c| &c.column == pk)
            .ok_or_else(|| {
                anyhow!("changeset has no value for primary key column '{}'", pk)
            })?;
        where_clauses.push(format!(
            "{}.{} = {}",
            quote_ident(&change.table),
            quote_ident(pk),
            prepared.exprs[position]
        ));
    }

    let conflict_action = if set_clauses.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!(
            "DO UPDATE SET {} WHERE {}",
            set_clauses.join(", "),
            where_clauses.join(" AND ")
        )
    };

    let pk_columns: Vec<String> = primary_key.iter().map(|c| quote_ident(c)).collect();
    let sql = format!(
        "INSERT INTO {}.{} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        quote_ident(&change.schema),
        quote_ident(&change.table),
        prepared.names.join(", "),
        prepared.exprs.join(", "),
        pk_columns.join(", "),
        conflict_action,
    );
    Ok((sql, prepared.params))
}

/// `DELETE FROM "schema"."table" WHERE "table".pk = $n [AND ...]`, keyed on
/// the old values.
pub fn build_delete(change: &Changeset, primary_key: &[String]) -> Result<(String, Vec<TextParam>)> {
    let mut params = Vec::with_capacity(primary_key.len());
    let mut clauses = Vec::with_capacity(primary_key.len());

    for pk in primary_key {
        let value = change.old_column_value(pk).ok_or_else(|| {
            anyhow!("changeset has no old value for primary key column '{}'", pk)
        })?;
        params.push(TextParam(render_text(value)));
        clauses.push(format!(
            "{}.{} = ${}",
            quote_ident(&change.table),
            quote_ident(pk),
            params.len()
        ));
    }

    let sql = format!(
        "DELETE FROM {}.{} WHERE {}",
        quote_ident(&change.schema),
        quote_ident(&change.table),
        clauses.join(" AND "),
    );
    Ok((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetKind;
    use chrono::Utc;

    fn column(name: &str, value: ColumnValue, r#type: &str) -> ChangesetColumn {
        ChangesetColumn {
            column: name.to_string(),
            value,
            r#type: r#type.to_string(),
        }
    }

    fn insert_changeset(new_values: Vec<ChangesetColumn>) -> Changeset {
        Changeset {
            id: 1,
            kind: ChangesetKind::Insert,
            schema: "public".to_string(),
            table: "users".to_string(),
            timestamp: Utc::now(),
            new_values,
            old_values: vec![],
        }
    }

    #[test]
    fn test_build_insert_binds_by_position() {
        let change = insert_changeset(vec![
            column("id", ColumnValue::Int(1), "int4"),
            column("first_name", ColumnValue::Text("Han".to_string()), "text"),
            column("email", ColumnValue::Text("han@test.com".to_string()), "text"),
        ]);
        let (sql, params) = build_insert(&change);

        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"first_name\", \"email\") \
             VALUES ($1, $2, $3)"
        );
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].0.as_deref(), Some("1"));
        assert_eq!(params[1].0.as_deref(), Some("Han"));
    }

    #[test]
    fn test_build_insert_inlines_bytea() {
        let change = insert_changeset(vec![
            column("id", ColumnValue::Int(1), "int4"),
            column(
                "avatar",
                ColumnValue::Text("\\x48616e".to_string()),
                "bytea",
            ),
        ]);
        let (sql, params) = build_insert(&change);

        assert!(sql.contains("VALUES ($1, '\\x48616e')"));
        // The inlined literal consumes no placeholder.
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_null_bytea_is_bound_not_inlined() {
        let change = insert_changeset(vec![column("avatar", ColumnValue::Null, "bytea")]);
        let (sql, params) = build_insert(&change);
        assert!(sql.contains("VALUES ($1)"));
        assert_eq!(params[0].0, None);
    }

    #[test]
    fn test_empty_array_renders_as_empty_literal() {
        let change = insert_changeset(vec![column(
            "tags",
            ColumnValue::Array(vec![]),
            "varchar[]",
        )]);
        let (_, params) = build_insert(&change);
        assert_eq!(params[0].0.as_deref(), Some("{}"));
    }

    #[test]
    fn test_array_literal_quotes_and_escapes_text() {
        let value = ColumnValue::Array(vec![
            ColumnValue::Text("plain".to_string()),
            ColumnValue::Text("has \"quotes\"".to_string()),
            ColumnValue::Text("back\\slash".to_string()),
            ColumnValue::Null,
            ColumnValue::Int(5),
        ]);
        assert_eq!(
            render_text(&value).unwrap(),
            "{\"plain\",\"has \\\"quotes\\\"\",\"back\\\\slash\",NULL,5}"
        );
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(render_text(&ColumnValue::Null), None);
        assert_eq!(render_text(&ColumnValue::Bool(true)).unwrap(), "true");
        assert_eq!(render_text(&ColumnValue::Int(-3)).unwrap(), "-3");
        assert_eq!(render_text(&ColumnValue::Float(2.5)).unwrap(), "2.5");
        assert_eq!(
            render_text(&ColumnValue::RawJson("{\"a\":1}".to_string())).unwrap(),
            "{\"a\":1}"
        );
    }

    #[test]
    fn test_build_upsert_shape() {
        let change = Changeset {
            id: 3,
            kind: ChangesetKind::Update,
            schema: "public".to_string(),
            table: "users".to_string(),
            timestamp: Utc::now(),
            new_values: vec![
                column("id", ColumnValue::Int(2), "int4"),
                column("last_name", ColumnValue::Text("Solo".to_string()), "text"),
            ],
            old_values: vec![column("id", ColumnValue::Int(2), "int4")],
        };
        let (sql, params) = build_upsert(&change, &["id".to_string()]).unwrap();

        assert!(sql.starts_with(
            "INSERT INTO \"public\".\"users\" (\"id\", \"last_name\") VALUES ($1, $2)"
        ));
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("DO UPDATE SET \"last_name\" = EXCLUDED.\"last_name\""));
        assert!(sql.contains("WHERE \"users\".\"id\" = $1"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_build_upsert_all_pk_columns_does_nothing() {
        let change = Changeset {
            id: 4,
            kind: ChangesetKind::Update,
            schema: "public".to_string(),
            table: "tags".to_string(),
            timestamp: Utc::now(),
            new_values: vec![column("id", ColumnValue::Int(9), "int4")],
            old_values: vec![column("id", ColumnValue::Int(9), "int4")],
        };
        let (sql, _) = build_upsert(&change, &["id".to_string()]).unwrap();
        assert!(sql.contains("DO NOTHING"));
        assert!(!sql.contains("DO UPDATE"));
    }

    #[test]
    fn test_build_upsert_requires_pk_value() {
        let change = Changeset {
            id: 5,
            kind: ChangesetKind::Update,
            schema: "public".to_string(),
            table: "users".to_string(),
            timestamp: Utc::now(),
            new_values: vec![column("email", ColumnValue::Text("x".to_string()), "text")],
            old_values: vec![],
        };
        assert!(build_upsert(&change, &["id".to_string()]).is_err());
    }

    #[test]
    fn test_build_delete_composite_key() {
        let change = Changeset {
            id: 6,
            kind: ChangesetKind::Delete,
            schema: "public".to_string(),
            table: "order_items".to_string(),
            timestamp: Utc::now(),
            new_values: vec![],
            old_values: vec![
                column("order_id", ColumnValue::Int(1), "int4"),
                column("item_id", ColumnValue::Int(7), "int4"),
            ],
        };
        let (sql, params) =
            build_delete(&change, &["order_id".to_string(), "item_id".to_string()]).unwrap();

        assert_eq!(
            sql,
            "DELETE FROM \"public\".\"order_items\" WHERE \
             \"order_items\".\"order_id\" = $1 AND \"order_items\".\"item_id\" = $2"
        );
        assert_eq!(params[0].0.as_deref(), Some("1"));
        assert_eq!(params[1].0.as_deref(), Some("7"));
    }

    #[test]
    fn test_build_delete_requires_old_pk_value() {
        let change = Changeset {
            id: 7,
            kind: ChangesetKind::Delete,
            schema: "public".to_string(),
            table: "users".to_string(),
            timestamp: Utc::now(),
            new_values: vec![],
            old_values: vec![],
        };
        assert!(build_delete(&change, &["id".to_string()]).is_err());
    }
}
