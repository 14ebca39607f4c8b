// ABOUTME: Schema introspection backing the applier
// ABOUTME: Primary keys, serial sequences, orphan sequences, and column types

use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use tokio_postgres::Client;

/// Immutable introspection bundle loaded once at startup.
///
/// Primary keys and sequences come from the target (where the mutations
/// land); orphan sequences and column types come from the source. Injected
/// into the applier behind an `Arc` and never written afterwards.
#[derive(Debug, Default)]
pub struct SchemaCache {
    /// Table name to primary-key columns in ordinal order.
    primary_keys: HashMap<String, Vec<String>>,
    /// (table, column) to the sequence feeding the column's default.
    sequence_columns: HashMap<(String, String), String>,
    /// Source sequences not referenced by any column default.
    orphan_sequences: Vec<String>,
    /// (schema, table) to column-name/type-name map.
    column_types: HashMap<(String, String), HashMap<String, String>>,
}

impl SchemaCache {
    /// Load everything the applier needs from both databases.
    pub async fn load(source: &Client, target: &Client) -> Result<SchemaCache> {
        let primary_keys = load_primary_keys(target)
            .await
            .context("unable to load target primary keys")?;
        let sequence_columns = load_sequence_columns(target)
            .await
            .context("unable to load target column sequences")?;
        let orphan_sequences = load_orphan_sequences(source, &sequence_columns)
            .await
            .context("unable to load source orphan sequences")?;
        let column_types = load_column_types(source)
            .await
            .context("unable to load source column types")?;

        tracing::info!(
            "schema cache loaded: {} tables with primary keys, {} sequence columns, {} orphan sequences",
            primary_keys.len(),
            sequence_columns.len(),
            orphan_sequences.len(),
        );

        Ok(SchemaCache {
            primary_keys,
            sequence_columns,
            orphan_sequences,
            column_types,
        })
    }

    /// Primary-key columns for a table. Applying an UPDATE or DELETE to a
    /// table without an entry is a per-event fatal error.
    pub fn primary_key(&self, table: &str) -> Result<&[String]> {
        self.primary_keys
            .get(table)
            .map(|cols| cols.as_slice())
            .ok_or_else(|| anyhow!("no primary key in mapping for table '{}'", table))
    }

    /// Sequence backing a serial column, if any.
    pub fn sequence_for_column(&self, table: &str, column: &str) -> Option<&str> {
        self.sequence_columns
            .get(&(table.to_string(), column.to_string()))
            .map(|s| s.as_str())
    }

    pub fn orphan_sequences(&self) -> &[String] {
        &self.orphan_sequences
    }

    /// Declared type of a column, for enriching notify-mode changesets.
    pub fn column_type(&self, schema: &str, table: &str, column: &str) -> Result<&str> {
        self.column_types
            .get(&(schema.to_string(), table.to_string()))
            .and_then(|cols| cols.get(column))
            .map(|t| t.as_str())
            .ok_or_else(|| {
                anyhow!(
                    "column type not found for column {} in table \"{}\".\"{}\"",
                    column,
                    schema,
                    table
                )
            })
    }

    #[cfg(test)]
    pub fn for_tests(
        primary_keys: HashMap<String, Vec<String>>,
        sequence_columns: HashMap<(String, String), String>,
        orphan_sequences: Vec<String>,
        column_types: HashMap<(String, String), HashMap<String, String>>,
    ) -> SchemaCache {
        SchemaCache {
            primary_keys,
            sequence_columns,
            orphan_sequences,
            column_types,
        }
    }
}

async fn load_primary_keys(client: &Client) -> Result<HashMap<String, Vec<String>>> {
    let rows = client
        .query(
            "SELECT kcu.table_name,
                    array_agg(kcu.column_name::text ORDER BY kcu.ordinal_position) AS primary_key
             FROM information_schema.table_constraints tco
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tco.constraint_name
              AND kcu.constraint_schema = tco.constraint_schema
             WHERE tco.constraint_type = 'PRIMARY KEY'
             GROUP BY kcu.table_name",
            &[],
        )
        .await?;

    let mut primary_keys = HashMap::with_capacity(rows.len());
    for row in rows {
        let table: String = row.get(0);
        let columns: Vec<String> = row.get(1);
        primary_keys.insert(table, columns);
    }
    Ok(primary_keys)
}

async fn load_sequence_columns(
    client: &Client,
) -> Result<HashMap<(String, String), String>> {
    let rows = client
        .query(
            "SELECT table_name, column_name, column_default
             FROM information_schema.columns
             WHERE table_schema = 'public'
               AND column_default LIKE 'nextval(%'",
            &[],
        )
        .await?;

    let mut sequences = HashMap::with_capacity(rows.len());
    for row in rows {
        let table: String = row.get(0);
        let column: String = row.get(1);
        let default: String = row.get(2);
        let sequence = parse_sequence_name(&default).ok_or_else(|| {
            anyhow!(
                "cannot parse sequence name from default '{}' on {}.{}",
                default,
                table,
                column
            )
        })?;
        sequences.insert((table, column), sequence.to_string());
    }
    Ok(sequences)
}

/// Pull the sequence name out of a `nextval('...'::regclass)` default: the
/// name sits between the first two single quotes.
fn parse_sequence_name(column_default: &str) -> Option<&str> {
    let mut parts = column_default.split('\'');
    parts.next()?;
    parts.next()
}

async fn load_orphan_sequences(
    client: &Client,
    sequence_columns: &HashMap<(String, String), String>,
) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT sequence_name
             FROM information_schema.sequences
             WHERE sequence_schema = 'public'",
            &[],
        )
        .await?;

    let referenced: HashSet<&str> =
        sequence_columns.values().map(|s| s.as_str()).collect();

    let orphans = rows
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|name| !referenced.contains(name.as_str()))
        .collect();
    Ok(orphans)
}

async fn load_column_types(
    client: &Client,
) -> Result<HashMap<(String, String), HashMap<String, String>>> {
    let rows = client
        .query(
            "SELECT table_schema, table_name, column_name, data_type
             FROM information_schema.columns
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema', 'warp_pipe')",
            &[],
        )
        .await?;

    let mut column_types: HashMap<(String, String), HashMap<String, String>> = HashMap::new();
    for row in rows {
        let schema: String = row.get(0);
        let table: String = row.get(1);
        let column: String = row.get(2);
        let data_type: String = row.get(3);
        column_types
            .entry((schema, table))
            .or_default()
            .insert(column, data_type);
    }
    Ok(column_types)
}

/// A table selected for trigger registration or verification.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// Primary-key columns in ordinal order; empty when the table has none.
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

/// Split a `schema.table` entry, defaulting bare names to `public`.
fn split_table_name(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => ("public".to_string(), name.to_string()),
    }
}

/// Resolve the table list for the given schemas, honoring includes and
/// excludes. An empty include list means every table in each schema.
pub async fn list_tables(
    client: &Client,
    schemas: &[String],
    include_tables: &[String],
    exclude_tables: &[String],
) -> Result<Vec<TableInfo>> {
    let mut selected: Vec<String> = if !include_tables.is_empty() {
        include_tables.to_vec()
    } else {
        let mut names = Vec::new();
        for schema in schemas {
            let rows = client
                .query(
                    "SELECT tablename FROM pg_catalog.pg_tables WHERE schemaname = $1",
                    &[schema],
                )
                .await
                .with_context(|| format!("failed to list tables in schema '{}'", schema))?;
            for row in rows {
                names.push(format!("{}.{}", schema, row.get::<_, String>(0)));
            }
        }
        names
    };

    selected.retain(|name| !exclude_tables.contains(name));
    selected.sort();

    let mut tables = Vec::with_capacity(selected.len());
    for name in selected {
        let (schema, table) = split_table_name(&name);
        let primary_key = table_primary_key(client, &schema, &table).await?;
        tables.push(TableInfo {
            schema,
            name: table,
            primary_key,
        });
    }
    Ok(tables)
}

async fn table_primary_key(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT kcu.column_name
             FROM information_schema.table_constraints tco
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tco.constraint_name
              AND kcu.constraint_schema = tco.constraint_schema
             WHERE tco.constraint_type = 'PRIMARY KEY'
               AND kcu.table_schema = $1
               AND kcu.table_name = $2
             ORDER BY kcu.ordinal_position",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("failed to read primary key for {}.{}", schema, table))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence_name_from_default() {
        assert_eq!(
            parse_sequence_name("nextval('users_id_seq'::regclass)"),
            Some("users_id_seq")
        );
        assert_eq!(
            parse_sequence_name("nextval('\"Odd_Name_seq\"'::regclass)"),
            Some("\"Odd_Name_seq\"")
        );
    }

    #[test]
    fn test_parse_sequence_name_without_quotes() {
        assert_eq!(parse_sequence_name("42"), None);
        assert_eq!(parse_sequence_name(""), None);
    }

    #[test]
    fn test_split_table_name_defaults_to_public() {
        assert_eq!(
            split_table_name("users"),
            ("public".to_string(), "users".to_string())
        );
        assert_eq!(
            split_table_name("app.users"),
            ("app".to_string(), "users".to_string())
        );
    }

    #[test]
    fn test_cache_lookups() {
        let mut primary_keys = HashMap::new();
        primary_keys.insert("users".to_string(), vec!["id".to_string()]);
        let mut sequence_columns = HashMap::new();
        sequence_columns.insert(
            ("users".to_string(), "id".to_string()),
            "users_id_seq".to_string(),
        );
        let mut types = HashMap::new();
        let mut user_types = HashMap::new();
        user_types.insert("email".to_string(), "text".to_string());
        types.insert(("public".to_string(), "users".to_string()), user_types);

        let cache = SchemaCache::for_tests(
            primary_keys,
            sequence_columns,
            vec!["audit_seq".to_string()],
            types,
        );

        assert_eq!(cache.primary_key("users").unwrap(), &["id".to_string()]);
        assert!(cache.primary_key("orders").is_err());
        assert_eq!(cache.sequence_for_column("users", "id"), Some("users_id_seq"));
        assert_eq!(cache.sequence_for_column("users", "email"), None);
        assert_eq!(cache.orphan_sequences(), &["audit_seq".to_string()]);
        assert_eq!(cache.column_type("public", "users", "email").unwrap(), "text");
        assert!(cache.column_type("public", "users", "missing").is_err());
    }
}
