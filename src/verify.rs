// ABOUTME: Read-only convergence checks between source and target
// ABOUTME: Per-table md5 checksums and structural changeset diffing

use anyhow::{bail, Context, Result};
use futures::{pin_mut, TryStreamExt};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use crate::applier::schema::{list_tables, TableInfo};

/// Stop the changeset diff after this many mismatches.
const MAX_DIFFS: usize = 100;

/// Log diff progress every this many compared records.
const PROGRESS_INTERVAL: u64 = 1000;

const PG_CONCAT_SQL: &str = "
    DO $$ BEGIN
        CREATE FUNCTION pg_concat(TEXT, TEXT) RETURNS TEXT as '
            BEGIN
                IF $1 ISNULL THEN
                    RETURN $2;
                END if;
                RETURN $1 || $2;
            END;' LANGUAGE 'plpgsql';
        EXCEPTION
        WHEN duplicate_function THEN NULL;
    END $$;";

const PG_CONCAT_FIN_SQL: &str = "
    DO $$ BEGIN
        CREATE FUNCTION pg_concat_fin(TEXT) RETURNS TEXT as '
        BEGIN
            IF $1 ISNULL THEN
                -- avoids returning a null string for empty tables, resulting in a null checksum.
                RETURN ''x'';
            END IF;
            RETURN $1;
        END;' LANGUAGE 'plpgsql';
        EXCEPTION
            WHEN duplicate_function THEN NULL;
    END $$;";

const PG_CONCAT_AGGREGATE_SQL: &str = "
    DO $$ BEGIN
    CREATE AGGREGATE pg_concat (
        basetype = TEXT,
        sfunc = pg_concat,
        stype = TEXT,
        finalfunc = pg_concat_fin
    );
    EXCEPTION
        WHEN duplicate_function THEN NULL;
    END $$;";

const PG_MD5_HASHAGG_AGGREGATE_SQL: &str = "
    DO $$ BEGIN
    CREATE AGGREGATE pg_md5_hashagg (
        basetype = TEXT,
        sfunc = pg_concat,
        stype = TEXT,
        finalfunc = pg_concat_fin
    );
    EXCEPTION
        WHEN duplicate_function THEN NULL;
    END $$;";

/// Install the concatenating checksum aggregate and its helpers if they are
/// not already present.
pub async fn prepare_integrity_functions(client: &mut Client) -> Result<()> {
    let tx = client
        .transaction()
        .await
        .context("failed to begin the transaction")?;

    tx.batch_execute(PG_CONCAT_SQL)
        .await
        .context("failed to create the pg_concat function")?;
    tx.batch_execute(PG_CONCAT_FIN_SQL)
        .await
        .context("failed to create the pg_concat_fin function")?;
    tx.batch_execute(PG_CONCAT_AGGREGATE_SQL)
        .await
        .context("failed to create the pg_concat aggregate")?;
    tx.batch_execute(PG_MD5_HASHAGG_AGGREGATE_SQL)
        .await
        .context("failed to create the pg_md5_hashagg aggregate")?;

    tx.commit().await.context("failed to commit the transaction")?;
    Ok(())
}

/// Per-table checksum query: md5 of every row, concatenated in primary-key
/// order. Identical row sets produce identical checksums on both sides.
fn checksum_query(table: &TableInfo) -> String {
    let order_by: Vec<String> = table
        .primary_key
        .iter()
        .map(|col| format!("{}.\"{}\"", table.qualified_name(), col))
        .collect();
    format!(
        "SELECT pg_md5_hashagg(md5(CAST(({}.*) AS TEXT)) ORDER BY {}) FROM {}",
        table.qualified_name(),
        order_by.join(","),
        table.qualified_name(),
    )
}

/// Compare per-table checksums between source and target; the first
/// mismatch fails the run.
pub async fn verify_checksums(
    source: &mut Client,
    target: &mut Client,
    schemas: &[String],
    include_tables: &[String],
    exclude_tables: &[String],
) -> Result<()> {
    prepare_integrity_functions(source)
        .await
        .context("unable to prepare source database for integrity checks")?;
    prepare_integrity_functions(target)
        .await
        .context("unable to prepare target database for integrity checks")?;

    let tables = list_tables(source, schemas, include_tables, exclude_tables)
        .await
        .context("unable to generate the list of tables to check")?;

    for table in &tables {
        tracing::info!("verifying checksum for {}", table.qualified_name());

        if table.primary_key.is_empty() {
            bail!(
                "table {} has no primary key, cannot guarantee checksum match",
                table.qualified_name()
            );
        }

        let query = checksum_query(table);

        let source_checksum: String = source
            .query_one(&query, &[])
            .await
            .with_context(|| {
                format!("failed to compute source checksum for {}", table.qualified_name())
            })?
            .get(0);
        let target_checksum: String = target
            .query_one(&query, &[])
            .await
            .with_context(|| {
                format!("failed to compute target checksum for {}", table.qualified_name())
            })?
            .get(0);

        if source_checksum != target_checksum {
            bail!(
                "checksums differ for {}, source: {} target: {}",
                table.qualified_name(),
                source_checksum,
                target_checksum
            );
        }
    }

    tracing::info!("checksums match for {} tables", tables.len());
    Ok(())
}

/// One audit record in comparable form. Payloads are parsed so the compare
/// is structural rather than sensitive to JSON whitespace.
#[derive(Debug, PartialEq)]
struct ChangesetRecord {
    action: String,
    schema_name: String,
    table_name: String,
    new_values: Option<Value>,
    old_values: Option<Value>,
}

impl ChangesetRecord {
    fn from_row(row: &Row) -> Result<ChangesetRecord> {
        let new_values = row
            .get::<_, Option<String>>(3)
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .context("failed to parse new_values")?;
        let old_values = row
            .get::<_, Option<String>>(4)
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .context("failed to parse old_values")?;

        Ok(ChangesetRecord {
            action: row.get(0),
            schema_name: row.get(1),
            table_name: row.get(2),
            new_values,
            old_values,
        })
    }
}

/// Stream both audit tables in id order and report every record that
/// differs. Stops after `MAX_DIFFS` differences or at the end of the source
/// stream.
pub async fn verify_changesets(
    source: &Client,
    target: &Client,
    last_id: Option<i64>,
) -> Result<()> {
    tracing::info!("beginning changeset diff");

    let mut sql = String::from(
        "SELECT action, schema_name, table_name, new_values::text, old_values::text
         FROM warp_pipe.changesets",
    );
    if let Some(id) = last_id {
        sql.push_str(&format!(" WHERE id <= {}", id));
        tracing::info!("checking changesets up to id {}", id);
    }
    sql.push_str(" ORDER BY id");

    let no_params = Vec::<&(dyn ToSql + Sync)>::new();
    let source_rows = source
        .query_raw(sql.as_str(), no_params.clone())
        .await
        .context("failed to read source changesets")?;
    let target_rows = target
        .query_raw(sql.as_str(), no_params)
        .await
        .context("failed to read target changesets")?;
    pin_mut!(source_rows);
    pin_mut!(target_rows);

    let mut compared = 0u64;
    let mut diffs = 0usize;

    while let Some(source_row) = source_rows
        .try_next()
        .await
        .context("failed to load source changeset row")?
    {
        let target_row = target_rows
            .try_next()
            .await
            .context("failed to load target changeset row")?;
        let target_row = match target_row {
            Some(row) => row,
            None => bail!("target missing expected changeset records"),
        };

        let source_record = ChangesetRecord::from_row(&source_row)?;
        let target_record = ChangesetRecord::from_row(&target_row)?;

        compared += 1;
        if compared % PROGRESS_INTERVAL == 0 {
            tracing::info!("{} changesets compared", compared);
        }

        if source_record != target_record {
            tracing::error!(
                "source/target rows differ, source: {:?} target: {:?}",
                source_record,
                target_record
            );
            diffs += 1;
            if diffs == MAX_DIFFS {
                tracing::error!("{} different records found, stopping check", MAX_DIFFS);
                break;
            }
        }
    }

    if diffs > 0 {
        bail!("changeset records differ ({} differences)", diffs);
    }
    tracing::info!("changeset diff passed: {} records compared", compared);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, name: &str, pk: &[&str]) -> TableInfo {
        TableInfo {
            schema: schema.to_string(),
            name: name.to_string(),
            primary_key: pk.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_checksum_query_single_key() {
        let query = checksum_query(&table("public", "users", &["id"]));
        assert_eq!(
            query,
            "SELECT pg_md5_hashagg(md5(CAST((\"public\".\"users\".*) AS TEXT)) \
             ORDER BY \"public\".\"users\".\"id\") FROM \"public\".\"users\""
        );
    }

    #[test]
    fn test_checksum_query_composite_key_orders_all_columns() {
        let query = checksum_query(&table("public", "order_items", &["order_id", "item_id"]));
        assert!(query.contains(
            "ORDER BY \"public\".\"order_items\".\"order_id\",\"public\".\"order_items\".\"item_id\""
        ));
    }

    #[test]
    fn test_record_compare_is_structural() {
        let a = ChangesetRecord {
            action: "INSERT".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            new_values: Some(serde_json::from_str(r#"{"id": 1, "name": "Han"}"#).unwrap()),
            old_values: None,
        };
        // Same document, different whitespace.
        let b = ChangesetRecord {
            action: "INSERT".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            new_values: Some(serde_json::from_str(r#"{"id":1,"name":"Han"}"#).unwrap()),
            old_values: None,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_record_compare_detects_value_change() {
        let a = ChangesetRecord {
            action: "INSERT".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            new_values: Some(serde_json::from_str(r#"{"id":1}"#).unwrap()),
            old_values: None,
        };
        let b = ChangesetRecord {
            action: "INSERT".to_string(),
            schema_name: "public".to_string(),
            table_name: "users".to_string(),
            new_values: Some(serde_json::from_str(r#"{"id":2}"#).unwrap()),
            old_values: None,
        };
        assert_ne!(a, b);
    }
}
