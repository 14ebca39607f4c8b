// ABOUTME: Installs the warp_pipe audit schema, trigger function, and per-table triggers
// ABOUTME: One-time source-database setup plus the matching teardown

use anyhow::{anyhow, bail, Context, Result};
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::applier::schema::list_tables;

const CREATE_SCHEMA_SQL: &str = "CREATE SCHEMA IF NOT EXISTS warp_pipe";

const REVOKE_ALL_ON_SCHEMA_SQL: &str = "REVOKE ALL ON SCHEMA warp_pipe FROM public";

const COMMENT_ON_SCHEMA_SQL: &str =
    "COMMENT ON SCHEMA warp_pipe IS 'Changeset history tables and trigger functions'";

const CREATE_CHANGESETS_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS warp_pipe.changesets (
        id BIGSERIAL PRIMARY KEY,
        ts TIMESTAMPTZ DEFAULT NOW() NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('INSERT', 'UPDATE', 'DELETE')),
        schema_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        relid OID NOT NULL,
        new_values JSON,
        old_values JSON
    )";

const REVOKE_ALL_ON_CHANGESETS_SQL: &str = "REVOKE ALL ON warp_pipe.changesets FROM public";

const CREATE_TS_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS changesets_ts_idx ON warp_pipe.changesets (ts)";

const CREATE_ACTION_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS changesets_action_idx ON warp_pipe.changesets (action)";

const CREATE_TABLE_NAME_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS changesets_table_name_idx ON warp_pipe.changesets (table_name)";

/// The AFTER trigger: record the row image(s) and wake any listener with the
/// `<id>_<timestamp>` payload.
const CREATE_ON_MODIFY_FUNCTION_SQL: &str = r#"
    CREATE OR REPLACE FUNCTION warp_pipe.on_modify()
        RETURNS TRIGGER AS $$
            BEGIN
                IF TG_WHEN <> 'AFTER' THEN
                    RAISE EXCEPTION 'warp_pipe.on_modify() may only run as an AFTER trigger';
                END IF;

                IF (TG_OP = 'UPDATE') THEN
                    INSERT INTO warp_pipe.changesets(
                        id,
                        ts,
                        action,
                        schema_name,
                        table_name,
                        relid,
                        new_values,
                        old_values
                    ) VALUES (
                        nextval('warp_pipe.changesets_id_seq'),
                        current_timestamp,
                        TG_OP::TEXT,
                        TG_TABLE_SCHEMA::TEXT,
                        TG_TABLE_NAME::TEXT,
                        TG_RELID,
                        row_to_json(NEW, true),
                        row_to_json(OLD, true)
                    );
                    PERFORM pg_notify('warp_pipe_new_changeset', currval('warp_pipe.changesets_id_seq')::TEXT || '_' || current_timestamp::TEXT);
                    RETURN NEW;
                ELSIF (TG_OP = 'DELETE') THEN
                    INSERT INTO warp_pipe.changesets(
                        id,
                        ts,
                        action,
                        schema_name,
                        table_name,
                        relid,
                        old_values
                    ) VALUES (
                        nextval('warp_pipe.changesets_id_seq'),
                        current_timestamp,
                        TG_OP::TEXT,
                        TG_TABLE_SCHEMA::TEXT,
                        TG_TABLE_NAME::TEXT,
                        TG_RELID,
                        row_to_json(OLD, true)
                    );
                    PERFORM pg_notify('warp_pipe_new_changeset', currval('warp_pipe.changesets_id_seq')::TEXT || '_' || current_timestamp::TEXT);
                    RETURN OLD;
                ELSIF (TG_OP = 'INSERT') THEN
                    INSERT INTO warp_pipe.changesets(
                        id,
                        ts,
                        action,
                        schema_name,
                        table_name,
                        relid,
                        new_values
                    ) VALUES (
                        nextval('warp_pipe.changesets_id_seq'),
                        current_timestamp,
                        TG_OP::TEXT,
                        TG_TABLE_SCHEMA::TEXT,
                        TG_TABLE_NAME::TEXT,
                        TG_RELID,
                        row_to_json(NEW, true)
                    );
                    PERFORM pg_notify('warp_pipe_new_changeset', currval('warp_pipe.changesets_id_seq')::TEXT || '_' || current_timestamp::TEXT);
                    RETURN NEW;
                ELSE
                    RAISE WARNING '[WARP_PIPE.ON_MODIFY()] - Other action occurred: %, at %',TG_OP,NOW();
                    RETURN NULL;
                END IF;

            EXCEPTION
                WHEN data_exception THEN
                    RAISE WARNING '[WARP_PIPE.ON_MODIFY()] - UDF ERROR [DATA EXCEPTION] - SQLSTATE: %, SQLERRM: %',SQLSTATE,SQLERRM;
                    RETURN NULL;
                WHEN unique_violation THEN
                    RAISE WARNING '[WARP_PIPE.ON_MODIFY()] - UDF ERROR [UNIQUE] - SQLSTATE: %, SQLERRM: %',SQLSTATE,SQLERRM;
                    RETURN NULL;
                WHEN OTHERS THEN
                    RAISE WARNING '[WARP_PIPE.ON_MODIFY()] - UDF ERROR [OTHER] - SQLSTATE: %, SQLERRM: %',SQLSTATE,SQLERRM;
                    RETURN NULL;
        END;
        $$ LANGUAGE plpgsql
        SECURITY DEFINER"#;

/// Prepare the source database for capturing changesets: the `warp_pipe`
/// schema, the `changesets` table and its indexes, the trigger function,
/// and one trigger per selected table.
pub async fn prepare(
    client: &mut Client,
    schemas: &[String],
    include_tables: &[String],
    exclude_tables: &[String],
) -> Result<()> {
    let tables = list_tables(client, schemas, include_tables, exclude_tables)
        .await
        .context("unable to generate the list of tables to register")?;

    let tx = client
        .transaction()
        .await
        .context("error starting new transaction")?;

    for sql in [CREATE_SCHEMA_SQL, REVOKE_ALL_ON_SCHEMA_SQL, COMMENT_ON_SCHEMA_SQL] {
        if let Err(e) = tx.batch_execute(sql).await {
            if e.code() == Some(&SqlState::DUPLICATE_SCHEMA) {
                bail!("`warp_pipe` schema already exists");
            }
            return Err(anyhow!(e).context("error creating `warp_pipe` schema"));
        }
    }

    for sql in [
        CREATE_CHANGESETS_TABLE_SQL,
        REVOKE_ALL_ON_CHANGESETS_SQL,
        CREATE_TS_INDEX_SQL,
        CREATE_ACTION_INDEX_SQL,
        CREATE_TABLE_NAME_INDEX_SQL,
    ] {
        if let Err(e) = tx.batch_execute(sql).await {
            if e.code() == Some(&SqlState::DUPLICATE_TABLE) {
                bail!("`warp_pipe.changesets` table already exists");
            }
            return Err(anyhow!(e).context("error creating `warp_pipe.changesets` table"));
        }
    }

    tx.batch_execute(CREATE_ON_MODIFY_FUNCTION_SQL)
        .await
        .context("error creating `on_modify` trigger function")?;

    for table in &tables {
        tx.batch_execute(&register_trigger_sql(&table.schema, &table.name))
            .await
            .with_context(|| {
                format!("error registering `on_modify` trigger on {}", table.qualified_name())
            })?;
        tracing::info!("registered changeset trigger on {}", table.qualified_name());
    }

    tx.commit().await.context("error committing transaction")?;
    Ok(())
}

/// Idempotent trigger creation: skipped when a trigger of the same name
/// already watches the table.
fn register_trigger_sql(schema: &str, table: &str) -> String {
    let trigger_name = format!("{}__{}_changesets", schema, table);
    format!(
        r#"
        DO
        $$
        BEGIN
            IF NOT EXISTS(
                 SELECT * FROM(
                     SELECT trigger_name AS name, concat_ws('.', event_object_schema, event_object_table) AS table
                     FROM information_schema.triggers
                 ) AS triggers
                 WHERE triggers.name = '{trigger_name}'
                 AND triggers.table = '{schema}.{table}'
            )
            THEN
                CREATE TRIGGER {trigger_name}
                AFTER INSERT OR UPDATE OR DELETE
                ON "{schema}"."{table}"
                FOR EACH ROW EXECUTE PROCEDURE warp_pipe.on_modify();
            END IF ;
        END;
        $$"#
    )
}

/// Remove the `warp_pipe` schema and everything in it, including the
/// per-table triggers that reference the trigger function.
pub async fn teardown(client: &Client) -> Result<()> {
    client
        .batch_execute("DROP SCHEMA warp_pipe CASCADE")
        .await
        .context("failed to drop the warp_pipe schema")?;
    Ok(())
}
