// ABOUTME: Applies filtered changesets to the target database
// ABOUTME: Dispatches insert/upsert/delete, reconciles duplicates, advances sequences

pub mod schema;
pub mod sql;

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::changeset::{Changeset, ChangesetKind};
use crate::listener::ListenerMode;
use crate::store::ChangesetStore;

pub use schema::{SchemaCache, TableInfo};
use sql::{build_delete, build_insert, build_upsert, render_text, TextParam};

/// Behavior switches for the apply loop.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub mode: ListenerMode,
    /// Rewrite each changeset's schema before applying, for replays between
    /// differently-scoped databases.
    pub target_schema: Option<String>,
    /// Treat a duplicate-row insert as fatal instead of skipping it.
    pub fail_on_duplicate: bool,
    /// Stop once the just-applied changeset is the newest one stored on the
    /// source. Only meaningful in notify mode; replication mode has no
    /// equivalent end-of-stream signal.
    pub shutdown_after_last_changeset: bool,
}

/// Consumes the filtered stream and replays each changeset on the target.
pub struct Applier {
    config: ApplierConfig,
    cache: Arc<SchemaCache>,
    source: Arc<Client>,
    target: Client,
    store: ChangesetStore,
}

impl Applier {
    pub fn new(
        config: ApplierConfig,
        cache: Arc<SchemaCache>,
        source: Arc<Client>,
        target: Client,
    ) -> Self {
        let store = ChangesetStore::new(Arc::clone(&source));
        Applier {
            config,
            cache,
            source,
            target,
            store,
        }
    }

    /// Main loop: apply changesets in arrival order until the stream ends,
    /// shutdown trips, or an error surfaces. The first unrecovered error is
    /// returned to the caller.
    pub async fn run(
        &self,
        mut changes: mpsc::Receiver<Changeset>,
        mut errors: mpsc::Receiver<anyhow::Error>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutting down...");
                    return Ok(());
                }
                err = errors.recv(), if errors_open => {
                    match err {
                        Some(e) => return Err(e.context("listener reported an error")),
                        None => errors_open = false,
                    }
                }
                change = changes.recv() => {
                    let mut change = match change {
                        Some(c) => c,
                        None => {
                            tracing::info!("change stream closed");
                            return Ok(());
                        }
                    };

                    self.apply(&mut change)
                        .await
                        .with_context(|| format!("failed to apply changeset: {}", change))?;

                    if self.config.shutdown_after_last_changeset
                        && self.config.mode == ListenerMode::Notify
                        && self.is_latest_changeset(change.id).await?
                    {
                        tracing::info!("sync is complete. shutting down...");
                        let _ = shutdown.send(());
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Apply one changeset: enrich notify-mode column types, rewrite the
    /// schema if configured, then dispatch on kind.
    async fn apply(&self, change: &mut Changeset) -> Result<()> {
        if self.config.mode == ListenerMode::Notify {
            attach_column_types(change, &self.cache)?;
        }
        if let Some(schema) = &self.config.target_schema {
            change.schema = schema.clone();
        }

        match change.kind {
            ChangesetKind::Insert => self.apply_insert(change).await,
            ChangesetKind::Update => self.apply_update(change).await,
            ChangesetKind::Delete => self.apply_delete(change).await,
        }
    }

    async fn apply_insert(&self, change: &Changeset) -> Result<()> {
        let (query, params) = build_insert(change);

        match self.execute(&query, &params).await {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                if self.config.fail_on_duplicate {
                    bail!("duplicate row insert failed {}", change);
                }
                tracing::warn!("duplicate row insert skipped {}", change);
                // The sequence still advances: the duplicate proves the row
                // id was consumed on the source.
                self.advance_column_sequences(change).await?;
                return Ok(());
            }
            Err(e) => {
                return Err(anyhow!(e)).with_context(|| format!("INSERT failed: {}", query));
            }
        }

        self.advance_column_sequences(change).await?;
        self.propagate_orphan_sequences(change).await?;
        tracing::info!("row insert: {}", change);
        Ok(())
    }

    async fn apply_update(&self, change: &Changeset) -> Result<()> {
        let primary_key = self.cache.primary_key(&change.table).with_context(|| {
            format!(
                "unable to process UPDATE for table '{}', changeset has no primary key",
                change.table
            )
        })?;
        let (query, params) = build_upsert(change, primary_key)?;

        match self.execute(&query, &params).await {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tracing::warn!("update duplicate row skipped {}", change);
                return Ok(());
            }
            Err(e) => {
                return Err(anyhow!(e)).with_context(|| format!("UPDATE failed: {}", query));
            }
        }

        tracing::info!("row update: {}", change);
        Ok(())
    }

    async fn apply_delete(&self, change: &Changeset) -> Result<()> {
        let primary_key = self.cache.primary_key(&change.table).with_context(|| {
            format!(
                "unable to process DELETE for table '{}', changeset has no primary key",
                change.table
            )
        })?;
        let (query, params) = build_delete(change, primary_key)?;

        self.execute(&query, &params)
            .await
            .with_context(|| format!("DELETE failed: {}", query))?;

        tracing::info!("row delete: {}", change);
        Ok(())
    }

    async fn execute(
        &self,
        query: &str,
        params: &[TextParam],
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.target.execute(query, &refs).await
    }

    /// Advance the sequence behind every serial column the insert touched.
    ///
    /// Sequences are non-transactional: a `setval` is never rolled back, so
    /// these updates deliberately run outside any transaction.
    async fn advance_column_sequences(&self, change: &Changeset) -> Result<()> {
        for column in &change.new_values {
            let sequence = match self.cache.sequence_for_column(&change.table, &column.column) {
                Some(s) => s,
                None => continue,
            };
            let value = match render_text(&column.value) {
                Some(v) => v,
                None => continue,
            };
            let name = TextParam(Some(sequence.to_string()));
            let position = TextParam(Some(value.clone()));
            self.target
                .query_one("SELECT setval($1, $2, true)", &[&name, &position])
                .await
                .with_context(|| format!("failed to advance sequence {}", sequence))?;
            tracing::debug!("sequence set {}: {}", sequence, value);
        }
        Ok(())
    }

    /// Copy every orphan sequence's position from source to target.
    ///
    /// There is no way to observe sequence consumption directly, so each
    /// insert refreshes all of them from the source's current `last_value`.
    async fn propagate_orphan_sequences(&self, _change: &Changeset) -> Result<()> {
        for sequence in self.cache.orphan_sequences() {
            let row = self
                .source
                .query_one(&format!("SELECT last_value FROM {}", sequence), &[])
                .await
                .with_context(|| {
                    format!("failed to read last_value for sequence {}", sequence)
                })?;
            let last_value: i64 = row.get(0);

            let name = TextParam(Some(sequence.clone()));
            self.target
                .query_one("SELECT setval($1, $2, true)", &[&name, &last_value])
                .await
                .with_context(|| format!("failed to set orphan sequence {}", sequence))?;
            tracing::debug!("orphan sequence set {}: {}", sequence, last_value);
        }
        Ok(())
    }

    /// Is the given id the newest changeset stored on the source?
    async fn is_latest_changeset(&self, id: i64) -> Result<bool> {
        let latest = self
            .store
            .latest_id()
            .await
            .context("failed to determine if the sync is complete")?;
        Ok(latest == Some(id))
    }
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Fill in column types from the introspection cache. The notify path's
/// audit payloads carry no type information, and the applier must not see
/// an untyped column.
fn attach_column_types(change: &mut Changeset, cache: &SchemaCache) -> Result<()> {
    for column in change.old_values.iter_mut() {
        column.r#type = cache
            .column_type(&change.schema, &change.table, &column.column)
            .context("failed to resolve column type for old value")?
            .to_string();
    }
    for column in change.new_values.iter_mut() {
        column.r#type = cache
            .column_type(&change.schema, &change.table, &column.column)
            .context("failed to resolve column type for new value")?
            .to_string();
    }
    Ok(())
}
