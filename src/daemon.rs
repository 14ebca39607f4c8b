// ABOUTME: Wires a listener and the filter pipeline into one change stream
// ABOUTME: Owns the stock whitelist/ignore stages and listener lifecycle

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use crate::changeset::Changeset;
use crate::config::DbConfig;
use crate::listener::{Listener, ERROR_CHANNEL_CAPACITY};
use crate::pipeline::{ignore_tables, whitelist_tables, Pipeline};

/// Capture daemon: one listener feeding the filter pipeline.
///
/// The applier consumes the streams this hands out; it depends only on the
/// listener contract, never on which capture path is active.
pub struct ReplicationDaemon {
    listener: Box<dyn Listener>,
    whitelist: Option<Vec<String>>,
    ignore: Option<Vec<String>>,
}

impl ReplicationDaemon {
    pub fn new(listener: Box<dyn Listener>) -> Self {
        ReplicationDaemon {
            listener,
            whitelist: None,
            ignore: None,
        }
    }

    /// Only emit changesets whose table matches one of these patterns
    /// (`schema.table`, `schema.*`, or bare `table`).
    pub fn whitelist_tables(mut self, patterns: Vec<String>) -> Self {
        if !patterns.is_empty() {
            self.whitelist = Some(patterns);
        }
        self
    }

    /// Drop changesets whose table matches one of these patterns. Applied
    /// after the whitelist, so an ignored table never passes even when
    /// whitelisted.
    pub fn ignore_tables(mut self, patterns: Vec<String>) -> Self {
        if !patterns.is_empty() {
            self.ignore = Some(patterns);
        }
        self
    }

    /// Dial the listener's source connections.
    pub async fn open(&mut self, config: &DbConfig) -> Result<()> {
        self.listener
            .dial(config)
            .await
            .context("failed to dial the listener")
    }

    /// Start capture and return the filtered changeset stream plus a merged
    /// error stream carrying both listener and pipeline errors.
    pub async fn listen_for_changes(
        &mut self,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<(mpsc::Receiver<Changeset>, mpsc::Receiver<anyhow::Error>)> {
        let (raw_changes, mut listener_errors) =
            self.listener.listen_for_changes(shutdown.subscribe()).await?;

        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let listener_err_tx = err_tx.clone();
        tokio::spawn(async move {
            while let Some(e) = listener_errors.recv().await {
                if listener_err_tx.send(e).await.is_err() {
                    return;
                }
            }
        });

        let mut pipeline = Pipeline::new();
        if let Some(patterns) = self.whitelist.take() {
            pipeline.add_stage("whitelist_tables", whitelist_tables(patterns));
        }
        if let Some(patterns) = self.ignore.take() {
            pipeline.add_stage("ignore_tables", ignore_tables(patterns));
        }

        let filtered = pipeline.start(raw_changes, err_tx, shutdown);
        Ok((filtered, err_rx))
    }

    /// Close the listener; safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        self.listener.close().await
    }
}
