// ABOUTME: Ordered filter/transform pipeline applied to every changeset
// ABOUTME: Built-in whitelist_tables and ignore_tables stages with pattern matching

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use crate::changeset::Changeset;
use crate::listener::CHANGE_CHANNEL_CAPACITY;

/// A stage inspects one changeset and passes it on (`Some`), drops it
/// (`None`), or reports an error, in which case the changeset is discarded
/// and the error forwarded on the error stream.
pub type StageFn = Box<dyn Fn(Changeset) -> Result<Option<Changeset>> + Send + Sync>;

struct Stage {
    name: String,
    func: StageFn,
}

/// An ordered chain of stages. Each stage runs on its own task connected by
/// channels, so ordering is preserved per event while stages overlap across
/// events.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn add_stage(&mut self, name: impl Into<String>, func: StageFn) {
        self.stages.push(Stage {
            name: name.into(),
            func,
        });
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start the pipeline over a source stream, returning the filtered
    /// stream. Stage errors go to `err_tx`; the chain winds down when the
    /// source closes or shutdown trips.
    pub fn start(
        self,
        source: mpsc::Receiver<Changeset>,
        err_tx: mpsc::Sender<anyhow::Error>,
        shutdown: &broadcast::Sender<()>,
    ) -> mpsc::Receiver<Changeset> {
        let mut input = source;

        for stage in self.stages {
            let (out_tx, out_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
            let errors = err_tx.clone();
            let mut stage_shutdown = shutdown.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stage_shutdown.recv() => return,
                        change = input.recv() => {
                            let change = match change {
                                Some(c) => c,
                                None => return,
                            };
                            match (stage.func)(change) {
                                Ok(Some(passed)) => {
                                    if out_tx.send(passed).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    let tagged = e.context(format!(
                                        "pipeline stage '{}' failed",
                                        stage.name
                                    ));
                                    if errors.send(tagged).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            });

            input = out_rx;
        }

        input
    }
}

/// Does any pattern match the changeset's table?
///
/// Patterns take the form `schema.table`, `schema.*`, or a bare `table`
/// which matches on table name regardless of schema.
pub fn table_matches(patterns: &[String], schema: &str, table: &str) -> bool {
    patterns.iter().any(|pattern| {
        match pattern.split_once('.') {
            Some((pattern_schema, pattern_table)) => {
                pattern_schema == schema && (pattern_table == "*" || pattern_table == table)
            }
            None => pattern == table,
        }
    })
}

/// Stage that drops every changeset not matching the whitelist.
pub fn whitelist_tables(patterns: Vec<String>) -> StageFn {
    Box::new(move |change| {
        if table_matches(&patterns, &change.schema, &change.table) {
            Ok(Some(change))
        } else {
            Ok(None)
        }
    })
}

/// Stage that drops every changeset matching the ignore list.
pub fn ignore_tables(patterns: Vec<String>) -> StageFn {
    Box::new(move |change| {
        if table_matches(&patterns, &change.schema, &change.table) {
            Ok(None)
        } else {
            Ok(Some(change))
        }
    })
}
