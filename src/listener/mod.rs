// ABOUTME: Listener contract shared by the notify and replication capture paths
// ABOUTME: Both variants emit the same changeset and error streams

pub mod notify;
pub mod replication;
pub mod wal2json;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::changeset::Changeset;
use crate::config::DbConfig;

pub use notify::NotifyListener;
pub use replication::LogicalReplicationListener;

/// Capacity of the changeset stream between listener and pipeline.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the error stream.
pub const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Which capture path feeds the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Trigger-populated audit table with LISTEN/NOTIFY wake-ups.
    Notify,
    /// Logical replication slot decoded by wal2json.
    Replicate,
}

/// A source of row-level change events.
///
/// Lifecycle: `dial` establishes the connections, `listen_for_changes`
/// starts the producer tasks and hands back the changeset and error
/// streams, `close` releases everything and is safe to call twice. The
/// shutdown receiver terminates the producers; both streams close when
/// they stop.
#[async_trait]
pub trait Listener: Send {
    async fn dial(&mut self, config: &DbConfig) -> Result<()>;

    async fn listen_for_changes(
        &mut self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::Receiver<Changeset>, mpsc::Receiver<anyhow::Error>)>;

    async fn close(&mut self) -> Result<()>;
}
