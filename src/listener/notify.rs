// ABOUTME: Audit-mode listener driven by LISTEN/NOTIFY wake-ups
// ABOUTME: Drains the stored backlog, then follows notifications in strict id order

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::{Client, Notification};

use crate::changeset::Changeset;
use crate::config::DbConfig;
use crate::listener::{Listener, CHANGE_CHANNEL_CAPACITY, ERROR_CHANNEL_CAPACITY};
use crate::ordered::OrderedQueue;
use crate::postgres::connect_with_notifications;
use crate::store::{ChangesetStore, StoredEvent, BACKFILL_BATCH_SIZE};

/// Notification channel fired by the `warp_pipe.on_modify()` trigger.
pub const NOTIFY_CHANNEL: &str = "warp_pipe_new_changeset";

/// Listener that follows the `warp_pipe.changesets` audit table.
///
/// Startup drains every stored event past the configured resume point, then
/// switches to notification wake-ups. `LISTEN` is issued before the drain so
/// notifications arriving meanwhile are buffered by the session and replayed
/// afterwards; the ordered queue deduplicates the overlap.
pub struct NotifyListener {
    start_from_id: Option<i64>,
    start_from_timestamp: Option<DateTime<Utc>>,
    client: Option<Arc<Client>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl NotifyListener {
    pub fn new() -> Self {
        NotifyListener {
            start_from_id: None,
            start_from_timestamp: None,
            client: None,
            notifications: None,
        }
    }

    /// Resume from a changeset id: every stored event with `id > id` is
    /// drained before notifications are consumed.
    pub fn start_from_id(mut self, id: i64) -> Self {
        self.start_from_id = Some(id);
        self
    }

    /// Resume from a timestamp: every stored event with `ts >= ts` is
    /// drained before notifications are consumed.
    pub fn start_from_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.start_from_timestamp = Some(ts);
        self
    }
}

impl Default for NotifyListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for NotifyListener {
    async fn dial(&mut self, config: &DbConfig) -> Result<()> {
        let (client, notifications) = connect_with_notifications(&config.conninfo())
            .await
            .context("notify listener failed to connect to source")?;
        self.client = Some(Arc::new(client));
        self.notifications = Some(notifications);
        Ok(())
    }

    async fn listen_for_changes(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::Receiver<Changeset>, mpsc::Receiver<anyhow::Error>)> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| anyhow!("listener is not connected; call dial first"))?;
        let mut notifications = self
            .notifications
            .take()
            .ok_or_else(|| anyhow!("listener is already consuming notifications"))?;

        tracing::info!("starting notify listener for `{}`", NOTIFY_CHANNEL);
        client
            .batch_execute(&format!("LISTEN {}", NOTIFY_CHANNEL))
            .await
            .context("failed to listen on notify channel")?;

        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let start_from_id = self.start_from_id;
        let start_from_timestamp = self.start_from_timestamp;

        tokio::spawn(async move {
            let store = ChangesetStore::new(client);
            let mut queue = OrderedQueue::new();

            let backfilled = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("notify listener shutting down");
                    return;
                }
                result = backfill(
                    &store,
                    start_from_id,
                    start_from_timestamp,
                    &mut queue,
                    &changes_tx,
                ) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                },
            };
            if backfilled > 0 {
                tracing::info!("backfill complete: {} changesets drained", backfilled);
            }

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("notify listener shutting down");
                        return;
                    }
                    notification = notifications.recv() => {
                        let notification = match notification {
                            Some(n) => n,
                            None => {
                                let _ = err_tx
                                    .send(anyhow!("notification stream closed unexpectedly"))
                                    .await;
                                return;
                            }
                        };
                        if let Err(e) =
                            process_notification(&store, &notification, &mut queue, &changes_tx)
                                .await
                        {
                            if err_tx.send(e).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok((changes_rx, err_rx))
    }

    async fn close(&mut self) -> Result<()> {
        self.client.take();
        self.notifications.take();
        Ok(())
    }
}

/// Drain stored events past the resume point, oldest first.
async fn backfill(
    store: &ChangesetStore,
    start_from_id: Option<i64>,
    start_from_timestamp: Option<DateTime<Utc>>,
    queue: &mut OrderedQueue<StoredEvent>,
    changes_tx: &mpsc::Sender<Changeset>,
) -> Result<u64> {
    let mut drained = 0u64;
    let mut offset = 0i64;

    loop {
        let batch = if let Some(since) = start_from_id {
            store.batch_since_id(since, offset).await?
        } else if let Some(since) = start_from_timestamp {
            store.batch_since_timestamp(since, offset).await?
        } else {
            return Ok(0);
        };
        let batch_len = batch.len();

        for event in batch {
            tracing::debug!("backfill: changeset {}", event.id);
            drained += emit_ready(queue.push(event.id, event), changes_tx).await?;
        }

        if (batch_len as i64) < BACKFILL_BATCH_SIZE {
            return Ok(drained);
        }
        offset += batch_len as i64;
    }
}

/// Resolve a notification payload to its stored row and emit in order.
async fn process_notification(
    store: &ChangesetStore,
    notification: &Notification,
    queue: &mut OrderedQueue<StoredEvent>,
    changes_tx: &mpsc::Sender<Changeset>,
) -> Result<()> {
    let id = parse_notification_payload(notification.payload())?;
    let event = store.get_by_id(id).await?;
    emit_ready(queue.push(event.id, event), changes_tx).await?;
    Ok(())
}

/// Decode and forward every event released by the ordered queue.
async fn emit_ready(
    ready: Vec<StoredEvent>,
    changes_tx: &mpsc::Sender<Changeset>,
) -> Result<u64> {
    let mut emitted = 0u64;
    for event in ready {
        let changeset = event.into_changeset()?;
        changes_tx
            .send(changeset)
            .await
            .map_err(|_| anyhow!("changeset stream closed"))?;
        emitted += 1;
    }
    Ok(emitted)
}

/// Parse the `<id>_<timestamp>` notification payload; only the id is used.
fn parse_notification_payload(payload: &str) -> Result<i64> {
    let id_part = payload.split('_').next().unwrap_or("");
    id_part
        .parse::<i64>()
        .with_context(|| format!("malformed notification payload '{}'", payload))
}
