// ABOUTME: Logical-replication listener consuming a wal2json slot
// ABOUTME: Manages slot lifecycle, the COPY BOTH stream, and standby-status heartbeats

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, CopyBothDuplex, SimpleQueryMessage};

use crate::changeset::Changeset;
use crate::config::DbConfig;
use crate::listener::wal2json::{format_lsn, parse_lsn, Wal2JsonMessage};
use crate::listener::{Listener, CHANGE_CHANNEL_CAPACITY, ERROR_CHANNEL_CAPACITY};
use crate::postgres::connect;

const SLOT_NAME_PREFIX: &str = "wp_";
const OUTPUT_PLUGIN: &str = "wal2json";

/// Options passed literally to START_REPLICATION. The audit table itself is
/// filtered out so audit mode and replication mode never observe each other.
const WAL2JSON_ARGS: [&str; 4] = [
    "\"include-lsn\" 'on'",
    "\"pretty-print\" 'off'",
    "\"include-timestamp\" 'on'",
    "\"filter-tables\" 'warp_pipe.*'",
];

/// Copy-both frame tags and layouts, per the streaming replication protocol.
const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
/// 'w' + wal start + wal end + send time.
const XLOG_DATA_HEADER_LEN: usize = 25;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: u64 = 946_684_800 * 1_000_000;

/// Listener that streams changes from a logical replication slot.
///
/// Two source connections are held: an ordinary one for catalog queries and
/// one in replication mode for slot commands and the COPY BOTH stream.
pub struct LogicalReplicationListener {
    configured_slot: Option<String>,
    slot_name: Option<String>,
    slot_was_auto: bool,
    start_from_lsn: Option<u64>,
    heartbeat_interval: Duration,
    repl_lsn: Arc<AtomicU64>,
    client: Option<Client>,
    repl_client: Option<Client>,
}

impl LogicalReplicationListener {
    pub fn new() -> Self {
        LogicalReplicationListener {
            configured_slot: None,
            slot_name: None,
            slot_was_auto: false,
            start_from_lsn: None,
            heartbeat_interval: Duration::from_secs(10),
            repl_lsn: Arc::new(AtomicU64::new(0)),
            client: None,
            repl_client: None,
        }
    }

    /// Use a named slot instead of an auto-generated one. Named slots are
    /// never garbage-collected and survive restarts.
    pub fn slot_name(mut self, name: impl Into<String>) -> Self {
        self.configured_slot = Some(name.into());
        self
    }

    /// Begin streaming from this LSN instead of the slot's consistent point.
    pub fn start_from_lsn(mut self, lsn: u64) -> Self {
        self.start_from_lsn = Some(lsn);
        self
    }

    /// The WAL position that standby-status replies report.
    pub fn repl_lsn(&self) -> u64 {
        self.repl_lsn.load(Ordering::SeqCst)
    }

    async fn init_replication_slot(&mut self) -> Result<()> {
        let slot_name = match &self.configured_slot {
            Some(name) => name.clone(),
            None => {
                self.slot_was_auto = true;
                let unix_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .context("system clock before Unix epoch")?
                    .as_secs();
                format!("{}{}", SLOT_NAME_PREFIX, unix_seconds)
            }
        };

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("listener is not connected; call dial first"))?;
        let repl_client = self
            .repl_client
            .as_ref()
            .ok_or_else(|| anyhow!("listener is not connected; call dial first"))?;

        clear_replication_slots(client, repl_client, &slot_name).await?;

        match create_replication_slot(repl_client, &slot_name).await {
            Ok(consistent_point) => {
                if self.start_from_lsn.is_none() {
                    self.start_from_lsn = Some(
                        parse_lsn(&consistent_point)
                            .context("failed to parse LSN from consistent point")?,
                    );
                }
            }
            Err(e) if is_sqlstate(&e, &SqlState::DUPLICATE_OBJECT) => {
                if self.slot_was_auto {
                    bail!(
                        "replication slot '{}' already exists and clashes with an auto-generated name",
                        slot_name
                    );
                }
                tracing::info!("using existing replication slot '{}'", slot_name);
            }
            Err(e) if is_sqlstate(&e, &SqlState::CONFIGURATION_LIMIT_EXCEEDED) => {
                bail!("all replication slots are currently in use");
            }
            Err(e) => {
                return Err(anyhow!(e))
                    .with_context(|| format!("failed to create replication slot '{}'", slot_name));
            }
        }

        self.repl_lsn
            .store(self.start_from_lsn.unwrap_or(0), Ordering::SeqCst);
        self.slot_name = Some(slot_name);
        Ok(())
    }
}

impl Default for LogicalReplicationListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for LogicalReplicationListener {
    async fn dial(&mut self, config: &DbConfig) -> Result<()> {
        let client = connect(&config.conninfo())
            .await
            .context("replication listener failed to connect to source")?;
        let repl_client = connect(&config.replication_conninfo())
            .await
            .context("failed to open replication-mode connection")?;

        self.client = Some(client);
        self.repl_client = Some(repl_client);

        self.init_replication_slot()
            .await
            .context("failed to initialize replication slot")
    }

    async fn listen_for_changes(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::Receiver<Changeset>, mpsc::Receiver<anyhow::Error>)> {
        let repl_client = self
            .repl_client
            .as_ref()
            .ok_or_else(|| anyhow!("listener is not connected; call dial first"))?;
        let slot_name = self
            .slot_name
            .clone()
            .ok_or_else(|| anyhow!("replication slot is not initialized"))?;
        let start_lsn = self.repl_lsn.load(Ordering::SeqCst);

        tracing::info!(
            "starting replication for slot '{}' from LSN {}",
            slot_name,
            format_lsn(start_lsn)
        );

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            slot_name,
            format_lsn(start_lsn),
            WAL2JSON_ARGS.join(", ")
        );
        let duplex = repl_client
            .copy_both_simple::<Bytes>(&query)
            .await
            .context("failed to start replication")?;
        let mut duplex = Box::pin(duplex);

        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let repl_lsn = Arc::clone(&self.repl_lsn);
        let heartbeat_interval = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);

            loop {
                // The stream is both read and written, so pick the wakeup
                // first and touch the duplex only after the select ends.
                let event = tokio::select! {
                    _ = shutdown.recv() => StreamEvent::Shutdown,
                    _ = heartbeat.tick() => StreamEvent::HeartbeatDue,
                    frame = duplex.next() => StreamEvent::Frame(frame),
                };

                match event {
                    StreamEvent::Shutdown => {
                        tracing::info!("replication listener shutting down");
                        return;
                    }
                    StreamEvent::HeartbeatDue => {
                        let lsn = repl_lsn.load(Ordering::SeqCst);
                        tracing::debug!(
                            "sending standby status with LSN {}",
                            format_lsn(lsn)
                        );
                        if let Err(e) = send_standby_status(&mut duplex, lsn).await {
                            let _ = err_tx.send(e.context("heartbeat failed")).await;
                            return;
                        }
                    }
                    StreamEvent::Frame(Some(Ok(data))) => {
                        if let Err(e) =
                            handle_frame(&data, &mut duplex, &repl_lsn, &changes_tx).await
                        {
                            if err_tx.send(e).await.is_err() {
                                return;
                            }
                        }
                    }
                    StreamEvent::Frame(Some(Err(e))) => {
                        let _ = err_tx
                            .send(anyhow!(e).context("replication connection is down"))
                            .await;
                        return;
                    }
                    StreamEvent::Frame(None) => {
                        let _ = err_tx.send(anyhow!("replication stream ended")).await;
                        return;
                    }
                }
            }
        });

        Ok((changes_rx, err_rx))
    }

    async fn close(&mut self) -> Result<()> {
        if self.slot_was_auto {
            if let (Some(client), Some(slot)) = (&self.client, &self.slot_name) {
                // Best effort: a slot still streaming is refused here and
                // garbage-collected by the next run instead.
                if let Err(e) = client
                    .execute("SELECT pg_drop_replication_slot($1)", &[slot])
                    .await
                {
                    tracing::warn!("could not drop replication slot '{}': {}", slot, e);
                }
            }
        }
        self.repl_client.take();
        self.client.take();
        Ok(())
    }
}

enum StreamEvent {
    Shutdown,
    HeartbeatDue,
    Frame(Option<std::result::Result<Bytes, tokio_postgres::Error>>),
}

/// Drop leftover auto-generated slots from previous runs. Named slots and
/// the slot about to be used are left alone.
async fn clear_replication_slots(
    client: &Client,
    repl_client: &Client,
    current: &str,
) -> Result<()> {
    let rows = client
        .query("SELECT slot_name FROM pg_replication_slots", &[])
        .await
        .context("failed to read replication slots")?;

    for row in rows {
        let slot: String = row.get(0);
        if !slot.starts_with(SLOT_NAME_PREFIX) || slot == current {
            continue;
        }
        tracing::info!("dropping stale replication slot '{}'", slot);
        if let Err(e) = repl_client
            .simple_query(&format!("DROP_REPLICATION_SLOT {}", slot))
            .await
        {
            tracing::error!("failed to drop replication slot '{}': {}", slot, e);
        }
    }

    Ok(())
}

/// Create the slot and return its consistent point.
async fn create_replication_slot(
    repl_client: &Client,
    slot_name: &str,
) -> std::result::Result<String, tokio_postgres::Error> {
    let messages = repl_client
        .simple_query(&format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {}",
            slot_name, OUTPUT_PLUGIN
        ))
        .await?;

    let consistent_point = messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("consistent_point"),
            _ => None,
        })
        .unwrap_or("0/0");

    Ok(consistent_point.to_string())
}

/// Dispatch one copy-both frame from the server.
async fn handle_frame(
    data: &Bytes,
    duplex: &mut Pin<Box<CopyBothDuplex<Bytes>>>,
    repl_lsn: &Arc<AtomicU64>,
    changes_tx: &mpsc::Sender<Changeset>,
) -> Result<()> {
    match data.first() {
        Some(&XLOG_DATA_TAG) => {
            if data.len() < XLOG_DATA_HEADER_LEN {
                bail!("truncated XLogData frame ({} bytes)", data.len());
            }
            let payload = std::str::from_utf8(&data[XLOG_DATA_HEADER_LEN..])
                .context("wal2json payload is not valid UTF-8")?;
            let message = Wal2JsonMessage::decode(payload)?;

            for changeset in message.to_changesets()? {
                changes_tx
                    .send(changeset)
                    .await
                    .map_err(|_| anyhow!("changeset stream closed"))?;
            }

            if let Some(nextlsn) = &message.nextlsn {
                let lsn = parse_lsn(nextlsn)
                    .context("failed to parse nextlsn from wal2json message")?;
                repl_lsn.store(lsn, Ordering::SeqCst);
            }
            Ok(())
        }
        Some(&KEEPALIVE_TAG) => {
            let mut cursor = Cursor::new(&data[1..]);
            let wal_end = cursor.read_u64::<BigEndian>().unwrap_or(0);
            let _send_time = cursor.read_i64::<BigEndian>().unwrap_or(0);
            let reply_requested = cursor.read_u8().unwrap_or(0) == 1;

            tracing::debug!(
                "server keepalive: wal_end={}, reply_requested={}",
                format_lsn(wal_end),
                reply_requested
            );
            if reply_requested {
                let lsn = repl_lsn.load(Ordering::SeqCst);
                send_standby_status(duplex, lsn)
                    .await
                    .context("heartbeat failed")?;
            }
            Ok(())
        }
        Some(tag) => bail!("unexpected replication frame tag 0x{:02x}", tag),
        None => bail!("empty replication frame"),
    }
}

/// Send a standby-status update reporting `lsn` as written, flushed, and
/// applied.
async fn send_standby_status(
    duplex: &mut Pin<Box<CopyBothDuplex<Bytes>>>,
    lsn: u64,
) -> Result<()> {
    duplex
        .send(encode_standby_status(lsn, pg_epoch_micros_now()))
        .await
        .context("failed to send standby status")
}

fn encode_standby_status(lsn: u64, timestamp_micros: i64) -> Bytes {
    let mut frame = BytesMut::with_capacity(34);
    frame.put_u8(b'r');
    frame.put_u64(lsn); // written
    frame.put_u64(lsn); // flushed
    frame.put_u64(lsn); // applied
    frame.put_i64(timestamp_micros);
    frame.put_u8(0); // no reply requested
    frame.freeze()
}

/// Microseconds since the PostgreSQL epoch, as standby-status frames expect.
fn pg_epoch_micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
        .saturating_sub(PG_EPOCH_OFFSET_MICROS) as i64
}

fn is_sqlstate(err: &tokio_postgres::Error, state: &SqlState) -> bool {
    err.code() == Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_standby_status_layout() {
        let lsn = (0x16u64 << 32) | 0xB374D848;
        let frame = encode_standby_status(lsn, 1234);

        assert_eq!(frame.len(), 34);
        assert_eq!(frame[0], b'r');
        // Written, flushed, and applied all carry the same position.
        for offset in [1usize, 9, 17] {
            let mut cursor = Cursor::new(&frame[offset..offset + 8]);
            assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), lsn);
        }
        let mut cursor = Cursor::new(&frame[25..33]);
        assert_eq!(cursor.read_i64::<BigEndian>().unwrap(), 1234);
        assert_eq!(frame[33], 0);
    }

    #[test]
    fn test_wal2json_args_are_literal() {
        let joined = WAL2JSON_ARGS.join(", ");
        assert!(joined.contains("\"include-lsn\" 'on'"));
        assert!(joined.contains("\"pretty-print\" 'off'"));
        assert!(joined.contains("\"include-timestamp\" 'on'"));
        assert!(joined.contains("\"filter-tables\" 'warp_pipe.*'"));
    }

    #[test]
    fn test_pg_epoch_offset() {
        // 2000-01-01T00:00:00Z in Unix seconds.
        assert_eq!(PG_EPOCH_OFFSET_MICROS, 946_684_800_000_000);
    }
}
