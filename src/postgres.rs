// ABOUTME: Connection helpers and server-version gate
// ABOUTME: Spawns the tokio-postgres connection driver and routes async notifications

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, NoTls, Notification};

/// Connect to a database and drive the connection on a background task.
pub async fn connect(conninfo: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
        .await
        .context("failed to connect to database")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("database connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect to a database and forward asynchronous notifications.
///
/// The returned receiver yields every `NOTIFY` delivered on this session.
/// Notifications that arrive while the consumer is busy are buffered in the
/// channel, so a slow consumer sees them replayed later rather than dropped.
pub async fn connect_with_notifications(
    conninfo: &str,
) -> Result<(Client, mpsc::UnboundedReceiver<Notification>)> {
    let (client, mut connection) = tokio_postgres::connect(conninfo, NoTls)
        .await
        .context("failed to connect to database")?;

    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut messages =
            futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        use futures::StreamExt;
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    if tx.send(n).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("database connection error: {}", e);
                    break;
                }
            }
        }
    });

    Ok((client, rx))
}

/// Parse a `server_version` string as `major.minor[.patch][ trailing text]`.
///
/// Debian-style builds report versions like `12.3 (Debian 12.3-1.pgdg100+1)`;
/// development builds may report a bare major such as `16devel`.
pub fn parse_server_version(version: &str) -> Result<(u32, u32)> {
    let numeric = version
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or("");
    let mut parts = numeric.split('.');

    let major: u32 = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("unparseable server version '{}'", version))?
        .parse()
        .with_context(|| format!("unparseable server version '{}'", version))?;

    let minor: u32 = match parts.next() {
        Some(m) if !m.is_empty() => m
            .parse()
            .with_context(|| format!("unparseable server version '{}'", version))?,
        _ => 0,
    };

    Ok((major, minor))
}

/// Reject target servers that cannot run `ON CONFLICT` upserts (pre-9.5).
pub async fn check_target_version(client: &Client) -> Result<String> {
    let row = client
        .query_one("SHOW server_version", &[])
        .await
        .context("failed to read target server version")?;
    let version: String = row.get(0);

    let (major, minor) = parse_server_version(&version)?;
    if (major, minor) < (9, 5) {
        bail!(
            "target database version {} is unsupported: ON CONFLICT requires 9.5 or later",
            version
        );
    }

    tracing::info!("target database version: {}", version);
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_version() {
        assert_eq!(parse_server_version("10.4").unwrap(), (10, 4));
        assert_eq!(parse_server_version("9.5.13").unwrap(), (9, 5));
    }

    #[test]
    fn test_parse_version_with_trailing_text() {
        assert_eq!(
            parse_server_version("12.3 (Debian 12.3-1.pgdg100+1)").unwrap(),
            (12, 3)
        );
    }

    #[test]
    fn test_parse_major_only_version() {
        assert_eq!(parse_server_version("14").unwrap(), (14, 0));
        assert_eq!(parse_server_version("16devel").unwrap(), (16, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_server_version("").is_err());
        assert!(parse_server_version("postgres").is_err());
    }

    #[test]
    fn test_version_gate_boundary() {
        for (version, supported) in [
            ("9.4.26", false),
            ("9.5", true),
            ("9.6.2", true),
            ("10.0", true),
            ("15.4", true),
        ] {
            let (major, minor) = parse_server_version(version).unwrap();
            assert_eq!((major, minor) >= (9, 5), supported, "version {}", version);
        }
    }
}
