// ABOUTME: CLI entry point for warp-pipe
// ABOUTME: Parses commands and routes to sync, setup, and verification handlers

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tokio::sync::broadcast;

use warp_pipe::applier::{Applier, ApplierConfig, SchemaCache};
use warp_pipe::config::{parse_log_level, DbConfig};
use warp_pipe::listener::wal2json::parse_lsn;
use warp_pipe::listener::{
    Listener, ListenerMode, LogicalReplicationListener, NotifyListener,
};
use warp_pipe::postgres::{check_target_version, connect};
use warp_pipe::store::changeset_count;
use warp_pipe::{setup, verify, ReplicationDaemon};

#[derive(Parser)]
#[command(name = "warp-pipe")]
#[command(about = "Change capture and replay between PostgreSQL databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (trace, debug, info, warn, error, fatal)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SourceDbArgs {
    /// Source database host
    #[arg(long, env = "WP_SOURCE_DB_HOST", default_value = "localhost")]
    source_host: String,
    /// Source database port
    #[arg(long, env = "WP_SOURCE_DB_PORT", default_value_t = 5432)]
    source_port: u16,
    /// Source database name
    #[arg(long, env = "WP_SOURCE_DB_NAME")]
    source_name: String,
    /// Source database user
    #[arg(long, env = "WP_SOURCE_DB_USER")]
    source_user: String,
    /// Source database password
    #[arg(long, env = "WP_SOURCE_DB_PASS", default_value = "")]
    source_pass: String,
}

impl SourceDbArgs {
    fn to_config(&self) -> DbConfig {
        DbConfig {
            host: self.source_host.clone(),
            port: self.source_port,
            database: self.source_name.clone(),
            user: self.source_user.clone(),
            password: self.source_pass.clone(),
        }
    }
}

#[derive(Args, Clone)]
struct TargetDbArgs {
    /// Target database host
    #[arg(long, env = "WP_TARGET_DB_HOST", default_value = "localhost")]
    target_host: String,
    /// Target database port
    #[arg(long, env = "WP_TARGET_DB_PORT", default_value_t = 5432)]
    target_port: u16,
    /// Target database name
    #[arg(long, env = "WP_TARGET_DB_NAME")]
    target_name: String,
    /// Target database user
    #[arg(long, env = "WP_TARGET_DB_USER")]
    target_user: String,
    /// Target database password
    #[arg(long, env = "WP_TARGET_DB_PASS", default_value = "")]
    target_pass: String,
}

impl TargetDbArgs {
    fn to_config(&self) -> DbConfig {
        DbConfig {
            host: self.target_host.clone(),
            port: self.target_port,
            database: self.target_name.clone(),
            user: self.target_user.clone(),
            password: self.target_pass.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Trigger-based audit log with LISTEN/NOTIFY wake-ups
    Notify,
    /// Logical replication slot decoded by wal2json
    Replicate,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay source changes against the target until interrupted
    Sync {
        #[command(flatten)]
        source: SourceDbArgs,
        #[command(flatten)]
        target: TargetDbArgs,
        /// Capture mode
        #[arg(long, value_enum, default_value_t = Mode::Notify)]
        mode: Mode,
        /// Rewrite each changeset's schema to this value before applying
        #[arg(long, env = "WP_TARGET_DB_SCHEMA")]
        target_schema: Option<String>,
        /// Notify mode: resume after this changeset id
        #[arg(long, env = "WP_START_FROM_ID")]
        start_from_id: Option<i64>,
        /// Notify mode: resume from this RFC 3339 timestamp
        #[arg(long, value_parser = parse_timestamp_arg)]
        start_from_timestamp: Option<DateTime<Utc>>,
        /// Replicate mode: resume from this LSN (e.g. 0/16D1918)
        #[arg(long, value_parser = parse_lsn_arg)]
        start_from_lsn: Option<u64>,
        /// Replicate mode: use this replication slot instead of an
        /// auto-generated one
        #[arg(long, env = "WP_REPLICATION_SLOT_NAME")]
        slot_name: Option<String>,
        /// Only replicate these tables (schema.table, schema.*, or table)
        #[arg(long, value_delimiter = ',', env = "WP_WHITELIST_TABLES")]
        whitelist_tables: Vec<String>,
        /// Never replicate these tables; applied after the whitelist
        #[arg(long, value_delimiter = ',', env = "WP_IGNORE_TABLES")]
        ignore_tables: Vec<String>,
        /// Fail instead of skip when an insert hits a duplicate row
        #[arg(long, env = "WP_FAIL_ON_DUPLICATE")]
        fail_on_duplicate: bool,
        /// Notify mode: exit once the newest source changeset is applied
        #[arg(long, env = "WP_SHUTDOWN_AFTER_LAST_CHANGESET")]
        shutdown_after_last_changeset: bool,
    },
    /// Install the audit schema and triggers on the source database
    Setup {
        #[command(flatten)]
        source: SourceDbArgs,
        /// Schemas whose tables get changeset triggers
        #[arg(long, value_delimiter = ',', default_value = "public")]
        schemas: Vec<String>,
        /// Only register triggers on these tables (schema.table)
        #[arg(long, value_delimiter = ',')]
        include_tables: Vec<String>,
        /// Skip these tables (schema.table)
        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
    },
    /// Remove the audit schema and all its triggers from the source
    Teardown {
        #[command(flatten)]
        source: SourceDbArgs,
    },
    /// Compare per-table checksums between source and target
    Verify {
        #[command(flatten)]
        source: SourceDbArgs,
        #[command(flatten)]
        target: TargetDbArgs,
        /// Schemas to check
        #[arg(long, value_delimiter = ',', default_value = "public")]
        schemas: Vec<String>,
        /// Only check these tables (schema.table)
        #[arg(long, value_delimiter = ',')]
        include_tables: Vec<String>,
        /// Skip these tables (schema.table)
        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
    },
    /// Compare audit records between source and target one by one
    VerifyChangesets {
        #[command(flatten)]
        source: SourceDbArgs,
        #[command(flatten)]
        target: TargetDbArgs,
        /// Only compare changesets up to this id
        #[arg(long)]
        last_id: Option<i64>,
    },
}

fn parse_timestamp_arg(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", text, e))
}

fn parse_lsn_arg(text: &str) -> Result<u64, String> {
    parse_lsn(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = parse_log_level(&cli.log)?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Sync {
            source,
            target,
            mode,
            target_schema,
            start_from_id,
            start_from_timestamp,
            start_from_lsn,
            slot_name,
            whitelist_tables,
            ignore_tables,
            fail_on_duplicate,
            shutdown_after_last_changeset,
        } => {
            run_sync(SyncOptions {
                source: source.to_config(),
                target: target.to_config(),
                mode: match mode {
                    Mode::Notify => ListenerMode::Notify,
                    Mode::Replicate => ListenerMode::Replicate,
                },
                target_schema,
                start_from_id,
                start_from_timestamp,
                start_from_lsn,
                slot_name,
                whitelist_tables,
                ignore_tables,
                fail_on_duplicate,
                shutdown_after_last_changeset,
            })
            .await
        }
        Commands::Setup {
            source,
            schemas,
            include_tables,
            exclude_tables,
        } => {
            let mut client = connect(&source.to_config().conninfo())
                .await
                .context("unable to connect to source database")?;
            setup::prepare(&mut client, &schemas, &include_tables, &exclude_tables).await?;
            tracing::info!("source database prepared for change capture");
            Ok(())
        }
        Commands::Teardown { source } => {
            let client = connect(&source.to_config().conninfo())
                .await
                .context("unable to connect to source database")?;
            setup::teardown(&client).await?;
            tracing::info!("warp_pipe schema removed");
            Ok(())
        }
        Commands::Verify {
            source,
            target,
            schemas,
            include_tables,
            exclude_tables,
        } => {
            let mut source_client = connect(&source.to_config().conninfo())
                .await
                .context("unable to connect to source database")?;
            let mut target_client = connect(&target.to_config().conninfo())
                .await
                .context("unable to connect to target database")?;
            verify::verify_checksums(
                &mut source_client,
                &mut target_client,
                &schemas,
                &include_tables,
                &exclude_tables,
            )
            .await
        }
        Commands::VerifyChangesets {
            source,
            target,
            last_id,
        } => {
            let source_client = connect(&source.to_config().conninfo())
                .await
                .context("unable to connect to source database")?;
            let target_client = connect(&target.to_config().conninfo())
                .await
                .context("unable to connect to target database")?;
            verify::verify_changesets(&source_client, &target_client, last_id).await
        }
    }
}

struct SyncOptions {
    source: DbConfig,
    target: DbConfig,
    mode: ListenerMode,
    target_schema: Option<String>,
    start_from_id: Option<i64>,
    start_from_timestamp: Option<DateTime<Utc>>,
    start_from_lsn: Option<u64>,
    slot_name: Option<String>,
    whitelist_tables: Vec<String>,
    ignore_tables: Vec<String>,
    fail_on_duplicate: bool,
    shutdown_after_last_changeset: bool,
}

async fn run_sync(options: SyncOptions) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(4);
    spawn_signal_handler(shutdown_tx.clone());

    let source_client = Arc::new(
        connect(&options.source.conninfo())
            .await
            .context("unable to connect to source database")?,
    );
    let target_client = connect(&options.target.conninfo())
        .await
        .context("unable to connect to target database")?;

    check_target_version(&target_client).await?;

    if options.mode == ListenerMode::Notify {
        let source_count = changeset_count(&source_client).await?;
        tracing::info!("changesets found in source: {}", source_count);
        match changeset_count(&target_client).await {
            Ok(target_count) => {
                tracing::info!("changesets found in target: {}", target_count);
                if source_count == target_count {
                    tracing::info!("changeset counts match");
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!("unable to count target changesets: {:#}", e),
        }
    }

    let cache = Arc::new(
        SchemaCache::load(&source_client, &target_client)
            .await
            .context("unable to load schema metadata")?,
    );

    let listener: Box<dyn Listener> = match options.mode {
        ListenerMode::Notify => {
            let mut listener = NotifyListener::new();
            if let Some(ts) = options.start_from_timestamp {
                listener = listener.start_from_timestamp(ts);
            } else {
                listener = listener.start_from_id(options.start_from_id.unwrap_or(0));
            }
            Box::new(listener)
        }
        ListenerMode::Replicate => {
            let mut listener = LogicalReplicationListener::new();
            if let Some(slot) = options.slot_name {
                listener = listener.slot_name(slot);
            }
            if let Some(lsn) = options.start_from_lsn {
                listener = listener.start_from_lsn(lsn);
            }
            Box::new(listener)
        }
    };

    let mut daemon = ReplicationDaemon::new(listener)
        .whitelist_tables(options.whitelist_tables)
        .ignore_tables(options.ignore_tables);

    daemon.open(&options.source).await?;
    let (changes, errors) = daemon.listen_for_changes(&shutdown_tx).await?;

    let applier = Applier::new(
        ApplierConfig {
            mode: options.mode,
            target_schema: options.target_schema,
            fail_on_duplicate: options.fail_on_duplicate,
            shutdown_after_last_changeset: options.shutdown_after_last_changeset,
        },
        cache,
        source_client,
        target_client,
    );

    let result = applier.run(changes, errors, &shutdown_tx).await;
    daemon.close().await?;
    result
}

fn spawn_signal_handler(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let terminate = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        tracing::error!("failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        tracing::info!("interrupt received, shutting down");
        let _ = shutdown.send(());
    });
}
