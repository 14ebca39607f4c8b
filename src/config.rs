// ABOUTME: Connection settings and log-level handling
// ABOUTME: Renders tokio-postgres connection strings for ordinary and replication sessions

use anyhow::{bail, Result};
use tracing_subscriber::filter::LevelFilter;

/// Connection settings for one PostgreSQL database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Render the settings as a tokio-postgres connection string.
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            self.host, self.port, self.user, self.password, self.database
        )
    }

    /// Connection string for a logical-replication session.
    ///
    /// The `replication=database` parameter switches the backend into
    /// replication mode while keeping ordinary queries available, which is
    /// what `CREATE_REPLICATION_SLOT` and `START_REPLICATION` require.
    pub fn replication_conninfo(&self) -> String {
        format!("{} replication=database", self.conninfo())
    }
}

/// Parse a log-level name into a tracing level filter.
///
/// Accepts the levels recognized by the CLI: trace, debug, info, warn,
/// error, and fatal (mapped to error, which is the most severe level
/// tracing distinguishes).
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    let filter = match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" | "fatal" => LevelFilter::ERROR,
        other => bail!(
            "'{}' is not a valid log level. Must be one of: trace, debug, info, warn, error, fatal",
            other
        ),
    };
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DbConfig {
        DbConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
            user: "postgres".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_conninfo_contains_all_settings() {
        let info = config().conninfo();
        assert!(info.contains("host=localhost"));
        assert!(info.contains("port=5432"));
        assert!(info.contains("user=postgres"));
        assert!(info.contains("password=secret"));
        assert!(info.contains("dbname=app"));
    }

    #[test]
    fn test_replication_conninfo_appends_replication_parameter() {
        let info = config().replication_conninfo();
        assert!(info.ends_with("replication=database"));
    }

    #[test]
    fn test_parse_log_level_accepts_all_names() {
        for level in ["trace", "debug", "info", "warn", "error", "fatal"] {
            assert!(parse_log_level(level).is_ok(), "level {} rejected", level);
        }
    }

    #[test]
    fn test_parse_log_level_maps_fatal_to_error() {
        assert_eq!(parse_log_level("fatal").unwrap(), LevelFilter::ERROR);
    }

    #[test]
    fn test_parse_log_level_rejects_unknown() {
        let err = parse_log_level("verbose").unwrap_err();
        assert!(err.to_string().contains("not a valid log level"));
    }
}
