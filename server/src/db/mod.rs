pub mod migrations;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared database connection.
/// rusqlite is synchronous, so callers on the runtime go through
/// tokio::task::spawn_blocking before taking the lock.
pub type DbPool = Arc<Mutex<Connection>>;

/// Create the data directory if needed, open rideshare.db with WAL and foreign
/// keys enabled, and bring the schema to the latest migration.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("rideshare.db");
    let mut conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database with the full schema. Used by unit tests.
pub fn open_in_memory() -> Result<DbPool, Box<dyn std::error::Error>> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrations::migrations().to_latest(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Timestamps are stored as RFC 3339 UTC with millisecond precision so that
/// text comparison orders them chronologically.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations::migrations().validate().is_ok());
    }

    #[test]
    fn test_timestamp_text_orders_chronologically() {
        let early = parse_ts("2026-01-01T09:00:00.000Z").unwrap();
        let late = parse_ts("2026-01-01T10:00:00.000Z").unwrap();
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }
}
