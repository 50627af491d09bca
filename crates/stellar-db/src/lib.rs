pub mod schema;
pub mod settings;
pub mod snapshots;

use rusqlite::Connection;
use std::path::Path;

pub use snapshots::{NewSnapshot, Snapshot, SnapshotData};

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

/// A throwaway database, for `--db :memory:` and tests.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stellar.db");

        {
            let conn = open(&path).unwrap();
            settings::set(&conn, "tick_ms", "20").unwrap();
        }

        let conn = open(&path).unwrap();
        assert_eq!(settings::get(&conn, "tick_ms").unwrap().as_deref(), Some("20"));
        assert_eq!(schema::version(&conn).unwrap(), schema::CURRENT_VERSION);
    }
}
