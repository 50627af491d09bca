//! Persisted scrollback dumps.
//!
//! A snapshot is the scrollback of one session at the time it was saved,
//! stored as its ordered chunks plus enough metadata to relaunch the same
//! command at the same size.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub session_id: Option<i64>,
    pub title: String,
    pub command: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub created_at: String,
    pub chunk_count: i64,
    pub byte_len: i64,
}

/// A snapshot together with its chunks, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub chunks: Vec<Vec<u8>>,
}

/// What to store for a new snapshot.
#[derive(Debug, Clone, Copy)]
pub struct NewSnapshot<'a> {
    pub session_id: Option<i64>,
    pub title: &'a str,
    pub command: &'a [String],
    pub rows: u16,
    pub cols: u16,
    pub chunks: &'a [Vec<u8>],
}

const SELECT_SNAPSHOT: &str = "\
    SELECT s.id, s.session_id, s.title, s.command, s.rows, s.cols, s.created_at, \
           COUNT(c.idx), COALESCE(SUM(LENGTH(c.data)), 0) \
    FROM snapshots s LEFT JOIN snapshot_chunks c ON c.snapshot_id = s.id";

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let command: String = row.get(3)?;
    let command = serde_json::from_str(&command)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Snapshot {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        command,
        rows: row.get(4)?,
        cols: row.get(5)?,
        created_at: row.get(6)?,
        chunk_count: row.get(7)?,
        byte_len: row.get(8)?,
    })
}

/// Store a snapshot and its chunks in one transaction. Returns its id.
pub fn save(conn: &Connection, new: &NewSnapshot<'_>) -> rusqlite::Result<i64> {
    let command = serde_json::to_string(new.command)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO snapshots (session_id, title, command, rows, cols) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![new.session_id, new.title, command, new.rows, new.cols],
    )?;
    let id = tx.last_insert_rowid();
    {
        let mut insert = tx.prepare(
            "INSERT INTO snapshot_chunks (snapshot_id, idx, data) VALUES (?1, ?2, ?3)",
        )?;
        for (idx, chunk) in new.chunks.iter().enumerate() {
            insert.execute(params![id, idx as i64, chunk])?;
        }
    }
    tx.commit()?;
    Ok(id)
}

pub fn get(conn: &Connection, id: i64) -> rusqlite::Result<Option<Snapshot>> {
    conn.query_row(
        &format!("{SELECT_SNAPSHOT} WHERE s.id = ?1 GROUP BY s.id"),
        params![id],
        snapshot_from_row,
    )
    .optional()
}

pub fn load(conn: &Connection, id: i64) -> rusqlite::Result<Option<SnapshotData>> {
    let Some(snapshot) = get(conn, id)? else {
        return Ok(None);
    };
    let mut stmt =
        conn.prepare("SELECT data FROM snapshot_chunks WHERE snapshot_id = ?1 ORDER BY idx")?;
    let chunks = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
    Ok(Some(SnapshotData { snapshot, chunks }))
}

/// All snapshots, newest first.
pub fn list(conn: &Connection) -> rusqlite::Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare(&format!("{SELECT_SNAPSHOT} GROUP BY s.id ORDER BY s.id DESC"))?;
    let rows = stmt.query_map([], snapshot_from_row)?;
    rows.collect()
}

pub fn delete(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}
