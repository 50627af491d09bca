//! Scrollback snapshots: persist a session's scrollback and read it back.

use serde_json::{json, Value};

use stellar_db::{snapshots, NewSnapshot};
use stellar_pty::SessionId;

use crate::ipc::ErrorBody;
use crate::state::AppState;

fn lock_db(state: &AppState) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, ErrorBody> {
    state
        .db
        .lock()
        .map_err(|e| ErrorBody::storage(format!("db lock poisoned: {e}")))
}

/// Store the current scrollback of a live session.
pub fn save(state: &AppState, session_id: SessionId) -> Result<Value, ErrorBody> {
    let summary = state.registry.summary(session_id)?;
    let chunks = state.registry.dump_scrollback(session_id)?;

    let conn = lock_db(state)?;
    let snapshot_id = snapshots::save(
        &conn,
        &NewSnapshot {
            session_id: i64::try_from(session_id).ok(),
            title: &summary.title,
            command: &summary.command,
            rows: summary.dimensions.rows,
            cols: summary.dimensions.cols,
            chunks: &chunks,
        },
    )?;
    log::info!("session {session_id}: saved snapshot {snapshot_id} ({} chunks)", chunks.len());
    Ok(json!({ "snapshot_id": snapshot_id }))
}

pub fn load(state: &AppState, snapshot_id: i64) -> Result<Value, ErrorBody> {
    let conn = lock_db(state)?;
    let data = snapshots::load(&conn, snapshot_id)?
        .ok_or_else(|| ErrorBody::new("not_found", format!("snapshot {snapshot_id} not found")))?;
    serde_json::to_value(data).map_err(|e| ErrorBody::storage(e.to_string()))
}

pub fn list(state: &AppState) -> Result<Value, ErrorBody> {
    let conn = lock_db(state)?;
    let all = snapshots::list(&conn)?;
    serde_json::to_value(all).map_err(|e| ErrorBody::storage(e.to_string()))
}

pub fn delete(state: &AppState, snapshot_id: i64) -> Result<Value, ErrorBody> {
    let conn = lock_db(state)?;
    if !snapshots::delete(&conn, snapshot_id)? {
        return Err(ErrorBody::new("not_found", format!("snapshot {snapshot_id} not found")));
    }
    Ok(Value::Null)
}
