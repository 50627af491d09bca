//! Session operations exposed to the UI.

use std::path::PathBuf;

use serde_json::{json, Value};

use stellar_pty::{Dimensions, SessionId, SpawnSpec};

use crate::ipc::ErrorBody;
use crate::state::AppState;

/// Spawn a process in a new PTY. Replies with the session id.
pub fn open(
    state: &AppState,
    command: Vec<String>,
    rows: i64,
    cols: i64,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
) -> Result<Value, ErrorBody> {
    let dimensions = Dimensions::from_signed(rows, cols)?;
    let spec = SpawnSpec {
        argv: command,
        env,
        cwd,
        dimensions,
    };
    let id = state.registry.open(spec)?;
    Ok(json!({ "session_id": id }))
}

/// Queue input bytes. Exactly one of `data` or `text` must be given.
pub fn write(
    state: &AppState,
    session_id: SessionId,
    data: Option<Vec<u8>>,
    text: Option<String>,
) -> Result<Value, ErrorBody> {
    let bytes = match (data, text) {
        (Some(data), None) => data,
        (None, Some(text)) => text.into_bytes(),
        (Some(_), Some(_)) => {
            return Err(ErrorBody::invalid_request("give either data or text, not both"))
        }
        (None, None) => return Err(ErrorBody::invalid_request("missing data or text")),
    };
    state.registry.write(session_id, &bytes)?;
    Ok(json!({ "accepted": bytes.len() }))
}

pub fn resize(state: &AppState, session_id: SessionId, rows: i64, cols: i64) -> Result<Value, ErrorBody> {
    let dimensions = Dimensions::from_signed(rows, cols)?;
    state.registry.resize(session_id, dimensions)?;
    Ok(Value::Null)
}

pub fn close(state: &AppState, session_id: SessionId) -> Result<Value, ErrorBody> {
    state.registry.close(session_id)?;
    Ok(Value::Null)
}

pub fn list(state: &AppState) -> Result<Value, ErrorBody> {
    serde_json::to_value(state.registry.list())
        .map_err(|e| ErrorBody::new("io_error", e.to_string()))
}

pub fn dump_scrollback(state: &AppState, session_id: SessionId) -> Result<Value, ErrorBody> {
    let chunks = state.registry.dump_scrollback(session_id)?;
    Ok(json!({ "session_id": session_id, "chunks": chunks }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::app_state;

    #[test]
    fn test_open_rejects_bad_dimensions() {
        let state = app_state();
        let err = open(&state, vec!["/bin/sh".into()], -1, 80, vec![], None).unwrap_err();
        assert_eq!(err.kind, "invalid_dimensions");
        assert!(state.registry.list().is_empty());
    }

    #[test]
    fn test_open_missing_program_is_spawn_error() {
        let state = app_state();
        let err = open(
            &state,
            vec!["/definitely/not/a/shell".into()],
            24,
            80,
            vec![],
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind, "spawn_error");
    }

    #[test]
    fn test_session_operations_round_trip() {
        let state = app_state();
        let opened = open(&state, vec!["/bin/cat".into()], 24, 80, vec![], None).unwrap();
        let id = opened["session_id"].as_u64().unwrap();

        assert_eq!(
            write(&state, id, None, Some("hi\n".into())).unwrap(),
            json!({ "accepted": 3 })
        );
        resize(&state, id, 40, 120).unwrap();

        let listed = list(&state).unwrap();
        assert_eq!(listed[0]["id"], json!(id));
        assert_eq!(listed[0]["title"], json!("cat"));
        assert_eq!(listed[0]["dimensions"], json!({ "rows": 40, "cols": 120 }));

        close(&state, id).unwrap();
        close(&state, id).unwrap();
        assert_eq!(write(&state, id, Some(vec![1]), None).unwrap_err().kind, "not_found");
    }

    #[test]
    fn test_write_needs_exactly_one_payload() {
        let state = app_state();
        assert_eq!(write(&state, 1, None, None).unwrap_err().kind, "invalid_request");
        assert_eq!(
            write(&state, 1, Some(vec![]), Some(String::new())).unwrap_err().kind,
            "invalid_request"
        );
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let state = app_state();
        assert_eq!(close(&state, 77).unwrap_err().kind, "not_found");
        assert_eq!(dump_scrollback(&state, 77).unwrap_err().kind, "not_found");
        assert_eq!(resize(&state, 77, 10, 10).unwrap_err().kind, "not_found");
    }
}
