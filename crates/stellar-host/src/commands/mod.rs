//! Request handling.
//!
//! Requests are read in order. Quick session operations run inline, so
//! writes to one session reach it in the order they were sent. Operations
//! that may block run on the blocking pool and reply when done.

pub mod session;
pub mod snapshots;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::ipc::{parse_request, ErrorBody, Op, Reply, Request};
use crate::state::AppState;

/// Serve requests until the line channel closes.
pub async fn serve(
    state: Arc<AppState>,
    mut lines: mpsc::Receiver<String>,
    replies: mpsc::Sender<Reply>,
) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(reply) => {
                log::warn!("rejected request line: {line}");
                if replies.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if request.op.is_slow() {
            let state = Arc::clone(&state);
            let replies = replies.clone();
            tokio::spawn(async move {
                let request_id = request.request_id;
                let reply = tokio::task::spawn_blocking(move || dispatch(&state, request))
                    .await
                    .unwrap_or_else(|e| {
                        Reply::err(
                            Some(request_id),
                            ErrorBody::new("io_error", format!("task join error: {e}")),
                        )
                    });
                let _ = replies.send(reply).await;
            });
        } else {
            let reply = dispatch(&state, request);
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// Run one request to completion. May block.
pub fn dispatch(state: &AppState, request: Request) -> Reply {
    let request_id = request.request_id;
    let result: Result<Value, ErrorBody> = match request.op {
        Op::Open {
            command,
            rows,
            cols,
            env,
            cwd,
        } => session::open(state, command, rows, cols, env, cwd),
        Op::Write {
            session_id,
            data,
            text,
        } => session::write(state, session_id, data, text),
        Op::Resize {
            session_id,
            rows,
            cols,
        } => session::resize(state, session_id, rows, cols),
        Op::Close { session_id } => session::close(state, session_id),
        Op::List => session::list(state),
        Op::DumpScrollback { session_id } => session::dump_scrollback(state, session_id),
        Op::SaveSnapshot { session_id } => snapshots::save(state, session_id),
        Op::LoadSnapshot { snapshot_id } => snapshots::load(state, snapshot_id),
        Op::ListSnapshots => snapshots::list(state),
        Op::DeleteSnapshot { snapshot_id } => snapshots::delete(state, snapshot_id),
    };

    match result {
        Ok(value) => Reply::ok(request_id, value),
        Err(error) => {
            log::debug!("request {request_id} failed: {}", error.message);
            Reply::err(Some(request_id), error)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use stellar_pty::{ChannelReadiness, MuxConfig, Registry};

    use crate::state::AppState;

    /// State backed by native PTYs and an in-memory database. Nothing
    /// services the sessions; the tests only exercise request handling.
    pub fn app_state() -> AppState {
        let config = MuxConfig::default();
        let (_readiness, notifier) = ChannelReadiness::new();
        let registry = Registry::new(Arc::new(config.native_spawner()), Arc::new(notifier), config);
        AppState::new(Arc::new(registry), stellar_db::open_in_memory().unwrap())
    }
}
