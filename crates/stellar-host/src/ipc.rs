//! Wire types for the stdio protocol.
//!
//! The UI writes one JSON [`Request`] per line to stdin. The host writes one
//! JSON [`Outbound`] per line to stdout: replies to requests, and every
//! Control Channel frame as an `event`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stellar_pty::{Frame, RegistryError, SessionId};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u64,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Open {
        /// Argument vector. Empty runs the default shell.
        #[serde(default)]
        command: Vec<String>,
        #[serde(default = "default_rows")]
        rows: i64,
        #[serde(default = "default_cols")]
        cols: i64,
        /// `[name, value]` pairs, applied in order.
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Write {
        session_id: SessionId,
        #[serde(default)]
        data: Option<Vec<u8>>,
        #[serde(default)]
        text: Option<String>,
    },
    Resize {
        session_id: SessionId,
        rows: i64,
        cols: i64,
    },
    Close {
        session_id: SessionId,
    },
    List,
    DumpScrollback {
        session_id: SessionId,
    },
    SaveSnapshot {
        session_id: SessionId,
    },
    LoadSnapshot {
        snapshot_id: i64,
    },
    ListSnapshots,
    DeleteSnapshot {
        snapshot_id: i64,
    },
}

fn default_rows() -> i64 {
    24
}

fn default_cols() -> i64 {
    80
}

impl Op {
    /// Ops that may block for a while (process spawn, database I/O) and
    /// run off the request loop.
    pub fn is_slow(&self) -> bool {
        matches!(
            self,
            Op::Open { .. }
                | Op::SaveSnapshot { .. }
                | Op::LoadSnapshot { .. }
                | Op::ListSnapshots
                | Op::DeleteSnapshot { .. }
        )
    }
}

/// Everything the host writes to stdout.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Reply(Reply),
    Event(Frame),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Reply {
    /// `None` when the request line could not be parsed far enough to tell.
    pub request_id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn ok(request_id: u64, result: Value) -> Self {
        Self {
            request_id: Some(request_id),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: Option<u64>, error: ErrorBody) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    /// Bytes taken before the input queue filled up. Only for `backpressure`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<usize>,
}

impl ErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            accepted: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new("storage_error", message)
    }
}

impl From<RegistryError> for ErrorBody {
    fn from(e: RegistryError) -> Self {
        let accepted = match &e {
            RegistryError::Backpressure { accepted, .. } => Some(*accepted),
            _ => None,
        };
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            accepted,
        }
    }
}

impl From<rusqlite::Error> for ErrorBody {
    fn from(e: rusqlite::Error) -> Self {
        Self::storage(e.to_string())
    }
}

/// Parse one request line. A malformed line still gets a reply, tagged with
/// its `request_id` when one can be found.
pub fn parse_request(line: &str) -> Result<Request, Reply> {
    serde_json::from_str(line).map_err(|e| {
        let request_id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("request_id").and_then(Value::as_u64));
        Reply::err(request_id, ErrorBody::invalid_request(e.to_string()))
    })
}
