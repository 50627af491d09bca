//! Control Channel framing.
//!
//! Every message to the UI is a [`Frame`]: the session it belongs to, that
//! session's next sequence number, and a typed payload. The multiplexer is
//! the only producer, so per-session order on the channel is sequence order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::SessionId;

/// Payload of a frame, tagged by kind on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Bytes produced by the process, in order.
    Output { data: Vec<u8> },
    /// The PTY was resized.
    Resized { rows: u16, cols: u16 },
    /// The process exited. Terminal.
    Exited { code: Option<u32> },
    /// The session failed. Terminal.
    Error { message: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Output,
    Resized,
    Exited,
    Error,
}

impl EventPayload {
    pub fn kind(&self) -> FrameKind {
        match self {
            EventPayload::Output { .. } => FrameKind::Output,
            EventPayload::Resized { .. } => FrameKind::Resized,
            EventPayload::Exited { .. } => FrameKind::Exited,
            EventPayload::Error { .. } => FrameKind::Error,
        }
    }

    /// Whether this is the last frame a session will ever produce.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Exited { .. } | EventPayload::Error { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub session_id: SessionId,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        self.payload.kind()
    }
}

/// Outcome of trying to get room on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The consumer is behind; retry later.
    Full,
    /// The consumer is gone.
    Closed,
}

/// Producer end of the Control Channel.
///
/// Sending is two-phase: reserve a slot, then stamp and send. A frame is
/// only sequenced once it is guaranteed to go out, so a full channel never
/// leaves a gap.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Frame>,
}

pub type ControlReceiver = mpsc::Receiver<Frame>;

/// Create a bounded Control Channel holding up to `capacity` frames.
pub fn control_channel(capacity: usize) -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ControlSender { tx }, rx)
}

impl ControlSender {
    pub fn try_reserve(&self) -> Result<mpsc::Permit<'_, Frame>, ChannelState> {
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => ChannelState::Full,
            mpsc::error::TrySendError::Closed(()) => ChannelState::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A jump in a session's sequence numbers seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub session_id: SessionId,
    pub expected: u64,
    pub received: u64,
}

/// Consumer-side check that each session's frames arrive gap-free.
#[derive(Default)]
pub struct GapDetector {
    expected: HashMap<SessionId, u64>,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, frame: &Frame) -> Result<(), Gap> {
        let expected = self.expected.entry(frame.session_id).or_insert(0);
        let result = if frame.sequence == *expected {
            Ok(())
        } else {
            Err(Gap {
                session_id: frame.session_id,
                expected: *expected,
                received: frame.sequence,
            })
        };
        *expected = frame.sequence + 1;
        if frame.payload.is_terminal() {
            self.expected.remove(&frame.session_id);
        }
        result
    }
}
