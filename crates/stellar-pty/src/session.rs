use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

use crate::config::MuxConfig;
use crate::error::{PtyError, TransitionError};
use crate::frame::{EventPayload, Frame};
use crate::pty::{Pty, SpawnSpec};
use crate::ring::{OverflowPolicy, RingBuffer};
use crate::scrollback::Scrollback;
use crate::size::Dimensions;

/// Unique identifier for a terminal session.
pub type SessionId = u64;

/// Lifecycle of a session. Transitions only move forward; `Closed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether the session still takes input and resizes.
    pub fn accepts_io(self) -> bool {
        self == SessionState::Running
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running | Closing | Failed)
                | (Running, Running | Closing | Closed | Failed)
                | (Closing, Closed | Failed)
        )
    }
}

/// Why the output stream stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamStatus {
    Open,
    Ended { at: Instant },
    Broken { at: Instant, message: String },
}

/// Snapshot of a session for `list()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub dimensions: Dimensions,
    pub title: String,
    pub command: Vec<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<u32>,
    pub scrollback_entries: usize,
    pub pending_input: usize,
}

/// One terminal session: a PTY, its pending input, its scrollback and its
/// lifecycle state.
///
/// Every state change goes through [`Session::transition`]. Entering a
/// terminal state releases the PTY, exactly once.
pub struct Session {
    id: SessionId,
    state: SessionState,
    dimensions: Dimensions,
    title: String,
    command: Vec<String>,
    pty: Option<Box<dyn Pty>>,
    pid: Option<u32>,
    pending_writes: RingBuffer,
    scrollback: Scrollback,
    next_sequence: u64,
    notices: VecDeque<EventPayload>,
    terminal_event: Option<EventPayload>,
    pub(crate) stream: StreamStatus,
    pub(crate) close_deadline: Option<Instant>,
    pub(crate) exited_at: Option<Instant>,
    pub(crate) failure: Option<String>,
    exit_code: Option<u32>,
}

impl Session {
    /// A session in `Starting`, before its process exists.
    pub fn new(id: SessionId, spec: &SpawnSpec, config: &MuxConfig) -> Self {
        let program = spec.program();
        let title = program
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&program)
            .to_string();

        Self {
            id,
            state: SessionState::Starting,
            dimensions: spec.dimensions,
            title,
            command: spec.argv.clone(),
            pty: None,
            pid: None,
            pending_writes: RingBuffer::new(config.pending_write_limit, OverflowPolicy::ShortWrite),
            scrollback: Scrollback::new(config.scrollback_capacity, config.eviction)
                .with_max_line_bytes(config.max_line_bytes),
            next_sequence: 0,
            notices: VecDeque::new(),
            terminal_event: None,
            stream: StreamStatus::Open,
            close_deadline: None,
            exited_at: None,
            failure: None,
            exit_code: None,
        }
    }

    /// Attach the spawned process and move to `Running`. Any state other
    /// than `Starting` rejects the PTY, which drops and kills it.
    pub fn attach(&mut self, pty: Box<dyn Pty>) -> Result<(), TransitionError> {
        match self.state {
            SessionState::Starting => {
                self.pid = pty.process_id();
                self.pty = Some(pty);
                self.transition(SessionState::Running)
            }
            from => Err(TransitionError {
                id: self.id,
                from,
                to: SessionState::Running,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    pub fn has_pty(&self) -> bool {
        self.pty.is_some()
    }

    /// The only place `state` changes.
    ///
    /// `Running -> Running` is an accepted no-op. Entering `Closed` or
    /// `Failed` drops the PTY, which kills the process if it still runs.
    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        if next != self.state {
            log::debug!("session {}: {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;

        if next.is_terminal() {
            if let Some(mut pty) = self.pty.take() {
                if let Some(code) = pty.try_wait() {
                    self.exit_code = Some(code);
                }
                drop(pty);
            }
        }
        Ok(())
    }

    /// Move to a terminal state and stage its event for delivery.
    pub(crate) fn finish(
        &mut self,
        state: SessionState,
        event: EventPayload,
    ) -> Result<(), TransitionError> {
        self.transition(state)?;
        if let EventPayload::Exited { code } = &event {
            self.exit_code = self.exit_code.or(*code);
        }
        self.terminal_event = Some(event);
        Ok(())
    }

    pub(crate) fn pty_mut(&mut self) -> Option<&mut (dyn Pty + 'static)> {
        self.pty.as_deref_mut()
    }

    /// Enqueue user input. Returns the number of bytes accepted.
    pub(crate) fn queue_input(&mut self, data: &[u8]) -> usize {
        self.pending_writes.push(data)
    }

    pub fn pending_input(&self) -> usize {
        self.pending_writes.occupied()
    }

    /// Hand as much pending input to the PTY as it will take. Returns the
    /// number of bytes flushed.
    pub(crate) fn flush_input(&mut self, chunk: usize) -> Result<usize, PtyError> {
        let Some(pty) = self.pty.as_deref_mut() else {
            return Ok(0);
        };
        let mut flushed = 0;
        loop {
            let data = self.pending_writes.peek(chunk);
            if data.is_empty() {
                return Ok(flushed);
            }
            let n = pty.write(&data)?;
            if n == 0 {
                return Ok(flushed);
            }
            self.pending_writes.discard(n);
            flushed += n;
        }
    }

    pub(crate) fn set_dimensions(&mut self, dimensions: Dimensions) -> Result<(), PtyError> {
        if let Some(pty) = self.pty.as_deref_mut() {
            pty.resize(dimensions)?;
        }
        if dimensions != self.dimensions {
            self.dimensions = dimensions;
            self.notices.push_back(EventPayload::Resized {
                rows: dimensions.rows,
                cols: dimensions.cols,
            });
        }
        Ok(())
    }

    pub(crate) fn record_output(&mut self, data: &[u8]) {
        self.scrollback.push(data);
    }

    pub(crate) fn next_notice(&mut self) -> Option<EventPayload> {
        self.notices.pop_front()
    }

    pub(crate) fn has_notices(&self) -> bool {
        !self.notices.is_empty()
    }

    pub(crate) fn take_terminal_event(&mut self) -> Option<EventPayload> {
        self.terminal_event.take()
    }

    pub(crate) fn restore_terminal_event(&mut self, event: EventPayload) {
        self.terminal_event = Some(event);
    }

    pub(crate) fn has_terminal_event(&self) -> bool {
        self.terminal_event.is_some()
    }

    /// Tag `payload` with this session's next sequence number.
    pub(crate) fn stamp(&mut self, payload: EventPayload) -> Frame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Frame {
            session_id: self.id,
            sequence,
            payload,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: self.state,
            dimensions: self.dimensions,
            title: self.title.clone(),
            command: self.command.clone(),
            pid: self.pid,
            exit_code: self.exit_code,
            scrollback_entries: self.scrollback.len(),
            pending_input: self.pending_input(),
        }
    }
}
