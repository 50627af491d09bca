//! Readiness notifications driving the multiplexer.
//!
//! PTY I/O threads, the registry and tests all report "something happened
//! on session N" through [`Notify`]. The multiplexer only ever consumes
//! [`ReadinessSource::wait`], so its scheduling can be exercised with a
//! hand-fed source instead of real PTYs.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use bitflags::bitflags;

use crate::session::SessionId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Output is waiting in the session's output ring.
        const READABLE = 0b0000_0001;
        /// The write endpoint can take more input.
        const WRITABLE = 0b0000_0010;
        /// The output stream ended.
        const HANGUP   = 0b0000_0100;
        /// An endpoint failed.
        const ERROR    = 0b0000_1000;
        /// A lifecycle request (close, resize) is pending.
        const CONTROL  = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub session: SessionId,
    pub interest: Interest,
}

/// Producer side of readiness.
pub trait Notify: Send + Sync {
    fn notify(&self, session: SessionId, interest: Interest);
}

/// Consumer side of readiness. The multiplexer's only suspension point.
pub trait ReadinessSource: Send {
    /// Wait up to `timeout` for at least one notification, then return
    /// everything pending, coalesced per session in first-seen order.
    /// An empty result means the timeout elapsed.
    fn wait(&mut self, timeout: Duration) -> Vec<Readiness>;
}

/// Fold raw notifications into one entry per session.
pub(crate) fn coalesce(raw: impl IntoIterator<Item = Readiness>) -> Vec<Readiness> {
    let mut order: Vec<Readiness> = Vec::new();
    let mut index: HashMap<SessionId, usize> = HashMap::new();
    for r in raw {
        match index.get(&r.session) {
            Some(&i) => order[i].interest |= r.interest,
            None => {
                index.insert(r.session, order.len());
                order.push(r);
            }
        }
    }
    order
}

/// Channel-backed readiness for native PTYs.
pub struct ChannelReadiness {
    rx: Receiver<Readiness>,
}

#[derive(Clone)]
pub struct ChannelNotifier {
    tx: Sender<Readiness>,
}

impl ChannelReadiness {
    pub fn new() -> (Self, ChannelNotifier) {
        let (tx, rx) = mpsc::channel();
        (Self { rx }, ChannelNotifier { tx })
    }
}

impl ReadinessSource for ChannelReadiness {
    fn wait(&mut self, timeout: Duration) -> Vec<Readiness> {
        let first = if timeout.is_zero() {
            match self.rx.try_recv() {
                Ok(r) => r,
                Err(_) => return Vec::new(),
            }
        } else {
            match self.rx.recv_timeout(timeout) {
                Ok(r) => r,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Vec::new()
                }
            }
        };

        let mut raw = vec![first];
        raw.extend(self.rx.try_iter());
        coalesce(raw)
    }
}

impl Notify for ChannelNotifier {
    fn notify(&self, session: SessionId, interest: Interest) {
        // The multiplexer is gone when this fails; nothing left to wake.
        let _ = self.tx.send(Readiness { session, interest });
    }
}
