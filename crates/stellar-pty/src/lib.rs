//! stellar-pty: PTY session multiplexing for Stellar.
//!
//! This crate owns every shell process the terminal runs. It spawns them on
//! pseudo-terminals, moves their bytes onto a single ordered Control Channel,
//! and guarantees each session ends with exactly one terminal event.
//!
//! # Architecture
//!
//! - [`Registry`]: Session table and the operations the UI calls (open,
//!   write, resize, close, list). Safe to call from any thread.
//! - [`Multiplexer`]: The event loop. Drains PTY output into [`Frame`]s,
//!   flushes queued input, and settles session lifecycles.
//! - [`PtyHandle`]: A native PTY with dedicated reader and writer threads.
//! - [`Session`]: Lifecycle state machine, pending input, and scrollback.
//! - [`RingBuffer`] / [`Scrollback`]: Bounded byte and chunk buffers.

pub mod config;
pub mod error;
pub mod frame;
pub mod multiplexer;
pub mod pty;
pub mod readiness;
pub mod registry;
pub mod ring;
pub mod scrollback;
pub mod session;
pub mod size;

#[cfg(test)]
pub(crate) mod testing;

pub use config::MuxConfig;
pub use error::{PtyError, RegistryError, SpawnError, TransitionError};
pub use frame::{control_channel, ControlReceiver, ControlSender, EventPayload, Frame, FrameKind, Gap, GapDetector};
pub use multiplexer::{Multiplexer, MultiplexerHandle, TurnStats};
pub use pty::{NativeSpawner, Pty, PtyHandle, PtySpawner, SpawnSpec};
pub use readiness::{ChannelNotifier, ChannelReadiness, Interest, Notify, Readiness, ReadinessSource};
pub use registry::Registry;
pub use ring::{OverflowPolicy, RingBuffer};
pub use scrollback::{EvictionGranularity, Scrollback};
pub use session::{Session, SessionId, SessionState, SessionSummary};
pub use size::Dimensions;
