use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::NativeSpawner;
use crate::scrollback::{EvictionGranularity, DEFAULT_MAX_LINE_BYTES};

pub const DEFAULT_SCROLLBACK_CAPACITY: usize = 4_000;
pub const MAX_SCROLLBACK_CAPACITY: usize = 128_000;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Tunables for the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Scrollback entries kept per session.
    pub scrollback_capacity: usize,
    pub eviction: EvictionGranularity,
    /// Longest scrollback line under `Lines` eviction before it is split.
    pub max_line_bytes: usize,
    /// Bytes buffered between a PTY's reader thread and the multiplexer.
    pub output_buffer_capacity: usize,
    /// How long a reader thread parks on a full output buffer before
    /// retrying.
    pub output_push_wait_ms: u64,
    /// Bytes of not-yet-flushed input per session before `write` reports
    /// backpressure.
    pub pending_write_limit: usize,
    pub read_chunk_size: usize,
    /// Output chunks forwarded per session per turn.
    pub max_chunks_per_turn: usize,
    /// Input chunks queued to a PTY's writer thread.
    pub input_queue_depth: usize,
    pub close_grace_ms: u64,
    /// How long to wait for an exit status once output has ended, or for
    /// output to end once the process has exited.
    pub exit_linger_ms: u64,
    pub tick_ms: u64,
    /// Frames buffered on the Control Channel.
    pub control_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            scrollback_capacity: DEFAULT_SCROLLBACK_CAPACITY,
            eviction: EvictionGranularity::Chunks,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            output_buffer_capacity: 64 * 1024,
            output_push_wait_ms: 50,
            pending_write_limit: 64 * 1024,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_chunks_per_turn: 8,
            input_queue_depth: 16,
            close_grace_ms: 500,
            exit_linger_ms: 250,
            tick_ms: 50,
            control_capacity: 1024,
        }
    }
}

impl MuxConfig {
    /// Clamp every value into a usable range.
    pub fn normalized(self) -> Self {
        Self {
            scrollback_capacity: self.scrollback_capacity.clamp(1, MAX_SCROLLBACK_CAPACITY),
            eviction: self.eviction,
            max_line_bytes: self.max_line_bytes.max(1),
            output_buffer_capacity: self.output_buffer_capacity.max(1),
            output_push_wait_ms: self.output_push_wait_ms.max(1),
            pending_write_limit: self.pending_write_limit.max(1),
            read_chunk_size: self.read_chunk_size.max(1),
            max_chunks_per_turn: self.max_chunks_per_turn.max(1),
            input_queue_depth: self.input_queue_depth.max(1),
            close_grace_ms: self.close_grace_ms,
            exit_linger_ms: self.exit_linger_ms,
            tick_ms: self.tick_ms.max(1),
            control_capacity: self.control_capacity.max(1),
        }
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn exit_linger(&self) -> Duration {
        Duration::from_millis(self.exit_linger_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// PTY I/O thread tuning derived from this config.
    pub fn native_spawner(&self) -> NativeSpawner {
        NativeSpawner {
            output_capacity: self.output_buffer_capacity,
            output_push_wait: Duration::from_millis(self.output_push_wait_ms),
            read_chunk_size: self.read_chunk_size,
            input_queue_depth: self.input_queue_depth,
        }
    }
}
