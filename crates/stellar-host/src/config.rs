//! Host configuration: settings persisted in SQLite, overridden by flags.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use rusqlite::Connection;
use stellar_db::settings;
use stellar_pty::{EvictionGranularity, MuxConfig};

pub const SETTING_SCROLLBACK_CAPACITY: &str = "scrollback_capacity";
pub const SETTING_SCROLLBACK_EVICTION: &str = "scrollback_eviction";
pub const SETTING_MAX_LINE_BYTES: &str = "scrollback_max_line_bytes";
pub const SETTING_OUTPUT_BUFFER_CAPACITY: &str = "output_buffer_capacity";
pub const SETTING_OUTPUT_PUSH_WAIT_MS: &str = "output_push_wait_ms";
pub const SETTING_PENDING_WRITE_LIMIT: &str = "pending_write_limit";
pub const SETTING_READ_CHUNK_SIZE: &str = "read_chunk_size";
pub const SETTING_MAX_CHUNKS_PER_TURN: &str = "max_chunks_per_turn";
pub const SETTING_INPUT_QUEUE_DEPTH: &str = "input_queue_depth";
pub const SETTING_CLOSE_GRACE_MS: &str = "close_grace_ms";
pub const SETTING_EXIT_LINGER_MS: &str = "exit_linger_ms";
pub const SETTING_TICK_MS: &str = "tick_ms";
pub const SETTING_CONTROL_CAPACITY: &str = "control_capacity";

/// PTY session host speaking JSON lines on stdin/stdout.
#[derive(Parser, Debug, Clone)]
#[command(name = "stellar", version, about)]
pub struct Args {
    /// SQLite database holding settings and snapshots. `:memory:` keeps
    /// nothing between runs.
    #[arg(long, env = "STELLAR_DB")]
    pub db: Option<PathBuf>,

    /// Scrollback entries kept per session.
    #[arg(long)]
    pub scrollback: Option<usize>,

    /// Scrollback eviction unit: `chunks` or `lines`.
    #[arg(long)]
    pub eviction: Option<EvictionGranularity>,

    /// Milliseconds a closing session gets to exit before it is killed.
    #[arg(long)]
    pub close_grace_ms: Option<u64>,

    /// Multiplexer tick in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,
}

impl Args {
    /// Apply command-line overrides on top of `config`.
    pub fn apply(&self, mut config: MuxConfig) -> MuxConfig {
        if let Some(capacity) = self.scrollback {
            config.scrollback_capacity = capacity;
        }
        if let Some(eviction) = self.eviction {
            config.eviction = eviction;
        }
        if let Some(grace) = self.close_grace_ms {
            config.close_grace_ms = grace;
        }
        if let Some(tick) = self.tick_ms {
            config.tick_ms = tick;
        }
        config.normalized()
    }
}

/// Every persisted setting and its default value.
fn defaults() -> Vec<(&'static str, String)> {
    let d = MuxConfig::default();
    vec![
        (SETTING_SCROLLBACK_CAPACITY, d.scrollback_capacity.to_string()),
        (SETTING_SCROLLBACK_EVICTION, d.eviction.to_string()),
        (SETTING_MAX_LINE_BYTES, d.max_line_bytes.to_string()),
        (SETTING_OUTPUT_BUFFER_CAPACITY, d.output_buffer_capacity.to_string()),
        (SETTING_OUTPUT_PUSH_WAIT_MS, d.output_push_wait_ms.to_string()),
        (SETTING_PENDING_WRITE_LIMIT, d.pending_write_limit.to_string()),
        (SETTING_READ_CHUNK_SIZE, d.read_chunk_size.to_string()),
        (SETTING_MAX_CHUNKS_PER_TURN, d.max_chunks_per_turn.to_string()),
        (SETTING_INPUT_QUEUE_DEPTH, d.input_queue_depth.to_string()),
        (SETTING_CLOSE_GRACE_MS, d.close_grace_ms.to_string()),
        (SETTING_EXIT_LINGER_MS, d.exit_linger_ms.to_string()),
        (SETTING_TICK_MS, d.tick_ms.to_string()),
        (SETTING_CONTROL_CAPACITY, d.control_capacity.to_string()),
    ]
}

/// Write default settings for any key not yet present.
pub fn seed_settings(conn: &Connection) -> rusqlite::Result<()> {
    for (key, value) in defaults() {
        if settings::set_default(conn, key, &value)? {
            log::debug!("seeded setting {key}={value}");
        }
    }
    Ok(())
}

/// Read one setting, falling back to `default` when missing or unparsable.
fn read<T: FromStr>(conn: &Connection, key: &str, default: T) -> T {
    match settings::get(conn, key) {
        Ok(Some(raw)) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring invalid setting {key}={raw:?}");
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            log::warn!("failed to read setting {key}: {e}");
            default
        }
    }
}

/// Build the session layer config from the settings table.
pub fn load_config(conn: &Connection) -> MuxConfig {
    let d = MuxConfig::default();
    MuxConfig {
        scrollback_capacity: read(conn, SETTING_SCROLLBACK_CAPACITY, d.scrollback_capacity),
        eviction: read(conn, SETTING_SCROLLBACK_EVICTION, d.eviction),
        max_line_bytes: read(conn, SETTING_MAX_LINE_BYTES, d.max_line_bytes),
        output_buffer_capacity: read(conn, SETTING_OUTPUT_BUFFER_CAPACITY, d.output_buffer_capacity),
        output_push_wait_ms: read(conn, SETTING_OUTPUT_PUSH_WAIT_MS, d.output_push_wait_ms),
        pending_write_limit: read(conn, SETTING_PENDING_WRITE_LIMIT, d.pending_write_limit),
        read_chunk_size: read(conn, SETTING_READ_CHUNK_SIZE, d.read_chunk_size),
        max_chunks_per_turn: read(conn, SETTING_MAX_CHUNKS_PER_TURN, d.max_chunks_per_turn),
        input_queue_depth: read(conn, SETTING_INPUT_QUEUE_DEPTH, d.input_queue_depth),
        close_grace_ms: read(conn, SETTING_CLOSE_GRACE_MS, d.close_grace_ms),
        exit_linger_ms: read(conn, SETTING_EXIT_LINGER_MS, d.exit_linger_ms),
        tick_ms: read(conn, SETTING_TICK_MS, d.tick_ms),
        control_capacity: read(conn, SETTING_CONTROL_CAPACITY, d.control_capacity),
    }
    .normalized()
}
