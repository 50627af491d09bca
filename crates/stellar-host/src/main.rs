mod commands;
mod config;
mod event_pump;
mod input_thread;
mod ipc;
mod state;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use tokio::sync::mpsc;

use stellar_pty::{control_channel, ChannelReadiness, Multiplexer, MuxConfig, Registry};

use config::Args;
use state::AppState;

/// Replies buffered ahead of the stdout writer.
const REPLY_QUEUE_DEPTH: usize = 64;

/// Extra time allowed past the close grace and exit linger at shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let db = open_db(args.db.as_deref())?;
    config::seed_settings(&db).context("failed to seed settings")?;
    let mux_config = args.apply(config::load_config(&db));
    log::debug!("session config: {mux_config:?}");

    let (readiness, notifier) = ChannelReadiness::new();
    let registry = Arc::new(Registry::new(
        Arc::new(mux_config.native_spawner()),
        Arc::new(notifier),
        mux_config.clone(),
    ));
    let (control_tx, control_rx) = control_channel(mux_config.control_capacity);
    let mux = Multiplexer::new(Arc::clone(&registry), readiness, control_tx)
        .spawn()
        .context("failed to start multiplexer thread")?;

    let state = Arc::new(AppState::new(Arc::clone(&registry), db));
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
    let pump = event_pump::start_event_pump(control_rx, reply_rx);
    let lines = input_thread::start_input_thread().context("failed to start stdin reader")?;

    log::info!("stellar ready");
    commands::serve(Arc::clone(&state), lines, reply_tx).await;

    log::info!("input closed, shutting down {} sessions", registry.len());
    drain_sessions(&registry, &mux_config).await;
    tokio::task::spawn_blocking(move || mux.stop())
        .await
        .context("multiplexer shutdown failed")?;
    pump.await.context("event pump failed")?;
    Ok(())
}

/// Logs go to stderr; stdout carries the protocol.
fn init_logging() {
    let var = if std::env::var_os("STELLAR_LOG").is_some() {
        "STELLAR_LOG"
    } else {
        "RUST_LOG"
    };
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(var, "warn"))
        .target(env_logger::Target::Stderr)
        .init();
}

fn open_db(path: Option<&Path>) -> anyhow::Result<Connection> {
    match path {
        Some(path) if path != Path::new(":memory:") => stellar_db::open(path)
            .with_context(|| format!("failed to open database {}", path.display())),
        Some(_) => stellar_db::open_in_memory().context("failed to open in-memory database"),
        None => {
            let path = default_db_path()?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            stellar_db::open(&path)
                .with_context(|| format!("failed to open database {}", path.display()))
        }
    }
}

/// `~/.stellar/stellar.db`.
fn default_db_path() -> anyhow::Result<std::path::PathBuf> {
    let home = std::env::var_os("HOME").context("could not determine home directory")?;
    Ok(Path::new(&home).join(".stellar").join("stellar.db"))
}

/// Ask every session to close and wait until their terminal events went out.
async fn drain_sessions(registry: &Registry, config: &MuxConfig) {
    registry.close_all();
    let deadline = Instant::now() + config.close_grace() + config.exit_linger() + SHUTDOWN_SLACK;
    while !registry.is_empty() {
        if Instant::now() >= deadline {
            log::warn!("{} sessions still open at shutdown", registry.len());
            break;
        }
        tokio::time::sleep(config.tick()).await;
    }
}
