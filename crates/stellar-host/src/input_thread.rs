//! Stdin reader on a dedicated OS thread.
//!
//! Reads from stdin block, so they run outside the tokio runtime. Lines are
//! bridged into the runtime with `blocking_send`; the channel closes when
//! stdin reaches EOF, which is the host's signal to shut down.

use std::io::{self, BufRead};

use tokio::sync::mpsc;

/// Lines buffered between the reader thread and the request loop.
const LINE_QUEUE_DEPTH: usize = 256;

pub fn start_input_thread() -> io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(LINE_QUEUE_DEPTH);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || read_lines(io::stdin().lock(), tx))?;
    Ok(rx)
}

fn read_lines(input: impl BufRead, tx: mpsc::Sender<String>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("stdin read failed: {e}");
                break;
            }
        };
        if tx.blocking_send(line).is_err() {
            break;
        }
    }
    log::debug!("stdin closed");
}
