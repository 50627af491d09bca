//! Writes replies and Control Channel frames to stdout.
//!
//! The pump is the only writer of stdout, so every line is a whole JSON
//! object. Frames go out in the order the multiplexer sent them.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use stellar_pty::{ControlReceiver, GapDetector};

use crate::ipc::{Outbound, Reply};

/// Start the pump as a tokio task. It finishes once both the Control
/// Channel and the reply channel are closed, or stdout is gone.
pub fn start_event_pump(
    control_rx: ControlReceiver,
    reply_rx: mpsc::Receiver<Reply>,
) -> JoinHandle<()> {
    tokio::spawn(pump(control_rx, reply_rx, tokio::io::stdout()))
}

async fn pump<W: AsyncWrite + Unpin>(
    mut control_rx: ControlReceiver,
    mut reply_rx: mpsc::Receiver<Reply>,
    mut out: W,
) {
    let mut gaps = GapDetector::new();
    let mut control_open = true;
    let mut replies_open = true;

    while control_open || replies_open {
        let message = tokio::select! {
            frame = control_rx.recv(), if control_open => match frame {
                Some(frame) => {
                    if let Err(gap) = gaps.observe(&frame) {
                        log::error!(
                            "session {}: sequence gap, expected {} got {}",
                            gap.session_id,
                            gap.expected,
                            gap.received
                        );
                    }
                    Outbound::Event(frame)
                }
                None => {
                    control_open = false;
                    continue;
                }
            },
            reply = reply_rx.recv(), if replies_open => match reply {
                Some(reply) => Outbound::Reply(reply),
                None => {
                    replies_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = write_line(&mut out, &message).await {
            log::warn!("stdout write failed, stopping output: {e}");
            return;
        }
    }
    log::debug!("event pump stopped");
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, message: &Outbound) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}
