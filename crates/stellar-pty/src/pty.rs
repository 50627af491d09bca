use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty};
use serde::{Deserialize, Serialize};

use crate::error::{PtyError, SpawnError};
use crate::readiness::{Interest, Notify};
use crate::ring::{OverflowPolicy, RingBuffer};
use crate::session::SessionId;
use crate::size::Dimensions;

/// What to run inside a new PTY.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Argument vector. Empty means the user's default shell.
    pub argv: Vec<String>,
    /// Environment overrides, applied verbatim on top of the inherited env.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub dimensions: Dimensions,
}

impl SpawnSpec {
    pub fn new(argv: Vec<String>, dimensions: Dimensions) -> Self {
        Self {
            argv,
            dimensions,
            ..Self::default()
        }
    }

    /// Program that will be executed, resolving the default shell.
    pub fn program(&self) -> String {
        self.argv.first().cloned().unwrap_or_else(default_shell)
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.program());
        if self.argv.len() > 1 {
            cmd.args(&self.argv[1..]);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// State of one direction of a PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Open,
    Closed,
}

/// Result of a non-blocking read from a PTY's output sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing buffered right now.
    Empty,
    /// The process closed its side of the PTY.
    Eof,
    /// The read endpoint failed.
    Failed(String),
}

/// A spawned process attached to a pseudo-terminal.
///
/// Every method is non-blocking; the multiplexer calls them while holding
/// the session lock.
pub trait Pty: Send {
    fn process_id(&self) -> Option<u32>;

    /// Next chunk of output, at most `max` bytes.
    fn read_chunk(&mut self, max: usize) -> ReadOutcome;

    /// Queue input. Returns the number of bytes accepted, `0` when the write
    /// endpoint is busy.
    fn write(&mut self, data: &[u8]) -> Result<usize, PtyError>;

    fn resize(&mut self, dimensions: Dimensions) -> Result<(), PtyError>;

    /// Close the write endpoint. The process sees no more input.
    fn close_input(&mut self);

    /// Forcibly end the process.
    fn terminate(&mut self) -> Result<(), PtyError>;

    /// Exit code, once the process has exited.
    fn try_wait(&mut self) -> Option<u32>;

    /// A failure reported asynchronously by the write endpoint.
    fn take_write_failure(&mut self) -> Option<String>;

    fn read_endpoint(&self) -> Endpoint;

    fn write_endpoint(&self) -> Endpoint;
}

/// Creates [`Pty`] instances for the registry.
pub trait PtySpawner: Send + Sync {
    fn spawn(
        &self,
        id: SessionId,
        spec: &SpawnSpec,
        notify: Arc<dyn Notify>,
    ) -> Result<Box<dyn Pty>, SpawnError>;
}

/// Tunables for native PTY I/O threads.
#[derive(Debug, Clone, Copy)]
pub struct NativeSpawner {
    pub output_capacity: usize,
    pub output_push_wait: Duration,
    pub read_chunk_size: usize,
    pub input_queue_depth: usize,
}

impl Default for NativeSpawner {
    fn default() -> Self {
        Self {
            output_capacity: 64 * 1024,
            output_push_wait: Duration::from_millis(50),
            read_chunk_size: 4096,
            input_queue_depth: 16,
        }
    }
}

impl PtySpawner for NativeSpawner {
    fn spawn(
        &self,
        id: SessionId,
        spec: &SpawnSpec,
        notify: Arc<dyn Notify>,
    ) -> Result<Box<dyn Pty>, SpawnError> {
        Ok(Box::new(PtyHandle::spawn(id, spec, self, notify)?))
    }
}

#[derive(Debug, Clone)]
enum StreamEnd {
    Eof,
    Failed(String),
}

/// Owns a portable-pty child process and master, plus the reader and
/// writer threads that move bytes between the master and the session.
pub struct PtyHandle {
    id: SessionId,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    output: RingBuffer,
    stream_end: Arc<Mutex<Option<StreamEnd>>>,
    input_tx: Option<SyncSender<Vec<u8>>>,
    write_failure: Arc<Mutex<Option<String>>>,
    exit_code: Option<u32>,
}

impl PtyHandle {
    /// Spawn `spec` in a new PTY and start its I/O threads.
    pub fn spawn(
        id: SessionId,
        spec: &SpawnSpec,
        tuning: &NativeSpawner,
        notify: Arc<dyn Notify>,
    ) -> Result<Self, SpawnError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(spec.dimensions.to_pty_size())
            .map_err(|e| SpawnError::classify("failed to open PTY", &*e))?;

        let child = pair
            .slave
            .spawn_command(spec.command())
            .map_err(|e| SpawnError::classify("failed to spawn command", &*e))?;
        // Keeping the slave open here would hide the child's hangup from the reader.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::classify("failed to clone reader", &*e))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::classify("failed to take writer", &*e))?;

        let output = RingBuffer::new(
            tuning.output_capacity,
            OverflowPolicy::Block {
                max_wait: tuning.output_push_wait,
            },
        );
        let stream_end = Arc::new(Mutex::new(None));
        let write_failure = Arc::new(Mutex::new(None));
        let (input_tx, input_rx) = mpsc::sync_channel(tuning.input_queue_depth.max(1));

        let mut handle = Self {
            id,
            master: pair.master,
            child,
            output: output.clone(),
            stream_end: Arc::clone(&stream_end),
            input_tx: Some(input_tx),
            write_failure: Arc::clone(&write_failure),
            exit_code: None,
        };

        let read_chunk = tuning.read_chunk_size.max(1);
        let read_notify = Arc::clone(&notify);
        if let Err(e) = thread::Builder::new()
            .name(format!("pty-read-{id}"))
            .spawn(move || read_loop(id, reader, output, stream_end, read_notify, read_chunk))
        {
            let _ = handle.terminate();
            return Err(SpawnError::from_io("failed to start reader thread", &e));
        }

        if let Err(e) = thread::Builder::new()
            .name(format!("pty-write-{id}"))
            .spawn(move || write_loop(id, writer, input_rx, write_failure, notify))
        {
            let _ = handle.terminate();
            return Err(SpawnError::from_io("failed to start writer thread", &e));
        }

        log::info!(
            "session {id}: spawned {} (pid {:?}) at {}x{}",
            spec.program(),
            handle.child.process_id(),
            spec.dimensions.cols,
            spec.dimensions.rows
        );

        Ok(handle)
    }

    fn end_of_stream(&self) -> Option<StreamEnd> {
        self.stream_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Pty for PtyHandle {
    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn read_chunk(&mut self, max: usize) -> ReadOutcome {
        let data = self.output.pop(max);
        if !data.is_empty() {
            return ReadOutcome::Data(data);
        }
        if !self.output.is_finished() {
            return ReadOutcome::Empty;
        }
        match self.end_of_stream() {
            Some(StreamEnd::Failed(message)) => ReadOutcome::Failed(message),
            // Ring closed without a recorded cause: the handle itself shut it.
            Some(StreamEnd::Eof) | None => ReadOutcome::Eof,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if data.is_empty() {
            return Ok(0);
        }
        let Some(tx) = &self.input_tx else {
            return Err(PtyError::WriteClosed);
        };
        match tx.try_send(data.to_vec()) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Disconnected(_)) => {
                self.input_tx = None;
                Err(PtyError::WriteClosed)
            }
        }
    }

    fn resize(&mut self, dimensions: Dimensions) -> Result<(), PtyError> {
        self.master
            .resize(dimensions.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    fn close_input(&mut self) {
        self.input_tx = None;
    }

    fn terminate(&mut self) -> Result<(), PtyError> {
        self.close_input();
        if self.try_wait().is_some() {
            return Ok(());
        }
        log::debug!("session {}: terminating pid {:?}", self.id, self.child.process_id());
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped between try_wait and kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(PtyError::TerminateFailed(e.to_string())),
        }
    }

    fn try_wait(&mut self) -> Option<u32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.exit_code());
            }
        }
        self.exit_code
    }

    fn take_write_failure(&mut self) -> Option<String> {
        self.write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn read_endpoint(&self) -> Endpoint {
        if self.output.is_closed() {
            Endpoint::Closed
        } else {
            Endpoint::Open
        }
    }

    fn write_endpoint(&self) -> Endpoint {
        if self.input_tx.is_some() {
            Endpoint::Open
        } else {
            Endpoint::Closed
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.output.close();
        self.input_tx = None;
        if self.try_wait().is_none() {
            let _ = self.child.kill();
        }
    }
}

/// A master read fails with EIO once the slave side has hung up.
#[cfg(unix)]
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(_err: &io::Error) -> bool {
    false
}

/// Blocking PTY reads on a dedicated thread. A full output ring parks this
/// loop, which stops draining the PTY and throttles the process.
fn read_loop(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output: RingBuffer,
    stream_end: Arc<Mutex<Option<StreamEnd>>>,
    notify: Arc<dyn Notify>,
    chunk: usize,
) {
    let mut buf = vec![0u8; chunk];

    let end = loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break StreamEnd::Eof,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_hangup(&e) => break StreamEnd::Eof,
            Err(e) => break StreamEnd::Failed(e.to_string()),
        };

        let mut offset = 0;
        while offset < n {
            offset += output.push(&buf[offset..n]);
            notify.notify(id, Interest::READABLE);
            if output.is_closed() {
                log::debug!("session {id}: output ring closed, reader exiting");
                return;
            }
        }
    };

    log::debug!("session {id}: output stream ended: {end:?}");
    *stream_end.lock().unwrap_or_else(PoisonError::into_inner) = Some(end);
    output.close();
    notify.notify(id, Interest::HANGUP);
}

/// Blocking PTY writes on a dedicated thread, fed through a bounded queue.
fn write_loop(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    input: Receiver<Vec<u8>>,
    failure: Arc<Mutex<Option<String>>>,
    notify: Arc<dyn Notify>,
) {
    while let Ok(data) = input.recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            log::warn!("session {id}: PTY write failed: {e}");
            *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            notify.notify(id, Interest::ERROR);
            return;
        }
        notify.notify(id, Interest::WRITABLE);
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
pub(crate) fn get_default_shell() -> String {
    default_shell()
}
