//! In-process stand-ins for PTYs and readiness, used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{PtyError, SpawnError};
use crate::pty::{Endpoint, Pty, PtySpawner, ReadOutcome, SpawnSpec};
use crate::readiness::{coalesce, Interest, Notify, Readiness, ReadinessSource};
use crate::session::SessionId;
use crate::size::Dimensions;

struct FakeState {
    output: VecDeque<Vec<u8>>,
    hangup: bool,
    read_failure: Option<String>,
    exit_code: Option<u32>,
    exit_on_terminate: bool,
    echo: bool,
    written: Vec<u8>,
    write_budget: usize,
    write_failure: Option<String>,
    input_closed: bool,
    resize_failure: Option<String>,
    last_resize: Option<Dimensions>,
    terminations: usize,
    drops: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            output: VecDeque::new(),
            hangup: false,
            read_failure: None,
            exit_code: None,
            exit_on_terminate: true,
            echo: false,
            written: Vec::new(),
            write_budget: usize::MAX,
            write_failure: None,
            input_closed: false,
            resize_failure: None,
            last_resize: None,
            terminations: 0,
            drops: 0,
        }
    }
}

type Wake = Option<(SessionId, Arc<dyn Notify>)>;

/// A scripted PTY. Its output, exit and failures are driven through the
/// paired [`FakeProbe`].
pub struct FakePty {
    state: Arc<Mutex<FakeState>>,
    wake: Wake,
}

/// Test-side control over a [`FakePty`].
#[derive(Clone)]
pub struct FakeProbe {
    state: Arc<Mutex<FakeState>>,
    wake: Wake,
}

impl FakePty {
    pub fn new() -> (FakePty, FakeProbe) {
        Self::with_wake(None)
    }

    fn with_wake(wake: Wake) -> (FakePty, FakeProbe) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            FakePty {
                state: Arc::clone(&state),
                wake: wake.clone(),
            },
            FakeProbe { state, wake },
        )
    }

    fn wake(&self, interest: Interest) {
        if let Some((id, notify)) = &self.wake {
            notify.notify(*id, interest);
        }
    }
}

impl Pty for FakePty {
    fn process_id(&self) -> Option<u32> {
        Some(4242)
    }

    fn read_chunk(&mut self, max: usize) -> ReadOutcome {
        let mut state = self.state.lock().unwrap();
        if let Some(mut chunk) = state.output.pop_front() {
            if chunk.len() > max {
                let rest = chunk.split_off(max);
                state.output.push_front(rest);
            }
            return ReadOutcome::Data(chunk);
        }
        if let Some(message) = state.read_failure.clone() {
            return ReadOutcome::Failed(message);
        }
        if state.hangup {
            return ReadOutcome::Eof;
        }
        ReadOutcome::Empty
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        let mut state = self.state.lock().unwrap();
        if state.input_closed {
            return Err(PtyError::WriteClosed);
        }
        let n = data.len().min(state.write_budget);
        state.write_budget -= n;
        state.written.extend_from_slice(&data[..n]);
        let echoed = state.echo && n > 0;
        if echoed {
            state.output.push_back(data[..n].to_vec());
        }
        drop(state);
        if echoed {
            self.wake(Interest::READABLE);
        }
        Ok(n)
    }

    fn resize(&mut self, dimensions: Dimensions) -> Result<(), PtyError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.resize_failure.clone() {
            return Err(PtyError::ResizeFailed(message));
        }
        state.last_resize = Some(dimensions);
        Ok(())
    }

    fn close_input(&mut self) {
        self.state.lock().unwrap().input_closed = true;
    }

    fn terminate(&mut self) -> Result<(), PtyError> {
        let mut state = self.state.lock().unwrap();
        state.terminations += 1;
        state.input_closed = true;
        // Killed by signal: the stream ends but there is no exit code.
        if state.exit_on_terminate {
            state.hangup = true;
        }
        drop(state);
        self.wake(Interest::HANGUP);
        Ok(())
    }

    fn try_wait(&mut self) -> Option<u32> {
        self.state.lock().unwrap().exit_code
    }

    fn take_write_failure(&mut self) -> Option<String> {
        self.state.lock().unwrap().write_failure.take()
    }

    fn read_endpoint(&self) -> Endpoint {
        let state = self.state.lock().unwrap();
        if state.hangup && state.output.is_empty() {
            Endpoint::Closed
        } else {
            Endpoint::Open
        }
    }

    fn write_endpoint(&self) -> Endpoint {
        if self.state.lock().unwrap().input_closed {
            Endpoint::Closed
        } else {
            Endpoint::Open
        }
    }
}

impl Drop for FakePty {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.drops += 1;
        }
    }
}

impl FakeProbe {
    fn wake(&self, interest: Interest) {
        if let Some((id, notify)) = &self.wake {
            notify.notify(*id, interest);
        }
    }

    /// Produce output, as the process writing to its terminal.
    pub fn emit(&self, data: &[u8]) {
        self.state.lock().unwrap().output.push_back(data.to_vec());
        self.wake(Interest::READABLE);
    }

    /// End the output stream.
    pub fn hangup(&self) {
        self.state.lock().unwrap().hangup = true;
        self.wake(Interest::HANGUP);
    }

    /// Mark the process as exited. Does not end the output stream.
    pub fn exit(&self, code: u32) {
        self.state.lock().unwrap().exit_code = Some(code);
    }

    pub fn fail_read(&self, message: &str) {
        self.state.lock().unwrap().read_failure = Some(message.to_string());
        self.wake(Interest::ERROR);
    }

    pub fn fail_write(&self, message: &str) {
        self.state.lock().unwrap().write_failure = Some(message.to_string());
        self.wake(Interest::ERROR);
    }

    pub fn fail_resize(&self, message: &str) {
        self.state.lock().unwrap().resize_failure = Some(message.to_string());
    }

    pub fn set_echo(&self, echo: bool) {
        self.state.lock().unwrap().echo = echo;
    }

    pub fn set_exit_on_terminate(&self, exit: bool) {
        self.state.lock().unwrap().exit_on_terminate = exit;
    }

    pub fn set_write_budget(&self, budget: usize) {
        self.state.lock().unwrap().write_budget = budget;
        self.wake(Interest::WRITABLE);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn input_closed(&self) -> bool {
        self.state.lock().unwrap().input_closed
    }

    pub fn last_resize(&self) -> Option<Dimensions> {
        self.state.lock().unwrap().last_resize
    }

    pub fn terminations(&self) -> usize {
        self.state.lock().unwrap().terminations
    }

    pub fn drops(&self) -> usize {
        self.state.lock().unwrap().drops
    }
}

/// Spawns [`FakePty`]s and keeps their probes by session id.
#[derive(Default)]
pub struct FakeSpawner {
    probes: Mutex<HashMap<SessionId, FakeProbe>>,
    fail_with: Mutex<Option<String>>,
    spawn_delay: Option<Duration>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following spawn fails with `SpawnError::NotFound`.
    pub fn fail_spawns(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    pub fn probe(&self, id: SessionId) -> FakeProbe {
        self.probes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("no fake PTY spawned for this session")
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(
        &self,
        id: SessionId,
        _spec: &SpawnSpec,
        notify: Arc<dyn Notify>,
    ) -> Result<Box<dyn Pty>, SpawnError> {
        if let Some(delay) = self.spawn_delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(SpawnError::NotFound(message));
        }
        let (pty, probe) = FakePty::with_wake(Some((id, notify)));
        self.probes.lock().unwrap().insert(id, probe);
        Ok(Box::new(pty))
    }
}

/// Readiness fed by hand. `wait` never sleeps.
#[derive(Clone, Default)]
pub struct ManualReadiness {
    queue: Arc<Mutex<VecDeque<Readiness>>>,
}

impl ManualReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl ReadinessSource for ManualReadiness {
    fn wait(&mut self, _timeout: Duration) -> Vec<Readiness> {
        let raw: Vec<Readiness> = self.queue.lock().unwrap().drain(..).collect();
        coalesce(raw)
    }
}

impl Notify for ManualReadiness {
    fn notify(&self, session: SessionId, interest: Interest) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Readiness { session, interest });
    }
}
