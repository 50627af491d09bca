//! The event loop that moves bytes between sessions and the Control Channel.
//!
//! One multiplexer thread services every session. Each turn it waits on a
//! [`ReadinessSource`], then services ready sessions least-recently-serviced
//! first: forward pending notices, forward up to `max_chunks_per_turn` output
//! chunks, flush queued input, and settle the lifecycle. A session that still
//! has work after its share goes on a backlog that is retried next turn
//! without waiting.
//!
//! Frames are only sequenced once a channel slot is reserved for them, so a
//! slow consumer stalls delivery instead of dropping frames.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::MuxConfig;
use crate::frame::{ChannelState, ControlSender, EventPayload};
use crate::pty::ReadOutcome;
use crate::readiness::ReadinessSource;
use crate::registry::Registry;
use crate::session::{Session, SessionId, SessionState, StreamStatus};

/// How long to wait between retries while the Control Channel is full.
const CONGESTION_BACKOFF: Duration = Duration::from_millis(1);

/// What one turn did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnStats {
    pub serviced: usize,
    pub frames: usize,
    pub retired: usize,
    /// The Control Channel's receiver is gone.
    pub disconnected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Idle,
    /// More work than one turn's share, or the channel was full.
    Busy,
    /// A terminal event is staged.
    Retire,
    Disconnected,
}

enum Retired {
    Gone,
    Pending,
    Disconnected,
}

pub struct Multiplexer<R: ReadinessSource> {
    registry: Arc<Registry>,
    readiness: R,
    control: ControlSender,
    config: MuxConfig,
    last_serviced: HashMap<SessionId, u64>,
    clock: u64,
    backlog: Vec<SessionId>,
    congested: bool,
    last_sweep: Instant,
}

impl<R: ReadinessSource> Multiplexer<R> {
    pub fn new(registry: Arc<Registry>, readiness: R, control: ControlSender) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            readiness,
            control,
            config,
            last_serviced: HashMap::new(),
            clock: 0,
            backlog: Vec::new(),
            congested: false,
            last_sweep: Instant::now(),
        }
    }

    /// Run one iteration of the loop.
    ///
    /// Besides sessions reported ready, every session is swept once per
    /// tick so exits that raise no readiness (a process that ends without
    /// closing its terminal) are still noticed.
    pub fn turn(&mut self) -> TurnStats {
        let timeout = match (self.backlog.is_empty(), self.congested) {
            (true, _) => self.config.tick(),
            (false, true) => CONGESTION_BACKOFF.min(self.config.tick()),
            (false, false) => Duration::ZERO,
        };
        let ready = self.readiness.wait(timeout);

        let mut candidates = std::mem::take(&mut self.backlog);
        candidates.extend(ready.iter().map(|r| r.session));
        if self.last_sweep.elapsed() >= self.config.tick() {
            candidates.extend(self.registry.ids());
            self.last_sweep = Instant::now();
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates.sort_by_key(|id| (self.last_serviced.get(id).copied().unwrap_or(0), *id));

        self.congested = false;
        let mut stats = TurnStats::default();
        for id in candidates {
            self.clock += 1;
            self.last_serviced.insert(id, self.clock);

            let (outcome, frames) = self.service(id);
            stats.serviced += 1;
            stats.frames += frames;

            match outcome {
                Outcome::Idle => {}
                Outcome::Busy => self.backlog.push(id),
                Outcome::Retire => match self.retire(id) {
                    Retired::Gone => {
                        stats.retired += 1;
                        stats.frames += 1;
                        self.last_serviced.remove(&id);
                    }
                    Retired::Pending => {
                        self.congested = true;
                        self.backlog.push(id);
                    }
                    Retired::Disconnected => {
                        stats.disconnected = true;
                        self.last_serviced.remove(&id);
                    }
                },
                Outcome::Disconnected => stats.disconnected = true,
            }
        }
        self.last_serviced
            .retain(|id, _| self.registry.get(*id).is_some());
        stats
    }

    /// Drive turns until `stop_rx` fires or the Control Channel closes.
    pub fn run(mut self, mut stop_rx: mpsc::Receiver<()>) {
        log::debug!("multiplexer started");
        loop {
            match stop_rx.try_recv() {
                Ok(()) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let stats = self.turn();
            if stats.disconnected {
                log::warn!("control channel closed, stopping multiplexer");
                self.registry.close_all();
                break;
            }
        }
        log::debug!("multiplexer stopped");
    }

    fn service(&mut self, id: SessionId) -> (Outcome, usize) {
        let Some(slot) = self.registry.get(id) else {
            return (Outcome::Idle, 0);
        };
        let mut session = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if session.has_terminal_event() {
            return (Outcome::Retire, 0);
        }
        if session.state().is_terminal() {
            return (Outcome::Idle, 0);
        }

        let now = Instant::now();
        let mut frames = 0;
        let mut busy = false;

        while session.has_notices() {
            let permit = match self.control.try_reserve() {
                Ok(permit) => permit,
                Err(ChannelState::Full) => {
                    self.congested = true;
                    busy = true;
                    break;
                }
                Err(ChannelState::Closed) => return (Outcome::Disconnected, frames),
            };
            let Some(notice) = session.next_notice() else {
                break;
            };
            permit.send(session.stamp(notice));
            frames += 1;
        }

        let mut chunks = 0;
        while !busy && session.stream == StreamStatus::Open {
            if chunks == self.config.max_chunks_per_turn {
                busy = true;
                break;
            }
            let permit = match self.control.try_reserve() {
                Ok(permit) => permit,
                Err(ChannelState::Full) => {
                    self.congested = true;
                    busy = true;
                    break;
                }
                Err(ChannelState::Closed) => return (Outcome::Disconnected, frames),
            };
            let Some(pty) = session.pty_mut() else {
                break;
            };
            match pty.read_chunk(self.config.read_chunk_size) {
                ReadOutcome::Data(data) => {
                    session.record_output(&data);
                    permit.send(session.stamp(EventPayload::Output { data }));
                    frames += 1;
                    chunks += 1;
                }
                ReadOutcome::Empty => break,
                ReadOutcome::Eof => {
                    log::debug!("session {id}: output ended");
                    session.stream = StreamStatus::Ended { at: now };
                }
                ReadOutcome::Failed(message) => {
                    log::warn!("session {id}: output failed: {message}");
                    session.stream = StreamStatus::Broken { at: now, message };
                }
            }
        }

        if session.state().accepts_io() {
            if let Err(e) = session.flush_input(self.config.read_chunk_size) {
                log::warn!("session {id}: input failed: {e}");
                session.failure.get_or_insert(e.to_string());
            }
            if let Some(message) = session.pty_mut().and_then(|pty| pty.take_write_failure()) {
                log::warn!("session {id}: input failed: {message}");
                session.failure.get_or_insert(message);
            }
        }

        if let Some((state, event)) = self.settle(&mut session, busy, now) {
            return match session.finish(state, event) {
                Ok(()) => (Outcome::Retire, frames),
                Err(e) => {
                    log::warn!("{e}");
                    (Outcome::Idle, frames)
                }
            };
        }

        if busy {
            (Outcome::Busy, frames)
        } else {
            (Outcome::Idle, frames)
        }
    }

    /// Decide whether the session has reached a terminal state.
    ///
    /// Failures and an expired close grace end the session right away.
    /// Everything else waits until this turn forwarded all it could.
    fn settle(
        &self,
        session: &mut Session,
        busy: bool,
        now: Instant,
    ) -> Option<(SessionState, EventPayload)> {
        let id = session.id();
        if let Some(message) = session.failure.take() {
            terminate(session);
            return Some((SessionState::Failed, EventPayload::Error { message }));
        }

        let closing = session.state() == SessionState::Closing;
        if closing && session.close_deadline.is_some_and(|deadline| now >= deadline) {
            let code = session.pty_mut().and_then(|pty| pty.try_wait());
            if code.is_none() {
                log::info!("session {id}: close grace elapsed, terminating");
                terminate(session);
            }
            let code = code.or_else(|| session.pty_mut().and_then(|pty| pty.try_wait()));
            return Some((SessionState::Closed, EventPayload::Exited { code }));
        }

        if busy || !session.has_pty() {
            return None;
        }

        let linger = self.config.exit_linger();
        let code = session.pty_mut().and_then(|pty| pty.try_wait());
        match session.stream.clone() {
            StreamStatus::Ended { at } => {
                if code.is_some() || now.duration_since(at) >= linger {
                    return Some((SessionState::Closed, EventPayload::Exited { code }));
                }
            }
            StreamStatus::Broken { at, message } => {
                if code.is_some() {
                    return Some((SessionState::Closed, EventPayload::Exited { code }));
                }
                if now.duration_since(at) >= linger {
                    terminate(session);
                    return Some((
                        SessionState::Failed,
                        EventPayload::Error {
                            message: format!("output stream failed: {message}"),
                        },
                    ));
                }
            }
            StreamStatus::Open => {
                if code.is_some() {
                    let exited_at = *session.exited_at.get_or_insert(now);
                    if now.duration_since(exited_at) >= linger {
                        return Some((SessionState::Closed, EventPayload::Exited { code }));
                    }
                }
            }
        }
        None
    }

    /// Deliver the staged terminal event and drop the session from the
    /// registry in one step.
    fn retire(&mut self, id: SessionId) -> Retired {
        let control = &self.control;
        let mut result = Retired::Gone;
        self.registry.retire(id, |session| {
            let Some(event) = session.take_terminal_event() else {
                return true;
            };
            match control.try_reserve() {
                Ok(permit) => {
                    let frame = session.stamp(event);
                    log::info!(
                        "session {id}: {:?} after {} frames",
                        frame.kind(),
                        frame.sequence
                    );
                    permit.send(frame);
                    true
                }
                Err(ChannelState::Full) => {
                    session.restore_terminal_event(event);
                    result = Retired::Pending;
                    false
                }
                Err(ChannelState::Closed) => {
                    result = Retired::Disconnected;
                    true
                }
            }
        });
        result
    }
}

impl<R: ReadinessSource + 'static> Multiplexer<R> {
    /// Start the loop on a dedicated OS thread.
    pub fn spawn(self) -> io::Result<MultiplexerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let thread = std::thread::Builder::new()
            .name("mux".into())
            .spawn(move || self.run(stop_rx))?;
        Ok(MultiplexerHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Owner of a running multiplexer thread.
pub struct MultiplexerHandle {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MultiplexerHandle {
    /// Stop the loop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("multiplexer thread panicked");
            }
        }
    }
}

impl Drop for MultiplexerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn terminate(session: &mut Session) {
    let id = session.id();
    if let Some(pty) = session.pty_mut() {
        if let Err(e) = pty.terminate() {
            log::warn!("session {id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::frame::{control_channel, ControlReceiver, Frame, FrameKind, GapDetector};
    use crate::pty::{PtySpawner, SpawnSpec};
    use crate::readiness::ChannelReadiness;
    use crate::size::Dimensions;
    use crate::testing::{FakeSpawner, ManualReadiness};
    use std::thread;

    struct Harness {
        registry: Arc<Registry>,
        spawner: Arc<FakeSpawner>,
        mux: Multiplexer<ManualReadiness>,
        rx: ControlReceiver,
    }

    fn harness(config: MuxConfig) -> Harness {
        let spawner = Arc::new(FakeSpawner::new());
        let readiness = ManualReadiness::new();
        let control_capacity = config.control_capacity;
        let registry = Arc::new(Registry::new(
            Arc::clone(&spawner) as Arc<dyn PtySpawner>,
            Arc::new(readiness.clone()),
            config,
        ));
        let (tx, rx) = control_channel(control_capacity);
        let mux = Multiplexer::new(Arc::clone(&registry), readiness, tx);
        Harness {
            registry,
            spawner,
            mux,
            rx,
        }
    }

    fn quick() -> MuxConfig {
        MuxConfig {
            close_grace_ms: 0,
            exit_linger_ms: 0,
            ..MuxConfig::default()
        }
    }

    fn spec() -> SpawnSpec {
        SpawnSpec::new(vec!["/bin/sh".into()], Dimensions::default())
    }

    impl Harness {
        fn pump(&mut self, turns: usize) -> Vec<Frame> {
            let mut frames = Vec::new();
            for _ in 0..turns {
                self.mux.turn();
                while let Ok(frame) = self.rx.try_recv() {
                    frames.push(frame);
                }
            }
            frames
        }
    }

    fn output_of(frames: &[Frame], id: SessionId) -> Vec<u8> {
        frames
            .iter()
            .filter(|f| f.session_id == id)
            .filter_map(|f| match &f.payload {
                EventPayload::Output { data } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    fn terminal_frames(frames: &[Frame], id: SessionId) -> Vec<&Frame> {
        frames
            .iter()
            .filter(|f| f.session_id == id && f.payload.is_terminal())
            .collect()
    }

    #[test]
    fn test_echo_reaches_control_channel() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        h.spawner.probe(id).set_echo(true);

        h.registry.write(id, b"hello\n").unwrap();
        let frames = h.pump(3);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].session_id, id);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(
            frames[0].payload,
            EventPayload::Output {
                data: b"hello\n".to_vec()
            }
        );
    }

    #[test]
    fn test_zero_rows_is_rejected_without_events() {
        let mut h = harness(quick());
        let mut bad = spec();
        bad.dimensions = Dimensions { rows: 0, cols: 80 };

        let err = h.registry.open(bad).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDimensions { .. }));
        assert!(h.pump(2).is_empty());
        assert!(h.registry.list().is_empty());
    }

    #[test]
    fn test_concurrent_closes_yield_one_terminal_event() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();

        let registry = &h.registry;
        thread::scope(|scope| {
            let a = scope.spawn(|| registry.close(id));
            let b = scope.spawn(|| registry.close(id));
            a.join().unwrap().unwrap();
            b.join().unwrap().unwrap();
        });

        let frames = h.pump(4);
        let terminal = terminal_frames(&frames, id);
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].kind(), FrameKind::Exited);
        assert!(h.registry.list().is_empty());

        h.registry.close(id).unwrap();
        assert!(h.pump(2).is_empty());
    }

    #[test]
    fn test_immediate_exit_yields_only_exited() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.exit(0);
        probe.hangup();

        let frames = h.pump(2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[0].payload, EventPayload::Exited { code: Some(0) });
        assert!(h.registry.list().iter().all(|s| s.id != id));
        assert_eq!(probe.drops(), 1);
    }

    #[test]
    fn test_exit_follows_all_output() {
        let mut h = harness(MuxConfig {
            max_chunks_per_turn: 1,
            ..quick()
        });
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        for chunk in [&b"one "[..], b"two ", b"three"] {
            probe.emit(chunk);
        }
        probe.exit(1);
        probe.hangup();

        let frames = h.pump(6);
        assert_eq!(output_of(&frames, id), b"one two three");
        let last = frames.last().unwrap();
        assert_eq!(last.payload, EventPayload::Exited { code: Some(1) });
        assert_eq!(last.sequence, 3);
    }

    #[test]
    fn test_sessions_deliver_exact_bytes_without_gaps() {
        let mut h = harness(MuxConfig {
            max_chunks_per_turn: 2,
            ..quick()
        });
        let ids: Vec<SessionId> = (0..3).map(|_| h.registry.open(spec()).unwrap()).collect();

        let mut expected: HashMap<SessionId, Vec<u8>> = HashMap::new();
        for round in 0..10u8 {
            for &id in &ids {
                let chunk: Vec<u8> = (0..=(round % 7)).map(|i| round.wrapping_mul(31) ^ i ^ id as u8).collect();
                h.spawner.probe(id).emit(&chunk);
                expected.entry(id).or_default().extend_from_slice(&chunk);
            }
        }
        for &id in &ids {
            h.spawner.probe(id).exit(0);
            h.spawner.probe(id).hangup();
        }

        let frames = h.pump(30);
        let mut gaps = GapDetector::new();
        for frame in &frames {
            gaps.observe(frame).unwrap();
        }
        for &id in &ids {
            assert_eq!(output_of(&frames, id), expected[&id]);
            assert_eq!(terminal_frames(&frames, id).len(), 1);
        }
        assert!(h.registry.is_empty());
    }

    #[test]
    fn test_full_channel_stalls_without_loss() {
        let mut h = harness(MuxConfig {
            control_capacity: 2,
            ..quick()
        });
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        for i in 0..5u8 {
            probe.emit(&[i]);
        }

        h.mux.turn();
        let stats = h.mux.turn();
        assert_eq!(stats.frames, 0, "nothing fits while the consumer is behind");

        let mut frames = Vec::new();
        while let Ok(frame) = h.rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);

        probe.exit(0);
        probe.hangup();
        frames.extend(h.pump(6));

        assert_eq!(output_of(&frames, id), vec![0, 1, 2, 3, 4]);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[5].kind(), FrameKind::Exited);
    }

    #[test]
    fn test_least_recently_serviced_goes_first() {
        let mut h = harness(MuxConfig {
            max_chunks_per_turn: 2,
            ..quick()
        });
        let a = h.registry.open(spec()).unwrap();
        let b = h.registry.open(spec()).unwrap();
        for _ in 0..4 {
            h.spawner.probe(a).emit(b"a");
            h.spawner.probe(b).emit(b"b");
        }

        let first = h.pump(1);
        let order: Vec<SessionId> = first.iter().map(|f| f.session_id).collect();
        assert_eq!(order, vec![a, a, b, b]);

        // A newcomer has never been serviced and jumps the queue.
        let c = h.registry.open(spec()).unwrap();
        h.spawner.probe(c).emit(b"c");
        let second = h.pump(1);
        let order: Vec<SessionId> = second.iter().map(|f| f.session_id).collect();
        assert_eq!(order, vec![c, a, a, b, b]);
    }

    #[test]
    fn test_close_waits_for_grace_then_terminates() {
        let mut h = harness(MuxConfig {
            close_grace_ms: 60_000,
            ..quick()
        });
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);

        h.registry.close(id).unwrap();
        probe.emit(b"bye\n");
        let frames = h.pump(2);
        assert_eq!(output_of(&frames, id), b"bye\n");
        assert!(terminal_frames(&frames, id).is_empty());
        assert_eq!(probe.terminations(), 0);
        assert_eq!(h.registry.summary(id).unwrap().state, SessionState::Closing);

        // Process honors the hangup on its own.
        probe.exit(0);
        probe.hangup();
        let frames = h.pump(2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, EventPayload::Exited { code: Some(0) });
        assert_eq!(probe.terminations(), 0);
    }

    #[test]
    fn test_close_terminates_after_grace() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.set_exit_on_terminate(false);

        h.registry.close(id).unwrap();
        let frames = h.pump(2);
        assert_eq!(probe.terminations(), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, EventPayload::Exited { code: None });
        assert_eq!(probe.drops(), 1);
    }

    #[test]
    fn test_write_failure_ends_with_error() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.fail_write("broken pipe");

        let frames = h.pump(2);
        assert_eq!(frames.len(), 1);
        match &frames[0].payload {
            EventPayload::Error { message } => assert!(message.contains("broken pipe")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(probe.terminations(), 1);
        assert!(h.registry.is_empty());
    }

    #[test]
    fn test_broken_output_stream_fails_session() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.emit(b"partial");
        probe.fail_read("input/output error");

        let frames = h.pump(2);
        assert_eq!(output_of(&frames, id), b"partial");
        let terminal = terminal_frames(&frames, id);
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].kind(), FrameKind::Error);
        assert_eq!(terminal[0].sequence, 1);
    }

    #[test]
    fn test_resize_emits_resized_frame() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();

        h.registry.resize(id, Dimensions::new(30, 100).unwrap()).unwrap();
        let frames = h.pump(1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, EventPayload::Resized { rows: 30, cols: 100 });
    }

    #[test]
    fn test_resize_failure_reports_and_ends_session() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        h.spawner.probe(id).fail_resize("ioctl failed");

        let err = h.registry.resize(id, Dimensions::new(30, 100).unwrap()).unwrap_err();
        assert_eq!(err.kind(), "io_error");

        let frames = h.pump(1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), FrameKind::Error);
        assert!(h.registry.is_empty());
    }

    #[test]
    fn test_backpressured_write_keeps_accepted_prefix() {
        let mut h = harness(MuxConfig {
            pending_write_limit: 4,
            ..quick()
        });
        let id = h.registry.open(spec()).unwrap();

        let err = h.registry.write(id, b"abcdef").unwrap_err();
        assert!(matches!(err, RegistryError::Backpressure { accepted: 4, .. }));

        h.pump(1);
        assert_eq!(h.spawner.probe(id).written(), b"abcd");
        h.registry.write(id, b"ef").unwrap();
        h.pump(1);
        assert_eq!(h.spawner.probe(id).written(), b"abcdef");
    }

    #[test]
    fn test_blocked_input_resumes_when_writable() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.set_write_budget(2);

        h.registry.write(id, b"sleep 1\n").unwrap();
        h.pump(1);
        assert_eq!(probe.written(), b"sl");
        assert_eq!(h.registry.summary(id).unwrap().pending_input, 6);

        probe.set_write_budget(usize::MAX);
        h.pump(1);
        assert_eq!(probe.written(), b"sleep 1\n");
    }

    #[test]
    fn test_exit_without_hangup_is_found_by_sweep() {
        let mut h = harness(MuxConfig {
            tick_ms: 1,
            ..quick()
        });
        let id = h.registry.open(spec()).unwrap();
        h.pump(1);

        h.spawner.probe(id).exit(2);
        thread::sleep(Duration::from_millis(5));
        let frames = h.pump(1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, EventPayload::Exited { code: Some(2) });
    }

    #[test]
    fn test_scrollback_matches_delivered_output() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        let probe = h.spawner.probe(id);
        probe.emit(b"$ ls\n");
        probe.emit(b"Cargo.toml src\n");

        let frames = h.pump(1);
        let dumped: Vec<u8> = h.registry.dump_scrollback(id).unwrap().concat();
        assert_eq!(dumped, output_of(&frames, id));
    }

    #[test]
    fn test_dropped_receiver_disconnects() {
        let mut h = harness(quick());
        let id = h.registry.open(spec()).unwrap();
        h.spawner.probe(id).emit(b"x");

        let Harness { mut mux, rx, .. } = h;
        drop(rx);
        assert!(mux.turn().disconnected);
    }

    #[test]
    fn test_native_shell_end_to_end() {
        let (readiness, notifier) = ChannelReadiness::new();
        let config = MuxConfig {
            exit_linger_ms: 2_000,
            ..MuxConfig::default()
        };
        let registry = Arc::new(Registry::new(
            Arc::new(config.native_spawner()),
            Arc::new(notifier),
            config.clone(),
        ));
        let (tx, mut rx) = control_channel(config.control_capacity);
        let handle = Multiplexer::new(Arc::clone(&registry), readiness, tx)
            .spawn()
            .unwrap();

        let id = registry
            .open(SpawnSpec::new(
                vec!["/bin/sh".into(), "-c".into(), "printf ready; exit 3".into()],
                Dimensions::default(),
            ))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = Vec::new();
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(frame) => {
                    let done = frame.payload.is_terminal();
                    frames.push(frame);
                    if done {
                        break;
                    }
                }
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
        handle.stop();

        let output = String::from_utf8_lossy(&output_of(&frames, id)).to_string();
        assert!(output.contains("ready"), "output was {output:?}");
        assert_eq!(
            frames.last().map(|f| f.payload.clone()),
            Some(EventPayload::Exited { code: Some(3) })
        );
        assert!(registry.is_empty());
    }
}
