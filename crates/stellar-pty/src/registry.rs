use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use crate::config::MuxConfig;
use crate::error::RegistryError;
use crate::pty::{PtySpawner, SpawnSpec};
use crate::readiness::{Interest, Notify};
use crate::session::{Session, SessionId, SessionState, SessionSummary};
use crate::size::Dimensions;

/// Owns every live session.
///
/// Each session sits behind its own mutex, so operations on one id are
/// serialized while distinct ids proceed independently. The map lock is
/// only held long enough to look up or swap entries.
///
/// Lock order is map, then session. Nothing acquires the map lock while
/// holding a session lock, and no lock is held across a spawn. A session
/// enters the map only once its process is running.
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    next_id: AtomicU64,
    /// Ids handed to the spawner that never became sessions: spawns in
    /// flight and spawns that failed.
    unregistered: Mutex<HashSet<SessionId>>,
    spawner: Arc<dyn PtySpawner>,
    notify: Arc<dyn Notify>,
    config: MuxConfig,
}

impl Registry {
    pub fn new(spawner: Arc<dyn PtySpawner>, notify: Arc<dyn Notify>, config: MuxConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            unregistered: Mutex::new(HashSet::new()),
            spawner,
            notify,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Spawn a process and register a session for it.
    pub fn open(&self, spec: SpawnSpec) -> Result<SessionId, RegistryError> {
        if !spec.dimensions.is_valid() {
            return Err(RegistryError::InvalidDimensions {
                rows: i64::from(spec.dimensions.rows),
                cols: i64::from(spec.dimensions.cols),
            });
        }

        let id = {
            let mut unregistered = self.unregistered();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            unregistered.insert(id);
            id
        };

        let pty = match self.spawner.spawn(id, &spec, Arc::clone(&self.notify)) {
            Ok(pty) => pty,
            Err(e) => {
                // The id stays unregistered, so it never names a session.
                log::warn!("session {id}: spawn failed: {e}");
                return Err(e.into());
            }
        };

        let mut session = Session::new(id, &spec, &self.config);
        session.attach(pty)?;
        log::info!("session {id}: started {:?}", session.command());

        {
            let mut map = self.map_mut();
            map.insert(id, Arc::new(Mutex::new(session)));
            self.unregistered().remove(&id);
        }
        self.notify.notify(id, Interest::READABLE);
        Ok(id)
    }

    /// Resize a running session's PTY.
    ///
    /// A PTY failure is returned here and also ends the session with an
    /// `error` event.
    pub fn resize(&self, id: SessionId, dimensions: Dimensions) -> Result<(), RegistryError> {
        if !dimensions.is_valid() {
            return Err(RegistryError::InvalidDimensions {
                rows: i64::from(dimensions.rows),
                cols: i64::from(dimensions.cols),
            });
        }

        let slot = self.get(id).ok_or(RegistryError::NotFound(id))?;
        let mut session = lock_session(&slot, id)?;
        if !session.state().accepts_io() {
            return Err(RegistryError::NotFound(id));
        }

        match session.set_dimensions(dimensions) {
            Ok(()) => {
                drop(session);
                self.notify.notify(id, Interest::CONTROL);
                Ok(())
            }
            Err(source) => {
                log::warn!("session {id}: resize failed: {source}");
                session.failure = Some(source.to_string());
                drop(session);
                self.notify.notify(id, Interest::ERROR);
                Err(RegistryError::Io { id, source })
            }
        }
    }

    /// Queue input for a running session.
    ///
    /// When the pending queue cannot take all of `data`, the accepted prefix
    /// stays queued and `Backpressure` reports its length.
    pub fn write(&self, id: SessionId, data: &[u8]) -> Result<(), RegistryError> {
        let slot = self.get(id).ok_or(RegistryError::NotFound(id))?;
        let mut session = lock_session(&slot, id)?;
        if !session.state().accepts_io() {
            return Err(RegistryError::NotFound(id));
        }
        if data.is_empty() {
            return Ok(());
        }

        let accepted = session.queue_input(data);
        drop(session);

        if accepted > 0 {
            self.notify.notify(id, Interest::WRITABLE);
        }
        if accepted < data.len() {
            log::debug!("session {id}: input backpressure after {accepted} bytes");
            return Err(RegistryError::Backpressure { id, accepted });
        }
        Ok(())
    }

    /// Ask a session to close. Idempotent.
    ///
    /// The session stops taking input right away; the multiplexer waits for
    /// the process to exit, terminates it after the grace period, and
    /// delivers the single terminal event.
    pub fn close(&self, id: SessionId) -> Result<(), RegistryError> {
        let slot = {
            let map = self.map();
            match map.get(&id) {
                Some(slot) => Arc::clone(slot),
                // Registered ids that are gone were closed and retired already.
                None if self.was_retired(id) => return Ok(()),
                None => return Err(RegistryError::NotFound(id)),
            }
        };

        let mut session = lock_session(&slot, id)?;
        match session.state() {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => Ok(()),
            SessionState::Starting | SessionState::Running => {
                if let Err(e) = session.transition(SessionState::Closing) {
                    log::warn!("{e}");
                    return Ok(());
                }
                session.close_deadline = Some(Instant::now() + self.config.close_grace());
                if let Some(pty) = session.pty_mut() {
                    pty.close_input();
                }
                drop(session);
                log::info!("session {id}: close requested");
                self.notify.notify(id, Interest::CONTROL);
                Ok(())
            }
        }
    }

    /// Request close of every session, e.g. on host shutdown.
    pub fn close_all(&self) {
        for id in self.ids() {
            let _ = self.close(id);
        }
    }

    pub fn set_title(&self, id: SessionId, title: &str) -> Result<(), RegistryError> {
        let slot = self.get(id).ok_or(RegistryError::NotFound(id))?;
        lock_session(&slot, id)?.set_title(title);
        Ok(())
    }

    /// Summaries of all sessions, ordered by id. A session stays listed
    /// until its terminal event has been delivered.
    pub fn list(&self) -> Vec<SessionSummary> {
        let slots: Vec<(SessionId, Arc<Mutex<Session>>)> = self
            .map()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut summaries: Vec<SessionSummary> = slots
            .iter()
            .filter_map(|(id, slot)| lock_session(slot, *id).ok().map(|s| s.summary()))
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Scrollback of a session, oldest entry first.
    pub fn dump_scrollback(&self, id: SessionId) -> Result<Vec<Vec<u8>>, RegistryError> {
        let slot = self.get(id).ok_or(RegistryError::NotFound(id))?;
        let session = lock_session(&slot, id)?;
        Ok(session.scrollback().dump())
    }

    pub fn summary(&self, id: SessionId) -> Result<SessionSummary, RegistryError> {
        let slot = self.get(id).ok_or(RegistryError::NotFound(id))?;
        let session = lock_session(&slot, id)?;
        Ok(session.summary())
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<Mutex<Session>>> {
        self.map().get(&id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.map().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove a session once `deliver` reports its terminal event sent.
    ///
    /// Runs under the map write lock, so no `list()` can observe the gap
    /// between delivery and removal. Returns whether the session is gone.
    pub(crate) fn retire(&self, id: SessionId, deliver: impl FnOnce(&mut Session) -> bool) -> bool {
        let mut map = self.map_mut();
        let Some(slot) = map.get(&id).cloned() else {
            return true;
        };
        let delivered = match slot.lock() {
            Ok(mut session) => deliver(&mut session),
            Err(poisoned) => deliver(&mut poisoned.into_inner()),
        };
        if delivered {
            map.remove(&id);
            log::debug!("session {id}: retired");
        }
        delivered
    }

    /// Whether `id` once named a registered session. Call with the map lock
    /// held so a concurrent `open` cannot register it in between.
    fn was_retired(&self, id: SessionId) -> bool {
        let unregistered = self.unregistered();
        id != 0 && id < self.next_id.load(Ordering::Relaxed) && !unregistered.contains(&id)
    }

    fn unregistered(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        self.unregistered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<Mutex<Session>>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn map_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<Mutex<Session>>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_session(slot: &Mutex<Session>, id: SessionId) -> Result<MutexGuard<'_, Session>, RegistryError> {
    slot.lock().map_err(|_| RegistryError::Poisoned(id))
}
