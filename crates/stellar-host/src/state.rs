//! State shared by request handlers.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use stellar_pty::Registry;

pub struct AppState {
    /// All live sessions.
    pub registry: Arc<Registry>,
    /// Settings and snapshot store.
    pub db: Arc<Mutex<Connection>>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, db: Connection) -> Self {
        Self {
            registry,
            db: Arc::new(Mutex::new(db)),
        }
    }
}
