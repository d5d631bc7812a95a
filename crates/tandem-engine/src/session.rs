//! Shared session cell.
//!
//! The pipeline driver and the host's command handlers both need to see the
//! same session while a run is in flight. Instead of aliasing one mutable
//! object across suspension points, the session lives in a versioned cell:
//! commands mutate through `update`, and the driver re-reads a fresh
//! snapshot at every checkpoint.

use std::sync::{Arc, Mutex};

use tandem_core::Session;

#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Cell>>,
}

#[derive(Debug)]
struct Cell {
    session: Session,
    version: u64,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Cell {
                session,
                version: 0,
            })),
        }
    }

    /// Clone of the current session state.
    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    /// Monotonic counter, bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Mutate the session in a single critical section.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut cell = self.lock();
        let result = f(&mut cell.session);
        cell.version += 1;
        result
    }

    /// Replace the session wholesale (e.g. after a session switch).
    pub fn replace(&self, session: Session) {
        let mut cell = self.lock();
        cell.session = session;
        cell.version += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cell> {
        self.inner.lock().expect("session cell poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{LogRole, ModelConfig};

    #[test]
    fn snapshots_are_independent_copies() {
        let shared = SharedSession::new(Session::new("/tmp/p", ModelConfig::default()));
        let mut snap = shared.snapshot();
        snap.record(LogRole::User, "local only");
        assert!(shared.snapshot().log.is_empty());
    }

    #[test]
    fn update_bumps_version_and_is_visible() {
        let shared = SharedSession::new(Session::new("/tmp/p", ModelConfig::default()));
        assert_eq!(shared.version(), 0);
        shared.update(|s| s.cancelled = true);
        assert_eq!(shared.version(), 1);
        assert!(shared.snapshot().cancelled);
    }

    #[test]
    fn clones_share_the_same_cell() {
        let shared = SharedSession::new(Session::new("/tmp/p", ModelConfig::default()));
        let other = shared.clone();
        other.update(|s| s.auto_approve = true);
        assert!(shared.snapshot().auto_approve);
    }
}
