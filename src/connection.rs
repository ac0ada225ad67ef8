use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Count of tunnel sessions currently relaying for one listener
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions {
    count: Arc<AtomicUsize>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; the count drops again when the guard goes away
    pub fn enter(&self) -> SessionGuard {
        let id = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        SessionGuard {
            count: Arc::clone(&self.count),
            id,
            released: false,
        }
    }

    pub fn active(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// RAII guard to ensure the session count is properly decremented
#[derive(Debug)]
pub struct SessionGuard {
    count: Arc<AtomicUsize>,
    id: usize,
    released: bool,
}

impl SessionGuard {
    /// Number of active sessions at the time this one started, used as a
    /// log label
    pub fn id(&self) -> usize {
        self.id
    }

    /// Manually release the slot; later calls and the drop are no-ops
    pub fn release(&mut self) {
        if !self.released {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_decrements_on_drop() {
        let sessions = ActiveSessions::new();

        {
            let _guard = sessions.enter();
            assert_eq!(sessions.active(), 1);
        }

        assert_eq!(sessions.active(), 0);
    }

    #[test]
    fn manual_release_is_idempotent() {
        let sessions = ActiveSessions::new();
        let _other = sessions.enter();

        {
            let mut guard = sessions.enter();
            assert_eq!(guard.id(), 2);
            assert_eq!(sessions.active(), 2);

            guard.release();
            assert_eq!(sessions.active(), 1);

            // Second release should be no-op
            guard.release();
            assert_eq!(sessions.active(), 1);
        }

        // Drop should not decrement again
        assert_eq!(sessions.active(), 1);
    }

    #[test]
    fn listeners_count_independently() {
        let first = ActiveSessions::new();
        let second = ActiveSessions::new();

        let _a = first.enter();
        assert_eq!(first.active(), 1);
        assert_eq!(second.active(), 0);
    }
}
