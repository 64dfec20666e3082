use crate::ids::SessionId;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic session counter. Zero is reserved: it can be observed only as
/// the initial value of a counter that is always advanced before any value
/// is transmitted. `advance` skips zero on wraparound and is linearizable
/// (compare-and-swap retry loop, never stores zero).
pub struct SessionHandler {
    initial: SessionId,
    current: AtomicU32,
}

impl SessionHandler {
    #[inline]
    pub fn new(initial: SessionId) -> SessionHandler {
        SessionHandler {
            initial,
            current: AtomicU32::new(initial),
        }
    }

    /// Current value without advancing.
    #[inline]
    pub fn get(&self) -> SessionId {
        self.current.load(Ordering::SeqCst)
    }

    /// Increments the counter and returns the new value. A result of zero is
    /// skipped, so wraparound from `u32::MAX` lands on 1.
    pub fn advance(&self) -> SessionId {
        loop {
            let current = self.current.load(Ordering::SeqCst);
            let next = if current == u32::max_value() { 1 } else { current + 1 };

            if self
                .current
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Restores the configured initial value.
    #[inline]
    pub fn reset(&self) {
        self.current.store(self.initial, Ordering::SeqCst);
    }
}

impl Default for SessionHandler {
    #[inline]
    fn default() -> SessionHandler {
        SessionHandler::new(0)
    }
}
