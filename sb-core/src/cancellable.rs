use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle to an in-flight asynchronous operation.
///
/// `cancel()` is idempotent. After cancellation, the operation's completion
/// callback must not fire (spec §5 "Cancellation"). This is the systems-
/// language stand-in for the C++ `CancellablePointer` back-reference
/// described in spec §9: rather than a raw pointer into the event loop's
/// arena of in-flight operations, cancellation here is a shared flag that
/// every stage of a pipeline consults before invoking its completion
/// callback.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_cancel() {
        let h = CancelHandle::new();
        assert!(!h.is_cancelled());
        h.cancel();
        h.cancel();
        assert!(h.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let h = CancelHandle::new();
        let h2 = h.clone();
        h2.cancel();
        assert!(h.is_cancelled());
    }
}
