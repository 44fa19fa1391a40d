//! Shutdown token for the endpoint loop.
//!
//! `Endpoint::run` checks the token once per poll interval, so cancelling it
//! from any task or thread stops the loop within one interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop request for a serving endpoint.
///
/// Obtained from [`Endpoint::shutdown_token`] and shared with the Ctrl+C
/// watcher. Cancelling any clone stops the loop; the endpoint re-arms the
/// token after teardown so a re-registered endpoint can serve again.
///
/// ```
/// use local_comm::Endpoint;
///
/// let endpoint = Endpoint::new();
/// let stop = endpoint.shutdown_token();
///
/// stop.cancel();
/// assert!(endpoint.shutdown_token().is_cancelled());
/// ```
///
/// [`Endpoint::shutdown_token`]: crate::Endpoint::shutdown_token
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an armed token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the loop to stop at its next readiness check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested and not yet cleared.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arm the token once the loop has torn down.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_stop_seen_by_every_clone() {
        let loop_side = CancellationToken::new();
        let watcher_side = loop_side.clone();

        watcher_side.cancel();

        assert!(loop_side.is_cancelled());
        assert!(watcher_side.is_cancelled());
    }

    #[test]
    fn test_rearm_after_teardown() {
        let token = CancellationToken::new();
        let held_by_host = token.clone();
        token.cancel();
        token.reset();
        assert!(!held_by_host.is_cancelled());
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }
}
