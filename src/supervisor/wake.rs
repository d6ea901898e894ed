//! CPU wake resource.
//!
//! While tracking is enabled the agent holds a partial wake token so
//! the host platform keeps the CPU servicing the pipeline's timers.
//! The token is process-wide: acquired once at supervisor start and
//! released exactly once at stop. A second acquisition while held is
//! refused (and yields an unarmed guard) rather than stacked, so a
//! buggy double-start can never leave a stray hold behind.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

static WAKE_HELD: AtomicBool = AtomicBool::new(false);

/// RAII hold on the wake resource. Dropping an armed guard releases
/// the hold; dropping an unarmed one is a no-op.
#[derive(Debug)]
pub struct WakeGuard {
    flag: &'static AtomicBool,
    armed: bool,
}

impl WakeGuard {
    pub fn acquire() -> Self {
        Self::acquire_from(&WAKE_HELD)
    }

    fn acquire_from(flag: &'static AtomicBool) -> Self {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("Wake resource already held, refusing a second hold");
            Self { flag, armed: false }
        } else {
            debug!("CPU wake resource acquired");
            Self { flag, armed: true }
        }
    }

    /// Whether this guard actually holds the resource.
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
            debug!("CPU wake resource released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests run against their own flag so they cannot race the
    // process-global hold exercised by the supervisor tests.
    static TEST_HELD: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_single_hold_and_release_once() {
        let first = WakeGuard::acquire_from(&TEST_HELD);
        assert!(first.is_armed());

        // A second hold is refused while the first is live
        let second = WakeGuard::acquire_from(&TEST_HELD);
        assert!(!second.is_armed());

        // Dropping the unarmed guard must not release the real hold
        drop(second);
        assert!(TEST_HELD.load(Ordering::SeqCst));

        drop(first);
        assert!(!TEST_HELD.load(Ordering::SeqCst));

        // After a clean release the resource is acquirable again
        let again = WakeGuard::acquire_from(&TEST_HELD);
        assert!(again.is_armed());
    }
}
