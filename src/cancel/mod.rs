//! Cancellation for in-flight checker runs
//!
//! A single shared token is checked by every executor poll loop. The signal
//! handler flips it on the first SIGINT/SIGTERM; a second signal exits the
//! process immediately. A cancelled partition's result is never committed
//! to the cache (the executor returns before the commit step).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code used when the process is torn down by a second signal.
pub const EXIT_CODE_IMMEDIATE: i32 = 130;

/// Shared cancellation flag. Cheap to clone; all clones observe the same
/// state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Install SIGINT/SIGTERM handling wired to the given token.
///
/// First signal: cancel the token so workers wind down and the run reports
/// a failure class. Second signal: exit immediately.
pub fn install_signal_handler(token: CancelToken) -> Result<(), ctrlc::Error> {
    let signal_count = Arc::new(AtomicU8::new(0));
    ctrlc::set_handler(move || {
        let count = signal_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nInterrupt received, cancelling running checks...");
            token.cancel();
        } else {
            eprintln!("\nSecond interrupt, exiting immediately");
            std::process::exit(EXIT_CODE_IMMEDIATE);
        }
    })
}
