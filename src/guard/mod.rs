//! Background enforcement that keeps user-selected startup entries disabled.

pub mod enforcer;
pub mod folder_watcher;
pub mod registry_monitor;
pub mod service;

pub use enforcer::{GuardEnforcer, PassOutcome};
pub use service::StartupGuardService;

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Join `thread` if it finishes within `timeout`; otherwise leave it detached.
/// Returns whether the thread finished.
pub(crate) fn join_with_timeout(thread: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if thread.join().is_err() {
        tracing::warn!("background thread panicked");
    }
    true
}
