pub mod activity;
pub mod cancel;
pub mod config;
pub mod error;
pub mod forced_closer;
pub mod guard;
pub mod guard_store;
pub mod lock_inspector;
pub mod models;
pub mod preferences;
pub mod process_control;
pub mod restart_manager;
pub mod startup;
pub mod startup_folders;
pub mod status;

#[cfg(windows)]
mod actions;
#[cfg(windows)]
mod collector;
#[cfg(windows)]
mod native;
#[cfg(windows)]
mod registry;
#[cfg(windows)]
mod services;
#[cfg(windows)]
mod task_scheduler;

#[cfg(test)]
mod testing;

pub use activity::{ActivityLog, MemoryActivityLog, Severity, TracingActivityLog};
pub use cancel::CancellationToken;
pub use error::GuardError;
pub use forced_closer::{CloseOptions, ForcedCloser};
pub use guard::{GuardEnforcer, PassOutcome, StartupGuardService};
pub use lock_inspector::LockInspector;
pub use models::{CloseMode, ResourceCloseResult, ResourceLockHandle, ResourceLockInfo};
pub use process_control::describe_process;
