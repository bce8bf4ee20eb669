//! Collaborators the startup guard consumes: a live inventory of startup
//! entries and a way to disable one.

use crate::cancel::CancellationToken;
use crate::error::GuardError;
use crate::models::{DisableOutcome, InventorySnapshot, StartupItem};

pub trait StartupInventory: Send + Sync {
    /// Current OS state; must not be cached across calls.
    fn get_inventory(&self, cancel: &CancellationToken) -> Result<InventorySnapshot, GuardError>;
}

pub trait StartupControl: Send + Sync {
    /// Disable `item`, optionally terminating processes launched from it.
    fn disable(
        &self,
        item: &StartupItem,
        terminate_running: bool,
        cancel: &CancellationToken,
    ) -> Result<DisableOutcome, GuardError>;
}

#[cfg(windows)]
pub use crate::actions::WindowsStartupControl;
#[cfg(windows)]
pub use crate::collector::WindowsStartupInventory;
