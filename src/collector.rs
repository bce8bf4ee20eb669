use crate::cancel::CancellationToken;
use crate::error::GuardError;
use crate::models::*;
use crate::registry;
use crate::services;
use crate::startup::StartupInventory;
use crate::startup_folders;
use crate::status;
use crate::task_scheduler;

/// Reads every startup source from the live system on each call.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsStartupInventory;

impl WindowsStartupInventory {
    pub fn new() -> Self {
        Self
    }
}

impl StartupInventory for WindowsStartupInventory {
    fn get_inventory(&self, cancel: &CancellationToken) -> Result<InventorySnapshot, GuardError> {
        // Phase 1: raw entries from each source
        let mut items: Vec<StartupItem> = Vec::new();

        items.extend(registry::collect_registry_entries());
        items.extend(startup_folders::collect_startup_folder_entries());
        cancel.check()?;

        match task_scheduler::collect_task_scheduler_entries() {
            Ok(tasks) => items.extend(tasks),
            Err(e) => tracing::debug!(error = %e, "scheduled tasks unavailable"),
        }
        cancel.check()?;

        match services::collect_services() {
            Ok(svcs) => items.extend(svcs),
            Err(e) => tracing::debug!(error = %e, "services unavailable"),
        }
        cancel.check()?;

        // Phase 2: StartupApproved status for Run and startup-folder entries
        let approvals = status::load_all_approvals();
        for item in &mut items {
            if matches!(
                item.source,
                Source::TaskScheduler { .. } | Source::Service { .. }
            ) {
                continue;
            }
            item.enabled = status::approval_status(&item.name, &item.source, &approvals);
        }

        items.sort_by(|a, b| {
            a.source_kind()
                .to_string()
                .cmp(&b.source_kind().to_string())
                .then(a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        tracing::debug!(count = items.len(), "collected startup inventory");
        Ok(InventorySnapshot { items })
    }
}
