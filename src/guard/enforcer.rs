use crate::activity::{ActivityLog, Severity};
use crate::cancel::CancellationToken;
use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::guard_store::GuardStore;
use crate::models::StartupItem;
use crate::startup::{StartupControl, StartupInventory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ACTIVITY_SOURCE: &str = "Startup guard";

/// What a single enforcement pass ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Skipped,
    /// No entries are guarded.
    Idle,
    /// Every guarded entry was still disabled.
    Clean,
    /// Guarded entries had been re-enabled.
    Enforced { attempted: usize, disabled: usize },
    /// The guard list or inventory could not be read; nothing changed.
    Unavailable,
}

/// Keeps guarded startup entries disabled.
///
/// Passes are single-flight: a pass requested while another is running
/// returns [`PassOutcome::Skipped`] without touching any collaborator.
pub struct GuardEnforcer {
    store: Arc<dyn GuardStore>,
    inventory: Arc<dyn StartupInventory>,
    control: Arc<dyn StartupControl>,
    activity: Arc<dyn ActivityLog>,
    config: GuardConfig,
    in_flight: AtomicBool,
    violations: AtomicU32,
    last_scan: Mutex<Option<Instant>>,
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct PassSlot<'a>(&'a AtomicBool);

impl Drop for PassSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GuardEnforcer {
    pub fn new(
        store: Arc<dyn GuardStore>,
        inventory: Arc<dyn StartupInventory>,
        control: Arc<dyn StartupControl>,
        activity: Arc<dyn ActivityLog>,
        config: GuardConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            control,
            activity,
            config,
            in_flight: AtomicBool::new(false),
            violations: AtomicU32::new(0),
            last_scan: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Consecutive passes that found at least one re-enabled entry.
    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::Acquire)
    }

    /// Delay before the next scheduled pass.
    pub fn next_interval(&self) -> Duration {
        if self.violations() > self.config.rapid_threshold {
            self.config.rapid_interval
        } else {
            self.config.normal_interval
        }
    }

    /// Whether an event-triggered pass at `now` falls outside the debounce window.
    pub fn should_run_triggered(&self, now: Instant) -> bool {
        match *self.last_scan.lock() {
            Some(last) => now.saturating_duration_since(last) >= self.config.debounce,
            None => true,
        }
    }

    pub fn is_pass_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<PassSlot<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassSlot(&self.in_flight))
    }

    /// Run one enforcement pass. Only cancellation is returned as an error.
    pub fn run_pass(&self, cancel: &CancellationToken) -> Result<PassOutcome, GuardError> {
        let Some(_slot) = self.try_acquire() else {
            debug!("startup guard pass already running; skipping");
            return Ok(PassOutcome::Skipped);
        };
        cancel.check()?;
        *self.last_scan.lock() = Some(Instant::now());

        let guarded = match self.store.get_all() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not read guarded startup entries");
                return Ok(PassOutcome::Unavailable);
            }
        };
        if guarded.is_empty() {
            self.violations.store(0, Ordering::Release);
            return Ok(PassOutcome::Idle);
        }

        let snapshot = match self.inventory.get_inventory(cancel) {
            Ok(snapshot) => snapshot,
            Err(GuardError::Cancelled) => return Err(GuardError::Cancelled),
            Err(GuardError::Other(e)) => {
                warn!(error = %e, "could not read startup inventory");
                return Ok(PassOutcome::Unavailable);
            }
        };

        let candidates: Vec<StartupItem> = snapshot
            .items
            .into_iter()
            .filter(|item| guarded.contains(&item.id) && item.is_enabled())
            .collect();
        if candidates.is_empty() {
            self.violations.store(0, Ordering::Release);
            debug!(guarded = guarded.len(), "guarded startup entries are still disabled");
            return Ok(PassOutcome::Clean);
        }

        let violations = self.violations.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let success_severity = if violations > self.config.rapid_threshold {
            Severity::Error
        } else {
            Severity::Warning
        };

        let mut disabled = 0usize;
        for item in &candidates {
            cancel.check()?;
            match self
                .control
                .disable(item, self.config.terminate_running, cancel)
            {
                Ok(outcome) if outcome.succeeded => {
                    disabled += 1;
                    self.activity.record(
                        success_severity,
                        ACTIVITY_SOURCE,
                        &format!(
                            "{} was re-enabled and has been disabled again ({}, {}).",
                            item.name,
                            item.source_kind(),
                            item.entry_location()
                        ),
                    );
                }
                Ok(outcome) => {
                    let reason = outcome
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string());
                    self.activity.error(
                        ACTIVITY_SOURCE,
                        &format!("Could not disable {}: {}", item.name, reason),
                    );
                }
                Err(GuardError::Cancelled) => return Err(GuardError::Cancelled),
                Err(GuardError::Other(e)) => {
                    warn!(item = %item.id, error = %format!("{:#}", e), "disable failed");
                    self.activity.error(
                        ACTIVITY_SOURCE,
                        &format!("Could not disable {}.", item.name),
                    );
                }
            }
        }

        debug!(
            violations,
            attempted = candidates.len(),
            disabled,
            "startup guard pass enforced"
        );
        Ok(PassOutcome::Enforced {
            attempted: candidates.len(),
            disabled,
        })
    }
}
