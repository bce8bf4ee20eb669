use super::enforcer::{GuardEnforcer, PassOutcome};
use super::folder_watcher::{self, FolderWatcher};
use super::join_with_timeout;
use super::registry_monitor::{self, RegistryMonitor};
use crate::cancel::CancellationToken;
use crate::preferences::{Preferences, SubscriptionId};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything that exists only while the guard is running. Started and
/// torn down as a unit.
struct GuardRuntime {
    cancel: CancellationToken,
    signal: Sender<()>,
    worker: JoinHandle<()>,
    monitors: Vec<RegistryMonitor>,
    watchers: Vec<FolderWatcher>,
}

/// Runs the enforcement loop while both gating preferences are on.
pub struct StartupGuardService {
    enforcer: Arc<GuardEnforcer>,
    watch_sources: bool,
    runtime: Mutex<Option<GuardRuntime>>,
    subscription: Mutex<Option<(Arc<Preferences>, SubscriptionId)>>,
}

impl StartupGuardService {
    pub fn new(enforcer: Arc<GuardEnforcer>) -> Arc<Self> {
        Self::build(enforcer, true)
    }

    /// A service that relies on polling alone.
    pub fn polling_only(enforcer: Arc<GuardEnforcer>) -> Arc<Self> {
        Self::build(enforcer, false)
    }

    fn build(enforcer: Arc<GuardEnforcer>, watch_sources: bool) -> Arc<Self> {
        Arc::new(Self {
            enforcer,
            watch_sources,
            runtime: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    pub fn enforcer(&self) -> &Arc<GuardEnforcer> {
        &self.enforcer
    }

    /// Follow `preferences` from now on, starting immediately if both switches are on.
    pub fn attach(self: &Arc<Self>, preferences: &Arc<Preferences>) {
        let service: Weak<Self> = Arc::downgrade(self);
        let source: Weak<Preferences> = Arc::downgrade(preferences);
        // The notified snapshot can be stale when listeners write back; read the store instead.
        let id = preferences.subscribe(move |_| {
            if let (Some(service), Some(preferences)) = (service.upgrade(), source.upgrade()) {
                service.reconcile(&preferences);
            }
        });

        let previous = self.subscription.lock().replace((preferences.clone(), id));
        if let Some((old, old_id)) = previous {
            old.unsubscribe(old_id);
        }
        self.reconcile(preferences);
    }

    /// Start or stop so the running state matches `preferences` as they are now.
    pub fn reconcile(&self, preferences: &Preferences) {
        let mut runtime = self.runtime.lock();
        match (preferences.current().guard_should_run(), runtime.is_some()) {
            (true, false) => *runtime = self.start(),
            (false, true) => {
                if let Some(rt) = runtime.take() {
                    Self::stop(rt);
                }
            }
            _ => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Number of registry monitors and folder watchers currently armed.
    pub fn active_watchers(&self) -> usize {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.monitors.len() + rt.watchers.len())
            .unwrap_or(0)
    }

    /// Ask the loop for an out-of-band pass. Debounce and single-flight
    /// still apply. Returns `false` when the guard is not running.
    pub fn enforce_now(&self) -> bool {
        match self.runtime.lock().as_ref() {
            Some(rt) => {
                let _ = rt.signal.try_send(());
                true
            }
            None => false,
        }
    }

    /// Stop the loop and stop following preferences.
    pub fn shutdown(&self) {
        if let Some((preferences, id)) = self.subscription.lock().take() {
            preferences.unsubscribe(id);
        }
        if let Some(rt) = self.runtime.lock().take() {
            Self::stop(rt);
        }
    }

    fn start(&self) -> Option<GuardRuntime> {
        let cancel = CancellationToken::new();
        let (signal, signals) = bounded::<()>(1);

        let (monitors, watchers) = if self.watch_sources {
            (
                registry_monitor::start_all(&signal),
                folder_watcher::start_all(&signal),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let enforcer = self.enforcer.clone();
        let worker_cancel = cancel.clone();
        let worker = match std::thread::Builder::new()
            .name("startup-guard".to_string())
            .spawn(move || run_loop(&enforcer, &worker_cancel, &signals))
        {
            Ok(worker) => worker,
            Err(e) => {
                warn!(error = %e, "could not start the startup guard loop");
                return None;
            }
        };

        info!(
            monitors = monitors.len(),
            watchers = watchers.len(),
            "startup guard started"
        );
        Some(GuardRuntime {
            cancel,
            signal,
            worker,
            monitors,
            watchers,
        })
    }

    fn stop(rt: GuardRuntime) {
        let GuardRuntime {
            cancel,
            signal,
            worker,
            monitors,
            watchers,
        } = rt;
        cancel.cancel();
        registry_monitor::stop_all(monitors);
        drop(watchers);
        drop(signal);
        if !join_with_timeout(worker, STOP_TIMEOUT) {
            warn!("startup guard loop did not stop in time");
        }
        info!("startup guard stopped");
    }
}

impl Drop for StartupGuardService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(enforcer: &GuardEnforcer, cancel: &CancellationToken, signals: &Receiver<()>) {
    if cancel.wait(enforcer.config().initial_delay) {
        return;
    }

    loop {
        match enforcer.run_pass(cancel) {
            Ok(PassOutcome::Enforced { attempted, disabled }) => {
                debug!(attempted, disabled, violations = enforcer.violations(), "guard pass")
            }
            Ok(outcome) => debug!(?outcome, "guard pass"),
            Err(e) if e.is_cancelled() => return,
            Err(e) => warn!(error = %e, "guard pass failed"),
        }

        let deadline = Instant::now() + enforcer.next_interval();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(cancel.receiver()) -> _ => return,
                recv(signals) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                    if enforcer.should_run_triggered(Instant::now()) {
                        break;
                    }
                }
                default(remaining) => break,
            }
        }
    }
}
