use crate::config::AppConfig;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The two switches gating background enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreferenceState {
    pub run_in_background: bool,
    pub startup_guard_enabled: bool,
}

impl PreferenceState {
    pub fn guard_should_run(&self) -> bool {
        self.run_in_background && self.startup_guard_enabled
    }
}

impl From<&AppConfig> for PreferenceState {
    fn from(config: &AppConfig) -> Self {
        PreferenceState {
            run_in_background: config.run_in_background,
            startup_guard_enabled: config.startup_guard_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(PreferenceState) + Send + Sync>;

/// In-memory preferences with change notification.
pub struct Preferences {
    state: RwLock<PreferenceState>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl Preferences {
    pub fn new(initial: PreferenceState) -> Self {
        Self {
            state: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> PreferenceState {
        *self.state.read()
    }

    pub fn set_run_in_background(&self, value: bool) {
        self.update(|s| s.run_in_background = value);
    }

    pub fn set_startup_guard_enabled(&self, value: bool) {
        self.update(|s| s.startup_guard_enabled = value);
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(PreferenceState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn update(&self, change: impl FnOnce(&mut PreferenceState)) {
        let snapshot = {
            let mut state = self.state.write();
            let before = *state;
            change(&mut state);
            if *state == before {
                return;
            }
            *state
        };

        // Listeners may call back into this store.
        let listeners: Vec<Listener> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_see_changes_until_unsubscribed() {
        let prefs = Preferences::new(PreferenceState::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = prefs.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        prefs.set_run_in_background(true);
        prefs.set_run_in_background(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(prefs.unsubscribe(id));
        prefs.set_startup_guard_enabled(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(prefs.current().guard_should_run());
    }

    #[test]
    fn test_guard_requires_both_switches() {
        let mut state = PreferenceState {
            run_in_background: true,
            startup_guard_enabled: false,
        };
        assert!(!state.guard_should_run());
        state.startup_guard_enabled = true;
        assert!(state.guard_should_run());
        state.run_in_background = false;
        assert!(!state.guard_should_run());
    }
}
