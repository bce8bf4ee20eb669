//! In-memory stand-ins for the OS-facing traits.

use crate::cancel::CancellationToken;
use crate::error::GuardError;
use crate::guard_store::GuardStore;
use crate::models::{
    DisableOutcome, EnabledStatus, InventorySnapshot, RegistryHive, Source, StartupItem,
};
use crate::process_control::{LiveProcess, ProcessControl};
use crate::restart_manager::*;
use crate::startup::{StartupControl, StartupInventory};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Restart Manager ─────────────────────────────────────────────────

pub(crate) fn rm_process(pid: u32, name: &str) -> RmProcess {
    RmProcess {
        process: UniqueProcess {
            process_id: pid,
            start_time: 0,
        },
        app_name: name.to_string(),
        service_short_name: String::new(),
        app_type: AppType::MainWindow,
        restartable: false,
    }
}

#[derive(Default)]
struct RmState {
    next_session: u32,
    open: HashSet<u32>,
    sessions_started: usize,
    locks: Vec<(String, RmProcess)>,
    failing_paths: HashSet<String>,
    registered_files: HashMap<u32, Vec<String>>,
    registered_processes: Vec<UniqueProcess>,
    register_status: u32,
    shutdown_status: u32,
    shutdown_flags: Vec<u32>,
    error_text: HashMap<u32, String>,
}

#[derive(Default)]
pub(crate) struct FakeRestartManager {
    state: Mutex<RmState>,
    calls: AtomicUsize,
}

impl FakeRestartManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn lock(&self, path: &str, process: RmProcess) {
        self.state.lock().locks.push((path.to_lowercase(), process));
    }

    pub fn fail_registration_for(&self, path: &str) {
        self.state.lock().failing_paths.insert(path.to_lowercase());
    }

    pub fn set_register_status(&self, code: u32) {
        self.state.lock().register_status = code;
    }

    pub fn set_shutdown_status(&self, code: u32) {
        self.state.lock().shutdown_status = code;
    }

    pub fn set_error_text(&self, code: u32, text: &str) {
        self.state.lock().error_text.insert(code, text.to_string());
    }

    pub fn native_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn sessions_started(&self) -> usize {
        self.state.lock().sessions_started
    }

    pub fn registered_processes(&self) -> Vec<UniqueProcess> {
        self.state.lock().registered_processes.clone()
    }

    pub fn shutdown_flags(&self) -> Vec<u32> {
        self.state.lock().shutdown_flags.clone()
    }

    fn called(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl RestartManager for FakeRestartManager {
    fn is_available(&self) -> bool {
        true
    }

    fn start_session(&self) -> Result<u32, u32> {
        self.called();
        let mut state = self.state.lock();
        state.next_session += 1;
        let handle = state.next_session;
        state.open.insert(handle);
        state.sessions_started += 1;
        Ok(handle)
    }

    fn end_session(&self, session: u32) {
        self.called();
        let mut state = self.state.lock();
        state.open.remove(&session);
        state.registered_files.remove(&session);
    }

    fn register_files(&self, session: u32, paths: &[&str]) -> u32 {
        self.called();
        let mut state = self.state.lock();
        if paths
            .iter()
            .any(|p| state.failing_paths.contains(&p.to_lowercase()))
        {
            return ERROR_BAD_ARGUMENTS;
        }
        if state.register_status != ERROR_SUCCESS {
            return state.register_status;
        }
        state
            .registered_files
            .entry(session)
            .or_default()
            .extend(paths.iter().map(|p| p.to_lowercase()));
        ERROR_SUCCESS
    }

    fn register_processes(&self, _session: u32, processes: &[UniqueProcess]) -> u32 {
        self.called();
        let mut state = self.state.lock();
        if state.register_status != ERROR_SUCCESS {
            return state.register_status;
        }
        state.registered_processes.extend_from_slice(processes);
        ERROR_SUCCESS
    }

    fn get_list(&self, session: u32, capacity: u32) -> ListResponse {
        self.called();
        let state = self.state.lock();
        let files = state.registered_files.get(&session).cloned().unwrap_or_default();
        let processes: Vec<RmProcess> = state
            .locks
            .iter()
            .filter(|(path, _)| files.contains(path))
            .map(|(_, process)| process.clone())
            .collect();
        let needed = processes.len() as u32;

        if needed == 0 {
            return ListResponse::default();
        }
        if capacity < needed {
            return ListResponse {
                status: ERROR_MORE_DATA,
                needed,
                processes: Vec::new(),
            };
        }
        ListResponse {
            status: ERROR_SUCCESS,
            needed,
            processes,
        }
    }

    fn shutdown(&self, _session: u32, flags: u32) -> u32 {
        self.called();
        let mut state = self.state.lock();
        state.shutdown_flags.push(flags);
        state.shutdown_status
    }

    fn describe_error(&self, code: u32) -> Option<String> {
        self.state.lock().error_text.get(&code).cloned()
    }
}

// ── Processes ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct FakeProcess {
    live: LiveProcess,
    exits_on_close: bool,
    exits_on_kill: bool,
}

impl FakeProcess {
    pub fn new(pid: u32, name: &str, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            live: LiveProcess {
                pid,
                name: Some(name.to_string()),
                started_at,
            },
            exits_on_close: false,
            exits_on_kill: false,
        }
    }

    pub fn exits_on_close(mut self) -> Self {
        self.exits_on_close = true;
        self
    }

    pub fn exits_on_kill(mut self) -> Self {
        self.exits_on_kill = true;
        self
    }
}

#[derive(Default)]
pub(crate) struct FakeProcessControl {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    close_requests: Mutex<Vec<u32>>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add(&self, process: FakeProcess) {
        self.processes.lock().insert(process.live.pid, process);
    }

    pub fn close_requests(&self) -> Vec<u32> {
        self.close_requests.lock().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

impl ProcessControl for FakeProcessControl {
    fn find(&self, pid: u32) -> Option<LiveProcess> {
        self.processes.lock().get(&pid).map(|p| p.live.clone())
    }

    fn request_close(&self, pid: u32) -> bool {
        self.close_requests.lock().push(pid);
        let mut processes = self.processes.lock();
        let exits = processes.get(&pid).map(|p| p.exits_on_close);
        if exits == Some(true) {
            processes.remove(&pid);
        }
        exits.is_some()
    }

    fn terminate_tree(&self, pid: u32) -> bool {
        self.terminated.lock().push(pid);
        let mut processes = self.processes.lock();
        let exits = processes.get(&pid).map(|p| p.exits_on_kill);
        if exits == Some(true) {
            processes.remove(&pid);
        }
        exits.is_some()
    }

    fn wait_for_exit(&self, process: &LiveProcess, _timeout: Duration) -> bool {
        !self.processes.lock().contains_key(&process.pid)
    }
}

// ── Startup guard collaborators ─────────────────────────────────────

pub(crate) fn run_item(name: &str, enabled: EnabledStatus) -> StartupItem {
    StartupItem::new(
        name.to_string(),
        format!(r"C:\Program Files\{0}\{0}.exe", name),
        Source::RegistryRun {
            hive: RegistryHive::HKCU,
            key_path: r"Software\Microsoft\Windows\CurrentVersion\Run".to_string(),
        },
    )
    .with_status(enabled)
}

#[derive(Default)]
pub(crate) struct MemoryGuardStore {
    ids: Mutex<HashSet<String>>,
    fail: Mutex<bool>,
}

impl MemoryGuardStore {
    pub fn with_ids<I: IntoIterator<Item = String>>(ids: I) -> Arc<Self> {
        let store = Self::default();
        *store.ids.lock() = ids.into_iter().collect();
        Arc::new(store)
    }

    pub fn set_ids<I: IntoIterator<Item = String>>(&self, ids: I) {
        *self.ids.lock() = ids.into_iter().collect();
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

impl GuardStore for MemoryGuardStore {
    fn get_all(&self) -> anyhow::Result<HashSet<String>> {
        if *self.fail.lock() {
            anyhow::bail!("guard store unreadable");
        }
        Ok(self.ids.lock().clone())
    }
}

/// Shared by [`FakeInventory`] and [`FakeControl`] so disabling an entry
/// shows up in the next snapshot.
pub(crate) type SharedItems = Arc<Mutex<Vec<StartupItem>>>;

pub(crate) struct FakeInventory {
    items: SharedItems,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeInventory {
    pub fn new(items: SharedItems) -> Arc<Self> {
        Self::with_delay(items, Duration::ZERO)
    }

    /// Each snapshot takes `delay`, long enough for tests to overlap passes.
    pub fn with_delay(items: SharedItems, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            items,
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StartupInventory for FakeInventory {
    fn get_inventory(&self, cancel: &CancellationToken) -> Result<InventorySnapshot, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() && cancel.wait(self.delay) {
            return Err(GuardError::Cancelled);
        }
        cancel.check()?;
        Ok(InventorySnapshot {
            items: self.items.lock().clone(),
        })
    }
}

pub(crate) struct FakeControl {
    items: SharedItems,
    refused: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    requests: Mutex<Vec<(String, bool)>>,
}

impl FakeControl {
    pub fn new(items: SharedItems) -> Arc<Self> {
        Arc::new(Self {
            items,
            refused: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Report a failed outcome for `id`.
    pub fn refuse(&self, id: &str) {
        self.refused.lock().insert(id.to_string());
    }

    /// Return an error (not an outcome) for `id`.
    pub fn break_on(&self, id: &str) {
        self.broken.lock().insert(id.to_string());
    }

    /// `(id, terminate_running)` per call, in order.
    pub fn requests(&self) -> Vec<(String, bool)> {
        self.requests.lock().clone()
    }
}

impl StartupControl for FakeControl {
    fn disable(
        &self,
        item: &StartupItem,
        terminate_running: bool,
        cancel: &CancellationToken,
    ) -> Result<DisableOutcome, GuardError> {
        cancel.check()?;
        self.requests
            .lock()
            .push((item.id.clone(), terminate_running));

        if self.broken.lock().contains(&item.id) {
            return Err(GuardError::Other(anyhow::anyhow!("access is denied")));
        }
        if self.refused.lock().contains(&item.id) {
            return Ok(DisableOutcome::failure(item.clone(), "entry is locked"));
        }

        let mut items = self.items.lock();
        if let Some(stored) = items.iter_mut().find(|i| i.id == item.id) {
            stored.enabled = EnabledStatus::Disabled;
        }
        Ok(DisableOutcome::success(
            item.clone().with_status(EnabledStatus::Disabled),
        ))
    }
}
