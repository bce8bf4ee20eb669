use crate::models::{ResourceLockHandle, ResourceLockInfo};
use crate::restart_manager::{
    filetime_to_datetime, AppType, RestartManager, RmProcess, Session, ERROR_MORE_DATA,
    ERROR_SUCCESS,
};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Discovers which processes hold locks on a set of files.
pub struct LockInspector<R: ?Sized> {
    rm: Box<R>,
}

impl LockInspector<dyn RestartManager> {
    /// Inspector bound to the host's Restart Manager.
    pub fn platform() -> Self {
        Self {
            rm: crate::restart_manager::platform_restart_manager(),
        }
    }
}

impl<R: RestartManager + ?Sized> LockInspector<R> {
    pub fn new(rm: Box<R>) -> Self {
        Self { rm }
    }

    /// Run [`inspect`](Self::inspect) on a dedicated thread. Session calls
    /// block, so UI callers should go through here.
    pub fn spawn_inspect(
        self: &Arc<Self>,
        resource_paths: Vec<String>,
    ) -> io::Result<JoinHandle<Vec<ResourceLockInfo>>>
    where
        R: 'static,
    {
        let inspector = Arc::clone(self);
        std::thread::Builder::new()
            .name("lock-inspector".to_string())
            .spawn(move || inspector.inspect(&resource_paths))
    }

    /// Every process locking any of `resource_paths`, one record per process.
    ///
    /// Processes holding more of the requested paths come first; ties are
    /// broken by display name. Paths the OS refuses to report on are skipped.
    pub fn inspect<I, S>(&self, resource_paths: I) -> Vec<ResourceLockInfo>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = normalize_paths(resource_paths);
        if paths.is_empty() {
            return Vec::new();
        }
        if !self.rm.is_available() {
            debug!("Lock inspection skipped: Restart Manager unavailable on this host");
            return Vec::new();
        }

        let mut order: Vec<u32> = Vec::new();
        let mut by_pid: HashMap<u32, LockAccumulator> = HashMap::new();

        for path in &paths {
            for process in self.processes_using(path) {
                let pid = process.process.process_id;
                by_pid
                    .entry(pid)
                    .or_insert_with(|| {
                        order.push(pid);
                        LockAccumulator::new(&process)
                    })
                    .add_path(path);
            }
        }

        let mut locks: Vec<ResourceLockInfo> = order
            .into_iter()
            .filter_map(|pid| by_pid.remove(&pid))
            .filter_map(LockAccumulator::freeze)
            .collect();

        locks.sort_by(|a, b| {
            b.resource_paths
                .len()
                .cmp(&a.resource_paths.len())
                .then_with(|| {
                    a.display_name
                        .to_lowercase()
                        .cmp(&b.display_name.to_lowercase())
                })
        });

        info!(
            paths = paths.len(),
            processes = locks.len(),
            "Resource lock inspection finished"
        );
        locks
    }

    /// One session per path; sizing call first, then the real fetch.
    fn processes_using(&self, path: &str) -> Vec<RmProcess> {
        let session = match Session::start(&*self.rm) {
            Ok(s) => s,
            Err(code) => {
                debug!(path, "RmStartSession failed with 0x{:X}", code);
                return Vec::new();
            }
        };

        let rc = self.rm.register_files(session.handle(), &[path]);
        if rc != ERROR_SUCCESS {
            debug!(path, "RmRegisterResources failed with 0x{:X}", rc);
            return Vec::new();
        }

        let sizing = self.rm.get_list(session.handle(), 0);
        match sizing.status {
            ERROR_SUCCESS => return Vec::new(),
            ERROR_MORE_DATA => {}
            other => {
                debug!(path, "RmGetList sizing call failed with 0x{:X}", other);
                return Vec::new();
            }
        }

        let listing = self.rm.get_list(session.handle(), sizing.needed);
        if listing.status != ERROR_SUCCESS {
            debug!(path, "RmGetList failed with 0x{:X}", listing.status);
            return Vec::new();
        }
        listing.processes
    }
}

/// Trim, drop blanks, and de-duplicate case-insensitively (first spelling wins).
fn normalize_paths<I, S>(resource_paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut paths = Vec::new();
    for raw in resource_paths {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            paths.push(trimmed.to_string());
        }
    }
    paths
}

struct LockAccumulator {
    handle: ResourceLockHandle,
    display_name: String,
    description: String,
    is_service: bool,
    is_critical: bool,
    is_restartable: bool,
    paths: Vec<String>,
}

impl LockAccumulator {
    fn new(process: &RmProcess) -> Self {
        let pid = process.process.process_id;
        let display_name = if !process.app_name.trim().is_empty() {
            process.app_name.trim().to_string()
        } else if !process.service_short_name.trim().is_empty() {
            process.service_short_name.trim().to_string()
        } else {
            format!("Process {}", pid)
        };

        let description = if process.app_type == AppType::Service
            && !process.service_short_name.is_empty()
        {
            format!(
                "{} '{}' (PID {})",
                process.app_type.label(),
                process.service_short_name,
                pid
            )
        } else {
            format!("{} (PID {})", process.app_type.label(), pid)
        };

        Self {
            handle: ResourceLockHandle::new(
                i64::from(pid),
                filetime_to_datetime(process.process.start_time),
            ),
            display_name,
            description,
            is_service: process.app_type == AppType::Service,
            is_critical: process.app_type == AppType::Critical,
            is_restartable: process.restartable,
            paths: Vec::new(),
        }
    }

    fn add_path(&mut self, path: &str) {
        if !self.paths.iter().any(|p| p.eq_ignore_ascii_case(path)) {
            self.paths.push(path.to_string());
        }
    }

    fn freeze(self) -> Option<ResourceLockInfo> {
        if self.paths.is_empty() {
            return None;
        }
        Some(ResourceLockInfo {
            handle: self.handle,
            display_name: self.display_name,
            description: self.description,
            is_service: self.is_service,
            is_critical: self.is_critical,
            is_restartable: self.is_restartable,
            resource_paths: self.paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart_manager::UnsupportedRestartManager;
    use crate::testing::{rm_process, FakeRestartManager};

    fn inspector(rm: &std::sync::Arc<FakeRestartManager>) -> LockInspector<dyn RestartManager> {
        LockInspector::new(Box::new(rm.clone()) as Box<dyn RestartManager>)
    }

    #[test]
    fn test_blank_paths_make_no_native_calls() {
        let rm = FakeRestartManager::shared();
        let result = inspector(&rm).inspect(["", "   ", "\t"]);
        assert!(result.is_empty());
        assert_eq!(rm.native_calls(), 0);

        let none: [&str; 0] = [];
        assert!(inspector(&rm).inspect(none).is_empty());
        assert_eq!(rm.native_calls(), 0);
    }

    #[test]
    fn test_unsupported_host_returns_empty() {
        let inspector = LockInspector::new(Box::new(UnsupportedRestartManager));
        assert!(inspector.inspect([r"C:\a.txt"]).is_empty());
    }

    #[test]
    fn test_same_process_on_two_paths_is_merged() {
        let rm = FakeRestartManager::shared();
        rm.lock(r"C:\a.txt", rm_process(100, "Editor"));
        rm.lock(r"C:\b.txt", rm_process(100, "Editor"));

        let locks = inspector(&rm).inspect([r"C:\a.txt", r"C:\b.txt"]);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].handle.process_id, 100);
        assert_eq!(locks[0].resource_paths, vec![r"C:\a.txt", r"C:\b.txt"]);
        assert_eq!(rm.open_sessions(), 0);
    }

    #[test]
    fn test_spawned_inspection_returns_locks() {
        let rm = FakeRestartManager::shared();
        rm.lock(r"C:\a.txt", rm_process(100, "Editor"));

        let inspector = std::sync::Arc::new(inspector(&rm));
        let locks = inspector
            .spawn_inspect(vec![r"C:\a.txt".to_string()])
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].handle.process_id, 100);
        assert_eq!(rm.open_sessions(), 0);
    }

    #[test]
    fn test_paths_are_normalized_before_lookup() {
        let rm = FakeRestartManager::shared();
        rm.lock(r"C:\a.txt", rm_process(7, "Viewer"));

        let locks = inspector(&rm).inspect([r"  C:\a.txt ", r"c:\A.TXT", ""]);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].resource_paths, vec![r"C:\a.txt"]);
        assert_eq!(rm.sessions_started(), 1);
    }

    #[test]
    fn test_results_sorted_by_path_count_then_name() {
        let rm = FakeRestartManager::shared();
        rm.lock(r"C:\one", rm_process(1, "zeta"));
        rm.lock(r"C:\one", rm_process(2, "Alpha"));
        rm.lock(r"C:\one", rm_process(3, "beta"));
        rm.lock(r"C:\two", rm_process(1, "zeta"));

        let locks = inspector(&rm).inspect([r"C:\one", r"C:\two"]);
        let names: Vec<&str> = locks.iter().map(|l| l.display_name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "Alpha", "beta"]);
        assert!(locks.iter().all(|l| !l.resource_paths.is_empty()));
    }

    #[test]
    fn test_failing_path_is_skipped_not_fatal() {
        let rm = FakeRestartManager::shared();
        rm.lock(r"C:\ok.txt", rm_process(5, "Good"));
        rm.lock(r"C:\bad.txt", rm_process(6, "Hidden"));
        rm.fail_registration_for(r"C:\bad.txt");

        let locks = inspector(&rm).inspect([r"C:\bad.txt", r"C:\ok.txt"]);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].display_name, "Good");
        assert_eq!(rm.open_sessions(), 0);
    }

    #[test]
    fn test_display_name_and_flags() {
        let rm = FakeRestartManager::shared();
        let mut service = rm_process(40, "");
        service.service_short_name = "Spooler".to_string();
        service.app_type = AppType::Service;
        service.restartable = true;
        let mut anonymous = rm_process(41, "");
        anonymous.app_type = AppType::Critical;
        rm.lock(r"C:\x", service);
        rm.lock(r"C:\x", anonymous);

        let locks = inspector(&rm).inspect([r"C:\x"]);
        let spooler = locks.iter().find(|l| l.handle.process_id == 40).unwrap();
        assert_eq!(spooler.display_name, "Spooler");
        assert!(spooler.is_service);
        assert!(spooler.is_restartable);
        assert!(!spooler.is_critical);

        let critical = locks.iter().find(|l| l.handle.process_id == 41).unwrap();
        assert_eq!(critical.display_name, "Process 41");
        assert!(critical.is_critical);
        assert!(!critical.is_service);
    }

    #[test]
    fn test_unlocked_path_yields_nothing() {
        let rm = FakeRestartManager::shared();
        assert!(inspector(&rm).inspect([r"C:\free.txt"]).is_empty());
        assert_eq!(rm.open_sessions(), 0);
    }
}
