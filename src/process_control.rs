use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// A process as currently seen by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u32,
    pub name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl LiveProcess {
    /// `"{name} (PID {pid})"`, or `"PID {pid}"` when the name is unreadable.
    pub fn describe(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{} (PID {})", name, self.pid),
            _ => format!("PID {}", self.pid),
        }
    }
}

/// Direct process signaling, used when the Restart Manager cannot act.
pub trait ProcessControl: Send + Sync {
    fn find(&self, pid: u32) -> Option<LiveProcess>;

    /// Ask the process to close its main window. Returns whether a request was delivered.
    fn request_close(&self, pid: u32) -> bool;

    /// Terminate the process and every descendant.
    fn terminate_tree(&self, pid: u32) -> bool;

    /// Wait until `process` is gone (or its pid now belongs to someone else).
    fn wait_for_exit(&self, process: &LiveProcess, timeout: Duration) -> bool;
}

impl<T: ProcessControl + ?Sized> ProcessControl for std::sync::Arc<T> {
    fn find(&self, pid: u32) -> Option<LiveProcess> {
        (**self).find(pid)
    }

    fn request_close(&self, pid: u32) -> bool {
        (**self).request_close(pid)
    }

    fn terminate_tree(&self, pid: u32) -> bool {
        (**self).terminate_tree(pid)
    }

    fn wait_for_exit(&self, process: &LiveProcess, timeout: Duration) -> bool {
        (**self).wait_for_exit(process, timeout)
    }
}

/// [`ProcessControl`] over the live process table.
pub struct SystemProcessControl {
    sys: Mutex<System>,
    poll_interval: Duration,
}

impl Default for SystemProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessControl {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn snapshot(sys: &System, pid: u32) -> Option<LiveProcess> {
        let process = sys.process(Pid::from_u32(pid))?;
        let name = process.name().to_string_lossy().to_string();
        Some(LiveProcess {
            pid,
            name: if name.is_empty() { None } else { Some(name) },
            started_at: seconds_to_datetime(process.start_time()),
        })
    }
}

fn seconds_to_datetime(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

impl ProcessControl for SystemProcessControl {
    fn find(&self, pid: u32) -> Option<LiveProcess> {
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        Self::snapshot(&sys, pid)
    }

    fn request_close(&self, pid: u32) -> bool {
        #[cfg(windows)]
        {
            post_close_to_main_windows(pid)
        }
        #[cfg(not(windows))]
        {
            let mut sys = self.sys.lock();
            sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
            sys.process(Pid::from_u32(pid))
                .and_then(|p| p.kill_with(sysinfo::Signal::Term))
                .unwrap_or(false)
        }
    }

    fn terminate_tree(&self, pid: u32) -> bool {
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        let Some(root_process) = sys.process(root) else {
            return false;
        };
        let root_started = root_process.start_time();

        // A child can't predate its parent; anything that does inherited a reused pid.
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child_pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                if parent != *child_pid && process.start_time() >= root_started {
                    children.entry(parent).or_default().push(*child_pid);
                }
            }
        }

        let mut tree = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue = vec![root];
        while let Some(current) = queue.pop() {
            tree.push(current);
            if let Some(kids) = children.get(&current) {
                for kid in kids {
                    if seen.insert(*kid) {
                        queue.push(*kid);
                    }
                }
            }
        }

        let mut root_killed = false;
        for member in tree {
            if let Some(process) = sys.process(member) {
                let killed = process.kill();
                if member == root {
                    root_killed = killed;
                } else if !killed {
                    debug!(pid = member.as_u32(), "Failed to terminate child process");
                }
            }
        }
        if !root_killed {
            warn!(pid, "Failed to terminate process");
        }
        root_killed
    }

    fn wait_for_exit(&self, process: &LiveProcess, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(process.pid) {
                None => return true,
                Some(current) => {
                    if process.started_at.is_some()
                        && current.started_at.is_some()
                        && current.started_at != process.started_at
                    {
                        return true;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

/// Post `WM_CLOSE` to every visible, unowned top-level window of `pid`.
#[cfg(windows)]
fn post_close_to_main_windows(pid: u32) -> bool {
    use windows::core::BOOL;
    use windows::Win32::Foundation::{HWND, LPARAM, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindow, GetWindowThreadProcessId, IsWindowVisible, PostMessageW, GW_OWNER,
        WM_CLOSE,
    };

    struct Search {
        pid: u32,
        found: Vec<HWND>,
    }

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut Search);
        let mut owner_pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut owner_pid));
        let unowned = GetWindow(hwnd, GW_OWNER)
            .map(|owner| owner.0.is_null())
            .unwrap_or(true);
        if owner_pid == search.pid && IsWindowVisible(hwnd).as_bool() && unowned {
            search.found.push(hwnd);
        }
        BOOL(1)
    }

    let mut search = Search {
        pid,
        found: Vec::new(),
    };
    if let Err(e) = unsafe { EnumWindows(Some(collect), LPARAM(&mut search as *mut Search as isize)) } {
        debug!(pid, error = %e, "EnumWindows failed");
    }

    let mut posted = false;
    for hwnd in search.found {
        if unsafe { PostMessageW(Some(hwnd), WM_CLOSE, WPARAM(0), LPARAM(0)) }.is_ok() {
            posted = true;
        }
    }
    if !posted {
        debug!(pid, "No main window accepted WM_CLOSE");
    }
    posted
}

/// Descriptor for a pid as currently running, e.g. `"notepad.exe (PID 42)"`.
pub fn describe_process(pid: u32) -> String {
    SystemProcessControl::new()
        .find(pid)
        .map(|p| p.describe())
        .unwrap_or_else(|| format!("PID {}", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_with_and_without_name() {
        let named = LiveProcess {
            pid: 42,
            name: Some("notepad.exe".to_string()),
            started_at: None,
        };
        assert_eq!(named.describe(), "notepad.exe (PID 42)");

        let anonymous = LiveProcess {
            pid: 43,
            name: Some("  ".to_string()),
            started_at: None,
        };
        assert_eq!(anonymous.describe(), "PID 43");
    }

    #[test]
    fn test_find_current_process() {
        let control = SystemProcessControl::new();
        let me = control.find(std::process::id()).unwrap();
        assert_eq!(me.pid, std::process::id());
        assert!(me.started_at.is_some());
    }

    #[test]
    fn test_wait_for_exit_times_out_for_running_process() {
        let control = SystemProcessControl::new();
        let me = control.find(std::process::id()).unwrap();
        assert!(!control.wait_for_exit(&me, Duration::from_millis(150)));
    }
}
