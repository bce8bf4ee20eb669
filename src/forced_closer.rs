use crate::models::{CloseMode, ResourceCloseResult, ResourceLockHandle};
use crate::process_control::{ProcessControl, SystemProcessControl};
use crate::restart_manager::{
    self, datetime_to_filetime, RestartManager, Session, UniqueProcess, ERROR_BAD_ARGUMENTS,
    ERROR_CANCELLED, ERROR_FAIL_NOACTION_REBOOT, ERROR_FAIL_RESTART, ERROR_FAIL_SHUTDOWN,
    ERROR_INVALID_HANDLE, ERROR_OUTOFMEMORY, ERROR_SEM_TIMEOUT, ERROR_SUCCESS, ERROR_WRITE_FAULT,
    RM_FORCE_SHUTDOWN, RM_SHUTDOWN_ONLY_REGISTERED,
};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

pub const NO_TARGETS_MESSAGE: &str = "No running apps were selected for closing.";
pub const UNSUPPORTED_MESSAGE: &str = "Closing apps is only supported on Windows.";
pub const REBOOT_REQUIRED_MESSAGE: &str =
    "Windows marked at least one locking app as critical; restart Windows to close it.";

/// Timings for the direct-signaling fallback.
#[derive(Debug, Clone)]
pub struct CloseOptions {
    /// How far a live start time may drift from the fingerprint and still match.
    pub start_time_tolerance: Duration,
    pub graceful_wait: Duration,
    pub force_wait: Duration,
    /// Stragglers listed by name before collapsing into "+N more".
    pub straggler_limit: usize,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            start_time_tolerance: Duration::from_secs(2),
            graceful_wait: Duration::from_secs(5),
            force_wait: Duration::from_secs(2),
            straggler_limit: 3,
        }
    }
}

/// Shuts down the processes behind a set of lock handles.
pub struct ForcedCloser<R: ?Sized, P: ?Sized> {
    rm: Box<R>,
    processes: Box<P>,
    options: CloseOptions,
}

impl ForcedCloser<dyn RestartManager, dyn ProcessControl> {
    pub fn platform() -> Self {
        Self {
            rm: restart_manager::platform_restart_manager(),
            processes: Box::new(SystemProcessControl::new()),
            options: CloseOptions::default(),
        }
    }
}

impl<R, P> ForcedCloser<R, P>
where
    R: RestartManager + ?Sized,
    P: ProcessControl + ?Sized,
{
    pub fn new(rm: Box<R>, processes: Box<P>, options: CloseOptions) -> Self {
        Self {
            rm,
            processes,
            options,
        }
    }

    /// Run [`close`](Self::close) on a dedicated thread. Shutdown and the
    /// fallback waits block for seconds.
    pub fn spawn_close(
        self: &Arc<Self>,
        handles: Vec<ResourceLockHandle>,
        mode: CloseMode,
    ) -> io::Result<JoinHandle<ResourceCloseResult>>
    where
        R: 'static,
        P: 'static,
    {
        let closer = Arc::clone(self);
        std::thread::Builder::new()
            .name("forced-closer".to_string())
            .spawn(move || closer.close(handles, mode))
    }

    pub fn close<I>(&self, handles: I, mode: CloseMode) -> ResourceCloseResult
    where
        I: IntoIterator<Item = ResourceLockHandle>,
    {
        let mut targets: Vec<ResourceLockHandle> = Vec::new();
        for handle in handles {
            if handle.process_id > 0
                && handle.process_id <= i64::from(u32::MAX)
                && !targets.contains(&handle)
            {
                targets.push(handle);
            }
        }

        if targets.is_empty() {
            return ResourceCloseResult::failed(NO_TARGETS_MESSAGE, 0);
        }
        if !self.rm.is_available() {
            return ResourceCloseResult::failed(UNSUPPORTED_MESSAGE, 0);
        }

        let result = self.close_with_session(&targets, mode);
        if result.success {
            info!(mode = %mode, targets = result.target_count, "{}", result.message);
        } else {
            warn!(mode = %mode, targets = result.target_count, "{}", result.message);
        }
        result
    }

    fn close_with_session(&self, targets: &[ResourceLockHandle], mode: CloseMode) -> ResourceCloseResult {
        let entries: Vec<UniqueProcess> = targets
            .iter()
            .map(|h| UniqueProcess {
                process_id: h.process_id as u32,
                start_time: h.process_start_time_utc.map(datetime_to_filetime).unwrap_or(0),
            })
            .collect();
        let count = entries.len();

        let session = match Session::start(&*self.rm) {
            Ok(s) => s,
            Err(code) => {
                return ResourceCloseResult::failed(
                    format!("Unable to start a Restart Manager session (0x{:X}).", code),
                    count,
                );
            }
        };

        let rc = self.rm.register_processes(session.handle(), &entries);
        if rc != ERROR_SUCCESS {
            return ResourceCloseResult::failed(
                format!("Unable to register the selected apps with Windows (0x{:X}).", rc),
                count,
            );
        }

        let mut flags = RM_SHUTDOWN_ONLY_REGISTERED;
        if mode == CloseMode::Force {
            flags |= RM_FORCE_SHUTDOWN;
        }

        match self.rm.shutdown(session.handle(), flags) {
            ERROR_SUCCESS => {
                ResourceCloseResult::succeeded(format!("Requested shutdown for {} app(s).", count), count)
            }
            ERROR_FAIL_NOACTION_REBOOT => ResourceCloseResult::failed(REBOOT_REQUIRED_MESSAGE, count),
            code => {
                warn!(
                    "RmShutdown failed with 0x{:X}; falling back to direct process signaling",
                    code
                );
                self.fallback(targets, mode, code)
                    .unwrap_or_else(|| ResourceCloseResult::failed(self.shutdown_error_message(code), count))
            }
        }
    }

    /// Signal each verified process directly. `None` when nothing could be attempted.
    fn fallback(
        &self,
        targets: &[ResourceLockHandle],
        mode: CloseMode,
        native_code: u32,
    ) -> Option<ResourceCloseResult> {
        let tolerance = chrono::Duration::from_std(self.options.start_time_tolerance)
            .unwrap_or_else(|_| chrono::Duration::seconds(2));

        let mut attempted = 0usize;
        let mut closed = 0usize;
        let mut stragglers: Vec<String> = Vec::new();

        for handle in targets {
            let pid = handle.process_id as u32;
            let Some(live) = self.processes.find(pid) else {
                continue;
            };

            if let Some(expected) = handle.process_start_time_utc {
                let matches = live
                    .started_at
                    .map(|actual| (actual - expected).abs() <= tolerance)
                    .unwrap_or(false);
                if !matches {
                    info!(pid, "Skipping process: pid now belongs to a different process");
                    continue;
                }
            }

            attempted += 1;
            let exited = match mode {
                CloseMode::Graceful => {
                    self.processes.request_close(pid);
                    self.processes.wait_for_exit(&live, self.options.graceful_wait)
                }
                CloseMode::Force => {
                    self.processes.terminate_tree(pid);
                    self.processes.wait_for_exit(&live, self.options.force_wait)
                }
            };

            if exited {
                closed += 1;
            } else {
                stragglers.push(live.describe());
            }
        }

        if attempted == 0 {
            return None;
        }

        let mut message = format!("Restart Manager returned 0x{:X}; ", native_code);
        match mode {
            CloseMode::Graceful => message.push_str(&format!(
                "closed {} of {} app(s) directly by sending close messages.",
                closed, attempted
            )),
            CloseMode::Force => message.push_str(&format!(
                "terminated {} of {} app(s) directly.",
                closed, attempted
            )),
        }
        if !stragglers.is_empty() {
            message.push_str(" Still running: ");
            message.push_str(&summarize(&stragglers, self.options.straggler_limit));
            message.push('.');
        }

        Some(ResourceCloseResult {
            success: stragglers.is_empty(),
            message,
            target_count: attempted,
        })
    }

    fn shutdown_error_message(&self, code: u32) -> String {
        match code {
            ERROR_FAIL_SHUTDOWN => {
                "Some apps refused to shut down. Save your work in them and try again.".to_string()
            }
            ERROR_FAIL_RESTART => "Apps were closed but could not be restarted.".to_string(),
            ERROR_CANCELLED => "Closing apps was cancelled.".to_string(),
            ERROR_SEM_TIMEOUT => "Timed out waiting for apps to close.".to_string(),
            ERROR_BAD_ARGUMENTS => "Windows rejected the close request as invalid.".to_string(),
            ERROR_WRITE_FAULT => {
                "Windows could not reach the Restart Manager service to close apps.".to_string()
            }
            ERROR_OUTOFMEMORY => "Windows ran out of memory while closing apps.".to_string(),
            ERROR_INVALID_HANDLE => "The Restart Manager session is no longer valid.".to_string(),
            other => match self.rm.describe_error(other) {
                Some(text) => format!("Closing apps failed: {} (0x{:X}).", text, other),
                None => format!("Closing apps failed (0x{:X}).", other),
            },
        }
    }
}

fn summarize(items: &[String], limit: usize) -> String {
    let shown = items.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if items.len() > limit {
        format!("{} +{} more", shown, items.len() - limit)
    } else {
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart_manager::UnsupportedRestartManager;
    use crate::testing::{FakeProcess, FakeProcessControl, FakeRestartManager};
    use chrono::{DateTime, Utc};
    use std::sync::Arc;

    const GENERIC_FAILURE: u32 = 0x57;

    fn quick_options() -> CloseOptions {
        CloseOptions {
            start_time_tolerance: Duration::from_secs(2),
            graceful_wait: Duration::from_millis(50),
            force_wait: Duration::from_millis(50),
            straggler_limit: 2,
        }
    }

    fn closer(
        rm: &Arc<FakeRestartManager>,
        processes: &Arc<FakeProcessControl>,
    ) -> ForcedCloser<dyn RestartManager, dyn ProcessControl> {
        ForcedCloser::new(
            Box::new(rm.clone()) as Box<dyn RestartManager>,
            Box::new(processes.clone()) as Box<dyn ProcessControl>,
            quick_options(),
        )
    }

    fn started(secs: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(secs, 0)
    }

    #[test]
    fn test_no_valid_handles() {
        let rm = FakeRestartManager::shared();
        let processes = FakeProcessControl::shared();
        let result = closer(&rm, &processes).close(
            [ResourceLockHandle::pid(0), ResourceLockHandle::pid(-4)],
            CloseMode::Force,
        );
        assert!(!result.success);
        assert_eq!(result.target_count, 0);
        assert_eq!(result.message, NO_TARGETS_MESSAGE);
        assert_eq!(rm.native_calls(), 0);
    }

    #[test]
    fn test_unsupported_platform() {
        let closer = ForcedCloser::new(
            Box::new(UnsupportedRestartManager),
            Box::new(FakeProcessControl::new()),
            quick_options(),
        );
        let result = closer.close([ResourceLockHandle::pid(10)], CloseMode::Graceful);
        assert!(!result.success);
        assert_eq!(result.target_count, 0);
        assert_eq!(result.message, UNSUPPORTED_MESSAGE);
    }

    #[test]
    fn test_successful_shutdown_dedupes_and_sets_flags() {
        let rm = FakeRestartManager::shared();
        let processes = FakeProcessControl::shared();
        let at = started(1_700_000_000);
        let result = closer(&rm, &processes).close(
            [
                ResourceLockHandle::new(10, at),
                ResourceLockHandle::new(10, at),
                ResourceLockHandle::pid(11),
            ],
            CloseMode::Force,
        );
        assert!(result.success);
        assert_eq!(result.target_count, 2);
        assert_eq!(result.message, "Requested shutdown for 2 app(s).");

        let registered = rm.registered_processes();
        assert_eq!(registered.len(), 2);
        assert_eq!(registered[0].start_time, datetime_to_filetime(at.unwrap()));
        assert_eq!(registered[1].start_time, 0);
        assert_eq!(
            rm.shutdown_flags(),
            vec![RM_SHUTDOWN_ONLY_REGISTERED | RM_FORCE_SHUTDOWN]
        );
        assert_eq!(rm.open_sessions(), 0);
    }

    #[test]
    fn test_spawned_close_reports_result() {
        let rm = FakeRestartManager::shared();
        let processes = FakeProcessControl::shared();
        let closer = Arc::new(closer(&rm, &processes));
        let result = closer
            .spawn_close(vec![ResourceLockHandle::pid(12)], CloseMode::Graceful)
            .unwrap()
            .join()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.target_count, 1);
        assert_eq!(rm.shutdown_flags(), vec![RM_SHUTDOWN_ONLY_REGISTERED]);
    }

    #[test]
    fn test_graceful_only_requests_registered_apps() {
        let rm = FakeRestartManager::shared();
        let processes = FakeProcessControl::shared();
        closer(&rm, &processes).close([ResourceLockHandle::pid(3)], CloseMode::Graceful);
        assert_eq!(rm.shutdown_flags(), vec![RM_SHUTDOWN_ONLY_REGISTERED]);
    }

    #[test]
    fn test_registration_failure_reports_hex_code() {
        let rm = FakeRestartManager::shared();
        rm.set_register_status(0xA0);
        let processes = FakeProcessControl::shared();
        let result = closer(&rm, &processes).close([ResourceLockHandle::pid(3)], CloseMode::Force);
        assert!(!result.success);
        assert_eq!(result.target_count, 1);
        assert!(result.message.contains("0xA0"));
        assert!(rm.shutdown_flags().is_empty());
        assert_eq!(rm.open_sessions(), 0);
    }

    #[test]
    fn test_reboot_required_skips_fallback() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(ERROR_FAIL_NOACTION_REBOOT);
        let processes = FakeProcessControl::shared();
        processes.add(FakeProcess::new(9, "lsass.exe", started(100)));

        let result = closer(&rm, &processes).close([ResourceLockHandle::pid(9)], CloseMode::Force);
        assert!(!result.success);
        assert_eq!(result.message, REBOOT_REQUIRED_MESSAGE);
        assert!(processes.terminated().is_empty());
    }

    #[test]
    fn test_graceful_fallback_closes_voluntarily_exiting_process() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(GENERIC_FAILURE);
        let processes = FakeProcessControl::shared();
        processes.add(FakeProcess::new(100, "editor.exe", started(1_000)).exits_on_close());

        let result = closer(&rm, &processes).close(
            [ResourceLockHandle::new(100, started(1_001))],
            CloseMode::Graceful,
        );
        assert!(result.success, "{}", result.message);
        assert_eq!(result.target_count, 1);
        assert!(result.message.starts_with("Restart Manager returned 0x57;"));
        assert!(result
            .message
            .contains("closed 1 of 1 app(s) directly by sending close messages"));
        assert_eq!(processes.close_requests(), vec![100]);
    }

    #[test]
    fn test_force_fallback_lists_process_that_refuses_to_die() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(GENERIC_FAILURE);
        let processes = FakeProcessControl::shared();
        processes.add(FakeProcess::new(200, "stubborn.exe", started(5)));

        let result = closer(&rm, &processes).close([ResourceLockHandle::pid(200)], CloseMode::Force);
        assert!(!result.success);
        assert!(result.message.contains("stubborn.exe (PID 200)"));
        assert!(result.message.contains("terminated 0 of 1"));
        assert_eq!(processes.terminated(), vec![200]);
    }

    #[test]
    fn test_fingerprint_mismatch_is_excluded_from_fallback() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(GENERIC_FAILURE);
        let processes = FakeProcessControl::shared();
        processes.add(FakeProcess::new(300, "reused.exe", started(10_000)).exits_on_kill());

        let result = closer(&rm, &processes).close(
            [ResourceLockHandle::new(300, started(9_000))],
            CloseMode::Force,
        );
        assert!(!result.success);
        assert!(processes.terminated().is_empty());
        assert!(!result.message.contains("directly"));
        assert_eq!(result.target_count, 1);
    }

    #[test]
    fn test_closing_exited_processes_twice_never_panics() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(ERROR_FAIL_SHUTDOWN);
        let processes = FakeProcessControl::shared();
        processes.add(FakeProcess::new(50, "gone.exe", started(1)).exits_on_kill());
        let closer = closer(&rm, &processes);
        let handles = [ResourceLockHandle::new(50, started(1))];

        let first = closer.close(handles, CloseMode::Force);
        assert!(first.success);

        let second = closer.close(handles, CloseMode::Force);
        assert!(!second.success);
        assert_eq!(second.message, closer.shutdown_error_message(ERROR_FAIL_SHUTDOWN));
        assert_eq!(processes.terminated(), vec![50]);
    }

    #[test]
    fn test_straggler_list_is_capped() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(GENERIC_FAILURE);
        let processes = FakeProcessControl::shared();
        for pid in 1..=4 {
            processes.add(FakeProcess::new(pid, "hung.exe", started(1)));
        }
        let handles: Vec<_> = (1..=4).map(ResourceLockHandle::pid).collect();

        let result = closer(&rm, &processes).close(handles, CloseMode::Graceful);
        assert!(!result.success);
        assert!(result.message.ends_with("hung.exe (PID 1), hung.exe (PID 2) +2 more."));
    }

    #[test]
    fn test_unknown_code_uses_system_text_or_bare_hex() {
        let rm = FakeRestartManager::shared();
        rm.set_shutdown_status(0x1F);
        let processes = FakeProcessControl::shared();
        let closer = closer(&rm, &processes);

        let result = closer.close([ResourceLockHandle::pid(77)], CloseMode::Force);
        assert_eq!(result.message, "Closing apps failed (0x1F).");

        rm.set_error_text(0x1F, "A device attached to the system is not functioning");
        let result = closer.close([ResourceLockHandle::pid(77)], CloseMode::Force);
        assert_eq!(
            result.message,
            "Closing apps failed: A device attached to the system is not functioning (0x1F)."
        );
    }

    #[test]
    fn test_known_codes_have_distinct_messages() {
        let rm = FakeRestartManager::shared();
        let processes = FakeProcessControl::shared();
        let closer = closer(&rm, &processes);
        let codes = [
            ERROR_FAIL_SHUTDOWN,
            ERROR_FAIL_RESTART,
            ERROR_CANCELLED,
            ERROR_SEM_TIMEOUT,
            ERROR_BAD_ARGUMENTS,
            ERROR_WRITE_FAULT,
            ERROR_OUTOFMEMORY,
            ERROR_INVALID_HANDLE,
        ];
        let messages: std::collections::HashSet<String> =
            codes.iter().map(|c| closer.shutdown_error_message(*c)).collect();
        assert_eq!(messages.len(), codes.len());
    }

    #[test]
    fn test_summarize_without_overflow() {
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(summarize(&items, 3), "a, b");
    }
}
