//! Restart Manager session protocol.
//!
//! The lock inspector and forced closer drive the protocol through the
//! [`RestartManager`] trait so the platform binding stays swappable.

use chrono::{DateTime, Utc};

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_OUTOFMEMORY: u32 = 14;
pub const ERROR_WRITE_FAULT: u32 = 29;
pub const ERROR_SEM_TIMEOUT: u32 = 121;
pub const ERROR_BAD_ARGUMENTS: u32 = 160;
pub const ERROR_MORE_DATA: u32 = 234;
pub const ERROR_FAIL_NOACTION_REBOOT: u32 = 350;
pub const ERROR_FAIL_SHUTDOWN: u32 = 351;
pub const ERROR_FAIL_RESTART: u32 = 352;
pub const ERROR_CANCELLED: u32 = 1223;

/// `RmForceShutdown`
pub const RM_FORCE_SHUTDOWN: u32 = 0x1;
/// `RmShutdownOnlyRegistered`
pub const RM_SHUTDOWN_ONLY_REGISTERED: u32 = 0x10;

const FILETIME_UNIX_DIFF: u64 = 116_444_736_000_000_000;

/// Encode a UTC instant as a FILETIME (100ns ticks since 1601-01-01).
/// Instants before the Unix epoch map to 0, the "don't verify" sentinel.
pub fn datetime_to_filetime(at: DateTime<Utc>) -> u64 {
    let secs = at.timestamp();
    if secs < 0 {
        return 0;
    }
    let ticks = secs as u64 * 10_000_000 + u64::from(at.timestamp_subsec_nanos() / 100);
    ticks + FILETIME_UNIX_DIFF
}

pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    if ft <= FILETIME_UNIX_DIFF {
        return None;
    }
    let unix_100ns = ft - FILETIME_UNIX_DIFF;
    let secs = (unix_100ns / 10_000_000) as i64;
    let nanos = ((unix_100ns % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// `RM_UNIQUE_PROCESS`: a pid plus the FILETIME it started at (0 = unset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueProcess {
    pub process_id: u32,
    pub start_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Unknown,
    MainWindow,
    OtherWindow,
    Service,
    Explorer,
    Console,
    Critical,
}

impl AppType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => AppType::MainWindow,
            2 => AppType::OtherWindow,
            3 => AppType::Service,
            4 => AppType::Explorer,
            5 => AppType::Console,
            1000 => AppType::Critical,
            _ => AppType::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AppType::Unknown => "Background process",
            AppType::MainWindow => "Application",
            AppType::OtherWindow => "Application window",
            AppType::Service => "Windows service",
            AppType::Explorer => "Windows Explorer",
            AppType::Console => "Console application",
            AppType::Critical => "Critical system process",
        }
    }
}

/// One `RM_PROCESS_INFO` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmProcess {
    pub process: UniqueProcess,
    pub app_name: String,
    pub service_short_name: String,
    pub app_type: AppType,
    pub restartable: bool,
}

/// Response of one `RmGetList` call.
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub status: u32,
    pub needed: u32,
    pub processes: Vec<RmProcess>,
}

pub trait RestartManager: Send + Sync {
    /// Whether the session API can be used on this host at all.
    fn is_available(&self) -> bool;

    fn start_session(&self) -> Result<u32, u32>;

    fn end_session(&self, session: u32);

    fn register_files(&self, session: u32, paths: &[&str]) -> u32;

    fn register_processes(&self, session: u32, processes: &[UniqueProcess]) -> u32;

    /// `capacity == 0` issues the sizing call with a null buffer.
    fn get_list(&self, session: u32, capacity: u32) -> ListResponse;

    fn shutdown(&self, session: u32, flags: u32) -> u32;

    /// OS text for an error code, if the host can provide one.
    fn describe_error(&self, _code: u32) -> Option<String> {
        None
    }
}

impl<T: RestartManager + ?Sized> RestartManager for std::sync::Arc<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn start_session(&self) -> Result<u32, u32> {
        (**self).start_session()
    }

    fn end_session(&self, session: u32) {
        (**self).end_session(session)
    }

    fn register_files(&self, session: u32, paths: &[&str]) -> u32 {
        (**self).register_files(session, paths)
    }

    fn register_processes(&self, session: u32, processes: &[UniqueProcess]) -> u32 {
        (**self).register_processes(session, processes)
    }

    fn get_list(&self, session: u32, capacity: u32) -> ListResponse {
        (**self).get_list(session, capacity)
    }

    fn shutdown(&self, session: u32, flags: u32) -> u32 {
        (**self).shutdown(session, flags)
    }

    fn describe_error(&self, code: u32) -> Option<String> {
        (**self).describe_error(code)
    }
}

/// An open session, ended when dropped.
pub struct Session<'a, R: RestartManager + ?Sized> {
    rm: &'a R,
    handle: u32,
}

impl<'a, R: RestartManager + ?Sized> Session<'a, R> {
    pub fn start(rm: &'a R) -> Result<Self, u32> {
        let handle = rm.start_session()?;
        Ok(Self { rm, handle })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }
}

impl<R: RestartManager + ?Sized> Drop for Session<'_, R> {
    fn drop(&mut self) {
        self.rm.end_session(self.handle);
    }
}

/// Backend for hosts without the Restart Manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedRestartManager;

impl RestartManager for UnsupportedRestartManager {
    fn is_available(&self) -> bool {
        false
    }

    fn start_session(&self) -> Result<u32, u32> {
        Err(ERROR_INVALID_HANDLE)
    }

    fn end_session(&self, _session: u32) {}

    fn register_files(&self, _session: u32, _paths: &[&str]) -> u32 {
        ERROR_INVALID_HANDLE
    }

    fn register_processes(&self, _session: u32, _processes: &[UniqueProcess]) -> u32 {
        ERROR_INVALID_HANDLE
    }

    fn get_list(&self, _session: u32, _capacity: u32) -> ListResponse {
        ListResponse {
            status: ERROR_INVALID_HANDLE,
            ..Default::default()
        }
    }

    fn shutdown(&self, _session: u32, _flags: u32) -> u32 {
        ERROR_INVALID_HANDLE
    }
}

#[cfg(windows)]
pub use self::windows_impl::WindowsRestartManager;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::native;
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::FILETIME;
    use windows::Win32::System::RestartManager::{
        RmEndSession, RmGetList, RmRegisterResources, RmShutdown, RmStartSession,
        CCH_RM_SESSION_KEY, RM_PROCESS_INFO, RM_UNIQUE_PROCESS,
    };
    use tracing::debug;

    fn to_filetime(value: u64) -> FILETIME {
        FILETIME {
            dwLowDateTime: value as u32,
            dwHighDateTime: (value >> 32) as u32,
        }
    }

    fn from_filetime(ft: &FILETIME) -> u64 {
        (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
    }

    /// Restart Manager backed by `rstrtmgr.dll`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsRestartManager;

    impl RestartManager for WindowsRestartManager {
        fn is_available(&self) -> bool {
            true
        }

        fn start_session(&self) -> Result<u32, u32> {
            let mut session = 0u32;
            let mut key = [0u16; CCH_RM_SESSION_KEY as usize + 1];
            let rc = unsafe { RmStartSession(&mut session, None, PWSTR(key.as_mut_ptr())) };
            if rc.0 == ERROR_SUCCESS {
                Ok(session)
            } else {
                Err(rc.0)
            }
        }

        fn end_session(&self, session: u32) {
            let rc = unsafe { RmEndSession(session) };
            if rc.0 != ERROR_SUCCESS {
                debug!(session, "RmEndSession returned 0x{:X}", rc.0);
            }
        }

        fn register_files(&self, session: u32, paths: &[&str]) -> u32 {
            let wide: Vec<Vec<u16>> = paths.iter().map(|p| native::to_wide(p)).collect();
            let names: Vec<PCWSTR> = wide.iter().map(|w| PCWSTR(w.as_ptr())).collect();
            unsafe { RmRegisterResources(session, Some(names.as_slice()), None, None) }.0
        }

        fn register_processes(&self, session: u32, processes: &[UniqueProcess]) -> u32 {
            let unique: Vec<RM_UNIQUE_PROCESS> = processes
                .iter()
                .map(|p| RM_UNIQUE_PROCESS {
                    dwProcessId: p.process_id,
                    ProcessStartTime: to_filetime(p.start_time),
                })
                .collect();
            unsafe { RmRegisterResources(session, None, Some(unique.as_slice()), None) }.0
        }

        fn get_list(&self, session: u32, capacity: u32) -> ListResponse {
            let mut needed = 0u32;
            let mut count = capacity;
            let mut reasons = 0u32;
            let mut buffer = vec![RM_PROCESS_INFO::default(); capacity as usize];
            let affected = if capacity == 0 {
                None
            } else {
                Some(buffer.as_mut_ptr())
            };

            let status = unsafe {
                RmGetList(session, &mut needed, &mut count, affected, &mut reasons)
            }
            .0;

            let processes = if status == ERROR_SUCCESS {
                buffer
                    .iter()
                    .take(count as usize)
                    .map(|info| RmProcess {
                        process: UniqueProcess {
                            process_id: info.Process.dwProcessId,
                            start_time: from_filetime(&info.Process.ProcessStartTime),
                        },
                        app_name: native::from_wide(&info.strAppName),
                        service_short_name: native::from_wide(&info.strServiceShortName),
                        app_type: AppType::from_raw(info.ApplicationType.0 as u32),
                        restartable: info.bRestartable.as_bool(),
                    })
                    .collect()
            } else {
                Vec::new()
            };

            ListResponse {
                status,
                needed,
                processes,
            }
        }

        fn shutdown(&self, session: u32, flags: u32) -> u32 {
            unsafe { RmShutdown(session, flags, None) }.0
        }

        fn describe_error(&self, code: u32) -> Option<String> {
            native::system_message(code)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_filetime_split_round_trips() {
            let value = 0x01DA_2B3C_4D5E_6F70u64;
            assert_eq!(from_filetime(&to_filetime(value)), value);
        }

        #[test]
        fn test_session_opens_on_windows() {
            let rm = WindowsRestartManager;
            assert!(Session::start(&rm).is_ok());
        }
    }
}

/// The backend for the current host.
pub fn platform_restart_manager() -> Box<dyn RestartManager> {
    #[cfg(windows)]
    {
        Box::new(WindowsRestartManager)
    }
    #[cfg(not(windows))]
    {
        Box::new(UnsupportedRestartManager)
    }
}
