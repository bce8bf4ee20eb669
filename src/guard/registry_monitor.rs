//! One wait-thread per auto-run key, signalling whenever a value changes.

use crate::models::RegistryHive;
use anyhow::Result;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The keys whose changes can re-enable a guarded entry.
pub const WATCHED_KEYS: &[(RegistryHive, &str)] = &[
    (
        RegistryHive::HKCU,
        r"Software\Microsoft\Windows\CurrentVersion\Run",
    ),
    (
        RegistryHive::HKCU,
        r"Software\Microsoft\Windows\CurrentVersion\RunOnce",
    ),
    (
        RegistryHive::HKLM,
        r"Software\Microsoft\Windows\CurrentVersion\Run",
    ),
    (
        RegistryHive::HKLM,
        r"Software\Microsoft\Windows\CurrentVersion\RunOnce",
    ),
];

/// Bound on each wait so the thread notices a stop request.
const WAIT_SLICE: Duration = Duration::from_secs(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RegistryMonitor {
    label: String,
    stop: Arc<AtomicBool>,
    waker: Arc<imp::Waker>,
    thread: Option<JoinHandle<()>>,
}

impl RegistryMonitor {
    /// Open `hive\subkey` and start watching it. Fails if the key cannot be
    /// opened or the notification cannot be armed.
    pub fn start(hive: RegistryHive, subkey: &str, signal: Sender<()>) -> Result<Self> {
        let label = format!("{}\\{}", hive, subkey);
        let stop = Arc::new(AtomicBool::new(false));
        let (thread, waker) = imp::spawn(hive, subkey, &label, signal, stop.clone())?;
        tracing::debug!(key = %label, "registry monitor started");
        Ok(Self {
            label,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ask the wait-thread to exit without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.wake();
    }
}

impl Drop for RegistryMonitor {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if !super::join_with_timeout(thread, JOIN_TIMEOUT) {
                tracing::warn!(key = %self.label, "registry monitor did not stop in time");
            }
        }
    }
}

/// Stop every monitor, waking all wait-threads before joining any of them.
pub fn stop_all(monitors: Vec<RegistryMonitor>) {
    for monitor in &monitors {
        monitor.request_stop();
    }
    drop(monitors);
}

#[cfg(windows)]
mod imp {
    use super::*;
    use anyhow::Context;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_SUCCESS, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Registry::{
        RegNotifyChangeKeyValue, HKEY, REG_NOTIFY_CHANGE_LAST_SET, REG_NOTIFY_CHANGE_NAME,
        REG_NOTIFY_THREAD_AGNOSTIC,
    };
    use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};
    use winreg::enums::KEY_NOTIFY;
    use winreg::RegKey;

    /// Auto-reset event set by the kernel on a key change or by the owner on stop.
    pub(crate) struct Waker(HANDLE);

    // SAFETY: event handles can be set and waited on from any thread.
    unsafe impl Send for Waker {}
    unsafe impl Sync for Waker {}

    impl Waker {
        fn new() -> Result<Self> {
            let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
                .context("CreateEventW failed")?;
            Ok(Self(event))
        }

        pub(crate) fn wake(&self) {
            let _ = unsafe { SetEvent(self.0) };
        }
    }

    impl Drop for Waker {
        fn drop(&mut self) {
            let _ = unsafe { CloseHandle(self.0) };
        }
    }

    /// The open key and its event, owned by the wait-thread.
    struct Watch {
        key: RegKey,
        event: Arc<Waker>,
    }

    impl Watch {
        fn open(hive: RegistryHive, subkey: &str) -> Result<Self> {
            let key = crate::registry::hive_key(hive)
                .open_subkey_with_flags(subkey, KEY_NOTIFY)
                .with_context(|| format!("cannot open {}\\{}", hive, subkey))?;
            let watch = Self {
                key,
                event: Arc::new(Waker::new()?),
            };
            watch.arm()?;
            Ok(watch)
        }

        /// Notifications fire once per registration.
        fn arm(&self) -> Result<()> {
            let rc = unsafe {
                RegNotifyChangeKeyValue(
                    HKEY(self.key.raw_handle() as _),
                    false,
                    REG_NOTIFY_CHANGE_NAME | REG_NOTIFY_CHANGE_LAST_SET | REG_NOTIFY_THREAD_AGNOSTIC,
                    Some(self.event.0),
                    true,
                )
            };
            if rc != ERROR_SUCCESS {
                anyhow::bail!("RegNotifyChangeKeyValue failed with 0x{:X}", rc.0);
            }
            Ok(())
        }
    }

    pub(super) fn spawn(
        hive: RegistryHive,
        subkey: &str,
        label: &str,
        signal: Sender<()>,
        stop: Arc<AtomicBool>,
    ) -> Result<(JoinHandle<()>, Arc<Waker>)> {
        let watch = Watch::open(hive, subkey)?;
        let waker = watch.event.clone();
        let label = label.to_string();
        let thread = std::thread::Builder::new()
            .name("registry-monitor".to_string())
            .spawn(move || wait_loop(watch, &label, signal, &stop))?;
        Ok((thread, waker))
    }

    fn wait_loop(watch: Watch, label: &str, signal: Sender<()>, stop: &AtomicBool) {
        let slice = WAIT_SLICE.as_millis() as u32;
        while !stop.load(Ordering::SeqCst) {
            let rc = unsafe { WaitForSingleObject(watch.event.0, slice) };
            if rc == WAIT_OBJECT_0 {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                tracing::debug!(key = %label, "auto-run key changed");
                let _ = signal.try_send(());
                if let Err(e) = watch.arm() {
                    tracing::debug!(key = %label, error = %e, "registry monitor stopped");
                    return;
                }
            } else if rc != WAIT_TIMEOUT {
                tracing::debug!(key = %label, code = rc.0, "registry wait failed");
                return;
            }
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;

    pub(crate) enum Waker {}

    impl Waker {
        pub(crate) fn wake(&self) {
            match *self {}
        }
    }

    pub(super) fn spawn(
        _hive: RegistryHive,
        _subkey: &str,
        _label: &str,
        _signal: Sender<()>,
        _stop: Arc<AtomicBool>,
    ) -> Result<(JoinHandle<()>, Arc<Waker>)> {
        anyhow::bail!("registry change notification requires Windows")
    }
}

/// Monitors for every key in [`WATCHED_KEYS`] that could be armed.
pub fn start_all(signal: &Sender<()>) -> Vec<RegistryMonitor> {
    WATCHED_KEYS
        .iter()
        .filter_map(|(hive, subkey)| match RegistryMonitor::start(*hive, subkey, signal.clone()) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                tracing::debug!(hive = %hive, key = subkey, error = %e, "registry monitor unavailable");
                None
            }
        })
        .collect()
}
