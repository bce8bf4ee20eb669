use crate::cancel::CancellationToken;
use crate::error::GuardError;
use crate::models::*;
use crate::startup::StartupControl;
use crate::status;
use anyhow::{Context, Result};
use std::os::windows::process::CommandExt;
use std::process::Command;
use winreg::enums::*;

const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Disables startup entries through the same mechanisms Task Manager uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsStartupControl;

impl WindowsStartupControl {
    pub fn new() -> Self {
        Self
    }
}

impl StartupControl for WindowsStartupControl {
    fn disable(
        &self,
        item: &StartupItem,
        terminate_running: bool,
        cancel: &CancellationToken,
    ) -> Result<DisableOutcome, GuardError> {
        cancel.check()?;

        if let Err(e) = disable_entry(item) {
            return Ok(DisableOutcome::failure(item.clone(), format!("{:#}", e)));
        }

        if terminate_running {
            cancel.check()?;
            if let Err(e) = stop_entry(item) {
                tracing::debug!(item = %item.id, error = %e, "nothing stopped");
            }
        }

        Ok(DisableOutcome::success(
            item.clone().with_status(EnabledStatus::Disabled),
        ))
    }
}

fn disable_entry(item: &StartupItem) -> Result<()> {
    match &item.source {
        Source::RegistryRun { .. } | Source::StartupFolder { .. } => {
            let (hive, subkey, value_name) = status::approval_target(&item.name, &item.source)
                .context("Entry has no StartupApproved location")?;
            set_startup_approved(hive, subkey, &value_name)
        }
        Source::RegistryRunOnce { hive, key_path } => {
            // RunOnce has no approval flag; the value itself is the trigger.
            let key = crate::registry::hive_key(*hive)
                .open_subkey_with_flags(key_path, KEY_SET_VALUE)
                .context("Failed to open registry key for writing")?;
            key.delete_value(&item.name)
                .with_context(|| format!("Failed to delete value '{}'", item.name))
        }
        Source::TaskScheduler { task_path } => {
            run_hidden("schtasks", &["/Change", "/TN", task_path, "/DISABLE"])
        }
        Source::Service { service_name, .. } => {
            run_hidden("sc", &["config", service_name, "start=", "disabled"])
        }
    }
}

fn stop_entry(item: &StartupItem) -> Result<()> {
    if let Source::Service { service_name, .. } = &item.source {
        return run_hidden("sc", &["stop", service_name]);
    }

    let exe_name = item
        .exe_name()
        .context("Could not determine executable name")?;

    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut killed = 0usize;
    for process in sys.processes().values() {
        if process.name().to_string_lossy().to_lowercase() == exe_name && process.kill() {
            killed += 1;
        }
    }

    if killed > 0 {
        tracing::info!(exe = %exe_name, killed, "terminated running startup process");
        Ok(())
    } else {
        anyhow::bail!("No running process found for {}", exe_name)
    }
}

fn run_hidden(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        anyhow::bail!("{} failed: {}", program, detail);
    }
    Ok(())
}

fn set_startup_approved(hive: RegistryHive, subkey: &str, value_name: &str) -> Result<()> {
    let path = format!("{}\\{}", status::STARTUP_APPROVED_ROOT, subkey);
    let (key, _) = crate::registry::hive_key(hive)
        .create_subkey_with_flags(&path, KEY_READ | KEY_SET_VALUE)
        .with_context(|| format!("Failed to open {}", path))?;

    let existing = key.get_raw_value(value_name).ok().map(|v| v.bytes);
    let reg_value = winreg::RegValue {
        vtype: REG_BINARY,
        bytes: status::disabled_approval_bytes(existing, chrono::Utc::now()),
    };
    key.set_raw_value(value_name, &reg_value)
        .with_context(|| format!("Failed to write StartupApproved for '{}'", value_name))
}
