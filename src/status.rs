//! `Explorer\StartupApproved` bookkeeping: the 12-byte values Task Manager
//! writes to mark Run and startup-folder entries enabled or disabled.

use crate::models::{EnabledStatus, RegistryHive, Source};
use crate::restart_manager::datetime_to_filetime;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) const STARTUP_APPROVED_ROOT: &str =
    r"Software\Microsoft\Windows\CurrentVersion\Explorer\StartupApproved";

const STATUS_DISABLED: u8 = 0x03;

pub fn parse_startup_approved(bytes: &[u8]) -> EnabledStatus {
    if bytes.len() < 12 {
        return EnabledStatus::Unknown;
    }
    match bytes[0] {
        0x02 | 0x06 => EnabledStatus::Enabled,
        _ => EnabledStatus::Disabled,
    }
}

/// A disabled StartupApproved value built from `existing` (or a fresh
/// buffer), stamped with `now` as the FILETIME.
pub fn disabled_approval_bytes(existing: Option<Vec<u8>>, now: DateTime<Utc>) -> Vec<u8> {
    let mut data = existing.unwrap_or_else(|| vec![0u8; 12]);
    if data.len() < 12 {
        data.resize(12, 0);
    }
    data[0] = STATUS_DISABLED;
    data[4..12].copy_from_slice(&datetime_to_filetime(now).to_le_bytes());
    data
}

/// Lookup keys are `"HIVE\subkey\valuename"`, e.g. `"HKCU\Run\Discord"`.
pub type ApprovalMap = HashMap<String, EnabledStatus>;

fn lookup_key(hive: RegistryHive, subkey: &str, value_name: &str) -> String {
    format!("{}\\{}\\{}", hive, subkey, value_name.to_lowercase())
}

/// StartupApproved subkey and value name for a source, if it has one.
pub(crate) fn approval_target(name: &str, source: &Source) -> Option<(RegistryHive, &'static str, String)> {
    match source {
        Source::RegistryRun { hive, key_path } => {
            // Explorer tracks 32-bit HKLM entries separately.
            let subkey = if key_path.to_ascii_lowercase().contains("wow6432node") {
                "Run32"
            } else {
                "Run"
            };
            Some((*hive, subkey, name.to_string()))
        }
        Source::StartupFolder { path, is_common } => {
            let hive = if *is_common {
                RegistryHive::HKLM
            } else {
                RegistryHive::HKCU
            };
            let file_name = path
                .rsplit(|c: char| c == '\\' || c == '/')
                .next()
                .filter(|f| !f.is_empty())
                .unwrap_or(name)
                .to_string();
            Some((hive, "StartupFolder", file_name))
        }
        _ => None,
    }
}

/// Status of a Run or startup-folder entry. Entries Task Manager never
/// touched have no value and count as enabled.
pub fn approval_status(name: &str, source: &Source, approvals: &ApprovalMap) -> EnabledStatus {
    let Some((hive, subkey, value_name)) = approval_target(name, source) else {
        return match source {
            Source::RegistryRunOnce { .. } => EnabledStatus::Enabled,
            _ => EnabledStatus::Unknown,
        };
    };

    if let Some(status) = approvals.get(&lookup_key(hive, subkey, &value_name)) {
        return *status;
    }
    if subkey == "Run" {
        if let Some(status) = approvals.get(&lookup_key(hive, "Run32", &value_name)) {
            return *status;
        }
    }
    EnabledStatus::Enabled
}

#[cfg(windows)]
pub fn load_all_approvals() -> ApprovalMap {
    use winreg::enums::KEY_READ;

    let mut map = HashMap::new();
    for hive in [RegistryHive::HKCU, RegistryHive::HKLM] {
        for subkey in ["Run", "Run32", "StartupFolder"] {
            let path = format!("{}\\{}", STARTUP_APPROVED_ROOT, subkey);
            let key = match crate::registry::hive_key(hive).open_subkey_with_flags(&path, KEY_READ) {
                Ok(k) => k,
                Err(_) => continue,
            };
            for (name, reg_value) in key.enum_values().flatten() {
                if name.is_empty() {
                    continue;
                }
                map.insert(
                    lookup_key(hive, subkey, &name),
                    parse_startup_approved(&reg_value.bytes),
                );
            }
        }
    }
    map
}
