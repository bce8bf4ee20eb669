use crate::models::{RegistryHive, Source, StartupItem};
use winreg::enums::*;
use winreg::RegKey;

struct RunKeyInfo {
    path: &'static str,
    hive: RegistryHive,
    is_run_once: bool,
}

const RUN_KEYS: &[RunKeyInfo] = &[
    RunKeyInfo {
        path: r"Software\Microsoft\Windows\CurrentVersion\Run",
        hive: RegistryHive::HKCU,
        is_run_once: false,
    },
    RunKeyInfo {
        path: r"Software\Microsoft\Windows\CurrentVersion\Run",
        hive: RegistryHive::HKLM,
        is_run_once: false,
    },
    RunKeyInfo {
        path: r"Software\Microsoft\Windows\CurrentVersion\RunOnce",
        hive: RegistryHive::HKCU,
        is_run_once: true,
    },
    RunKeyInfo {
        path: r"Software\Microsoft\Windows\CurrentVersion\RunOnce",
        hive: RegistryHive::HKLM,
        is_run_once: true,
    },
    // 32-bit app entries on 64-bit Windows
    RunKeyInfo {
        path: r"Software\Wow6432Node\Microsoft\Windows\CurrentVersion\Run",
        hive: RegistryHive::HKLM,
        is_run_once: false,
    },
    RunKeyInfo {
        path: r"Software\Wow6432Node\Microsoft\Windows\CurrentVersion\RunOnce",
        hive: RegistryHive::HKLM,
        is_run_once: true,
    },
];

pub(crate) fn hive_key(hive: RegistryHive) -> RegKey {
    match hive {
        RegistryHive::HKCU => RegKey::predef(HKEY_CURRENT_USER),
        RegistryHive::HKLM => RegKey::predef(HKEY_LOCAL_MACHINE),
    }
}

fn read_run_key(info: &RunKeyInfo) -> Vec<StartupItem> {
    let key = match hive_key(info.hive).open_subkey_with_flags(info.path, KEY_READ) {
        Ok(k) => k,
        Err(_) => return Vec::new(),
    };

    let mut items = Vec::new();
    for (name, reg_value) in key.enum_values().flatten() {
        if name.is_empty() {
            continue;
        }

        let command = match reg_value.vtype {
            REG_SZ | REG_EXPAND_SZ => String::from_utf16_lossy(
                &reg_value
                    .bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<u16>>(),
            )
            .trim_end_matches('\0')
            .to_string(),
            _ => continue,
        };

        let source = if info.is_run_once {
            Source::RegistryRunOnce {
                hive: info.hive,
                key_path: info.path.to_string(),
            }
        } else {
            Source::RegistryRun {
                hive: info.hive,
                key_path: info.path.to_string(),
            }
        };

        items.push(StartupItem::new(name, command, source));
    }

    items
}

pub fn collect_registry_entries() -> Vec<StartupItem> {
    RUN_KEYS.iter().flat_map(read_run_key).collect()
}
