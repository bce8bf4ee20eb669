use crate::models::{EnabledStatus, Source, StartupItem};
use anyhow::{Context, Result};
use winreg::enums::*;
use winreg::RegKey;

const SERVICES_KEY: &str = r"SYSTEM\CurrentControlSet\Services";

const SERVICE_WIN32_OWN_PROCESS: u32 = 0x10;
const SERVICE_WIN32_SHARE_PROCESS: u32 = 0x20;

/// Third-party Win32 services that start with Windows (or were once set to).
pub fn collect_services() -> Result<Vec<StartupItem>> {
    let services_key = RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(SERVICES_KEY, KEY_READ)
        .context("Failed to open Services registry key")?;

    let mut items: Vec<StartupItem> = services_key
        .enum_keys()
        .flatten()
        .filter_map(|service_name| build_item(&services_key, service_name))
        .collect();

    items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(items)
}

fn build_item(services_key: &RegKey, service_name: String) -> Option<StartupItem> {
    let svc_key = services_key.open_subkey(&service_name).ok()?;

    let service_type: u32 = svc_key.get_value("Type").ok()?;
    if service_type & (SERVICE_WIN32_OWN_PROCESS | SERVICE_WIN32_SHARE_PROCESS) == 0 {
        return None;
    }

    let image_path: String = svc_key.get_value("ImagePath").ok()?;
    if image_path.trim().is_empty() || is_windows_service(&image_path) {
        return None;
    }

    let enabled = start_type_status(svc_key.get_value("Start").unwrap_or(3));
    if enabled == EnabledStatus::Manual {
        return None;
    }

    let display_name: String = svc_key
        .get_value("DisplayName")
        .ok()
        .filter(|n: &String| !n.is_empty() && !n.starts_with('@'))
        .unwrap_or_else(|| service_name.clone());

    let source = Source::Service {
        service_name,
        command_line: image_path.clone(),
    };
    Some(StartupItem::new(display_name, image_path, source).with_status(enabled))
}

pub(crate) fn start_type_status(start: u32) -> EnabledStatus {
    match start {
        0..=2 => EnabledStatus::Enabled,
        3 => EnabledStatus::Manual,
        4 => EnabledStatus::Disabled,
        _ => EnabledStatus::Unknown,
    }
}

/// Services hosted by the OS itself are never startup candidates.
fn is_windows_service(image_path: &str) -> bool {
    let cmd = image_path.trim().trim_start_matches('"').to_lowercase();
    WINDOWS_SERVICE_PREFIXES
        .iter()
        .any(|prefix| cmd.starts_with(prefix))
        || cmd.contains(r"\windows\system32\svchost.exe")
        || cmd.starts_with(r"\systemroot\")
        || cmd.starts_with(r"system32\")
}

static WINDOWS_SERVICE_PREFIXES: &[&str] = &[
    r"%systemroot%\system32\",
    r"%windir%\system32\",
    r"%systemroot%\syswow64\",
    r"%systemroot%\servicing\",
    r"%systemroot%\microsoft.net\",
    r"%programdata%\microsoft\windows defender\",
    r"c:\programdata\microsoft\windows defender\",
];
