use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;

// ── Startup Inventory Models ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum RegistryHive {
    HKCU,
    HKLM,
}

impl fmt::Display for RegistryHive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryHive::HKCU => write!(f, "HKCU"),
            RegistryHive::HKLM => write!(f, "HKLM"),
        }
    }
}

/// Where a startup entry is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    RegistryRun {
        hive: RegistryHive,
        key_path: String,
    },
    RegistryRunOnce {
        hive: RegistryHive,
        key_path: String,
    },
    StartupFolder {
        path: String,
        is_common: bool,
    },
    TaskScheduler {
        task_path: String,
    },
    Service {
        service_name: String,
        command_line: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    RegistryRun,
    RegistryRunOnce,
    StartupFolder,
    ScheduledTask,
    Service,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::RegistryRun => write!(f, "Registry (Run)"),
            SourceKind::RegistryRunOnce => write!(f, "Registry (RunOnce)"),
            SourceKind::StartupFolder => write!(f, "Startup folder"),
            SourceKind::ScheduledTask => write!(f, "Scheduled task"),
            SourceKind::Service => write!(f, "Service"),
        }
    }
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::RegistryRun { .. } => SourceKind::RegistryRun,
            Source::RegistryRunOnce { .. } => SourceKind::RegistryRunOnce,
            Source::StartupFolder { .. } => SourceKind::StartupFolder,
            Source::TaskScheduler { .. } => SourceKind::ScheduledTask,
            Source::Service { .. } => SourceKind::Service,
        }
    }

    pub fn display_location(&self) -> String {
        match self {
            Source::RegistryRun { hive, key_path } => format!("{}\\{}", hive, key_path),
            Source::RegistryRunOnce { hive, key_path } => format!("{}\\{}", hive, key_path),
            Source::StartupFolder { path, .. } => path.clone(),
            Source::TaskScheduler { task_path } => format!("Task: {}", task_path),
            Source::Service { service_name, .. } => format!("Service: {}", service_name),
        }
    }

    /// Stable identifier for an entry named `name` at this source.
    /// Guard sets persist these, so the format must not drift.
    pub fn item_id(&self, name: &str) -> String {
        match self {
            Source::RegistryRun { hive, key_path } => format!("run:{}:{}:{}", hive, key_path, name),
            Source::RegistryRunOnce { hive, key_path } => {
                format!("runonce:{}:{}:{}", hive, key_path, name)
            }
            Source::StartupFolder { path, .. } => format!("folder:{}", path),
            Source::TaskScheduler { task_path } => format!("task:{}", task_path),
            Source::Service { service_name, .. } => format!("service:{}", service_name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledStatus {
    Enabled,
    Disabled,
    Manual,
    Unknown,
}

impl fmt::Display for EnabledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnabledStatus::Enabled => write!(f, "Enabled"),
            EnabledStatus::Disabled => write!(f, "Disabled"),
            EnabledStatus::Manual => write!(f, "Manual"),
            EnabledStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One entry of a startup inventory snapshot.
#[derive(Debug, Clone)]
pub struct StartupItem {
    pub id: String,
    pub name: String,
    pub command: String,
    pub source: Source,
    pub enabled: EnabledStatus,
}

impl StartupItem {
    pub fn new(name: String, command: String, source: Source) -> Self {
        Self {
            id: source.item_id(&name),
            name,
            command,
            source,
            enabled: EnabledStatus::Unknown,
        }
    }

    pub fn with_status(mut self, enabled: EnabledStatus) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled == EnabledStatus::Enabled
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn entry_location(&self) -> String {
        self.source.display_location()
    }

    pub fn exe_name(&self) -> Option<String> {
        extract_exe_name(&self.command)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    pub items: Vec<StartupItem>,
}

/// Result of asking the startup-control provider to disable an entry.
#[derive(Debug, Clone)]
pub struct DisableOutcome {
    pub succeeded: bool,
    pub item: StartupItem,
    pub error_message: Option<String>,
}

impl DisableOutcome {
    pub fn success(item: StartupItem) -> Self {
        Self {
            succeeded: true,
            item,
            error_message: None,
        }
    }

    pub fn failure(item: StartupItem, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            item,
            error_message: Some(message.into()),
        }
    }
}

pub fn extract_exe_name(command: &str) -> Option<String> {
    let command = command.trim();
    if command.is_empty() {
        return None;
    }

    let path_str = if let Some(stripped) = command.strip_prefix('"') {
        stripped.split('"').next()?
    } else {
        command.split_whitespace().next()?
    };

    let expanded = expand_env_vars(path_str);

    // Windows separators are not path separators on other hosts
    let normalized = expanded.replace('\\', "/");
    Path::new(&normalized)
        .file_name()?
        .to_str()
        .map(|s| s.to_lowercase())
}

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find('%') {
        if let Some(end) = result[start + 1..].find('%') {
            let var_name = &result[start + 1..start + 1 + end];
            if let Ok(value) = std::env::var(var_name) {
                result = format!("{}{}{}", &result[..start], value, &result[start + 2 + end..]);
            } else {
                break;
            }
        } else {
            break;
        }
    }
    result
}

// ── Resource Lock Models ────────────────────────────────────────────

/// Identity of a process holding a lock. The start time, when known,
/// guards against acting on an unrelated process that reused the PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLockHandle {
    pub process_id: i64,
    pub process_start_time_utc: Option<DateTime<Utc>>,
}

impl ResourceLockHandle {
    pub fn new(process_id: i64, process_start_time_utc: Option<DateTime<Utc>>) -> Self {
        Self {
            process_id,
            process_start_time_utc,
        }
    }

    pub fn pid(process_id: i64) -> Self {
        Self::new(process_id, None)
    }
}

/// One locking process, aggregated across every inspected path it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLockInfo {
    pub handle: ResourceLockHandle,
    pub display_name: String,
    pub description: String,
    pub is_service: bool,
    pub is_critical: bool,
    pub is_restartable: bool,
    pub resource_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCloseResult {
    pub success: bool,
    pub message: String,
    pub target_count: usize,
}

impl ResourceCloseResult {
    pub fn succeeded(message: impl Into<String>, target_count: usize) -> Self {
        Self {
            success: true,
            message: message.into(),
            target_count,
        }
    }

    pub fn failed(message: impl Into<String>, target_count: usize) -> Self {
        Self {
            success: false,
            message: message.into(),
            target_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    Graceful,
    Force,
}

impl fmt::Display for CloseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseMode::Graceful => write!(f, "graceful"),
            CloseMode::Force => write!(f, "force"),
        }
    }
}
