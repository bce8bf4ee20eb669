//! Application configuration persisted as `config.json` in the
//! platform data directory (`%APPDATA%\TidyWindow\` on Windows).
//!
//! A missing or unreadable file yields defaults; the guard timings in it
//! control the startup guard's cadence.

use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub run_in_background: bool,
    pub startup_guard_enabled: bool,
    pub guard: GuardTimings,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            run_in_background: true,
            startup_guard_enabled: false,
            guard: GuardTimings::default(),
        }
    }
}

/// Startup guard cadence as stored on disk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GuardTimings {
    pub initial_delay_secs: u64,
    pub normal_interval_secs: u64,
    pub rapid_interval_secs: u64,
    pub debounce_secs: u64,
    pub rapid_threshold: u32,
    pub terminate_running: bool,
}

impl Default for GuardTimings {
    fn default() -> Self {
        GuardTimings {
            initial_delay_secs: 10,
            normal_interval_secs: 60,
            rapid_interval_secs: 10,
            debounce_secs: 3,
            rapid_threshold: 2,
            terminate_running: true,
        }
    }
}

/// Runtime form of [`GuardTimings`].
#[derive(Clone, Debug, PartialEq)]
pub struct GuardConfig {
    pub initial_delay: Duration,
    pub normal_interval: Duration,
    pub rapid_interval: Duration,
    pub debounce: Duration,
    /// Consecutive violating passes tolerated before switching to the rapid cadence.
    pub rapid_threshold: u32,
    pub terminate_running: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig::from(&GuardTimings::default())
    }
}

impl From<&GuardTimings> for GuardConfig {
    fn from(t: &GuardTimings) -> Self {
        GuardConfig {
            initial_delay: Duration::from_secs(t.initial_delay_secs),
            normal_interval: Duration::from_secs(t.normal_interval_secs.max(1)),
            rapid_interval: Duration::from_secs(t.rapid_interval_secs.max(1)),
            debounce: Duration::from_secs(t.debounce_secs),
            rapid_threshold: t.rapid_threshold,
            terminate_running: t.terminate_running,
        }
    }
}

/// Get the application's data directory, creating it if needed.
pub fn get_data_directory() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "TidyWindow")
        .ok_or_else(|| anyhow!("Failed to determine user data directory"))?;

    let data_dir = project_dirs.data_dir();
    fs::create_dir_all(data_dir)
        .map_err(|e| anyhow!("Failed to create data directory: {}", e))?;

    Ok(data_dir.to_path_buf())
}

pub fn load_config() -> AppConfig {
    let Ok(data_dir) = get_data_directory() else {
        return AppConfig::default();
    };
    load_config_from(&data_dir.join(CONFIG_FILE))
}

pub fn load_config_from(path: &Path) -> AppConfig {
    let Ok(contents) = fs::read_to_string(path) else {
        return AppConfig::default();
    };
    match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

/// Load the stored config, apply `change`, and write it back.
pub fn update_config(change: impl FnOnce(&mut AppConfig)) -> Result<AppConfig> {
    let data_dir = get_data_directory()?;
    update_config_at(&data_dir.join(CONFIG_FILE), change)
}

pub fn update_config_at(path: &Path, change: impl FnOnce(&mut AppConfig)) -> Result<AppConfig> {
    let mut config = load_config_from(path);
    change(&mut config);
    save_config_to(&config, path)?;
    Ok(config)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;
    fs::write(path, json).map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
    Ok(())
}
