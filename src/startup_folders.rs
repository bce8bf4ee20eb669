use std::path::{Path, PathBuf};

fn startup_subfolder(root: PathBuf) -> PathBuf {
    root.join("Microsoft")
        .join("Windows")
        .join("Start Menu")
        .join("Programs")
        .join("Startup")
}

pub fn user_startup_folder() -> Option<PathBuf> {
    std::env::var_os("APPDATA").map(|appdata| startup_subfolder(PathBuf::from(appdata)))
}

pub fn common_startup_folder() -> Option<PathBuf> {
    std::env::var_os("ProgramData").map(|pd| startup_subfolder(PathBuf::from(pd)))
}

/// Both startup folders with whether each is the all-users one.
pub fn startup_folders() -> Vec<(PathBuf, bool)> {
    let mut folders = Vec::new();
    if let Some(folder) = user_startup_folder() {
        folders.push((folder, false));
    }
    if let Some(folder) = common_startup_folder() {
        folders.push((folder, true));
    }
    folders
}

pub fn is_shortcut(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("lnk"))
        .unwrap_or(false)
}

#[cfg(windows)]
pub use self::scan::collect_startup_folder_entries;

#[cfg(windows)]
mod scan {
    use super::*;
    use crate::models::{Source, StartupItem};

    fn resolve_lnk(path: &Path) -> Option<String> {
        let shortcut = lnk::ShellLink::open(path).ok()?;
        let target = shortcut
            .link_info()
            .as_ref()
            .and_then(|li| li.local_base_path().clone())?;
        let args = shortcut
            .arguments()
            .as_ref()
            .map(|a| format!(" {}", a))
            .unwrap_or_default();
        Some(format!("{}{}", target, args))
    }

    fn scan_startup_folder(folder: &Path, is_common: bool) -> Vec<StartupItem> {
        let read_dir = match std::fs::read_dir(folder) {
            Ok(rd) => rd,
            Err(_) => return Vec::new(),
        };

        let mut items = Vec::new();
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }

            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if file_name.eq_ignore_ascii_case("desktop.ini") {
                continue;
            }

            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&file_name)
                .to_string();

            let command = match ext.as_str() {
                "lnk" => resolve_lnk(&path).unwrap_or_else(|| path.to_string_lossy().to_string()),
                "exe" | "bat" | "cmd" => path.to_string_lossy().to_string(),
                _ => continue,
            };

            let source = Source::StartupFolder {
                path: path.to_string_lossy().to_string(),
                is_common,
            };
            items.push(StartupItem::new(stem, command, source));
        }

        items
    }

    pub fn collect_startup_folder_entries() -> Vec<StartupItem> {
        startup_folders()
            .into_iter()
            .flat_map(|(folder, is_common)| scan_startup_folder(&folder, is_common))
            .collect()
    }
}
