//! Startup-folder watchers: any shortcut appearing, changing or vanishing
//! wakes the guard loop.

use crate::startup_folders;
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

pub struct FolderWatcher {
    folder: PathBuf,
    // Dropping the watcher unregisters it.
    _watcher: RecommendedWatcher,
}

impl FolderWatcher {
    pub fn start(folder: &Path, signal: Sender<()>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if is_shortcut_event(&event) {
                        let _ = signal.try_send(());
                    }
                }
            },
            Config::default(),
        )
        .context("Failed to create folder watcher")?;

        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", folder.display()))?;
        tracing::debug!(folder = %folder.display(), "startup folder watcher started");

        Ok(Self {
            folder: folder.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

fn is_shortcut_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| startup_folders::is_shortcut(p))
}

/// Watchers for the per-user and all-users startup folders that exist.
pub fn start_all(signal: &Sender<()>) -> Vec<FolderWatcher> {
    startup_folders::startup_folders()
        .into_iter()
        .filter(|(folder, _)| folder.is_dir())
        .filter_map(|(folder, _)| match FolderWatcher::start(&folder, signal.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::debug!(folder = %folder.display(), error = %format!("{:#}", e), "folder watcher unavailable");
                None
            }
        })
        .collect()
}
