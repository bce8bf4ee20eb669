use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tidywindow::config::{load_config, update_config, GuardConfig};
use tidywindow::guard_store::{GuardStore, JsonGuardStore};
use tidywindow::models::{CloseMode, ResourceLockHandle};
use tidywindow::preferences::PreferenceState;
use tidywindow::{ForcedCloser, LockInspector};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tidywindow")]
#[command(about = "Find and close apps holding files open, and keep startup entries disabled")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List processes holding the given files or folders open
    Locks {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Close processes by pid
    Close {
        /// Terminate instead of asking the apps to exit
        #[arg(long)]
        force: bool,
        #[arg(required = true)]
        pids: Vec<i64>,
    },
    /// Manage and run the startup guard
    Guard {
        #[command(subcommand)]
        action: GuardAction,
    },
}

#[derive(Subcommand, Debug)]
enum GuardAction {
    /// Keep guarded entries disabled until Enter is pressed
    Run {
        /// Run even if the guard is switched off in the config file
        #[arg(long)]
        enable: bool,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Switch the background guard on in the config file
    Enable,
    /// Switch the background guard off in the config file
    Disable,
    /// Guard an entry by id
    Add { id: String },
    /// Stop guarding an entry
    Remove { id: String },
    /// Show startup entries and which ones are guarded
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Locks { paths } => {
            let locks = LockInspector::platform().inspect(&paths);
            if locks.is_empty() {
                println!("No processes are holding these paths.");
            }
            for lock in locks {
                println!(
                    "{:>7}  {}  [{}]",
                    lock.handle.process_id, lock.display_name, lock.description
                );
                for path in &lock.resource_paths {
                    println!("         {}", path);
                }
            }
        }
        Command::Close { force, pids } => {
            let mode = if force {
                CloseMode::Force
            } else {
                CloseMode::Graceful
            };
            let result = ForcedCloser::platform()
                .close(pids.into_iter().map(ResourceLockHandle::pid), mode);
            println!("{}", result.message);
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Guard { action } => run_guard(action)?,
    }
    Ok(())
}

fn run_guard(action: GuardAction) -> Result<()> {
    match action {
        GuardAction::Enable => set_guard_enabled(true)?,
        GuardAction::Disable => set_guard_enabled(false)?,
        GuardAction::Add { id } => {
            if JsonGuardStore::open_default()?.add(&id)? {
                println!("Guarding {}", id);
            }
        }
        GuardAction::Remove { id } => {
            if JsonGuardStore::open_default()?.remove(&id)? {
                println!("No longer guarding {}", id);
            }
        }
        GuardAction::List => platform::list(&JsonGuardStore::open_default()?)?,
        GuardAction::Run { enable, once } => {
            let config = load_config();
            let mut state = PreferenceState::from(&config);
            if enable {
                state.run_in_background = true;
                state.startup_guard_enabled = true;
            }
            let store = Arc::new(JsonGuardStore::open_default()?);
            platform::run(store, GuardConfig::from(&config.guard), state, once)?;
        }
    }
    Ok(())
}

fn set_guard_enabled(enabled: bool) -> Result<()> {
    let config = update_config(|c| c.startup_guard_enabled = enabled)?;
    if !enabled {
        println!("Startup guard disabled");
    } else if PreferenceState::from(&config).guard_should_run() {
        println!("Startup guard enabled");
    } else {
        println!("Startup guard enabled, but inactive while background running is off");
    }
    Ok(())
}

#[cfg(windows)]
mod platform {
    use super::*;
    use tidywindow::cancel::CancellationToken;
    use tidywindow::preferences::Preferences;
    use tidywindow::startup::{StartupInventory, WindowsStartupControl, WindowsStartupInventory};
    use tidywindow::{GuardEnforcer, StartupGuardService, TracingActivityLog};

    pub fn list(store: &dyn GuardStore) -> Result<()> {
        let guarded = store.get_all()?;
        let snapshot = WindowsStartupInventory::new().get_inventory(&CancellationToken::new())?;
        for item in snapshot.items {
            let mark = if guarded.contains(&item.id) { "*" } else { " " };
            println!("{} {:<9} {:<40} {}", mark, item.enabled, item.name, item.id);
        }
        Ok(())
    }

    pub fn run(
        store: Arc<JsonGuardStore>,
        config: GuardConfig,
        state: PreferenceState,
        once: bool,
    ) -> Result<()> {
        let enforcer = Arc::new(GuardEnforcer::new(
            store,
            Arc::new(WindowsStartupInventory::new()),
            Arc::new(WindowsStartupControl::new()),
            Arc::new(TracingActivityLog),
            config,
        ));

        if once {
            let outcome = enforcer.run_pass(&CancellationToken::new())?;
            println!("{:?}", outcome);
            return Ok(());
        }

        if !state.guard_should_run() {
            println!("The startup guard is switched off; pass --enable to run it anyway.");
            return Ok(());
        }

        let preferences = Arc::new(Preferences::new(state));
        let service = StartupGuardService::new(enforcer);
        service.attach(&preferences);
        println!("Startup guard running. Press Enter to stop.");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        service.shutdown();
        Ok(())
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub fn list(_store: &dyn GuardStore) -> Result<()> {
        anyhow::bail!("The startup inventory is only available on Windows")
    }

    pub fn run(
        _store: Arc<JsonGuardStore>,
        _config: GuardConfig,
        _state: PreferenceState,
        _once: bool,
    ) -> Result<()> {
        anyhow::bail!("The startup guard is only available on Windows")
    }
}
