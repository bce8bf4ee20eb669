use crate::models::{EnabledStatus, Source, StartupItem};
use anyhow::{Context, Result};
use windows::core::{Interface, BSTR};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
};
use windows::Win32::System::TaskScheduler::*;
use windows::Win32::System::Variant::VARIANT;

/// Scheduled tasks with a logon trigger, i.e. the ones that behave like startup entries.
pub fn collect_task_scheduler_entries() -> Result<Vec<StartupItem>> {
    unsafe {
        let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
    }

    let result = unsafe { collect_inner() };

    unsafe {
        CoUninitialize();
    }

    result
}

unsafe fn collect_inner() -> Result<Vec<StartupItem>> {
    let service: ITaskService = CoCreateInstance(&TaskScheduler, None, CLSCTX_INPROC_SERVER)
        .context("Failed to create ITaskService")?;

    service
        .Connect(
            &VARIANT::default(),
            &VARIANT::default(),
            &VARIANT::default(),
            &VARIANT::default(),
        )
        .context("Failed to connect to Task Scheduler")?;

    let root_folder = service
        .GetFolder(&BSTR::from("\\"))
        .context("Failed to get root folder")?;

    let mut items = Vec::new();
    enumerate_folder(&root_folder, &mut items);
    Ok(items)
}

unsafe fn enumerate_folder(folder: &ITaskFolder, items: &mut Vec<StartupItem>) {
    if let Ok(tasks) = folder.GetTasks(0) {
        if let Ok(count) = tasks.Count() {
            for i in 1..=count {
                if let Ok(task) = tasks.get_Item(&VARIANT::from(i)) {
                    if let Some(item) = logon_task(&task) {
                        items.push(item);
                    }
                }
            }
        }
    }

    if let Ok(folders) = folder.GetFolders(0) {
        if let Ok(count) = folders.Count() {
            for i in 1..=count {
                if let Ok(subfolder) = folders.get_Item(&VARIANT::from(i)) {
                    enumerate_folder(&subfolder, items);
                }
            }
        }
    }
}

unsafe fn logon_task(task: &IRegisteredTask) -> Option<StartupItem> {
    let definition = task.Definition().ok()?;
    if !has_logon_trigger(&definition) || runs_as_service_account(&definition) {
        return None;
    }

    let command = task_command(&definition)?;
    let name = task.Name().ok()?.to_string();
    let task_path = task.Path().ok()?.to_string();

    let enabled = match task.Enabled() {
        Ok(e) if e.as_bool() => EnabledStatus::Enabled,
        Ok(_) => EnabledStatus::Disabled,
        Err(_) => EnabledStatus::Unknown,
    };

    Some(StartupItem::new(name, command, Source::TaskScheduler { task_path }).with_status(enabled))
}

unsafe fn has_logon_trigger(definition: &ITaskDefinition) -> bool {
    let Ok(triggers) = definition.Triggers() else {
        return false;
    };
    let mut count = 0i32;
    if triggers.Count(&mut count).is_err() {
        return false;
    }
    (1..=count).any(|i| {
        triggers
            .get_Item(i)
            .ok()
            .map(|trigger| {
                let mut trigger_type = TASK_TRIGGER_EVENT;
                trigger.Type(&mut trigger_type).is_ok() && trigger_type == TASK_TRIGGER_LOGON
            })
            .unwrap_or(false)
    })
}

unsafe fn runs_as_service_account(definition: &ITaskDefinition) -> bool {
    if let Ok(principal) = definition.Principal() {
        let mut logon_type = TASK_LOGON_NONE;
        if principal.LogonType(&mut logon_type).is_ok()
            && (logon_type == TASK_LOGON_SERVICE_ACCOUNT || logon_type == TASK_LOGON_S4U)
        {
            return true;
        }
    }
    task_command(definition)
        .map(|cmd| cmd.to_lowercase().contains("svchost.exe"))
        .unwrap_or(false)
}

unsafe fn task_command(definition: &ITaskDefinition) -> Option<String> {
    let actions = definition.Actions().ok()?;
    let mut count = 0i32;
    actions.Count(&mut count).ok()?;

    for i in 1..=count {
        let Ok(action) = actions.get_Item(i) else {
            continue;
        };
        let mut action_type = TASK_ACTION_EXEC;
        if action.Type(&mut action_type).is_err() || action_type != TASK_ACTION_EXEC {
            continue;
        }
        let Ok(exec_action) = action.cast::<IExecAction>() else {
            continue;
        };
        let mut path = BSTR::default();
        if exec_action.Path(&mut path).is_ok() && !path.is_empty() {
            let mut args = BSTR::default();
            let _ = exec_action.Arguments(&mut args);
            return Some(if args.is_empty() {
                path.to_string()
            } else {
                format!("{} {}", path, args)
            });
        }
    }

    None
}
