//! CLI smoke entry point.
//!
//! # Responsibility
//! - Wire a registry from an optional JSON config (`extpoint_cli [config.json]`).
//! - Run one mediator pass, then updater passes before and after
//!   initialization, and print every report.
//! - Keep output deterministic apart from run ids.

use extpoint_core::db::{open_db, open_db_in_memory};
use extpoint_core::{
    init_logging, CoreConfig, ExtensionError, Registry, SqliteStateStore, StepOutcome,
    TaskOutcome, UpdateReport, UpdateStateStore, Updater, UpdaterError,
};
use futures::executor::block_on;
use futures::FutureExt;
use log::info;
use std::process::ExitCode;

#[derive(Debug, Default)]
struct Shell {
    ready: Vec<&'static str>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("extpoint_cli error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), String> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::load(&path).map_err(|err| err.to_string())?,
        None => CoreConfig::default(),
    };
    if config.logging.log_dir.is_some() {
        init_logging(&config.logging)?;
    }

    let conn = match &config.state_db_path {
        Some(path) => open_db(path),
        None => open_db_in_memory(),
    }
    .map_err(|err| err.to_string())?;

    let registry = Registry::new();
    println!("extpoint_core version={}", extpoint_core::core_version());

    let mediator = registry
        .mediator::<Shell>("shell")
        .map_err(|err| err.to_string())?;
    mediator
        .step("window", |shell| {
            shell.ready.push("window");
            Ok(())
        })
        .and_then(|m| {
            m.step_async("toolbar", |shell| {
                async move {
                    shell.ready.push("toolbar");
                    Ok::<(), ExtensionError>(())
                }
                .boxed()
            })
        })
        .and_then(|m| m.step("plugins", |_| Err(ExtensionError::new("plugin dir missing"))))
        .and_then(|m| {
            m.step("status-bar", |shell| {
                shell.ready.push("status-bar");
                Ok(())
            })
        })
        .map_err(|err| err.to_string())?;

    let mediation = block_on(mediator.mediate(Shell::default()));
    for step in &mediation.steps {
        let status = match &step.outcome {
            StepOutcome::Completed => "ok".to_string(),
            StepOutcome::Skipped => "skipped".to_string(),
            StepOutcome::Failed(err) => format!("failed ({err})"),
        };
        println!("mediator step={} status={}", step.id, status);
    }
    println!("mediator ready={}", mediation.context.ready.join(","));

    let store = SqliteStateStore::with_key(&conn, config.state_key.as_str());
    let updater = registry.updater(store).map_err(|err| err.to_string())?;
    updater
        .task_sync("settings-v2", || Ok(()))
        .and_then(|u| u.task("cache-reset", || async { Ok::<(), ExtensionError>(()) }))
        .map_err(|err| err.to_string())?;

    for report in update_passes(&updater).map_err(|err| err.to_string())? {
        print_update_report(&report);
    }
    Ok(())
}

/// Runs one pass before and one after `initialize`.
///
/// On a fresh store the first pass only reports `first_run=true`; an
/// already initialized store runs its tasks twice, the second pass
/// reporting them as already applied.
fn update_passes<S: UpdateStateStore>(
    updater: &Updater<S>,
) -> Result<Vec<UpdateReport>, UpdaterError> {
    let first = block_on(updater.run_updates())?;
    if updater.initialize()? {
        info!("event=cli_updater_init module=cli status=ok");
        println!("updater state initialized");
    }
    let second = block_on(updater.run_updates())?;
    Ok(vec![first, second])
}

fn print_update_report(report: &UpdateReport) {
    println!("updater run={} first_run={}", report.run_id, report.first_run);
    for task in &report.tasks {
        let status = match &task.outcome {
            TaskOutcome::AlreadyApplied => "already-applied".to_string(),
            TaskOutcome::Succeeded => "ok".to_string(),
            TaskOutcome::Skipped => "skipped".to_string(),
            TaskOutcome::Failed(err) => format!("failed ({err})"),
        };
        println!("updater task={} status={}", task.id, status);
    }
    println!("updater run={} executed={}", report.run_id, report.executed().len());
}
