use crate::commands::{build_backends, load_context};
use crate::output::Output;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watchstate_config::AppConfig;
use watchstate_core::{
    drain_requests, run_backup, run_export, run_import, run_progress, ExportRunOptions,
    ImportRunOptions, QueueOptions,
};
use watchstate_store::StateStore;

/// The webhook request bucket is drained on a fixed cadence; everything else
/// follows the `WS_CRON_*` schedules.
const DRAIN_SCHEDULE: &str = "0 * * * * *";

/// Accept standard five-field cron by prepending a seconds column.
fn normalize_schedule(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub async fn run(config_dir: Option<PathBuf>, output: &Output) -> Result<u8> {
    let ctx = match load_context(config_dir).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };
    let config = Arc::new(ctx.config);
    let store = ctx.store;
    let cancel = CancellationToken::new();

    let mut scheduler = JobScheduler::new().await?;

    {
        let config = Arc::clone(&config);
        let store = store.clone();
        scheduler
            .add(Job::new_async(DRAIN_SCHEDULE, move |_id, _sched| {
                let config = Arc::clone(&config);
                let store = store.clone();
                Box::pin(async move {
                    match drain_requests(&config, &store).await {
                        Ok(0) => {}
                        Ok(drained) => info!(drained, "webhook drainer flushed"),
                        Err(e) => error!(error = %e, "webhook drainer failed"),
                    }
                })
            })?)
            .await?;
    }

    let crons = [
        ("import", config.crons.import.clone()),
        ("export", config.crons.export.clone()),
        ("backup", config.crons.backup.clone()),
        ("progress", config.crons.progress.clone()),
    ];
    for (operation, schedule) in crons {
        let Some(schedule) = schedule else {
            continue;
        };
        let schedule = normalize_schedule(&schedule);
        info!(operation, schedule = %schedule, "scheduling");

        let config = Arc::clone(&config);
        let store = store.clone();
        let cancel = cancel.clone();
        let paths_backup_dir = ctx.paths.backup_dir();
        scheduler
            .add(Job::new_async(schedule.as_str(), move |_id, _sched| {
                let config = Arc::clone(&config);
                let store = store.clone();
                let cancel = cancel.clone();
                let backup_dir = paths_backup_dir.clone();
                Box::pin(async move {
                    info!(operation, "scheduled run starting");
                    let result = scheduled_run(operation, &config, &store, &backup_dir, &cancel).await;
                    match result {
                        Ok(items) => info!(operation, items, "scheduled run finished"),
                        Err(e) => error!(operation, error = %format!("{e:#}"), "scheduled run failed"),
                    }
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    output.line("scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down scheduler");
    cancel.cancel();
    scheduler.shutdown().await?;
    Ok(crate::EXIT_OK)
}

async fn scheduled_run(
    operation: &str,
    config: &AppConfig,
    store: &StateStore,
    backup_dir: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let backends = build_backends(config, &[])?;
    let report = match operation {
        "import" => run_import(&backends, store, &ImportRunOptions::default(), cancel).await?,
        "export" => {
            run_export(
                &backends,
                store,
                &ExportRunOptions::default(),
                QueueOptions::default(),
                cancel,
            )
            .await?
        }
        "backup" => {
            let configs: Vec<_> = config.backends.clone();
            run_backup(&configs, store, backup_dir, None).await?
        }
        "progress" => run_progress(&backends, store, QueueOptions::default(), cancel).await?,
        other => anyhow::bail!("unknown scheduled operation '{other}'"),
    };
    if !report.ok() {
        for (name, entry) in &report.backends {
            for error in &entry.errors {
                error!(operation, backend = %name, error = %error, "scheduled run error");
            }
        }
    }
    Ok(report.total_items())
}
