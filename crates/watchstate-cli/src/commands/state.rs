use crate::commands::{build_backends, exit_code_for, load_context, parse_selection};
use crate::output::Output;
use anyhow::Result;
use clap::{ArgAction, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use watchstate_core::{
    run_backup, run_export, run_import, run_progress, ExportRunOptions, ImportRunOptions,
    QueueOptions,
};

#[derive(Subcommand)]
pub enum StateCommands {
    /// Pull play state from the configured backends into the local store
    Import {
        /// Restrict to these backends (comma-separated, repeatable)
        #[arg(long = "select-backend", value_name = "NAME")]
        select_backend: Vec<String>,

        /// Only items changed after this unix timestamp
        #[arg(long, value_name = "UNIXTIME")]
        after: Option<i64>,

        /// Restrict to these library ids
        #[arg(long = "library", value_name = "ID")]
        libraries: Vec<String>,
    },
    /// Push local play state out to the configured backends
    Export {
        #[arg(long = "select-backend", value_name = "NAME")]
        select_backend: Vec<String>,

        /// Only states changed after this unix timestamp
        #[arg(long, value_name = "UNIXTIME", default_value_t = 0)]
        since: i64,

        /// Re-examine every state regardless of timestamps
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Write per-backend JSON snapshots of the store
    Backup {
        #[arg(long = "select-backend", value_name = "NAME")]
        select_backend: Vec<String>,

        /// Explicit target file (single backend only)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Push queued play positions out to the backends
    Progress {
        #[arg(long = "select-backend", value_name = "NAME")]
        select_backend: Vec<String>,
    },
}

pub async fn run(cmd: StateCommands, config_dir: Option<PathBuf>, output: &Output) -> Result<u8> {
    let ctx = match load_context(config_dir).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };
    let cancel = CancellationToken::new();

    match cmd {
        StateCommands::Import { select_backend, after, libraries } => {
            let backends = build_backends(&ctx.config, &parse_selection(&select_backend))?;
            let options = ImportRunOptions { after, libraries };
            let report = run_import(&backends, &ctx.store, &options, &cancel).await?;
            output.report("import", &report);
            Ok(exit_code_for(&report))
        }
        StateCommands::Export { select_backend, since, force } => {
            let backends = build_backends(&ctx.config, &parse_selection(&select_backend))?;
            let options = ExportRunOptions { since, force };
            let report =
                run_export(&backends, &ctx.store, &options, QueueOptions::default(), &cancel).await?;
            output.report("export", &report);
            Ok(exit_code_for(&report))
        }
        StateCommands::Backup { select_backend, file } => {
            let selection = parse_selection(&select_backend);
            let configs: Vec<_> = ctx
                .config
                .select_backends(&selection)
                .into_iter()
                .cloned()
                .collect();
            let report = run_backup(&configs, &ctx.store, &ctx.paths.backup_dir(), file).await?;
            output.report("backup", &report);
            Ok(exit_code_for(&report))
        }
        StateCommands::Progress { select_backend } => {
            let backends = build_backends(&ctx.config, &parse_selection(&select_backend))?;
            let report =
                run_progress(&backends, &ctx.store, QueueOptions::default(), &cancel).await?;
            output.report("progress", &report);
            Ok(exit_code_for(&report))
        }
    }
}
