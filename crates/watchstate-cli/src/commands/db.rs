use crate::commands::load_context;
use crate::output::Output;
use anyhow::Result;
use clap::{ArgAction, Subcommand};
use std::path::PathBuf;
use watchstate_models::MediaKind;
use watchstate_store::{PageFilter, PageSort};

#[derive(Subcommand)]
pub enum DbCommands {
    /// Page through stored states
    List {
        #[arg(long, default_value_t = 25)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Filter by kind: movie, episode or show
        #[arg(long)]
        kind: Option<String>,

        /// Filter by the backend that last wrote the state
        #[arg(long)]
        via: Option<String>,

        /// Filter to states known to this backend
        #[arg(long)]
        backend: Option<String>,

        /// Filter by watched flag
        #[arg(long)]
        watched: Option<bool>,
    },
    /// States acknowledged by fewer than N backends
    Parity {
        #[arg(long, default_value_t = 2)]
        min: i64,
    },
    /// Delete states acknowledged by fewer than N backends
    Prune {
        #[arg(long, default_value_t = 2)]
        min: i64,

        /// Actually delete; without this the command only reports
        #[arg(long, action = ArgAction::SetTrue)]
        confirm: bool,
    },
}

pub async fn run(cmd: DbCommands, config_dir: Option<PathBuf>, output: &Output) -> Result<u8> {
    let ctx = match load_context(config_dir).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    match cmd {
        DbCommands::List { limit, offset, kind, via, backend, watched } => {
            let kind = match kind.as_deref() {
                Some(raw) => match MediaKind::parse(raw) {
                    Some(kind) => Some(kind),
                    None => {
                        eprintln!("unknown kind '{raw}', expected movie, episode or show");
                        return Ok(crate::EXIT_FAILURE);
                    }
                },
                None => None,
            };
            let filter = PageFilter { kind, via, backend, watched };
            let (states, total) = ctx.store.page(&filter, PageSort::UpdatedDesc, limit, offset).await?;

            output.line(format!("{total} state(s), showing {}:", states.len()));
            for state in &states {
                output.line(format!(
                    "  #{} [{}] '{}' watched={} via={} updated={} backends={}",
                    state.id,
                    state.kind.as_str(),
                    state.title,
                    state.watched,
                    state.via,
                    state.updated,
                    state.metadata.len(),
                ));
            }
            Ok(crate::EXIT_OK)
        }
        DbCommands::Parity { min } => {
            let stragglers = ctx.store.parity(min).await?;
            output.line(format!("{} state(s) known to fewer than {min} backend(s):", stragglers.len()));
            for state in &stragglers {
                output.line(format!(
                    "  #{} '{}' backends={:?}",
                    state.id,
                    state.title,
                    state.metadata.keys().collect::<Vec<_>>(),
                ));
            }
            Ok(crate::EXIT_OK)
        }
        DbCommands::Prune { min, confirm } => {
            if !confirm {
                let stragglers = ctx.store.parity(min).await?;
                output.line(format!(
                    "would delete {} state(s); re-run with --confirm to proceed",
                    stragglers.len()
                ));
                return Ok(crate::EXIT_OK);
            }
            let pruned = ctx.store.prune_parity(min).await?;
            output.line(format!("deleted {pruned} state(s)"));
            Ok(crate::EXIT_OK)
        }
    }
}
