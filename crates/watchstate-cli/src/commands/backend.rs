use crate::commands::{build_backends, load_context};
use crate::output::Output;
use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use watchstate_backends::LibraryKind;
use watchstate_models::MediaKind;

#[derive(Subcommand)]
pub enum BackendCommands {
    /// List a backend's libraries
    List {
        backend: String,
    },
    /// Items whose kind does not fit the library they live in
    Mismatch {
        backend: String,
    },
    /// Items without any external id (they rely on virtual/relative ids)
    Unmatched {
        backend: String,
    },
}

pub async fn run(cmd: BackendCommands, config_dir: Option<PathBuf>, output: &Output) -> Result<u8> {
    let ctx = match load_context(config_dir).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let name = match &cmd {
        BackendCommands::List { backend }
        | BackendCommands::Mismatch { backend }
        | BackendCommands::Unmatched { backend } => backend.clone(),
    };
    let backends = build_backends(&ctx.config, &[name.clone()])?;
    let Some((config, adapter)) = backends.into_iter().next() else {
        eprintln!("no such backend '{name}'");
        return Ok(crate::EXIT_CONFIG);
    };

    let libraries = match adapter.list_libraries().await {
        Ok(libraries) => libraries,
        Err(e) => {
            eprintln!("backend '{}': {e}", config.name);
            return Ok(crate::EXIT_BACKEND);
        }
    };

    match cmd {
        BackendCommands::List { .. } => {
            output.line(format!("{} library(ies) on '{}':", libraries.len(), config.name));
            for library in &libraries {
                let kind = match &library.kind {
                    LibraryKind::Movies => "movies",
                    LibraryKind::Shows => "shows",
                    LibraryKind::Other(other) => other.as_str(),
                };
                let ignored = if adapter.context().is_ignored_library(&library.id) {
                    " [ignored]"
                } else {
                    ""
                };
                output.line(format!("  {} '{}' ({kind}){ignored}", library.id, library.title));
            }
            Ok(crate::EXIT_OK)
        }
        BackendCommands::Mismatch { .. } => {
            let mut found = 0u64;
            for library in libraries.iter().filter(|l| l.supported()) {
                let expected = match library.kind {
                    LibraryKind::Movies => MediaKind::Movie,
                    _ => MediaKind::Episode,
                };
                for state in fetch_all(&config, adapter.as_ref(), library).await? {
                    if state.kind != expected {
                        found += 1;
                        output.line(format!(
                            "  '{}' is a {} inside {} library '{}'",
                            state.title,
                            state.kind.as_str(),
                            match library.kind {
                                LibraryKind::Movies => "movie",
                                _ => "show",
                            },
                            library.title,
                        ));
                    }
                }
            }
            output.line(format!("{found} mismatched item(s)"));
            Ok(crate::EXIT_OK)
        }
        BackendCommands::Unmatched { .. } => {
            let mut found = 0u64;
            for library in libraries.iter().filter(|l| l.supported()) {
                for state in fetch_all(&config, adapter.as_ref(), library).await? {
                    if state.guids.is_empty() {
                        found += 1;
                        output.line(format!(
                            "  '{}' in '{}' has no external ids",
                            state.title, library.title,
                        ));
                    }
                }
            }
            output.line(format!("{found} unmatched item(s)"));
            Ok(crate::EXIT_OK)
        }
    }
}

async fn fetch_all(
    config: &watchstate_config::BackendConfig,
    adapter: &dyn watchstate_backends::Backend,
    library: &watchstate_backends::Library,
) -> Result<Vec<watchstate_models::State>> {
    let total = adapter
        .library_total(library)
        .await
        .map_err(|e| anyhow::anyhow!("count probe for '{}': {e}", library.title))?;
    let parents = adapter.series_parents(library).await.unwrap_or_default();

    let segment = config.options.segment_size.max(1);
    let mut states = Vec::new();
    let mut offset = 0u64;
    while offset < total {
        let page = adapter
            .fetch_page(library, offset, segment, &parents, None)
            .await
            .map_err(|e| anyhow::anyhow!("page {offset} of '{}': {e}", library.title))?;
        states.extend(page.states);
        offset += segment as u64;
    }
    Ok(states)
}
