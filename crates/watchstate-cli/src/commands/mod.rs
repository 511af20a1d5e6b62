pub mod backend;
pub mod db;
pub mod serve;
pub mod state;
pub mod system;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use watchstate_backends::{make_backend, Backend};
use watchstate_config::{env as ws_env, AppConfig, BackendConfig, PathManager};
use watchstate_core::RunReport;
use watchstate_store::{StateStore, StoreConfig};

pub fn path_manager(config_dir: Option<PathBuf>) -> PathManager {
    match config_dir {
        Some(dir) => PathManager::with_base(dir),
        None => PathManager::default(),
    }
}

/// Everything a command needs: parsed config, path layout, open store.
pub struct AppContext {
    pub config: AppConfig,
    pub paths: PathManager,
    pub store: StateStore,
}

/// Load the parsed backend definitions and open the database, mapping
/// failures onto the exit-code contract: configuration problems exit 2, an
/// unopenable store is fatal and exits 1.
///
/// The engine consumes already-parsed configuration; this front-end reads it
/// as JSON from `config/servers.json` under the config dir. A missing file
/// is an empty configuration, not an error, so db commands still work.
pub async fn load_context(config_dir: Option<PathBuf>) -> Result<AppContext, u8> {
    let paths = path_manager(config_dir);
    if let Err(e) = paths.ensure_directories() {
        eprintln!("error: {e:#}");
        return Err(crate::EXIT_FAILURE);
    }

    let servers_file = paths.servers_file().with_extension("json");
    let config_result: Result<AppConfig> = (|| {
        let mut config: AppConfig = if servers_file.exists() {
            let raw = std::fs::read_to_string(&servers_file)
                .with_context(|| format!("reading {}", servers_file.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", servers_file.display()))?
        } else {
            AppConfig::default()
        };
        config.crons = ws_env::crons_from_env();
        if config.api_key.is_none() {
            config.api_key = ws_env::api_key_from_env();
        }
        config.validate().context("invalid backend configuration")?;
        Ok(config)
    })();
    let config = match config_result {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return Err(crate::EXIT_CONFIG);
        }
    };

    match StateStore::open(StoreConfig::new(paths.database_file())).await {
        Ok(store) => Ok(AppContext { config, paths, store }),
        Err(e) => {
            eprintln!("error: state store unopenable: {e:#}");
            Err(crate::EXIT_FAILURE)
        }
    }
}

/// Build adapters for the selected backends (empty selection = all).
pub fn build_backends(
    config: &AppConfig,
    selection: &[String],
) -> Result<Vec<(BackendConfig, Arc<dyn Backend>)>> {
    let selected = config.select_backends(selection);
    if !selection.is_empty() && selected.len() != selection.len() {
        anyhow::bail!("unknown backend in selection: {:?}", selection);
    }
    let mut backends = Vec::with_capacity(selected.len());
    for backend_config in selected {
        let adapter = make_backend(backend_config)
            .map_err(|e| anyhow::anyhow!("backend '{}': {e}", backend_config.name))?;
        backends.push((backend_config.clone(), Arc::from(adapter)));
    }
    Ok(backends)
}

/// Map a run report onto the exit-code contract: 0 clean, 1 partial,
/// 3 when no backend produced anything.
pub fn exit_code_for(report: &RunReport) -> u8 {
    if report.ok() {
        crate::EXIT_OK
    } else if report.any_succeeded() {
        crate::EXIT_FAILURE
    } else {
        crate::EXIT_BACKEND
    }
}

/// Comma-separated `--select-backend` values flattened into a list.
pub fn parse_selection(select: &[String]) -> Vec<String> {
    select
        .iter()
        .flat_map(|chunk| chunk.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
