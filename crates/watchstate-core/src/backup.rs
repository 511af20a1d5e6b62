use crate::report::RunReport;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use watchstate_config::BackendConfig;
use watchstate_store::{PageFilter, PageSort, StateStore};

const BACKUP_PAGE_SIZE: i64 = 1000;

/// Write one JSON snapshot per backend:
/// `{backup_dir}/{backend}.{YYYYMMDD}.json`, or `file` when a single
/// explicit target is given. Pages stream through so the whole table is
/// never held in memory.
pub async fn run_backup(
    backends: &[BackendConfig],
    store: &StateStore,
    backup_dir: &Path,
    file: Option<PathBuf>,
) -> Result<RunReport> {
    let mut report = RunReport::new();
    std::fs::create_dir_all(backup_dir)
        .with_context(|| format!("creating backup dir {}", backup_dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y%m%d").to_string();

    for config in backends {
        let target = match (&file, backends.len()) {
            (Some(path), 1) => path.clone(),
            _ => backup_dir.join(format!("{}.{stamp}.json", config.name)),
        };
        match backup_backend(config, store, &target).await {
            Ok(count) => {
                report.backend_mut(&config.name).items = count;
                info!(backend = %config.name, count, file = %target.display(), "backup written");
            }
            Err(e) => {
                report.record_error(&config.name, format!("backup: {e}"));
            }
        }
    }
    Ok(report)
}

async fn backup_backend(config: &BackendConfig, store: &StateStore, target: &Path) -> Result<u64> {
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(target)
            .with_context(|| format!("creating {}", target.display()))?,
    );

    let filter = PageFilter { backend: Some(config.name.clone()), ..Default::default() };
    let mut offset = 0i64;
    let mut written = 0u64;

    out.write_all(b"[\n")?;
    loop {
        let (states, _total) = store.page(&filter, PageSort::IdAsc, BACKUP_PAGE_SIZE, offset).await?;
        if states.is_empty() {
            break;
        }
        for state in &states {
            if written > 0 {
                out.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut out, state)?;
            written += 1;
        }
        offset += BACKUP_PAGE_SIZE;
    }
    out.write_all(b"\n]\n")?;
    out.flush()?;
    Ok(written)
}
