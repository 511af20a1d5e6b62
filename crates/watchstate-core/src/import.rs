use crate::mapper::MemoryMapper;
use crate::report::RunReport;
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watchstate_backends::{Backend, ErrorKind, Library};
use watchstate_config::BackendConfig;
use watchstate_store::StateStore;

/// Whole-run ceiling for an import.
pub const IMPORT_RUN_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// How many backends import concurrently.
const BACKEND_PARALLELISM: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct ImportRunOptions {
    /// Drop items whose authoritative timestamp is at or before this cutoff.
    pub after: Option<i64>,
    /// Restrict to these library ids (empty = all admitted libraries).
    pub libraries: Vec<String>,
}

/// Pull library state from every import-enabled backend into the store.
///
/// Backends run concurrently (bounded); inside a backend, segments of one
/// library are fetched concurrently and merge in request-completion order.
/// The merge rules are commutative for non-tainted writes, so segment order
/// does not affect the final state.
pub async fn run_import(
    backends: &[(BackendConfig, Arc<dyn Backend>)],
    store: &StateStore,
    options: &ImportRunOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    match tokio::time::timeout(IMPORT_RUN_TIMEOUT, import_inner(backends, store, options, cancel))
        .await
    {
        Ok(result) => result,
        Err(_) => anyhow::bail!("import run exceeded {}s", IMPORT_RUN_TIMEOUT.as_secs()),
    }
}

async fn import_inner(
    backends: &[(BackendConfig, Arc<dyn Backend>)],
    store: &StateStore,
    options: &ImportRunOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let mapper = Arc::new(Mutex::new(MemoryMapper::load(store).await?));
    let report = Arc::new(Mutex::new(RunReport::new()));

    stream::iter(backends.iter().filter(|(config, _)| config.import.enabled))
        .for_each_concurrent(BACKEND_PARALLELISM, |(config, backend)| {
            let mapper = Arc::clone(&mapper);
            let report = Arc::clone(&report);
            async move {
                import_backend(config, backend.as_ref(), &mapper, &report, options, cancel).await;
            }
        })
        .await;

    let flushed = mapper.lock().await.commit(store).await?;
    info!(flushed, "import committed");

    let report = report.lock().await.clone();
    Ok(report)
}

async fn import_backend(
    config: &BackendConfig,
    backend: &dyn Backend,
    mapper: &Mutex<MemoryMapper>,
    report: &Mutex<RunReport>,
    options: &ImportRunOptions,
    cancel: &CancellationToken,
) {
    let name = &config.name;

    let libraries = match backend.list_libraries().await {
        Ok(libraries) => libraries,
        Err(e) => {
            error!(backend = %name, error = %e, "listing libraries failed, aborting backend");
            report.lock().await.record_error(name, format!("list libraries: {e}"));
            return;
        }
    };

    let admitted: Vec<Library> = libraries
        .into_iter()
        .filter(|library| {
            if backend.context().is_ignored_library(&library.id) {
                debug!(backend = %name, library = %library.title, "library ignored by config");
                return false;
            }
            if !library.supported() {
                debug!(backend = %name, library = %library.title, "unsupported library type");
                return false;
            }
            options.libraries.is_empty() || options.libraries.contains(&library.id)
        })
        .collect();
    report.lock().await.backend_mut(name).libraries = admitted.len() as u64;

    for library in &admitted {
        if cancel.is_cancelled() {
            warn!(backend = %name, "import cancelled");
            return;
        }
        if let Err(aborted) =
            import_library(config, backend, library, mapper, report, options, cancel).await
        {
            if aborted {
                return;
            }
        }
    }
}

/// Returns Err(true) when the whole backend must be abandoned (auth failure).
async fn import_library(
    config: &BackendConfig,
    backend: &dyn Backend,
    library: &Library,
    mapper: &Mutex<MemoryMapper>,
    report: &Mutex<RunReport>,
    options: &ImportRunOptions,
    cancel: &CancellationToken,
) -> Result<(), bool> {
    let name = &config.name;

    let total = match backend.library_total(library).await {
        Ok(total) => total,
        Err(e) => {
            let abort = e.kind == ErrorKind::Auth;
            error!(backend = %name, library = %library.title, error = %e, "count probe failed");
            report.lock().await.record_error(name, format!("{}: count probe: {e}", library.title));
            return Err(abort);
        }
    };
    if total == 0 {
        debug!(backend = %name, library = %library.title, "library is empty");
        return Ok(());
    }

    // Parent ids let episodes without their own external ids still resolve.
    let parents = match backend.series_parents(library).await {
        Ok(parents) => parents,
        Err(e) => {
            warn!(backend = %name, library = %library.title, error = %e, "series id prefetch failed");
            report
                .lock()
                .await
                .record_error(name, format!("{}: series prefetch: {e}", library.title));
            Default::default()
        }
    };

    let segment_size = config.options.segment_size.max(1);
    let offsets: Vec<u64> = (0..total).step_by(segment_size as usize).collect();
    info!(
        backend = %name,
        library = %library.title,
        total,
        segments = offsets.len(),
        segment_size,
        "importing library"
    );

    let mut parsed: u64 = 0;
    let mut dropped: u64 = 0;

    let mut pages = stream::iter(offsets.into_iter().map(|offset| {
        let parents = &parents;
        async move {
            (offset, backend.fetch_page(library, offset, segment_size, parents, options.after).await)
        }
    }))
    .buffer_unordered(config.options.workers.max(1));

    while let Some((offset, result)) = pages.next().await {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match result {
            Ok(page) => {
                parsed += page.states.len() as u64;
                dropped += page.dropped;
                {
                    let mut report = report.lock().await;
                    let entry = report.backend_mut(name);
                    entry.items += page.states.len() as u64;
                    entry.dropped += page.dropped;
                    entry.response_size += page.bytes as u64;
                }
                let mut mapper = mapper.lock().await;
                for state in page.states {
                    mapper.add(state);
                }
            }
            Err(e) => {
                let abort = e.kind == ErrorKind::Auth;
                error!(
                    backend = %name,
                    library = %library.title,
                    offset,
                    error = %e,
                    "segment fetch failed"
                );
                report
                    .lock()
                    .await
                    .record_error(name, format!("{}@{offset}: {e}", library.title));
                if abort {
                    return Err(true);
                }
                // Account the whole segment as dropped so totals reconcile.
                dropped += segment_size.min((total - offset.min(total)) as u32) as u64;
            }
        }
    }

    // Cutoff-filtered items are dropped inside the adapter, so with a cutoff
    // active the two sides legitimately diverge.
    if options.after.is_none() && parsed + dropped != total {
        warn!(
            backend = %name,
            library = %library.title,
            parsed,
            dropped,
            total,
            "segment totals do not reconcile with backend count"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use watchstate_backends::{
        ActionSink, BackendContext, BackendError, BackendUser, FetchedPage, LibraryKind,
        ParentCache, RequestAttributes, WebhookRequest,
    };
    use watchstate_config::{BackendKind, BackendOptions, ExportOptions, ImportOptions, WebhookOptions};
    use watchstate_models::guid::GuidSource;
    use watchstate_models::{BackendMetadata, GuidMap, MediaKind, State};

    /// In-memory backend: `total` items, one per offset, failing whole
    /// requests when `fail` is set.
    #[derive(Debug)]
    struct FakeBackend {
        context: BackendContext,
        total: u64,
        fail: bool,
        requested_offsets: StdMutex<Vec<(u64, u32)>>,
    }

    impl FakeBackend {
        fn new(name: &str, total: u64, fail: bool) -> Self {
            Self {
                context: BackendContext {
                    name: name.to_string(),
                    base_url: "http://fake".to_string(),
                    token: "t".to_string(),
                    user_id: "u".to_string(),
                    backend_id: None,
                    options: HashMap::new(),
                    segment_size: 1000,
                    ignored_libraries: vec![],
                },
                total,
                fail,
                requested_offsets: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn context(&self) -> &BackendContext {
            &self.context
        }

        fn with_context(&self, context: BackendContext) -> Box<dyn Backend> {
            Box::new(FakeBackend { context, total: self.total, fail: self.fail, requested_offsets: StdMutex::new(vec![]) })
        }

        async fn identifier(&self, _force: bool) -> Result<String, BackendError> {
            Ok("fake-uuid".to_string())
        }

        async fn version(&self) -> Result<String, BackendError> {
            Ok("1.0".to_string())
        }

        async fn list_users(&self) -> Result<Vec<BackendUser>, BackendError> {
            Ok(vec![])
        }

        async fn list_libraries(&self) -> Result<Vec<Library>, BackendError> {
            if self.fail {
                return Err(BackendError::transient("connection refused"));
            }
            Ok(vec![
                Library { id: "1".into(), title: "Movies".into(), kind: LibraryKind::Movies },
                Library { id: "9".into(), title: "Music".into(), kind: LibraryKind::Other("music".into()) },
            ])
        }

        async fn library_total(&self, _library: &Library) -> Result<u64, BackendError> {
            Ok(self.total)
        }

        async fn series_parents(&self, _library: &Library) -> Result<ParentCache, BackendError> {
            Ok(ParentCache::new())
        }

        async fn fetch_page(
            &self,
            _library: &Library,
            offset: u64,
            limit: u32,
            _parents: &ParentCache,
            _after: Option<i64>,
        ) -> Result<FetchedPage, BackendError> {
            self.requested_offsets.lock().unwrap().push((offset, limit));
            let count = limit.min((self.total - offset) as u32);
            let mut page = FetchedPage { bytes: count as usize * 100, ..Default::default() };
            for i in 0..count {
                let n = offset + i as u64;
                let mut state = State::new(MediaKind::Movie, &self.context.name, format!("Movie {n}"));
                state.guids.insert(GuidSource::Imdb, format!("tt{:07}", n + 1));
                state.updated = 1000 + n as i64;
                state.metadata.insert(
                    self.context.name.clone(),
                    BackendMetadata { id: n.to_string(), ..Default::default() },
                );
                page.states.push(state);
            }
            Ok(page)
        }

        async fn get_metadata(&self, _remote_id: &str) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::Value::Null)
        }

        async fn search(&self, _q: &str, _l: u32) -> Result<Vec<serde_json::Value>, BackendError> {
            Ok(vec![])
        }

        async fn search_by_id(&self, _id: &str) -> Result<Option<serde_json::Value>, BackendError> {
            Ok(None)
        }

        async fn search_by_guids(
            &self,
            _guids: &GuidMap,
        ) -> Result<Option<BackendMetadata>, BackendError> {
            Ok(None)
        }

        fn inspect_request(&self, _r: &WebhookRequest) -> Result<RequestAttributes, BackendError> {
            Ok(RequestAttributes::default())
        }

        fn parse_webhook(&self, _r: &WebhookRequest) -> Result<State, BackendError> {
            Err(BackendError::validation("not supported"))
        }

        fn push(&self, _s: &[State], _sink: &dyn ActionSink) -> Result<u64, BackendError> {
            Ok(0)
        }

        fn push_progress(
            &self,
            _s: &[State],
            _v: &str,
            _sink: &dyn ActionSink,
        ) -> Result<u64, BackendError> {
            Ok(0)
        }
    }

    fn config(name: &str, segment_size: u32) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: BackendKind::Jellyfin,
            url: "http://fake".to_string(),
            token: "t".to_string(),
            user_id: "u".to_string(),
            uuid: None,
            import: ImportOptions::default(),
            export: ExportOptions::default(),
            webhook: WebhookOptions::default(),
            options: BackendOptions { segment_size, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn segmented_import_covers_the_whole_library() {
        let store = StateStore::open_in_memory().await.unwrap();
        let fake = Arc::new(FakeBackend::new("home_jellyfin", 2350, false));
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> =
            vec![(config("home_jellyfin", 1000), fake.clone() as Arc<dyn Backend>)];

        let report = run_import(
            &backends,
            &store,
            &ImportRunOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut offsets = fake.requested_offsets.lock().unwrap().clone();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![(0, 1000), (1000, 1000), (2000, 1000)]);

        let entry = &report.backends["home_jellyfin"];
        assert_eq!(entry.items, 2350);
        assert_eq!(entry.dropped, 0);
        assert_eq!(entry.response_size, 2350 * 100);
        assert!(report.ok());
        assert_eq!(store.count().await.unwrap(), 2350);
    }

    #[tokio::test]
    async fn unreachable_backend_does_not_stop_the_others() {
        let store = StateStore::open_in_memory().await.unwrap();
        let good = Arc::new(FakeBackend::new("good_one", 10, false));
        let also_good = Arc::new(FakeBackend::new("good_two", 5, false));
        let bad = Arc::new(FakeBackend::new("unreachable", 10, true));
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> = vec![
            (config("good_one", 1000), good as Arc<dyn Backend>),
            (config("unreachable", 1000), bad as Arc<dyn Backend>),
            (config("good_two", 1000), also_good as Arc<dyn Backend>),
        ];

        let report = run_import(
            &backends,
            &store,
            &ImportRunOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!report.ok());
        assert!(report.any_succeeded());
        assert!(report.backends["unreachable"].has_errors);
        assert_eq!(report.backends["good_one"].items, 10);
        assert_eq!(report.backends["good_two"].items, 5);
        assert_eq!(store.count().await.unwrap(), 15);

        // No state claims the failed backend as its writer.
        let (all, _) = store
            .page(&Default::default(), Default::default(), 100, 0)
            .await
            .unwrap();
        assert!(all.iter().all(|s| s.via != "unreachable"));
    }

    #[tokio::test]
    async fn import_disabled_backend_is_skipped() {
        let store = StateStore::open_in_memory().await.unwrap();
        let fake = Arc::new(FakeBackend::new("disabled", 10, false));
        let mut cfg = config("disabled", 1000);
        cfg.import.enabled = false;
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> = vec![(cfg, fake as Arc<dyn Backend>)];

        let report = run_import(
            &backends,
            &store,
            &ImportRunOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.backends.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
