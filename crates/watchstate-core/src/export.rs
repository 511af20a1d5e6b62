use crate::queue::{QueueOptions, RequestQueue};
use crate::report::RunReport;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watchstate_backends::{Backend, ErrorKind};
use watchstate_config::BackendConfig;
use watchstate_models::State;
use watchstate_store::StateStore;

/// Whole-run ceiling for an export.
pub const EXPORT_RUN_TIMEOUT: Duration = Duration::from_secs(12 * 3600);

#[derive(Debug, Clone, Default)]
pub struct ExportRunOptions {
    /// Only states with `updated > since` are considered.
    pub since: i64,
    /// Re-examine everything regardless of `since`.
    pub force: bool,
}

/// Push local play state out to every export-enabled backend.
///
/// Per state and backend the decision is "latest wins": the adapter compares
/// the canonical record against its remote snapshot and enqueues an action
/// only when the local side is strictly newer. The queue executes all actions
/// and the per-tag counts land in the report.
pub async fn run_export(
    backends: &[(BackendConfig, Arc<dyn Backend>)],
    store: &StateStore,
    options: &ExportRunOptions,
    queue_options: QueueOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    match tokio::time::timeout(
        EXPORT_RUN_TIMEOUT,
        export_inner(backends, store, options, queue_options, cancel),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => anyhow::bail!("export run exceeded {}s", EXPORT_RUN_TIMEOUT.as_secs()),
    }
}

async fn export_inner(
    backends: &[(BackendConfig, Arc<dyn Backend>)],
    store: &StateStore,
    options: &ExportRunOptions,
    queue_options: QueueOptions,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let mut report = RunReport::new();
    let since = if options.force { i64::MIN } else { options.since };
    let states = store.since(since).await?;
    info!(candidates = states.len(), since, force = options.force, "export starting");

    let queue = RequestQueue::new(queue_options, cancel.clone());

    for (config, backend) in backends {
        if !config.export.enabled {
            debug!(backend = %config.name, "export disabled, skipping");
            continue;
        }
        if cancel.is_cancelled() {
            warn!("export cancelled before {}", config.name);
            break;
        }
        if let Err(abort) =
            export_backend(config, backend.as_ref(), &states, &queue, &mut report).await
        {
            if abort {
                continue;
            }
        }
    }

    let counts = queue.drain().await;
    report.merge_queue_counts(&counts);
    Ok(report)
}

/// Returns Err(true) when the backend had to be abandoned (auth failure).
async fn export_backend(
    config: &BackendConfig,
    backend: &dyn Backend,
    states: &[State],
    queue: &RequestQueue,
    report: &mut RunReport,
) -> Result<(), bool> {
    let name = &config.name;
    let mut targets: Vec<State> = Vec::new();

    for state in states {
        if state.metadata.contains_key(name) {
            targets.push(state.clone());
            continue;
        }
        // Not known on this backend yet: resolve the remote identity first.
        match backend.search_by_guids(&state.guids).await {
            Ok(Some(remote)) => {
                let mut resolved = state.clone();
                resolved.metadata.insert(name.clone(), remote);
                targets.push(resolved);
            }
            Ok(None) => {
                debug!(backend = %name, title = %state.title, "not present remotely, skipping");
            }
            Err(e) if e.kind == ErrorKind::Auth => {
                error!(backend = %name, error = %e, "auth failure, aborting backend");
                report.record_error(name, format!("auth: {e}"));
                return Err(true);
            }
            Err(e) => {
                warn!(backend = %name, title = %state.title, error = %e, "remote lookup failed");
                report.record_error(name, format!("lookup '{}': {e}", state.title));
            }
        }
    }

    match backend.push(&targets, queue) {
        Ok(queued) => {
            debug!(backend = %name, queued, examined = targets.len(), "push decisions made");
            // Ensure the backend shows up in the report even when nothing
            // needed pushing.
            report.backend_mut(name);
            Ok(())
        }
        Err(e) => {
            error!(backend = %name, error = %e, "push failed");
            report.record_error(name, format!("push: {e}"));
            Err(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use watchstate_backends::{
        ActionSink, BackendContext, BackendError, BackendUser, FetchedPage, HttpAction, Library,
        ParentCache, RequestAttributes, WebhookRequest,
    };
    use watchstate_config::{BackendKind, BackendOptions, ExportOptions, ImportOptions, WebhookOptions};
    use watchstate_models::guid::GuidSource;
    use watchstate_models::{BackendMetadata, GuidMap, MediaKind};

    #[derive(Debug)]
    struct PushCounter {
        context: BackendContext,
        push_calls: AtomicU64,
        lookup_calls: AtomicU64,
        remote_known: bool,
    }

    impl PushCounter {
        fn new(name: &str, remote_known: bool) -> Self {
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
                push_calls: AtomicU64::new(0),
                lookup_calls: AtomicU64::new(0),
                remote_known,
            }
        }
    }

    #[async_trait]
    impl Backend for PushCounter {
        fn context(&self) -> &BackendContext {
            &self.context
        }

        fn with_context(&self, context: BackendContext) -> Box<dyn Backend> {
            Box::new(PushCounter {
                context,
                push_calls: AtomicU64::new(0),
                lookup_calls: AtomicU64::new(0),
                remote_known: self.remote_known,
            })
        }

        async fn identifier(&self, _f: bool) -> Result<String, BackendError> {
            Ok("id".into())
        }

        async fn version(&self) -> Result<String, BackendError> {
            Ok("1.0".into())
        }

        async fn list_users(&self) -> Result<Vec<BackendUser>, BackendError> {
            Ok(vec![])
        }

        async fn list_libraries(&self) -> Result<Vec<Library>, BackendError> {
            Ok(vec![])
        }

        async fn library_total(&self, _l: &Library) -> Result<u64, BackendError> {
            Ok(0)
        }

        async fn series_parents(&self, _l: &Library) -> Result<ParentCache, BackendError> {
            Ok(ParentCache::new())
        }

        async fn fetch_page(
            &self,
            _l: &Library,
            _o: u64,
            _n: u32,
            _p: &ParentCache,
            _a: Option<i64>,
        ) -> Result<FetchedPage, BackendError> {
            Ok(FetchedPage::default())
        }

        async fn get_metadata(&self, _id: &str) -> Result<serde_json::Value, BackendError> {
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
            self.lookup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.remote_known.then(|| BackendMetadata {
                id: "remote-1".to_string(),
                watched: false,
                played_at: Some(100),
                ..Default::default()
            }))
        }

        fn inspect_request(&self, _r: &WebhookRequest) -> Result<RequestAttributes, BackendError> {
            Ok(RequestAttributes::default())
        }

        fn parse_webhook(&self, _r: &WebhookRequest) -> Result<State, BackendError> {
            Err(BackendError::validation("unsupported"))
        }

        fn push(&self, states: &[State], sink: &dyn ActionSink) -> Result<u64, BackendError> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            let mut queued = 0;
            for state in states {
                let Some(meta) = state.metadata.get(&self.context.name) else { continue };
                if state.watched != meta.watched && state.updated > meta.played_at.unwrap_or(0) {
                    // Unroutable target: the queue will record a failure.
                    sink.submit(HttpAction {
                        method: reqwest::Method::GET,
                        url: "http://127.0.0.1:1/mark".to_string(),
                        headers: vec![],
                        body: None,
                        tag: self.context.name.clone(),
                        description: format!("mark '{}'", state.title),
                    });
                    queued += 1;
                }
            }
            Ok(queued)
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

    fn config(name: &str, export_enabled: bool) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: BackendKind::Plex,
            url: "http://fake".to_string(),
            token: "t".to_string(),
            user_id: "u".to_string(),
            uuid: None,
            import: ImportOptions::default(),
            export: ExportOptions { enabled: export_enabled },
            webhook: WebhookOptions::default(),
            options: BackendOptions::default(),
        }
    }

    fn fast_queue() -> QueueOptions {
        QueueOptions {
            workers: 2,
            request_timeout: Duration::from_secs(2),
            max_attempts: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            grace: Duration::from_millis(50),
        }
    }

    async fn seeded_store() -> StateStore {
        let store = StateStore::open_in_memory().await.unwrap();
        let mut state = State::new(MediaKind::Movie, "home_jellyfin", "Dune");
        state.guids.insert(GuidSource::Imdb, "tt1160419");
        state.watched = true;
        state.updated = 1_714_640_400;
        state.metadata.insert(
            "home_jellyfin".to_string(),
            BackendMetadata { id: "jf-1".to_string(), watched: true, ..Default::default() },
        );
        store.upsert(&state).await.unwrap();
        store
    }

    #[tokio::test]
    async fn disabled_backend_sees_no_calls_and_enabled_one_pushes() {
        let store = seeded_store().await;
        let plex = Arc::new(PushCounter::new("home_plex", true));
        let jellyfin = Arc::new(PushCounter::new("home_jellyfin", true));
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> = vec![
            (config("home_plex", true), plex.clone() as Arc<dyn Backend>),
            (config("home_jellyfin", false), jellyfin.clone() as Arc<dyn Backend>),
        ];

        let report = run_export(
            &backends,
            &store,
            &ExportRunOptions::default(),
            fast_queue(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // The disabled backend was never touched.
        assert_eq!(jellyfin.push_calls.load(Ordering::SeqCst), 0);
        assert_eq!(jellyfin.lookup_calls.load(Ordering::SeqCst), 0);

        // The enabled one resolved the remote identity and queued one action.
        assert_eq!(plex.push_calls.load(Ordering::SeqCst), 1);
        assert_eq!(plex.lookup_calls.load(Ordering::SeqCst), 1);
        let entry = &report.backends["home_plex"];
        assert_eq!(entry.queued, 1);
        // The target is unroutable in tests, so the action fails.
        assert_eq!(entry.failed, 1);
    }

    #[tokio::test]
    async fn unknown_remote_identity_is_skipped() {
        let store = seeded_store().await;
        let plex = Arc::new(PushCounter::new("home_plex", false));
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> =
            vec![(config("home_plex", true), plex.clone() as Arc<dyn Backend>)];

        let report = run_export(
            &backends,
            &store,
            &ExportRunOptions::default(),
            fast_queue(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(plex.lookup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.backends["home_plex"].queued, 0);
        assert!(report.ok());
    }

    #[tokio::test]
    async fn since_cutoff_limits_candidates() {
        let store = seeded_store().await;
        let plex = Arc::new(PushCounter::new("home_plex", true));
        let backends: Vec<(BackendConfig, Arc<dyn Backend>)> =
            vec![(config("home_plex", true), plex.clone() as Arc<dyn Backend>)];

        let report = run_export(
            &backends,
            &store,
            &ExportRunOptions { since: 2_000_000_000, force: false },
            fast_queue(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(plex.lookup_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.backends["home_plex"].queued, 0);
    }
}
