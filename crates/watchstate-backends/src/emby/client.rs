use crate::context::BackendContext;
use crate::decision::{decide_push, PushDecision};
use crate::error::BackendError;
use crate::jellyfin::webhook;
use crate::mediabrowser::{decode_page, MediaBrowserApi};
use crate::traits::{
    ActionSink, Backend, BackendUser, FetchedPage, HttpAction, Library, ParentCache,
};
use crate::webhook::{RequestAttributes, WebhookRequest};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use watchstate_models::{BackendMetadata, GuidMap, State};

/// Emby speaks the same MediaBrowser dialect as Jellyfin with its own token
/// header, and its progress endpoint has always been available.
#[derive(Debug)]
pub struct EmbyBackend {
    api: MediaBrowserApi,
    cached_identifier: RwLock<Option<String>>,
}

impl EmbyBackend {
    pub fn new(context: BackendContext) -> Self {
        let auth = ("X-Emby-Token", context.token.clone());
        Self {
            api: MediaBrowserApi::new(context.clone(), auth),
            cached_identifier: RwLock::new(context.backend_id),
        }
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        vec![("X-Emby-Token".to_string(), self.context().token.clone())]
    }
}

#[async_trait]
impl Backend for EmbyBackend {
    fn context(&self) -> &BackendContext {
        self.api.context()
    }

    fn with_context(&self, context: BackendContext) -> Box<dyn Backend> {
        Box::new(Self::new(context))
    }

    async fn identifier(&self, force_refresh: bool) -> Result<String, BackendError> {
        if !force_refresh {
            if let Some(id) = self.cached_identifier.read().await.clone() {
                return Ok(id);
            }
        }
        let info = self.api.system_info().await?;
        *self.cached_identifier.write().await = Some(info.id.clone());
        Ok(info.id)
    }

    async fn version(&self) -> Result<String, BackendError> {
        Ok(self.api.system_info().await?.version)
    }

    async fn list_users(&self) -> Result<Vec<BackendUser>, BackendError> {
        self.api.users().await
    }

    async fn list_libraries(&self) -> Result<Vec<Library>, BackendError> {
        self.api.views().await
    }

    async fn library_total(&self, library: &Library) -> Result<u64, BackendError> {
        self.api.total_record_count(&library.id, "Movie,Episode").await
    }

    async fn series_parents(&self, library: &Library) -> Result<ParentCache, BackendError> {
        self.api.series_parents(library).await
    }

    async fn fetch_page(
        &self,
        library: &Library,
        offset: u64,
        limit: u32,
        parents: &ParentCache,
        after: Option<i64>,
    ) -> Result<FetchedPage, BackendError> {
        let body = self.api.items_page(&library.id, offset, limit, "Movie,Episode").await?;
        decode_page(&body, &self.context().name, &library.id, parents, after)
    }

    async fn get_metadata(&self, remote_id: &str) -> Result<serde_json::Value, BackendError> {
        self.api.item(remote_id).await
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<serde_json::Value>, BackendError> {
        self.api.search(query, limit).await
    }

    async fn search_by_id(&self, remote_id: &str) -> Result<Option<serde_json::Value>, BackendError> {
        match self.api.item(remote_id).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.status == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_by_guids(&self, guids: &GuidMap) -> Result<Option<BackendMetadata>, BackendError> {
        self.api.find_by_provider_ids(guids).await
    }

    fn inspect_request(&self, request: &WebhookRequest) -> Result<RequestAttributes, BackendError> {
        webhook::inspect(request)
    }

    fn parse_webhook(&self, request: &WebhookRequest) -> Result<State, BackendError> {
        webhook::parse(request, &self.context().name, chrono::Utc::now().timestamp())
    }

    fn push(&self, states: &[State], sink: &dyn ActionSink) -> Result<u64, BackendError> {
        let context = self.context();
        let mut queued = 0;
        for state in states {
            let Some(meta) = state.metadata.get(&context.name) else {
                continue;
            };
            match decide_push(state, meta) {
                PushDecision::MarkWatched => {
                    sink.submit(HttpAction {
                        method: reqwest::Method::POST,
                        url: context
                            .url(&format!("/Users/{}/PlayedItems/{}", context.user_id, meta.id)),
                        headers: self.auth_headers(),
                        body: None,
                        tag: context.name.clone(),
                        description: format!("mark watched '{}'", state.title),
                    });
                    queued += 1;
                }
                PushDecision::MarkUnwatched => {
                    sink.submit(HttpAction {
                        method: reqwest::Method::DELETE,
                        url: context
                            .url(&format!("/Users/{}/PlayedItems/{}", context.user_id, meta.id)),
                        headers: self.auth_headers(),
                        body: None,
                        tag: context.name.clone(),
                        description: format!("mark unwatched '{}'", state.title),
                    });
                    queued += 1;
                }
                PushDecision::Noop(reason) => {
                    debug!(backend = %context.name, title = %state.title, reason, "push skipped");
                }
            }
        }
        Ok(queued)
    }

    fn push_progress(
        &self,
        states: &[State],
        _server_version: &str,
        sink: &dyn ActionSink,
    ) -> Result<u64, BackendError> {
        let context = self.context();
        let mut queued = 0;
        for state in states {
            let Some(meta) = state.metadata.get(&context.name) else {
                continue;
            };
            let Some(progress) = state.progress else {
                continue;
            };
            sink.submit(HttpAction {
                method: reqwest::Method::POST,
                url: context.url(&format!("/Users/{}/Items/{}/UserData", context.user_id, meta.id)),
                headers: self.auth_headers(),
                body: Some(serde_json::json!({
                    "PlaybackPositionTicks": progress as i64 * 10_000,
                })),
                tag: context.name.clone(),
                description: format!("progress '{}' @{}ms", state.title, progress),
            });
            queued += 1;
        }
        Ok(queued)
    }
}
