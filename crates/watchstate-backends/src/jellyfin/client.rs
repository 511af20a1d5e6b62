use crate::context::BackendContext;
use crate::decision::{decide_push, PushDecision};
use crate::error::BackendError;
use crate::jellyfin::webhook;
use crate::mediabrowser::{decode_page, MediaBrowserApi};
use crate::traits::{
    version_at_least, ActionSink, Backend, BackendUser, FetchedPage, HttpAction, Library,
    ParentCache,
};
use crate::webhook::{RequestAttributes, WebhookRequest};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use watchstate_models::{BackendMetadata, GuidMap, State};

/// Jellyfin grew the play-position endpoint in 10.9; older servers only get
/// the watched toggle.
const PROGRESS_MIN_VERSION: &str = "10.9";

#[derive(Debug)]
pub struct JellyfinBackend {
    api: MediaBrowserApi,
    cached_identifier: RwLock<Option<String>>,
}

impl JellyfinBackend {
    pub fn new(context: BackendContext) -> Self {
        let auth = (
            "Authorization",
            format!(
                "MediaBrowser Token=\"{}\", Client=\"watchstate\", Device=\"watchstate\", DeviceId=\"watchstate\", Version=\"0.1\"",
                context.token
            ),
        );
        Self {
            api: MediaBrowserApi::new(context.clone(), auth),
            cached_identifier: RwLock::new(context.backend_id),
        }
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        vec![(
            "Authorization".to_string(),
            format!("MediaBrowser Token=\"{}\"", self.context().token),
        )]
    }

    fn played_item_action(&self, state: &State, meta: &BackendMetadata, watched: bool) -> HttpAction {
        let context = self.context();
        let method = if watched { reqwest::Method::POST } else { reqwest::Method::DELETE };
        HttpAction {
            method,
            url: context.url(&format!("/Users/{}/PlayedItems/{}", context.user_id, meta.id)),
            headers: self.auth_headers(),
            body: None,
            tag: context.name.clone(),
            description: format!(
                "{} '{}'",
                if watched { "mark watched" } else { "mark unwatched" },
                state.title
            ),
        }
    }
}

#[async_trait]
impl Backend for JellyfinBackend {
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
        let name = &self.context().name;
        let mut queued = 0;
        for state in states {
            let Some(meta) = state.metadata.get(name) else {
                continue;
            };
            match decide_push(state, meta) {
                PushDecision::MarkWatched => {
                    sink.submit(self.played_item_action(state, meta, true));
                    queued += 1;
                }
                PushDecision::MarkUnwatched => {
                    sink.submit(self.played_item_action(state, meta, false));
                    queued += 1;
                }
                PushDecision::Noop(reason) => {
                    debug!(backend = %name, title = %state.title, reason, "push skipped");
                }
            }
        }
        Ok(queued)
    }

    fn push_progress(
        &self,
        states: &[State],
        server_version: &str,
        sink: &dyn ActionSink,
    ) -> Result<u64, BackendError> {
        let context = self.context();
        if !version_at_least(server_version, PROGRESS_MIN_VERSION) {
            warn!(
                backend = %context.name,
                version = server_version,
                minimum = PROGRESS_MIN_VERSION,
                "server too old for progress push, feature disabled"
            );
            return Err(BackendError::version(format!(
                "jellyfin {server_version} lacks the progress endpoint (requires {PROGRESS_MIN_VERSION})"
            )));
        }

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use watchstate_models::MediaKind;

    struct CollectSink(Mutex<Vec<HttpAction>>);

    impl ActionSink for CollectSink {
        fn submit(&self, action: HttpAction) {
            self.0.lock().unwrap().push(action);
        }
    }

    fn backend() -> JellyfinBackend {
        JellyfinBackend::new(BackendContext {
            name: "home_jellyfin".to_string(),
            base_url: "http://jellyfin.local:8096".to_string(),
            token: "tok".to_string(),
            user_id: "u1".to_string(),
            backend_id: None,
            options: HashMap::new(),
            segment_size: 1000,
            ignored_libraries: vec![],
        })
    }

    fn state(watched: bool, updated: i64, remote_watched: bool) -> State {
        let mut state = State::new(MediaKind::Movie, "home_plex", "Dune");
        state.watched = watched;
        state.updated = updated;
        state.metadata.insert(
            "home_jellyfin".to_string(),
            BackendMetadata {
                id: "item-9".to_string(),
                watched: remote_watched,
                played_at: Some(100),
                ..Default::default()
            },
        );
        state
    }

    #[test]
    fn push_emits_mark_watched_only_when_newer_and_different() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let backend = backend();

        let queued = backend
            .push(&[state(true, 200, false), state(true, 50, false), state(true, 200, true)], &sink)
            .unwrap();
        assert_eq!(queued, 1);

        let actions = sink.0.lock().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].method, reqwest::Method::POST);
        assert_eq!(
            actions[0].url,
            "http://jellyfin.local:8096/Users/u1/PlayedItems/item-9"
        );
    }

    #[test]
    fn push_unwatched_uses_delete() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let queued = backend().push(&[state(false, 200, true)], &sink).unwrap();
        assert_eq!(queued, 1);
        assert_eq!(sink.0.lock().unwrap()[0].method, reqwest::Method::DELETE);
    }

    #[test]
    fn progress_requires_ten_nine() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let backend = backend();
        let mut s = state(false, 200, false);
        s.progress = Some(60_000);

        let err = backend.push_progress(&[s.clone()], "10.8.13", &sink).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Version);
        assert!(sink.0.lock().unwrap().is_empty());

        let queued = backend.push_progress(&[s], "10.9.2", &sink).unwrap();
        assert_eq!(queued, 1);
        let actions = sink.0.lock().unwrap();
        assert_eq!(actions[0].body.as_ref().unwrap()["PlaybackPositionTicks"], 600_000_000i64);
    }

    #[test]
    fn states_without_local_metadata_are_skipped() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut s = State::new(MediaKind::Movie, "home_plex", "Unknown");
        s.watched = true;
        s.updated = 500;
        let queued = backend().push(&[s], &sink).unwrap();
        assert_eq!(queued, 0);
    }
}
