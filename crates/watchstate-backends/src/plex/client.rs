use crate::context::BackendContext;
use crate::decision::{decide_push, PushDecision};
use crate::error::BackendError;
use crate::plex::api::{self, PlexApi, CLIENT_IDENTIFIER};
use crate::plex::webhook;
use crate::traits::{
    ActionSink, Backend, BackendUser, FetchedPage, HttpAction, Library, LibraryKind, ParentCache,
};
use crate::webhook::{RequestAttributes, WebhookRequest};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use urlencoding::encode;
use watchstate_models::{BackendMetadata, GuidMap, State};

const TYPE_MOVIE: u8 = 1;
const TYPE_SHOW: u8 = 2;
const TYPE_EPISODE: u8 = 4;

#[derive(Debug)]
pub struct PlexBackend {
    api: PlexApi,
    cached_identifier: RwLock<Option<String>>,
}

impl PlexBackend {
    pub fn new(context: BackendContext) -> Self {
        Self {
            cached_identifier: RwLock::new(context.backend_id.clone()),
            api: PlexApi::new(context),
        }
    }

    fn item_type(library: &Library) -> u8 {
        match library.kind {
            LibraryKind::Shows => TYPE_EPISODE,
            _ => TYPE_MOVIE,
        }
    }

    fn token_header(&self) -> Vec<(String, String)> {
        vec![("X-Plex-Token".to_string(), self.context().token.clone())]
    }

    fn scrobble_action(&self, state: &State, meta: &BackendMetadata, watched: bool) -> HttpAction {
        let context = self.context();
        let verb = if watched { "scrobble" } else { "unscrobble" };
        HttpAction {
            method: reqwest::Method::GET,
            url: context.url(&format!(
                "/:/{verb}?identifier={CLIENT_IDENTIFIER}&key={}",
                encode(&meta.id)
            )),
            headers: self.token_header(),
            body: None,
            tag: context.name.clone(),
            description: format!("{verb} '{}'", state.title),
        }
    }
}

#[async_trait]
impl Backend for PlexBackend {
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
        let identity = self.api.identity().await?;
        *self.cached_identifier.write().await = Some(identity.machine_identifier.clone());
        Ok(identity.machine_identifier)
    }

    async fn version(&self) -> Result<String, BackendError> {
        Ok(self.api.identity().await?.version.unwrap_or_default())
    }

    async fn list_users(&self) -> Result<Vec<BackendUser>, BackendError> {
        let accounts = self.api.accounts().await?;
        Ok(accounts
            .into_iter()
            .map(|account| BackendUser { id: account.id.to_string(), name: account.name })
            .collect())
    }

    async fn list_libraries(&self) -> Result<Vec<Library>, BackendError> {
        self.api.sections().await
    }

    async fn library_total(&self, library: &Library) -> Result<u64, BackendError> {
        self.api.total_size(&library.id, Self::item_type(library)).await
    }

    async fn series_parents(&self, library: &Library) -> Result<ParentCache, BackendError> {
        if library.kind != LibraryKind::Shows {
            return Ok(ParentCache::new());
        }
        let total = self.api.total_size(&library.id, TYPE_SHOW).await?;
        if total == 0 {
            return Ok(ParentCache::new());
        }
        let body = self.api.section_items(&library.id, TYPE_SHOW, 0, total as u32).await?;
        let envelope: api::Envelope<api::ItemsContainer> = serde_json::from_slice(&body)?;

        let mut parents = ParentCache::new();
        for raw in &envelope.media_container.metadata {
            let Ok(show) = serde_json::from_str::<api::Metadata>(raw.get()) else {
                continue;
            };
            let guids = api::guids_to_map(&show.guids);
            if !guids.is_empty() {
                parents.insert(show.rating_key, guids);
            }
        }
        debug!(backend = %self.context().name, library = %library.title, series = parents.len(), "built parent cache");
        Ok(parents)
    }

    async fn fetch_page(
        &self,
        library: &Library,
        offset: u64,
        limit: u32,
        parents: &ParentCache,
        after: Option<i64>,
    ) -> Result<FetchedPage, BackendError> {
        let body = self
            .api
            .section_items(&library.id, Self::item_type(library), offset, limit)
            .await?;
        api::decode_page(&body, &self.context().name, &library.id, parents, after)
    }

    async fn get_metadata(&self, remote_id: &str) -> Result<serde_json::Value, BackendError> {
        self.api.metadata(remote_id).await
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<serde_json::Value>, BackendError> {
        self.api.search(query, limit).await
    }

    async fn search_by_id(&self, remote_id: &str) -> Result<Option<serde_json::Value>, BackendError> {
        match self.api.metadata(remote_id).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.status == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_by_guids(&self, guids: &GuidMap) -> Result<Option<BackendMetadata>, BackendError> {
        Ok(self.api.find_by_guid(guids).await?.map(|item| api::item_snapshot(&item)))
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
                    sink.submit(self.scrobble_action(state, meta, true));
                    queued += 1;
                }
                PushDecision::MarkUnwatched => {
                    sink.submit(self.scrobble_action(state, meta, false));
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
                method: reqwest::Method::GET,
                url: context.url(&format!(
                    "/:/progress?identifier={CLIENT_IDENTIFIER}&key={}&time={}&state=stopped",
                    encode(&meta.id),
                    progress
                )),
                headers: self.token_header(),
                body: None,
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

    fn backend() -> PlexBackend {
        PlexBackend::new(BackendContext {
            name: "home_plex".to_string(),
            base_url: "http://plex.local:32400".to_string(),
            token: "tok".to_string(),
            user_id: "1".to_string(),
            backend_id: Some("plex-uuid-1".to_string()),
            options: HashMap::new(),
            segment_size: 1000,
            ignored_libraries: vec![],
        })
    }

    #[test]
    fn scrobble_url_shape() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut state = State::new(MediaKind::Movie, "home_jellyfin", "Dune");
        state.watched = true;
        state.updated = 1_714_640_400;
        state.metadata.insert(
            "home_plex".to_string(),
            BackendMetadata {
                id: "52879".to_string(),
                watched: false,
                played_at: Some(1_714_550_000),
                ..Default::default()
            },
        );

        let queued = backend().push(&[state], &sink).unwrap();
        assert_eq!(queued, 1);
        let actions = sink.0.lock().unwrap();
        assert_eq!(
            actions[0].url,
            "http://plex.local:32400/:/scrobble?identifier=com.plexapp.plugins.library&key=52879"
        );
        assert!(actions[0]
            .headers
            .iter()
            .any(|(k, v)| k == "X-Plex-Token" && v == "tok"));
    }

    #[test]
    fn tainted_state_pushes_nothing() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut state = State::new(MediaKind::Movie, "home_jellyfin", "Dune");
        state.watched = true;
        state.updated = 1_714_640_400;
        state.tainted = true;
        state.metadata.insert(
            "home_plex".to_string(),
            BackendMetadata { id: "52879".to_string(), ..Default::default() },
        );
        assert_eq!(backend().push(&[state], &sink).unwrap(), 0);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn progress_action_carries_milliseconds() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut state = State::new(MediaKind::Movie, "home_jellyfin", "Dune");
        state.progress = Some(90_000);
        state.metadata.insert(
            "home_plex".to_string(),
            BackendMetadata { id: "52879".to_string(), ..Default::default() },
        );
        let queued = backend().push_progress(&[state], "1.40.0", &sink).unwrap();
        assert_eq!(queued, 1);
        assert!(sink.0.lock().unwrap()[0].url.contains("time=90000"));
    }
}
