use crate::context::BackendContext;
use crate::error::BackendError;
use crate::webhook::{RequestAttributes, WebhookRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use watchstate_models::{GuidMap, State};

/// One library (section/folder) on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub id: String,
    pub title: String,
    pub kind: LibraryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryKind {
    Movies,
    Shows,
    Other(String),
}

impl Library {
    /// Only movie and show libraries take part in sync.
    pub fn supported(&self) -> bool {
        matches!(self.kind, LibraryKind::Movies | LibraryKind::Shows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUser {
    pub id: String,
    pub name: String,
}

/// Parent-GUID cache for a TV library, keyed by series remote id.
pub type ParentCache = HashMap<String, GuidMap>;

/// One page of a segmented library fetch, already normalized.
#[derive(Debug, Default)]
pub struct FetchedPage {
    pub states: Vec<State>,
    /// Items dropped for known reasons (unsupported type, bad numbers,
    /// malformed entry, cutoff).
    pub dropped: u64,
    /// Raw payload size, for the response-size metric.
    pub bytes: usize,
}

/// An HTTP side effect an adapter wants performed. The queue owns execution;
/// adapters only describe the request.
#[derive(Debug, Clone)]
pub struct HttpAction {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Per-backend label used for report counters.
    pub tag: String,
    /// Human description for logs, e.g. `scrobble 'Dune'`.
    pub description: String,
}

/// Where adapters submit their actions. Implemented by the request queue.
pub trait ActionSink: Send + Sync {
    fn submit(&self, action: HttpAction);
}

/// The capability set every backend adapter satisfies.
///
/// Adapters are cheap to clone through [`Backend::with_context`]; they hold
/// an immutable [`BackendContext`] by value and no back-references.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn context(&self) -> &BackendContext;

    fn name(&self) -> &str {
        &self.context().name
    }

    /// Clone this adapter over a different context.
    fn with_context(&self, context: BackendContext) -> Box<dyn Backend>;

    /// The backend server's unique identifier (UUID / machine id).
    async fn identifier(&self, force_refresh: bool) -> Result<String, BackendError>;

    /// Server version string, e.g. `10.9.2`.
    async fn version(&self) -> Result<String, BackendError>;

    async fn list_users(&self) -> Result<Vec<BackendUser>, BackendError>;

    async fn list_libraries(&self) -> Result<Vec<Library>, BackendError>;

    /// Total item count for a library (a zero-size page probe).
    async fn library_total(&self, library: &Library) -> Result<u64, BackendError>;

    /// External ids of every series in a TV library, for attaching parent
    /// pointers to episodes that lack their own ids.
    async fn series_parents(&self, library: &Library) -> Result<ParentCache, BackendError>;

    /// Fetch and normalize one segment of a library listing.
    ///
    /// The page body is decoded incrementally: the items array is located and
    /// entries yield one by one, so a malformed entry is logged and skipped
    /// without aborting the page. Items at or before `after` are dropped.
    async fn fetch_page(
        &self,
        library: &Library,
        offset: u64,
        limit: u32,
        parents: &ParentCache,
        after: Option<i64>,
    ) -> Result<FetchedPage, BackendError>;

    /// Raw metadata for one remote item.
    async fn get_metadata(&self, remote_id: &str) -> Result<serde_json::Value, BackendError>;

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<serde_json::Value>, BackendError>;

    async fn search_by_id(&self, remote_id: &str) -> Result<Option<serde_json::Value>, BackendError>;

    /// Locate an item on this backend by external ids, returning the remote
    /// snapshot used for push targeting.
    async fn search_by_guids(
        &self,
        guids: &GuidMap,
    ) -> Result<Option<watchstate_models::BackendMetadata>, BackendError>;

    /// Extract user/server identity from a webhook request without parsing
    /// the full payload.
    fn inspect_request(&self, request: &WebhookRequest) -> Result<RequestAttributes, BackendError>;

    /// Parse a webhook request into a canonical state.
    fn parse_webhook(&self, request: &WebhookRequest) -> Result<State, BackendError>;

    /// Emit watched/unwatched actions for the given states. Returns the
    /// number of actions queued.
    fn push(&self, states: &[State], sink: &dyn ActionSink) -> Result<u64, BackendError>;

    /// Emit play-position updates. `server_version` gates backends that grew
    /// the endpoint late.
    fn push_progress(
        &self,
        states: &[State],
        server_version: &str,
        sink: &dyn ActionSink,
    ) -> Result<u64, BackendError>;
}

/// Compare dotted version strings numerically, e.g. `10.9.1 >= 10.9`.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let version = parse(version);
    let minimum = parse(minimum);
    for i in 0..minimum.len().max(version.len()) {
        let have = version.get(i).copied().unwrap_or(0);
        let want = minimum.get(i).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_support() {
        let movies = Library { id: "1".into(), title: "Movies".into(), kind: LibraryKind::Movies };
        let music =
            Library { id: "2".into(), title: "Music".into(), kind: LibraryKind::Other("music".into()) };
        assert!(movies.supported());
        assert!(!music.supported());
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least("10.9", "10.9"));
        assert!(version_at_least("10.9.1", "10.9"));
        assert!(version_at_least("10.10.0", "10.9"));
        assert!(!version_at_least("10.8.13", "10.9"));
        assert!(version_at_least("4.8.0.55", "4.8"));
    }
}
