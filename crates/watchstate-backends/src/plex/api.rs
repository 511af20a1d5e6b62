//! Plex wire types and HTTP plumbing.
//!
//! Every payload rides inside a `MediaContainer` envelope. Item GUIDs arrive
//! as `Guid[]` entries of the form `source://id`, with legacy agent forms
//! like `com.plexapp.agents.imdb://tt1234567?lang=en` still in the wild.

use crate::context::BackendContext;
use crate::error::BackendError;
use crate::traits::{FetchedPage, Library, LibraryKind, ParentCache};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, warn};
use watchstate_models::{BackendMetadata, GuidMap, MediaKind, State};

pub const CLIENT_IDENTIFIER: &str = "com.plexapp.plugins.library";

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    pub media_container: T,
}

#[derive(Debug, Deserialize)]
pub struct IdentityContainer {
    #[serde(rename = "machineIdentifier")]
    pub machine_identifier: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SectionsContainer {
    #[serde(rename = "Directory", default)]
    pub directories: Vec<Directory>,
}

#[derive(Debug, Deserialize)]
pub struct Directory {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountsContainer {
    #[serde(rename = "Account", default)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
}

/// Items container with raw entries, so a malformed item is skipped rather
/// than aborting the page.
#[derive(Debug, Deserialize)]
pub struct ItemsContainer {
    #[serde(rename = "totalSize", default)]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "Metadata", default)]
    pub metadata: Vec<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
pub struct Guid {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Metadata {
    #[serde(rename = "ratingKey")]
    pub rating_key: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "grandparentTitle", default)]
    pub grandparent_title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Episode number within the season.
    #[serde(default)]
    pub index: Option<i32>,
    /// Season number.
    #[serde(rename = "parentIndex", default)]
    pub parent_index: Option<i32>,
    #[serde(rename = "grandparentRatingKey", default)]
    pub grandparent_rating_key: Option<String>,
    #[serde(rename = "librarySectionID", default)]
    pub library_section_id: Option<i64>,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<Guid>,
    #[serde(rename = "viewCount", default)]
    pub view_count: Option<u64>,
    #[serde(rename = "lastViewedAt", default)]
    pub last_viewed_at: Option<i64>,
    #[serde(rename = "addedAt", default)]
    pub added_at: Option<i64>,
    #[serde(rename = "viewOffset", default)]
    pub view_offset: Option<u64>,
}

/// Parse one Plex GUID string into a `(source, id)` pair.
///
/// Handles `imdb://tt1160419`, `tmdb://438631?lang=en`, and the legacy
/// `com.plexapp.agents.imdb://tt1160419?lang=en` shape. `plex://...` ids are
/// not external identities and return None.
pub fn parse_guid(raw: &str) -> Option<(String, String)> {
    let (scheme, rest) = raw.split_once("://")?;
    let source = scheme.rsplit('.').next()?.to_ascii_lowercase();
    if source == "plex" || source == "local" || source == "none" {
        return None;
    }
    let value = rest.split(['?', '&']).next()?.trim();
    if value.is_empty() {
        return None;
    }
    Some((source, value.to_string()))
}

pub fn guids_to_map(guids: &[Guid]) -> GuidMap {
    let mut map = GuidMap::new();
    for guid in guids {
        if let Some((source, value)) = parse_guid(&guid.id) {
            map.insert_tagged(&source, &value);
        }
    }
    map
}

#[derive(Debug)]
pub struct PlexApi {
    client: reqwest::Client,
    context: BackendContext,
}

impl PlexApi {
    pub fn new(context: BackendContext) -> Self {
        Self { client: reqwest::Client::new(), context }
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        container: Option<(u64, u32)>,
    ) -> Result<reqwest::Response, BackendError> {
        let url = self.context.url(path);
        debug!(backend = %self.context.name, url = %url, "GET");
        let mut request = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.context.token)
            .header("Accept", "application/json")
            .query(query);
        if let Some((start, size)) = container {
            request = request
                .header("X-Plex-Container-Start", start.to_string())
                .header("X-Plex-Container-Size", size.to_string());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(BackendError::from_status(
                status.as_u16(),
                format!("{} {}: {}", self.context.name, path, preview),
            ));
        }
        Ok(response)
    }

    pub async fn identity(&self) -> Result<IdentityContainer, BackendError> {
        let envelope: Envelope<IdentityContainer> = self.get("/identity", &[], None).await?.json().await?;
        Ok(envelope.media_container)
    }

    pub async fn sections(&self) -> Result<Vec<Library>, BackendError> {
        let envelope: Envelope<SectionsContainer> =
            self.get("/library/sections", &[], None).await?.json().await?;
        Ok(envelope
            .media_container
            .directories
            .into_iter()
            .map(|dir| Library {
                id: dir.key,
                title: dir.title,
                kind: match dir.kind.as_str() {
                    "movie" => LibraryKind::Movies,
                    "show" => LibraryKind::Shows,
                    other => LibraryKind::Other(other.to_string()),
                },
            })
            .collect())
    }

    pub async fn accounts(&self) -> Result<Vec<Account>, BackendError> {
        let envelope: Envelope<AccountsContainer> =
            self.get("/accounts", &[], None).await?.json().await?;
        Ok(envelope.media_container.accounts)
    }

    /// One page of section items. `plex_type` is 1 for movies, 4 for
    /// episodes, 2 for shows. A zero-size container is the count probe.
    pub async fn section_items(
        &self,
        section: &str,
        plex_type: u8,
        start: u64,
        size: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let path = format!("/library/sections/{section}/all");
        let query = [
            ("type", plex_type.to_string()),
            ("includeGuids", "1".to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        Ok(self
            .get(&path, &query, Some((start, size)))
            .await?
            .bytes()
            .await?
            .to_vec())
    }

    pub async fn total_size(&self, section: &str, plex_type: u8) -> Result<u64, BackendError> {
        let body = self.section_items(section, plex_type, 0, 0).await?;
        let envelope: Envelope<ItemsContainer> = serde_json::from_slice(&body)?;
        Ok(envelope
            .media_container
            .total_size
            .or(envelope.media_container.size)
            .unwrap_or(0))
    }

    pub async fn metadata(&self, rating_key: &str) -> Result<serde_json::Value, BackendError> {
        let path = format!("/library/metadata/{rating_key}");
        let query = [("includeGuids", "1".to_string())];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        Ok(self.get(&path, &query, None).await?.json().await?)
    }

    pub async fn search(&self, term: &str, limit: u32) -> Result<Vec<serde_json::Value>, BackendError> {
        let query = [
            ("query", term.to_string()),
            ("includeGuids", "1".to_string()),
            ("limit", limit.to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        let envelope: serde_json::Value = self.get("/search", &query, None).await?.json().await?;
        Ok(envelope
            .pointer("/MediaContainer/Metadata")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Locate an item anywhere in the library by external id.
    pub async fn find_by_guid(&self, guids: &GuidMap) -> Result<Option<Metadata>, BackendError> {
        for guid in guids.iter() {
            let query = [
                ("guid", guid.pointer()),
                ("includeGuids", "1".to_string()),
            ];
            let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
            let body = self.get("/library/all", &query, Some((0, 1))).await?.bytes().await?;
            let envelope: Envelope<ItemsContainer> = serde_json::from_slice(&body)?;
            if let Some(raw) = envelope.media_container.metadata.first() {
                match serde_json::from_str::<Metadata>(raw.get()) {
                    Ok(item) => return Ok(Some(item)),
                    Err(e) => {
                        warn!(backend = %self.context.name, error = %e, "malformed guid lookup result");
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Decode one section page into states, skipping malformed entries.
pub fn decode_page(
    body: &[u8],
    backend: &str,
    library_id: &str,
    parents: &ParentCache,
    after: Option<i64>,
) -> Result<FetchedPage, BackendError> {
    let envelope: Envelope<ItemsContainer> = serde_json::from_slice(body)?;
    let mut page = FetchedPage { bytes: body.len(), ..Default::default() };

    for raw in &envelope.media_container.metadata {
        let item: Metadata = match serde_json::from_str(raw.get()) {
            Ok(item) => item,
            Err(e) => {
                warn!(backend, library_id, error = %e, "skipping malformed item");
                page.dropped += 1;
                continue;
            }
        };
        match item_to_state(&item, backend, library_id, parents, after) {
            Ok(state) => page.states.push(state),
            Err(reason) => {
                debug!(backend, item = %item.rating_key, reason, "dropping item");
                page.dropped += 1;
            }
        }
    }
    Ok(page)
}

pub fn item_to_state(
    item: &Metadata,
    backend: &str,
    library_id: &str,
    parents: &ParentCache,
    after: Option<i64>,
) -> Result<State, &'static str> {
    let kind = match item.kind.as_str() {
        "movie" => MediaKind::Movie,
        "episode" => MediaKind::Episode,
        _ => return Err("unsupported item type"),
    };

    let watched = item.view_count.unwrap_or(0) > 0;
    let updated = if watched {
        item.last_viewed_at.or(item.added_at)
    } else {
        item.added_at
    }
    .unwrap_or(0);
    if let Some(cutoff) = after {
        if updated <= cutoff {
            return Err("at or before cutoff");
        }
    }

    let title = match kind {
        MediaKind::Episode => match (&item.grandparent_title, &item.title) {
            (Some(series), Some(episode)) => format!("{series}: {episode}"),
            (Some(series), None) => series.clone(),
            (None, Some(episode)) => episode.clone(),
            (None, None) => String::new(),
        },
        _ => item.title.clone().unwrap_or_default(),
    };

    let mut state = State::new(kind, backend, title);
    state.year = item.year;
    state.guids = guids_to_map(&item.guids);
    state.watched = watched;
    state.updated = updated;
    state.progress = item.view_offset;

    if kind == MediaKind::Episode {
        state.season = item.parent_index;
        state.episode = item.index;
        if let Some(series_key) = &item.grandparent_rating_key {
            if let Some(parent) = parents.get(series_key) {
                state.parent_guids = parent.clone();
            }
        }
        if !state.has_valid_episode_numbers() {
            return Err("episode without valid season/episode numbers");
        }
        if state.guids.is_empty() && state.parent_guids.is_empty() {
            return Err("episode without ids or parent");
        }
    }

    state.metadata.insert(
        backend.to_string(),
        BackendMetadata {
            id: item.rating_key.clone(),
            library_id: Some(library_id.to_string()),
            path: None,
            added_at: item.added_at,
            played_at: item.last_viewed_at,
            watched,
            progress_ms: item.view_offset,
            extra: Default::default(),
        },
    );
    Ok(state)
}

/// Remote snapshot for push targeting.
pub fn item_snapshot(item: &Metadata) -> BackendMetadata {
    BackendMetadata {
        id: item.rating_key.clone(),
        library_id: item.library_section_id.map(|id| id.to_string()),
        path: None,
        added_at: item.added_at,
        played_at: item.last_viewed_at,
        watched: item.view_count.unwrap_or(0) > 0,
        progress_ms: item.view_offset,
        extra: Default::default(),
    }
}
