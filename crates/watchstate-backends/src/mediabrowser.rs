//! Shared wire layer for the MediaBrowser API family (Jellyfin, Emby).
//!
//! Both servers expose the same JSON shapes; the vendor adapters differ in
//! auth header, webhook event naming, and feature gates.

use crate::context::BackendContext;
use crate::error::BackendError;
use crate::traits::{BackendUser, FetchedPage, Library, LibraryKind, ParentCache};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use tracing::{debug, warn};
use watchstate_models::{BackendMetadata, GuidMap, MediaKind, State};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    pub id: String,
    #[serde(default)]
    pub server_name: Option<String>,
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct View {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub collection_type: Option<String>,
}

/// Items envelope. Entries stay raw so one malformed item cannot abort the
/// page; each is decoded individually while walking the array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemsEnvelope {
    #[serde(default)]
    pub items: Vec<Box<RawValue>>,
    #[serde(default)]
    pub total_record_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "Type")]
    pub item_type: String,
    #[serde(default)]
    pub production_year: Option<i32>,
    #[serde(default)]
    pub provider_ids: Option<HashMap<String, String>>,
    #[serde(default)]
    pub index_number: Option<i32>,
    #[serde(default)]
    pub index_number_end: Option<i32>,
    #[serde(default)]
    pub parent_index_number: Option<i32>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub series_name: Option<String>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub user_data: Option<UserData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserData {
    #[serde(default)]
    pub played: bool,
    #[serde(default)]
    pub last_played_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub playback_position_ticks: Option<i64>,
}

/// Thin HTTP client over one MediaBrowser server.
#[derive(Debug)]
pub struct MediaBrowserApi {
    client: reqwest::Client,
    context: BackendContext,
    /// `(header name, header value)`; Jellyfin and Emby differ here.
    auth_header: (&'static str, String),
}

impl MediaBrowserApi {
    pub fn new(context: BackendContext, auth_header: (&'static str, String)) -> Self {
        Self { client: reqwest::Client::new(), context, auth_header }
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, BackendError> {
        let url = self.context.url(path);
        debug!(backend = %self.context.name, url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .header(self.auth_header.0, &self.auth_header.1)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(
                status.as_u16(),
                format!("{} {}: {}", self.context.name, path, truncate(&body, 200)),
            ));
        }
        Ok(response)
    }

    pub async fn system_info(&self) -> Result<SystemInfo, BackendError> {
        Ok(self.get("/System/Info", &[]).await?.json().await?)
    }

    pub async fn users(&self) -> Result<Vec<BackendUser>, BackendError> {
        let users: Vec<ApiUser> = self.get("/Users", &[]).await?.json().await?;
        Ok(users.into_iter().map(|u| BackendUser { id: u.id, name: u.name }).collect())
    }

    pub async fn views(&self) -> Result<Vec<Library>, BackendError> {
        let path = format!("/Users/{}/Views", self.context.user_id);
        let envelope: serde_json::Value = self.get(&path, &[]).await?.json().await?;
        let views: Vec<View> = serde_json::from_value(
            envelope.get("Items").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )?;
        Ok(views
            .into_iter()
            .map(|view| Library {
                id: view.id,
                title: view.name,
                kind: match view.collection_type.as_deref() {
                    Some("movies") => LibraryKind::Movies,
                    Some("tvshows") => LibraryKind::Shows,
                    other => LibraryKind::Other(other.unwrap_or("unknown").to_string()),
                },
            })
            .collect())
    }

    /// One page of `/Users/{uid}/Items`. `limit == 0` is the count probe.
    pub async fn items_page(
        &self,
        parent_id: &str,
        start_index: u64,
        limit: u32,
        include_item_types: &str,
    ) -> Result<Vec<u8>, BackendError> {
        let path = format!("/Users/{}/Items", self.context.user_id);
        let query = [
            ("parentId", parent_id.to_string()),
            ("recursive", "true".to_string()),
            ("includeItemTypes", include_item_types.to_string()),
            ("fields", "ProviderIds,DateCreated,Path".to_string()),
            ("enableUserData", "true".to_string()),
            ("enableTotalRecordCount", "true".to_string()),
            ("startIndex", start_index.to_string()),
            ("limit", limit.to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        Ok(self.get(&path, &query).await?.bytes().await?.to_vec())
    }

    pub async fn total_record_count(&self, parent_id: &str, include_item_types: &str) -> Result<u64, BackendError> {
        let body = self.items_page(parent_id, 0, 0, include_item_types).await?;
        let envelope: ItemsEnvelope = serde_json::from_slice(&body)?;
        Ok(envelope.total_record_count.unwrap_or(0))
    }

    /// Map series remote id to external ids, so episodes without their own
    /// ids can attach a parent pointer.
    pub async fn series_parents(&self, library: &Library) -> Result<ParentCache, BackendError> {
        let body = self.items_page(&library.id, 0, 0, "Series").await?;
        let envelope: ItemsEnvelope = serde_json::from_slice(&body)?;
        let total = envelope.total_record_count.unwrap_or(0);
        if total == 0 {
            return Ok(ParentCache::new());
        }
        let body = self.items_page(&library.id, 0, total as u32, "Series").await?;
        let envelope: ItemsEnvelope = serde_json::from_slice(&body)?;

        let mut parents = ParentCache::new();
        for raw in &envelope.items {
            let item: MediaItem = match serde_json::from_str(raw.get()) {
                Ok(item) => item,
                Err(e) => {
                    warn!(backend = %self.context.name, error = %e, "skipping malformed series entry");
                    continue;
                }
            };
            let guids = provider_ids_to_guids(item.provider_ids.as_ref());
            if !guids.is_empty() {
                parents.insert(item.id, guids);
            }
        }
        debug!(backend = %self.context.name, library = %library.title, series = parents.len(), "built parent cache");
        Ok(parents)
    }

    pub async fn item(&self, remote_id: &str) -> Result<serde_json::Value, BackendError> {
        let path = format!("/Users/{}/Items/{}", self.context.user_id, remote_id);
        Ok(self.get(&path, &[]).await?.json().await?)
    }

    pub async fn search(&self, term: &str, limit: u32) -> Result<Vec<serde_json::Value>, BackendError> {
        let path = format!("/Users/{}/Items", self.context.user_id);
        let query = [
            ("searchTerm", term.to_string()),
            ("recursive", "true".to_string()),
            ("includeItemTypes", "Movie,Episode,Series".to_string()),
            ("fields", "ProviderIds".to_string()),
            ("limit", limit.to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        let envelope: serde_json::Value = self.get(&path, &query).await?.json().await?;
        Ok(envelope
            .get("Items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Locate an item by any of its external ids.
    pub async fn find_by_provider_ids(
        &self,
        guids: &GuidMap,
    ) -> Result<Option<BackendMetadata>, BackendError> {
        if guids.is_empty() {
            return Ok(None);
        }
        let filter = guids
            .iter()
            .map(|guid| format!("{}.{}", guid.source, guid.value))
            .collect::<Vec<_>>()
            .join(",");
        let path = format!("/Users/{}/Items", self.context.user_id);
        let query = [
            ("anyProviderIdEquals", filter),
            ("recursive", "true".to_string()),
            ("includeItemTypes", "Movie,Episode".to_string()),
            ("fields", "ProviderIds,DateCreated".to_string()),
            ("enableUserData", "true".to_string()),
            ("limit", "1".to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();
        let envelope: ItemsEnvelope = self.get(&path, &query).await?.json().await?;
        let Some(raw) = envelope.items.first() else {
            return Ok(None);
        };
        let item: MediaItem = serde_json::from_str(raw.get())?;
        Ok(Some(item_snapshot(&item, None)))
    }
}

/// Decode one library page into states, skipping malformed entries.
pub fn decode_page(
    body: &[u8],
    backend: &str,
    library_id: &str,
    parents: &ParentCache,
    after: Option<i64>,
) -> Result<FetchedPage, BackendError> {
    let envelope: ItemsEnvelope = serde_json::from_slice(body)?;
    let mut page = FetchedPage { bytes: body.len(), ..Default::default() };

    for raw in &envelope.items {
        let item: MediaItem = match serde_json::from_str(raw.get()) {
            Ok(item) => item,
            Err(e) => {
                warn!(backend, library_id, error = %e, "skipping malformed item");
                page.dropped += 1;
                continue;
            }
        };
        match item_to_states(&item, backend, library_id, parents, after) {
            Ok(states) => page.states.extend(states),
            Err(reason) => {
                debug!(backend, item = %item.id, reason, "dropping item");
                page.dropped += 1;
            }
        }
    }
    Ok(page)
}

/// Normalize one MediaBrowser item. Multi-episode files (`IndexNumberEnd`)
/// expand into one state per episode index.
pub fn item_to_states(
    item: &MediaItem,
    backend: &str,
    library_id: &str,
    parents: &ParentCache,
    after: Option<i64>,
) -> Result<Vec<State>, &'static str> {
    let kind = match item.item_type.as_str() {
        "Movie" => MediaKind::Movie,
        "Episode" => MediaKind::Episode,
        _ => return Err("unsupported item type"),
    };

    let user_data = item.user_data.as_ref();
    let watched = user_data.map(|u| u.played).unwrap_or(false);
    let played_at = user_data
        .and_then(|u| u.last_played_date.as_ref())
        .map(|d| d.timestamp());
    let added_at = item.date_created.as_ref().map(|d| d.timestamp());

    // Authoritative timestamp: last play when watched, creation otherwise.
    let updated = if watched { played_at.or(added_at) } else { added_at }.unwrap_or(0);
    if let Some(cutoff) = after {
        if updated <= cutoff {
            return Err("at or before cutoff");
        }
    }

    let guids = provider_ids_to_guids(item.provider_ids.as_ref());
    let progress_ms = user_data
        .and_then(|u| u.playback_position_ticks)
        .filter(|ticks| *ticks > 0)
        .map(|ticks| (ticks / 10_000) as u64);

    let mut template = State::new(kind, backend, item.name.clone().unwrap_or_default());
    template.year = item.production_year;
    template.guids = guids;
    template.watched = watched;
    template.updated = updated;
    template.progress = progress_ms;

    if kind == MediaKind::Episode {
        template.season = item.parent_index_number;
        template.episode = item.index_number;
        if let Some(series_id) = &item.series_id {
            if let Some(parent) = parents.get(series_id) {
                template.parent_guids = parent.clone();
            }
        }
        if !template.has_valid_episode_numbers() {
            return Err("episode without valid season/episode numbers");
        }
        if template.guids.is_empty() && template.parent_guids.is_empty() {
            return Err("episode without ids or parent");
        }
    }

    let meta = BackendMetadata {
        id: item.id.clone(),
        library_id: Some(library_id.to_string()),
        path: item.path.clone(),
        added_at,
        played_at,
        watched,
        progress_ms,
        extra: Default::default(),
    };

    let first = item.index_number.unwrap_or(0);
    let last = item.index_number_end.unwrap_or(first);
    let span = if kind == MediaKind::Episode && last > first { first..=last } else { first..=first };

    let mut states = Vec::new();
    for index in span {
        let mut state = template.clone();
        if kind == MediaKind::Episode {
            state.episode = Some(index);
        }
        state.metadata.insert(backend.to_string(), meta.clone());
        states.push(state);
    }
    Ok(states)
}

/// Remote snapshot for push targeting.
pub fn item_snapshot(item: &MediaItem, library_id: Option<&str>) -> BackendMetadata {
    let user_data = item.user_data.as_ref();
    let watched = user_data.map(|u| u.played).unwrap_or(false);
    BackendMetadata {
        id: item.id.clone(),
        library_id: library_id.map(|s| s.to_string()),
        path: item.path.clone(),
        added_at: item.date_created.as_ref().map(|d| d.timestamp()),
        played_at: user_data.and_then(|u| u.last_played_date.as_ref()).map(|d| d.timestamp()),
        watched,
        progress_ms: user_data
            .and_then(|u| u.playback_position_ticks)
            .filter(|t| *t > 0)
            .map(|t| (t / 10_000) as u64),
        extra: Default::default(),
    }
}

pub fn provider_ids_to_guids(provider_ids: Option<&HashMap<String, String>>) -> GuidMap {
    let mut guids = GuidMap::new();
    if let Some(ids) = provider_ids {
        for (tag, value) in ids {
            guids.insert_tagged(tag, value);
        }
    }
    guids
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
