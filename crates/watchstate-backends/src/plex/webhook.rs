//! Plex webhook parsing. Plex posts `multipart/form-data` with the JSON
//! document in a `payload` part; thumbnails ride alongside and are ignored.

use crate::error::BackendError;
use crate::plex::api::{guids_to_map, Guid};
use crate::webhook::{
    json_path, json_path_i64, json_path_str, multipart_field, RequestAttributes, WebhookRequest,
};
use serde_json::Value;
use watchstate_models::{BackendEvent, BackendMetadata, MediaKind, State, WebhookEvent};

fn payload(request: &WebhookRequest) -> Result<Value, BackendError> {
    let raw = if request.is_multipart() {
        multipart_field(&request.content_type, &request.body, "payload")?
    } else {
        request.body.clone()
    };
    Ok(serde_json::from_slice(&raw)?)
}

pub fn inspect(request: &WebhookRequest) -> Result<RequestAttributes, BackendError> {
    let value = payload(request)?;
    Ok(RequestAttributes {
        user_id: json_path_i64(&value, "Account/id")
            .map(|id| id.to_string())
            .or_else(|| json_path_str(&value, "Account/id").map(str::to_string)),
        backend_id: json_path_str(&value, "Server/uuid").map(str::to_string),
    })
}

pub fn parse(request: &WebhookRequest, backend: &str, received_at: i64) -> Result<State, BackendError> {
    let value = payload(request)?;

    let event_name = json_path_str(&value, "event")
        .ok_or_else(|| BackendError::validation("plex webhook without event"))?;
    let event = WebhookEvent::parse(event_name)
        .ok_or_else(|| BackendError::validation(format!("unhandled plex event '{event_name}'")))?;

    let kind_raw = json_path_str(&value, "Metadata/type")
        .ok_or_else(|| BackendError::validation("plex webhook without metadata type"))?;
    let kind = MediaKind::parse(kind_raw)
        .filter(|k| *k != MediaKind::Show)
        .ok_or_else(|| BackendError::validation(format!("unsupported item type '{kind_raw}'")))?;

    let rating_key = json_path_str(&value, "Metadata/ratingKey")
        .ok_or_else(|| BackendError::validation("plex webhook without ratingKey"))?
        .to_string();

    let guids: Vec<Guid> = json_path(&value, "Metadata/Guid")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let title = match kind {
        MediaKind::Episode => {
            let series = json_path_str(&value, "Metadata/grandparentTitle").unwrap_or_default();
            let episode = json_path_str(&value, "Metadata/title").unwrap_or_default();
            if series.is_empty() {
                episode.to_string()
            } else {
                format!("{series}: {episode}")
            }
        }
        _ => json_path_str(&value, "Metadata/title").unwrap_or_default().to_string(),
    };

    let watched = event == WebhookEvent::Scrobble;
    let updated = json_path_i64(&value, "Metadata/lastViewedAt").unwrap_or(received_at);
    let progress = json_path_i64(&value, "Metadata/viewOffset")
        .filter(|ms| *ms > 0)
        .map(|ms| ms as u64);

    let mut state = State::new(kind, backend, title);
    state.year = json_path_i64(&value, "Metadata/year").map(|y| y as i32);
    state.guids = guids_to_map(&guids);
    state.tainted = event.is_tainted();
    state.watched = watched;
    state.updated = updated;
    state.progress = progress;

    if kind == MediaKind::Episode {
        state.season = json_path_i64(&value, "Metadata/parentIndex").map(|v| v as i32);
        state.episode = json_path_i64(&value, "Metadata/index").map(|v| v as i32);
    }

    state.metadata.insert(
        backend.to_string(),
        BackendMetadata {
            id: rating_key,
            library_id: json_path_i64(&value, "Metadata/librarySectionID").map(|id| id.to_string()),
            watched,
            played_at: watched.then_some(updated),
            progress_ms: progress,
            ..Default::default()
        },
    );
    state
        .extra
        .insert(backend.to_string(), BackendEvent { event, received_at });

    Ok(state)
}
