//! Webhook-plugin payload parsing shared by the MediaBrowser family.
//!
//! The plugin posts a flat JSON document: item fields at the top level,
//! external ids as `Provider_<tag>` keys, and the event under `Event` or
//! `NotificationType`.

use crate::error::BackendError;
use crate::webhook::{json_path_bool, json_path_i64, json_path_str, RequestAttributes, WebhookRequest};
use serde_json::Value;
use watchstate_models::{BackendEvent, BackendMetadata, MediaKind, State, WebhookEvent};

pub fn inspect(request: &WebhookRequest) -> Result<RequestAttributes, BackendError> {
    let value: Value = serde_json::from_slice(&request.body)?;
    Ok(RequestAttributes {
        user_id: json_path_str(&value, "UserId").map(str::to_string),
        backend_id: json_path_str(&value, "ServerId").map(str::to_string),
    })
}

pub fn parse(request: &WebhookRequest, backend: &str, received_at: i64) -> Result<State, BackendError> {
    let value: Value = serde_json::from_slice(&request.body)?;

    let event_name = json_path_str(&value, "Event")
        .or_else(|| json_path_str(&value, "NotificationType"))
        .ok_or_else(|| BackendError::validation("webhook payload has no event"))?;
    let event = WebhookEvent::parse(event_name)
        .ok_or_else(|| BackendError::validation(format!("unhandled webhook event '{event_name}'")))?;

    let item_type = json_path_str(&value, "ItemType")
        .ok_or_else(|| BackendError::validation("webhook payload has no item type"))?;
    let kind = MediaKind::parse(item_type)
        .filter(|k| *k != MediaKind::Show)
        .ok_or_else(|| BackendError::validation(format!("unsupported item type '{item_type}'")))?;

    let remote_id = json_path_str(&value, "ItemId")
        .ok_or_else(|| BackendError::validation("webhook payload has no item id"))?
        .to_string();

    let mut state = State::new(kind, backend, json_path_str(&value, "Name").unwrap_or_default());
    state.year = json_path_i64(&value, "Year").map(|y| y as i32);
    state.tainted = event.is_tainted();

    if let Value::Object(map) = &value {
        for (key, entry) in map {
            if let Some(tag) = key.strip_prefix("Provider_") {
                if let Some(id) = entry.as_str() {
                    state.guids.insert_tagged(tag, id);
                }
            }
        }
    }

    if kind == MediaKind::Episode {
        state.season = json_path_i64(&value, "SeasonNumber").map(|v| v as i32);
        state.episode = json_path_i64(&value, "EpisodeNumber").map(|v| v as i32);
        state.title = json_path_str(&value, "SeriesName")
            .map(|series| format!("{series}: {}", state.title))
            .unwrap_or_else(|| state.title.clone());
    }

    let played = json_path_bool(&value, "Played").unwrap_or(false);
    let watched = !event.is_tainted() && played;
    let timestamp = json_path_str(&value, "UtcTimestamp")
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|d| d.timestamp())
        .unwrap_or(received_at);
    let progress_ms = json_path_i64(&value, "PlaybackPositionTicks")
        .filter(|ticks| *ticks > 0)
        .map(|ticks| (ticks / 10_000) as u64);

    state.watched = watched;
    state.updated = timestamp;
    state.progress = progress_ms;
    state.metadata.insert(
        backend.to_string(),
        BackendMetadata {
            id: remote_id,
            watched,
            played_at: watched.then_some(timestamp),
            progress_ms,
            ..Default::default()
        },
    );
    state
        .extra
        .insert(backend.to_string(), BackendEvent { event, received_at });

    Ok(state)
}
