use crate::event::WebhookEvent;
use crate::guid::{virtual_pointer, GuidMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// What kind of media a state record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
    Show,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "episode",
            MediaKind::Show => "show",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "movie" => Some(MediaKind::Movie),
            "episode" => Some(MediaKind::Episode),
            "show" | "series" => Some(MediaKind::Show),
            _ => None,
        }
    }
}

/// Per-backend snapshot of how one backend sees an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMetadata {
    /// Opaque remote id in this backend (rating key / item id).
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix time the backend first saw the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<i64>,
    /// Unix time of the backend's last play, when watched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub played_at: Option<i64>,
    pub watched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Auxiliary event info recorded per backend (webhook ingestion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub event: WebhookEvent,
    /// Unix time the event was received.
    pub received_at: i64,
}

/// Result of merging an incoming report into an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The accepted write changed watched/progress/updated, so the record
    /// must be flushed to the store.
    pub changed: bool,
    /// The incoming side won the play-state comparison.
    pub incoming_won: bool,
}

/// The canonical play-state record.
///
/// Identity is the set of external-id pairs plus the virtual pointers each
/// backend contributes; see [`State::pointers`]. `tainted` is a transport
/// flag on incoming events and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Store-assigned id; 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub kind: MediaKind,
    /// Backend that last contributed an accepted write.
    pub via: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<i32>,
    #[serde(default)]
    pub guids: GuidMap,
    #[serde(default)]
    pub parent_guids: GuidMap,
    #[serde(default)]
    pub metadata: BTreeMap<String, BackendMetadata>,
    #[serde(default)]
    pub extra: BTreeMap<String, BackendEvent>,
    pub watched: bool,
    /// Unix time of the last accepted write.
    pub updated: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u64>,
    /// Derived from an in-progress transition; see webhook ingestion.
    #[serde(skip)]
    pub tainted: bool,
}

impl State {
    pub fn new(kind: MediaKind, via: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            via: via.into(),
            title: title.into(),
            year: None,
            season: None,
            episode: None,
            guids: GuidMap::new(),
            parent_guids: GuidMap::new(),
            metadata: BTreeMap::new(),
            extra: BTreeMap::new(),
            watched: false,
            updated: 0,
            progress: None,
            tainted: false,
        }
    }

    pub fn is_episode(&self) -> bool {
        self.kind == MediaKind::Episode
    }

    /// Episodes are only acceptable with `season >= 0` and `episode >= 1`.
    pub fn has_valid_episode_numbers(&self) -> bool {
        match (self.season, self.episode) {
            (Some(season), Some(episode)) => season >= 0 && episode >= 1,
            _ => false,
        }
    }

    /// Relative pointers tie an episode to its parent show:
    /// `relative://<parent_pointer>/<season>/<episode>`.
    pub fn relative_pointers(&self) -> Vec<String> {
        if !self.is_episode() || !self.has_valid_episode_numbers() {
            return Vec::new();
        }
        let (season, episode) = (self.season.unwrap_or(0), self.episode.unwrap_or(0));
        self.parent_guids
            .pointers()
            .into_iter()
            .map(|parent| format!("relative://{}/{}/{}", parent, season, episode))
            .collect()
    }

    /// Virtual pointers contributed by each backend holding the item.
    pub fn virtual_pointers(&self) -> Vec<String> {
        self.metadata
            .iter()
            .filter(|(_, meta)| !meta.id.is_empty())
            .map(|(backend, meta)| virtual_pointer(backend, &meta.id))
            .collect()
    }

    /// Every pointer that identifies this record: external ids, per-backend
    /// virtual ids, and (for episodes) parent-relative positions.
    pub fn pointers(&self) -> Vec<String> {
        let mut out = self.guids.pointers();
        out.extend(self.virtual_pointers());
        out.extend(self.relative_pointers());
        out
    }

    /// A record is addressable when it has at least one real or virtual GUID,
    /// or (for episodes) at least one relative GUID.
    pub fn is_addressable(&self) -> bool {
        !self.guids.is_empty()
            || !self.virtual_pointers().is_empty()
            || !self.relative_pointers().is_empty()
    }

    /// True when the two records are the same entity: any overlapping pointer
    /// (external, virtual, or episode-relative position under the same
    /// parent).
    pub fn matches(a: &State, b: &State) -> bool {
        if a.guids.overlaps(&b.guids) {
            return true;
        }
        let a_virtual = a.virtual_pointers();
        if !a_virtual.is_empty() {
            let b_virtual = b.virtual_pointers();
            if a_virtual.iter().any(|p| b_virtual.contains(p)) {
                return true;
            }
        }
        if a.is_episode() && b.is_episode() {
            let a_rel = a.relative_pointers();
            if !a_rel.is_empty() {
                let b_rel = b.relative_pointers();
                return a_rel.iter().any(|p| b_rel.contains(p));
            }
        }
        false
    }

    /// Merge an incoming report into this record.
    ///
    /// Latest wins for watched/progress/via/updated, with two carve-outs:
    /// a tainted incoming event may refresh progress and per-backend
    /// snapshots but never flips the watched flag, and on an `updated` tie
    /// the watched side wins (watched is monotonic by policy); a full tie
    /// keeps the existing record so merging is idempotent.
    pub fn merge(&mut self, incoming: &State) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let incoming_newer = incoming.updated > self.updated;
        let incoming_wins = if incoming.tainted {
            // Tainted transitions refresh the clock but not the flag.
            false
        } else if incoming_newer {
            true
        } else if incoming.updated == self.updated && incoming.watched != self.watched {
            incoming.watched
        } else {
            false
        };

        if incoming_wins {
            if self.watched != incoming.watched || self.progress != incoming.progress {
                outcome.changed = true;
            }
            self.watched = incoming.watched;
            self.progress = incoming.progress;
            self.via = incoming.via.clone();
            if incoming.updated != self.updated {
                self.updated = incoming.updated;
                outcome.changed = true;
            }
            outcome.incoming_won = true;
        } else if incoming.tainted {
            // Progress may still move forward on play/pause/resume.
            if incoming.progress.is_some() && self.progress != incoming.progress {
                self.progress = incoming.progress;
                outcome.changed = true;
            }
            if incoming_newer {
                self.updated = incoming.updated;
                self.via = incoming.via.clone();
                outcome.changed = true;
            }
            debug!(via = %incoming.via, "tainted event merged without watched transition");
        }

        self.guids.union_from(&incoming.guids, incoming_newer);
        self.parent_guids.union_from(&incoming.parent_guids, incoming_newer);

        // Per-backend snapshots are replaced wholesale for the contributing
        // backend; other backends' entries are preserved.
        for (backend, meta) in &incoming.metadata {
            if self.metadata.insert(backend.clone(), meta.clone()) != Some(meta.clone()) {
                outcome.changed = true;
            }
        }
        for (backend, event) in &incoming.extra {
            self.extra.insert(backend.clone(), event.clone());
        }

        if self.title.is_empty() && !incoming.title.is_empty() {
            self.title = incoming.title.clone();
        }
        if self.year.is_none() {
            self.year = incoming.year;
        }
        if self.season.is_none() {
            self.season = incoming.season;
        }
        if self.episode.is_none() {
            self.episode = incoming.episode;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GuidSource;

    fn movie(via: &str, updated: i64, watched: bool) -> State {
        let mut state = State::new(MediaKind::Movie, via, "Dune");
        state.year = Some(2021);
        state.guids.insert(GuidSource::Imdb, "tt1160419");
        state.watched = watched;
        state.updated = updated;
        state.metadata.insert(
            via.to_string(),
            BackendMetadata {
                id: format!("{via}-42"),
                watched,
                played_at: watched.then_some(updated),
                ..Default::default()
            },
        );
        state
    }

    #[test]
    fn newer_incoming_wins_play_state() {
        let mut existing = movie("home_jellyfin", 1_714_550_400, true);
        let incoming = movie("home_plex", 1_714_640_400, false);

        let outcome = existing.merge(&incoming);
        assert!(outcome.incoming_won);
        assert!(outcome.changed);
        assert!(!existing.watched);
        assert_eq!(existing.via, "home_plex");
        assert_eq!(existing.updated, 1_714_640_400);
        assert!(existing.metadata.contains_key("home_jellyfin"));
        assert!(existing.metadata.contains_key("home_plex"));
    }

    #[test]
    fn older_incoming_is_ignored_for_play_state() {
        let mut existing = movie("home_plex", 1_714_640_400, true);
        let incoming = movie("home_jellyfin", 1_714_550_400, false);

        let outcome = existing.merge(&incoming);
        assert!(!outcome.incoming_won);
        assert!(existing.watched);
        assert_eq!(existing.via, "home_plex");
        // The snapshot still lands.
        assert!(existing.metadata.contains_key("home_jellyfin"));
    }

    #[test]
    fn equal_updated_prefers_watched() {
        let mut existing = movie("home_plex", 1_714_640_400, false);
        let incoming = movie("home_jellyfin", 1_714_640_400, true);
        existing.merge(&incoming);
        assert!(existing.watched);
        assert_eq!(existing.via, "home_jellyfin");

        // And the mirror image: watched existing holds against an unwatched
        // incoming with the same clock.
        let mut existing = movie("home_plex", 1_714_640_400, true);
        let incoming = movie("home_jellyfin", 1_714_640_400, false);
        existing.merge(&incoming);
        assert!(existing.watched);
        assert_eq!(existing.via, "home_plex");
    }

    #[test]
    fn merge_is_idempotent() {
        let mut state = movie("home_plex", 1_714_640_400, true);
        let copy = state.clone();
        let outcome = state.merge(&copy);
        assert!(!outcome.changed);
        assert_eq!(state, copy);
    }

    #[test]
    fn three_way_merge_settles_on_max_updated() {
        let a = movie("a", 100, true);
        let b = movie("b", 200, false);
        let c = movie("c", 300, true);

        // Apply in two different orders; watched/via/updated must agree.
        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut right = a.clone();
        right.merge(&c);
        right.merge(&b);

        assert_eq!(left.watched, right.watched);
        assert_eq!(left.via, right.via);
        assert_eq!(left.updated, right.updated);
        assert_eq!(left.via, "c");
        assert!(left.watched);
    }

    #[test]
    fn tainted_incoming_never_flips_watched() {
        let mut existing = movie("home_plex", 1_714_640_400, true);
        let mut incoming = movie("home_jellyfin", 1_714_700_000, false);
        incoming.tainted = true;
        incoming.progress = Some(90_000);

        let outcome = existing.merge(&incoming);
        assert!(!outcome.incoming_won);
        assert!(existing.watched, "tainted event flipped watched");
        assert_eq!(existing.progress, Some(90_000));
        assert_eq!(existing.updated, 1_714_700_000);
        assert!(outcome.changed);
    }

    #[test]
    fn title_and_year_fill_only_when_absent() {
        let mut existing = movie("home_plex", 100, false);
        existing.title = String::new();
        existing.year = None;
        let incoming = movie("home_jellyfin", 50, false);

        existing.merge(&incoming);
        assert_eq!(existing.title, "Dune");
        assert_eq!(existing.year, Some(2021));

        let mut named = movie("home_plex", 100, false);
        let mut other = movie("home_jellyfin", 50, false);
        other.title = "Dune: Part One".to_string();
        named.merge(&other);
        assert_eq!(named.title, "Dune");
    }

    #[test]
    fn matches_on_guid_overlap_and_virtual_pointer() {
        let a = movie("home_plex", 100, false);
        let b = movie("home_jellyfin", 200, true);
        assert!(State::matches(&a, &b));

        let mut c = State::new(MediaKind::Movie, "home_plex", "Other");
        c.guids.insert(GuidSource::Imdb, "tt7654321");
        assert!(!State::matches(&a, &c));

        // No shared external ids, but the same backend remote id.
        let mut d = State::new(MediaKind::Movie, "home_plex", "Dune");
        d.metadata.insert(
            "home_plex".to_string(),
            BackendMetadata { id: "home_plex-42".to_string(), ..Default::default() },
        );
        assert!(State::matches(&a, &d));
    }

    #[test]
    fn episodes_match_on_parent_and_position() {
        let mut a = State::new(MediaKind::Episode, "home_plex", "Winter Is Coming");
        a.season = Some(1);
        a.episode = Some(1);
        a.parent_guids.insert(GuidSource::Tvdb, "121361");

        let mut b = State::new(MediaKind::Episode, "home_jellyfin", "Winter Is Coming");
        b.season = Some(1);
        b.episode = Some(1);
        b.parent_guids.insert(GuidSource::Tvdb, "121361");

        assert!(State::matches(&a, &b));
        assert!(a.is_addressable());

        b.episode = Some(2);
        assert!(!State::matches(&a, &b));
    }

    #[test]
    fn episode_number_rules() {
        let mut episode = State::new(MediaKind::Episode, "home_plex", "Pilot");
        episode.season = Some(0);
        episode.episode = Some(1);
        assert!(episode.has_valid_episode_numbers());
        episode.episode = Some(0);
        assert!(!episode.has_valid_episode_numbers());
        episode.season = None;
        assert!(!episode.has_valid_episode_numbers());
    }

    #[test]
    fn unaddressable_without_any_pointer() {
        let state = State::new(MediaKind::Movie, "home_plex", "Mystery");
        assert!(!state.is_addressable());
        assert!(state.pointers().is_empty());
    }
}
