use serde::{Deserialize, Serialize};
use std::fmt;

/// Webhook events recognized across vendors.
///
/// Plex sends the `media.*` family; Jellyfin and Emby plugins send the
/// PascalCase family. Events describing an in-progress transition (play,
/// pause, resume and their progress counterparts) are tainted: they may carry
/// a play position but must never flip the watched flag on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    Scrobble,
    Play,
    Pause,
    Resume,
    Stop,
    ItemAdded,
    UserDataSaved,
    PlaybackStart,
    PlaybackProgress,
    PlaybackStop,
}

impl WebhookEvent {
    /// Parse a vendor event name. Returns None for events the sync engine
    /// does not consume (library scans, deletions, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "media.scrobble" => Some(WebhookEvent::Scrobble),
            "media.play" => Some(WebhookEvent::Play),
            "media.pause" => Some(WebhookEvent::Pause),
            "media.resume" => Some(WebhookEvent::Resume),
            "media.stop" => Some(WebhookEvent::Stop),
            "ItemAdded" => Some(WebhookEvent::ItemAdded),
            "UserDataSaved" => Some(WebhookEvent::UserDataSaved),
            "PlaybackStart" => Some(WebhookEvent::PlaybackStart),
            "PlaybackProgress" => Some(WebhookEvent::PlaybackProgress),
            "PlaybackStop" => Some(WebhookEvent::PlaybackStop),
            _ => None,
        }
    }

    /// In-progress transitions are untrustworthy for the watched flag.
    pub fn is_tainted(&self) -> bool {
        matches!(
            self,
            WebhookEvent::Play
                | WebhookEvent::Pause
                | WebhookEvent::Resume
                | WebhookEvent::PlaybackStart
                | WebhookEvent::PlaybackProgress
        )
    }

    /// Events that can legitimately carry a play position.
    pub fn has_play_progress(&self) -> bool {
        matches!(
            self,
            WebhookEvent::Play
                | WebhookEvent::Pause
                | WebhookEvent::Resume
                | WebhookEvent::Stop
                | WebhookEvent::PlaybackStart
                | WebhookEvent::PlaybackProgress
                | WebhookEvent::PlaybackStop
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Scrobble => "media.scrobble",
            WebhookEvent::Play => "media.play",
            WebhookEvent::Pause => "media.pause",
            WebhookEvent::Resume => "media.resume",
            WebhookEvent::Stop => "media.stop",
            WebhookEvent::ItemAdded => "ItemAdded",
            WebhookEvent::UserDataSaved => "UserDataSaved",
            WebhookEvent::PlaybackStart => "PlaybackStart",
            WebhookEvent::PlaybackProgress => "PlaybackProgress",
            WebhookEvent::PlaybackStop => "PlaybackStop",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_events_are_tainted() {
        for event in ["media.play", "media.pause", "media.resume", "PlaybackProgress"] {
            assert!(WebhookEvent::parse(event).unwrap().is_tainted(), "{event}");
        }
        for event in ["media.scrobble", "PlaybackStop", "UserDataSaved", "ItemAdded"] {
            assert!(!WebhookEvent::parse(event).unwrap().is_tainted(), "{event}");
        }
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(WebhookEvent::parse("library.new"), None);
        assert_eq!(WebhookEvent::parse(""), None);
    }
}
