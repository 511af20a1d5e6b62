use tracing::trace;
use watchstate_models::{BackendMetadata, State};

/// What an export run should do for one state on one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushDecision {
    MarkWatched,
    MarkUnwatched,
    Noop(&'static str),
}

/// The canonical "latest wins" push decision.
///
/// The canonical side only pushes when it is strictly newer than the remote
/// snapshot and the flags differ; a tainted state never pushes (its watched
/// flag came from an in-progress transition). When the canonical side is
/// older the remote is left alone: the next import will ingest it instead.
pub fn decide_push(state: &State, remote: &BackendMetadata) -> PushDecision {
    if state.tainted {
        return PushDecision::Noop("tainted");
    }

    let remote_updated = remote.played_at.or(remote.added_at).unwrap_or(0);

    if state.watched == remote.watched {
        return PushDecision::Noop("in sync");
    }
    if state.updated <= remote_updated {
        trace!(
            canonical = state.updated,
            remote = remote_updated,
            "remote newer or equal, leaving for import"
        );
        return PushDecision::Noop("remote newer");
    }

    if state.watched {
        PushDecision::MarkWatched
    } else {
        PushDecision::MarkUnwatched
    }
}
