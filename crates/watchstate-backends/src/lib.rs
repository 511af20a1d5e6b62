pub mod context;
pub mod decision;
pub mod emby;
pub mod error;
pub mod factory;
pub mod jellyfin;
pub mod mediabrowser;
pub mod plex;
pub mod traits;
pub mod webhook;

pub use context::BackendContext;
pub use decision::{decide_push, PushDecision};
pub use error::{BackendError, ErrorKind};
pub use factory::make_backend;
pub use traits::{
    ActionSink, Backend, BackendUser, FetchedPage, HttpAction, Library, LibraryKind, ParentCache,
};
pub use webhook::{RequestAttributes, WebhookRequest};
