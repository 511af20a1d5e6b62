pub mod config;
pub mod env;
pub mod paths;

pub use config::{
    AppConfig, BackendConfig, BackendKind, BackendOptions, ExportOptions, ImportOptions,
    WebhookOptions,
};
pub use paths::PathManager;
