use std::collections::HashMap;
use watchstate_config::BackendConfig;

/// Immutable per-adapter context: everything an adapter needs to talk to its
/// server. Modification goes through the `with_*` builders, which clone; an
/// adapter is re-created from the new context rather than mutated in place.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub name: String,
    pub base_url: String,
    pub token: String,
    pub user_id: String,
    /// Server identifier as configured; refreshed copies live on the adapter.
    pub backend_id: Option<String>,
    pub options: HashMap<String, String>,
    pub segment_size: u32,
    pub ignored_libraries: Vec<String>,
}

impl BackendContext {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            user_id: config.user_id.clone(),
            backend_id: config.uuid.clone(),
            options: HashMap::new(),
            segment_size: config.options.segment_size,
            ignored_libraries: config.options.ignored_libraries.clone(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_backend_id(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn is_ignored_library(&self, library_id: &str) -> bool {
        self.ignored_libraries.iter().any(|id| id == library_id)
    }

    /// Join a path onto the base url.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchstate_config::{BackendKind, BackendOptions, ExportOptions, ImportOptions, WebhookOptions};

    #[test]
    fn trailing_slash_is_normalized() {
        let config = BackendConfig {
            name: "home_plex".to_string(),
            kind: BackendKind::Plex,
            url: "http://plex.local:32400/".to_string(),
            token: "t".to_string(),
            user_id: "1".to_string(),
            uuid: None,
            import: ImportOptions::default(),
            export: ExportOptions::default(),
            webhook: WebhookOptions::default(),
            options: BackendOptions::default(),
        };
        let context = BackendContext::from_config(&config);
        assert_eq!(context.url("/identity"), "http://plex.local:32400/identity");
    }

    #[test]
    fn with_builders_clone() {
        let base = BackendContext {
            name: "a".to_string(),
            base_url: "http://x".to_string(),
            token: String::new(),
            user_id: "u1".to_string(),
            backend_id: None,
            options: HashMap::new(),
            segment_size: 1000,
            ignored_libraries: vec![],
        };
        let derived = base.clone().with_user("u2").with_backend_id("uuid-1");
        assert_eq!(base.user_id, "u1");
        assert_eq!(derived.user_id, "u2");
        assert_eq!(derived.backend_id.as_deref(), Some("uuid-1"));
    }
}
