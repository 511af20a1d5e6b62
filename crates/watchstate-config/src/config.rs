use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use watchstate_models::guid::valid_backend_name;

/// Which vendor a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Plex,
    Jellyfin,
    Emby,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Plex => "plex",
            BackendKind::Jellyfin => "jellyfin",
            BackendKind::Emby => "emby",
        }
    }
}

/// Top-level configuration as handed to the core, already parsed.
///
/// File reading and writing happens outside the engine; these structures are
/// the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub crons: CronConfig,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Extra key/value pairs stamped onto every log record.
    #[serde(default)]
    pub logs_context: HashMap<String, String>,
}

impl AppConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Backends selected by name, or all when the selection is empty.
    pub fn select_backends(&self, selection: &[String]) -> Vec<&BackendConfig> {
        if selection.is_empty() {
            self.backends.iter().collect()
        } else {
            self.backends
                .iter()
                .filter(|b| selection.iter().any(|s| s == &b.name))
                .collect()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for backend in &self.backends {
            backend.validate()?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            crons: CronConfig::default(),
            api_key: None,
            logs_context: HashMap::new(),
        }
    }
}

/// One configured media-server backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique handle, `[a-z0-9_]+`. Used in virtual GUIDs and log context.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub url: String,
    pub token: String,
    pub user_id: String,
    /// The backend server's own identifier (UUID), as reported by it.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub import: ImportOptions,
    #[serde(default)]
    pub export: ExportOptions,
    #[serde(default)]
    pub webhook: WebhookOptions,
    #[serde(default)]
    pub options: BackendOptions,
}

impl BackendConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !valid_backend_name(&self.name) {
            anyhow::bail!("backend name '{}' must match [a-z0-9_]+", self.name);
        }
        if self.url.is_empty() {
            anyhow::bail!("backend '{}' has no url", self.name);
        }
        if self.token.is_empty() {
            anyhow::bail!("backend '{}' has no token", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Admit webhook/library data but merge only metadata, never play state.
    #[serde(default)]
    pub metadata_only: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { enabled: true, metadata_only: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Webhook origin checks, per backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookOptions {
    /// Require the payload user to match the configured user id.
    #[serde(default)]
    pub match_user: bool,
    /// Require the payload server id to match the configured uuid.
    #[serde(default)]
    pub match_uuid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Page size for segmented library fetches.
    #[serde(default = "default_segment_size")]
    pub segment_size: u32,
    /// Library ids skipped during import.
    #[serde(default)]
    pub ignored_libraries: Vec<String>,
    /// Worker-pool size override for this backend's request queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-request timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            ignored_libraries: Vec::new(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Cron expressions for the scheduler loop; populated from `WS_CRON_*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub import: Option<String>,
    #[serde(default)]
    pub export: Option<String>,
    #[serde(default)]
    pub backup: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_segment_size() -> u32 {
    1000
}

fn default_workers() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: BackendKind::Jellyfin,
            url: "http://jellyfin.local:8096".to_string(),
            token: "token".to_string(),
            user_id: "user".to_string(),
            uuid: None,
            import: ImportOptions::default(),
            export: ExportOptions::default(),
            webhook: WebhookOptions::default(),
            options: BackendOptions::default(),
        }
    }

    #[test]
    fn backend_names_are_validated() {
        assert!(backend("home_jellyfin").validate().is_ok());
        assert!(backend("Home Jellyfin").validate().is_err());
    }

    #[test]
    fn selection_defaults_to_all() {
        let config = AppConfig {
            backends: vec![backend("a"), backend("b")],
            ..AppConfig::default()
        };
        assert_eq!(config.select_backends(&[]).len(), 2);
        let only_b = config.select_backends(&["b".to_string()]);
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].name, "b");
    }

    #[test]
    fn defaults_match_contract() {
        let opts = BackendOptions::default();
        assert_eq!(opts.segment_size, 1000);
        assert_eq!(opts.workers, 10);
        assert_eq!(opts.request_timeout_secs, 300);
    }
}
