use crate::context::BackendContext;
use crate::emby::EmbyBackend;
use crate::error::BackendError;
use crate::jellyfin::JellyfinBackend;
use crate::plex::PlexBackend;
use crate::traits::Backend;
use watchstate_config::{BackendConfig, BackendKind};

/// Build the adapter for one configured backend.
///
/// Config problems surface here as config errors so an orchestrator run can
/// refuse to start for that backend without touching the network.
pub fn make_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, BackendError> {
    config
        .validate()
        .map_err(|e| BackendError::config(e.to_string()))?;

    let context = BackendContext::from_config(config);
    Ok(match config.kind {
        BackendKind::Plex => Box::new(PlexBackend::new(context)),
        BackendKind::Jellyfin => Box::new(JellyfinBackend::new(context)),
        BackendKind::Emby => Box::new(EmbyBackend::new(context)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchstate_config::{BackendOptions, ExportOptions, ImportOptions, WebhookOptions};

    fn config(kind: BackendKind) -> BackendConfig {
        BackendConfig {
            name: "test_backend".to_string(),
            kind,
            url: "http://server.local".to_string(),
            token: "token".to_string(),
            user_id: "u1".to_string(),
            uuid: None,
            import: ImportOptions::default(),
            export: ExportOptions::default(),
            webhook: WebhookOptions::default(),
            options: BackendOptions::default(),
        }
    }

    #[test]
    fn builds_each_vendor() {
        for kind in [BackendKind::Plex, BackendKind::Jellyfin, BackendKind::Emby] {
            let backend = make_backend(&config(kind)).unwrap();
            assert_eq!(backend.name(), "test_backend");
        }
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let mut bad = config(BackendKind::Plex);
        bad.token = String::new();
        let err = make_backend(&bad).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Config);
    }
}
