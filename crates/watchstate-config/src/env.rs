use crate::config::CronConfig;

/// Environment variable names the engine reacts to.
pub const WS_TZ: &str = "WS_TZ";
pub const WS_CRON_IMPORT: &str = "WS_CRON_IMPORT";
pub const WS_CRON_EXPORT: &str = "WS_CRON_EXPORT";
pub const WS_CRON_BACKUP: &str = "WS_CRON_BACKUP";
pub const WS_CRON_PROGRESS: &str = "WS_CRON_PROGRESS";
pub const WEBUI_ENABLED: &str = "WEBUI_ENABLED";
pub const WS_API_KEY: &str = "WS_API_KEY";
pub const WS_LOGS_CONTEXT: &str = "WS_LOGS_CONTEXT";

/// Read the `WS_CRON_*` schedule overrides from the environment.
pub fn crons_from_env() -> CronConfig {
    CronConfig {
        import: std::env::var(WS_CRON_IMPORT).ok(),
        export: std::env::var(WS_CRON_EXPORT).ok(),
        backup: std::env::var(WS_CRON_BACKUP).ok(),
        progress: std::env::var(WS_CRON_PROGRESS).ok(),
    }
}

pub fn api_key_from_env() -> Option<String> {
    std::env::var(WS_API_KEY).ok()
}
