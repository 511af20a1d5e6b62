use anyhow::Result;
use std::path::{Path, PathBuf};

/// Resolves the on-disk layout under the config directory:
/// database, server/global config files, daily logs, and the webhook cache.
pub struct PathManager {
    config_dir: PathBuf,
}

impl PathManager {
    pub fn new() -> Result<Self> {
        let base = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?
            .join("watchstate");
        Ok(Self { config_dir: base })
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { config_dir: base.into() }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_file(&self) -> PathBuf {
        self.config_dir.join("db.sqlite")
    }

    pub fn servers_file(&self) -> PathBuf {
        self.config_dir.join("config").join("servers.yaml")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config").join("config.yaml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// Daily log file prefix; the appender adds the date suffix.
    pub fn log_file_prefix(&self) -> &'static str {
        "app"
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.config_dir.join("backup")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(self.config_dir.join("config"))?;
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.backup_dir())?;
        Ok(())
    }
}

impl Default for PathManager {
    fn default() -> Self {
        match std::env::var("WS_CONFIG_DIR") {
            Ok(dir) => Self::with_base(dir),
            Err(_) => Self::new().unwrap_or_else(|_| Self::with_base("/config")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_base() {
        let paths = PathManager::with_base("/tmp/ws");
        assert_eq!(paths.database_file(), PathBuf::from("/tmp/ws/db.sqlite"));
        assert_eq!(paths.servers_file(), PathBuf::from("/tmp/ws/config/servers.yaml"));
        assert_eq!(paths.log_dir(), PathBuf::from("/tmp/ws/logs"));
        assert_eq!(paths.cache_dir(), PathBuf::from("/tmp/ws/cache"));
    }
}
