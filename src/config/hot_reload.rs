use arc_swap::{ArcSwap, Guard};
use std::path::PathBuf;
use std::sync::Arc;

use super::Config;

/// Shared, swappable configuration.
///
/// Every clone points at the same slot. A round reads the slot once and
/// works from that snapshot to the end, so a `ReloadConfig` command changes
/// behaviour from the following round on and never halfway through one.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<Config>>,
    source: PathBuf,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let source = config.config_path.clone();
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            source,
        }
    }

    /// Short-lived view for reading a few fields.
    pub fn load(&self) -> Guard<Arc<Config>> {
        self.current.load()
    }

    /// Owned snapshot, for work that spans await points.
    pub fn load_full(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Re-read the file the config came from. A file that fails to parse or
    /// validate leaves the running config untouched.
    pub fn reload(&self) -> anyhow::Result<()> {
        let fresh = Config::load_from_path(&self.source)?;
        self.current.store(Arc::new(fresh));
        tracing::info!(path = %self.source.display(), "configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn handle_for(dir: &TempDir, body: &str) -> (ConfigHandle, PathBuf) {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        (ConfigHandle::new(Config::load_from_path(&path).unwrap()), path)
    }

    #[test]
    fn reload_is_seen_by_every_clone() {
        let dir = TempDir::new().unwrap();
        let (handle, path) = handle_for(&dir, "[workflow]\nmax_active_tasks = 4\n");
        let other = handle.clone();

        std::fs::write(&path, "[workflow]\nmax_active_tasks = 3\n").unwrap();
        handle.reload().unwrap();
        assert_eq!(other.load().workflow.max_active_tasks, 3);
    }

    #[test]
    fn snapshot_taken_before_reload_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let (handle, path) = handle_for(&dir, "[workflow]\nmax_active_tasks = 4\n");
        let round = handle.load_full();

        std::fs::write(&path, "[workflow]\nmax_active_tasks = 9\n").unwrap();
        handle.reload().unwrap();
        assert_eq!(round.workflow.max_active_tasks, 4);
        assert_eq!(handle.load().workflow.max_active_tasks, 9);
    }

    #[test]
    fn invalid_file_keeps_running_config() {
        let dir = TempDir::new().unwrap();
        let (handle, path) = handle_for(&dir, "[workflow]\nmax_active_tasks = 4\n");

        std::fs::write(&path, "[workflow]\nmax_active_tasks = 0\n").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.load().workflow.max_active_tasks, 4);
    }

    #[test]
    fn missing_file_is_an_error() {
        let handle = ConfigHandle::new(Config {
            config_path: PathBuf::from("/nonexistent/ciris/config.toml"),
            ..Config::default()
        });
        assert!(handle.reload().is_err());
    }
}
