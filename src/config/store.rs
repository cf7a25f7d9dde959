use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON settings file
///
/// Uses `ArcSwap` for lock-free reads.
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: ArcSwap<AppConfig>,
}

impl ConfigStore {
    /// Store holding the built-in defaults, not backed by a file
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cache: ArcSwap::from_pointee(AppConfig::default()),
        }
    }

    /// Load and validate a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            cache: ArcSwap::from_pointee(config),
        })
    }

    /// Load `path` if given, else use defaults
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current configuration
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Validate and replace the configuration in memory
    pub fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    /// Apply a change to a copy of the current configuration
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config)
    }

    /// Write the current configuration to `path` (temp file + rename)
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&*self.get())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Resolution;
    use std::io::Write;

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"video": {{"device": "/dev/video2", "fps": 15}}, "controls": {{"values": {{"gain": 4}}}}}}"#
        )
        .unwrap();

        let store = ConfigStore::load(file.path()).unwrap();
        let config = store.get();
        assert_eq!(config.video.device, PathBuf::from("/dev/video2"));
        assert_eq!(config.video.fps, 15);
        assert_eq!(config.video.resolution(), Resolution::SVGA);
        assert_eq!(config.controls.values.get("gain"), Some(&4));
        assert_eq!(store.path(), Some(file.path()));
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            ConfigStore::load(&missing),
            Err(AppError::Config(_))
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::load(&broken),
            Err(AppError::Serialization(_))
        ));

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, r#"{"video": {"fps": 0}}"#).unwrap();
        assert!(matches!(
            ConfigStore::load(&invalid),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_update_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camview.json");

        let store = ConfigStore::in_memory();
        store
            .update(|c| {
                c.video.width = 1280;
                c.video.height = 720;
            })
            .unwrap();
        assert!(store.update(|c| c.video.fps = 0).is_err());
        assert_eq!(store.get().video.fps, 30);

        store.save_to(&path).unwrap();
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(*reloaded.get(), *store.get());
    }
}
