use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads from media hot paths.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Load configuration from `path`, writing defaults if it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::with_config(Some(path.to_path_buf()), config))
    }

    /// In-memory store that never touches disk
    pub fn in_memory(config: AppConfig) -> Self {
        Self::with_config(None, config)
    }

    fn with_config(path: Option<PathBuf>, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        if let Some(path) = &self.path {
            Self::write_file(path, &config).await?;
        }
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Read-modify-write; the last concurrent writer wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("vcall.json");

        let store = ConfigStore::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), AppConfig::default());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.webrtc.max_rtp_payload = 1400;
                c.session.ssrc_grace_ms = 500;
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert_eq!(config.webrtc.max_rtp_payload, 1400);

        // Persistence
        let store2 = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store2.get().session.ssrc_grace_ms, 500);
    }

    #[tokio::test]
    async fn test_invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = ConfigStore::load(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = ConfigStore::in_memory(AppConfig::default());
        store.update(|c| c.audio.gate_enabled = false).await.unwrap();
        assert!(!store.get().audio.gate_enabled);
        assert!(store.path().is_none());
    }
}
