use arc_swap::ArcSwap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::RelayConfig;
use crate::error::Result;

/// Configuration store backed by an optional JSON file
///
/// Uses `ArcSwap` for lock-free reads, so the data path can consult
/// thresholds on every packet without taking a lock.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<RelayConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub config: Arc<RelayConfig>,
}

impl ConfigStore {
    /// Create a store that only lives in memory
    pub fn in_memory(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(None, config))
    }

    /// Load configuration from a JSON file, creating it with defaults if missing
    pub fn open(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let config: RelayConfig = serde_json::from_str(&raw)?;
            debug!("Loaded relay config from {}", path.display());
            config
        } else {
            let config = RelayConfig::default();
            Self::persist(path, &config)?;
            info!("Created default relay config at {}", path.display());
            config
        };
        config.validate()?;
        Ok(Self::from_parts(Some(path.to_path_buf()), config))
    }

    fn from_parts(path: Option<PathBuf>, config: RelayConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    fn persist(path: &Path, config: &RelayConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<RelayConfig> {
        self.cache.load_full()
    }

    /// Replace the whole configuration
    pub fn set(&self, config: RelayConfig) -> Result<()> {
        config.validate()?;
        if let Some(ref path) = self.path {
            Self::persist(path, &config)?;
        }
        let config = Arc::new(config);
        self.cache.store(config.clone());

        // Notify subscribers; no receivers is fine
        let _ = self.change_tx.send(ConfigChange { config });
        Ok(())
    }

    /// Update configuration with a closure
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RelayConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config)
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");

        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), RelayConfig::default());
    }

    #[test]
    fn test_update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let store = ConfigStore::open(&path).unwrap();
        let mut rx = store.subscribe();

        store.update(|c| c.tx_pkt_drop_threshold = 64).unwrap();
        assert_eq!(store.get().tx_pkt_drop_threshold, 64);
        assert_eq!(rx.try_recv().unwrap().config.tx_pkt_drop_threshold, 64);

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get().tx_pkt_drop_threshold, 64);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let store = ConfigStore::in_memory(RelayConfig::default()).unwrap();
        assert!(store.update(|c| c.tx_queue_size = 0).is_err());
        assert_eq!(store.get().tx_queue_size, 200);
    }
}
