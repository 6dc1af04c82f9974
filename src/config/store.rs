use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Comma-separated STUN URLs replacing `ice.stun_servers`
pub const STUN_SERVERS_ENV: &str = "WEBRTC_BRIDGE_STUN_SERVERS";
/// Replaces `manager.max_connections`
pub const MAX_CONNECTIONS_ENV: &str = "WEBRTC_BRIDGE_MAX_CONNECTIONS";

/// Configuration store backed by a JSON file
///
/// The file is only read. Reads go through an `ArcSwap` cache and are
/// lock-free.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<BridgeConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event, one per changed section
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

/// Apply environment overrides through `lookup`
pub fn apply_env_overrides<F>(config: &mut BridgeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(STUN_SERVERS_ENV) {
        config.ice.stun_servers = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        info!(
            "{} overrides STUN servers ({} entries)",
            STUN_SERVERS_ENV,
            config.ice.stun_servers.len()
        );
    }

    if let Some(raw) = lookup(MAX_CONNECTIONS_ENV) {
        match raw.trim().parse::<usize>() {
            Ok(max) => config.manager.max_connections = max,
            Err(e) => warn!("Ignoring {}={:?}: {}", MAX_CONNECTIONS_ENV, raw, e),
        }
    }
}

impl ConfigStore {
    /// Load configuration from `path`
    ///
    /// A missing file yields the defaults. Environment overrides are applied
    /// before validation.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str::<BridgeConfig>(&json).map_err(|e| {
                BridgeError::InvalidArgument(format!(
                    "Invalid config file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", path.display());
                BridgeConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(Self::with_config(Some(path.to_path_buf()), config))
    }

    /// Store holding `config`, not tied to any file
    pub fn in_memory(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(None, config))
    }

    fn with_config(path: Option<PathBuf>, config: BridgeConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<BridgeConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration
    pub fn set(&self, config: BridgeConfig) -> Result<()> {
        config.validate()?;
        let previous = self.cache.swap(Arc::new(config));
        self.notify(&previous);
        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BridgeConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config)
    }

    fn notify(&self, previous: &BridgeConfig) {
        let current = self.cache.load();
        for section in previous.changed_sections(&current) {
            let _ = self.change_tx.send(ConfigChange {
                key: section.to_string(),
            });
        }
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// File the configuration was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
