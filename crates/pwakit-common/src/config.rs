//! Offline delivery configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::{PwaKitError, Result};

/// Default update poll interval (five minutes).
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 5 * 60;

/// Configuration for one generation of the offline worker.
///
/// Changing `cache_name` is what produces a new generation; every other
/// store whose name differs is deleted when the new one activates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfflineConfig {
    /// The single origin this worker serves. Unset until the hosting
    /// container assigns its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Url>,

    /// Generation name (version tag) of the resource store.
    pub cache_name: String,

    /// Ordered asset manifest that must be stored before install completes.
    pub precache: Vec<String>,

    /// Path that always bypasses the store.
    pub manifest_endpoint: String,

    /// Document returned for navigations that fail while offline.
    pub offline_fallback: String,

    /// Worker script path.
    pub worker_script: String,

    /// Registration scope.
    pub scope: String,

    /// Update poll interval in seconds
    pub update_interval_secs: u64,

    /// Cap on total stored body bytes across all generations
    pub storage_quota_bytes: Option<u64>,

    /// Directory for the persisted store snapshot
    pub cache_dir: Option<PathBuf>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            origin: None,
            cache_name: "app-cache-v1".to_string(),
            precache: vec!["/".to_string(), "/index.html".to_string()],
            manifest_endpoint: "/manifest.json".to_string(),
            offline_fallback: "/".to_string(),
            worker_script: "/sw.js".to_string(),
            scope: "/".to_string(),
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            storage_quota_bytes: None,
            cache_dir: dirs::cache_dir().map(|dir| dir.join("pwakit")),
        }
    }
}

impl OfflineConfig {
    /// Create a configuration for `origin` with generation name `cache_name`.
    pub fn new(origin: Url, cache_name: impl Into<String>) -> Self {
        Self {
            origin: Some(origin),
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    /// Replace the asset manifest.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PwaKitError::config_with_source(format!("parsing {}", path.display()), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PwaKitError::config_with_source("serializing config", e))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(PwaKitError::config("cache_name must not be empty"));
        }
        if self.update_interval_secs == 0 {
            return Err(PwaKitError::config("update_interval_secs must be positive"));
        }

        let mut seen = HashSet::new();
        for path in &self.precache {
            if !path.starts_with('/') {
                return Err(PwaKitError::config(format!(
                    "precache path {path:?} is not root-relative"
                )));
            }
            if !seen.insert(path.as_str()) {
                return Err(PwaKitError::config(format!(
                    "precache path {path:?} listed twice"
                )));
            }
        }

        for (name, path) in [
            ("manifest_endpoint", &self.manifest_endpoint),
            ("offline_fallback", &self.offline_fallback),
            ("worker_script", &self.worker_script),
            ("scope", &self.scope),
        ] {
            if !path.starts_with('/') {
                return Err(PwaKitError::config(format!(
                    "{name} {path:?} is not root-relative"
                )));
            }
        }

        if !seen.contains(self.offline_fallback.as_str()) {
            return Err(PwaKitError::config(format!(
                "offline_fallback {:?} is not precached",
                self.offline_fallback
            )));
        }
        Ok(())
    }

    /// Update poll interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .as_ref()
            .ok_or_else(|| PwaKitError::config("origin is not set"))?
            .join(path)
            .map_err(|e| PwaKitError::config_with_source(format!("resolving {path:?}"), e))
    }

    /// Absolute URLs of the asset manifest, in order.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Location of the persisted store snapshot, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("cache-storage.json"))
    }
}
