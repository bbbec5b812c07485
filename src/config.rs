//! Operator Configuration
//!
//! Disk selectors and scheduler settings read from a YAML (or JSON) file.
//! The file is polled and reloaded while the operator runs; the scheduler
//! reads the strategy at call time so a bad value only fails placement
//! calls, never startup.

use crate::crd::DiskSelector;
use crate::error::{Error, Result};
use crate::hardware::allocation::{JitterConfig, SchedulerStrategy};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

// =============================================================================
// Disk Configuration
// =============================================================================

/// Contents of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    /// Global disk selectors, filtered per node by `nodeLabel`
    #[serde(default)]
    pub disk_selector: Vec<DiskSelector>,

    /// Seconds between inventory passes
    #[serde(default = "default_disk_scan_interval")]
    pub disk_scan_interval: u64,

    /// Seconds between NodeDevice presence sweeps
    #[serde(default = "default_node_sweep_interval")]
    pub node_sweep_interval: u64,

    /// Seconds between orphan sweeps
    #[serde(default = "default_orphan_sweep_interval")]
    pub orphan_sweep_interval: u64,

    /// binpack or spreadout
    #[serde(default = "default_scheduler_strategy")]
    pub scheduler_strategy: String,

    /// Lower bound of the pre-placement delay, in milliseconds
    #[serde(default = "default_min_jitter_ms")]
    pub min_jitter_ms: u64,

    /// Upper bound of the pre-placement delay, in milliseconds
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Name of the CSIDriver object that owns NodeDevices
    #[serde(default = "default_driver_name")]
    pub driver_name: String,
}

fn default_disk_scan_interval() -> u64 {
    300
}

fn default_node_sweep_interval() -> u64 {
    60
}

fn default_orphan_sweep_interval() -> u64 {
    600
}

fn default_scheduler_strategy() -> String {
    SchedulerStrategy::Spreadout.to_string()
}

fn default_min_jitter_ms() -> u64 {
    1_000
}

fn default_max_jitter_ms() -> u64 {
    30_000
}

fn default_driver_name() -> String {
    "local.csi.storage.io".to_string()
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_selector: Vec::new(),
            disk_scan_interval: default_disk_scan_interval(),
            node_sweep_interval: default_node_sweep_interval(),
            orphan_sweep_interval: default_orphan_sweep_interval(),
            scheduler_strategy: default_scheduler_strategy(),
            min_jitter_ms: default_min_jitter_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            driver_name: default_driver_name(),
        }
    }
}

impl DiskConfig {
    /// Parse YAML or JSON text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DiskConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Structural checks; regex validity is checked when selectors are applied
    pub fn validate(&self) -> Result<()> {
        for selector in &self.disk_selector {
            if selector.name.is_empty() {
                return Err(Error::InvalidSelector {
                    selector: format!("{:?}", selector.re),
                    reason: "selector has no name".into(),
                });
            }
            if selector.policy().is_none() {
                return Err(Error::InvalidSelector {
                    selector: selector.name.clone(),
                    reason: format!("unknown policy {:?}", selector.policy),
                });
            }
        }
        if self.min_jitter_ms > self.max_jitter_ms {
            return Err(Error::Configuration(format!(
                "minJitterMs {} exceeds maxJitterMs {}",
                self.min_jitter_ms, self.max_jitter_ms
            )));
        }
        Ok(())
    }

    /// Selectors that apply to a node with these labels
    pub fn selectors_for(&self, labels: &BTreeMap<String, String>) -> Vec<DiskSelector> {
        self.disk_selector
            .iter()
            .filter(|s| s.applies_to(labels))
            .map(|s| DiskSelector {
                node_label: None,
                ..s.clone()
            })
            .collect()
    }

    pub fn jitter(&self) -> JitterConfig {
        JitterConfig::new(
            Duration::from_millis(self.min_jitter_ms),
            Duration::from_millis(self.max_jitter_ms),
        )
    }
}

// =============================================================================
// Shared Handle
// =============================================================================

/// Shared, reloadable configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<DiskConfig>>,
}

impl ConfigHandle {
    pub fn new(config: DiskConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> DiskConfig {
        self.inner.read().clone()
    }

    /// Replace the configuration; returns true when it changed
    pub fn replace(&self, config: DiskConfig) -> bool {
        let mut current = self.inner.write();
        if *current == config {
            return false;
        }
        *current = config;
        true
    }

    /// Scheduler strategy, validated now rather than at startup
    pub fn scheduler_strategy(&self) -> Result<SchedulerStrategy> {
        self.inner.read().scheduler_strategy.parse()
    }

    pub fn selectors_for(&self, labels: &BTreeMap<String, String>) -> Vec<DiskSelector> {
        self.inner.read().selectors_for(labels)
    }

    pub fn jitter(&self) -> JitterConfig {
        self.inner.read().jitter()
    }

    pub fn driver_name(&self) -> String {
        self.inner.read().driver_name.clone()
    }
}

// =============================================================================
// File Watcher
// =============================================================================

/// Detects modifications of the config file by polling its mtime
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    handle: ConfigHandle,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, handle: ConfigHandle) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            handle,
            last_modified,
        }
    }

    /// Reload when the file changed on disk. Returns true when the effective
    /// configuration changed. A file that fails to parse keeps the old config.
    pub fn poll(&mut self) -> Result<bool> {
        let modified = modified_time(&self.path);
        if modified == self.last_modified {
            return Ok(false);
        }
        self.last_modified = modified;
        debug!("Config file {} modified", self.path.display());

        let config = match DiskConfig::load(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Ignoring invalid config {}: {}", self.path.display(), e);
                return Err(e);
            }
        };

        let changed = self.handle.replace(config);
        if changed {
            info!("Configuration reloaded from {}", self.path.display());
        }
        Ok(changed)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
