//! Node Inventory Reconciler
//!
//! Keeps each node's NodeDevice document in step with the disks actually
//! present. A pass resolves the disk selectors that apply to the node,
//! matches every local device against them, measures the matched raw disks
//! and volume groups, and writes the document back only when something
//! changed. A slower sweep makes sure every cluster node has a document and
//! that its state follows node readiness.

use super::notify::{Trigger, VolumeEvent};
use crate::config::ConfigHandle;
use crate::crd::{
    ActivityState, DeviceManage, DiskSelector, NodeDevice, NodeDeviceSpec, NodeDeviceStatus,
    RawDevice, SelectorPolicy, VgGroup, NODE_DEVICE_FINALIZER, RAW_DEVICE_KEY_PREFIX,
    VG_KEY_PREFIX,
};
use crate::domain::ports::{ClusterStateRef, NodeInfo};
use crate::error::{Error, Result};
use crate::hardware::discovery::DeviceManager;
use crate::metrics;
use dashmap::DashMap;
use futures::future::join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

// =============================================================================
// Document Lifecycle
// =============================================================================

/// Where a NodeDevice document is in its finalizer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLifecycle {
    /// Live document
    Active,
    /// Deletion requested, our finalizer still attached
    PendingDeletion,
    /// Finalizer removed, the API server completes the deletion
    Finalizing,
    /// Deletion requested and nothing left for us to do
    Removed,
}

impl DocumentLifecycle {
    /// Current state of a stored document
    pub fn of(doc: &NodeDevice) -> Self {
        match (doc.is_deleting(), doc.has_finalizer()) {
            (false, _) => DocumentLifecycle::Active,
            (true, true) => DocumentLifecycle::PendingDeletion,
            (true, false) => DocumentLifecycle::Removed,
        }
    }
}

impl std::fmt::Display for DocumentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentLifecycle::Active => write!(f, "Active"),
            DocumentLifecycle::PendingDeletion => write!(f, "PendingDeletion"),
            DocumentLifecycle::Finalizing => write!(f, "Finalizing"),
            DocumentLifecycle::Removed => write!(f, "Removed"),
        }
    }
}

fn remove_finalizer(doc: &mut NodeDevice) {
    if let Some(finalizers) = doc.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != NODE_DEVICE_FINALIZER);
    }
}

fn add_finalizer(doc: &mut NodeDevice) {
    let finalizers = doc.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == NODE_DEVICE_FINALIZER) {
        finalizers.push(NODE_DEVICE_FINALIZER.to_string());
    }
}

// =============================================================================
// Results
// =============================================================================

/// What one inventory pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No document for this node yet
    Missing,
    /// Document belongs to another node
    Skipped,
    /// Finalizer handling; inventory was not touched
    Lifecycle(DocumentLifecycle),
    /// Inventory computed; flags tell which halves were written
    Synced { spec_written: bool, status_written: bool },
}

/// What one presence sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub created: usize,
    pub state_changes: usize,
    pub failures: usize,
}

// =============================================================================
// Selector Cache
// =============================================================================

/// Compiled selector patterns keyed by the joined pattern string
#[derive(Debug, Default)]
pub struct SelectorCache {
    compiled: DashMap<String, Regex>,
}

impl SelectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regex for a selector's patterns, compiled at most once
    pub fn regex_for(&self, selector: &DiskSelector) -> Result<Regex> {
        let pattern = selector.pattern();
        if let Some(re) = self.compiled.get(&pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(&pattern).map_err(|e| Error::InvalidSelector {
            selector: selector.name.clone(),
            reason: e.to_string(),
        })?;
        self.compiled.insert(pattern, re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

struct CompiledSelector {
    selector: DiskSelector,
    policy: SelectorPolicy,
    re: Regex,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Maintains the NodeDevice document of one node
pub struct NodeDeviceReconciler {
    node_name: String,
    cluster: ClusterStateRef,
    devices: DeviceManager,
    config: ConfigHandle,
    selectors: SelectorCache,
}

impl NodeDeviceReconciler {
    pub fn new(
        node_name: impl Into<String>,
        cluster: ClusterStateRef,
        devices: DeviceManager,
        config: ConfigHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.into(),
            cluster,
            devices,
            config,
            selectors: SelectorCache::new(),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn compile(&self, selectors: &[DiskSelector]) -> Result<Vec<CompiledSelector>> {
        let mut compiled = Vec::with_capacity(selectors.len());
        for selector in selectors {
            if selector.re.is_empty() {
                warn!("Selector {} has no patterns, skipping", selector.name);
                continue;
            }
            let policy = selector.policy().ok_or_else(|| Error::InvalidSelector {
                selector: selector.name.clone(),
                reason: format!("unknown policy {:?}", selector.policy),
            })?;
            compiled.push(CompiledSelector {
                selector: selector.clone(),
                policy,
                re: self.selectors.regex_for(selector)?,
            });
        }
        Ok(compiled)
    }

    /// Measure one matched raw disk. Query failures leave the device
    /// Inactive and keep it out of the capacity maps.
    async fn measure_raw_device(&self, mut device: RawDevice) -> RawDevice {
        let name = device.name.clone();

        let usage = match self.devices.disks.get_disk_usage(&name).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Usage query for {} failed, marking inactive: {}", name, e);
                device.activity = ActivityState::Inactive;
                return device;
            }
        };
        device.capacity = usage.get("Size").cloned().unwrap_or_default();
        device.available = usage.get("Avail").cloned().unwrap_or_default();

        device.partition = match self.devices.partitions.get_device_partitions(&name).await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!("Partition query for {} failed, marking inactive: {}", name, e);
                device.activity = ActivityState::Inactive;
                return device;
            }
        };

        device.free_space = match self.devices.partitions.get_device_unused_partitions(&name).await {
            Ok((gaps, _)) => gaps,
            Err(e) => {
                debug!("No free space listing for {}: {}", name, e);
                Vec::new()
            }
        };

        device.activity = ActivityState::Active;
        device
    }

    /// Compute the inventory part of the status from local devices
    pub async fn scan(
        &self,
        selectors: &[DiskSelector],
        previous: &DeviceManage,
    ) -> Result<NodeDeviceStatus> {
        let compiled = self.compile(selectors)?;
        let disks = self.devices.disks.list_devices().await?;

        let mut manage = previous.clone();
        let mut capacity = BTreeMap::new();
        let mut available = BTreeMap::new();
        let mut vgs: Option<Vec<VgGroup>> = None;

        for disk in disks {
            for entry in compiled.iter().filter(|c| c.re.is_match(&disk.name)) {
                match entry.policy {
                    SelectorPolicy::Raw => {
                        let device = self.measure_raw_device(disk.clone()).await;
                        if !device.is_inactive() {
                            let key = format!("{}{}", RAW_DEVICE_KEY_PREFIX, device.name);
                            capacity.insert(key.clone(), device.capacity_bytes().to_string());
                            available.insert(key, device.available_bytes().to_string());
                        }
                        manage.upsert_raw_device(device);
                    }
                    SelectorPolicy::Lvm => {
                        if vgs.is_none() {
                            vgs = Some(self.devices.lvm.current_vgs().await.unwrap_or_else(|e| {
                                warn!("Listing volume groups failed: {}", e);
                                Vec::new()
                            }));
                        }
                        let groups = vgs.as_deref().unwrap_or_default();
                        for vg in groups.iter().filter(|vg| backs(vg, &entry.selector, &disk.name)) {
                            let key = format!("{}{}", VG_KEY_PREFIX, vg.vg_name);
                            capacity.insert(key.clone(), vg.vg_size.to_string());
                            available.insert(key, vg.vg_free.to_string());
                            manage.upsert_vg_group(vg.clone());
                        }
                    }
                }
            }
        }

        Ok(NodeDeviceStatus {
            node_state: ActivityState::Active,
            capacity,
            available,
            device_manage: manage,
        })
    }

    /// One inventory pass for this node
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let node = self.cluster.get_node(&self.node_name).await?;
        let selectors = self.config.selectors_for(&node.labels);

        let Some(mut doc) = self.cluster.get_node_device(&self.node_name).await? else {
            debug!("No NodeDevice for {} yet", self.node_name);
            return Ok(ReconcileOutcome::Missing);
        };
        if doc.spec.node_name != self.node_name {
            debug!("NodeDevice {} belongs to {}", self.node_name, doc.spec.node_name);
            return Ok(ReconcileOutcome::Skipped);
        }

        match DocumentLifecycle::of(&doc) {
            DocumentLifecycle::PendingDeletion => {
                info!("Removing finalizer from NodeDevice {}", self.node_name);
                remove_finalizer(&mut doc);
                self.cluster.update_node_device(&doc).await?;
                return Ok(ReconcileOutcome::Lifecycle(DocumentLifecycle::Finalizing));
            }
            DocumentLifecycle::Removed | DocumentLifecycle::Finalizing => {
                return Ok(ReconcileOutcome::Lifecycle(DocumentLifecycle::Removed));
            }
            DocumentLifecycle::Active => {}
        }

        let previous = doc.status.clone().unwrap_or_default();
        let status = self.scan(&selectors, &previous.device_manage).await?;

        let mut desired = doc.clone();
        add_finalizer(&mut desired);
        desired.metadata.labels = Some(node.labels.clone());
        desired.metadata.annotations = Some(node.annotations.clone());
        desired.spec.disk_selector = selectors;

        let spec_written = if metadata_differs(&doc, &desired) {
            debug!("Writing NodeDevice {} metadata and spec", self.node_name);
            doc = self.cluster.update_node_device(&desired).await?;
            true
        } else {
            false
        };

        let status_written = if doc.status.as_ref() != Some(&status) {
            debug!("Writing NodeDevice {} status", self.node_name);
            doc.status = Some(status);
            self.cluster.update_node_device_status(&doc).await?;
            true
        } else {
            false
        };

        if spec_written || status_written {
            info!(
                "NodeDevice {} updated (spec: {}, status: {})",
                self.node_name, spec_written, status_written
            );
        }
        Ok(ReconcileOutcome::Synced {
            spec_written,
            status_written,
        })
    }

    /// Make sure every node has a document and its state follows the node
    pub async fn ensure_node_devices(&self) -> Result<SweepSummary> {
        let nodes = self.cluster.list_nodes().await?;
        let driver = self.config.driver_name();
        let owner = match self.cluster.driver_owner(&driver).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!("Cannot resolve driver {}: {}", driver, e);
                None
            }
        };

        let results = join_all(
            nodes
                .iter()
                .map(|node| self.ensure_node_device(node, owner.clone())),
        )
        .await;

        let mut summary = SweepSummary::default();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok((created, changed)) => {
                    summary.created += created as usize;
                    summary.state_changes += changed as usize;
                }
                Err(e) => {
                    error!(node = %node.name, error = %e, "NodeDevice sweep failed");
                    summary.failures += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn ensure_node_device(
        &self,
        node: &NodeInfo,
        owner: Option<OwnerReference>,
    ) -> Result<(bool, bool)> {
        let state = node.activity();
        let (mut doc, created) = match self.cluster.get_node_device(&node.name).await? {
            Some(doc) => (doc, false),
            None => {
                info!("Creating NodeDevice for node {}", node.name);
                let doc = NodeDevice {
                    metadata: ObjectMeta {
                        name: Some(node.name.clone()),
                        labels: Some(node.labels.clone()),
                        annotations: Some(node.annotations.clone()),
                        owner_references: owner.map(|o| vec![o]),
                        finalizers: Some(vec![NODE_DEVICE_FINALIZER.to_string()]),
                        ..Default::default()
                    },
                    spec: NodeDeviceSpec {
                        node_name: node.name.clone(),
                        disk_selector: self.config.selectors_for(&node.labels),
                    },
                    status: None,
                };
                (self.cluster.create_node_device(doc).await?, true)
            }
        };

        if doc.is_deleting() || doc.node_state() == state {
            return Ok((created, false));
        }

        info!("NodeDevice {} state {} -> {}", node.name, doc.node_state(), state);
        doc.status.get_or_insert_with(NodeDeviceStatus::default).node_state = state;
        self.cluster.update_node_device_status(&doc).await?;
        Ok((created, true))
    }

    /// Run inventory passes and presence sweeps until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<VolumeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let config = self.config.snapshot();
        info!(
            node = %self.node_name,
            scan_interval_secs = config.disk_scan_interval,
            sweep_interval_secs = config.node_sweep_interval,
            "Starting inventory reconciler"
        );

        let mut scan = tokio::time::interval(Duration::from_secs(config.disk_scan_interval.max(1)));
        let mut sweep = tokio::time::interval(Duration::from_secs(config.node_sweep_interval.max(1)));
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let result = self.ensure_node_devices().await;
                    metrics::record_pass("node_sweep", result.is_ok());
                    match result {
                        Ok(summary) => debug!(?summary, "Node sweep finished"),
                        Err(e) => error!(error = %e, "Node sweep failed"),
                    }
                }
                _ = scan.tick() => self.pass().await,
                received = events.recv(), if events_open => match received {
                    Ok(event) if event.trigger != Trigger::Dummy => {
                        debug!("Inventory pass triggered by {}", event.trigger);
                        self.pass().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Missed {} events, running a pass", skipped);
                        self.pass().await;
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = shutdown.recv() => {
                    info!("Inventory reconciler shutting down");
                    break;
                }
            }
        }
    }

    async fn pass(&self) {
        let result = self.reconcile().await;
        metrics::record_pass("inventory", result.is_ok());
        match result {
            Ok(outcome) => debug!(?outcome, "Inventory pass finished"),
            Err(e) if e.is_transient() => warn!(error = %e, "Inventory pass failed, retrying next tick"),
            Err(e) => error!(error = %e, "Inventory pass failed"),
        }
    }
}

/// A volume group belongs to a selector when one of its physical volumes is
/// named after the selector or is the matched disk
fn backs(vg: &VgGroup, selector: &DiskSelector, disk: &str) -> bool {
    vg.pv_name == selector.name
        || vg
            .pvs
            .iter()
            .any(|pv| pv.pv_name == selector.name || pv.pv_name == disk)
}

fn metadata_differs(current: &NodeDevice, desired: &NodeDevice) -> bool {
    let labels = |d: &NodeDevice| d.metadata.labels.clone().unwrap_or_default();
    let annotations = |d: &NodeDevice| d.metadata.annotations.clone().unwrap_or_default();
    current.has_finalizer() != desired.has_finalizer()
        || labels(current) != labels(desired)
        || annotations(current) != annotations(desired)
        || current.spec != desired.spec
}
