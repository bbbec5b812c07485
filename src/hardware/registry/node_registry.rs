//! Sharded Node Registry
//!
//! An in-memory implementation of the cluster state port. Nodes and
//! NodeDevice documents are spread over shards keyed by name so that
//! per-node reconcilers and scheduler reads rarely contend. Document writes
//! follow API server semantics: every write bumps `resourceVersion`, a write
//! carrying a stale version fails with a conflict, and a document being
//! deleted disappears once its last finalizer is removed.

use crate::crd::NodeDevice;
use crate::domain::ports::{ClusterState, DeclaredVolume, NodeInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the registry
pub const REGISTRY_SHARD_COUNT: usize = 64;

const NODE_DEVICE_KIND: &str = "NodeDevice";

/// Shard a node or document name lives in
#[inline]
pub fn shard_index(name: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
}

fn version_of(doc: &NodeDevice) -> Option<u64> {
    doc.metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
}

// =============================================================================
// Registry Shard
// =============================================================================

/// A single shard of the registry
#[derive(Default)]
struct RegistryShard {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    documents: RwLock<HashMap<String, NodeDevice>>,
}

impl std::fmt::Debug for RegistryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryShard")
            .field("nodes", &self.nodes.read().len())
            .field("documents", &self.documents.read().len())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Write counters across all shards
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub status_updates: AtomicU64,
    pub conflicts: AtomicU64,
    pub removals: AtomicU64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub conflicts: u64,
    pub removals: u64,
}

impl RegistryStatsSnapshot {
    /// Writes of any kind
    pub fn writes(&self) -> u64 {
        self.creates + self.updates + self.status_updates
    }
}

// =============================================================================
// Node Registry
// =============================================================================

/// Sharded in-memory cluster view
pub struct NodeRegistry {
    shards: Box<[RegistryShard]>,
    volumes: RwLock<HashMap<String, Vec<DeclaredVolume>>>,
    driver_owner: RwLock<Option<OwnerReference>>,
    next_version: AtomicU64,
    stats: RegistryStats,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self {
            shards: (0..REGISTRY_SHARD_COUNT)
                .map(|_| RegistryShard::default())
                .collect(),
            volumes: RwLock::new(HashMap::new()),
            driver_owner: RwLock::new(None),
            next_version: AtomicU64::new(1),
            stats: RegistryStats::default(),
        }
    }
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn shard(&self, name: &str) -> &RegistryShard {
        &self.shards[shard_index(name)]
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn conflict(&self, name: &str) -> Error {
        self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
        Error::Conflict {
            kind: NODE_DEVICE_KIND.to_string(),
            name: name.to_string(),
        }
    }

    fn not_found(name: &str) -> Error {
        Error::ResourceNotFound {
            kind: NODE_DEVICE_KIND.to_string(),
            name: name.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    /// Add or replace a node
    pub fn upsert_node(&self, node: NodeInfo) {
        let name = node.name.clone();
        self.shard(&name).nodes.write().insert(name, node);
    }

    /// Remove a node; returns it if it existed
    pub fn remove_node(&self, name: &str) -> Option<NodeInfo> {
        self.shard(name).nodes.write().remove(name)
    }

    pub fn node(&self, name: &str) -> Option<NodeInfo> {
        self.shard(name).nodes.read().get(name).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .shards
            .iter()
            .flat_map(|s| s.nodes.read().values().cloned().collect::<Vec<_>>())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    pub fn document(&self, name: &str) -> Option<NodeDevice> {
        self.shard(name).documents.read().get(name).cloned()
    }

    pub fn documents(&self) -> Vec<NodeDevice> {
        let mut docs: Vec<NodeDevice> = self
            .shards
            .iter()
            .flat_map(|s| s.documents.read().values().cloned().collect::<Vec<_>>())
            .collect();
        docs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        docs
    }

    /// Store a new document
    pub fn create_document(&self, mut doc: NodeDevice) -> Result<NodeDevice> {
        let name = doc.metadata.name.clone().unwrap_or_default();
        if name.is_empty() {
            return Err(Error::Internal("NodeDevice without a name".into()));
        }

        let shard = self.shard(&name);
        let mut documents = shard.documents.write();
        if documents.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: NODE_DEVICE_KIND.to_string(),
                name,
            });
        }

        let version = self.bump_version();
        doc.metadata.resource_version = Some(version.to_string());
        doc.metadata.creation_timestamp = Some(Time(Utc::now()));
        doc.metadata.deletion_timestamp = None;
        documents.insert(name.clone(), doc.clone());
        drop(documents);

        self.stats.creates.fetch_add(1, Ordering::Relaxed);
        debug!("Created NodeDevice {} at version {}", name, version);
        Ok(doc)
    }

    /// Apply a write under the version check. `apply` merges the incoming
    /// document into the stored one.
    fn write_document(
        &self,
        doc: &NodeDevice,
        apply: impl FnOnce(&mut NodeDevice, &NodeDevice),
    ) -> Result<(NodeDevice, bool)> {
        let name = doc.metadata.name.clone().unwrap_or_default();
        let shard = self.shard(&name);
        let mut documents = shard.documents.write();
        let stored = documents.get_mut(&name).ok_or_else(|| Self::not_found(&name))?;

        if let Some(expected) = version_of(doc) {
            if version_of(stored) != Some(expected) {
                drop(documents);
                return Err(self.conflict(&name));
            }
        }

        apply(stored, doc);
        stored.metadata.resource_version = Some(self.bump_version().to_string());

        let finalized = stored.is_deleting()
            && stored
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        let result = stored.clone();
        if finalized {
            documents.remove(&name);
        }
        Ok((result, finalized))
    }

    /// Replace metadata and spec, keeping the stored status
    pub fn replace_document(&self, doc: &NodeDevice) -> Result<NodeDevice> {
        let (result, finalized) = self.write_document(doc, |stored, incoming| {
            let deletion = stored.metadata.deletion_timestamp.clone();
            let created = stored.metadata.creation_timestamp.clone();
            stored.metadata = incoming.metadata.clone();
            stored.metadata.deletion_timestamp = deletion;
            stored.metadata.creation_timestamp = created;
            stored.spec = incoming.spec.clone();
        })?;

        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        if finalized {
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
            debug!(
                "NodeDevice {} finalized and removed",
                result.metadata.name.as_deref().unwrap_or_default()
            );
        }
        Ok(result)
    }

    /// Replace the status, keeping stored metadata and spec
    pub fn replace_status(&self, doc: &NodeDevice) -> Result<NodeDevice> {
        let (result, _) = self.write_document(doc, |stored, incoming| {
            stored.status = incoming.status.clone();
        })?;

        self.stats.status_updates.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Request deletion: documents with finalizers are marked, others removed
    pub fn request_deletion(&self, name: &str) -> Result<()> {
        let shard = self.shard(name);
        let mut documents = shard.documents.write();
        let stored = documents.get_mut(name).ok_or_else(|| Self::not_found(name))?;

        let has_finalizers = stored
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);

        if has_finalizers {
            if stored.metadata.deletion_timestamp.is_none() {
                stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
                stored.metadata.resource_version = Some(self.bump_version().to_string());
            }
        } else {
            documents.remove(name);
            drop(documents);
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
            debug!("NodeDevice {} removed", name);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Declared volumes and driver
    // -------------------------------------------------------------------------

    /// Set the volumes declared on a node
    pub fn set_declared_volumes(&self, node_name: &str, volumes: Vec<DeclaredVolume>) {
        self.volumes.write().insert(node_name.to_string(), volumes);
    }

    pub fn set_driver_owner(&self, owner: Option<OwnerReference>) {
        *self.driver_owner.write() = owner;
    }

    /// Get global statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }
}

// =============================================================================
// Cluster State Port
// =============================================================================

#[async_trait]
impl ClusterState for NodeRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes())
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        self.node(name).ok_or_else(|| Error::NodeNotFound {
            node_id: name.to_string(),
        })
    }

    async fn list_node_devices(&self) -> Result<Vec<NodeDevice>> {
        Ok(self.documents())
    }

    async fn get_node_device(&self, name: &str) -> Result<Option<NodeDevice>> {
        Ok(self.document(name))
    }

    async fn create_node_device(&self, device: NodeDevice) -> Result<NodeDevice> {
        self.create_document(device)
    }

    async fn update_node_device(&self, device: &NodeDevice) -> Result<NodeDevice> {
        self.replace_document(device)
    }

    async fn update_node_device_status(&self, device: &NodeDevice) -> Result<NodeDevice> {
        self.replace_status(device)
    }

    async fn list_declared_volumes(&self, node_name: &str) -> Result<Vec<DeclaredVolume>> {
        Ok(self.volumes.read().get(node_name).cloned().unwrap_or_default())
    }

    async fn driver_owner(&self, _driver_name: &str) -> Result<Option<OwnerReference>> {
        Ok(self.driver_owner.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NodeDeviceSpec, NodeDeviceStatus, NODE_DEVICE_FINALIZER};
    use assert_matches::assert_matches;

    fn document(name: &str) -> NodeDevice {
        NodeDevice::new(
            name,
            NodeDeviceSpec {
                node_name: name.into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_shard_index_is_stable() {
        assert_eq!(shard_index("node-001"), shard_index("node-001"));
        assert!(shard_index("node-002") < REGISTRY_SHARD_COUNT);
    }

    #[test]
    fn test_node_upsert_and_remove() {
        let registry = NodeRegistry::new();
        registry.upsert_node(NodeInfo {
            name: "node-001".into(),
            ..Default::default()
        });
        assert!(registry.node("node-001").is_some());

        assert!(registry.remove_node("node-001").is_some());
        assert!(registry.remove_node("node-001").is_none());
        assert!(registry.nodes().is_empty());
    }

    #[test]
    fn test_create_sets_version_and_rejects_duplicates() {
        let registry = NodeRegistry::new();
        let created = registry.create_document(document("node-001")).unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert_matches!(
            registry.create_document(document("node-001")),
            Err(Error::ResourceExists { .. })
        );
    }

    #[test]
    fn test_stale_write_conflicts() {
        let registry = NodeRegistry::new();
        let first = registry.create_document(document("node-001")).unwrap();

        let mut updated = first.clone();
        updated.status = Some(NodeDeviceStatus::default());
        let second = registry.replace_status(&updated).unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);

        assert_matches!(registry.replace_status(&updated), Err(Error::Conflict { .. }));
        assert_eq!(registry.stats().conflicts, 1);
        assert_eq!(registry.stats().writes(), 2);
    }

    #[test]
    fn test_status_write_keeps_spec() {
        let registry = NodeRegistry::new();
        let created = registry.create_document(document("node-001")).unwrap();

        let mut incoming = created.clone();
        incoming.spec.node_name = "changed".into();
        incoming.status = Some(NodeDeviceStatus::default());
        let stored = registry.replace_status(&incoming).unwrap();
        assert_eq!(stored.spec.node_name, "node-001");
        assert!(stored.status.is_some());
    }

    #[test]
    fn test_finalized_document_is_removed() {
        let registry = NodeRegistry::new();
        let mut doc = document("node-001");
        doc.metadata.finalizers = Some(vec![NODE_DEVICE_FINALIZER.to_string()]);
        registry.create_document(doc).unwrap();

        registry.request_deletion("node-001").unwrap();
        let mut pending = registry.document("node-001").unwrap();
        assert!(pending.is_deleting());

        pending.metadata.finalizers = Some(vec![]);
        registry.replace_document(&pending).unwrap();
        assert!(registry.document("node-001").is_none());
        assert_eq!(registry.stats().removals, 1);
    }

    #[tokio::test]
    async fn test_cluster_state_lookups() {
        let registry = NodeRegistry::new();
        assert_matches!(
            registry.get_node("missing").await,
            Err(Error::NodeNotFound { .. })
        );
        assert!(registry.get_node_device("missing").await.unwrap().is_none());
        assert!(registry.list_declared_volumes("node-001").await.unwrap().is_empty());

        registry.set_declared_volumes(
            "node-001",
            vec![DeclaredVolume {
                name: "pvc-1".into(),
                node_name: "node-001".into(),
                manager_type: None,
            }],
        );
        assert_eq!(registry.list_declared_volumes("node-001").await.unwrap().len(), 1);
    }
}
