//! Domain Ports - Core trait definitions for the storage operator
//!
//! These traits define the boundaries between the domain logic and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::crd::{ActivityState, NodeDevice, LVM_VOLUME_TYPE, RAW_VOLUME_TYPE};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Command Execution Port
// =============================================================================

/// Port for running the external disk tools (lsblk, parted, lvm, ...)
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `tool` with `args` and return its standard output
    async fn execute(&self, tool: &str, args: &[&str]) -> Result<String>;
}

// =============================================================================
// Cluster Types
// =============================================================================

/// The operator's view of a cluster node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node annotations
    pub annotations: BTreeMap<String, String>,
    /// Allocatable resources, in bytes for device groups
    pub allocatable: BTreeMap<String, u64>,
    /// Capacity resources, in bytes for device groups
    pub capacity: BTreeMap<String, u64>,
    /// Ready condition is True
    pub ready: bool,
    /// Node phase is Terminated
    pub terminated: bool,
    /// Deletion has been requested
    pub deleting: bool,
}

impl NodeInfo {
    /// Activity the node's NodeDevice should report
    pub fn activity(&self) -> ActivityState {
        if self.deleting || self.terminated || !self.ready {
            ActivityState::Inactive
        } else {
            ActivityState::Active
        }
    }
}

/// One acceptable combination of topology labels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub segments: BTreeMap<String, String>,
}

impl Topology {
    pub fn new(segments: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// Labels contain every segment key with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.segments
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

/// Acceptable topologies for a volume, OR-ed together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequirement {
    pub requisite: Vec<Topology>,
}

impl TopologyRequirement {
    /// A node qualifies when any requisite topology matches its labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requisite.is_empty() || self.requisite.iter().any(|t| t.matches(labels))
    }

    /// Values of every referenced topology key on the chosen node
    pub fn segments_for(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut segments = BTreeMap::new();
        for topology in &self.requisite {
            for key in topology.segments.keys() {
                segments.insert(key.clone(), labels.get(key).cloned().unwrap_or_default());
            }
        }
        segments
    }
}

/// Check an optional requirement against node labels
pub fn topology_matches(
    requirement: Option<&TopologyRequirement>,
    labels: &BTreeMap<String, String>,
) -> bool {
    requirement.map(|r| r.matches(labels)).unwrap_or(true)
}

/// A volume the cluster declares on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredVolume {
    /// Volume object name
    pub name: String,
    /// Node hosting the volume
    pub node_name: String,
    /// Backing kind from the manager-type annotation
    pub manager_type: Option<String>,
}

impl DeclaredVolume {
    pub fn is_raw(&self) -> bool {
        self.manager_type.as_deref() == Some(RAW_VOLUME_TYPE)
    }

    pub fn is_lvm(&self) -> bool {
        self.manager_type.as_deref() == Some(LVM_VOLUME_TYPE)
    }
}

// =============================================================================
// Cluster State Port
// =============================================================================

/// Port for reading nodes and declared volumes and for persisting NodeDevices.
///
/// Updates are compare-and-update on `metadata.resourceVersion`: a stale
/// document fails with `Error::Conflict`.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<NodeInfo>;

    /// List all NodeDevices
    async fn list_node_devices(&self) -> Result<Vec<NodeDevice>>;

    /// Get a NodeDevice by name
    async fn get_node_device(&self, name: &str) -> Result<Option<NodeDevice>>;

    /// Create a NodeDevice
    async fn create_node_device(&self, device: NodeDevice) -> Result<NodeDevice>;

    /// Replace metadata and spec of a NodeDevice
    async fn update_node_device(&self, device: &NodeDevice) -> Result<NodeDevice>;

    /// Replace the status of a NodeDevice
    async fn update_node_device_status(&self, device: &NodeDevice) -> Result<NodeDevice>;

    /// List the volumes declared on a node
    async fn list_declared_volumes(&self, node_name: &str) -> Result<Vec<DeclaredVolume>>;

    /// Owner reference to the driver object NodeDevices belong to
    async fn driver_owner(&self, driver_name: &str) -> Result<Option<OwnerReference>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandExecutorRef = Arc<dyn CommandExecutor>;
pub type ClusterStateRef = Arc<dyn ClusterState>;

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_topology_requirement_is_or_of_segments() {
        let req = TopologyRequirement {
            requisite: vec![
                Topology::new([("zone".to_string(), "a".to_string())]),
                Topology::new([("zone".to_string(), "b".to_string())]),
            ],
        };
        assert!(req.matches(&labels(&[("zone", "b")])));
        assert!(!req.matches(&labels(&[("zone", "c")])));
        assert!(!req.matches(&labels(&[])));
        assert!(TopologyRequirement::default().matches(&labels(&[])));
    }

    #[test]
    fn test_segments_for_chosen_node() {
        let req = TopologyRequirement {
            requisite: vec![Topology::new([
                ("zone".to_string(), "a".to_string()),
                ("rack".to_string(), "r1".to_string()),
            ])],
        };
        let segments = req.segments_for(&labels(&[("zone", "a"), ("host", "n1")]));
        assert_eq!(segments.get("zone").map(String::as_str), Some("a"));
        assert_eq!(segments.get("rack").map(String::as_str), Some(""));
        assert!(!segments.contains_key("host"));
    }

    #[test]
    fn test_node_activity() {
        let mut node = NodeInfo {
            name: "n1".into(),
            ready: true,
            ..Default::default()
        };
        assert_eq!(node.activity(), ActivityState::Active);
        node.deleting = true;
        assert_eq!(node.activity(), ActivityState::Inactive);
        node.deleting = false;
        node.ready = false;
        assert_eq!(node.activity(), ActivityState::Inactive);
    }
}
