//! Volume Placement Scheduler
//!
//! Chooses the node (and device group or raw device) a new volume lands on.
//! Every call re-reads the cluster; nothing is cached between calls. The
//! scheduler strategy comes from the live configuration so it can be changed
//! without a restart.

use super::placement::{placement_capacity, PlacementCandidate, PlacementEngine};
use super::policy::{JitterConfig, SchedulerStrategy};
use crate::config::ConfigHandle;
use crate::crd::{ActivityState, DEVICE_CAPACITY_KEY_PREFIX, RAW_DEVICE_KEY_PREFIX};
use crate::domain::ports::{
    topology_matches, ClusterStateRef, NodeInfo, Topology, TopologyRequirement,
};
use crate::error::{Error, Result};
use crate::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

// =============================================================================
// Results
// =============================================================================

/// Where a volume was placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumePlacement {
    /// Chosen node
    pub node_name: String,
    /// Device group (for raw placements, the device name)
    pub device_group: String,
    /// Topology segments of the chosen node
    pub segments: BTreeMap<String, String>,
}

/// Where a backend/cache volume pair was placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiVolumePlacement {
    pub node_name: String,
    pub backend_group: String,
    pub cache_group: String,
    pub segments: BTreeMap<String, String>,
}

// =============================================================================
// Device Group Keys
// =============================================================================

/// Device group named by an allocatable key, if the key is a device-capacity key
pub fn device_group_of(key: &str) -> Option<&str> {
    key.strip_prefix(DEVICE_CAPACITY_KEY_PREFIX)
}

/// Key equals the group, or the prefix followed by the group
fn key_matches_group(key: &str, group: &str) -> bool {
    key == group
        || key
            .strip_prefix(DEVICE_CAPACITY_KEY_PREFIX)
            .map(|g| g == group)
            .unwrap_or(false)
}

fn segments(topology: Option<&TopologyRequirement>, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    topology
        .map(|t| t.segments_for(labels))
        .unwrap_or_default()
}

// =============================================================================
// Scheduler
// =============================================================================

/// Stateless placement over the cluster view
pub struct VolumeScheduler {
    cluster: ClusterStateRef,
    config: ConfigHandle,
    jitter: Option<JitterConfig>,
}

impl VolumeScheduler {
    pub fn new(cluster: ClusterStateRef, config: ConfigHandle) -> Self {
        Self {
            cluster,
            config,
            jitter: None,
        }
    }

    /// Use a fixed jitter instead of the configured one
    pub fn with_jitter(mut self, jitter: JitterConfig) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Strategy check and jitter sleep that precede each node placement
    async fn prepare(&self) -> Result<SchedulerStrategy> {
        let strategy = self.config.scheduler_strategy()?;
        self.jitter.unwrap_or_else(|| self.config.jitter()).wait().await;
        Ok(strategy)
    }

    fn finish<T>(operation: &str, result: Result<T>) -> Result<T> {
        metrics::record_placement(operation, result.is_ok());
        result
    }

    async fn eligible_nodes(&self, topology: Option<&TopologyRequirement>) -> Result<Vec<NodeInfo>> {
        Ok(self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| topology_matches(topology, &n.labels))
            .collect())
    }

    /// Pick a node and device group for an LVM volume of `request` bytes.
    ///
    /// An empty `device_group` accepts any device group.
    pub async fn select_volume_node(
        &self,
        request: u64,
        device_group: &str,
        topology: Option<&TopologyRequirement>,
    ) -> Result<VolumePlacement> {
        let result = self.select_volume_node_inner(request, device_group, topology).await;
        Self::finish("select_volume_node", result)
    }

    async fn select_volume_node_inner(
        &self,
        request: u64,
        device_group: &str,
        topology: Option<&TopologyRequirement>,
    ) -> Result<VolumePlacement> {
        let strategy = self.prepare().await?;
        let nodes = self.eligible_nodes(topology).await?;

        let mut candidates = Vec::new();
        for node in &nodes {
            for (key, value) in &node.allocatable {
                let Some(group) = device_group_of(key) else {
                    continue;
                };
                if !device_group.is_empty() && !key_matches_group(key, device_group) {
                    continue;
                }
                if *value >= request {
                    candidates.push(PlacementCandidate::new(&node.name, group, *value));
                }
            }
        }

        let chosen = PlacementEngine::choose(candidates, strategy).ok_or_else(|| {
            Error::NoQualifyingNode {
                reason: format!(
                    "no node has {} bytes allocatable in device group {:?}",
                    request, device_group
                ),
            }
        })?;

        let labels = nodes
            .iter()
            .find(|n| n.name == chosen.node_name)
            .map(|n| n.labels.clone())
            .unwrap_or_default();

        info!(
            "Placed {} bytes on node {} device group {} ({})",
            request, chosen.node_name, chosen.device_group, strategy
        );
        Ok(VolumePlacement {
            node_name: chosen.node_name,
            device_group: chosen.device_group,
            segments: segments(topology, &labels),
        })
    }

    /// Pick a node and raw device (whole disk or partition space) for a raw
    /// volume of `request` bytes.
    pub async fn select_node_device(
        &self,
        request: u64,
        device_group: &str,
        topology: Option<&TopologyRequirement>,
        exclusive: bool,
    ) -> Result<VolumePlacement> {
        let result = self
            .select_node_device_inner(request, device_group, topology, exclusive)
            .await;
        Self::finish("select_node_device", result)
    }

    async fn select_node_device_inner(
        &self,
        request: u64,
        device_group: &str,
        topology: Option<&TopologyRequirement>,
        exclusive: bool,
    ) -> Result<VolumePlacement> {
        let strategy = self.prepare().await?;
        let documents = self.cluster.list_node_devices().await?;

        let mut candidates = Vec::new();
        for doc in &documents {
            if doc.node_state() != ActivityState::Active {
                continue;
            }
            if !topology_matches(topology, &doc.labels()) {
                continue;
            }
            let Some(status) = doc.status.as_ref() else {
                continue;
            };

            let has_room = status.available.iter().any(|(key, value)| {
                key.starts_with(RAW_DEVICE_KEY_PREFIX)
                    && (device_group.is_empty() || key.contains(device_group))
                    && value.parse::<u64>().map(|v| v >= request).unwrap_or(false)
            });
            if !has_room {
                continue;
            }

            let devices: Vec<_> = status
                .device_manage
                .raw_devices
                .iter()
                .filter(|d| {
                    device_group.is_empty()
                        || format!("{}{}", RAW_DEVICE_KEY_PREFIX, d.name).contains(device_group)
                })
                .cloned()
                .collect();

            match PlacementEngine::select_partition_or_raw(&devices, request, exclusive, strategy) {
                Ok(device) => candidates.push(PlacementCandidate::new(
                    doc.node_name(),
                    &device.name,
                    placement_capacity(&device),
                )),
                Err(e) if e.is_not_found() => {
                    debug!("Node {} has no usable device: {}", doc.node_name(), e);
                }
                Err(e) => return Err(e),
            }
        }

        let chosen = PlacementEngine::choose(candidates, strategy).ok_or_else(|| {
            Error::NoQualifyingDevice {
                reason: format!(
                    "no active node has a {} device with {} bytes free",
                    if exclusive { "exclusive" } else { "raw" },
                    request
                ),
            }
        })?;

        let node = self.cluster.get_node(&chosen.node_name).await?;
        info!(
            "Placed {} bytes on node {} device {} (exclusive: {}, {})",
            request, chosen.node_name, chosen.device_group, exclusive, strategy
        );
        Ok(VolumePlacement {
            node_name: chosen.node_name,
            device_group: chosen.device_group,
            segments: segments(topology, &node.labels),
        })
    }

    /// Smallest device group on `node_name` that fits `request`, whatever the
    /// strategy. The node is already chosen, so there is no jitter wait.
    pub async fn select_device_group(&self, request: u64, node_name: &str) -> Result<String> {
        let result = self.select_device_group_inner(request, node_name).await;
        Self::finish("select_device_group", result)
    }

    async fn select_device_group_inner(&self, request: u64, node_name: &str) -> Result<String> {
        let node = self.cluster.get_node(node_name).await?;

        let candidates = node
            .allocatable
            .iter()
            .filter_map(|(key, value)| device_group_of(key).map(|g| (g, *value)))
            .filter(|(_, value)| *value >= request)
            .map(|(group, value)| PlacementCandidate::new(node_name, group, value))
            .collect();

        PlacementEngine::choose(candidates, SchedulerStrategy::Binpack)
            .map(|c| c.device_group)
            .ok_or_else(|| Error::NoQualifyingDevice {
                reason: format!("node {} has no device group with {} bytes", node_name, request),
            })
    }

    /// Pick a node holding both a backend and a cache device group large
    /// enough, ranked by backend capacity
    pub async fn select_multi_volume_node(
        &self,
        backend_group: &str,
        cache_group: &str,
        backend_size: u64,
        cache_size: u64,
        topology: Option<&TopologyRequirement>,
    ) -> Result<MultiVolumePlacement> {
        let result = self
            .select_multi_volume_node_inner(backend_group, cache_group, backend_size, cache_size, topology)
            .await;
        Self::finish("select_multi_volume_node", result)
    }

    async fn select_multi_volume_node_inner(
        &self,
        backend_group: &str,
        cache_group: &str,
        backend_size: u64,
        cache_size: u64,
        topology: Option<&TopologyRequirement>,
    ) -> Result<MultiVolumePlacement> {
        let strategy = self.prepare().await?;
        let nodes = self.eligible_nodes(topology).await?;

        let mut candidates = Vec::new();
        let mut cache_choice = BTreeMap::new();
        for node in &nodes {
            let groups: Vec<(&str, u64)> = node
                .allocatable
                .iter()
                .filter_map(|(key, value)| device_group_of(key).map(|g| (g, *value)))
                .collect();

            let backend = groups
                .iter()
                .filter(|(g, v)| g.contains(backend_group) && *v >= backend_size)
                .max_by_key(|(g, v)| (*v, std::cmp::Reverse(*g)));
            let Some(&(backend_name, backend_cap)) = backend else {
                continue;
            };

            // Sharing one group needs room for both volumes
            let cache = groups
                .iter()
                .filter(|(g, v)| {
                    g.contains(cache_group)
                        && if *g == backend_name {
                            *v >= backend_size.saturating_add(cache_size)
                        } else {
                            *v >= cache_size
                        }
                })
                .max_by_key(|(g, v)| (*v, std::cmp::Reverse(*g)));
            let Some(&(cache_name, _)) = cache else {
                continue;
            };

            candidates.push(PlacementCandidate::new(&node.name, backend_name, backend_cap));
            cache_choice.insert(node.name.clone(), cache_name.to_string());
        }

        let chosen = PlacementEngine::choose(candidates, strategy).ok_or_else(|| {
            Error::NoQualifyingNode {
                reason: format!(
                    "no node has {} bytes in {:?} and {} bytes in {:?}",
                    backend_size, backend_group, cache_size, cache_group
                ),
            }
        })?;

        let labels = nodes
            .iter()
            .find(|n| n.name == chosen.node_name)
            .map(|n| n.labels.clone())
            .unwrap_or_default();

        Ok(MultiVolumePlacement {
            cache_group: cache_choice.remove(&chosen.node_name).unwrap_or_default(),
            node_name: chosen.node_name,
            backend_group: chosen.device_group,
            segments: segments(topology, &labels),
        })
    }

    /// Allocatable bytes of one device group on one node
    pub async fn capacity_by_node_name(&self, node_name: &str, device_group: &str) -> Result<u64> {
        let node = self.cluster.get_node(node_name).await?;
        node.allocatable
            .iter()
            .find(|(key, _)| key_matches_group(key, device_group))
            .map(|(_, value)| *value)
            .ok_or_else(|| Error::DeviceGroupNotFound {
                node: node_name.to_string(),
                group: device_group.to_string(),
            })
    }

    /// Total capacity of a device group (every device group when empty)
    /// across nodes matching `topology`
    pub async fn total_capacity(&self, device_group: &str, topology: Option<&Topology>) -> Result<u64> {
        let nodes = self.cluster.list_nodes().await?;
        let total = nodes
            .iter()
            .filter(|n| topology.map(|t| t.matches(&n.labels)).unwrap_or(true))
            .flat_map(|n| n.capacity.iter())
            .filter(|(key, _)| {
                if device_group.is_empty() {
                    device_group_of(key).is_some()
                } else {
                    key_matches_group(key, device_group)
                }
            })
            .map(|(_, value)| *value)
            .fold(0u64, u64::saturating_add);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::crd::{NodeDevice, NodeDeviceSpec, NodeDeviceStatus, Partition, RawDevice};
    use crate::hardware::registry::NodeRegistry;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn key(group: &str) -> String {
        format!("{}{}", DEVICE_CAPACITY_KEY_PREFIX, group)
    }

    fn node(name: &str, zone: &str, groups: &[(&str, u64)]) -> NodeInfo {
        let map: BTreeMap<String, u64> = groups.iter().map(|(g, v)| (key(g), *v)).collect();
        NodeInfo {
            name: name.into(),
            labels: [("zone".to_string(), zone.to_string())].into_iter().collect(),
            allocatable: map.clone(),
            capacity: map,
            ready: true,
            ..Default::default()
        }
    }

    fn scheduler(registry: Arc<NodeRegistry>, strategy: &str) -> VolumeScheduler {
        let config = ConfigHandle::new(DiskConfig {
            scheduler_strategy: strategy.into(),
            ..Default::default()
        });
        VolumeScheduler::new(registry, config).with_jitter(JitterConfig::disabled())
    }

    fn two_nodes() -> Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        registry.upsert_node(node("node-a", "z1", &[("ssd", 100)]));
        registry.upsert_node(node("node-b", "z2", &[("ssd", 50)]));
        registry
    }

    #[tokio::test]
    async fn test_binpack_picks_smallest_sufficient() {
        let placement = scheduler(two_nodes(), "binpack")
            .select_volume_node(40, "ssd", None)
            .await
            .unwrap();
        assert_eq!(placement.node_name, "node-b");
        assert_eq!(placement.device_group, "ssd");
    }

    #[tokio::test]
    async fn test_spreadout_picks_largest() {
        let placement = scheduler(two_nodes(), "spreadout")
            .select_volume_node(40, "ssd", None)
            .await
            .unwrap();
        assert_eq!(placement.node_name, "node-a");
    }

    #[tokio::test]
    async fn test_request_larger_than_any_group() {
        let result = scheduler(two_nodes(), "binpack")
            .select_volume_node(101, "", None)
            .await;
        assert_matches!(result, Err(Error::NoQualifyingNode { .. }));
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected_at_call_time() {
        let result = scheduler(two_nodes(), "roundrobin")
            .select_volume_node(10, "ssd", None)
            .await;
        assert_matches!(result, Err(Error::UnsupportedStrategy { .. }));
    }

    #[tokio::test]
    async fn test_topology_filter_and_segments() {
        let topology = TopologyRequirement {
            requisite: vec![Topology::new([("zone".to_string(), "z2".to_string())])],
        };
        let placement = scheduler(two_nodes(), "spreadout")
            .select_volume_node(40, "ssd", Some(&topology))
            .await
            .unwrap();
        assert_eq!(placement.node_name, "node-b");
        assert_eq!(placement.segments.get("zone").map(String::as_str), Some("z2"));
    }

    #[tokio::test]
    async fn test_select_device_group_smallest_fit() {
        let registry = NodeRegistry::new();
        registry.upsert_node(node("node-a", "z1", &[("ssd", 100), ("hdd", 500), ("tiny", 5)]));
        let group = scheduler(registry, "spreadout")
            .select_device_group(50, "node-a")
            .await
            .unwrap();
        assert_eq!(group, "ssd");
    }

    #[tokio::test]
    async fn test_select_device_group_ignores_strategy_and_jitter() {
        let registry = NodeRegistry::new();
        registry.upsert_node(node("node-a", "z1", &[("ssd", 100)]));
        // Configured jitter (at least one second) would trip the timeout
        let config = ConfigHandle::new(DiskConfig {
            scheduler_strategy: "roundrobin".into(),
            ..Default::default()
        });
        let scheduler = VolumeScheduler::new(registry, config);

        let group = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            scheduler.select_device_group(10, "node-a"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(group, "ssd");
    }

    #[tokio::test]
    async fn test_multi_volume_requires_cache() {
        let registry = NodeRegistry::new();
        registry.upsert_node(node("node-a", "z1", &[("hdd", 1000)]));
        registry.upsert_node(node("node-b", "z1", &[("hdd", 500), ("nvme", 100)]));
        let placement = scheduler(registry.clone(), "spreadout")
            .select_multi_volume_node("hdd", "nvme", 200, 50, None)
            .await
            .unwrap();
        assert_eq!(placement.node_name, "node-b");
        assert_eq!(placement.backend_group, "hdd");
        assert_eq!(placement.cache_group, "nvme");

        let result = scheduler(registry, "spreadout")
            .select_multi_volume_node("hdd", "nvme", 200, 150, None)
            .await;
        assert_matches!(result, Err(Error::NoQualifyingNode { .. }));
    }

    #[tokio::test]
    async fn test_capacity_queries() {
        let registry = two_nodes();
        registry.upsert_node(node("node-c", "z2", &[("hdd", 300)]));
        let s = scheduler(registry, "binpack");

        assert_eq!(s.capacity_by_node_name("node-a", "ssd").await.unwrap(), 100);
        assert_eq!(s.capacity_by_node_name("node-a", key("ssd").as_str()).await.unwrap(), 100);
        assert_matches!(
            s.capacity_by_node_name("node-a", "hdd").await,
            Err(Error::DeviceGroupNotFound { .. })
        );

        assert_eq!(s.total_capacity("", None).await.unwrap(), 450);
        assert_eq!(s.total_capacity("ssd", None).await.unwrap(), 150);
        let z2 = Topology::new([("zone".to_string(), "z2".to_string())]);
        assert_eq!(s.total_capacity("", Some(&z2)).await.unwrap(), 350);
    }

    fn raw_document(node: &str, state: ActivityState, devices: Vec<RawDevice>) -> NodeDevice {
        let mut doc = NodeDevice::new(
            node,
            NodeDeviceSpec {
                node_name: node.into(),
                ..Default::default()
            },
        );
        let available = devices
            .iter()
            .map(|d| (format!("{}{}", RAW_DEVICE_KEY_PREFIX, d.name), d.available.clone()))
            .collect();
        doc.status = Some(NodeDeviceStatus {
            node_state: state,
            available,
            device_manage: crate::crd::DeviceManage {
                raw_devices: devices,
                ..Default::default()
            },
            ..Default::default()
        });
        doc
    }

    fn raw(name: &str, available: u64, partitions: usize, gap: u64) -> RawDevice {
        RawDevice {
            name: name.into(),
            device_type: "disk".into(),
            available: available.to_string(),
            partition: (0..partitions).map(|_| Partition::default()).collect(),
            free_space: vec![Partition {
                size: gap.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_select_node_device_skips_inactive_and_unfit_nodes() {
        let registry = two_nodes();
        registry
            .create_document(raw_document("node-a", ActivityState::Inactive, vec![raw("/dev/sdb", 900, 0, 0)]))
            .unwrap();
        registry
            .create_document(raw_document(
                "node-b",
                ActivityState::Active,
                vec![raw("/dev/sdb", 200, 0, 0), raw("/dev/sdc", 30, 2, 20)],
            ))
            .unwrap();

        let placement = scheduler(registry.clone(), "spreadout")
            .select_node_device(10, "", None, false)
            .await
            .unwrap();
        assert_eq!(placement.node_name, "node-b");
        assert_eq!(placement.device_group, "/dev/sdc");

        let placement = scheduler(registry.clone(), "spreadout")
            .select_node_device(10, "", None, true)
            .await
            .unwrap();
        assert_eq!(placement.device_group, "/dev/sdb");

        let result = scheduler(registry, "spreadout")
            .select_node_device(1000, "", None, true)
            .await;
        assert_matches!(result, Err(Error::NoQualifyingDevice { .. }));
    }
}
