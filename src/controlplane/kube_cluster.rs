//! Kubernetes Cluster State
//!
//! `ClusterState` over the API server: nodes and CSIDriver objects from the
//! core API, NodeDevice and LogicVolume through their CRDs. Writes carry the
//! observed resourceVersion so a stale document comes back as a conflict.

use crate::crd::{LogicVolume, NodeDevice, VOLUME_MANAGER_TYPE_ANNOTATION};
use crate::domain::ports::{ClusterState, DeclaredVolume, NodeInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const NODE_DEVICE_KIND: &str = "NodeDevice";

// =============================================================================
// Conversions
// =============================================================================

/// Parse a Kubernetes quantity into whole units. Fractions round down;
/// unknown suffixes yield `None`.
pub fn parse_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let value: f64 = number.parse().ok()?;

    let factor: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse().ok()?),
        _ => return None,
    };
    Some((value * factor).floor() as u64)
}

fn quantities(map: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<String, u64> {
    map.map(|m| {
        m.iter()
            .filter_map(|(k, q)| parse_quantity(&q.0).map(|v| (k.clone(), v)))
            .collect()
    })
    .unwrap_or_default()
}

/// The operator's view of a Kubernetes node
pub fn node_info(node: &Node) -> NodeInfo {
    let status = node.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    NodeInfo {
        name: node.name_any(),
        labels: node.labels().clone(),
        annotations: node.annotations().clone(),
        allocatable: quantities(status.and_then(|s| s.allocatable.as_ref())),
        capacity: quantities(status.and_then(|s| s.capacity.as_ref())),
        ready,
        terminated: status.and_then(|s| s.phase.as_deref()) == Some("Terminated"),
        deleting: node.metadata.deletion_timestamp.is_some(),
    }
}

impl From<&LogicVolume> for DeclaredVolume {
    fn from(volume: &LogicVolume) -> Self {
        DeclaredVolume {
            name: volume.name_any(),
            node_name: volume.spec.node_name.clone(),
            manager_type: volume
                .annotations()
                .get(VOLUME_MANAGER_TYPE_ANNOTATION)
                .cloned(),
        }
    }
}

/// Translate API status codes into the operator's error kinds
fn api_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

// =============================================================================
// Cluster State
// =============================================================================

/// Cluster state backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self { client })
    }

    /// Connect with the in-cluster or kubeconfig credentials
    pub async fn try_default() -> Result<Arc<Self>> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn node_devices(&self) -> Api<NodeDevice> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_info).collect())
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        match self.nodes().get_opt(name).await? {
            Some(node) => Ok(node_info(&node)),
            None => Err(Error::NodeNotFound {
                node_id: name.to_string(),
            }),
        }
    }

    async fn list_node_devices(&self) -> Result<Vec<NodeDevice>> {
        Ok(self.node_devices().list(&ListParams::default()).await?.items)
    }

    async fn get_node_device(&self, name: &str) -> Result<Option<NodeDevice>> {
        Ok(self.node_devices().get_opt(name).await?)
    }

    async fn create_node_device(&self, device: NodeDevice) -> Result<NodeDevice> {
        let name = device.name_any();
        debug!("Creating NodeDevice {}", name);
        self.node_devices()
            .create(&PostParams::default(), &device)
            .await
            .map_err(|e| api_error(e, NODE_DEVICE_KIND, &name))
    }

    async fn update_node_device(&self, device: &NodeDevice) -> Result<NodeDevice> {
        let name = device.name_any();
        self.node_devices()
            .replace(&name, &PostParams::default(), device)
            .await
            .map_err(|e| api_error(e, NODE_DEVICE_KIND, &name))
    }

    async fn update_node_device_status(&self, device: &NodeDevice) -> Result<NodeDevice> {
        let name = device.name_any();
        let body = serde_json::to_vec(device)?;
        self.node_devices()
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| api_error(e, NODE_DEVICE_KIND, &name))
    }

    async fn list_declared_volumes(&self, node_name: &str) -> Result<Vec<DeclaredVolume>> {
        let volumes: Api<LogicVolume> = Api::all(self.client.clone());
        let list = volumes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter(|v| v.spec.node_name == node_name)
            .map(DeclaredVolume::from)
            .collect())
    }

    async fn driver_owner(&self, driver_name: &str) -> Result<Option<OwnerReference>> {
        let drivers: Api<CSIDriver> = Api::all(self.client.clone());
        Ok(drivers
            .get_opt(driver_name)
            .await?
            .and_then(|driver| driver.controller_owner_ref(&())))
    }
}
