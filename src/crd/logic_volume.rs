//! LogicVolume CRD
//!
//! The cluster's declared intent for one local volume. The orphan
//! reconciler diffs these against what actually exists on the node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation telling which local artifact backs the volume
pub const VOLUME_MANAGER_TYPE_ANNOTATION: &str = "storage.local.io/manager-type";

/// Volume backed by a raw disk or a partition
pub const RAW_VOLUME_TYPE: &str = "raw";

/// Volume backed by an LVM logical volume
pub const LVM_VOLUME_TYPE: &str = "lvm";

/// LogicVolume declares a volume placed on a node's device group.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.local.io",
    version = "v1",
    kind = "LogicVolume",
    plural = "logicvolumes",
    shortname = "lv",
    status = "LogicVolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Group", "type": "string", "jsonPath": ".spec.deviceGroup"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.size"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LogicVolumeSpec {
    /// Node hosting the volume
    pub node_name: String,

    /// Volume group or raw device the volume lives on
    #[serde(default)]
    pub device_group: String,

    /// Requested size in bytes
    #[serde(default)]
    pub size: u64,
}

/// Status of the LogicVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogicVolumeStatus {
    /// Provisioning status reported by the volume service
    #[serde(default)]
    pub status: String,

    /// Local volume identifier once created
    #[serde(default)]
    pub volume_id: String,
}
