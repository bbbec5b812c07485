//! NodeDevice CRD
//!
//! Per-node inventory document: the disk selectors applied on the node, the
//! raw devices and volume groups that matched them, and the capacity and
//! availability maps the volume scheduler reads.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// API group shared by all resources of this operator
pub const API_GROUP: &str = "storage.local.io";

/// Finalizer attached to every NodeDevice
pub const NODE_DEVICE_FINALIZER: &str = "storage.local.io/node-device";

/// Prefix of node allocatable/capacity resources that are device groups
pub const DEVICE_CAPACITY_KEY_PREFIX: &str = "storage.local.io/";

/// Key namespace for raw devices in the NodeDevice capacity maps
pub const RAW_DEVICE_KEY_PREFIX: &str = "raw-";

/// Key namespace for volume groups in the NodeDevice capacity maps
pub const VG_KEY_PREFIX: &str = "vg-";

/// Volume groups created by the driver carry this prefix
pub const MANAGED_VG_PREFIX: &str = "lsd-";

/// Logical volumes created by the driver carry this prefix
pub const MANAGED_LV_PREFIX: &str = "volume-";

/// Thin pools backing a volume carry this prefix
pub const THIN_LV_PREFIX: &str = "thin-";

/// Partitions created by the driver carry this prefix
pub const MANAGED_PARTITION_PREFIX: &str = "lsd-";

/// GPT partition names are limited to 36 UTF-16 code units
pub const MAX_PARTITION_NAME_LEN: usize = 36;

/// Kind of the object that owns every NodeDevice
pub const DRIVER_OWNER_KIND: &str = "CSIDriver";

// =============================================================================
// NodeDevice CRD
// =============================================================================

/// NodeDevice records the local disks and volume groups of one cluster node,
/// as seen through the disk selectors configured for that node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.local.io",
    version = "v1",
    kind = "NodeDevice",
    plural = "nodedevices",
    shortname = "nd",
    status = "NodeDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceSpec {
    /// Name of the Kubernetes node
    #[serde(default)]
    pub node_name: String,

    /// Selectors effective on this node
    #[serde(default)]
    pub disk_selector: Vec<DiskSelector>,
}

// =============================================================================
// Disk Selector
// =============================================================================

/// Policy applied to devices matched by a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SelectorPolicy {
    /// Whole disks handed out directly or partitioned
    Raw,
    /// Disks backing an LVM volume group
    Lvm,
}

impl SelectorPolicy {
    /// Parse a policy tag, case-insensitively
    pub fn parse(policy: &str) -> Option<Self> {
        match policy.to_ascii_lowercase().as_str() {
            "raw" => Some(SelectorPolicy::Raw),
            "lvm" => Some(SelectorPolicy::Lvm),
            _ => None,
        }
    }
}

impl std::fmt::Display for SelectorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorPolicy::Raw => write!(f, "raw"),
            SelectorPolicy::Lvm => write!(f, "lvm"),
        }
    }
}

/// Matches device names against a set of patterns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskSelector {
    /// Device group name (for lvm, the volume group the disks join)
    #[serde(default)]
    pub name: String,

    /// Regular expressions tested against device names (OR-joined)
    #[serde(default)]
    pub re: Vec<String>,

    /// Policy tag: raw or lvm
    #[serde(default)]
    pub policy: String,

    /// Only nodes carrying this label key get the selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
}

impl DiskSelector {
    /// Parsed policy, if the tag is recognized
    pub fn policy(&self) -> Option<SelectorPolicy> {
        SelectorPolicy::parse(&self.policy)
    }

    /// Patterns joined into one alternation
    pub fn pattern(&self) -> String {
        self.re.join("|")
    }

    /// Whether the selector applies to a node with these labels
    pub fn applies_to(&self, labels: &BTreeMap<String, String>) -> bool {
        match &self.node_label {
            None => true,
            Some(label) if label.is_empty() => true,
            Some(label) => labels.contains_key(label),
        }
    }
}

// =============================================================================
// Device Records
// =============================================================================

/// Activity of a node or a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ActivityState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Active => write!(f, "Active"),
            ActivityState::Inactive => write!(f, "Inactive"),
            ActivityState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One partition or free-space gap, verbatim from the partition tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub flags: String,
}

impl Partition {
    /// Size in bytes, ignoring a trailing unit suffix; unparsable sizes are zero
    pub fn size_bytes(&self) -> u64 {
        parse_byte_count(&self.size)
    }
}

/// Parse a byte count such as `1048576` or `1048576B`; garbage yields 0
pub fn parse_byte_count(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .unwrap_or(0)
}

/// A block device on the node, plus the capacity view the scheduler needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawDevice {
    /// Device path (e.g. /dev/sdb)
    pub name: String,
    #[serde(default)]
    pub mount_point: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Kernel state string (e.g. running)
    #[serde(default)]
    pub state: String,
    /// Device type (disk, part, lvm, loop)
    #[serde(default, rename = "type")]
    pub device_type: String,
    /// "1" for spinning media
    #[serde(default)]
    pub rotational: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub filesystem: String,
    /// Used bytes
    #[serde(default)]
    pub used: u64,
    /// Backing device for partitions
    #[serde(default)]
    pub parent_name: String,

    /// Total bytes as reported by the usage query
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub capacity: String,
    /// Free bytes as reported by the usage query
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub available: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition: Vec<Partition>,
    #[serde(default, rename = "freespace", skip_serializing_if = "Vec::is_empty")]
    pub free_space: Vec<Partition>,

    /// Inactive when the last usage or partition query failed
    #[serde(default)]
    pub activity: ActivityState,
}

impl RawDevice {
    /// Available bytes; unparsable values are zero
    pub fn available_bytes(&self) -> u64 {
        parse_byte_count(&self.available)
    }

    /// Total bytes; unparsable values are zero
    pub fn capacity_bytes(&self) -> u64 {
        parse_byte_count(&self.capacity)
    }

    /// Largest free-space gap in bytes
    pub fn largest_free_gap(&self) -> u64 {
        self.free_space
            .iter()
            .map(Partition::size_bytes)
            .max()
            .unwrap_or(0)
    }

    pub fn is_inactive(&self) -> bool {
        self.activity == ActivityState::Inactive
    }
}

/// One LVM physical volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvInfo {
    #[serde(default)]
    pub pv_name: String,
    #[serde(default)]
    pub vg_name: String,
    #[serde(default)]
    pub pv_fmt: String,
    #[serde(default)]
    pub pv_attr: String,
    #[serde(default)]
    pub pv_size: u64,
    #[serde(default)]
    pub pv_free: u64,
}

/// One LVM volume group with its physical volumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VgGroup {
    #[serde(default)]
    pub vg_name: String,
    /// First backing physical volume
    #[serde(default)]
    pub pv_name: String,
    #[serde(default)]
    pub pv_count: u64,
    #[serde(default)]
    pub lv_count: u64,
    #[serde(default)]
    pub snap_count: u64,
    #[serde(default)]
    pub vg_attr: String,
    #[serde(default)]
    pub vg_size: u64,
    #[serde(default)]
    pub vg_free: u64,
    #[serde(default)]
    pub pvs: Vec<PvInfo>,
}

/// Devices managed on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManage {
    #[serde(default)]
    pub vg_groups: Vec<VgGroup>,
    #[serde(default)]
    pub raw_devices: Vec<RawDevice>,
}

impl DeviceManage {
    /// Insert or replace a raw device by name; returns true when something changed
    pub fn upsert_raw_device(&mut self, device: RawDevice) -> bool {
        match self.raw_devices.iter_mut().find(|d| d.name == device.name) {
            Some(existing) if *existing == device => false,
            Some(existing) => {
                *existing = device;
                true
            }
            None => {
                self.raw_devices.push(device);
                true
            }
        }
    }

    /// Insert or replace a volume group by name; returns true when something changed
    pub fn upsert_vg_group(&mut self, group: VgGroup) -> bool {
        match self.vg_groups.iter_mut().find(|g| g.vg_name == group.vg_name) {
            Some(existing) if *existing == group => false,
            Some(existing) => {
                *existing = group;
                true
            }
            None => {
                self.vg_groups.push(group);
                true
            }
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the NodeDevice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceStatus {
    /// Node activity
    #[serde(default, rename = "state")]
    pub node_state: ActivityState,

    /// Total bytes per device group, as decimal strings
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,

    /// Free bytes per device group, as decimal strings
    #[serde(default)]
    pub available: BTreeMap<String, String>,

    #[serde(default)]
    pub device_manage: DeviceManage,
}

impl NodeDevice {
    /// Node this document describes
    pub fn node_name(&self) -> &str {
        if self.spec.node_name.is_empty() {
            self.metadata.name.as_deref().unwrap_or_default()
        } else {
            &self.spec.node_name
        }
    }

    /// Current node state, Unknown without a status
    pub fn node_state(&self) -> ActivityState {
        self.status
            .as_ref()
            .map(|s| s.node_state)
            .unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == NODE_DEVICE_FINALIZER))
            .unwrap_or(false)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Mirrored node labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }
}

// =============================================================================
// Names
// =============================================================================

/// Partition name the driver gives the partition backing `volume`.
///
/// Volume names routinely exceed the GPT name limit, so the name is the
/// managed prefix plus a 64-bit FNV-1a digest of the volume name.
pub fn partition_name(volume: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let digest = volume
        .bytes()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME));
    format!("{}{:016x}", MANAGED_PARTITION_PREFIX, digest)
}
