//! Local Storage Operator
//!
//! Node-side control plane for a CSI driver that provisions volumes from
//! node-local disks. Each node publishes what its disks can hold, the
//! scheduler places volumes against those published capacities, and an
//! orphan reconciler removes local volumes nobody declares any more.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Control Plane                              │
//! │  ┌────────────────────┐  ┌──────────────────┐  ┌──────────────────┐  │
//! │  │ Inventory          │  │ Orphan           │  │ Event            │  │
//! │  │ Reconciler         │◄─┤ Reconciler       ├─►│ Dispatcher       │  │
//! │  └─────────┬──────────┘  └────────┬─────────┘  └──────────────────┘  │
//! │            │ NodeDevice           │ LogicVolume                      │
//! │  ┌─────────┴──────────────────────┴─────────┐  ┌──────────────────┐  │
//! │  │ ClusterState (API server | NodeRegistry) │◄─┤ Volume Scheduler │  │
//! │  └──────────────────────────────────────────┘  └──────────────────┘  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                          Device Discovery                            │
//! │      lsblk · df · parted · udevadm · vgs/pvs/lvs  (CommandExecutor)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: inventory and orphan reconcilers, notifications, API server access
//! - [`hardware`]: device discovery, volume placement, in-memory registry
//! - [`crd`]: NodeDevice and LogicVolume resources
//! - [`config`]: disk selector and scheduler configuration
//! - [`domain`]: ports to the cluster and to the disk tools
//! - [`error`]: error types and handling
//! - [`metrics`]: Prometheus counters

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod metrics;

// Re-export commonly used types
pub use config::{ConfigHandle, ConfigWatcher, DiskConfig};

pub use controlplane::{
    EventDispatcher, EventQueue, KubeClusterState, NodeDeviceReconciler, NotifyConfig,
    OrphanReconciler, Trigger, VolumeEvent,
};

pub use crd::{
    ActivityState, DiskSelector, LogicVolume, LogicVolumeSpec, NodeDevice, NodeDeviceSpec,
    NodeDeviceStatus, RawDevice, SelectorPolicy, VgGroup,
};

pub use domain::ports::{
    ClusterState, ClusterStateRef, CommandExecutor, CommandExecutorRef, DeclaredVolume, NodeInfo,
    Topology, TopologyRequirement,
};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    DeviceManager, JitterConfig, NodeRegistry, PlacementEngine, SchedulerStrategy, SystemExecutor,
    VolumeScheduler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
