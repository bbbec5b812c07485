//! Control Plane Module
//!
//! Per-node loops that keep the cluster view honest: the inventory
//! reconciler publishing NodeDevice documents, the orphan reconciler, and
//! the notification queue connecting them. Cluster access goes through
//! `ClusterState`, backed by the API server or the in-memory registry.

pub mod inventory;
pub mod kube_cluster;
pub mod notify;
pub mod orphan;

pub use inventory::*;
pub use kube_cluster::*;
pub use notify::*;
pub use orphan::*;
