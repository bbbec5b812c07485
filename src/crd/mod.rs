//! Custom Resource Definitions for the Local Storage Operator
//!
//! This module contains all CRD types:
//! - NodeDevice: per-node disk inventory and capacity maps
//! - LogicVolume: declared local volumes

pub mod logic_volume;
pub mod node_device;

pub use logic_volume::*;
pub use node_device::*;

// Re-export common types for convenience
pub use std::collections::BTreeMap;
