//! Hardware Module
//!
//! Local device discovery, volume placement, and the in-memory cluster
//! registry.

pub mod allocation;
pub mod discovery;
pub mod registry;

pub use allocation::*;
pub use discovery::*;
pub use registry::*;
