//! Node Registry Module
//!
//! Sharded in-memory cluster view: nodes, NodeDevice documents and declared
//! volumes. Used in standalone mode and by tests in place of the API server.

pub mod node_registry;

pub use node_registry::*;
