//! Allocation Module
//!
//! Volume placement: scheduler strategy and jitter, candidate ranking, the
//! partition-or-raw device rule, and the scheduler itself.

pub mod placement;
pub mod policy;
pub mod scheduler;

pub use placement::*;
pub use policy::*;
pub use scheduler::*;
