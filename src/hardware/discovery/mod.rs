//! Device Discovery Module
//!
//! Discovers local block devices, partitions and LVM volume groups by
//! running the system disk tools and parsing their output.

pub mod device;
pub mod executor;
pub mod lvm;
pub mod parser;
pub mod partition;

pub use device::*;
pub use executor::SystemExecutor;
pub use lvm::*;
pub use parser::*;
pub use partition::*;

use crate::domain::ports::CommandExecutorRef;

/// Disk, partition and LVM managers sharing one executor
#[derive(Clone)]
pub struct DeviceManager {
    pub disks: DiskManager,
    pub partitions: PartitionManager,
    pub lvm: LvmManager,
}

impl DeviceManager {
    pub fn new(executor: CommandExecutorRef) -> Self {
        let disks = DiskManager::new(executor.clone());
        Self {
            partitions: PartitionManager::new(disks.clone()),
            lvm: LvmManager::new(executor),
            disks,
        }
    }
}
