//! Partition Manager
//!
//! Creates and deletes partitions with parted and reports a device's
//! partitions and free-space gaps. Failures carry the device name; nothing
//! here retries.

use super::device::{device_path, is_unlabeled, DiskManager, PART_TYPE, UNKNOWN_TABLE};
use super::parser::{parse_free_space_string, parse_partition_string, parse_udev_info};
use crate::crd::Partition;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Partition operations on local disks
#[derive(Clone)]
pub struct PartitionManager {
    disks: DiskManager,
}

impl PartitionManager {
    pub fn new(disks: DiskManager) -> Self {
        Self { disks }
    }

    async fn parted(&self, device: &str, args: &[&str]) -> Result<String> {
        let path = device_path(device);
        let mut full = vec!["-s", path.as_str()];
        full.extend_from_slice(args);
        self.disks
            .executor()
            .execute("parted", &full)
            .await
            .map_err(|e| Error::device(device, e))
    }

    /// Listing output, or `None` when the disk has no label and so no partitions
    async fn parted_listing(&self, device: &str, args: &[&str]) -> Result<Option<String>> {
        match self.parted(device, args).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if is_unlabeled(&e) => {
                debug!("{} has no partition label", device);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create partition `name` spanning `start..end` and return it.
    ///
    /// Unlabeled disks get a GPT label first. Returns a default partition
    /// (empty name) when the new partition cannot be found afterwards.
    pub async fn add_device_partition(
        &self,
        device: &str,
        name: &str,
        start: &str,
        end: &str,
    ) -> Result<Partition> {
        let table = self.disks.get_disk_partition_type(device).await?;
        if table.trim().is_empty() || table == UNKNOWN_TABLE {
            info!("Creating gpt label on {}", device);
            self.parted(device, &["mklabel", "gpt"]).await?;
        }

        self.parted(device, &["unit", "B", "mkpart", name, start, end])
            .await?;

        let partition = self
            .get_device_partitions(device)
            .await?
            .into_iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| {
                warn!("Partition {} not listed on {} after mkpart", name, device);
                Partition::default()
            });
        Ok(partition)
    }

    /// Remove partition `number`
    pub async fn del_device_partition(&self, device: &str, number: &str) -> Result<()> {
        info!("Removing partition {} from {}", number, device);
        self.parted(device, &["rm", number]).await.map(|_| ())
    }

    /// Partitions on a device; an unlabeled disk has none
    pub async fn get_device_partitions(&self, device: &str) -> Result<Vec<Partition>> {
        let output = self.parted_listing(device, &["unit", "B", "print"]).await?;
        Ok(output.map(|o| parse_partition_string(&o)).unwrap_or_default())
    }

    /// Free-space gaps on a device and their total size in bytes
    ///
    /// An unlabeled disk reports no gaps; its space shows up as the whole
    /// raw device instead.
    pub async fn get_device_unused_partitions(&self, device: &str) -> Result<(Vec<Partition>, u64)> {
        let output = self
            .parted_listing(device, &["unit", "B", "print", "free"])
            .await?;
        Ok(output.map(|o| parse_free_space_string(&o)).unwrap_or_default())
    }

    /// Whether the device is itself a partition
    pub async fn is_part_type(&self, device: &str) -> Result<bool> {
        let listed = self.disks.list_devices_detail(Some(device)).await?;
        let first = listed.first().ok_or_else(|| Error::DeviceNotFound {
            device: device.to_string(),
        })?;
        Ok(first.device_type == PART_TYPE)
    }

    /// udev properties of a device
    pub async fn get_udev_info(&self, device: &str) -> Result<BTreeMap<String, String>> {
        let path = device_path(device);
        let output = self
            .disks
            .executor()
            .execute("udevadm", &["info", "--query=property", &path])
            .await
            .map_err(|e| Error::device(device, e))?;
        Ok(parse_udev_info(&output))
    }
}
