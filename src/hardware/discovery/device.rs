//! Local Disk Discovery
//!
//! Lists block devices with lsblk and queries per-device usage and
//! partition-table type.

use super::parser::{parse_disk_string, parse_partition_table_type, parse_usage_output, LocalDisk};
use crate::domain::ports::CommandExecutorRef;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Columns requested from lsblk, in the order the parser expects
pub const LSBLK_COLUMNS: &str = "NAME,FSTYPE,MOUNTPOINT,SIZE,STATE,TYPE,ROTA,RO,PKNAME";

/// lsblk type of a whole disk
pub const DISK_TYPE: &str = "disk";

/// lsblk type of a partition
pub const PART_TYPE: &str = "part";

/// Partition table type parted reports for an unlabeled disk
pub const UNKNOWN_TABLE: &str = "unknown";

/// Absolute device path; bare names are resolved under /dev
pub fn device_path(device: &str) -> String {
    if device.starts_with('/') {
        device.to_string()
    } else {
        format!("/dev/{}", device)
    }
}

/// Whether parted failed because the disk carries no partition label yet
pub fn is_unlabeled(err: &Error) -> bool {
    match err {
        Error::CommandFailed { reason, .. } => reason.contains("unrecognised disk label"),
        Error::Device { source, .. } => is_unlabeled(source),
        _ => false,
    }
}

// =============================================================================
// Disk Manager
// =============================================================================

/// Queries local disks through the command executor
#[derive(Clone)]
pub struct DiskManager {
    executor: CommandExecutorRef,
}

impl DiskManager {
    pub fn new(executor: CommandExecutorRef) -> Self {
        Self { executor }
    }

    pub(crate) fn executor(&self) -> &CommandExecutorRef {
        &self.executor
    }

    /// List all block devices
    pub async fn list_devices(&self) -> Result<Vec<LocalDisk>> {
        self.list_devices_detail(None).await
    }

    /// List one device (and its children), or every device when `None`
    pub async fn list_devices_detail(&self, device: Option<&str>) -> Result<Vec<LocalDisk>> {
        let path = device.map(device_path);
        let mut args = vec![
            "--pairs",
            "--paths",
            "--bytes",
            "--all",
            "--output",
            LSBLK_COLUMNS,
        ];
        if let Some(path) = path.as_deref() {
            args.push(path);
        }

        let output = self
            .executor
            .execute("lsblk", &args)
            .await
            .map_err(|e| match device {
                Some(d) => Error::device(d, e),
                None => e,
            })?;

        let disks = parse_disk_string(&output);
        debug!("lsblk listed {} devices", disks.len());
        Ok(disks)
    }

    /// Size and available bytes of a device, keyed `Size` and `Avail`
    ///
    /// These are what `df` reports for the path. For a device node that is
    /// not mounted, that is the filesystem holding `/dev` (usually devtmpfs),
    /// not the geometry of the disk itself.
    pub async fn get_disk_usage(&self, device: &str) -> Result<BTreeMap<String, String>> {
        let path = device_path(device);
        let output = self
            .executor
            .execute("df", &["-B1", "--output=size,avail", &path])
            .await
            .map_err(|e| Error::device(device, e))?;

        let usage = parse_usage_output(&output);
        if !usage.contains_key("Size") || !usage.contains_key("Avail") {
            return Err(Error::device(
                device,
                Error::CapacityParse(format!("unexpected df output: {:?}", output.trim())),
            ));
        }
        Ok(usage)
    }

    /// Partition table type (gpt, msdos, unknown)
    pub async fn get_disk_partition_type(&self, device: &str) -> Result<String> {
        let path = device_path(device);
        match self.executor.execute("parted", &["-s", &path, "print"]).await {
            Ok(output) => Ok(parse_partition_table_type(&output).unwrap_or_default()),
            Err(e) if is_unlabeled(&e) => Ok(UNKNOWN_TABLE.to_string()),
            Err(e) => Err(Error::device(device, e)),
        }
    }
}
