//! Placement Rules
//!
//! Ranking of placement candidates and the partition-or-raw device rule
//! used for raw-disk volumes.

use super::policy::SchedulerStrategy;
use crate::crd::RawDevice;
use crate::error::{Error, Result};
use tracing::debug;

// =============================================================================
// Placement Candidate
// =============================================================================

/// A node (and device group or device) able to host a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCandidate {
    /// Node name
    pub node_name: String,
    /// Device group or raw device on that node
    pub device_group: String,
    /// Capacity the candidate was ranked by, in bytes
    pub capacity_bytes: u64,
}

impl PlacementCandidate {
    pub fn new(node_name: impl Into<String>, device_group: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            node_name: node_name.into(),
            device_group: device_group.into(),
            capacity_bytes,
        }
    }
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Stateless ranking of candidates
pub struct PlacementEngine;

impl PlacementEngine {
    /// Sort ascending by capacity (ties by node, then group) and let the
    /// strategy pick: binpack takes the smallest, spreadout the largest
    pub fn choose(
        mut candidates: Vec<PlacementCandidate>,
        strategy: SchedulerStrategy,
    ) -> Option<PlacementCandidate> {
        candidates.sort_by(|a, b| {
            a.capacity_bytes
                .cmp(&b.capacity_bytes)
                .then_with(|| a.node_name.cmp(&b.node_name))
                .then_with(|| a.device_group.cmp(&b.device_group))
        });
        strategy.pick(&candidates).cloned()
    }

    /// Pick the disk a raw volume of `request` bytes goes to.
    ///
    /// Exclusive requests need a disk with at most one partition and enough
    /// available space. Shared requests prefer a partitioned disk with a free
    /// gap of at least `request`, and fall back to an unpartitioned disk only
    /// when no partitioned disk fits. Inactive disks never qualify.
    pub fn select_partition_or_raw(
        devices: &[RawDevice],
        request: u64,
        exclusive: bool,
        strategy: SchedulerStrategy,
    ) -> Result<RawDevice> {
        let usable = devices.iter().filter(|d| !d.is_inactive());

        let unpartitioned: Vec<&RawDevice> = usable
            .clone()
            .filter(|d| d.partition.len() <= 1 && d.available_bytes() >= request)
            .collect();

        let pool = if exclusive {
            unpartitioned
        } else {
            let partitioned: Vec<&RawDevice> = usable
                .filter(|d| d.partition.len() > 1 && d.largest_free_gap() >= request)
                .collect();
            if partitioned.is_empty() {
                unpartitioned
            } else {
                partitioned
            }
        };

        let mut ranked: Vec<&RawDevice> = pool;
        ranked.sort_by(|a, b| {
            placement_capacity(a)
                .cmp(&placement_capacity(b))
                .then_with(|| a.name.cmp(&b.name))
        });

        match strategy.pick(&ranked) {
            Some(device) => {
                debug!(
                    "Selected {} for {} bytes (exclusive: {})",
                    device.name, request, exclusive
                );
                Ok((*device).clone())
            }
            None => Err(Error::NoQualifyingDevice {
                reason: format!(
                    "no {} disk with {} bytes free",
                    if exclusive { "unpartitioned" } else { "usable" },
                    request
                ),
            }),
        }
    }
}

/// Capacity a raw device offers to a new volume: its largest free gap when
/// already partitioned, otherwise its available bytes
pub fn placement_capacity(device: &RawDevice) -> u64 {
    if device.partition.len() > 1 {
        device.largest_free_gap()
    } else {
        device.available_bytes()
    }
}
