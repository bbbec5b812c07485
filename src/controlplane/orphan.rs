//! Orphan Reconciler
//!
//! Removes local logical volumes and partitions that the driver created but
//! that no declared volume in the cluster accounts for any more. Only
//! artifacts carrying the driver's name prefixes are ever considered.

use super::notify::{EventQueue, Trigger};
use crate::config::ConfigHandle;
use crate::crd::{
    partition_name, MANAGED_LV_PREFIX, MANAGED_PARTITION_PREFIX, MANAGED_VG_PREFIX,
    THIN_LV_PREFIX,
};
use crate::domain::ports::ClusterStateRef;
use crate::error::Result;
use crate::hardware::discovery::{DeviceManager, DISK_TYPE};
use crate::metrics;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Artifacts deleted, as `vg/lv` or `device#number`
    pub removed: Vec<String>,
    /// Managed artifacts still backed by a declaration
    pub kept: usize,
    /// Artifacts left alone because they lack the managed prefix
    pub skipped: usize,
    /// Deletions that failed
    pub failed: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.removed.is_empty() && self.failed == 0
    }
}

/// Cleans up orphaned volumes and partitions on one node
pub struct OrphanReconciler {
    node_name: String,
    cluster: ClusterStateRef,
    devices: DeviceManager,
    events: EventQueue,
    config: ConfigHandle,
}

impl OrphanReconciler {
    pub fn new(
        node_name: impl Into<String>,
        cluster: ClusterStateRef,
        devices: DeviceManager,
        events: EventQueue,
        config: ConfigHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.into(),
            cluster,
            devices,
            events,
            config,
        })
    }

    fn notify_cleanup(&self, kind: &str, report: &SweepReport) {
        if report.removed.is_empty() {
            return;
        }
        metrics::orphans_removed()
            .with_label_values(&[kind])
            .inc_by(report.removed.len() as u64);
        if let Err(e) = self.events.send(Trigger::CleanupOrphan) {
            warn!("Cannot announce {} cleanup: {}", kind, e);
        }
    }

    /// Remove managed logical volumes no declaration expects
    pub async fn cleanup_orphan_volumes(&self) -> Result<SweepReport> {
        let volumes = self.devices.lvm.list_volumes().await.unwrap_or_else(|e| {
            error!(error = %e, "Listing logical volumes failed");
            Vec::new()
        });
        for lv in volumes.iter().filter(|lv| !lv.is_active()) {
            warn!("Logical volume {}/{} is {}", lv.vg_name, lv.lv_name, lv.lv_active);
        }

        let declared = self.cluster.list_declared_volumes(&self.node_name).await?;
        let expected: HashSet<String> = declared
            .iter()
            .filter(|v| !v.is_raw())
            .flat_map(|v| {
                [
                    v.name.clone(),
                    format!("{}{}", THIN_LV_PREFIX, v.name),
                    format!("{}{}", MANAGED_LV_PREFIX, v.name),
                ]
            })
            .collect();

        let mut report = SweepReport::default();
        for lv in &volumes {
            if !lv.vg_name.starts_with(MANAGED_VG_PREFIX) || !lv.lv_name.starts_with(MANAGED_LV_PREFIX) {
                report.skipped += 1;
                continue;
            }
            if expected.contains(&lv.lv_name) {
                report.kept += 1;
                continue;
            }

            warn!("Removing orphaned logical volume {}/{}", lv.vg_name, lv.lv_name);
            match self.devices.lvm.delete_volume(&lv.vg_name, &lv.lv_name).await {
                Ok(()) => report.removed.push(format!("{}/{}", lv.vg_name, lv.lv_name)),
                Err(e) => {
                    error!(error = %e, "Removing logical volume failed");
                    report.failed += 1;
                }
            }
        }

        self.notify_cleanup("volume", &report);
        Ok(report)
    }

    /// Remove managed partitions no declaration expects
    pub async fn cleanup_orphan_partitions(&self) -> Result<SweepReport> {
        let declared = self.cluster.list_declared_volumes(&self.node_name).await?;
        let expected: HashSet<String> = declared
            .iter()
            .filter(|v| !v.is_lvm())
            .map(|v| partition_name(&v.name))
            .collect();

        let disks = self.devices.disks.list_devices().await?;
        let mut report = SweepReport::default();

        for disk in disks.iter().filter(|d| d.device_type == DISK_TYPE) {
            let partitions = self.devices.partitions.get_device_partitions(&disk.name).await?;
            for partition in partitions {
                if !partition.name.starts_with(MANAGED_PARTITION_PREFIX) {
                    debug!("Skipping partition {:?} on {}", partition.name, disk.name);
                    report.skipped += 1;
                    continue;
                }
                if expected.contains(&partition.name) {
                    report.kept += 1;
                    continue;
                }

                warn!(
                    "Removing orphaned partition {} ({}) on {}",
                    partition.number, partition.name, disk.name
                );
                match self
                    .devices
                    .partitions
                    .del_device_partition(&disk.name, &partition.number)
                    .await
                {
                    Ok(()) => report.removed.push(format!("{}#{}", disk.name, partition.number)),
                    Err(e) => {
                        error!(error = %e, "Removing partition failed");
                        report.failed += 1;
                    }
                }
            }
        }

        self.notify_cleanup("partition", &report);
        Ok(report)
    }

    async fn sweep(&self) {
        let volumes = self.cleanup_orphan_volumes().await;
        metrics::record_pass("orphan_volumes", volumes.is_ok());
        match volumes {
            Ok(report) if !report.is_clean() => info!(?report, "Volume sweep finished"),
            Ok(_) => debug!("No orphaned volumes"),
            Err(e) => error!(error = %e, "Volume sweep aborted"),
        }

        let partitions = self.cleanup_orphan_partitions().await;
        metrics::record_pass("orphan_partitions", partitions.is_ok());
        match partitions {
            Ok(report) if !report.is_clean() => info!(?report, "Partition sweep finished"),
            Ok(_) => debug!("No orphaned partitions"),
            Err(e) => error!(error = %e, "Partition sweep aborted"),
        }
    }

    /// Sweep periodically until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.snapshot().orphan_sweep_interval.max(1);
        info!(node = %self.node_name, interval_secs = period, "Starting orphan reconciler");

        let mut interval = tokio::time::interval(Duration::from_secs(period));
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep().await,
                _ = shutdown.recv() => {
                    info!("Orphan reconciler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::controlplane::notify::{EventDispatcher, NotifyConfig};
    use crate::crd::NodeDevice;
    use crate::domain::ports::{ClusterState, DeclaredVolume, NodeInfo};
    use crate::error::Error;
    use crate::hardware::discovery::executor::testing::ScriptedExecutor;
    use crate::hardware::registry::NodeRegistry;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    const LVS: &str = "lvs --noheadings --separator | --units b --nosuffix -o lv_name,vg_name,lv_size,lv_active,lv_attr,pool_lv";
    const LSBLK: &str = "lsblk --pairs --paths --bytes --all --output NAME,FSTYPE,MOUNTPOINT,SIZE,STATE,TYPE,ROTA,RO,PKNAME";

    fn parted_row(cols: [&str; 7]) -> String {
        format!(
            "{:<8}{:<10}{:<10}{:<10}{:<13}{:<22}{}\n",
            cols[0], cols[1], cols[2], cols[3], cols[4], cols[5], cols[6]
        )
    }

    fn declared(name: &str, kind: &str) -> DeclaredVolume {
        DeclaredVolume {
            name: name.into(),
            node_name: "node-1".into(),
            manager_type: Some(kind.into()),
        }
    }

    fn reconciler(
        exec: Arc<ScriptedExecutor>,
        cluster: ClusterStateRef,
    ) -> (Arc<OrphanReconciler>, EventDispatcher) {
        let (dispatcher, queue) = EventDispatcher::new(NotifyConfig::default());
        let reconciler = OrphanReconciler::new(
            "node-1",
            cluster,
            DeviceManager::new(exec),
            queue,
            ConfigHandle::new(DiskConfig::default()),
        );
        (reconciler, dispatcher)
    }

    /// Cluster whose volume listing always fails
    struct VolumesUnavailable(Arc<NodeRegistry>);

    #[async_trait]
    impl ClusterState for VolumesUnavailable {
        async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
            self.0.list_nodes().await
        }
        async fn get_node(&self, name: &str) -> Result<NodeInfo> {
            self.0.get_node(name).await
        }
        async fn list_node_devices(&self) -> Result<Vec<NodeDevice>> {
            self.0.list_node_devices().await
        }
        async fn get_node_device(&self, name: &str) -> Result<Option<NodeDevice>> {
            self.0.get_node_device(name).await
        }
        async fn create_node_device(&self, device: NodeDevice) -> Result<NodeDevice> {
            self.0.create_node_device(device).await
        }
        async fn update_node_device(&self, device: &NodeDevice) -> Result<NodeDevice> {
            self.0.update_node_device(device).await
        }
        async fn update_node_device_status(&self, device: &NodeDevice) -> Result<NodeDevice> {
            self.0.update_node_device_status(device).await
        }
        async fn list_declared_volumes(&self, _node_name: &str) -> Result<Vec<DeclaredVolume>> {
            Err(Error::ResourceNotFound {
                kind: "LogicVolume".into(),
                name: "*".into(),
            })
        }
        async fn driver_owner(&self, driver_name: &str) -> Result<Option<OwnerReference>> {
            self.0.driver_owner(driver_name).await
        }
    }

    #[tokio::test]
    async fn test_volume_sweep_removes_only_managed_orphans() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(
            LVS,
            "  volume-pvc-a|lsd-ssd|1024|active|-wi-ao----|\n\
             \x20 volume-pvc-gone|lsd-ssd|1024|active|-wi-a-----|\n\
             \x20 thin-pvc-b|lsd-ssd|2048|active|twi-aotz--|\n\
             \x20 volume-pvc-x|system|1024|active|-wi-a-----|\n\
             \x20 root|lsd-ssd|1024||-wi-------|\n",
        )
        .on("lvremove -f lsd-ssd/volume-pvc-gone", "");

        let registry = NodeRegistry::new();
        registry.set_declared_volumes(
            "node-1",
            vec![declared("pvc-a", "lvm"), declared("pvc-b", "lvm"), declared("pvc-gone", "raw")],
        );
        let (reconciler, _dispatcher) = reconciler(exec.clone(), registry);

        let report = reconciler.cleanup_orphan_volumes().await.unwrap();
        assert_eq!(report.removed, vec!["lsd-ssd/volume-pvc-gone".to_string()]);
        assert_eq!(report.kept, 1);
        assert_eq!(report.skipped, 3);
        assert!(!exec.called("lvremove -f system/volume-pvc-x"));
        assert!(!exec.called("lvremove -f lsd-ssd/root"));
    }

    #[tokio::test]
    async fn test_volume_sweep_aborts_without_declarations() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(LVS, "  volume-pvc-gone|lsd-ssd|1024|active|-wi-a-----|\n");
        let cluster = Arc::new(VolumesUnavailable(NodeRegistry::new()));
        let (reconciler, _dispatcher) = reconciler(exec.clone(), cluster);

        assert_matches!(
            reconciler.cleanup_orphan_volumes().await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            reconciler.cleanup_orphan_partitions().await,
            Err(Error::ResourceNotFound { .. })
        );
        assert!(exec.calls().iter().all(|c| !c.starts_with("lvremove")));
    }

    #[tokio::test]
    async fn test_volume_listing_failure_is_empty_sweep() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail(LVS, "lvm not installed");
        let (reconciler, _dispatcher) = reconciler(exec, NodeRegistry::new());

        let report = reconciler.cleanup_orphan_volumes().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.kept + report.skipped, 0);
    }

    #[tokio::test]
    async fn test_partition_sweep_guards_unmanaged_partitions() {
        let kept = partition_name("pvc-raw");
        let orphan = partition_name("pvc-deleted");
        let header = parted_row(["Number", "Start", "End", "Size", "File system", "Name", "Flags"]);
        let listing = format!(
            "{}{}{}{}",
            header,
            parted_row(["1", "1048576B", "2097151B", "1048576B", "", &kept, ""]),
            parted_row(["2", "2097152B", "3145727B", "1048576B", "", &orphan, ""]),
            parted_row(["3", "3145728B", "4194303B", "1048576B", "ext4", "data", ""]),
        );

        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(
            LSBLK,
            "NAME=\"/dev/sdb\" SIZE=\"4194304\" TYPE=\"disk\"\nNAME=\"/dev/sdb1\" SIZE=\"1048576\" TYPE=\"part\" PKNAME=\"/dev/sdb\"\n",
        )
        .on("parted -s /dev/sdb unit B print", &listing)
        .on("parted -s /dev/sdb rm 2", "");

        let registry = NodeRegistry::new();
        registry.set_declared_volumes(
            "node-1",
            vec![declared("pvc-raw", "raw"), declared("pvc-deleted", "lvm")],
        );
        let (reconciler, dispatcher) = reconciler(exec.clone(), registry);
        let mut events = reconciler.events.subscribe();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(dispatcher.run(shutdown_rx));

        let report = reconciler.cleanup_orphan_partitions().await.unwrap();
        assert_eq!(report.removed, vec!["/dev/sdb#2".to_string()]);
        assert_eq!(report.kept, 1);
        assert_eq!(report.skipped, 1);
        assert!(!exec.called("parted -s /dev/sdb rm 3"));
        assert!(!exec.called("parted -s /dev/sdb1 unit B print"));

        assert_eq!(events.recv().await.unwrap().trigger, Trigger::CleanupOrphan);
    }

    #[tokio::test]
    async fn test_partition_sweep_passes_over_blank_disk() {
        let orphan = partition_name("pvc-deleted");
        let listing = format!(
            "{}{}",
            parted_row(["Number", "Start", "End", "Size", "File system", "Name", "Flags"]),
            parted_row(["1", "1048576B", "2097151B", "1048576B", "", &orphan, ""]),
        );

        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(
            LSBLK,
            "NAME=\"/dev/sda\" SIZE=\"4194304\" TYPE=\"disk\"\nNAME=\"/dev/sdb\" SIZE=\"4194304\" TYPE=\"disk\"\n",
        )
        .fail("parted -s /dev/sda unit B print", "Error: /dev/sda: unrecognised disk label")
        .on("parted -s /dev/sdb unit B print", &listing)
        .on("parted -s /dev/sdb rm 1", "");

        let (reconciler, _dispatcher) = reconciler(exec.clone(), NodeRegistry::new());

        let report = reconciler.cleanup_orphan_partitions().await.unwrap();
        assert_eq!(report.removed, vec!["/dev/sdb#1".to_string()]);
        assert_eq!(report.failed, 0);
        assert!(exec.called("parted -s /dev/sdb rm 1"));
    }

    #[tokio::test]
    async fn test_partition_listing_failure_aborts() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(LSBLK, "NAME=\"/dev/sdb\" SIZE=\"4194304\" TYPE=\"disk\"\n")
            .fail("parted -s /dev/sdb unit B print", "device busy");
        let (reconciler, _dispatcher) = reconciler(exec, NodeRegistry::new());

        assert!(reconciler.cleanup_orphan_partitions().await.is_err());
    }
}
