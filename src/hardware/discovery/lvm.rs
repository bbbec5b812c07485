//! LVM Inventory
//!
//! Reads volume groups, physical volumes and logical volumes from the LVM
//! reporting tools and removes logical volumes.

use crate::crd::{PvInfo, VgGroup};
use crate::domain::ports::CommandExecutorRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const REPORT_ARGS: [&str; 5] = ["--noheadings", "--separator", "|", "--units", "b"];

/// One local logical volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvInfo {
    pub lv_name: String,
    pub vg_name: String,
    pub lv_size: u64,
    /// Activation state; `active` when healthy
    pub lv_active: String,
    pub lv_attr: String,
    pub pool_lv: String,
}

impl LvInfo {
    pub fn is_active(&self) -> bool {
        self.lv_active == "active"
    }
}

fn report_rows(output: &str, columns: usize) -> impl Iterator<Item = Vec<String>> + '_ {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(move |line| {
            let fields: Vec<String> = line.split('|').map(|f| f.trim().to_string()).collect();
            if fields.len() < columns {
                warn!("Skipping short LVM report row {:?}", line);
                return None;
            }
            Some(fields)
        })
}

fn number(field: &str) -> u64 {
    field.trim_end_matches('B').parse().unwrap_or(0)
}

/// Parse `vgs -o vg_name,pv_count,lv_count,snap_count,vg_attr,vg_size,vg_free`
pub fn parse_vgs(output: &str) -> Vec<VgGroup> {
    report_rows(output, 7)
        .map(|f| VgGroup {
            vg_name: f[0].clone(),
            pv_count: number(&f[1]),
            lv_count: number(&f[2]),
            snap_count: number(&f[3]),
            vg_attr: f[4].clone(),
            vg_size: number(&f[5]),
            vg_free: number(&f[6]),
            ..Default::default()
        })
        .collect()
}

/// Parse `pvs -o pv_name,vg_name,pv_fmt,pv_attr,pv_size,pv_free`
pub fn parse_pvs(output: &str) -> Vec<PvInfo> {
    report_rows(output, 6)
        .map(|f| PvInfo {
            pv_name: f[0].clone(),
            vg_name: f[1].clone(),
            pv_fmt: f[2].clone(),
            pv_attr: f[3].clone(),
            pv_size: number(&f[4]),
            pv_free: number(&f[5]),
        })
        .collect()
}

/// Parse `lvs -o lv_name,vg_name,lv_size,lv_active,lv_attr,pool_lv`
pub fn parse_lvs(output: &str) -> Vec<LvInfo> {
    report_rows(output, 6)
        .map(|f| LvInfo {
            lv_name: f[0].clone(),
            vg_name: f[1].clone(),
            lv_size: number(&f[2]),
            lv_active: f[3].clone(),
            lv_attr: f[4].clone(),
            pool_lv: f[5].clone(),
        })
        .collect()
}

/// LVM operations through the command executor
#[derive(Clone)]
pub struct LvmManager {
    executor: CommandExecutorRef,
}

impl LvmManager {
    pub fn new(executor: CommandExecutorRef) -> Self {
        Self { executor }
    }

    async fn report(&self, tool: &str, columns: &str) -> Result<String> {
        let mut args: Vec<&str> = REPORT_ARGS.to_vec();
        args.extend_from_slice(&["--nosuffix", "-o", columns]);
        self.executor.execute(tool, &args).await
    }

    /// Volume groups with their physical volumes attached
    pub async fn current_vgs(&self) -> Result<Vec<VgGroup>> {
        let vgs = parse_vgs(
            &self
                .report("vgs", "vg_name,pv_count,lv_count,snap_count,vg_attr,vg_size,vg_free")
                .await?,
        );
        let pvs = parse_pvs(
            &self
                .report("pvs", "pv_name,vg_name,pv_fmt,pv_attr,pv_size,pv_free")
                .await?,
        );

        Ok(vgs
            .into_iter()
            .map(|mut vg| {
                vg.pvs = pvs
                    .iter()
                    .filter(|pv| pv.vg_name == vg.vg_name)
                    .cloned()
                    .collect();
                vg.pv_name = vg.pvs.first().map(|pv| pv.pv_name.clone()).unwrap_or_default();
                vg
            })
            .collect())
    }

    /// All logical volumes on the node
    pub async fn list_volumes(&self) -> Result<Vec<LvInfo>> {
        let output = self
            .report("lvs", "lv_name,vg_name,lv_size,lv_active,lv_attr,pool_lv")
            .await?;
        Ok(parse_lvs(&output))
    }

    /// Remove a logical volume
    pub async fn delete_volume(&self, vg_name: &str, lv_name: &str) -> Result<()> {
        let target = format!("{}/{}", vg_name, lv_name);
        info!("Removing logical volume {}", target);
        self.executor
            .execute("lvremove", &["-f", &target])
            .await
            .map(|_| ())
            .map_err(|e| Error::device(target.clone(), e))
    }
}
