//! Operator Metrics
//!
//! Prometheus counters registered in the default registry and served by the
//! metrics endpoint. Registration failures fall back to an unregistered
//! metric so recording never panics.

use prometheus::{IntCounterVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

static RECONCILE_PASSES: OnceLock<IntCounterVec> = OnceLock::new();
static PLACEMENTS: OnceLock<IntCounterVec> = OnceLock::new();
static ORPHANS_REMOVED: OnceLock<IntCounterVec> = OnceLock::new();

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("metric opts should be valid");
    match prometheus::register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register metric, using unregistered fallback");
            counter
        }
    }
}

/// Inventory and sweep passes, by loop and outcome
pub fn reconcile_passes() -> &'static IntCounterVec {
    RECONCILE_PASSES.get_or_init(|| {
        counter_vec(
            "local_storage_reconcile_passes_total",
            "Reconcile passes by loop and outcome",
            &["loop", "outcome"],
        )
    })
}

/// Placement decisions, by operation and outcome
pub fn placements() -> &'static IntCounterVec {
    PLACEMENTS.get_or_init(|| {
        counter_vec(
            "local_storage_placements_total",
            "Placement decisions by operation and outcome",
            &["operation", "outcome"],
        )
    })
}

/// Orphaned artifacts removed, by kind
pub fn orphans_removed() -> &'static IntCounterVec {
    ORPHANS_REMOVED.get_or_init(|| {
        counter_vec(
            "local_storage_orphans_removed_total",
            "Orphaned logical volumes and partitions removed",
            &["kind"],
        )
    })
}

/// Count one reconcile pass
pub fn record_pass(loop_name: &str, ok: bool) {
    reconcile_passes()
        .with_label_values(&[loop_name, outcome(ok)])
        .inc();
}

/// Count one placement decision
pub fn record_placement(operation: &str, ok: bool) {
    placements()
        .with_label_values(&[operation, outcome(ok)])
        .inc();
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

/// Register every metric up front so they show in the first scrape
pub fn init() {
    reconcile_passes();
    placements();
    orphans_removed();
}
