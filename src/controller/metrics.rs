//! Prometheus metrics for the CAPVCD controllers
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `capvcd_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `capvcd_reconcile_errors_total` (counter): reconcile errors labeled by controller and class.
//! - `capvcd_platform_tasks_total` (counter): platform tasks followed, labeled by kind and outcome.
//! - `capvcd_machines` (gauge): VCDMachines last seen in each phase.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, "vcdcluster" or "vcdmachine"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Retry class: transient, conflict, terminal or timeout
    pub class: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub kind: String,
    /// success, error or timeout
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~160s; a reconcile may follow platform tasks up to its deadline
        Histogram::new(exponential_buckets(0.01, 2.0, 15))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PLATFORM_TASKS_TOTAL: Lazy<Family<TaskLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static MACHINES_BY_PHASE: Lazy<Family<PhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "capvcd_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "capvcd_reconcile_errors",
        "Total number of reconcile errors by retry class",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "capvcd_platform_tasks",
        "Cloud Director tasks followed to completion or deadline",
        PLATFORM_TASKS_TOTAL.clone(),
    );
    registry.register(
        "capvcd_machines",
        "VCDMachines by lifecycle phase",
        MACHINES_BY_PHASE.clone(),
    );
    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, class: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        class: class.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_platform_task(kind: &str, outcome: &str) {
    let labels = TaskLabels {
        kind: kind.to_string(),
        outcome: outcome.to_string(),
    };
    PLATFORM_TASKS_TOTAL.get_or_create(&labels).inc();
}

/// Move one machine between phase gauges
pub fn record_machine_phase(previous: Option<&str>, current: &str) {
    if previous == Some(current) {
        return;
    }
    if let Some(previous) = previous {
        MACHINES_BY_PHASE
            .get_or_create(&PhaseLabels {
                phase: previous.to_string(),
            })
            .dec();
    }
    MACHINES_BY_PHASE
        .get_or_create(&PhaseLabels {
            phase: current.to_string(),
        })
        .inc();
}

/// Drop a machine that no longer exists from its phase gauge
pub fn forget_machine_phase(phase: &str) {
    MACHINES_BY_PHASE
        .get_or_create(&PhaseLabels {
            phase: phase.to_string(),
        })
        .dec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_controller_metrics() {
        observe_reconcile_duration_seconds("vcdcluster", 0.25);
        inc_reconcile_error("vcdmachine", "transient");
        inc_platform_task("vm", "success");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("capvcd_reconcile_duration_seconds"));
        assert!(buffer.contains("capvcd_reconcile_errors_total"));
        assert!(buffer.contains("class=\"transient\""));
        assert!(buffer.contains("capvcd_platform_tasks_total"));
    }

    #[test]
    fn test_machine_phase_moves_between_gauges() {
        record_machine_phase(None, "Pending");
        record_machine_phase(Some("Pending"), "Provisioning");
        let provisioning = MACHINES_BY_PHASE
            .get_or_create(&PhaseLabels {
                phase: "Provisioning".to_string(),
            })
            .get();
        assert!(provisioning >= 1);
    }
}
