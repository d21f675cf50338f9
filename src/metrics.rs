//! Prometheus metrics for checker runs
//!
//! Every gauge is labeled by `instance_id`, matching how operators slice
//! the dashboards. Gauges are registered once into a crate-local registry;
//! embedding daemons can merge it into their own exposition endpoint via
//! [`registry`].

use once_cell::sync::OnceCell;
use prometheus::{IntGaugeVec, Opts, Registry};

/// Per-instance gauges published by checker runs.
pub struct CheckerMetrics {
    registry: Registry,

    /// Rowset metas visited by the last forward check
    pub num_scanned: IntGaugeVec,

    /// Rowset metas with at least one segment
    pub num_scanned_with_segment: IntGaugeVec,

    /// Divergences found by the last check run
    pub num_check_failed: IntGaugeVec,

    /// Bytes observed across tablet listings
    pub instance_volume: IntGaugeVec,

    /// Wall-clock seconds of the last forward check
    pub check_cost_s: IntGaugeVec,

    /// Seconds an instance waited between enqueue and worker pickup
    pub enqueue_cost_s: IntGaugeVec,

    /// Epoch ms of the last successful check, as read from the job record
    pub last_success_time_ms: IntGaugeVec,
}

static METRICS: OnceCell<CheckerMetrics> = OnceCell::new();

fn instance_gauge(registry: &Registry, name: &str, help: &str) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["instance_id"])
        .expect("failed to create gauge");
    registry
        .register(Box::new(gauge.clone()))
        .expect("failed to register gauge");
    gauge
}

/// Get the process-wide checker metrics, initializing on first use.
pub fn metrics() -> &'static CheckerMetrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();
        CheckerMetrics {
            num_scanned: instance_gauge(
                &registry,
                "parallax_checker_num_scanned",
                "Rowset metas visited by the last forward check",
            ),
            num_scanned_with_segment: instance_gauge(
                &registry,
                "parallax_checker_num_scanned_with_segment",
                "Rowset metas with at least one segment",
            ),
            num_check_failed: instance_gauge(
                &registry,
                "parallax_checker_num_check_failed",
                "Divergences found by the last check run",
            ),
            instance_volume: instance_gauge(
                &registry,
                "parallax_checker_instance_volume",
                "Bytes observed across tablet listings",
            ),
            check_cost_s: instance_gauge(
                &registry,
                "parallax_checker_check_cost_seconds",
                "Wall-clock seconds of the last forward check",
            ),
            enqueue_cost_s: instance_gauge(
                &registry,
                "parallax_checker_enqueue_cost_seconds",
                "Seconds between enqueue and worker pickup",
            ),
            last_success_time_ms: instance_gauge(
                &registry,
                "parallax_checker_last_success_time_ms",
                "Epoch ms of the last successful check",
            ),
            registry,
        }
    })
}

/// The registry holding all checker gauges.
pub fn registry() -> &'static Registry {
    &metrics().registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_record_per_instance() {
        let m = metrics();
        m.num_scanned.with_label_values(&["inst-a"]).set(6);
        m.num_scanned.with_label_values(&["inst-b"]).set(3);

        assert_eq!(m.num_scanned.with_label_values(&["inst-a"]).get(), 6);
        assert_eq!(m.num_scanned.with_label_values(&["inst-b"]).get(), 3);
    }

    #[test]
    fn registry_exposes_families() {
        let m = metrics();
        m.num_check_failed.with_label_values(&["inst-c"]).set(1);

        let families = registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "parallax_checker_num_check_failed"));
    }
}
