//! Prometheus metrics for the storage layer.
//!
//! Metrics live in [`REGISTRY`]; the HTTP layer that serves `/metrics` gathers it.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Reports committed to the database
    pub static ref WRITTEN_REPORTS_TOTAL: IntCounter = IntCounter::new(
        "aggregator_written_reports_total",
        "Total reports written to the storage"
    ).expect("metric can be created");

    /// Reports rejected as not newer than the stored one
    pub static ref STALE_REPORTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aggregator_stale_reports_total", "Total reports rejected as stale"),
        &["check"]
    ).expect("metric can be created");

    /// Transport messages recorded as consumer errors
    pub static ref CONSUMER_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "aggregator_consumer_errors_total",
        "Total consumer errors recorded"
    ).expect("metric can be created");
}

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(WRITTEN_REPORTS_TOTAL.clone()),
            Box::new(STALE_REPORTS_TOTAL.clone()),
            Box::new(CONSUMER_ERRORS_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "unable to register storage metric");
            }
        }
    });
}

pub(crate) fn stale_report(check: &str) {
    STALE_REPORTS_TOTAL.with_label_values(&[check]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init();
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"aggregator_written_reports_total".to_string()));
        assert!(names.contains(&"aggregator_consumer_errors_total".to_string()));
    }

    #[test]
    fn test_stale_counter_labels() {
        let before = STALE_REPORTS_TOTAL.with_label_values(&["cache"]).get();
        stale_report("cache");
        assert_eq!(STALE_REPORTS_TOTAL.with_label_values(&["cache"]).get(), before + 1);
    }
}
