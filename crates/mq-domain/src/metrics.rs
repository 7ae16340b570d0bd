//! Metrics sink port (§6, §4.4). Concrete wiring (Prometheus, statsd, ...)
//! lives outside this crate tree; this module only defines the contract the
//! façade calls into and the names/labels that must stay stable.

use std::collections::BTreeMap;

pub mod names {
    pub const PUBLISH_TOTAL: &str = "mq.publish.total";
    pub const PUBLISH_DURATION: &str = "mq.publish.duration";
    pub const CONSUME_TOTAL: &str = "mq.consume.total";
    pub const HANDLE_DURATION: &str = "mq.handle.duration";
}

pub type Labels = BTreeMap<&'static str, String>;

/// Counter/histogram/gauge primitives a metrics backend must expose.
/// Labels must avoid high-cardinality values (no message IDs, no user IDs);
/// callers inside this crate never pass them.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, labels: &Labels, value: u64);
    fn histogram(&self, name: &'static str, labels: &Labels, value_seconds: f64);
    fn gauge(&self, name: &'static str, labels: &Labels, value: f64);
}

/// Default sink for callers who don't wire one in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &'static str, _labels: &Labels, _value: u64) {}
    fn histogram(&self, _name: &'static str, _labels: &Labels, _value_seconds: f64) {}
    fn gauge(&self, _name: &'static str, _labels: &Labels, _value: f64) {}
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Records every call for assertions in tests; mirrors the atomics-based
    /// `Metrics` struct this workspace already uses for its HTTP façade.
    #[derive(Default)]
    pub struct RecordingMetrics {
        pub counters: Mutex<Vec<(&'static str, Labels, u64)>>,
        pub histograms: Mutex<Vec<(&'static str, Labels, f64)>>,
        pub gauges: Mutex<Vec<(&'static str, Labels, f64)>>,
        pub calls: AtomicU64,
    }

    impl RecordingMetrics {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count_of(&self, name: &'static str) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _, _)| *n == name)
                .map(|(_, _, v)| v)
                .sum()
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn counter(&self, name: &'static str, labels: &Labels, value: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.counters.lock().unwrap().push((name, labels.clone(), value));
        }

        fn histogram(&self, name: &'static str, labels: &Labels, value_seconds: f64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.histograms
                .lock()
                .unwrap()
                .push((name, labels.clone(), value_seconds));
        }

        fn gauge(&self, name: &'static str, labels: &Labels, value: f64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gauges.lock().unwrap().push((name, labels.clone(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingMetrics;
    use super::*;

    #[test]
    fn recording_metrics_tracks_counter_calls() {
        let sink = RecordingMetrics::new();
        let mut labels = Labels::new();
        labels.insert("topic", "orders.created".to_string());
        sink.counter(names::PUBLISH_TOTAL, &labels, 1);
        sink.counter(names::PUBLISH_TOTAL, &labels, 1);
        assert_eq!(sink.count_of(names::PUBLISH_TOTAL), 2);
    }

    #[test]
    fn noop_metrics_never_panics() {
        let sink = NoopMetrics;
        let labels = Labels::new();
        sink.counter(names::CONSUME_TOTAL, &labels, 1);
        sink.histogram(names::HANDLE_DURATION, &labels, 0.5);
        sink.gauge("anything", &labels, 1.0);
    }
}
