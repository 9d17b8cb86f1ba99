//! Prometheus statistics for compiled queries

use prometheus::{Histogram, HistogramOpts, HistogramVec, Registry};
use std::sync::Arc;
use std::time::Duration;

/// Separator between metric path segments.
pub const METRIC_DELIMITER: &str = ".";
/// Fixed infix identifying the execution-plan scope.
pub const METRIC_INFIX_EXECUTION_PLANS: &str = "execution_plans";
/// Fixed infix identifying the per-query scope.
pub const METRIC_INFIX_QUERIES: &str = "queries";

/// Build the dotted metric path for one query's latency tracker.
///
/// Layout: `<prefix>.execution_plans.<context>.queries.<query>`.
pub fn query_metric_path(prefix: &str, context_name: &str, query_name: &str) -> String {
    [
        prefix,
        METRIC_INFIX_EXECUTION_PLANS,
        context_name,
        METRIC_INFIX_QUERIES,
        query_name,
    ]
    .join(METRIC_DELIMITER)
}

/// Process-wide statistics manager.
///
/// Owns the prometheus registry and the latency histogram family. Latency
/// trackers are labeled views into that family, so creating one per query
/// never collides on registration.
#[derive(Clone)]
pub struct StatisticsManager {
    registry: Arc<Registry>,
    prefix: String,
    query_latency: HistogramVec,
}

impl StatisticsManager {
    pub fn new(prefix: impl Into<String>) -> Self {
        let registry = Registry::new();

        let query_latency = HistogramVec::new(
            HistogramOpts::new("virta_query_latency_seconds", "Per-query processing latency")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["query"],
        )
        .expect("failed to create query_latency histogram");

        registry
            .register(Box::new(query_latency.clone()))
            .expect("failed to register query_latency");

        Self {
            registry: Arc::new(registry),
            prefix: prefix.into(),
            query_latency,
        }
    }

    /// The process-wide metric prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create a latency tracker for the given metric path.
    pub fn latency_tracker(&self, metric_path: &str) -> LatencyTracker {
        LatencyTracker {
            name: metric_path.to_string(),
            histogram: self.query_latency.with_label_values(&[metric_path]),
        }
    }
}

/// Records processing latency for one compiled query.
#[derive(Clone)]
pub struct LatencyTracker {
    name: String,
    histogram: Histogram,
}

impl LatencyTracker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self, elapsed: Duration) {
        self.histogram.observe(elapsed.as_secs_f64());
    }

    /// Start a timer; latency is observed when the returned guard drops.
    pub fn time(&self) -> prometheus::HistogramTimer {
        self.histogram.start_timer()
    }
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_path_layout() {
        assert_eq!(
            query_metric_path("virta", "plan1", "Q1"),
            "virta.execution_plans.plan1.queries.Q1"
        );
    }

    #[test]
    fn latency_tracker_records() {
        let stats = StatisticsManager::new("virta");
        let tracker = stats.latency_tracker(&query_metric_path("virta", "p", "q"));
        tracker.record(Duration::from_millis(2));
        assert_eq!(tracker.name(), "virta.execution_plans.p.queries.q");
    }

    #[test]
    fn two_queries_do_not_collide() {
        let stats = StatisticsManager::new("virta");
        let a = stats.latency_tracker("virta.execution_plans.p.queries.a");
        let b = stats.latency_tracker("virta.execution_plans.p.queries.b");
        a.record(Duration::from_millis(1));
        b.record(Duration::from_millis(1));
    }
}
