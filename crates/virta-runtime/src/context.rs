//! Execution context shared by all queries of one deployed plan
//!
//! One [`ExecutionContext`] is created per deployed query set and outlives
//! every query compiled against it. Compilation reads from it (name,
//! statistics, scheduler handle) and registers long-lived objects into its
//! holder registry so they can be notified on undeploy.

use crate::metrics::StatisticsManager;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Mutual-exclusion lock guarding a query's stateful operators.
///
/// Created at most once per query; shared (never cloned into independent
/// locks) by every operator that mutates cross-event state.
pub type QueryLock = Arc<Mutex<()>>;

/// An object that must be notified when the execution context is torn down.
pub trait EternalHolder: Send + Sync {
    fn shutdown(&self);
}

/// Process-wide context for one deployed query set.
pub struct ExecutionContext {
    name: String,
    statistics: Option<StatisticsManager>,
    scheduler: tokio::runtime::Handle,
    eternal_holders: Mutex<Vec<Arc<dyn EternalHolder>>>,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>, scheduler: tokio::runtime::Handle) -> Self {
        Self {
            name: name.into(),
            statistics: None,
            scheduler,
            eternal_holders: Mutex::new(Vec::new()),
        }
    }

    /// Enable statistics collection for queries compiled in this context.
    pub fn with_statistics(mut self, statistics: StatisticsManager) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats_enabled(&self) -> bool {
        self.statistics.is_some()
    }

    pub fn statistics(&self) -> Option<&StatisticsManager> {
        self.statistics.as_ref()
    }

    /// Scheduler handle for time-based rate limiting and eviction timers.
    pub fn scheduler(&self) -> &tokio::runtime::Handle {
        &self.scheduler
    }

    /// Register an object for teardown notification.
    ///
    /// Safe to call concurrently from compilations of different queries
    /// against the same context.
    pub fn add_eternal_holder(&self, holder: Arc<dyn EternalHolder>) {
        self.eternal_holders
            .lock()
            .expect("eternal holder registry poisoned")
            .push(holder);
    }

    /// Number of registered holders.
    pub fn eternal_holder_count(&self) -> usize {
        self.eternal_holders
            .lock()
            .expect("eternal holder registry poisoned")
            .len()
    }

    /// Whether this exact holder instance is registered, and how many times.
    pub fn holder_registrations(&self, holder: &Arc<dyn EternalHolder>) -> usize {
        self.eternal_holders
            .lock()
            .expect("eternal holder registry poisoned")
            .iter()
            .filter(|h| Arc::ptr_eq(h, holder))
            .count()
    }

    /// Notify every registered holder that the context is going away.
    pub fn shutdown(&self) {
        let holders = {
            let mut guard = self
                .eternal_holders
                .lock()
                .expect("eternal holder registry poisoned");
            std::mem::take(&mut *guard)
        };
        for holder in &holders {
            holder.shutdown();
        }
        info!(
            context = %self.name,
            holders = holders.len(),
            "execution context shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHolder {
        shutdowns: AtomicUsize,
    }

    impl EternalHolder for CountingHolder {
        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn holder_registry_and_shutdown() {
        let ctx = ExecutionContext::new("plan", tokio::runtime::Handle::current());
        let holder = Arc::new(CountingHolder {
            shutdowns: AtomicUsize::new(0),
        });
        ctx.add_eternal_holder(holder.clone());
        assert_eq!(ctx.eternal_holder_count(), 1);

        ctx.shutdown();
        assert_eq!(holder.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.eternal_holder_count(), 0);
    }

    #[tokio::test]
    async fn stats_toggle_follows_manager_presence() {
        let ctx = ExecutionContext::new("plan", tokio::runtime::Handle::current());
        assert!(!ctx.stats_enabled());

        let ctx = ctx.with_statistics(StatisticsManager::new("virta"));
        assert!(ctx.stats_enabled());
        assert_eq!(ctx.statistics().unwrap().prefix(), "virta");
    }
}
