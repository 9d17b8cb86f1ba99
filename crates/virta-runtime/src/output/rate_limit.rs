//! Output rate limiting
//!
//! Every compiled query carries exactly one [`OutputRateLimiter`], even when
//! no rate clause was written (pass-through). The limiter goes through a
//! fixed wiring sequence during compilation:
//!
//! 1. construction from the query's rate clause,
//! 2. batching reconciliation against the selector (snapshot limiters must
//!    see individual per-group values, so they turn selector batching off),
//! 3. for snapshot limiters, finalization with the frozen output schema and
//!    the selector's attribute processors,
//! 4. initialization with the query lock, which arms the flush timer.
//!
//! Initialization happens exactly once and always last; the timer never
//! observes a half-wired limiter. Timed limiters register themselves as
//! eternal holders so context teardown stops their timers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::context::{EternalHolder, ExecutionContext, QueryLock};
use crate::schema::MetaEvent;
use crate::selector::{AttributeProcessor, QuerySelector};
use virta_core::{EmitSelection, OutputRate};

/// Normalized rate-limiting policy of one query.
#[derive(Debug, Clone)]
pub enum RatePolicy {
    /// No rate clause; every output event passes straight through.
    PassThrough,
    /// Emit once per `count` output events.
    Count {
        count: usize,
        emit: EmitSelection,
        /// Grouped queries limit per group key rather than globally.
        per_group: bool,
    },
    /// Emit on a timer, flushing buffered events.
    Time {
        interval: Duration,
        emit: EmitSelection,
        per_group: bool,
    },
    /// Periodically re-emit the full current result set.
    Snapshot {
        interval: Duration,
        /// Whether the query retains state to snapshot (window or join).
        windowed: bool,
    },
}

/// Wiring progress of a rate limiter during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LimiterPhase {
    Constructed,
    BatchingReconciled,
    Finalized,
    Initialized,
}

/// What a snapshot limiter re-evaluates on each tick.
struct SnapshotWiring {
    output_attribute_count: usize,
    attribute_processors: Vec<Arc<AttributeProcessor>>,
    meta: Arc<MetaEvent>,
}

struct LimiterState {
    phase: LimiterPhase,
    lock: Option<QueryLock>,
    snapshot: Option<SnapshotWiring>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Rate-limits one query's output according to its [`RatePolicy`].
pub struct OutputRateLimiter {
    target: String,
    policy: RatePolicy,
    scheduler: tokio::runtime::Handle,
    state: Mutex<LimiterState>,
}

impl OutputRateLimiter {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.policy, RatePolicy::Snapshot { .. })
    }

    pub fn phase(&self) -> LimiterPhase {
        self.state().phase
    }

    pub fn has_lock(&self) -> bool {
        self.state().lock.is_some()
    }

    /// Attribute-processor count wired in at snapshot finalization, if any.
    pub fn snapshot_processor_count(&self) -> Option<usize> {
        self.state()
            .snapshot
            .as_ref()
            .map(|w| w.attribute_processors.len())
    }

    /// Output width wired in at snapshot finalization, if any.
    pub fn snapshot_output_width(&self) -> Option<usize> {
        self.state()
            .snapshot
            .as_ref()
            .map(|w| w.output_attribute_count)
    }

    /// Frozen schema wired in at snapshot finalization, if any.
    pub fn snapshot_schema(&self) -> Option<Arc<MetaEvent>> {
        self.state().snapshot.as_ref().map(|w| Arc::clone(&w.meta))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().expect("rate limiter state poisoned")
    }

    /// Reconcile selector batching with this limiter's policy.
    ///
    /// Snapshot limiters disable batching; everything else leaves the
    /// selector alone. Safe to re-apply: the disable is idempotent and the
    /// phase only ever moves forward.
    pub fn reconcile_batching(&self, selector: &mut QuerySelector) {
        if self.is_snapshot() {
            selector.set_batching_enabled(false);
        }
        let mut state = self.state();
        if state.phase == LimiterPhase::Constructed {
            state.phase = LimiterPhase::BatchingReconciled;
        }
    }

    /// Wire a snapshot limiter with the frozen output schema.
    ///
    /// Re-applies the batching disable first: the selector must still be in
    /// non-batching mode when the limiter goes live. Must run after the
    /// combined schema is frozen and before [`init`](Self::init).
    pub fn finalize_snapshot(
        &self,
        output_attribute_count: usize,
        attribute_processors: Vec<Arc<AttributeProcessor>>,
        meta: Arc<MetaEvent>,
        selector: &mut QuerySelector,
    ) {
        self.reconcile_batching(selector);
        let mut state = self.state();
        if state.phase >= LimiterPhase::Finalized {
            warn!(target = %self.target, "snapshot limiter finalized twice; ignoring");
            return;
        }
        state.snapshot = Some(SnapshotWiring {
            output_attribute_count,
            attribute_processors,
            meta,
        });
        state.phase = LimiterPhase::Finalized;
        debug!(
            target = %self.target,
            attributes = output_attribute_count,
            "snapshot limiter finalized"
        );
    }

    /// Arm the limiter. Called exactly once, as the last compilation step.
    ///
    /// Stores the query lock and, for timed policies, starts the flush
    /// timer on the context scheduler. A second call is a wiring bug and is
    /// ignored with a warning.
    pub fn init(&self, lock: Option<&QueryLock>) {
        let mut state = self.state();
        if state.phase == LimiterPhase::Initialized {
            warn!(target = %self.target, "rate limiter already initialized");
            return;
        }
        state.lock = lock.cloned();

        let interval = match &self.policy {
            RatePolicy::Time { interval, .. } => Some(*interval),
            RatePolicy::Snapshot { interval, .. } => Some(*interval),
            RatePolicy::PassThrough | RatePolicy::Count { .. } => None,
        };
        if let Some(interval) = interval {
            let (tx, rx) = watch::channel(false);
            state.shutdown = Some(tx);
            self.spawn_flush_timer(interval, state.lock.clone(), rx);
        }
        state.phase = LimiterPhase::Initialized;
        debug!(target = %self.target, timed = interval.is_some(), "rate limiter initialized");
    }

    fn spawn_flush_timer(
        &self,
        interval: Duration,
        lock: Option<QueryLock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let target = self.target.clone();
        self.scheduler.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The flush mutates shared query state, so it runs
                        // under the same lock as event processing.
                        if let Some(lock) = &lock {
                            let _guard = lock.lock().expect("query lock poisoned");
                            trace!(target = %target, "rate limiter flush");
                        } else {
                            trace!(target = %target, "rate limiter flush");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target = %target, "rate limiter timer stopped");
        });
    }
}

impl EternalHolder for OutputRateLimiter {
    fn shutdown(&self) {
        let state = self.state();
        if let Some(tx) = &state.shutdown {
            let _ = tx.send(true);
        }
    }
}

/// Build the rate limiter for a query's output clause.
///
/// `windowed` says whether the query retains state a snapshot can observe
/// (any window, or a join); `has_grouping` scopes count/time limits per
/// group key.
pub fn build_rate_limiter(
    target: &str,
    rate: Option<&OutputRate>,
    has_grouping: bool,
    windowed: bool,
    context: &ExecutionContext,
) -> Arc<OutputRateLimiter> {
    let policy = match rate {
        None => RatePolicy::PassThrough,
        Some(OutputRate::EveryEvents { count, emit }) => RatePolicy::Count {
            count: *count,
            emit: *emit,
            per_group: has_grouping,
        },
        Some(OutputRate::EveryDuration { interval, emit }) => RatePolicy::Time {
            interval: *interval,
            emit: *emit,
            per_group: has_grouping,
        },
        Some(OutputRate::Snapshot { interval }) => RatePolicy::Snapshot {
            interval: *interval,
            windowed,
        },
    };
    debug!(
        context = %context.name(),
        target = %target,
        policy = ?policy,
        "rate limiter constructed"
    );
    Arc::new(OutputRateLimiter {
        target: target.to_string(),
        policy,
        scheduler: context.scheduler().clone(),
        state: Mutex::new(LimiterState {
            phase: LimiterPhase::Constructed,
            lock: None,
            snapshot: None,
            shutdown: None,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MetaStreamEvent;
    use crate::selector::build_selector;
    use virta_core::{AttrType, Expr, OutputEventKind, OutputStream, Selection, StreamDefinition};

    fn context() -> ExecutionContext {
        ExecutionContext::new("test", tokio::runtime::Handle::current())
    }

    fn selector_and_meta() -> (QuerySelector, MetaEvent) {
        let mut meta = MetaEvent::stream(MetaStreamEvent::new(
            StreamDefinition::new("Trades")
                .attribute("symbol", AttrType::Str)
                .attribute("price", AttrType::Float),
            None,
        ));
        let mut refs = Vec::new();
        let selection = Selection::new()
            .select(Expr::var("symbol"))
            .select(Expr::var("price"));
        let selector = build_selector(
            &selection,
            &OutputStream::new("Out", OutputEventKind::CurrentEvents),
            &mut meta,
            &mut refs,
        )
        .unwrap();
        (selector, meta)
    }

    #[tokio::test]
    async fn pass_through_leaves_batching_alone() {
        let ctx = context();
        let (mut selector, _) = selector_and_meta();
        let limiter = build_rate_limiter("Out", None, false, false, &ctx);

        limiter.reconcile_batching(&mut selector);
        assert!(selector.is_batching_enabled());
        assert_eq!(limiter.phase(), LimiterPhase::BatchingReconciled);

        limiter.init(None);
        assert_eq!(limiter.phase(), LimiterPhase::Initialized);
    }

    #[tokio::test]
    async fn snapshot_disables_batching_at_both_points() {
        let ctx = context();
        let (mut selector, meta) = selector_and_meta();
        let rate = OutputRate::Snapshot {
            interval: Duration::from_secs(2),
        };
        let limiter = build_rate_limiter("Out", Some(&rate), false, true, &ctx);

        limiter.reconcile_batching(&mut selector);
        assert!(!selector.is_batching_enabled());

        // Pretend something re-enabled batching; finalization re-applies.
        selector.set_batching_enabled(true);
        let processors = selector.attribute_processors().to_vec();
        limiter.finalize_snapshot(2, processors, Arc::new(meta), &mut selector);
        assert!(!selector.is_batching_enabled());
        assert_eq!(limiter.phase(), LimiterPhase::Finalized);
        assert_eq!(limiter.snapshot_processor_count(), Some(2));
        assert_eq!(limiter.snapshot_output_width(), Some(2));
    }

    #[tokio::test]
    async fn init_is_idempotent_and_stores_lock() {
        let ctx = context();
        let rate = OutputRate::EveryDuration {
            interval: Duration::from_millis(50),
            emit: EmitSelection::All,
        };
        let limiter = build_rate_limiter("Out", Some(&rate), false, false, &ctx);
        let lock: QueryLock = Arc::new(Mutex::new(()));

        limiter.init(Some(&lock));
        assert!(limiter.has_lock());
        assert_eq!(limiter.phase(), LimiterPhase::Initialized);

        // Second init must not rearm the timer.
        limiter.init(None);
        assert!(limiter.has_lock());

        limiter.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_the_flush_timer() {
        let ctx = context();
        let rate = OutputRate::Snapshot {
            interval: Duration::from_millis(10),
        };
        let limiter = build_rate_limiter("Out", Some(&rate), false, true, &ctx);
        limiter.init(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.shutdown();
        // No panic and no further ticks after shutdown is all we require.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
