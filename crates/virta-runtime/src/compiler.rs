//! Query compilation
//!
//! Turns one [`Query`] description into a [`QueryRuntime`] against a set of
//! known stream and table definitions. Assembly is strictly ordered:
//!
//! 1. resolve the input side into a stream runtime and mutable schema,
//! 2. compile the selection, which derives the output definition,
//! 3. classify the locking discipline,
//! 4. construct the rate limiter, reconcile selector batching, and
//!    register the limiter for context teardown,
//! 5. wire the output callback,
//! 6. reduce the schema and assign final positions,
//! 7. freeze the schema and push it into every stateful operator,
//! 8. install the event populator,
//! 9. finalize snapshot limiters against the frozen schema,
//! 10. arm the rate limiter — always the very last step.
//!
//! Any collaborator failure is normalized at a single catch site into one
//! of the two [`CompileError`] kinds, tagged with the query's name.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::info;

use crate::context::{EternalHolder, ExecutionContext, QueryLock};
use crate::error::CompileError;
use crate::metrics::query_metric_path;
use crate::output::{build_callback, build_rate_limiter, OutputError, OutputRateLimiter};
use crate::populate::build_event_populator;
use crate::query::QueryRuntime;
use crate::schema::{assign_positions, reduce_meta, AttributeRef, SchemaError};
use crate::selector::{build_selector, SelectError};
use crate::stream::{resolve, ResolveError, StreamRuntime};
use crate::table::EventTable;
use virta_core::{OutputEventKind, Query, StreamDefinition};

/// Internal union of collaborator failures, translated at the catch site.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("selection produced no output schema")]
    MissingOutputSchema,
}

impl StepError {
    fn into_compile_error(self, query: Option<&str>) -> CompileError {
        let message = self.to_string();
        let duplicate = matches!(
            self,
            StepError::Resolve(ResolveError::DuplicateDefinition { .. })
        );
        if duplicate {
            CompileError::duplicate_definition(message, query, self)
        } else {
            CompileError::creation(message, query, self)
        }
    }
}

/// Compile a query against the known stream and table definitions.
pub fn compile(
    query: &Query,
    context: &Arc<ExecutionContext>,
    stream_definitions: &FxHashMap<String, StreamDefinition>,
    table_definitions: &FxHashMap<String, StreamDefinition>,
    event_tables: &FxHashMap<String, EventTable>,
) -> Result<QueryRuntime, CompileError> {
    let name = query.name();
    build(
        query,
        context,
        stream_definitions,
        table_definitions,
        event_tables,
    )
    .map_err(|e| e.into_compile_error(name))
}

fn build(
    query: &Query,
    context: &Arc<ExecutionContext>,
    stream_definitions: &FxHashMap<String, StreamDefinition>,
    table_definitions: &FxHashMap<String, StreamDefinition>,
    event_tables: &FxHashMap<String, EventTable>,
) -> Result<QueryRuntime, StepError> {
    // Latency tracking needs both enabled statistics and a query name to
    // build a stable metric path from.
    let latency = match (context.statistics(), query.name()) {
        (Some(stats), Some(q)) => {
            let path = query_metric_path(stats.prefix(), context.name(), q);
            Some(stats.latency_tracker(&path))
        }
        _ => None,
    };

    // Anything other than current-events-only means windows must retain
    // expired copies for downstream consumers.
    let expects_expired = query.output.event_kind != OutputEventKind::CurrentEvents;

    let mut attr_refs: Vec<AttributeRef> = Vec::new();
    let (mut stream_runtime, mut meta) = resolve(
        &query.input,
        context.as_ref(),
        stream_definitions,
        table_definitions,
        event_tables,
        &mut attr_refs,
        latency,
        expects_expired,
    )?;

    let mut selector = build_selector(&query.selection, &query.output, &mut meta, &mut attr_refs)?;

    let lock = classify_lock(query, &stream_runtime);

    let windowed = query.input.has_window() || stream_runtime.is_join();
    let rate_limiter = build_rate_limiter(
        &query.output.target,
        query.rate.as_ref(),
        query.selection.has_grouping(),
        windowed,
        context.as_ref(),
    );
    rate_limiter.reconcile_batching(&mut selector);
    // Registered exactly once, and before the limiter is armed: teardown
    // must be able to reach it even if later steps fail.
    context.add_eternal_holder(Arc::clone(&rate_limiter) as Arc<dyn EternalHolder>);

    let output_definition = meta
        .output_definition()
        .cloned()
        .ok_or(StepError::MissingOutputSchema)?;
    let callback = build_callback(
        &query.output,
        &output_definition,
        event_tables,
        stream_runtime.is_join(),
    )?;

    reduce_meta(&mut meta);
    assign_positions(&meta, &mut attr_refs)?;

    // Schema frozen from here on; operators only ever see the shared copy.
    let meta = Arc::new(meta);
    let attribute_refs: Arc<[AttributeRef]> = attr_refs.into();
    stream_runtime.init(&meta, &attribute_refs, lock.as_ref());
    selector.set_event_populator(build_event_populator(&meta));

    let mut runtime = QueryRuntime {
        query: query.clone(),
        context: Arc::clone(context),
        stream_runtime,
        selector,
        rate_limiter: Arc::clone(&rate_limiter),
        callback,
        meta: Arc::clone(&meta),
        attribute_refs,
        lock: lock.clone(),
    };

    finalize_rate_limiter(&rate_limiter, &mut runtime, lock.as_ref());

    info!(
        query = runtime.name().unwrap_or("<unnamed>"),
        context = %context.name(),
        join = runtime.stream_runtime().is_join(),
        locked = runtime.has_lock(),
        "query compiled"
    );
    Ok(runtime)
}

/// Decide whether the query's stateful operators share a lock.
///
/// An explicit `@synchronized` annotation wins: any value other than
/// (case-insensitive) `false` forces the lock. Absent the annotation, a
/// lock is inferred whenever the query keeps cross-event state — a join,
/// or any window.
fn classify_lock(query: &Query, stream_runtime: &StreamRuntime) -> Option<QueryLock> {
    let needs_lock = match query.annotation_element("synchronized", None) {
        Some(element) => !element.value.eq_ignore_ascii_case("false"),
        None => stream_runtime.is_join() || query.input.has_window(),
    };
    needs_lock.then(|| Arc::new(Mutex::new(())))
}

/// Last two wiring steps: snapshot finalization, then arming the limiter.
///
/// Snapshot limiters get the frozen output schema and the selector's live
/// processor list; the selector's batching disable is re-applied on the
/// way. `init` runs unconditionally afterwards and nothing may touch the
/// limiter's wiring after it.
fn finalize_rate_limiter(
    rate_limiter: &Arc<OutputRateLimiter>,
    runtime: &mut QueryRuntime,
    lock: Option<&QueryLock>,
) {
    if rate_limiter.is_snapshot() {
        let output_width = runtime
            .meta()
            .output_definition()
            .map(|d| d.attributes.len())
            .unwrap_or(0);
        let processors = runtime.selector().attribute_processors().to_vec();
        let meta = Arc::clone(runtime.meta());
        rate_limiter.finalize_snapshot(output_width, processors, meta, runtime.selector_mut());
    }
    rate_limiter.init(lock);
}
