//! Stream resolution
//!
//! Builds the input-side runtime of a query from its input-stream
//! description: one [`SingleStreamRuntime`] per source, chained filter and
//! window processors in handler order, and a [`JoinStreamRuntime`] wrapping
//! both sides of a join. Resolution owns no positions — processors are
//! wired with the finalized schema, position table and lock later, through
//! [`StreamRuntime::init`].

use crate::context::{ExecutionContext, QueryLock};
use crate::expr::{resolve_expr, CompiledExpr, ExprError, ResolveScope};
use crate::metrics::LatencyTracker;
use crate::schema::{AttributeRef, MetaEvent, MetaStreamEvent};
use crate::table::EventTable;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use virta_core::{
    InputStream, JoinKind, SingleInputStream, StreamDefinition, StreamHandler, WindowSpec,
};

/// Errors raised while resolving the input side of a query.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("'{id}' is defined as both a stream and a table")]
    DuplicateDefinition { id: String },
    #[error("unknown stream '{id}'")]
    UnknownStream { id: String },
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// Broad category of a resolved stream runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCategory {
    Single,
    Join,
}

/// A filter stage compiled against the combined schema.
#[derive(Debug)]
pub struct FilterProcessor {
    condition: CompiledExpr,
}

impl FilterProcessor {
    pub fn condition(&self) -> &CompiledExpr {
        &self.condition
    }
}

/// A window stage. Holds accumulated state at execution time, so it takes
/// part in the query's serialization discipline.
#[derive(Debug)]
pub struct WindowProcessor {
    spec: WindowSpec,
    /// Whether downstream consumers observe expiry, forcing the window to
    /// retain expired-event copies.
    retain_expired: bool,
    lock: Option<QueryLock>,
    positions: Option<Arc<[AttributeRef]>>,
    meta: Option<Arc<MetaEvent>>,
}

impl WindowProcessor {
    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    pub fn retains_expired(&self) -> bool {
        self.retain_expired
    }

    pub fn has_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.positions.is_some() && self.meta.is_some()
    }
}

/// One stage of a single stream's processor chain.
#[derive(Debug)]
pub enum StreamProcessor {
    Filter(FilterProcessor),
    Window(WindowProcessor),
}

/// Runtime for one source stream: its processor chain plus metadata.
#[derive(Debug)]
pub struct SingleStreamRuntime {
    stream_index: usize,
    stream_id: String,
    processors: Vec<StreamProcessor>,
    latency: Option<LatencyTracker>,
}

impl SingleStreamRuntime {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn processors(&self) -> &[StreamProcessor] {
        &self.processors
    }

    pub fn latency_tracker(&self) -> Option<&LatencyTracker> {
        self.latency.as_ref()
    }

    pub fn has_window(&self) -> bool {
        self.processors
            .iter()
            .any(|p| matches!(p, StreamProcessor::Window(_)))
    }

    fn init(&mut self, meta: &Arc<MetaEvent>, positions: &Arc<[AttributeRef]>, lock: Option<&QueryLock>) {
        for processor in &mut self.processors {
            if let StreamProcessor::Window(window) = processor {
                window.meta = Some(Arc::clone(meta));
                window.positions = Some(Arc::clone(positions));
                window.lock = lock.cloned();
            }
        }
    }
}

/// Runtime correlating two source streams.
#[derive(Debug)]
pub struct JoinStreamRuntime {
    left: SingleStreamRuntime,
    right: SingleStreamRuntime,
    kind: JoinKind,
    condition: Option<CompiledExpr>,
    within: Option<Duration>,
    lock: Option<QueryLock>,
    positions: Option<Arc<[AttributeRef]>>,
    meta: Option<Arc<MetaEvent>>,
}

impl JoinStreamRuntime {
    pub fn left(&self) -> &SingleStreamRuntime {
        &self.left
    }

    pub fn right(&self) -> &SingleStreamRuntime {
        &self.right
    }

    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn condition(&self) -> Option<&CompiledExpr> {
        self.condition.as_ref()
    }

    pub fn within(&self) -> Option<Duration> {
        self.within
    }

    pub fn has_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.positions.is_some() && self.meta.is_some()
    }
}

/// The resolved input-side runtime of a query.
#[derive(Debug)]
pub enum StreamRuntime {
    Single(SingleStreamRuntime),
    Join(JoinStreamRuntime),
}

impl StreamRuntime {
    pub fn category(&self) -> StreamCategory {
        match self {
            StreamRuntime::Single(_) => StreamCategory::Single,
            StreamRuntime::Join(_) => StreamCategory::Join,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, StreamRuntime::Join(_))
    }

    /// Push the finalized schema, position table and lock into every
    /// stateful operator. Runs once, after positions are assigned and
    /// before the compiled runtime is assembled.
    pub fn init(
        &mut self,
        meta: &Arc<MetaEvent>,
        positions: &Arc<[AttributeRef]>,
        lock: Option<&QueryLock>,
    ) {
        match self {
            StreamRuntime::Single(single) => single.init(meta, positions, lock),
            StreamRuntime::Join(join) => {
                join.left.init(meta, positions, lock);
                join.right.init(meta, positions, lock);
                join.meta = Some(Arc::clone(meta));
                join.positions = Some(Arc::clone(positions));
                join.lock = lock.cloned();
            }
        }
    }
}

/// Look up a stream's definition, rejecting ids that are simultaneously
/// defined as tables.
fn lookup_definition(
    id: &str,
    stream_definitions: &FxHashMap<String, StreamDefinition>,
    table_definitions: &FxHashMap<String, StreamDefinition>,
    event_tables: &FxHashMap<String, EventTable>,
) -> Result<StreamDefinition, ResolveError> {
    let as_stream = stream_definitions.get(id);
    let as_table = table_definitions
        .get(id)
        .or_else(|| event_tables.get(id).map(|t| t.definition()));
    match (as_stream, as_table) {
        (Some(_), Some(_)) => Err(ResolveError::DuplicateDefinition { id: id.to_string() }),
        (Some(def), None) => Ok(def.clone()),
        (None, Some(def)) => Ok(def.clone()),
        (None, None) => Err(ResolveError::UnknownStream { id: id.to_string() }),
    }
}

/// Resolve one source stream into its meta schema and processor chain.
fn resolve_single(
    input: &SingleInputStream,
    stream_index: usize,
    meta: &mut MetaEvent,
    attr_refs: &mut Vec<AttributeRef>,
    latency: Option<LatencyTracker>,
) -> Result<SingleStreamRuntime, ResolveError> {
    let mut processors = Vec::with_capacity(input.handlers.len());
    for handler in &input.handlers {
        match handler {
            StreamHandler::Filter(condition) => {
                let compiled = resolve_expr(
                    condition,
                    meta,
                    ResolveScope::Stream(stream_index),
                    attr_refs,
                )?;
                processors.push(StreamProcessor::Filter(FilterProcessor {
                    condition: compiled,
                }));
            }
            StreamHandler::Window(spec) => {
                processors.push(StreamProcessor::Window(WindowProcessor {
                    spec: spec.clone(),
                    retain_expired: false,
                    lock: None,
                    positions: None,
                    meta: None,
                }));
            }
        }
    }
    Ok(SingleStreamRuntime {
        stream_index,
        stream_id: input.stream_id.clone(),
        processors,
        latency,
    })
}

fn mark_retain_expired(runtime: &mut SingleStreamRuntime) {
    for processor in &mut runtime.processors {
        if let StreamProcessor::Window(window) = processor {
            window.retain_expired = true;
        }
    }
}

/// Resolve the input side of a query.
///
/// Returns the stream runtime together with the combined schema it exposes.
/// The schema is still mutable at this point: the selection collaborator
/// keeps marking references on it until reduction runs.
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    input: &InputStream,
    context: &ExecutionContext,
    stream_definitions: &FxHashMap<String, StreamDefinition>,
    table_definitions: &FxHashMap<String, StreamDefinition>,
    event_tables: &FxHashMap<String, EventTable>,
    attr_refs: &mut Vec<AttributeRef>,
    latency: Option<LatencyTracker>,
    expects_expired: bool,
) -> Result<(StreamRuntime, MetaEvent), ResolveError> {
    match input {
        InputStream::Single(single) => {
            let definition = lookup_definition(
                &single.stream_id,
                stream_definitions,
                table_definitions,
                event_tables,
            )?;
            let mut meta = MetaEvent::stream(MetaStreamEvent::new(
                definition,
                single.alias.clone(),
            ));
            let mut runtime = resolve_single(single, 0, &mut meta, attr_refs, latency)?;
            if expects_expired {
                mark_retain_expired(&mut runtime);
            }
            debug!(
                context = %context.name(),
                stream = %single.stream_id,
                "resolved single input stream"
            );
            Ok((StreamRuntime::Single(runtime), meta))
        }
        InputStream::Join(join) => {
            let left_def = lookup_definition(
                &join.left.stream_id,
                stream_definitions,
                table_definitions,
                event_tables,
            )?;
            let right_def = lookup_definition(
                &join.right.stream_id,
                stream_definitions,
                table_definitions,
                event_tables,
            )?;
            let mut meta = MetaEvent::join(vec![
                MetaStreamEvent::new(left_def, join.left.alias.clone()),
                MetaStreamEvent::new(right_def, join.right.alias.clone()),
            ]);
            let mut left = resolve_single(&join.left, 0, &mut meta, attr_refs, latency.clone())?;
            let mut right = resolve_single(&join.right, 1, &mut meta, attr_refs, latency)?;
            if expects_expired {
                mark_retain_expired(&mut left);
                mark_retain_expired(&mut right);
            }
            let condition = join
                .on
                .as_ref()
                .map(|on| resolve_expr(on, &mut meta, ResolveScope::All, attr_refs))
                .transpose()?;
            debug!(
                context = %context.name(),
                left = %join.left.stream_id,
                right = %join.right.stream_id,
                "resolved join input stream"
            );
            Ok((
                StreamRuntime::Join(JoinStreamRuntime {
                    left,
                    right,
                    kind: join.kind,
                    condition,
                    within: join.within,
                    lock: None,
                    positions: None,
                    meta: None,
                }),
                meta,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{assign_positions, reduce_meta};
    use std::sync::Mutex;
    use virta_core::{AttrType, CompareOp, Expr, JoinInputStream};

    fn definitions() -> FxHashMap<String, StreamDefinition> {
        let mut map = FxHashMap::default();
        map.insert(
            "Trades".to_string(),
            StreamDefinition::new("Trades")
                .attribute("symbol", AttrType::Str)
                .attribute("price", AttrType::Float)
                .attribute("volume", AttrType::Int),
        );
        map.insert(
            "Quotes".to_string(),
            StreamDefinition::new("Quotes")
                .attribute("symbol", AttrType::Str)
                .attribute("bid", AttrType::Float),
        );
        map
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("test", tokio::runtime::Handle::current())
    }

    #[tokio::test]
    async fn resolve_single_with_filter_and_window() {
        let ctx = context();
        let mut refs = Vec::new();
        let input = InputStream::Single(
            SingleInputStream::new("Trades")
                .filter(Expr::compare(
                    CompareOp::Gt,
                    Expr::var("price"),
                    Expr::value(100.0),
                ))
                .window(WindowSpec::Length(5)),
        );
        let (runtime, meta) = resolve(
            &input,
            &ctx,
            &definitions(),
            &FxHashMap::default(),
            &FxHashMap::default(),
            &mut refs,
            None,
            false,
        )
        .unwrap();

        assert_eq!(runtime.category(), StreamCategory::Single);
        assert_eq!(refs.len(), 1);
        assert!(meta.streams()[0].is_referenced("price"));
        match &runtime {
            StreamRuntime::Single(s) => {
                assert_eq!(s.processors().len(), 2);
                assert!(s.has_window());
            }
            StreamRuntime::Join(_) => panic!("expected single runtime"),
        }
    }

    #[tokio::test]
    async fn expired_events_flag_reaches_windows() {
        let ctx = context();
        let mut refs = Vec::new();
        let input = InputStream::Single(SingleInputStream::new("Trades").window(WindowSpec::Length(3)));
        let (runtime, _) = resolve(
            &input,
            &ctx,
            &definitions(),
            &FxHashMap::default(),
            &FxHashMap::default(),
            &mut refs,
            None,
            true,
        )
        .unwrap();

        let StreamRuntime::Single(single) = runtime else {
            panic!("expected single runtime");
        };
        let StreamProcessor::Window(window) = &single.processors()[0] else {
            panic!("expected window processor");
        };
        assert!(window.retains_expired());
    }

    #[tokio::test]
    async fn duplicate_stream_and_table_definition() {
        let ctx = context();
        let mut tables = FxHashMap::default();
        tables.insert(
            "Trades".to_string(),
            StreamDefinition::new("Trades").attribute("symbol", AttrType::Str),
        );
        let mut refs = Vec::new();
        let err = resolve(
            &InputStream::Single(SingleInputStream::new("Trades")),
            &ctx,
            &definitions(),
            &tables,
            &FxHashMap::default(),
            &mut refs,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateDefinition { .. }));
    }

    #[tokio::test]
    async fn unknown_stream() {
        let ctx = context();
        let mut refs = Vec::new();
        let err = resolve(
            &InputStream::Single(SingleInputStream::new("Nope")),
            &ctx,
            &definitions(),
            &FxHashMap::default(),
            &FxHashMap::default(),
            &mut refs,
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownStream { .. }));
    }

    #[tokio::test]
    async fn join_resolution_and_init_propagates_lock() {
        let ctx = context();
        let mut refs = Vec::new();
        let input = InputStream::Join(JoinInputStream {
            left: SingleInputStream::new("Trades")
                .with_alias("t")
                .window(WindowSpec::Length(10)),
            right: SingleInputStream::new("Quotes").with_alias("q"),
            kind: JoinKind::Inner,
            on: Some(Expr::compare(
                CompareOp::Eq,
                Expr::var_of("t", "symbol"),
                Expr::var_of("q", "symbol"),
            )),
            within: Some(Duration::from_secs(60)),
        });
        let (mut runtime, mut meta) = resolve(
            &input,
            &ctx,
            &definitions(),
            &FxHashMap::default(),
            &FxHashMap::default(),
            &mut refs,
            None,
            false,
        )
        .unwrap();

        assert!(runtime.is_join());
        assert_eq!(refs.len(), 2);

        reduce_meta(&mut meta);
        assign_positions(&meta, &mut refs).unwrap();
        let meta = Arc::new(meta);
        let positions: Arc<[AttributeRef]> = refs.into();
        let lock: QueryLock = Arc::new(Mutex::new(()));
        runtime.init(&meta, &positions, Some(&lock));

        let StreamRuntime::Join(join) = &runtime else {
            panic!("expected join runtime");
        };
        assert!(join.has_lock());
        assert!(join.is_initialized());
        let StreamProcessor::Window(window) = &join.left().processors()[0] else {
            panic!("expected window processor on left side");
        };
        assert!(window.has_lock());
        assert!(window.is_initialized());
    }
}
