//! Virta Runtime - Query compilation for the Virta streaming engine
//!
//! This crate turns declarative query descriptions from `virta-core` into
//! immutable, fully wired query runtimes.

pub mod compiler;
pub mod context;
pub mod error;
pub mod event;
pub mod expr;
pub mod metrics;
pub mod output;
pub mod populate;
pub mod query;
pub mod schema;
pub mod selector;
pub mod stream;
pub mod table;

pub use compiler::compile;
pub use context::{EternalHolder, ExecutionContext, QueryLock};
pub use error::CompileError;
pub use event::{StateEvent, StreamEvent};
pub use expr::{CompiledExpr, ExprError, ResolveScope};
pub use metrics::{query_metric_path, LatencyTracker, StatisticsManager};
pub use output::{
    build_callback, build_rate_limiter, LimiterPhase, OutputCallback, OutputError,
    OutputRateLimiter, RatePolicy,
};
pub use populate::{build_event_populator, EventPopulator};
pub use query::QueryRuntime;
pub use schema::{
    assign_positions, reduce_meta, AttributeRef, EventPosition, MetaEvent, MetaStreamEvent,
    SchemaError,
};
pub use selector::{
    build_selector, AggregateKind, AttributeProcessor, ProcessorKind, QuerySelector, SelectError,
};
pub use stream::{ResolveError, StreamCategory, StreamProcessor, StreamRuntime};
pub use table::EventTable;
