//! Compiled query runtime
//!
//! The immutable product of compilation. Once assembled, a [`QueryRuntime`]
//! never rewires itself: the schema is frozen, positions are assigned, and
//! the rate limiter is armed. Callers only read.

use std::sync::Arc;

use crate::context::{ExecutionContext, QueryLock};
use crate::output::{OutputCallback, OutputRateLimiter};
use crate::schema::{AttributeRef, MetaEvent};
use crate::selector::QuerySelector;
use crate::stream::{StreamCategory, StreamRuntime};
use virta_core::Query;

/// One fully compiled continuous query.
pub struct QueryRuntime {
    pub(crate) query: Query,
    pub(crate) context: Arc<ExecutionContext>,
    pub(crate) stream_runtime: StreamRuntime,
    pub(crate) selector: QuerySelector,
    pub(crate) rate_limiter: Arc<OutputRateLimiter>,
    pub(crate) callback: OutputCallback,
    pub(crate) meta: Arc<MetaEvent>,
    pub(crate) attribute_refs: Arc<[AttributeRef]>,
    pub(crate) lock: Option<QueryLock>,
}

impl QueryRuntime {
    /// The query's declared name, if it carried an `@info(name = ...)`.
    pub fn name(&self) -> Option<&str> {
        self.query.name()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn stream_runtime(&self) -> &StreamRuntime {
        &self.stream_runtime
    }

    pub fn category(&self) -> StreamCategory {
        self.stream_runtime.category()
    }

    pub fn selector(&self) -> &QuerySelector {
        &self.selector
    }

    pub(crate) fn selector_mut(&mut self) -> &mut QuerySelector {
        &mut self.selector
    }

    pub fn rate_limiter(&self) -> &Arc<OutputRateLimiter> {
        &self.rate_limiter
    }

    pub fn callback(&self) -> &OutputCallback {
        &self.callback
    }

    /// The frozen combined schema shared by every operator of this query.
    pub fn meta(&self) -> &Arc<MetaEvent> {
        &self.meta
    }

    /// Every attribute reference of the query, positions assigned.
    pub fn attribute_refs(&self) -> &[AttributeRef] {
        &self.attribute_refs
    }

    /// Whether this query serializes its stateful operators under a lock.
    pub fn has_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn lock(&self) -> Option<&QueryLock> {
        self.lock.as_ref()
    }
}
