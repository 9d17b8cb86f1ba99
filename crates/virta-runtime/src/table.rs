//! Event table surface
//!
//! Tables are external collaborators of query compilation: only their
//! schema matters here. Storage and lookup internals live elsewhere.

use virta_core::StreamDefinition;

/// A materialized event table a query may write into or resolve against.
#[derive(Debug, Clone)]
pub struct EventTable {
    definition: StreamDefinition,
}

impl EventTable {
    pub fn new(definition: StreamDefinition) -> Self {
        Self { definition }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &StreamDefinition {
        &self.definition
    }
}
