//! Runtime event representations
//!
//! Compiled queries address event payloads positionally against the reduced
//! combined schema. A [`StreamEvent`] carries one stream's payload; a
//! [`StateEvent`] carries one slot per joined stream plus the output row.

use chrono::{DateTime, Utc};
use virta_core::Value;

/// An event from a single stream, payload laid out per the reduced schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<Value>,
}

impl StreamEvent {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            values,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A composite event spanning all participant streams of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub timestamp: DateTime<Utc>,
    /// One slot per joined stream; `None` until that side has matched.
    pub streams: Vec<Option<StreamEvent>>,
    /// Flattened state payload, laid out per the combined reduced schema.
    /// Slots stay `None` until populated.
    pub state: Vec<Option<Value>>,
}

impl StateEvent {
    /// An empty state event sized for `stream_count` sources and
    /// `state_width` combined attributes.
    pub fn new(stream_count: usize, state_width: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            streams: vec![None; stream_count],
            state: vec![None; state_width],
        }
    }
}
