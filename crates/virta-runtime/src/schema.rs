//! Combined event schema and position resolution
//!
//! During compilation every component that touches an attribute records the
//! reference here. The meta event starts as a full copy of each input
//! definition, collects referenced-attribute marks while the stream and
//! selection collaborators run, and is then reduced (unreferenced
//! attributes dropped) and position-assigned in one pass. After that pass
//! the meta event is frozen into an `Arc` and shared read-only by the
//! stream runtime, the selector and the event populator. Nothing may read
//! positions before the pass has run.

use indexmap::IndexMap;
use tracing::debug;
use virta_core::{AttrType, Attribute, StreamDefinition};

/// Positional address of an attribute in the reduced combined schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPosition {
    /// Which participant stream the attribute lives in (0 for single-stream
    /// queries).
    pub stream_index: usize,
    /// Index into that stream's reduced attribute list.
    pub attribute_index: usize,
}

/// One attribute-access expression discovered anywhere in the query.
///
/// Collected by the stream and selection collaborators; `position` stays
/// `None` until [`assign_positions`] fixes it against the reduced schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRef {
    pub stream_index: usize,
    pub attribute: String,
    pub ty: AttrType,
    pub position: Option<EventPosition>,
}

/// Schema of events for one participant stream of a query.
#[derive(Debug, Clone)]
pub struct MetaStreamEvent {
    /// The full input definition as resolved.
    definition: StreamDefinition,
    /// Alias the query refers to this stream by, if any.
    alias: Option<String>,
    /// Attributes actually referenced, in first-reference order.
    referenced: IndexMap<String, AttrType>,
    /// Reduced attribute layout; populated by [`reduce_meta`].
    reduced: Vec<Attribute>,
}

impl MetaStreamEvent {
    pub fn new(definition: StreamDefinition, alias: Option<String>) -> Self {
        Self {
            definition,
            alias,
            referenced: IndexMap::new(),
            reduced: Vec::new(),
        }
    }

    pub fn definition(&self) -> &StreamDefinition {
        &self.definition
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The name this stream is matched against in qualified references.
    pub fn reference_id(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.definition.id)
    }

    /// Mark an attribute as referenced, returning its type.
    pub fn mark_referenced(&mut self, attribute: &str) -> Option<AttrType> {
        let ty = self.definition.get(attribute)?.ty;
        self.referenced.insert(attribute.to_string(), ty);
        Some(ty)
    }

    pub fn is_referenced(&self, attribute: &str) -> bool {
        self.referenced.contains_key(attribute)
    }

    /// The reduced attribute layout. Empty until reduction has run.
    pub fn reduced_attributes(&self) -> &[Attribute] {
        &self.reduced
    }

    fn reduce(&mut self) {
        // Keep definition order so layouts stay stable across queries that
        // reference the same attributes in different textual order.
        self.reduced = self
            .definition
            .attributes
            .iter()
            .filter(|a| self.referenced.contains_key(&a.name))
            .cloned()
            .collect();
    }
}

/// The combined schema of all events flowing through one compiled query.
///
/// Single-stream queries have one participant schema; joins have one per
/// side. The output definition is installed by the selection collaborator
/// once projection types are known.
#[derive(Debug, Clone)]
pub struct MetaEvent {
    streams: Vec<MetaStreamEvent>,
    join: bool,
    output_definition: Option<StreamDefinition>,
}

impl MetaEvent {
    pub fn stream(stream: MetaStreamEvent) -> Self {
        Self {
            streams: vec![stream],
            join: false,
            output_definition: None,
        }
    }

    pub fn join(streams: Vec<MetaStreamEvent>) -> Self {
        Self {
            streams,
            join: true,
            output_definition: None,
        }
    }

    /// All participant stream schemas, in stream-index order.
    pub fn streams(&self) -> &[MetaStreamEvent] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [MetaStreamEvent] {
        &mut self.streams
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_join(&self) -> bool {
        self.join
    }

    /// Schema of the query's output events, once selection has run.
    pub fn output_definition(&self) -> Option<&StreamDefinition> {
        self.output_definition.as_ref()
    }

    pub fn set_output_definition(&mut self, definition: StreamDefinition) {
        self.output_definition = Some(definition);
    }

    /// Total width of the reduced combined schema across all streams.
    pub fn reduced_width(&self) -> usize {
        self.streams
            .iter()
            .map(|s| s.reduced_attributes().len())
            .sum()
    }
}

/// Errors from position finalization.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("attribute '{attribute}' of stream #{stream_index} missing from reduced schema")]
    DanglingReference {
        stream_index: usize,
        attribute: String,
    },
    #[error("attribute reference names stream #{stream_index} but the schema has {streams} streams")]
    StreamIndexOutOfRange { stream_index: usize, streams: usize },
}

/// Reduce the combined schema to only the attributes actually referenced.
///
/// Drops anything that was resolved during stream resolution but never read
/// by a filter, projection, grouping or having clause.
pub fn reduce_meta(meta: &mut MetaEvent) {
    for stream in meta.streams_mut() {
        stream.reduce();
    }
    debug!(width = meta.reduced_width(), "combined schema reduced");
}

/// Assign a final position to every attribute reference.
///
/// Must run after all references are collected and after [`reduce_meta`],
/// and before any component reads positions. Two references to the same
/// logical attribute receive the same position; distinct attributes never
/// collide.
pub fn assign_positions(
    meta: &MetaEvent,
    attribute_refs: &mut [AttributeRef],
) -> Result<(), SchemaError> {
    let streams = meta.streams();
    for attr_ref in attribute_refs.iter_mut() {
        let stream = streams.get(attr_ref.stream_index).ok_or(
            SchemaError::StreamIndexOutOfRange {
                stream_index: attr_ref.stream_index,
                streams: streams.len(),
            },
        )?;
        let attribute_index = stream
            .reduced_attributes()
            .iter()
            .position(|a| a.name == attr_ref.attribute)
            .ok_or_else(|| SchemaError::DanglingReference {
                stream_index: attr_ref.stream_index,
                attribute: attr_ref.attribute.clone(),
            })?;
        attr_ref.position = Some(EventPosition {
            stream_index: attr_ref.stream_index,
            attribute_index,
        });
    }
    Ok(())
}
