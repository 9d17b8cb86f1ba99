//! Event population
//!
//! Materializes output events from internal representations. Single-stream
//! queries carry their payload positionally already; joins need each
//! participant's payload copied into the flat state layout of the combined
//! reduced schema. Populators are built only from the frozen schema —
//! positions must be final before construction.

use crate::event::StateEvent;
use crate::schema::MetaEvent;
use std::sync::Arc;

/// Copies one attribute of one participant stream into the state payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMapping {
    pub stream_index: usize,
    pub attribute_index: usize,
    pub state_position: usize,
}

/// Populates output events from internal event representations.
#[derive(Debug, Clone)]
pub enum EventPopulator {
    /// Single-stream events are already laid out per the reduced schema.
    PassThrough,
    /// Joins: copy each participant's payload into the flat state layout.
    State { mappings: Vec<StateMapping> },
}

impl EventPopulator {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, EventPopulator::PassThrough)
    }

    /// Fill a state event's flat payload from its per-stream payloads.
    pub fn populate(&self, state: &mut StateEvent) {
        let EventPopulator::State { mappings } = self else {
            return;
        };
        for mapping in mappings {
            let Some(Some(stream_event)) = state.streams.get(mapping.stream_index) else {
                continue;
            };
            if let Some(value) = stream_event.values.get(mapping.attribute_index) {
                state.state[mapping.state_position] = Some(value.clone());
            }
        }
    }
}

/// Build the populator for a query's finalized combined schema.
pub fn build_event_populator(meta: &Arc<MetaEvent>) -> EventPopulator {
    if !meta.is_join() {
        return EventPopulator::PassThrough;
    }
    let mut mappings = Vec::with_capacity(meta.reduced_width());
    let mut state_position = 0;
    for (stream_index, stream) in meta.streams().iter().enumerate() {
        for attribute_index in 0..stream.reduced_attributes().len() {
            mappings.push(StateMapping {
                stream_index,
                attribute_index,
                state_position,
            });
            state_position += 1;
        }
    }
    EventPopulator::State { mappings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;
    use crate::schema::{reduce_meta, MetaStreamEvent};
    use virta_core::{AttrType, StreamDefinition, Value};

    fn frozen_join_meta() -> Arc<MetaEvent> {
        let mut meta = MetaEvent::join(vec![
            MetaStreamEvent::new(
                StreamDefinition::new("A")
                    .attribute("x", AttrType::Int)
                    .attribute("y", AttrType::Int),
                None,
            ),
            MetaStreamEvent::new(
                StreamDefinition::new("B").attribute("z", AttrType::Float),
                None,
            ),
        ]);
        meta.streams_mut()[0].mark_referenced("x");
        meta.streams_mut()[0].mark_referenced("y");
        meta.streams_mut()[1].mark_referenced("z");
        reduce_meta(&mut meta);
        Arc::new(meta)
    }

    #[test]
    fn single_stream_gets_pass_through() {
        let mut meta = MetaEvent::stream(MetaStreamEvent::new(
            StreamDefinition::new("S").attribute("a", AttrType::Int),
            None,
        ));
        meta.streams_mut()[0].mark_referenced("a");
        reduce_meta(&mut meta);
        let populator = build_event_populator(&Arc::new(meta));
        assert!(populator.is_pass_through());
    }

    #[test]
    fn join_mappings_cover_combined_width() {
        let meta = frozen_join_meta();
        let populator = build_event_populator(&meta);
        let EventPopulator::State { mappings } = &populator else {
            panic!("expected state populator");
        };
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[2].stream_index, 1);
        assert_eq!(mappings[2].state_position, 2);
    }

    #[test]
    fn populate_copies_stream_payloads() {
        let meta = frozen_join_meta();
        let populator = build_event_populator(&meta);

        let mut state = StateEvent::new(2, meta.reduced_width());
        state.streams[0] = Some(StreamEvent::new(vec![Value::Int(1), Value::Int(2)]));
        state.streams[1] = Some(StreamEvent::new(vec![Value::Float(3.5)]));
        populator.populate(&mut state);

        assert_eq!(state.state[0], Some(Value::Int(1)));
        assert_eq!(state.state[1], Some(Value::Int(2)));
        assert_eq!(state.state[2], Some(Value::Float(3.5)));
    }

    #[test]
    fn populate_tolerates_missing_side() {
        let meta = frozen_join_meta();
        let populator = build_event_populator(&meta);

        let mut state = StateEvent::new(2, meta.reduced_width());
        state.streams[0] = Some(StreamEvent::new(vec![Value::Int(7), Value::Int(8)]));
        populator.populate(&mut state);

        assert_eq!(state.state[1], Some(Value::Int(8)));
        assert_eq!(state.state[2], None);
    }
}
