//! Output delivery callbacks
//!
//! The last stage of a compiled query hands emitted events to their
//! destination: a downstream stream junction or an event table. Table
//! inserts are schema-checked at compile time against the table's
//! definition, so runtime insertion never has to validate rows.

use rustc_hash::FxHashMap;
use tracing::debug;
use virta_core::{OutputStream, StreamDefinition};

use crate::table::EventTable;

/// Errors while wiring a query's output callback.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error(
        "output schema [{output}] does not match definition [{table}] of table '{target}'"
    )]
    SchemaMismatch {
        target: String,
        output: String,
        table: String,
    },
}

/// Delivers a query's output events to their destination.
#[derive(Debug)]
pub enum OutputCallback {
    /// Publish onto a downstream stream.
    InsertIntoStream {
        target: String,
        definition: StreamDefinition,
        /// Multiple sources feed the destination (joins), so delivery must
        /// serialize against concurrent emitters.
        multi_source: bool,
    },
    /// Insert rows into an event table.
    InsertIntoTable {
        target: String,
        definition: StreamDefinition,
        multi_source: bool,
    },
}

impl OutputCallback {
    pub fn target(&self) -> &str {
        match self {
            OutputCallback::InsertIntoStream { target, .. }
            | OutputCallback::InsertIntoTable { target, .. } => target,
        }
    }

    pub fn definition(&self) -> &StreamDefinition {
        match self {
            OutputCallback::InsertIntoStream { definition, .. }
            | OutputCallback::InsertIntoTable { definition, .. } => definition,
        }
    }

    pub fn is_multi_source(&self) -> bool {
        match self {
            OutputCallback::InsertIntoStream { multi_source, .. }
            | OutputCallback::InsertIntoTable { multi_source, .. } => *multi_source,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, OutputCallback::InsertIntoTable { .. })
    }
}

fn schema_signature(definition: &StreamDefinition) -> String {
    definition
        .attributes
        .iter()
        .map(|a| format!("{}:{:?}", a.name, a.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wire the output callback for a query.
///
/// `definition` is the query's derived output schema; if the target names an
/// event table the schema must match the table's attribute types
/// positionally.
pub fn build_callback(
    output: &OutputStream,
    definition: &StreamDefinition,
    event_tables: &FxHashMap<String, EventTable>,
    multi_source: bool,
) -> Result<OutputCallback, OutputError> {
    if let Some(table) = event_tables.get(&output.target) {
        let table_def = table.definition();
        let types_match = definition.attributes.len() == table_def.attributes.len()
            && definition
                .attributes
                .iter()
                .zip(&table_def.attributes)
                .all(|(out, tab)| out.ty == tab.ty);
        if !types_match {
            return Err(OutputError::SchemaMismatch {
                target: output.target.clone(),
                output: schema_signature(definition),
                table: schema_signature(table_def),
            });
        }
        debug!(target = %output.target, "output wired to event table");
        return Ok(OutputCallback::InsertIntoTable {
            target: output.target.clone(),
            definition: definition.clone(),
            multi_source,
        });
    }
    debug!(target = %output.target, "output wired to stream");
    Ok(OutputCallback::InsertIntoStream {
        target: output.target.clone(),
        definition: definition.clone(),
        multi_source,
    })
}
