//! # Virta Core
//!
//! Foundational types for the Virta streaming engine.
//!
//! This crate holds the data structures shared between the query front end
//! and the runtime:
//!
//! - **Query descriptions**: the declarative shape of a continuous query
//!   (input streams, windows, joins, selection, output, rate limiting)
//! - **Definitions**: stream and table schemas
//! - **Values**: the runtime value representation
//!
//! Query descriptions are plain data. They carry no behavior beyond lookup
//! helpers; the runtime crate compiles them into executable objects.

pub mod definition;
pub mod query;
pub mod value;

pub use definition::{AttrType, Attribute, StreamDefinition};
pub use query::*;
pub use value::Value;
