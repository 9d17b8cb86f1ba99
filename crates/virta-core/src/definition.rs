//! Stream and table schema definitions

use serde::{Deserialize, Serialize};

/// Attribute type in a stream or table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Int,
    Float,
    Str,
    Bool,
}

/// A single named attribute of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub ty: AttrType,
}

/// Schema of a stream or table: an id plus an ordered attribute list.
///
/// Attribute order is significant — compiled queries address attributes
/// positionally once the schema is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub id: String,
    pub attributes: Vec<Attribute>,
}

impl StreamDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute (builder style).
    pub fn attribute(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            ty,
        });
        self
    }

    /// Look up an attribute by name.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Index of an attribute by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }
}
