//! User-facing compilation errors
//!
//! Every failure inside query compilation is normalized into one of the two
//! kinds below at a single catch site in the compiler. Collaborators never
//! build these themselves; they raise their own module errors and the
//! compiler translates, attaching the query's declared name when it has one.

use std::error::Error;
use std::fmt;

type Source = Box<dyn Error + Send + Sync + 'static>;

/// Compilation failure returned to the caller.
///
/// Exactly two kinds exist: a name collision against already-known
/// definitions, and a catch-all for everything else. The message carries
/// `, when creating query '<name>'` when the query declared a name.
#[derive(Debug)]
pub enum CompileError {
    /// A referenced name collides with an existing definition.
    DuplicateDefinition {
        message: String,
        query: Option<String>,
        source: Option<Source>,
    },
    /// Any other failure while assembling the query runtime.
    Creation {
        message: String,
        query: Option<String>,
        source: Option<Source>,
    },
}

impl CompileError {
    pub(crate) fn duplicate_definition(
        message: impl Into<String>,
        query: Option<&str>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        CompileError::DuplicateDefinition {
            message: message.into(),
            query: query.map(str::to_string),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn creation(
        message: impl Into<String>,
        query: Option<&str>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        CompileError::Creation {
            message: message.into(),
            query: query.map(str::to_string),
            source: Some(Box::new(source)),
        }
    }

    /// The underlying message, without the query-name suffix.
    pub fn message(&self) -> &str {
        match self {
            CompileError::DuplicateDefinition { message, .. } => message,
            CompileError::Creation { message, .. } => message,
        }
    }

    /// The query name attached at the catch site, if the query had one.
    pub fn query_name(&self) -> Option<&str> {
        match self {
            CompileError::DuplicateDefinition { query, .. } => query.as_deref(),
            CompileError::Creation { query, .. } => query.as_deref(),
        }
    }

    pub fn is_duplicate_definition(&self) -> bool {
        matches!(self, CompileError::DuplicateDefinition { .. })
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.query_name() {
            Some(name) => write!(f, "{}, when creating query '{}'", self.message(), name),
            None => write!(f, "{}", self.message()),
        }
    }
}

impl Error for CompileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let source = match self {
            CompileError::DuplicateDefinition { source, .. } => source,
            CompileError::Creation { source, .. } => source,
        };
        source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("inner cause")]
    struct Inner;

    #[test]
    fn display_appends_query_name_when_known() {
        let err = CompileError::duplicate_definition("stream 'S' already defined", Some("Q1"), Inner);
        assert_eq!(
            err.to_string(),
            "stream 'S' already defined, when creating query 'Q1'"
        );
        assert!(err.to_string().contains("Q1"));
    }

    #[test]
    fn display_without_query_name_has_no_suffix() {
        let err = CompileError::creation("boom", None, Inner);
        assert_eq!(err.to_string(), "boom");
        assert!(!err.to_string().contains("when creating query"));
    }

    #[test]
    fn original_cause_is_preserved() {
        let err = CompileError::creation("boom", Some("Q"), Inner);
        assert_eq!(err.source().unwrap().to_string(), "inner cause");
    }
}
