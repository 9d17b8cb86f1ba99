//! Query description AST
//!
//! A [`Query`] is the declarative description of one continuous query:
//! where events come from (single stream or join, each with optional
//! filter/window handlers), how they are projected and aggregated, where
//! output goes, and how often it may be emitted. Descriptions are immutable
//! inputs to the runtime's compiler; nothing here executes.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A complete continuous query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub input: InputStream,
    pub selection: Selection,
    pub output: OutputStream,
    pub rate: Option<OutputRate>,
    pub annotations: Vec<Annotation>,
}

impl Query {
    /// Look up an annotation element by annotation name and optional key.
    ///
    /// With `key = None`, the first element of the annotation is returned
    /// (the common form for flag-style annotations such as
    /// `@synchronized('false')`). Annotation names match case-insensitively.
    pub fn annotation_element(&self, name: &str, key: Option<&str>) -> Option<&Element> {
        let annotation = self
            .annotations
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))?;
        match key {
            Some(k) => annotation
                .elements
                .iter()
                .find(|e| e.key.as_deref().is_some_and(|ek| ek.eq_ignore_ascii_case(k))),
            None => annotation.elements.first(),
        }
    }

    /// The query's declared name from `@info(name = '...')`, if any.
    ///
    /// Used for diagnostics and metric naming only, never for identity.
    pub fn name(&self) -> Option<&str> {
        self.annotation_element("info", Some("name"))
            .map(|e| e.value.as_str())
    }
}

/// An annotation decorating a query: `@info(name = 'Q1')`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub elements: Vec<Element>,
}

impl Annotation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
        }
    }

    /// Append a `key = value` element.
    pub fn element(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.elements.push(Element {
            key: Some(key.into()),
            value: value.into(),
        });
        self
    }

    /// Append a bare value element (no key).
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.elements.push(Element {
            key: None,
            value: value.into(),
        });
        self
    }
}

/// One element of an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub key: Option<String>,
    pub value: String,
}

/// The input side of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputStream {
    Single(SingleInputStream),
    Join(JoinInputStream),
}

impl InputStream {
    /// Whether any single input stream carries a window handler.
    pub fn has_window(&self) -> bool {
        match self {
            InputStream::Single(s) => s.has_window(),
            InputStream::Join(j) => j.left.has_window() || j.right.has_window(),
        }
    }
}

/// One source stream, optionally decorated with filter/window handlers.
///
/// Handlers apply in declaration order: `Trades[price > 100].window(len 5)`
/// filters before windowing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleInputStream {
    pub stream_id: String,
    pub alias: Option<String>,
    pub handlers: Vec<StreamHandler>,
}

impl SingleInputStream {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            alias: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn filter(mut self, condition: Expr) -> Self {
        self.handlers.push(StreamHandler::Filter(condition));
        self
    }

    pub fn window(mut self, spec: WindowSpec) -> Self {
        self.handlers.push(StreamHandler::Window(spec));
        self
    }

    pub fn has_window(&self) -> bool {
        self.handlers
            .iter()
            .any(|h| matches!(h, StreamHandler::Window(_)))
    }

    /// The name this stream is referenced by in expressions.
    pub fn reference_id(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.stream_id)
    }
}

/// A handler attached to a single input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamHandler {
    Filter(Expr),
    Window(WindowSpec),
}

/// Window specification on an input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WindowSpec {
    /// Sliding window over the last `n` events.
    Length(usize),
    /// Tumbling window emitting every `n` events.
    LengthBatch(usize),
    /// Sliding window over the trailing duration.
    Time(Duration),
    /// Tumbling window emitting every duration.
    TimeBatch(Duration),
}

/// A correlation of two source streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInputStream {
    pub left: SingleInputStream,
    pub right: SingleInputStream,
    pub kind: JoinKind,
    /// Optional join condition over attributes of both sides.
    pub on: Option<Expr>,
    /// Optional correlation window.
    pub within: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

/// Projection, grouping and post-aggregation filtering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub attributes: Vec<OutputAttribute>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project an expression under its default name.
    pub fn select(mut self, expr: Expr) -> Self {
        self.attributes.push(OutputAttribute { alias: None, expr });
        self
    }

    /// Project an expression under an explicit alias.
    pub fn select_as(mut self, alias: impl Into<String>, expr: Expr) -> Self {
        self.attributes.push(OutputAttribute {
            alias: Some(alias.into()),
            expr,
        });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn having(mut self, condition: Expr) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn has_grouping(&self) -> bool {
        !self.group_by.is_empty()
    }
}

/// One projected output attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputAttribute {
    /// Output name; required unless the expression is a bare variable.
    pub alias: Option<String>,
    pub expr: Expr,
}

/// The output side of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStream {
    /// Target stream or table name.
    pub target: String,
    pub event_kind: OutputEventKind,
}

impl OutputStream {
    pub fn new(target: impl Into<String>, event_kind: OutputEventKind) -> Self {
        Self {
            target: target.into(),
            event_kind,
        }
    }
}

/// Which event categories downstream consumers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputEventKind {
    /// Newly arrived events only.
    CurrentEvents,
    /// Window-expired events only.
    ExpiredEvents,
    /// Both current and expired events.
    AllEvents,
}

/// Output rate limiting policy requested by the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputRate {
    /// Emit per `count` arriving output events.
    EveryEvents { count: usize, emit: EmitSelection },
    /// Emit on a timer.
    EveryDuration {
        interval: Duration,
        emit: EmitSelection,
    },
    /// Periodically emit the full current result set.
    Snapshot { interval: Duration },
}

/// Which buffered events a count/time rate limiter emits per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitSelection {
    First,
    Last,
    All,
}

/// An expression in filters, join conditions, projections and having clauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Attribute access, optionally qualified by stream alias/id.
    Variable {
        stream: Option<String>,
        attribute: String,
    },
    Const(Value),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Math {
        op: MathOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Function call; in selections this is where aggregations appear.
    Call { function: String, args: Vec<Expr> },
}

impl Expr {
    /// Unqualified attribute access.
    pub fn var(attribute: impl Into<String>) -> Self {
        Expr::Variable {
            stream: None,
            attribute: attribute.into(),
        }
    }

    /// Attribute access qualified by stream alias or id.
    pub fn var_of(stream: impl Into<String>, attribute: impl Into<String>) -> Self {
        Expr::Variable {
            stream: Some(stream.into()),
            attribute: attribute.into(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Const(value.into())
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            function: function.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_with_annotations(annotations: Vec<Annotation>) -> Query {
        Query {
            input: InputStream::Single(SingleInputStream::new("S")),
            selection: Selection::new().select(Expr::var("a")),
            output: OutputStream::new("Out", OutputEventKind::CurrentEvents),
            rate: None,
            annotations,
        }
    }

    #[test]
    fn annotation_lookup_by_key() {
        let q = query_with_annotations(vec![Annotation::new("info").element("name", "Q1")]);
        assert_eq!(q.name(), Some("Q1"));
        assert!(q.annotation_element("info", Some("missing")).is_none());
    }

    #[test]
    fn annotation_lookup_without_key_takes_first_element() {
        let q = query_with_annotations(vec![Annotation::new("synchronized").value("false")]);
        let element = q.annotation_element("synchronized", None).unwrap();
        assert_eq!(element.value, "false");
        assert!(element.key.is_none());
    }

    #[test]
    fn annotation_name_is_case_insensitive() {
        let q = query_with_annotations(vec![Annotation::new("Info").element("Name", "Q2")]);
        assert_eq!(q.name(), Some("Q2"));
    }

    #[test]
    fn missing_annotation() {
        let q = query_with_annotations(vec![]);
        assert!(q.name().is_none());
        assert!(q.annotation_element("synchronized", None).is_none());
    }

    #[test]
    fn window_detection() {
        let single = InputStream::Single(
            SingleInputStream::new("S").window(WindowSpec::Length(5)),
        );
        assert!(single.has_window());

        let bare = InputStream::Single(SingleInputStream::new("S"));
        assert!(!bare.has_window());

        let join = InputStream::Join(JoinInputStream {
            left: SingleInputStream::new("A"),
            right: SingleInputStream::new("B").window(WindowSpec::Time(Duration::from_secs(1))),
            kind: JoinKind::Inner,
            on: None,
            within: None,
        });
        assert!(join.has_window());
    }

    #[test]
    fn reference_id_prefers_alias() {
        let s = SingleInputStream::new("Trades").with_alias("t");
        assert_eq!(s.reference_id(), "t");
        assert_eq!(SingleInputStream::new("Trades").reference_id(), "Trades");
    }
}
