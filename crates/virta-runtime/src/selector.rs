//! Query selection
//!
//! Compiles a query's projection, grouping and having clauses into a
//! [`QuerySelector`]. Each projected attribute becomes an
//! [`AttributeProcessor`]; the list is shared behind `Arc` because
//! snapshot rate limiting re-evaluates the same processors when it emits
//! the periodic result set. Building the selector also derives the output
//! stream definition and installs it on the combined schema, so callback
//! construction and snapshot finalization can read it afterwards.

use std::sync::Arc;

use tracing::debug;

use crate::expr::{resolve_expr, CompiledExpr, ExprError, ResolveScope};
use crate::populate::EventPopulator;
use crate::schema::{AttributeRef, MetaEvent};
use virta_core::{
    AttrType, Attribute, Expr, OutputStream, Selection, StreamDefinition,
};

/// Errors while compiling a selection.
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error("output attribute #{index} needs an alias; only bare variables may go unnamed")]
    MissingAlias { index: usize },
    #[error("unknown aggregation function '{function}'")]
    UnknownFunction { function: String },
    #[error("aggregation '{function}' takes {expected} argument(s), got {got}")]
    WrongArgumentCount {
        function: String,
        expected: usize,
        got: usize,
    },
}

/// Built-in aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    fn parse(function: &str) -> Option<Self> {
        match function.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateKind::Count),
            "sum" => Some(AggregateKind::Sum),
            "avg" => Some(AggregateKind::Avg),
            "min" => Some(AggregateKind::Min),
            "max" => Some(AggregateKind::Max),
            _ => None,
        }
    }

    /// Output type given the argument type, if any.
    fn output_type(self, argument: Option<AttrType>) -> AttrType {
        match self {
            AggregateKind::Count => AttrType::Int,
            AggregateKind::Avg => AttrType::Float,
            AggregateKind::Sum => match argument {
                Some(AttrType::Int) => AttrType::Int,
                _ => AttrType::Float,
            },
            AggregateKind::Min | AggregateKind::Max => {
                argument.unwrap_or(AttrType::Float)
            }
        }
    }
}

/// How one output attribute is computed.
#[derive(Debug, Clone)]
pub enum ProcessorKind {
    /// Forward one input attribute unchanged.
    Variable { expr: CompiledExpr },
    /// Incremental aggregation over the (possibly grouped) event stream.
    Aggregate {
        function: AggregateKind,
        argument: Option<CompiledExpr>,
    },
    /// Arbitrary scalar expression evaluated per event.
    Expression { expr: CompiledExpr },
}

/// Computes one attribute of the output schema.
#[derive(Debug, Clone)]
pub struct AttributeProcessor {
    output: Attribute,
    kind: ProcessorKind,
}

impl AttributeProcessor {
    pub fn output(&self) -> &Attribute {
        &self.output
    }

    pub fn kind(&self) -> &ProcessorKind {
        &self.kind
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, ProcessorKind::Aggregate { .. })
    }
}

/// The compiled selection stage of a query.
#[derive(Debug)]
pub struct QuerySelector {
    target: String,
    attribute_processors: Vec<Arc<AttributeProcessor>>,
    group_by: Vec<CompiledExpr>,
    having: Option<CompiledExpr>,
    /// Whether grouped output is batched per emission. On by default;
    /// snapshot rate limiting turns it off because the snapshot must see
    /// individual per-group values, not batch summaries.
    batching_enabled: bool,
    event_populator: Option<EventPopulator>,
}

impl QuerySelector {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn attribute_processors(&self) -> &[Arc<AttributeProcessor>] {
        &self.attribute_processors
    }

    pub fn contains_aggregates(&self) -> bool {
        self.attribute_processors.iter().any(|p| p.is_aggregate())
    }

    pub fn group_by(&self) -> &[CompiledExpr] {
        &self.group_by
    }

    pub fn having(&self) -> Option<&CompiledExpr> {
        self.having.as_ref()
    }

    pub fn is_batching_enabled(&self) -> bool {
        self.batching_enabled
    }

    pub fn set_batching_enabled(&mut self, enabled: bool) {
        if self.batching_enabled != enabled {
            debug!(target = %self.target, enabled, "selector batching toggled");
        }
        self.batching_enabled = enabled;
    }

    pub fn event_populator(&self) -> Option<&EventPopulator> {
        self.event_populator.as_ref()
    }

    /// Install the populator once the combined schema is frozen.
    pub fn set_event_populator(&mut self, populator: EventPopulator) {
        self.event_populator = Some(populator);
    }
}

fn resolve_aggregate(
    function: &str,
    args: &[Expr],
    meta: &mut MetaEvent,
    scope: ResolveScope,
    attr_refs: &mut Vec<AttributeRef>,
) -> Result<(AggregateKind, Option<CompiledExpr>), SelectError> {
    let kind = AggregateKind::parse(function).ok_or_else(|| SelectError::UnknownFunction {
        function: function.to_string(),
    })?;
    match (kind, args) {
        (AggregateKind::Count, []) => Ok((kind, None)),
        (AggregateKind::Count, _) => Err(SelectError::WrongArgumentCount {
            function: function.to_string(),
            expected: 0,
            got: args.len(),
        }),
        (_, [arg]) => {
            let compiled = resolve_expr(arg, meta, scope, attr_refs)?;
            Ok((kind, Some(compiled)))
        }
        _ => Err(SelectError::WrongArgumentCount {
            function: function.to_string(),
            expected: 1,
            got: args.len(),
        }),
    }
}

/// Static type of a compiled scalar expression.
fn expr_type(expr: &CompiledExpr) -> AttrType {
    match expr {
        CompiledExpr::Variable { ty, .. } => *ty,
        CompiledExpr::Const(value) => value.attr_type(),
        CompiledExpr::Compare { .. }
        | CompiledExpr::And(..)
        | CompiledExpr::Or(..)
        | CompiledExpr::Not(..) => AttrType::Bool,
        CompiledExpr::Math { left, right, .. } => {
            if expr_type(left) == AttrType::Int && expr_type(right) == AttrType::Int {
                AttrType::Int
            } else {
                AttrType::Float
            }
        }
    }
}

/// Compile a selection against the combined schema.
///
/// Installs the derived output definition on `meta`; every attribute access
/// lands in `attr_refs` for later position assignment.
pub fn build_selector(
    selection: &Selection,
    output: &OutputStream,
    meta: &mut MetaEvent,
    attr_refs: &mut Vec<AttributeRef>,
) -> Result<QuerySelector, SelectError> {
    let scope = ResolveScope::All;
    let mut processors = Vec::with_capacity(selection.attributes.len());
    let mut output_definition = StreamDefinition::new(&output.target);

    for (index, attr) in selection.attributes.iter().enumerate() {
        let (name, kind, ty) = match &attr.expr {
            Expr::Variable { attribute, .. } => {
                let expr = resolve_expr(&attr.expr, meta, scope, attr_refs)?;
                let ty = expr_type(&expr);
                let name = attr.alias.clone().unwrap_or_else(|| attribute.clone());
                (name, ProcessorKind::Variable { expr }, ty)
            }
            Expr::Call { function, args } => {
                let name = attr
                    .alias
                    .clone()
                    .ok_or(SelectError::MissingAlias { index })?;
                let (agg, argument) =
                    resolve_aggregate(function, args, meta, scope, attr_refs)?;
                let ty = agg.output_type(argument.as_ref().map(expr_type));
                (
                    name,
                    ProcessorKind::Aggregate {
                        function: agg,
                        argument,
                    },
                    ty,
                )
            }
            other => {
                let name = attr
                    .alias
                    .clone()
                    .ok_or(SelectError::MissingAlias { index })?;
                let expr = resolve_expr(other, meta, scope, attr_refs)?;
                let ty = expr_type(&expr);
                (name, ProcessorKind::Expression { expr }, ty)
            }
        };
        output_definition = output_definition.attribute(&name, ty);
        processors.push(Arc::new(AttributeProcessor {
            output: Attribute { name, ty },
            kind,
        }));
    }

    let group_by = selection
        .group_by
        .iter()
        .map(|expr| resolve_expr(expr, meta, scope, attr_refs))
        .collect::<Result<Vec<_>, _>>()?;

    let having = selection
        .having
        .as_ref()
        .map(|expr| resolve_expr(expr, meta, scope, attr_refs))
        .transpose()?;

    debug!(
        target = %output.target,
        attributes = processors.len(),
        grouped = !group_by.is_empty(),
        "selection compiled"
    );
    meta.set_output_definition(output_definition);

    Ok(QuerySelector {
        target: output.target.clone(),
        attribute_processors: processors,
        group_by,
        having,
        batching_enabled: true,
        event_populator: None,
    })
}
