//! Expression resolution against the combined schema
//!
//! Filters, join conditions, projections, group-by keys and having clauses
//! all resolve their attribute accesses through [`resolve_expr`]. Resolution
//! marks each attribute as referenced on the meta event and appends an
//! [`AttributeRef`] to the query-wide accumulator; the compiled expression
//! keeps only the accumulator index, so operators can look positions up
//! once the schema is finalized.

use crate::schema::{AttributeRef, MetaEvent};
use virta_core::{AttrType, CompareOp, Expr, MathOp, Value};

/// Errors while resolving an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("unknown attribute '{attribute}'")]
    UnknownAttribute { attribute: String },
    #[error("attribute '{attribute}' is ambiguous across joined streams; qualify it")]
    AmbiguousAttribute { attribute: String },
    #[error("unknown stream reference '{stream}'")]
    UnknownStream { stream: String },
    #[error("function '{function}' is not allowed here")]
    UnexpectedFunction { function: String },
}

/// Which streams an expression may reference.
#[derive(Debug, Clone, Copy)]
pub enum ResolveScope {
    /// Only the stream at this index (single-stream filters).
    Stream(usize),
    /// Any participant stream (join conditions, selection over joins).
    All,
}

/// An expression compiled against the combined schema.
///
/// Variables are indices into the query's attribute-reference accumulator,
/// not direct positions: positions only exist after schema finalization.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Variable { ref_index: usize, ty: AttrType },
    Const(Value),
    Compare {
        op: CompareOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    And(Box<CompiledExpr>, Box<CompiledExpr>),
    Or(Box<CompiledExpr>, Box<CompiledExpr>),
    Not(Box<CompiledExpr>),
    Math {
        op: MathOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
}

impl CompiledExpr {
    /// Accumulator indices of every variable in this expression.
    pub fn ref_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<usize>) {
        match self {
            CompiledExpr::Variable { ref_index, .. } => out.push(*ref_index),
            CompiledExpr::Const(_) => {}
            CompiledExpr::Compare { left, right, .. }
            | CompiledExpr::Math { left, right, .. } => {
                left.collect_refs(out);
                right.collect_refs(out);
            }
            CompiledExpr::And(l, r) | CompiledExpr::Or(l, r) => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            CompiledExpr::Not(inner) => inner.collect_refs(out),
        }
    }
}

/// Resolve a variable access to (stream index, type), marking it referenced.
pub fn resolve_variable(
    meta: &mut MetaEvent,
    scope: ResolveScope,
    stream: Option<&str>,
    attribute: &str,
) -> Result<(usize, AttrType), ExprError> {
    match (scope, stream) {
        (ResolveScope::Stream(index), None) => {
            let ty = meta.streams_mut()[index]
                .mark_referenced(attribute)
                .ok_or_else(|| ExprError::UnknownAttribute {
                    attribute: attribute.to_string(),
                })?;
            Ok((index, ty))
        }
        (ResolveScope::Stream(index), Some(qualifier)) => {
            if meta.streams()[index].reference_id() != qualifier {
                return Err(ExprError::UnknownStream {
                    stream: qualifier.to_string(),
                });
            }
            let ty = meta.streams_mut()[index]
                .mark_referenced(attribute)
                .ok_or_else(|| ExprError::UnknownAttribute {
                    attribute: attribute.to_string(),
                })?;
            Ok((index, ty))
        }
        (ResolveScope::All, Some(qualifier)) => {
            let index = meta
                .streams()
                .iter()
                .position(|s| s.reference_id() == qualifier)
                .ok_or_else(|| ExprError::UnknownStream {
                    stream: qualifier.to_string(),
                })?;
            let ty = meta.streams_mut()[index]
                .mark_referenced(attribute)
                .ok_or_else(|| ExprError::UnknownAttribute {
                    attribute: attribute.to_string(),
                })?;
            Ok((index, ty))
        }
        (ResolveScope::All, None) => {
            let matches: Vec<usize> = meta
                .streams()
                .iter()
                .enumerate()
                .filter(|(_, s)| s.definition().get(attribute).is_some())
                .map(|(i, _)| i)
                .collect();
            match matches.as_slice() {
                [] => Err(ExprError::UnknownAttribute {
                    attribute: attribute.to_string(),
                }),
                [index] => {
                    let ty = meta.streams_mut()[*index]
                        .mark_referenced(attribute)
                        .expect("attribute present in matched definition");
                    Ok((*index, ty))
                }
                _ => Err(ExprError::AmbiguousAttribute {
                    attribute: attribute.to_string(),
                }),
            }
        }
    }
}

/// Compile an expression, appending every attribute access to `attr_refs`.
///
/// Function calls are rejected here: aggregations are only legal in
/// selections, where the selection collaborator intercepts them before
/// delegating argument resolution to this function.
pub fn resolve_expr(
    expr: &Expr,
    meta: &mut MetaEvent,
    scope: ResolveScope,
    attr_refs: &mut Vec<AttributeRef>,
) -> Result<CompiledExpr, ExprError> {
    match expr {
        Expr::Variable { stream, attribute } => {
            let (stream_index, ty) =
                resolve_variable(meta, scope, stream.as_deref(), attribute)?;
            let ref_index = attr_refs.len();
            attr_refs.push(AttributeRef {
                stream_index,
                attribute: attribute.clone(),
                ty,
                position: None,
            });
            Ok(CompiledExpr::Variable { ref_index, ty })
        }
        Expr::Const(value) => Ok(CompiledExpr::Const(value.clone())),
        Expr::Compare { op, left, right } => Ok(CompiledExpr::Compare {
            op: *op,
            left: Box::new(resolve_expr(left, meta, scope, attr_refs)?),
            right: Box::new(resolve_expr(right, meta, scope, attr_refs)?),
        }),
        Expr::And(left, right) => Ok(CompiledExpr::And(
            Box::new(resolve_expr(left, meta, scope, attr_refs)?),
            Box::new(resolve_expr(right, meta, scope, attr_refs)?),
        )),
        Expr::Or(left, right) => Ok(CompiledExpr::Or(
            Box::new(resolve_expr(left, meta, scope, attr_refs)?),
            Box::new(resolve_expr(right, meta, scope, attr_refs)?),
        )),
        Expr::Not(inner) => Ok(CompiledExpr::Not(Box::new(resolve_expr(
            inner, meta, scope, attr_refs,
        )?))),
        Expr::Math { op, left, right } => Ok(CompiledExpr::Math {
            op: *op,
            left: Box::new(resolve_expr(left, meta, scope, attr_refs)?),
            right: Box::new(resolve_expr(right, meta, scope, attr_refs)?),
        }),
        Expr::Call { function, .. } => Err(ExprError::UnexpectedFunction {
            function: function.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MetaEvent, MetaStreamEvent};
    use virta_core::{AttrType, StreamDefinition};

    fn single_meta() -> MetaEvent {
        MetaEvent::stream(MetaStreamEvent::new(
            StreamDefinition::new("Trades")
                .attribute("symbol", AttrType::Str)
                .attribute("price", AttrType::Float),
            None,
        ))
    }

    fn join_meta() -> MetaEvent {
        MetaEvent::join(vec![
            MetaStreamEvent::new(
                StreamDefinition::new("Trades")
                    .attribute("symbol", AttrType::Str)
                    .attribute("price", AttrType::Float),
                Some("t".into()),
            ),
            MetaStreamEvent::new(
                StreamDefinition::new("Quotes")
                    .attribute("symbol", AttrType::Str)
                    .attribute("bid", AttrType::Float),
                Some("q".into()),
            ),
        ])
    }

    #[test]
    fn resolving_marks_attribute_and_appends_ref() {
        let mut meta = single_meta();
        let mut refs = Vec::new();
        let compiled = resolve_expr(
            &Expr::compare(CompareOp::Gt, Expr::var("price"), Expr::value(100.0)),
            &mut meta,
            ResolveScope::Stream(0),
            &mut refs,
        )
        .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].attribute, "price");
        assert!(meta.streams()[0].is_referenced("price"));
        assert!(!meta.streams()[0].is_referenced("symbol"));
        assert_eq!(compiled.ref_indices(), vec![0]);
    }

    #[test]
    fn unknown_attribute_fails() {
        let mut meta = single_meta();
        let mut refs = Vec::new();
        let err = resolve_expr(
            &Expr::var("missing"),
            &mut meta,
            ResolveScope::Stream(0),
            &mut refs,
        )
        .unwrap_err();
        assert!(matches!(err, ExprError::UnknownAttribute { .. }));
    }

    #[test]
    fn ambiguous_attribute_in_join_requires_qualifier() {
        let mut meta = join_meta();
        let mut refs = Vec::new();
        let err = resolve_expr(
            &Expr::var("symbol"),
            &mut meta,
            ResolveScope::All,
            &mut refs,
        )
        .unwrap_err();
        assert!(matches!(err, ExprError::AmbiguousAttribute { .. }));

        let compiled = resolve_expr(
            &Expr::var_of("q", "symbol"),
            &mut meta,
            ResolveScope::All,
            &mut refs,
        )
        .unwrap();
        assert_eq!(refs[0].stream_index, 1);
        assert_eq!(compiled.ref_indices(), vec![0]);
    }

    #[test]
    fn unambiguous_attribute_in_join_resolves_without_qualifier() {
        let mut meta = join_meta();
        let mut refs = Vec::new();
        resolve_expr(&Expr::var("bid"), &mut meta, ResolveScope::All, &mut refs).unwrap();
        assert_eq!(refs[0].stream_index, 1);
        assert_eq!(refs[0].ty, AttrType::Float);
    }

    #[test]
    fn wrong_qualifier_for_single_stream_fails() {
        let mut meta = single_meta();
        let mut refs = Vec::new();
        let err = resolve_expr(
            &Expr::var_of("other", "price"),
            &mut meta,
            ResolveScope::Stream(0),
            &mut refs,
        )
        .unwrap_err();
        assert!(matches!(err, ExprError::UnknownStream { .. }));
    }

    #[test]
    fn function_calls_are_rejected_outside_selection() {
        let mut meta = single_meta();
        let mut refs = Vec::new();
        let err = resolve_expr(
            &Expr::call("sum", vec![Expr::var("price")]),
            &mut meta,
            ResolveScope::Stream(0),
            &mut refs,
        )
        .unwrap_err();
        assert!(matches!(err, ExprError::UnexpectedFunction { .. }));
    }
}
