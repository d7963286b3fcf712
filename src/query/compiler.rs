use crate::error::{Result, StacError};
use crate::index::mapping::FieldKind;
use crate::query::dsl::EngineQueryNode;
use crate::query::filter::{ComparisonOp, FilterExpr, Literal};
use crate::query::queryables::{Queryables, ResolvedField};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Compiles a [`FilterExpr`] into an engine bool-query tree.
///
/// Compilation is pure: the same expression against the same queryables always
/// yields a structurally identical tree.
pub struct FilterCompiler {
    queryables: Queryables,
}

/// A scalar ready for the engine, or a whole-day window for date literals.
enum EngineValue {
    Scalar(Value),
    Day { start: Value, end: Value },
}

impl FilterCompiler {
    pub fn new(queryables: Queryables) -> Self {
        FilterCompiler { queryables }
    }

    pub const MAX_FILTER_DEPTH: usize = 10;
    pub const MAX_BOOLEAN_CLAUSES: usize = 1000;

    pub fn compile(&self, filter: &FilterExpr) -> Result<EngineQueryNode> {
        let clause_count = filter.leaf_count();
        if clause_count > Self::MAX_BOOLEAN_CLAUSES {
            return Err(StacError::InvalidQuery(format!(
                "Filter has {} clauses, exceeds maximum {}",
                clause_count,
                Self::MAX_BOOLEAN_CLAUSES
            )));
        }
        self.compile_node(filter, 0)
    }

    fn compile_node(&self, filter: &FilterExpr, depth: usize) -> Result<EngineQueryNode> {
        if depth >= Self::MAX_FILTER_DEPTH {
            return Err(StacError::InvalidQuery(format!(
                "Filter nesting exceeds {} levels",
                Self::MAX_FILTER_DEPTH
            )));
        }

        match filter {
            FilterExpr::And { args } => Ok(EngineQueryNode::must(self.compile_all(args, depth)?)),
            FilterExpr::Or { args } => Ok(EngineQueryNode::any_of(self.compile_all(args, depth)?)),
            FilterExpr::Not { arg } => Ok(EngineQueryNode::none_of(vec![
                self.compile_node(arg, depth + 1)?
            ])),
            FilterExpr::Compare { field, op, value } => {
                let field = self.queryables.resolve(field)?;
                self.compile_comparison(&field, *op, value)
            }
            FilterExpr::Like {
                field,
                pattern,
                case_insensitive,
            } => {
                let field = self.queryables.resolve(field)?;
                if !matches!(
                    field.kind,
                    FieldKind::Keyword | FieldKind::Text | FieldKind::Unknown
                ) {
                    return Err(StacError::InvalidQuery(format!(
                        "LIKE needs a string field, {} is {:?}",
                        field.path, field.kind
                    )));
                }
                Ok(EngineQueryNode::Wildcard {
                    field: field.path,
                    pattern: like_to_wildcard(pattern)?,
                    case_insensitive: *case_insensitive,
                })
            }
            FilterExpr::In { field, values } => {
                let field = self.queryables.resolve(field)?;
                // Dates match whole days and text fields match analyzed
                // tokens, so neither can be a plain terms lookup.
                if matches!(field.kind, FieldKind::Date | FieldKind::Text) {
                    let alternatives = values
                        .iter()
                        .map(|v| self.compile_comparison(&field, ComparisonOp::Eq, v))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(EngineQueryNode::any_of(alternatives));
                }
                let mut terms = Vec::with_capacity(values.len());
                for v in values {
                    match coerce(&field, v)? {
                        EngineValue::Scalar(s) => terms.push(s),
                        EngineValue::Day { .. } => unreachable!("date kinds handled above"),
                    }
                }
                Ok(EngineQueryNode::Terms {
                    field: field.path,
                    values: terms,
                })
            }
            FilterExpr::IsNull { field } => {
                let field = self.queryables.resolve(field)?;
                Ok(EngineQueryNode::none_of(vec![EngineQueryNode::Exists {
                    field: field.path,
                }]))
            }
            FilterExpr::Spatial {
                field,
                relation,
                geometry,
            } => {
                let field = self.queryables.resolve(field)?;
                if field.kind != FieldKind::GeoShape {
                    return Err(StacError::InvalidQuery(format!(
                        "spatial predicate on non-geometry field {}",
                        field.path
                    )));
                }
                Ok(EngineQueryNode::GeoShape {
                    field: field.path,
                    relation: *relation,
                    shape: geometry.clone().normalized()?,
                })
            }
        }
    }

    fn compile_all(&self, args: &[FilterExpr], depth: usize) -> Result<Vec<EngineQueryNode>> {
        args.iter()
            .map(|a| self.compile_node(a, depth + 1))
            .collect()
    }

    fn compile_comparison(
        &self,
        field: &ResolvedField,
        op: ComparisonOp,
        value: &Literal,
    ) -> Result<EngineQueryNode> {
        if field.kind == FieldKind::Text {
            return match (op, value) {
                (ComparisonOp::Eq, Literal::String(s)) => Ok(EngineQueryNode::MultiMatch {
                    query: s.clone(),
                    fields: vec![field.path.clone()],
                }),
                _ => Err(StacError::InvalidQuery(format!(
                    "{} is a full-text field; only '=' with a string is supported",
                    field.path
                ))),
            };
        }

        let path = field.path.clone();
        let range = |gt, gte, lt, lte| EngineQueryNode::Range {
            field: path.clone(),
            gt,
            gte,
            lt,
            lte,
        };

        let positive = match (op, coerce(field, value)?) {
            (ComparisonOp::Eq | ComparisonOp::Ne, EngineValue::Scalar(v)) => {
                EngineQueryNode::Term {
                    field: path.clone(),
                    value: v,
                }
            }
            (ComparisonOp::Eq | ComparisonOp::Ne, EngineValue::Day { start, end }) => {
                range(None, Some(start), None, Some(end))
            }
            (ComparisonOp::Lt, EngineValue::Scalar(v)) => range(None, None, Some(v), None),
            (ComparisonOp::Lt, EngineValue::Day { start, .. }) => {
                range(None, None, Some(start), None)
            }
            (ComparisonOp::Le, EngineValue::Scalar(v)) => range(None, None, None, Some(v)),
            (ComparisonOp::Le, EngineValue::Day { end, .. }) => range(None, None, None, Some(end)),
            (ComparisonOp::Gt, EngineValue::Scalar(v)) => range(Some(v), None, None, None),
            (ComparisonOp::Gt, EngineValue::Day { end, .. }) => range(Some(end), None, None, None),
            (ComparisonOp::Ge, EngineValue::Scalar(v)) => range(None, Some(v), None, None),
            (ComparisonOp::Ge, EngineValue::Day { start, .. }) => {
                range(None, Some(start), None, None)
            }
        };

        if op == ComparisonOp::Ne {
            // A missing value never satisfies a comparison, `<>` included.
            return Ok(EngineQueryNode::Bool(crate::query::dsl::BoolQuery {
                filter: vec![EngineQueryNode::Exists { field: path }],
                must_not: vec![positive],
                ..Default::default()
            }));
        }
        Ok(positive)
    }
}

fn format_timestamp(dt: DateTime<Utc>) -> Value {
    json!(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn parse_timestamp(field: &str, s: &str) -> Result<Value> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| format_timestamp(dt.with_timezone(&Utc)))
        .map_err(|e| StacError::InvalidQuery(format!("{}: bad timestamp {}: {}", field, s, e)))
}

fn parse_day(field: &str, s: &str) -> Result<EngineValue> {
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StacError::InvalidQuery(format!("{}: bad date {}: {}", field, s, e)))?;
    let start = day
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .ok_or_else(|| StacError::InvalidQuery(format!("{}: bad date {}", field, s)))?;
    let end = day
        .and_hms_milli_opt(23, 59, 59, 999)
        .map(|t| t.and_utc())
        .ok_or_else(|| StacError::InvalidQuery(format!("{}: bad date {}", field, s)))?;
    Ok(EngineValue::Day {
        start: format_timestamp(start),
        end: format_timestamp(end),
    })
}

/// Coerce a literal to the representation the field's mapping expects.
fn coerce(field: &ResolvedField, literal: &Literal) -> Result<EngineValue> {
    let mismatch = || {
        StacError::InvalidQuery(format!(
            "value {:?} does not match {} field {}",
            literal,
            field.kind.engine_type().unwrap_or("unknown"),
            field.path
        ))
    };
    let scalar = |v: Value| Ok(EngineValue::Scalar(v));

    match field.kind {
        FieldKind::Date => match literal {
            Literal::Timestamp(s) => scalar(parse_timestamp(&field.path, s)?),
            Literal::Date(s) => parse_day(&field.path, s),
            Literal::String(s) if s.len() == 10 => parse_day(&field.path, s),
            Literal::String(s) => scalar(parse_timestamp(&field.path, s)?),
            _ => Err(mismatch()),
        },
        FieldKind::Float | FieldKind::Long => match literal {
            Literal::Integer(i) => scalar(json!(i)),
            Literal::Float(f) if f.is_finite() => scalar(json!(f)),
            _ => Err(mismatch()),
        },
        FieldKind::Boolean => match literal {
            Literal::Boolean(b) => scalar(json!(b)),
            Literal::String(s) if s == "true" || s == "false" => scalar(json!(s == "true")),
            _ => Err(mismatch()),
        },
        FieldKind::Keyword | FieldKind::Unknown | FieldKind::Text => match literal {
            Literal::String(s) | Literal::Timestamp(s) | Literal::Date(s) => scalar(json!(s)),
            Literal::Integer(i) => scalar(json!(i)),
            Literal::Float(f) => scalar(json!(f)),
            Literal::Boolean(b) => scalar(json!(b)),
        },
        FieldKind::GeoShape | FieldKind::Disabled => Err(mismatch()),
    }
}

/// Translate a CQL2 `LIKE` pattern to engine wildcard syntax.
pub fn like_to_wildcard(pattern: &str) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('%' | '_')) => out.push(escaped),
                Some('\\') => out.push_str("\\\\"),
                Some(other) => push_literal(&mut out, other),
                None => {
                    return Err(StacError::InvalidQuery(format!(
                        "LIKE pattern ends with a dangling escape: {}",
                        pattern
                    )))
                }
            },
            '%' => out.push('*'),
            '_' => out.push('?'),
            other => push_literal(&mut out, other),
        }
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if matches!(c, '*' | '?' | '\\') {
        out.push('\\');
    }
    out.push(c);
}
