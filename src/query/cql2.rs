//! CQL2-JSON front-end.
//!
//! Accepts the basic and advanced comparison classes plus the basic spatial
//! operators. Temporal and array operators are rejected with
//! [`StacError::UnsupportedOperator`].

use crate::error::{Result, StacError};
use crate::geo::{Bbox, Geometry, SpatialRelation};
use crate::query::filter::{ComparisonOp, FilterExpr, Literal};
use serde_json::Value;

/// Operators that are valid CQL2 but not implemented here.
const UNSUPPORTED_OPS: &[&str] = &[
    "s_crosses",
    "s_equals",
    "s_overlaps",
    "s_touches",
    "t_after",
    "t_before",
    "t_contains",
    "t_disjoint",
    "t_during",
    "t_equals",
    "t_finishedby",
    "t_finishes",
    "t_intersects",
    "t_meets",
    "t_metby",
    "t_overlappedby",
    "t_overlaps",
    "t_startedby",
    "t_starts",
    "a_equals",
    "a_contains",
    "a_containedby",
    "a_overlaps",
    "accenti",
];

pub fn parse_cql2_json(value: &Value) -> Result<FilterExpr> {
    parse_expr(value)
}

pub fn parse_cql2_json_str(s: &str) -> Result<FilterExpr> {
    let value: Value = serde_json::from_str(s)
        .map_err(|e| StacError::InvalidQuery(format!("filter is not valid JSON: {}", e)))?;
    parse_cql2_json(&value)
}

fn invalid(msg: impl Into<String>) -> StacError {
    StacError::InvalidQuery(msg.into())
}

fn parse_expr(value: &Value) -> Result<FilterExpr> {
    if let Some(b) = value.as_bool() {
        // `true` is the identity filter; `false` is written as NOT(true).
        return Ok(if b {
            FilterExpr::and(vec![])
        } else {
            FilterExpr::not(FilterExpr::and(vec![]))
        });
    }
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(format!("expected an expression object, got {}", value)))?;
    let op = obj
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid("expression is missing \"op\""))?;
    let args: &[Value] = match obj.get("args") {
        Some(Value::Array(a)) => a,
        Some(_) => return Err(invalid(format!("\"args\" of {} must be an array", op))),
        None => &[],
    };
    let lower = op.to_ascii_lowercase();

    match lower.as_str() {
        "and" | "or" => {
            if args.len() < 2 {
                return Err(invalid(format!("{} needs at least two arguments", op)));
            }
            let parsed = args.iter().map(parse_expr).collect::<Result<Vec<_>>>()?;
            Ok(if lower == "and" {
                FilterExpr::and(parsed)
            } else {
                FilterExpr::or(parsed)
            })
        }
        "not" => {
            let [arg] = args else {
                return Err(invalid("not takes exactly one argument"));
            };
            Ok(FilterExpr::not(parse_expr(arg)?))
        }
        "isnull" => {
            let [arg] = args else {
                return Err(invalid("isNull takes exactly one argument"));
            };
            Ok(FilterExpr::IsNull {
                field: property(arg)?,
            })
        }
        "like" => {
            let [lhs, rhs] = args else {
                return Err(invalid("like takes exactly two arguments"));
            };
            let (lhs, lhs_ci) = unwrap_casei(lhs);
            let (rhs, rhs_ci) = unwrap_casei(rhs);
            let pattern = rhs
                .as_str()
                .ok_or_else(|| invalid("like pattern must be a string"))?;
            Ok(FilterExpr::Like {
                field: property(lhs)?,
                pattern: pattern.to_string(),
                case_insensitive: lhs_ci || rhs_ci,
            })
        }
        "in" => {
            let [lhs, rhs] = args else {
                return Err(invalid("in takes exactly two arguments"));
            };
            let list = rhs
                .as_array()
                .ok_or_else(|| invalid("in expects a list of values"))?;
            if list.is_empty() {
                return Err(invalid("in expects at least one value"));
            }
            Ok(FilterExpr::In {
                field: property(lhs)?,
                values: list.iter().map(literal).collect::<Result<Vec<_>>>()?,
            })
        }
        "between" => {
            let [field, low, high] = args else {
                return Err(invalid("between takes exactly three arguments"));
            };
            let field = property(field)?;
            Ok(FilterExpr::and(vec![
                FilterExpr::compare(field.clone(), ComparisonOp::Ge, literal(low)?),
                FilterExpr::compare(field, ComparisonOp::Le, literal(high)?),
            ]))
        }
        _ if lower.starts_with("s_") => {
            let relation = lower
                .strip_prefix("s_")
                .and_then(SpatialRelation::parse)
                .ok_or_else(|| StacError::UnsupportedOperator(op.to_string()))?;
            let [lhs, rhs] = args else {
                return Err(invalid(format!("{} takes exactly two arguments", op)));
            };
            // Either operand may carry the property; the relation is read
            // property-first, so swap within/contains when it comes second.
            match (property(lhs), property(rhs)) {
                (Ok(field), _) => Ok(FilterExpr::Spatial {
                    field,
                    relation,
                    geometry: geometry(rhs)?,
                }),
                (Err(_), Ok(field)) => Ok(FilterExpr::Spatial {
                    field,
                    relation: match relation {
                        SpatialRelation::Within => SpatialRelation::Contains,
                        SpatialRelation::Contains => SpatialRelation::Within,
                        other => other,
                    },
                    geometry: geometry(lhs)?,
                }),
                (Err(e), Err(_)) => Err(e),
            }
        }
        _ if UNSUPPORTED_OPS.contains(&lower.as_str()) => {
            Err(StacError::UnsupportedOperator(op.to_string()))
        }
        _ => match ComparisonOp::parse(op) {
            Some(cmp) => {
                let [lhs, rhs] = args else {
                    return Err(invalid(format!("{} takes exactly two arguments", op)));
                };
                match (property(lhs), property(rhs)) {
                    (Ok(field), Err(_)) => Ok(FilterExpr::compare(field, cmp, literal(rhs)?)),
                    (Err(_), Ok(field)) => {
                        Ok(FilterExpr::compare(field, cmp.flipped(), literal(lhs)?))
                    }
                    (Ok(_), Ok(_)) => Err(StacError::UnsupportedOperator(format!(
                        "{} between two properties",
                        op
                    ))),
                    (Err(e), Err(_)) => Err(e),
                }
            }
            None => Err(StacError::UnsupportedOperator(op.to_string())),
        },
    }
}

fn unwrap_casei(value: &Value) -> (&Value, bool) {
    let inner = value.as_object().and_then(|obj| {
        let op = obj.get("op")?.as_str()?;
        if !op.eq_ignore_ascii_case("casei") {
            return None;
        }
        match obj.get("args")?.as_array()?.as_slice() {
            [arg] => Some(arg),
            _ => None,
        }
    });
    match inner {
        Some(arg) => (arg, true),
        None => (value, false),
    }
}

fn property(value: &Value) -> Result<String> {
    value
        .get("property")
        .and_then(|p| p.as_str())
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("expected a property reference, got {}", value)))
}

fn literal(value: &Value) -> Result<Literal> {
    Literal::from_json(value).ok_or_else(|| invalid(format!("unsupported literal {}", value)))
}

fn geometry(value: &Value) -> Result<Geometry> {
    if let Some(coords) = value.get("bbox").and_then(|b| b.as_array()) {
        let nums = coords
            .iter()
            .map(|c| c.as_f64().ok_or_else(|| invalid("bbox values must be numbers")))
            .collect::<Result<Vec<_>>>()?;
        let bbox = Bbox::from_slice(&nums)?;
        bbox.validate()?;
        return Ok(bbox.to_polygon());
    }
    Geometry::from_json(value)
}
