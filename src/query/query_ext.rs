//! The legacy STAC Query extension (`"query": {"eo:cloud_cover": {"lt": 10}}`).

use crate::error::{Result, StacError};
use crate::query::filter::{ComparisonOp, FilterExpr, Literal};
use serde_json::Value;

/// Translate a Query-extension object into a conjunction of predicates.
///
/// Returns `None` for an empty object.
pub fn translate_query(query: &Value) -> Result<Option<FilterExpr>> {
    let fields = query
        .as_object()
        .ok_or_else(|| StacError::InvalidQuery("query must be an object".to_string()))?;

    let mut clauses = Vec::new();
    for (field, ops) in fields {
        let ops = ops.as_object().ok_or_else(|| {
            StacError::InvalidQuery(format!("query.{} must be an object of operators", field))
        })?;
        for (op, value) in ops {
            clauses.push(translate_op(field, op, value)?);
        }
    }

    Ok(match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(FilterExpr::and(clauses)),
    })
}

fn translate_op(field: &str, op: &str, value: &Value) -> Result<FilterExpr> {
    let lit = |v: &Value| {
        Literal::from_json(v).ok_or_else(|| {
            StacError::InvalidQuery(format!("query.{}.{}: unsupported value {}", field, op, v))
        })
    };
    let text = |v: &Value| {
        v.as_str().map(escape_like).ok_or_else(|| {
            StacError::InvalidQuery(format!("query.{}.{} expects a string", field, op))
        })
    };
    let like = |pattern: String| FilterExpr::Like {
        field: field.to_string(),
        pattern,
        case_insensitive: false,
    };

    match op {
        "startsWith" => Ok(like(format!("{}%", text(value)?))),
        "endsWith" => Ok(like(format!("%{}", text(value)?))),
        "contains" => Ok(like(format!("%{}%", text(value)?))),
        "in" => {
            let values = value
                .as_array()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    StacError::InvalidQuery(format!("query.{}.in expects a non-empty list", field))
                })?
                .iter()
                .map(lit)
                .collect::<Result<Vec<_>>>()?;
            Ok(FilterExpr::In {
                field: field.to_string(),
                values,
            })
        }
        _ => {
            let cmp = ComparisonOp::parse(op)
                .filter(|_| op.chars().all(|c| c.is_ascii_alphabetic()))
                .ok_or_else(|| StacError::UnsupportedOperator(op.to_string()))?;
            Ok(FilterExpr::compare(field, cmp, lit(value)?))
        }
    }
}

/// Escape LIKE metacharacters so the value matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_operator() {
        let f = translate_query(&json!({"eo:cloud_cover": {"lt": 10}}))
            .unwrap()
            .unwrap();
        assert_eq!(
            f,
            FilterExpr::compare("eo:cloud_cover", ComparisonOp::Lt, Literal::Integer(10))
        );
    }

    #[test]
    fn test_multiple_fields_are_anded_in_order() {
        let f = translate_query(&json!({
            "eo:cloud_cover": {"gte": 5, "lte": 15},
            "platform": {"in": ["sentinel-2a", "sentinel-2b"]}
        }))
        .unwrap()
        .unwrap();
        let FilterExpr::And { args } = f else {
            panic!("expected AND")
        };
        assert_eq!(args.len(), 3);
        assert!(matches!(&args[2], FilterExpr::In { values, .. } if values.len() == 2));
    }

    #[test]
    fn test_string_operators_escape_wildcards() {
        let f = translate_query(&json!({"title": {"startsWith": "100%_"}}))
            .unwrap()
            .unwrap();
        assert_eq!(
            f,
            FilterExpr::Like {
                field: "title".into(),
                pattern: "100\\%\\_%".into(),
                case_insensitive: false,
            }
        );
    }

    #[test]
    fn test_empty_and_invalid() {
        assert!(translate_query(&json!({})).unwrap().is_none());
        assert!(matches!(
            translate_query(&json!({"x": {"near": 1}})),
            Err(StacError::UnsupportedOperator(op)) if op == "near"
        ));
        assert!(matches!(
            translate_query(&json!({"x": {"=": 1}})),
            Err(StacError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            translate_query(&json!({"x": 3})),
            Err(StacError::InvalidQuery(_))
        ));
    }
}
