//! The engine-agnostic filter expression tree.
//!
//! Every front-end (CQL2-JSON, CQL2-text, the legacy Query extension) produces
//! a [`FilterExpr`]; only [`crate::query::FilterCompiler`] turns it into engine DSL.

use crate::geo::{Geometry, SpatialRelation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl ComparisonOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" | "eq" => Some(ComparisonOp::Eq),
            "<>" | "!=" | "neq" => Some(ComparisonOp::Ne),
            "<" | "lt" => Some(ComparisonOp::Lt),
            "<=" | "lte" => Some(ComparisonOp::Le),
            ">" | "gt" => Some(ComparisonOp::Gt),
            ">=" | "gte" => Some(ComparisonOp::Ge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        }
    }

    /// The operator that holds when the operands are swapped (`5 < x` is `x > 5`).
    pub fn flipped(&self) -> Self {
        match self {
            ComparisonOp::Lt => ComparisonOp::Gt,
            ComparisonOp::Le => ComparisonOp::Ge,
            ComparisonOp::Gt => ComparisonOp::Lt,
            ComparisonOp::Ge => ComparisonOp::Le,
            other => *other,
        }
    }
}

/// A scalar literal appearing on the right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// RFC 3339 timestamp, kept verbatim until the compiler normalizes it.
    Timestamp(String),
    /// `YYYY-MM-DD`.
    Date(String),
}

impl Literal {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Literal::String(s.clone())),
            serde_json::Value::Bool(b) => Some(Literal::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Literal::Integer(i)),
                None => n.as_f64().map(Literal::Float),
            },
            serde_json::Value::Object(obj) => {
                if let Some(ts) = obj.get("timestamp").and_then(|v| v.as_str()) {
                    Some(Literal::Timestamp(ts.to_string()))
                } else {
                    obj.get("date")
                        .and_then(|v| v.as_str())
                        .map(|d| Literal::Date(d.to_string()))
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Integer(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterExpr {
    Compare {
        field: String,
        op: ComparisonOp,
        value: Literal,
    },
    /// CQL2 `LIKE`: `%` matches any run, `_` one character, `\` escapes.
    Like {
        field: String,
        pattern: String,
        /// Set by CQL2 `CASEI(...)` around either operand.
        #[serde(default)]
        case_insensitive: bool,
    },
    In { field: String, values: Vec<Literal> },
    IsNull { field: String },
    And { args: Vec<FilterExpr> },
    Or { args: Vec<FilterExpr> },
    Not { arg: Box<FilterExpr> },
    Spatial {
        field: String,
        relation: SpatialRelation,
        geometry: Geometry,
    },
}

impl FilterExpr {
    pub fn compare(field: impl Into<String>, op: ComparisonOp, value: Literal) -> Self {
        FilterExpr::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn and(args: Vec<FilterExpr>) -> Self {
        FilterExpr::And { args }
    }

    pub fn or(args: Vec<FilterExpr>) -> Self {
        FilterExpr::Or { args }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(arg: FilterExpr) -> Self {
        FilterExpr::Not { arg: Box::new(arg) }
    }

    /// Conjunction of two optional filters, flattening nested `And`s.
    pub fn conjoin(left: Option<FilterExpr>, right: Option<FilterExpr>) -> Option<FilterExpr> {
        match (left, right) {
            (None, r) => r,
            (l, None) => l,
            (Some(l), Some(r)) => {
                let mut args = Vec::new();
                for e in [l, r] {
                    match e {
                        FilterExpr::And { args: inner } => args.extend(inner),
                        other => args.push(other),
                    }
                }
                Some(FilterExpr::And { args })
            }
        }
    }

    /// Number of leaf predicates; bounds the size of the compiled bool query.
    pub fn leaf_count(&self) -> usize {
        match self {
            FilterExpr::And { args } | FilterExpr::Or { args } => {
                args.iter().map(|a| a.leaf_count()).sum()
            }
            FilterExpr::Not { arg } => arg.leaf_count(),
            FilterExpr::In { values, .. } => values.len().max(1),
            _ => 1,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            FilterExpr::And { args } | FilterExpr::Or { args } => {
                1 + args.iter().map(|a| a.depth()).max().unwrap_or(0)
            }
            FilterExpr::Not { arg } => 1 + arg.depth(),
            _ => 1,
        }
    }
}
