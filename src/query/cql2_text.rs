//! CQL2-text parser using nom combinators.
//!
//! Supported syntax:
//! - Comparisons: `eo:cloud_cover < 10`, `platform = 'sentinel-2a'`, `"my field" <> 3`
//! - `LIKE`, `IN (...)`, `BETWEEN a AND b` (each optionally negated), `IS [NOT] NULL`
//! - `CASEI(prop) LIKE CASEI('pat')`
//! - Literals: `'quoted ''string'''`, numbers, `TRUE`/`FALSE`, `TIMESTAMP('..')`, `DATE('..')`
//! - Spatial: `S_INTERSECTS(geometry, POLYGON((...)))`, `S_WITHIN`, `S_CONTAINS`,
//!   `S_DISJOINT`, with WKT geometries or `BBOX(x1, y1, x2, y2)`
//! - Logical: `AND`, `OR`, `NOT`, parentheses
//!
//! Keywords require word boundaries, as do function names.

use crate::error::{Result, StacError};
use crate::geo::{Bbox, Geometry, Position, SpatialRelation};
use crate::query::filter::{ComparisonOp, FilterExpr, Literal};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, multispace0, multispace1, satisfy},
    combinator::{cut, map, map_opt, opt, recognize},
    error::{Error as NomError, ErrorKind},
    multi::{many0, separated_list1},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

/// Parse a CQL2-text filter into a [`FilterExpr`].
///
/// Temporal, array and the remaining spatial functions are reported as
/// [`StacError::UnsupportedOperator`]; anything else that fails to parse is
/// [`StacError::InvalidQuery`].
pub fn parse_cql2_text(input: &str) -> Result<FilterExpr> {
    match expr(input.trim()) {
        Ok(("", f)) => Ok(f),
        Ok((remaining, _)) => Err(StacError::InvalidQuery(format!(
            "Unexpected input after filter: '{}'",
            remaining
        ))),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::Verify => {
            let name: String = e
                .input
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            Err(StacError::UnsupportedOperator(name))
        }
        Err(e) => Err(StacError::InvalidQuery(format!("Parse error: {}", e))),
    }
}

fn expr(input: &str) -> IResult<&str, FilterExpr> {
    or_expr(input)
}

fn or_expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, keyword("OR"), multispace0),
        cut(and_expr),
    ))(input)?;

    if rest.is_empty() {
        Ok((input, first))
    } else {
        let mut args = vec![first];
        args.extend(rest);
        Ok((input, FilterExpr::or(args)))
    }
}

fn and_expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = atom(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, keyword("AND"), multispace0),
        cut(atom),
    ))(input)?;

    if rest.is_empty() {
        Ok((input, first))
    } else {
        let mut args = vec![first];
        args.extend(rest);
        Ok((input, FilterExpr::and(args)))
    }
}

fn keyword<'a>(kw: &'static str) -> impl Fn(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (remaining, matched) = tag_no_case(kw)(input)?;

        if remaining
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == ':')
        {
            return Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag)));
        }

        Ok((remaining, matched))
    }
}

fn ws_char<'a>(c: char) -> impl FnMut(&'a str) -> IResult<&'a str, char> {
    delimited(multispace0, char(c), multispace0)
}

fn parenthesized(input: &str) -> IResult<&str, FilterExpr> {
    delimited(char('('), delimited(multispace0, expr, multispace0), char(')'))(input)
}

fn atom(input: &str) -> IResult<&str, FilterExpr> {
    let (input, _) = multispace0(input)?;
    alt((parenthesized, not_expr, function_predicate, field_predicate))(input)
}

fn not_expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, _) = keyword("NOT")(input)?;
    let (input, inner) = cut(preceded(multispace0, atom))(input)?;
    Ok((input, FilterExpr::not(inner)))
}

/// `NAME(` where NAME is a spatial, temporal or array function.
fn function_predicate(input: &str) -> IResult<&str, FilterExpr> {
    let (rest, name) = terminated(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        preceded(multispace0, char('(')),
    )(input)?;
    let lower = name.to_ascii_lowercase();
    let relation = match lower.split_once('_') {
        Some(("s", rel)) => SpatialRelation::parse(rel),
        Some(("t" | "a", _)) => None,
        _ => return Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag))),
    };
    let Some(relation) = relation else {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify)));
    };

    let (rest, (field, _, geometry)) = cut(terminated(
        tuple((
            delimited(multispace0, property_name, multispace0),
            char(','),
            delimited(multispace0, wkt, multispace0),
        )),
        char(')'),
    ))(rest)?;
    Ok((
        rest,
        FilterExpr::Spatial {
            field,
            relation,
            geometry,
        },
    ))
}

enum Tail {
    Compare(ComparisonOp, Literal),
    Like(String, bool),
    In(Vec<Literal>),
    Between(Literal, Literal),
    IsNull,
}

fn field_predicate(input: &str) -> IResult<&str, FilterExpr> {
    let (input, (field, field_casei)) = alt((
        map(casei(property_name), |f| (f, true)),
        map(property_name, |f| (f, false)),
    ))(input)?;
    let (input, _) = multispace0(input)?;

    let (input, (negated, tail)) = alt((
        map(
            tuple((
                keyword("IS"),
                multispace1,
                opt(terminated(keyword("NOT"), multispace1)),
                keyword("NULL"),
            )),
            |(_, _, not, _)| (not.is_some(), Tail::IsNull),
        ),
        pair(
            map(opt(terminated(keyword("NOT"), multispace1)), |n| n.is_some()),
            alt((like_tail, in_tail, between_tail)),
        ),
        map(comparison_tail, |t| (false, t)),
    ))(input)?;

    if field_casei && !matches!(tail, Tail::Like(..)) {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Tag)));
    }

    let predicate = match tail {
        Tail::Compare(op, value) => FilterExpr::compare(field, op, value),
        Tail::Like(pattern, pattern_casei) => FilterExpr::Like {
            field,
            pattern,
            case_insensitive: field_casei || pattern_casei,
        },
        Tail::In(values) => FilterExpr::In { field, values },
        Tail::Between(low, high) => FilterExpr::and(vec![
            FilterExpr::compare(field.clone(), ComparisonOp::Ge, low),
            FilterExpr::compare(field, ComparisonOp::Le, high),
        ]),
        Tail::IsNull => FilterExpr::IsNull { field },
    };
    Ok((
        input,
        if negated {
            FilterExpr::not(predicate)
        } else {
            predicate
        },
    ))
}

fn like_tail(input: &str) -> IResult<&str, Tail> {
    let (input, _) = terminated(keyword("LIKE"), multispace0)(input)?;
    let (input, (pattern, ci)) = cut(alt((
        map(casei(quoted_string), |p| (p, true)),
        map(quoted_string, |p| (p, false)),
    )))(input)?;
    Ok((input, Tail::Like(pattern, ci)))
}

fn in_tail(input: &str) -> IResult<&str, Tail> {
    let (input, _) = keyword("IN")(input)?;
    let (input, values) = cut(delimited(
        ws_char('('),
        separated_list1(ws_char(','), literal),
        ws_char(')'),
    ))(input)?;
    Ok((input, Tail::In(values)))
}

fn between_tail(input: &str) -> IResult<&str, Tail> {
    let (input, _) = terminated(keyword("BETWEEN"), multispace0)(input)?;
    let (input, (low, _, high)) = cut(tuple((
        literal,
        delimited(multispace0, keyword("AND"), multispace0),
        literal,
    )))(input)?;
    Ok((input, Tail::Between(low, high)))
}

fn comparison_tail(input: &str) -> IResult<&str, Tail> {
    let (input, op) = terminated(operator, multispace0)(input)?;
    let (input, value) = cut(literal)(input)?;
    Ok((input, Tail::Compare(op, value)))
}

fn operator(input: &str) -> IResult<&str, ComparisonOp> {
    map_opt(
        alt((
            tag(">="),
            tag("<="),
            tag("<>"),
            tag("!="),
            tag("="),
            tag(">"),
            tag("<"),
        )),
        ComparisonOp::parse,
    )(input)
}

fn casei<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    preceded(
        pair(keyword("CASEI"), ws_char('(')),
        terminated(inner, ws_char(')')),
    )
}

fn property_name(input: &str) -> IResult<&str, String> {
    alt((
        map(
            delimited(char('"'), take_while1(|c| c != '"'), char('"')),
            str::to_string,
        ),
        map(
            recognize(pair(
                satisfy(|c: char| c.is_alphabetic() || c == '_'),
                take_while(|c: char| c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')),
            )),
            str::to_string,
        ),
    ))(input)
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(
            preceded(keyword("TIMESTAMP"), cut(paren_string)),
            Literal::Timestamp,
        ),
        map(preceded(keyword("DATE"), cut(paren_string)), Literal::Date),
        map(keyword("TRUE"), |_| Literal::Boolean(true)),
        map(keyword("FALSE"), |_| Literal::Boolean(false)),
        map(quoted_string, Literal::String),
        number_value,
    ))(input)
}

fn paren_string(input: &str) -> IResult<&str, String> {
    delimited(ws_char('('), quoted_string, ws_char(')'))(input)
}

fn number_value(input: &str) -> IResult<&str, Literal> {
    let (input, num_str) = nom::number::complete::recognize_float(input)?;
    if num_str.contains('.') || num_str.contains('e') || num_str.contains('E') {
        let val = num_str
            .parse::<f64>()
            .map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::Float)))?;
        Ok((input, Literal::Float(val)))
    } else {
        let val = num_str
            .parse::<i64>()
            .map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::Digit)))?;
        Ok((input, Literal::Integer(val)))
    }
}

/// Single-quoted string; a doubled quote is an escaped quote.
fn quoted_string(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        match rest.chars().next() {
            None => return Err(nom::Err::Error(NomError::new(rest, ErrorKind::Char))),
            Some('\'') if rest[1..].starts_with('\'') => {
                out.push('\'');
                rest = &rest[2..];
            }
            Some('\'') => return Ok((&rest[1..], out)),
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

fn position(input: &str) -> IResult<&str, Position> {
    let (input, x) = preceded(multispace0, double)(input)?;
    let (input, y) = preceded(multispace1, double)(input)?;
    let (input, z) = opt(preceded(multispace1, double))(input)?;
    let mut p = vec![x, y];
    p.extend(z);
    Ok((input, p))
}

fn point_text(input: &str) -> IResult<&str, Position> {
    delimited(ws_char('('), position, ws_char(')'))(input)
}

fn line_text(input: &str) -> IResult<&str, Vec<Position>> {
    delimited(
        ws_char('('),
        separated_list1(ws_char(','), position),
        ws_char(')'),
    )(input)
}

fn polygon_text(input: &str) -> IResult<&str, Vec<Vec<Position>>> {
    delimited(
        ws_char('('),
        separated_list1(ws_char(','), line_text),
        ws_char(')'),
    )(input)
}

fn multipoint_text(input: &str) -> IResult<&str, Vec<Position>> {
    delimited(
        ws_char('('),
        separated_list1(ws_char(','), alt((point_text, position))),
        ws_char(')'),
    )(input)
}

fn multiline_text(input: &str) -> IResult<&str, Vec<Vec<Position>>> {
    delimited(
        ws_char('('),
        separated_list1(ws_char(','), line_text),
        ws_char(')'),
    )(input)
}

fn multipolygon_text(input: &str) -> IResult<&str, Vec<Vec<Vec<Position>>>> {
    delimited(
        ws_char('('),
        separated_list1(ws_char(','), polygon_text),
        ws_char(')'),
    )(input)
}

fn bbox_text(input: &str) -> IResult<&str, Geometry> {
    map_opt(
        delimited(
            ws_char('('),
            separated_list1(ws_char(','), double),
            ws_char(')'),
        ),
        |values: Vec<f64>| {
            let bbox = Bbox::from_slice(&values).ok()?;
            bbox.validate().ok()?;
            Some(bbox.to_polygon())
        },
    )(input)
}

/// Well-known text geometry, or `BBOX(...)`.
fn wkt(input: &str) -> IResult<&str, Geometry> {
    alt((
        map(
            preceded(keyword("MULTIPOINT"), cut(multipoint_text)),
            |coordinates| Geometry::MultiPoint { coordinates },
        ),
        map(
            preceded(keyword("MULTILINESTRING"), cut(multiline_text)),
            |coordinates| Geometry::MultiLineString { coordinates },
        ),
        map(
            preceded(keyword("MULTIPOLYGON"), cut(multipolygon_text)),
            |coordinates| Geometry::MultiPolygon { coordinates },
        ),
        map(preceded(keyword("POINT"), cut(point_text)), |coordinates| {
            Geometry::Point { coordinates }
        }),
        map(
            preceded(keyword("LINESTRING"), cut(line_text)),
            |coordinates| Geometry::LineString { coordinates },
        ),
        map(
            preceded(keyword("POLYGON"), cut(polygon_text)),
            |coordinates| Geometry::Polygon { coordinates },
        ),
        map(
            preceded(
                keyword("GEOMETRYCOLLECTION"),
                cut(delimited(
                    ws_char('('),
                    separated_list1(ws_char(','), wkt),
                    ws_char(')'),
                )),
            ),
            |geometries| Geometry::GeometryCollection { geometries },
        ),
        preceded(keyword("BBOX"), cut(bbox_text)),
    ))(input)
}
