//! GeoJSON geometries, bounding boxes, validation and planar spatial relations.
//!
//! The relation functions are used by the in-process engine; a real engine
//! evaluates `geo_shape` queries itself. Coordinates are `[lon, lat(, alt)]`.

use crate::error::{Result, StacError};
use serde::{Deserialize, Serialize};

pub type Position = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialRelation {
    Intersects,
    Within,
    Contains,
    Disjoint,
}

impl SpatialRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialRelation::Intersects => "intersects",
            SpatialRelation::Within => "within",
            SpatialRelation::Contains => "contains",
            SpatialRelation::Disjoint => "disjoint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "intersects" => Some(SpatialRelation::Intersects),
            "within" => Some(SpatialRelation::Within),
            "contains" => Some(SpatialRelation::Contains),
            "disjoint" => Some(SpatialRelation::Disjoint),
            _ => None,
        }
    }
}

impl Bbox {
    /// Parse a STAC bbox: 4 numbers (2D) or 6 numbers (3D, projected to 2D).
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        let (min_x, min_y, max_x, max_y) = match values.len() {
            4 => (values[0], values[1], values[2], values[3]),
            6 => (values[0], values[1], values[3], values[4]),
            n => {
                return Err(StacError::InvalidGeometry(format!(
                    "bbox must have 4 or 6 numbers, got {}",
                    n
                )))
            }
        };
        let bbox = Bbox {
            min_x,
            min_y,
            max_x,
            max_y,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<()> {
        for (x, y) in [(self.min_x, self.min_y), (self.max_x, self.max_y)] {
            check_lon_lat(x, y)?;
        }
        if self.min_y > self.max_y {
            return Err(StacError::InvalidGeometry(format!(
                "bbox south {} is greater than north {}",
                self.min_y, self.max_y
            )));
        }
        if self.min_x > self.max_x {
            return Err(StacError::InvalidGeometry(
                "bbox crossing the antimeridian is not supported".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.min_x, self.min_y, self.max_x, self.max_y]
    }

    pub fn to_polygon(&self) -> Geometry {
        Geometry::Polygon {
            coordinates: vec![vec![
                vec![self.min_x, self.min_y],
                vec![self.max_x, self.min_y],
                vec![self.max_x, self.max_y],
                vec![self.min_x, self.max_y],
                vec![self.min_x, self.min_y],
            ]],
        }
    }

    /// The box as the simplest valid shape: a point or a line when it has
    /// no area, a polygon otherwise.
    pub fn to_shape(&self) -> Geometry {
        let flat_x = self.min_x == self.max_x;
        let flat_y = self.min_y == self.max_y;
        match (flat_x, flat_y) {
            (true, true) => Geometry::Point {
                coordinates: vec![self.min_x, self.min_y],
            },
            (true, false) | (false, true) => Geometry::LineString {
                coordinates: vec![vec![self.min_x, self.min_y], vec![self.max_x, self.max_y]],
            },
            (false, false) => self.to_polygon(),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    pub fn union(&self, other: &Bbox) -> Bbox {
        Bbox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Geohash cell of a position, `precision` characters long.
pub fn geohash(lon: f64, lat: f64, precision: u8) -> String {
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let mut hash = String::with_capacity(precision as usize);
    let mut bits = 0u8;
    let mut ch = 0usize;
    let mut even = true;
    while hash.len() < precision as usize {
        let (lo, hi, v) = if even {
            (&mut lon_lo, &mut lon_hi, lon)
        } else {
            (&mut lat_lo, &mut lat_hi, lat)
        };
        let mid = (*lo + *hi) / 2.0;
        ch <<= 1;
        if v >= mid {
            ch |= 1;
            *lo = mid;
        } else {
            *hi = mid;
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            hash.push(GEOHASH_ALPHABET[ch] as char);
            bits = 0;
            ch = 0;
        }
    }
    hash
}

fn check_lon_lat(x: f64, y: f64) -> Result<()> {
    if !x.is_finite() || !y.is_finite() {
        return Err(StacError::InvalidGeometry(
            "coordinates must be finite numbers".to_string(),
        ));
    }
    if !(-180.0..=180.0).contains(&x) || !(-90.0..=90.0).contains(&y) {
        return Err(StacError::InvalidGeometry(format!(
            "coordinate ({}, {}) is outside lon [-180, 180] / lat [-90, 90]",
            x, y
        )));
    }
    Ok(())
}

fn check_position(p: &Position) -> Result<(f64, f64)> {
    if p.len() != 2 && p.len() != 3 {
        return Err(StacError::InvalidGeometry(format!(
            "position must have 2 or 3 numbers, got {}",
            p.len()
        )));
    }
    check_lon_lat(p[0], p[1])?;
    Ok((p[0], p[1]))
}

fn ring_points(ring: &[Position]) -> Vec<(f64, f64)> {
    ring.iter().map(|p| (p[0], p[1])).collect()
}

/// Shoelace formula; positive for counter-clockwise rings.
fn signed_area(ring: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    for w in ring.windows(2) {
        sum += w[0].0 * w[1].1 - w[1].0 * w[0].1;
    }
    sum / 2.0
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> bool {
    orientation(a, b, p).abs() < 1e-12
        && p.0 >= a.0.min(b.0) - 1e-12
        && p.0 <= a.0.max(b.0) + 1e-12
        && p.1 >= a.1.min(b.1) - 1e-12
        && p.1 <= a.1.max(b.1) + 1e-12
}

/// Closed-segment intersection test. Degenerate segments (a == b) act as points.
pub fn segments_intersect(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    on_segment(a1, b1, b2) || on_segment(a2, b1, b2) || on_segment(b1, a1, a2) || on_segment(b2, a1, a2)
}

/// Proper crossing only: the segments cross at a single interior point.
fn segments_cross(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// Ray casting over one ring. Points on the boundary are not reported as inside.
pub fn point_in_ring(x: f64, y: f64, ring: &[(f64, f64)]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn ring_has_self_intersection(ring: &[(f64, f64)]) -> bool {
    // Closed ring: edge i runs from ring[i] to ring[i + 1].
    let edges = ring.len() - 1;
    for i in 0..edges {
        for j in (i + 1)..edges {
            let adjacent = j == i + 1 || (i == 0 && j == edges - 1);
            if adjacent {
                continue;
            }
            if segments_intersect(ring[i], ring[i + 1], ring[j], ring[j + 1]) {
                return true;
            }
        }
    }
    false
}

fn validate_ring(ring: &[Position]) -> Result<()> {
    if ring.len() < 4 {
        return Err(StacError::InvalidGeometry(format!(
            "polygon ring must have at least 4 positions, got {}",
            ring.len()
        )));
    }
    for p in ring {
        check_position(p)?;
    }
    let mut pts = ring_points(ring);
    if pts.first() != pts.last() {
        return Err(StacError::InvalidGeometry(
            "polygon ring is not closed".to_string(),
        ));
    }
    // Repeated consecutive positions are zero-length edges, not crossings.
    pts.dedup();
    if pts.len() < 4 {
        return Err(StacError::InvalidGeometry(
            "polygon ring must have at least 3 distinct positions".to_string(),
        ));
    }
    if ring_has_self_intersection(&pts) {
        return Err(StacError::InvalidGeometry(
            "polygon ring is self-intersecting".to_string(),
        ));
    }
    if signed_area(&pts).abs() < f64::EPSILON {
        return Err(StacError::InvalidGeometry(
            "polygon ring has zero area".to_string(),
        ));
    }
    Ok(())
}

fn validate_polygon(rings: &[Vec<Position>]) -> Result<()> {
    if rings.is_empty() {
        return Err(StacError::InvalidGeometry(
            "polygon must have an exterior ring".to_string(),
        ));
    }
    rings.iter().try_for_each(|r| validate_ring(r))
}

/// Exterior ring counter-clockwise, holes clockwise (RFC 7946 right-hand rule).
fn normalize_polygon(rings: &mut [Vec<Position>]) {
    for (i, ring) in rings.iter_mut().enumerate() {
        let area = signed_area(&ring_points(ring));
        let want_ccw = i == 0;
        if (area > 0.0) != want_ccw {
            ring.reverse();
        }
    }
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| StacError::InvalidGeometry(format!("not a GeoJSON geometry: {}", e)))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Geometry::Point { coordinates } => check_position(coordinates).map(|_| ()),
            Geometry::MultiPoint { coordinates } => {
                coordinates.iter().try_for_each(|p| check_position(p).map(|_| ()))
            }
            Geometry::LineString { coordinates } => validate_line(coordinates),
            Geometry::MultiLineString { coordinates } => {
                coordinates.iter().try_for_each(|l| validate_line(l))
            }
            Geometry::Polygon { coordinates } => validate_polygon(coordinates),
            Geometry::MultiPolygon { coordinates } => {
                coordinates.iter().try_for_each(|p| validate_polygon(p))
            }
            Geometry::GeometryCollection { geometries } => {
                geometries.iter().try_for_each(|g| g.validate())
            }
        }
    }

    /// Validate, then return the geometry with polygon winding normalized.
    pub fn normalized(mut self) -> Result<Self> {
        self.validate()?;
        self.normalize_winding();
        Ok(self)
    }

    fn normalize_winding(&mut self) {
        match self {
            Geometry::Polygon { coordinates } => normalize_polygon(coordinates),
            Geometry::MultiPolygon { coordinates } => {
                coordinates.iter_mut().for_each(|p| normalize_polygon(p))
            }
            Geometry::GeometryCollection { geometries } => {
                geometries.iter_mut().for_each(|g| g.normalize_winding())
            }
            _ => {}
        }
    }

    pub fn bbox(&self) -> Option<Bbox> {
        let parts = self.parts();
        let mut all = parts
            .points
            .iter()
            .chain(parts.segments.iter().flat_map(|(a, b)| [a, b]))
            .copied();
        let (x0, y0) = all.next()?;
        let mut bbox = Bbox {
            min_x: x0,
            min_y: y0,
            max_x: x0,
            max_y: y0,
        };
        for (x, y) in all {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        Some(bbox)
    }

    fn parts(&self) -> Parts {
        let mut parts = Parts::default();
        self.collect_parts(&mut parts);
        parts
    }

    fn collect_parts(&self, parts: &mut Parts) {
        match self {
            Geometry::Point { coordinates } => parts.points.push((coordinates[0], coordinates[1])),
            Geometry::MultiPoint { coordinates } => parts
                .points
                .extend(coordinates.iter().map(|p| (p[0], p[1]))),
            Geometry::LineString { coordinates } => parts.add_line(coordinates),
            Geometry::MultiLineString { coordinates } => {
                coordinates.iter().for_each(|l| parts.add_line(l))
            }
            Geometry::Polygon { coordinates } => parts.add_polygon(coordinates),
            Geometry::MultiPolygon { coordinates } => {
                coordinates.iter().for_each(|p| parts.add_polygon(p))
            }
            Geometry::GeometryCollection { geometries } => {
                geometries.iter().for_each(|g| g.collect_parts(parts))
            }
        }
    }

    pub fn relate(&self, other: &Geometry, relation: SpatialRelation) -> bool {
        match relation {
            SpatialRelation::Intersects => intersects(&self.parts(), &other.parts()),
            SpatialRelation::Disjoint => !intersects(&self.parts(), &other.parts()),
            SpatialRelation::Within => within(&self.parts(), &other.parts()),
            SpatialRelation::Contains => within(&other.parts(), &self.parts()),
        }
    }
}

fn validate_line(line: &[Position]) -> Result<()> {
    if line.len() < 2 {
        return Err(StacError::InvalidGeometry(
            "line string must have at least 2 positions".to_string(),
        ));
    }
    line.iter().try_for_each(|p| check_position(p).map(|_| ()))
}

/// A geometry flattened into points, segments and polygons (rings as point lists).
#[derive(Default)]
struct Parts {
    points: Vec<(f64, f64)>,
    segments: Vec<((f64, f64), (f64, f64))>,
    polygons: Vec<Vec<Vec<(f64, f64)>>>,
}

impl Parts {
    fn add_line(&mut self, line: &[Position]) {
        let pts = ring_points(line);
        self.segments.extend(pts.windows(2).map(|w| (w[0], w[1])));
    }

    fn add_polygon(&mut self, rings: &[Vec<Position>]) {
        let rings: Vec<Vec<(f64, f64)>> = rings.iter().map(|r| ring_points(r)).collect();
        for ring in &rings {
            self.segments.extend(ring.windows(2).map(|w| (w[0], w[1])));
        }
        self.polygons.push(rings);
    }

    fn vertices(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points
            .iter()
            .copied()
            .chain(self.segments.iter().flat_map(|(a, b)| [*a, *b]))
    }

    fn edges(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
        self.points
            .iter()
            .map(|p| (*p, *p))
            .chain(self.segments.iter().copied())
    }

    fn covers_point(&self, p: (f64, f64)) -> bool {
        self.polygons.iter().any(|rings| {
            point_in_ring(p.0, p.1, &rings[0])
                && !rings[1..].iter().any(|hole| point_in_ring(p.0, p.1, hole))
        }) || self.edges().any(|(a, b)| on_segment(p, a, b))
    }
}

fn intersects(a: &Parts, b: &Parts) -> bool {
    for (a1, a2) in a.edges() {
        for (b1, b2) in b.edges() {
            if segments_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    a.vertices().any(|p| b.covers_point(p)) || b.vertices().any(|p| a.covers_point(p))
}

fn within(inner: &Parts, outer: &Parts) -> bool {
    let mut vertices = inner.vertices().peekable();
    if vertices.peek().is_none() {
        return false;
    }
    if !vertices.all(|p| outer.covers_point(p)) {
        return false;
    }
    for (a1, a2) in inner.segments.iter() {
        for (b1, b2) in outer.segments.iter() {
            if segments_cross(*a1, *a2, *b1, *b2) {
                return false;
            }
        }
    }
    true
}
