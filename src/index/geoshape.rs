//! Planar shapes from WKT, queried by WITHIN / CONTAINS / INTERSECTS / DISJOINT

use crate::types::{parse_f64, DocId};
use crate::{Error, Result};

type Point = (f64, f64);

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Point),
    /// Outer ring, closed (first == last)
    Polygon(Vec<Point>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOp {
    Within,
    Contains,
    Intersects,
    Disjoint,
}

impl ShapeOp {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WITHIN" => Ok(ShapeOp::Within),
            "CONTAINS" => Ok(ShapeOp::Contains),
            "INTERSECTS" => Ok(ShapeOp::Intersects),
            "DISJOINT" => Ok(ShapeOp::Disjoint),
            other => Err(Error::syntax(format!("Unknown geoshape operator {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeOp::Within => "WITHIN",
            ShapeOp::Contains => "CONTAINS",
            ShapeOp::Intersects => "INTERSECTS",
            ShapeOp::Disjoint => "DISJOINT",
        }
    }
}

fn parse_coords(body: &str) -> Result<Vec<Point>> {
    body.split(',')
        .map(|pair| {
            let mut it = pair.split_whitespace();
            match (it.next().and_then(parse_f64), it.next().and_then(parse_f64), it.next()) {
                (Some(x), Some(y), None) => Ok((x, y)),
                _ => Err(Error::bad_argument(format!("Invalid WKT coordinate `{}`", pair.trim()))),
            }
        })
        .collect()
}

impl Shape {
    /// Parse `POINT (x y)` or `POLYGON ((x y, ...), ...)`. Inner rings are
    /// ignored.
    pub fn parse_wkt(wkt: &str) -> Result<Self> {
        let wkt = wkt.trim();
        let open = wkt
            .find('(')
            .ok_or_else(|| Error::bad_argument(format!("Invalid WKT `{wkt}`")))?;
        let kind = wkt[..open].trim().to_ascii_uppercase();
        let body = wkt[open..].trim();
        match kind.as_str() {
            "POINT" => {
                let inner = body
                    .strip_prefix('(')
                    .and_then(|b| b.strip_suffix(')'))
                    .ok_or_else(|| Error::bad_argument("Invalid WKT point"))?;
                match parse_coords(inner)?.as_slice() {
                    [p] => Ok(Shape::Point(*p)),
                    _ => Err(Error::bad_argument("Invalid WKT point")),
                }
            }
            "POLYGON" => {
                let inner = body
                    .strip_prefix("((")
                    .and_then(|b| b.split(')').next())
                    .ok_or_else(|| Error::bad_argument("Invalid WKT polygon"))?;
                let mut ring = parse_coords(inner)?;
                if ring.len() < 3 {
                    return Err(Error::bad_argument("Polygon needs at least three points"));
                }
                if ring.first() != ring.last() {
                    ring.push(ring[0]);
                }
                Ok(Shape::Polygon(ring))
            }
            other => Err(Error::bad_argument(format!("Unsupported WKT shape {other}"))),
        }
    }

    fn vertices(&self) -> &[Point] {
        match self {
            Shape::Point(p) => std::slice::from_ref(p),
            Shape::Polygon(ring) => ring,
        }
    }

    fn edges(&self) -> Vec<(Point, Point)> {
        match self {
            Shape::Point(_) => Vec::new(),
            Shape::Polygon(ring) => ring.windows(2).map(|w| (w[0], w[1])).collect(),
        }
    }

    /// Point inside or on the boundary.
    fn covers_point(&self, p: Point) -> bool {
        match self {
            Shape::Point(q) => *q == p,
            Shape::Polygon(ring) => {
                if ring.windows(2).any(|w| on_segment(w[0], w[1], p)) {
                    return true;
                }
                let mut inside = false;
                for w in ring.windows(2) {
                    let ((xi, yi), (xj, yj)) = (w[0], w[1]);
                    if (yi > p.1) != (yj > p.1) && p.0 < (xj - xi) * (p.1 - yi) / (yj - yi) + xi {
                        inside = !inside;
                    }
                }
                inside
            }
        }
    }

    pub fn within(&self, other: &Shape) -> bool {
        if let (Shape::Polygon(_), Shape::Point(_)) = (self, other) {
            return false;
        }
        self.vertices().iter().all(|p| other.covers_point(*p))
            && !edges_cross(&self.edges(), &other.edges())
    }

    pub fn contains(&self, other: &Shape) -> bool {
        other.within(self)
    }

    pub fn intersects(&self, other: &Shape) -> bool {
        self.vertices().iter().any(|p| other.covers_point(*p))
            || other.vertices().iter().any(|p| self.covers_point(*p))
            || edges_cross(&self.edges(), &other.edges())
    }

    pub fn matches(&self, op: ShapeOp, query: &Shape) -> bool {
        match op {
            ShapeOp::Within => self.within(query),
            ShapeOp::Contains => self.contains(query),
            ShapeOp::Intersects => self.intersects(query),
            ShapeOp::Disjoint => !self.intersects(query),
        }
    }
}

fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    orientation(a, b, p).abs() < 1e-12
        && p.0 >= a.0.min(b.0)
        && p.0 <= a.0.max(b.0)
        && p.1 >= a.1.min(b.1)
        && p.1 <= a.1.max(b.1)
}

/// Proper crossings only; touching endpoints do not count.
fn edges_cross(a: &[(Point, Point)], b: &[(Point, Point)]) -> bool {
    a.iter().any(|&(p1, p2)| {
        b.iter().any(|&(q1, q2)| {
            let d1 = orientation(q1, q2, p1);
            let d2 = orientation(q1, q2, p2);
            let d3 = orientation(p1, p2, q1);
            let d4 = orientation(p1, p2, q2);
            d1 * d2 < 0.0 && d3 * d4 < 0.0
        })
    })
}

#[derive(Debug, Clone, Default)]
pub struct GeoShapeIndex {
    shapes: Vec<(DocId, Shape)>,
}

impl GeoShapeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, doc_id: DocId, shape: Shape) {
        self.shapes.push((doc_id, shape));
    }

    pub fn query(&self, op: ShapeOp, shape: &Shape) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self
            .shapes
            .iter()
            .filter(|(_, s)| s.matches(op, shape))
            .map(|(id, _)| *id)
            .collect();
        ids.dedup();
        ids
    }

    pub fn num_entries(&self) -> usize {
        self.shapes.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.shapes
            .iter()
            .map(|(_, s)| std::mem::size_of::<DocId>() + s.vertices().len() * 16)
            .sum()
    }

    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        let before = self.memory_usage();
        self.shapes.retain(|(id, _)| dead.binary_search(id).is_err());
        before - self.memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Shape {
        Shape::parse_wkt(&format!(
            "POLYGON(({min} {min}, {max} {min}, {max} {max}, {min} {max}, {min} {min}))"
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_wkt() {
        assert_eq!(Shape::parse_wkt("POINT (1 2)").unwrap(), Shape::Point((1.0, 2.0)));
        let Shape::Polygon(ring) = Shape::parse_wkt("polygon((0 0, 1 0, 1 1))").unwrap() else {
            panic!("expected polygon");
        };
        assert_eq!(ring.len(), 4);
        assert!(Shape::parse_wkt("LINESTRING(0 0, 1 1)").is_err());
        assert!(Shape::parse_wkt("POINT (x y)").is_err());
    }

    #[test]
    fn test_within_and_contains() {
        let big = square(0.0, 10.0);
        let small = square(2.0, 3.0);
        let point = Shape::Point((5.0, 5.0));
        assert!(small.within(&big));
        assert!(!big.within(&small));
        assert!(big.contains(&point));
        assert!(point.within(&big));
        assert!(!point.within(&small));
    }

    #[test]
    fn test_index_query() {
        let mut index = GeoShapeIndex::new();
        index.insert(1, Shape::Point((1.0, 1.0)));
        index.insert(2, Shape::Point((20.0, 20.0)));
        index.insert(3, square(4.0, 6.0));
        let query = square(0.0, 10.0);
        assert_eq!(index.query(ShapeOp::Within, &query), vec![1, 3]);
        assert_eq!(index.query(ShapeOp::Contains, &Shape::Point((5.0, 5.0))), vec![3]);
        assert_eq!(index.query(ShapeOp::Disjoint, &query), vec![2]);
        assert!(index.collect_garbage(&[1]) > 0);
        assert_eq!(index.query(ShapeOp::Within, &query), vec![3]);
    }
}
