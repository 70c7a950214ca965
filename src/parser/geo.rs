//! Geographic values: WKT parsing and rendering, GeoJSON detection,
//! centroids, and circle approximation for radius hints.
//!
//! Only points, linestrings, and polygons are recognised. Invalid shapes are
//! silently skipped by the parser; the raw values always survive as regular
//! data.

use serde_json::{Map, Value};

/// Metres per degree of latitude (WGS84 equatorial circumference / 360).
const METRES_PER_DEGREE: f64 = 111_319.490_793;

/// A WGS84 coordinate. WKT and GeoJSON both order coordinates lon, lat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self {
        Position { lon, lat }
    }

    pub(crate) fn in_range(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Position),
    LineString(Vec<Position>),
    /// Exterior ring first, then any holes. Rings are closed: the final
    /// position repeats the first.
    Polygon(Vec<Vec<Position>>),
}

impl Shape {
    /// Parses a WKT string, returning `None` unless it is a well-formed and
    /// valid point, linestring, or polygon.
    pub fn parse_wkt(raw: &str) -> Option<Shape> {
        let trimmed = raw.trim();
        let keyword_len = trimmed
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let keyword = trimmed[..keyword_len].to_ascii_uppercase();
        let body = trimmed[keyword_len..].trim();
        if !body.starts_with('(') || !body.ends_with(')') {
            return None;
        }
        let inner = &body[1..body.len() - 1];

        let shape = match keyword.as_str() {
            "POINT" => Shape::Point(parse_position(inner)?),
            "LINESTRING" => Shape::LineString(parse_positions(inner)?),
            "POLYGON" => {
                let mut rings = Vec::new();
                for ring in split_top_level(inner) {
                    let ring = ring.trim();
                    let ring = ring.strip_prefix('(')?.strip_suffix(')')?;
                    rings.push(parse_positions(ring)?);
                }
                Shape::Polygon(rings)
            }
            _ => return None,
        };
        shape.is_valid(false).then_some(shape)
    }

    /// Detects a GeoJSON geometry in a map: exactly the keys `type` and
    /// `coordinates`, a recognised type, and a valid geometry with RFC 7946
    /// polygon winding.
    pub fn from_geojson(map: &Map<String, Value>) -> Option<Shape> {
        if map.len() != 2 {
            return None;
        }
        let kind = map.get("type")?.as_str()?;
        let coordinates = map.get("coordinates")?;

        let shape = match kind {
            "Point" => Shape::Point(position_from_json(coordinates)?),
            "LineString" => Shape::LineString(positions_from_json(coordinates)?),
            "Polygon" => {
                let rings = coordinates
                    .as_array()?
                    .iter()
                    .map(positions_from_json)
                    .collect::<Option<Vec<_>>>()?;
                Shape::Polygon(rings)
            }
            _ => return None,
        };
        shape.is_valid(true).then_some(shape)
    }

    /// Structural validity: coordinate ranges everywhere, two or more points
    /// per linestring, and closed non-degenerate polygon rings. GeoJSON
    /// additionally requires RFC 7946 winding (counterclockwise exteriors,
    /// clockwise holes).
    fn is_valid(&self, check_winding: bool) -> bool {
        match self {
            Shape::Point(position) => position.in_range(),
            Shape::LineString(positions) => {
                positions.len() >= 2 && positions.iter().all(Position::in_range)
            }
            Shape::Polygon(rings) => {
                if rings.is_empty() {
                    return false;
                }
                rings.iter().enumerate().all(|(index, ring)| {
                    ring.len() >= 4
                        && ring.iter().all(Position::in_range)
                        && ring.first() == ring.last()
                        && ring.windows(2).all(|pair| pair[0] != pair[1])
                        && ring_area(ring) != 0.0
                        && (!check_winding
                            || if index == 0 {
                                ring_area(ring) > 0.0
                            } else {
                                ring_area(ring) < 0.0
                            })
                })
            }
        }
    }

    pub fn to_wkt(&self) -> String {
        match self {
            Shape::Point(position) => format!("POINT ({} {})", position.lon, position.lat),
            Shape::LineString(positions) => {
                format!("LINESTRING ({})", positions_to_wkt(positions))
            }
            Shape::Polygon(rings) => {
                let rings = rings
                    .iter()
                    .map(|ring| format!("({})", positions_to_wkt(ring)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("POLYGON ({})", rings)
            }
        }
    }

    /// The shape's centre of mass: the point itself, the length-weighted
    /// centroid of a linestring, or the area centroid of a polygon's
    /// exterior ring.
    pub fn centroid(&self) -> Option<Position> {
        match self {
            Shape::Point(position) => Some(*position),
            Shape::LineString(positions) => {
                let mut length = 0.0;
                let mut lon = 0.0;
                let mut lat = 0.0;
                for pair in positions.windows(2) {
                    let segment =
                        (pair[1].lon - pair[0].lon).hypot(pair[1].lat - pair[0].lat);
                    length += segment;
                    lon += segment * (pair[0].lon + pair[1].lon) / 2.0;
                    lat += segment * (pair[0].lat + pair[1].lat) / 2.0;
                }
                if length == 0.0 {
                    return positions.first().copied();
                }
                Some(Position::new(lon / length, lat / length))
            }
            Shape::Polygon(rings) => {
                let ring = rings.first()?;
                let area = ring_area(ring);
                if area == 0.0 {
                    return ring.first().copied();
                }
                let mut lon = 0.0;
                let mut lat = 0.0;
                for pair in ring.windows(2) {
                    let cross = pair[0].lon * pair[1].lat - pair[1].lon * pair[0].lat;
                    lon += (pair[0].lon + pair[1].lon) * cross;
                    lat += (pair[0].lat + pair[1].lat) * cross;
                }
                Some(Position::new(lon / (6.0 * area), lat / (6.0 * area)))
            }
        }
    }

    /// Approximates a circle around `centre` as a closed counterclockwise
    /// polygon of `4 * segments` perimeter vertices.
    pub fn circle(centre: Position, radius_metres: f64, segments: u16) -> Shape {
        let vertex_count = 4 * usize::from(segments);
        let lat_radius = radius_metres / METRES_PER_DEGREE;
        let lon_radius =
            radius_metres / (METRES_PER_DEGREE * centre.lat.to_radians().cos().max(1e-12));

        let mut ring = Vec::with_capacity(vertex_count + 1);
        for step in 0..vertex_count {
            let theta = std::f64::consts::TAU * (step as f64) / (vertex_count as f64);
            ring.push(Position::new(
                centre.lon + lon_radius * theta.cos(),
                centre.lat + lat_radius * theta.sin(),
            ));
        }
        ring.push(ring[0]);
        Shape::Polygon(vec![ring])
    }
}

/// Signed shoelace area of a closed ring, positive for counterclockwise.
fn ring_area(ring: &[Position]) -> f64 {
    ring.windows(2)
        .map(|pair| pair[0].lon * pair[1].lat - pair[1].lon * pair[0].lat)
        .sum::<f64>()
        / 2.0
}

fn positions_to_wkt(positions: &[Position]) -> String {
    positions
        .iter()
        .map(|p| format!("{} {}", p.lon, p.lat))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Splits on commas outside any parentheses.
fn split_top_level(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (offset, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&raw[start..offset]);
                start = offset + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

/// Parses `"lon lat"` (extra Z coordinates ignored).
fn parse_position(raw: &str) -> Option<Position> {
    let mut numbers = raw.split_whitespace().map(str::parse::<f64>);
    let lon = numbers.next()?.ok()?;
    let lat = numbers.next()?.ok()?;
    if numbers.any(|n| n.is_err()) {
        return None;
    }
    Some(Position::new(lon, lat))
}

fn parse_positions(raw: &str) -> Option<Vec<Position>> {
    split_top_level(raw)
        .into_iter()
        .map(parse_position)
        .collect()
}

fn position_from_json(value: &Value) -> Option<Position> {
    let numbers = value.as_array()?;
    if numbers.len() < 2 {
        return None;
    }
    // trailing Z coordinates are ignored
    Some(Position::new(
        numbers[0].as_f64()?,
        numbers[1].as_f64()?,
    ))
}

fn positions_from_json(value: &Value) -> Option<Vec<Position>> {
    value.as_array()?.iter().map(position_from_json).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_points_case_insensitively() {
        let shape = Shape::parse_wkt("point (-0.1 51.5)").unwrap();
        assert_eq!(shape, Shape::Point(Position::new(-0.1, 51.5)));
        assert_eq!(shape.to_wkt(), "POINT (-0.1 51.5)");
    }

    #[test]
    fn ignores_z_coordinates() {
        let shape = Shape::parse_wkt("POINT (10 20 333)").unwrap();
        assert_eq!(shape, Shape::Point(Position::new(10.0, 20.0)));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Shape::parse_wkt("POINT (181 0)").is_none());
        assert!(Shape::parse_wkt("POINT (0 -90.5)").is_none());
    }

    #[test]
    fn parses_linestrings_and_polygons() {
        assert!(Shape::parse_wkt("LINESTRING (0 0, 1 1, 2 0)").is_some());
        assert!(Shape::parse_wkt("POLYGON ((0 0, 1 0, 1 1, 0 1, 0 0))").is_some());
        assert!(
            Shape::parse_wkt("POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0), (1 1, 2 1, 2 2, 1 2, 1 1))")
                .is_some()
        );
    }

    #[test]
    fn rejects_unclosed_polygons() {
        assert!(Shape::parse_wkt("POLYGON ((0 0, 1 0, 1 1, 0 1))").is_none());
    }

    #[test]
    fn rejects_degenerate_rings() {
        assert!(Shape::parse_wkt("POLYGON ((0 0, 0 0, 0 0, 0 0))").is_none());
        assert!(Shape::parse_wkt("LINESTRING (0 0)").is_none());
    }

    #[test]
    fn rejects_unknown_keywords_and_noise() {
        assert!(Shape::parse_wkt("CIRCLE (0 0)").is_none());
        assert!(Shape::parse_wkt("not wkt at all").is_none());
        assert!(Shape::parse_wkt("POINT 0 0").is_none());
    }

    #[test]
    fn detects_geojson_maps_with_exact_keys() {
        let map = json!({"type": "Point", "coordinates": [-0.1, 51.5]});
        let shape = Shape::from_geojson(map.as_object().unwrap()).unwrap();
        assert_eq!(shape, Shape::Point(Position::new(-0.1, 51.5)));

        // extra keys mean it is just data
        let map = json!({"type": "Point", "coordinates": [-0.1, 51.5], "name": "x"});
        assert!(Shape::from_geojson(map.as_object().unwrap()).is_none());

        // unsupported geometry types are ignored
        let map = json!({"type": "MultiPoint", "coordinates": [[0, 0]]});
        assert!(Shape::from_geojson(map.as_object().unwrap()).is_none());
    }

    #[test]
    fn geojson_polygons_must_wind_counterclockwise() {
        let ccw = json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]],
        });
        assert!(Shape::from_geojson(ccw.as_object().unwrap()).is_some());

        let cw = json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [0, 1], [1, 1], [1, 0], [0, 0]]],
        });
        assert!(Shape::from_geojson(cw.as_object().unwrap()).is_none());
    }

    #[test]
    fn centroid_of_a_square_is_its_middle() {
        let shape = Shape::parse_wkt("POLYGON ((0 0, 2 0, 2 2, 0 2, 0 0))").unwrap();
        let centroid = shape.centroid().unwrap();
        assert!((centroid.lon - 1.0).abs() < 1e-9);
        assert!((centroid.lat - 1.0).abs() < 1e-9);
    }

    #[test]
    fn circles_have_four_triangles_per_segment() {
        let circle = Shape::circle(Position::new(-0.1, 51.5), 100.0, 8);
        let Shape::Polygon(rings) = &circle else {
            panic!("circles are polygons")
        };
        // 32 perimeter vertices plus the closing repeat
        assert_eq!(rings[0].len(), 33);
        assert_eq!(rings[0].first(), rings[0].last());
        assert!(ring_area(&rings[0]) > 0.0, "circles wind counterclockwise");
        assert!(circle.is_valid(true));
    }
}
