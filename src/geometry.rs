/// GeoJSON output of `geo` geometries and clipping to a tile's bounding box.
use geo::{
    coord, BooleanOps, BoundingRect, Coord, CoordsIter, Geometry, GeometryCollection, Intersects,
    LineString, MapCoords, MultiLineString, MultiPoint, MultiPolygon, Polygon, Rect,
};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::tile::BoundingBox;

/// Serializes a geometry as a GeoJSON geometry object.
pub struct GeoJson<'a>(pub &'a Geometry<f64>);

type Position = [f64; 2];

#[derive(serde::Serialize)]
#[serde(untagged)]
enum Coordinates {
    Point(Position),
    Line(Vec<Position>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

fn line(line_string: &LineString<f64>) -> Vec<Position> {
    line_string.coords().map(|c| [c.x, c.y]).collect()
}

fn rings(polygon: &Polygon<f64>) -> Vec<Vec<Position>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(line)
        .collect()
}

/// What follows the `type` member of a GeoJSON geometry.
enum Body<'a> {
    Coordinates(Coordinates),
    Geometries(Vec<GeoJson<'a>>),
}

fn body(geometry: &Geometry<f64>) -> (&'static str, Body<'_>) {
    match geometry {
        Geometry::Point(point) => ("Point", Body::Coordinates(Coordinates::Point([point.x(), point.y()]))),
        Geometry::MultiPoint(points) => (
            "MultiPoint",
            Body::Coordinates(Coordinates::Line(points.iter().map(|p| [p.x(), p.y()]).collect())),
        ),
        Geometry::Line(segment) => (
            "LineString",
            Body::Coordinates(Coordinates::Line(vec![
                [segment.start.x, segment.start.y],
                [segment.end.x, segment.end.y],
            ])),
        ),
        Geometry::LineString(line_string) => {
            ("LineString", Body::Coordinates(Coordinates::Line(line(line_string))))
        }
        Geometry::MultiLineString(lines) => (
            "MultiLineString",
            Body::Coordinates(Coordinates::Polygon(lines.iter().map(line).collect())),
        ),
        Geometry::Polygon(polygon) => ("Polygon", Body::Coordinates(Coordinates::Polygon(rings(polygon)))),
        Geometry::MultiPolygon(polygons) => (
            "MultiPolygon",
            Body::Coordinates(Coordinates::MultiPolygon(polygons.iter().map(rings).collect())),
        ),
        Geometry::Rect(rect) => (
            "Polygon",
            Body::Coordinates(Coordinates::Polygon(rings(&rect.to_polygon()))),
        ),
        Geometry::Triangle(triangle) => (
            "Polygon",
            Body::Coordinates(Coordinates::Polygon(rings(&triangle.to_polygon()))),
        ),
        Geometry::GeometryCollection(collection) => (
            "GeometryCollection",
            Body::Geometries(collection.0.iter().map(GeoJson).collect()),
        ),
    }
}

impl Serialize for GeoJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (kind, content) = body(self.0);
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", kind)?;
        match content {
            Body::Coordinates(coordinates) => map.serialize_entry("coordinates", &coordinates)?,
            Body::Geometries(members) => map.serialize_entry("geometries", &members)?,
        }
        map.end()
    }
}

/// `serialize_with` adapter for optional geometries; `None` is written as `null`.
pub fn serialize_optional<S: Serializer>(
    geometry: &Option<Geometry<f64>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match geometry {
        Some(geometry) => GeoJson(geometry).serialize(serializer),
        None => serializer.serialize_none(),
    }
}

pub fn intersects_bbox(geometry: &Geometry<f64>, bbox: &BoundingBox) -> bool {
    geometry.intersects(&bbox.to_rect())
}

/// The part of `geometry` inside `bbox`, or `None` when nothing remains.
///
/// Geometries already inside the box are returned unchanged. Otherwise every
/// output vertex keeps the exact coordinates of the input vertex it came from;
/// vertices created by the cut lie exactly on the box edges.
pub fn clip_to_bbox(geometry: &Geometry<f64>, bbox: &BoundingBox) -> Option<Geometry<f64>> {
    let rect = bbox.to_rect();
    let bounds = geometry.bounding_rect()?;
    if rect.min().x <= bounds.min().x
        && rect.min().y <= bounds.min().y
        && bounds.max().x <= rect.max().x
        && bounds.max().y <= rect.max().y
    {
        return Some(geometry.clone());
    }

    let window = rect.to_polygon();
    let snap = Snap::new(geometry, bounds, rect);

    match geometry {
        Geometry::Point(point) => point.intersects(&rect).then(|| Geometry::Point(*point)),
        Geometry::MultiPoint(points) => {
            let mut inside: Vec<_> = points.iter().filter(|p| p.intersects(&rect)).copied().collect();
            match inside.len() {
                0 => None,
                1 => inside.pop().map(Geometry::Point),
                _ => Some(Geometry::MultiPoint(MultiPoint::new(inside))),
            }
        }
        Geometry::Line(segment) => clip_lines(
            &window,
            LineString::from(vec![segment.start, segment.end]).into(),
            &snap,
        ),
        Geometry::LineString(line_string) => clip_lines(&window, line_string.clone().into(), &snap),
        Geometry::MultiLineString(lines) => clip_lines(&window, lines.clone(), &snap),
        Geometry::Polygon(polygon) => collapse(snap.apply(window.intersection(polygon))),
        Geometry::MultiPolygon(polygons) => collapse(snap.apply(window.intersection(polygons))),
        Geometry::Rect(other) => collapse(snap.apply(window.intersection(&other.to_polygon()))),
        Geometry::Triangle(triangle) => {
            collapse(snap.apply(window.intersection(&triangle.to_polygon())))
        }
        Geometry::GeometryCollection(collection) => {
            let parts: Vec<_> = collection
                .0
                .iter()
                .filter_map(|part| clip_to_bbox(part, bbox))
                .collect();
            (!parts.is_empty())
                .then(|| Geometry::GeometryCollection(GeometryCollection::new_from(parts)))
        }
    }
}

/// Boolean operations run on a fixed-point grid scaled to their inputs, which
/// shifts vertices by a few ulps of that grid. `Snap` moves them back.
struct Snap {
    vertices: Vec<Coord<f64>>,
    rect: Rect<f64>,
    tolerance: f64,
}

impl Snap {
    fn new(geometry: &Geometry<f64>, bounds: Rect<f64>, rect: Rect<f64>) -> Snap {
        let extent = bounds
            .width()
            .max(bounds.height())
            .max(rect.width())
            .max(rect.height());

        Snap {
            vertices: geometry.coords_iter().collect(),
            rect,
            tolerance: extent * 1e-8,
        }
    }

    fn near(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.tolerance
    }

    fn coord(&self, coord: Coord<f64>) -> Coord<f64> {
        if let Some(vertex) = self
            .vertices
            .iter()
            .find(|vertex| self.near(vertex.x, coord.x) && self.near(vertex.y, coord.y))
        {
            return *vertex;
        }

        // New vertices sit on a box edge and on an input segment; axis-aligned
        // segments share an ordinate with their end points.
        coord! {
            x: self.ordinate(coord.x, self.rect.min().x, self.rect.max().x, |vertex| vertex.x),
            y: self.ordinate(coord.y, self.rect.min().y, self.rect.max().y, |vertex| vertex.y),
        }
    }

    fn ordinate(&self, value: f64, min: f64, max: f64, of: fn(&Coord<f64>) -> f64) -> f64 {
        if self.near(value, min) {
            min
        } else if self.near(value, max) {
            max
        } else {
            self.vertices
                .iter()
                .map(of)
                .find(|ordinate| self.near(*ordinate, value))
                .unwrap_or(value)
        }
    }

    fn apply<G: MapCoords<f64, f64, Output = G>>(&self, clipped: G) -> G {
        clipped.map_coords(|coord| self.coord(coord))
    }
}

fn clip_lines(
    window: &Polygon<f64>,
    lines: MultiLineString<f64>,
    snap: &Snap,
) -> Option<Geometry<f64>> {
    let mut clipped = snap.apply(window.clip(&lines, false));
    match clipped.0.len() {
        0 => None,
        1 => clipped.0.pop().map(Geometry::LineString),
        _ => Some(Geometry::MultiLineString(clipped)),
    }
}

fn collapse(mut polygons: MultiPolygon<f64>) -> Option<Geometry<f64>> {
    match polygons.0.len() {
        0 => None,
        1 => polygons.0.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(polygons)),
    }
}

#[cfg(test)]
mod tests {
    use geo::{line_string, point, polygon};
    use serde_json::json;

    use super::*;

    fn unit_box() -> BoundingBox {
        BoundingBox {
            min_lon: 0.0,
            min_lat: 0.0,
            max_lon: 1.0,
            max_lat: 1.0,
            srid: 4326,
        }
    }

    #[test]
    fn test_point_geojson() {
        let geometry = Geometry::Point(point!(x: 1.5, y: -2.25));
        assert_eq!(
            json!({"type": "Point", "coordinates": [1.5, -2.25]}),
            serde_json::to_value(GeoJson(&geometry)).unwrap()
        );
    }

    #[test]
    fn test_polygon_geojson() {
        let geometry = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]);
        assert_eq!(
            json!({
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
            }),
            serde_json::to_value(GeoJson(&geometry)).unwrap()
        );
    }

    #[test]
    fn test_collection_geojson() {
        let geometry = Geometry::GeometryCollection(GeometryCollection::new_from(vec![
            Geometry::Point(point!(x: 1.0, y: 2.0)),
            Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 3.0, y: 4.0)]),
        ]));
        assert_eq!(
            json!({
                "type": "GeometryCollection",
                "geometries": [
                    {"type": "Point", "coordinates": [1.0, 2.0]},
                    {"type": "LineString", "coordinates": [[0.0, 0.0], [3.0, 4.0]]}
                ]
            }),
            serde_json::to_value(GeoJson(&geometry)).unwrap()
        );
    }

    #[test]
    fn test_clip_polygon_to_box() {
        let overlapping = Geometry::Polygon(polygon![
            (x: 0.9, y: 0.25),
            (x: 3.0, y: 0.25),
            (x: 3.0, y: 0.75),
            (x: 0.9, y: 0.75),
            (x: 0.9, y: 0.25),
        ]);

        let clipped = match clip_to_bbox(&overlapping, &unit_box()) {
            Some(Geometry::Polygon(polygon)) => polygon,
            other => panic!("expected a polygon, got {:?}", other),
        };

        let mut corners: Vec<(f64, f64)> = clipped.exterior().coords().map(|c| (c.x, c.y)).collect();
        corners.pop();
        corners.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(vec![(0.9, 0.25), (0.9, 0.75), (1.0, 0.25), (1.0, 0.75)], corners);
    }

    #[test]
    fn test_geometry_inside_box_is_untouched() {
        let bbox = BoundingBox {
            min_lon: -122.5,
            min_lat: 37.7,
            max_lon: -122.3,
            max_lat: 37.9,
            srid: 4326,
        };
        let inside = Geometry::Polygon(polygon![
            (x: -122.45, y: 37.75),
            (x: -122.35, y: 37.75),
            (x: -122.4, y: 37.85),
            (x: -122.45, y: 37.75),
        ]);
        assert_eq!(Some(inside.clone()), clip_to_bbox(&inside, &bbox));

        // Vertices inside the box survive a cut elsewhere with their exact values.
        let straddling = Geometry::Polygon(polygon![
            (x: -122.45, y: 37.75),
            (x: -122.1, y: 37.75),
            (x: -122.4, y: 37.85),
            (x: -122.45, y: 37.75),
        ]);
        let clipped = clip_to_bbox(&straddling, &bbox).unwrap();
        let coords: Vec<_> = clipped.coords_iter().collect();
        assert!(coords.contains(&coord! { x: -122.45, y: 37.75 }));
        assert!(coords.contains(&coord! { x: -122.4, y: 37.85 }));
        assert!(coords.iter().all(|c| c.x <= -122.3));
    }

    #[test]
    fn test_clip_line_and_points() {
        let crossing = Geometry::LineString(line_string![(x: -1.0, y: 0.5), (x: 2.0, y: 0.5)]);
        let mut ends: Vec<(f64, f64)> = clip_to_bbox(&crossing, &unit_box())
            .unwrap()
            .coords_iter()
            .map(|c| (c.x, c.y))
            .collect();
        ends.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(vec![(0.0, 0.5), (1.0, 0.5)], ends);

        let inside = Geometry::Point(point!(x: 0.5, y: 0.5));
        assert_eq!(Some(inside.clone()), clip_to_bbox(&inside, &unit_box()));

        let outside = Geometry::Point(point!(x: 5.0, y: 5.0));
        assert_eq!(None, clip_to_bbox(&outside, &unit_box()));
        assert!(!intersects_bbox(&outside, &unit_box()));
    }
}
