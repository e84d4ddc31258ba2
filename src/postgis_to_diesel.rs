// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use postgis_diesel::types::{GeometryContainer, LineString, MultiLineString, Point};

pub fn point_geo_to_diesel(point_geo: geo::Point) -> Point {
    Point::new(point_geo.x(), point_geo.y(), Some(crate::WGS_84_SRID))
}

pub fn diesel_point_to_geo(point_diesel: &Point) -> geo::Point {
    geo::Point::new(point_diesel.x, point_diesel.y)
}

pub fn linestring_geo_to_diesel(linestring_geo: &geo::LineString) -> LineString<Point> {
    LineString {
        points: linestring_geo
            .coords()
            .map(|coord| Point::new(coord.x, coord.y, Some(crate::WGS_84_SRID)))
            .collect(),
        srid: Some(crate::WGS_84_SRID),
    }
}

pub fn multi_linestring_geo_to_diesel(
    multi_linestring_geo: &geo::MultiLineString,
) -> MultiLineString<Point> {
    MultiLineString {
        lines: multi_linestring_geo
            .iter()
            .map(linestring_geo_to_diesel)
            .collect(),
        srid: Some(crate::WGS_84_SRID),
    }
}

pub fn diesel_linestring_to_geo(linestring_diesel: &LineString<Point>) -> geo::LineString {
    geo::LineString::from_iter(linestring_diesel.points.iter().map(|point| geo::Coord {
        x: point.x,
        y: point.y,
    }))
}

pub fn diesel_multi_linestring_to_geo(
    multi_linestring_diesel: &MultiLineString<Point>,
) -> geo::MultiLineString {
    geo::MultiLineString::new(
        multi_linestring_diesel
            .lines
            .iter()
            .map(diesel_linestring_to_geo)
            .collect(),
    )
}

fn container_kind(container: &GeometryContainer<Point>) -> &'static str {
    match container {
        GeometryContainer::Point(_) => "Point",
        GeometryContainer::LineString(_) => "LineString",
        GeometryContainer::Polygon(_) => "Polygon",
        GeometryContainer::MultiPoint(_) => "MultiPoint",
        GeometryContainer::MultiLineString(_) => "MultiLineString",
        GeometryContainer::MultiPolygon(_) => "MultiPolygon",
        GeometryContainer::GeometryCollection(_) => "GeometryCollection",
        #[allow(unreachable_patterns)]
        _ => "Geometry",
    }
}

/// Route geometries are linear, anything else coming out of the store is rejected.
pub fn diesel_route_geometry_to_geo(
    container: &GeometryContainer<Point>,
) -> Result<geo::Geometry, String> {
    match container {
        GeometryContainer::LineString(linestring) => {
            Ok(diesel_linestring_to_geo(linestring).into())
        }
        GeometryContainer::MultiLineString(multi_linestring) => {
            Ok(diesel_multi_linestring_to_geo(multi_linestring).into())
        }
        other => Err(format!(
            "expected a LineString or MultiLineString, got a {}",
            container_kind(other)
        )),
    }
}

pub fn geo_route_geometry_to_diesel(
    geometry: &geo::Geometry,
) -> Result<GeometryContainer<Point>, String> {
    match geometry {
        geo::Geometry::LineString(linestring) => {
            let linestring = linestring_geo_to_diesel(linestring);
            Ok(GeometryContainer::LineString(linestring))
        }
        geo::Geometry::MultiLineString(multi_linestring) => {
            let multi_linestring = multi_linestring_geo_to_diesel(multi_linestring);
            Ok(GeometryContainer::MultiLineString(multi_linestring))
        }
        _ => Err(String::from(
            "only LineString and MultiLineString route geometries can be stored",
        )),
    }
}
