// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use crate::postgis_to_diesel::{geo_route_geometry_to_diesel, point_geo_to_diesel};
use crate::route_shapes::RouteShape;
use diesel::prelude::*;
use diesel::sql_types::*;
use postgis_diesel::sql_types::Geography;
use postgis_diesel::types::{GeometryContainer, Point};

/// One row of the route shapes calculation query.
#[derive(QueryableByName, Debug, Clone)]
pub struct RouteShapeRow {
    #[diesel(sql_type = Int8)]
    pub route_id: i64,
    #[diesel(sql_type = Int4)]
    pub direction_id: i32,
    //null in the union form
    #[diesel(sql_type = Nullable<Int8>)]
    pub shape_id: Option<i64>,
    #[diesel(sql_type = Geography)]
    pub geometry: GeometryContainer<Point>,
    #[diesel(sql_type = Geography)]
    pub centroid: Point,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::tl_route_geometries)]
pub struct NewRouteGeometry {
    pub route_id: i64,
    pub direction_id: i32,
    pub feed_version_id: i64,
    pub shape_id: Option<i64>,
    pub generated: bool,
    pub geometry: GeometryContainer<Point>,
    pub centroid: Point,
}

impl NewRouteGeometry {
    pub fn from_route_shape(
        route_shape: &RouteShape,
        feed_version_id: i64,
    ) -> Result<Self, String> {
        let geometry = geo_route_geometry_to_diesel(&route_shape.geometry).map_err(|reason| {
            format!(
                "route {} direction {}: {}",
                route_shape.route_id, route_shape.direction_id, reason
            )
        })?;

        Ok(Self {
            route_id: route_shape.route_id,
            direction_id: route_shape.direction_id,
            feed_version_id,
            shape_id: route_shape.shape_id,
            // this route geometry is always generated
            generated: true,
            geometry,
            centroid: point_geo_to_diesel(route_shape.centroid),
        })
    }
}
