// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Representative geometries for every route/direction of a feed version.
//!
//! [`aggregate`] reduces the trip shapes of each route/direction to one
//! geometry inside PostGIS, [`persist`] upserts the result into
//! `tl_route_geometries` in a single transaction.

pub mod aggregate;
pub mod dry_run;
pub mod persist;

pub use aggregate::aggregate;
pub use persist::{RouteGeometrySink, UpsertError, persist};

use crate::models::RouteShapeRow;
use crate::postgis_to_diesel::{diesel_point_to_geo, diesel_route_geometry_to_geo};
use wkt::ToWkt;

/// The computed geometry of one route/direction.
///
/// `shape_id` is the longest trip shape under the selection policy and
/// `None` under the union policy. Coordinates are WGS84 longitude/latitude.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteShape {
    pub route_id: i64,
    pub direction_id: i32,
    pub shape_id: Option<i64>,
    pub geometry: geo::Geometry,
    pub centroid: geo::Point,
}

impl RouteShape {
    pub fn geometry_wkt(&self) -> String {
        self.geometry.wkt_string()
    }

    pub fn centroid_wkt(&self) -> String {
        self.centroid.wkt_string()
    }
}

impl TryFrom<RouteShapeRow> for RouteShape {
    type Error = String;

    fn try_from(row: RouteShapeRow) -> Result<Self, Self::Error> {
        let geometry = diesel_route_geometry_to_geo(&row.geometry).map_err(|reason| {
            format!(
                "route {} direction {}: {}",
                row.route_id, row.direction_id, reason
            )
        })?;

        Ok(RouteShape {
            route_id: row.route_id,
            direction_id: row.direction_id,
            shape_id: row.shape_id,
            geometry,
            centroid: diesel_point_to_geo(&row.centroid),
        })
    }
}
