// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::config::{AggregateOptions, AggregationPolicy};
use crate::error::RouteGeometryError;
use crate::models::RouteShapeRow;
use crate::postgres_tools::{CancelSignal, TransactionScope};
use crate::route_shapes::RouteShape;
use diesel::sql_types::{Array, Int8};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tracing::{debug, warn};

// distinct (route, direction, shape) triples of the feed version, $2 narrows the routes
fn trips_shapes_subquery(filter_routes: bool) -> String {
    let route_filter = if filter_routes {
        "\n          AND gt.route_id = ANY($2)"
    } else {
        ""
    };

    format!(
        "SELECT DISTINCT gt.route_id, gt.direction_id, gt.shape_id
        FROM gtfs_trips gt
        WHERE gt.feed_version_id = $1{route_filter}"
    )
}

/// Builds the route shapes calculation query.
///
/// `$1` is the feed version id, `$2` (only when `filter_routes`) the route ids.
/// Rows come out ordered by route id then direction id.
///
/// Selection policy ties on length go to the lowest shape id.
pub fn route_shapes_query(policy: AggregationPolicy, filter_routes: bool) -> String {
    let trips_shapes = trips_shapes_subquery(filter_routes);

    match policy {
        AggregationPolicy::Selection => format!(
            "SELECT DISTINCT ON (trips_shapes.route_id, trips_shapes.direction_id)
    trips_shapes.route_id,
    trips_shapes.direction_id,
    shapes.id AS shape_id,
    ST_Force2D(shapes.geometry::geometry)::geography AS geometry,
    ST_Centroid(ST_Force2D(shapes.geometry::geometry))::geography AS centroid
FROM ({trips_shapes}) trips_shapes
JOIN gtfs_shapes shapes ON shapes.id = trips_shapes.shape_id
WHERE shapes.feed_version_id = $1
ORDER BY trips_shapes.route_id, trips_shapes.direction_id, ST_Length(shapes.geometry) DESC, shapes.id ASC"
        ),
        AggregationPolicy::Union => format!(
            "SELECT
    trips_shapes.route_id,
    trips_shapes.direction_id,
    NULL::bigint AS shape_id,
    ST_Multi(ST_Union(ST_Force2D(shapes.geometry::geometry)))::geography AS geometry,
    ST_Centroid(ST_Union(ST_Force2D(shapes.geometry::geometry)))::geography AS centroid
FROM ({trips_shapes}) trips_shapes
JOIN gtfs_shapes shapes ON shapes.id = trips_shapes.shape_id
WHERE shapes.feed_version_id = $1
GROUP BY trips_shapes.route_id, trips_shapes.direction_id
ORDER BY trips_shapes.route_id, trips_shapes.direction_id"
        ),
    }
}

async fn load_route_shape_rows(
    conn: &mut AsyncPgConnection,
    sql: &str,
    options: &AggregateOptions,
) -> Result<Vec<RouteShapeRow>, diesel::result::Error> {
    let query = diesel::sql_query(sql).bind::<Int8, _>(options.feed_version_id);

    if options.route_ids.is_empty() {
        query.load::<RouteShapeRow>(conn).await
    } else {
        query
            .bind::<Array<Int8>, _>(options.route_ids.clone())
            .load::<RouteShapeRow>(conn)
            .await
    }
}

/// Turns query rows into route shapes, an empty result is a `NotFound`.
pub fn rows_to_route_shapes(
    rows: Vec<RouteShapeRow>,
    route_ids: &[i64],
) -> Result<Vec<RouteShape>, RouteGeometryError> {
    if rows.is_empty() {
        return Err(RouteGeometryError::NotFound {
            route_ids: route_ids.to_vec(),
        });
    }

    rows.into_iter()
        .map(|row| {
            RouteShape::try_from(row).map_err(|reason| RouteGeometryError::QueryBuild {
                route_ids: route_ids.to_vec(),
                reason,
            })
        })
        .collect()
}

/// Computes one [`RouteShape`] per route/direction of the feed version.
///
/// An empty `route_ids` considers every route. Zero resulting rows, be it an
/// unknown feed version or a filter matching nothing, is reported as
/// [`RouteGeometryError::NotFound`] carrying the filter. Firing `cancel`
/// aborts the query on the server.
pub async fn aggregate(
    conn: &mut AsyncPgConnection,
    options: &AggregateOptions,
    cancel: &CancelSignal,
) -> Result<Vec<RouteShape>, RouteGeometryError> {
    debug!(
        feed_version_id = options.feed_version_id,
        route_ids = ?options.route_ids,
        policy = ?options.policy,
        "starting calculating shapes from trips"
    );

    let sql = route_shapes_query(options.policy, !options.route_ids.is_empty());

    debug!(
        query = %sql,
        feed_version_id = options.feed_version_id,
        route_ids = ?options.route_ids,
        "route shapes calculation query built"
    );

    let loaded = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        rows = load_route_shape_rows(conn, &sql, options) => Some(rows),
    };

    let Some(loaded) = loaded else {
        conn.cancel_in_flight().await;
        warn!(
            feed_version_id = options.feed_version_id,
            "route shapes calculation cancelled"
        );
        return Err(RouteGeometryError::Cancelled);
    };

    let rows = loaded.map_err(|source| RouteGeometryError::Query {
        route_ids: options.route_ids.clone(),
        source,
    })?;

    let route_shapes = rows_to_route_shapes(rows, &options.route_ids)?;

    debug!(
        route_shapes = route_shapes.len(),
        "calculated shapes for routes"
    );

    Ok(route_shapes)
}
