// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use thiserror::Error;

/// Everything that can go wrong while computing or persisting route geometries.
#[derive(Error, Debug)]
pub enum RouteGeometryError {
    /// Caller supplied input that cannot be used, reported before any query runs
    #[error("invalid input: {0}")]
    Input(String),
    /// The store could not be reached
    #[error("could not connect to the route geometry store: {0}")]
    Connection(String),
    /// A statement or a row conversion could not be built
    #[error("could not build the route shapes query for routes {route_ids:?}: {reason}")]
    QueryBuild { route_ids: Vec<i64>, reason: String },
    #[error("no route shapes calculated, zero result from the query, route ids: {route_ids:?}")]
    NotFound { route_ids: Vec<i64> },
    #[error("could not perform the route shapes calculation query for routes {route_ids:?}")]
    Query {
        route_ids: Vec<i64>,
        #[source]
        source: diesel::result::Error,
    },
    /// A batch upsert failed, the whole transaction has been rolled back
    #[error("route geometry batch {batch_index} ({rows} rows) could not be written")]
    Write {
        batch_index: usize,
        rows: usize,
        #[source]
        source: diesel::result::Error,
    },
    /// begin, commit or rollback failed
    #[error("transaction failure")]
    Transaction(#[source] diesel::result::Error),
    #[error("operation cancelled")]
    Cancelled,
}
