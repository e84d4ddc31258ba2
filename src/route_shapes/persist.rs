// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::config::{PersistOptions, validate_batch_size};
use crate::error::RouteGeometryError;
use crate::models::NewRouteGeometry;
use crate::postgres_tools::{CancelSignal, TransactionScope, with_transaction};
use crate::route_shapes::RouteShape;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("could not build query for bulk insert of route shapes: {0}")]
    Build(String),
    #[error("error during insert query execution")]
    Execute(#[from] diesel::result::Error),
}

/// A store that route geometries can be upserted into, one batch per call.
pub trait RouteGeometrySink: TransactionScope {
    /// Upserts `batch` keyed on (route_id, direction_id), replacing every other
    /// column of an existing row. Returns the affected row count.
    fn upsert_route_geometries(
        &mut self,
        batch: &[RouteShape],
        feed_version_id: i64,
    ) -> impl Future<Output = Result<usize, UpsertError>> + Send;
}

impl RouteGeometrySink for AsyncPgConnection {
    async fn upsert_route_geometries(
        &mut self,
        batch: &[RouteShape],
        feed_version_id: i64,
    ) -> Result<usize, UpsertError> {
        use crate::schema::tl_route_geometries::dsl as route_geometries_columns;
        use crate::schema::tl_route_geometries::dsl::tl_route_geometries;

        let rows = batch
            .iter()
            .map(|route_shape| NewRouteGeometry::from_route_shape(route_shape, feed_version_id))
            .collect::<Result<Vec<NewRouteGeometry>, String>>()
            .map_err(UpsertError::Build)?;

        let affected = diesel::insert_into(tl_route_geometries)
            .values(&rows)
            .on_conflict((
                route_geometries_columns::route_id,
                route_geometries_columns::direction_id,
            ))
            .do_update()
            .set((
                route_geometries_columns::feed_version_id
                    .eq(excluded(route_geometries_columns::feed_version_id)),
                route_geometries_columns::shape_id
                    .eq(excluded(route_geometries_columns::shape_id)),
                route_geometries_columns::generated
                    .eq(excluded(route_geometries_columns::generated)),
                route_geometries_columns::geometry
                    .eq(excluded(route_geometries_columns::geometry)),
                route_geometries_columns::centroid
                    .eq(excluded(route_geometries_columns::centroid)),
            ))
            .execute(self)
            .await?;

        Ok(affected)
    }
}

/// Splits the rows into batches of `batch_size`, keeping their order.
/// Every batch but the last has exactly `batch_size` rows.
pub fn batches<T>(rows: &[T], batch_size: usize) -> std::slice::Chunks<'_, T> {
    rows.chunks(batch_size)
}

fn batch_route_ids(batch: &[RouteShape]) -> Vec<i64> {
    let mut route_ids: Vec<i64> = batch.iter().map(|route_shape| route_shape.route_id).collect();
    route_ids.dedup();
    route_ids
}

/// Writes the route shapes of a feed version, all of them or none.
///
/// Every batch runs inside one transaction. A batch that cannot be built or
/// executed, a panic, or a cancellation rolls back the batches already applied.
/// The returned count is informational, an upsert that rewrites a row with
/// identical values may not be counted by every store.
///
/// (route_id, direction_id) must be unique across `route_shapes`: Postgres
/// refuses to update the same row twice in one upsert statement, and across
/// batches the later row would silently win. [`aggregate`](super::aggregate::aggregate)
/// output always satisfies this.
pub async fn persist<S: RouteGeometrySink>(
    conn: &mut S,
    route_shapes: &[RouteShape],
    feed_version_id: i64,
    options: &PersistOptions,
    cancel: &CancelSignal,
) -> Result<usize, RouteGeometryError> {
    let batch_size = validate_batch_size(options.batch_size)?;

    if route_shapes.is_empty() {
        debug!(feed_version_id, "no route shapes to set");
        return Ok(0);
    }

    debug!(
        feed_version_id,
        route_shapes = route_shapes.len(),
        batch_size,
        "starting set route shapes"
    );

    let result = with_transaction(conn, cancel, |conn| {
        async move {
            let mut inserted_routes = 0;

            for (batch_index, batch) in batches(route_shapes, batch_size).enumerate() {
                let affected = conn
                    .upsert_route_geometries(batch, feed_version_id)
                    .await
                    .map_err(|e| match e {
                        UpsertError::Build(reason) => RouteGeometryError::QueryBuild {
                            route_ids: batch_route_ids(batch),
                            reason: format!("batch {}: {}", batch_index, reason),
                        },
                        UpsertError::Execute(source) => RouteGeometryError::Write {
                            batch_index,
                            rows: batch.len(),
                            source,
                        },
                    })?;

                inserted_routes += affected;

                debug!(
                    batch_index,
                    batch_dimension = batch_size,
                    inserted_rows = affected,
                    "inserted shapes"
                );
            }

            Ok::<usize, RouteGeometryError>(inserted_routes)
        }
        .scope_boxed()
    })
    .await;

    match &result {
        Ok(inserted_routes) => info!(feed_version_id, inserted_routes, "route shapes set"),
        Err(e) => error!(feed_version_id, error = %e, "error during route shape insert"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorKind, QueryResult};
    use futures::FutureExt;
    use geo::line_string;
    use std::collections::{BTreeMap, BTreeSet};
    use std::panic::AssertUnwindSafe;

    #[derive(Debug, Clone, PartialEq)]
    struct StoredRouteGeometry {
        feed_version_id: i64,
        shape_id: Option<i64>,
        generated: bool,
        geometry: geo::Geometry,
        centroid: geo::Point,
    }

    type Table = BTreeMap<(i64, i32), StoredRouteGeometry>;

    /// Keeps writes in a staging copy until commit, like a database session would.
    #[derive(Default)]
    struct MemoryStore {
        committed: Table,
        staged: Option<Table>,
        batch_sizes: Vec<usize>,
        fail_execute_on_batch: Option<usize>,
        fail_build_on_batch: Option<usize>,
        panic_on_batch: Option<usize>,
        transactions_begun: usize,
        in_flight_cancels: usize,
    }

    impl TransactionScope for MemoryStore {
        async fn begin(&mut self) -> QueryResult<()> {
            self.transactions_begun += 1;
            self.staged = Some(self.committed.clone());
            Ok(())
        }

        async fn commit(&mut self) -> QueryResult<()> {
            if let Some(staged) = self.staged.take() {
                self.committed = staged;
            }
            Ok(())
        }

        async fn rollback(&mut self) -> QueryResult<()> {
            self.staged = None;
            Ok(())
        }

        async fn cancel_in_flight(&mut self) {
            self.in_flight_cancels += 1;
        }
    }

    impl RouteGeometrySink for MemoryStore {
        async fn upsert_route_geometries(
            &mut self,
            batch: &[RouteShape],
            feed_version_id: i64,
        ) -> Result<usize, UpsertError> {
            let batch_index = self.batch_sizes.len();
            self.batch_sizes.push(batch.len());

            if self.panic_on_batch == Some(batch_index) {
                panic!("store fault on batch {}", batch_index);
            }
            if self.fail_build_on_batch == Some(batch_index) {
                return Err(UpsertError::Build(String::from("bad geometry")));
            }

            // same refusal as a Postgres upsert touching one row twice
            let mut keys = BTreeSet::new();
            let unique_keys = batch
                .iter()
                .all(|route_shape| keys.insert((route_shape.route_id, route_shape.direction_id)));
            if !unique_keys {
                return Err(UpsertError::Execute(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::Unknown,
                    Box::new(String::from(
                        "ON CONFLICT DO UPDATE command cannot affect row a second time",
                    )),
                )));
            }

            let staged = self
                .staged
                .as_mut()
                .expect("upsert outside of a transaction");

            for route_shape in batch {
                staged.insert(
                    (route_shape.route_id, route_shape.direction_id),
                    StoredRouteGeometry {
                        feed_version_id,
                        shape_id: route_shape.shape_id,
                        generated: true,
                        geometry: route_shape.geometry.clone(),
                        centroid: route_shape.centroid,
                    },
                );
            }

            // statement level success, the rows are staged but the batch still reports failure
            if self.fail_execute_on_batch == Some(batch_index) {
                return Err(UpsertError::Execute(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::CheckViolation,
                    Box::new(String::from("forced failure")),
                )));
            }

            Ok(batch.len())
        }
    }

    fn route_shape(route_id: i64, direction_id: i32, shape_id: Option<i64>) -> RouteShape {
        let offset = route_id as f64 / 1000.0;
        RouteShape {
            route_id,
            direction_id,
            shape_id,
            geometry: geo::Geometry::LineString(
                line_string![(x: 11.2 + offset, y: 43.7), (x: 11.3 + offset, y: 43.8)],
            ),
            centroid: geo::Point::new(11.25 + offset, 43.75),
        }
    }

    fn route_shapes(count: usize) -> Vec<RouteShape> {
        (0..count)
            .map(|i| route_shape((i / 2) as i64 + 1, (i % 2) as i32, Some(i as i64 + 1)))
            .collect()
    }

    fn options(batch_size: usize) -> PersistOptions {
        PersistOptions { batch_size }
    }

    fn never() -> CancelSignal {
        CancelSignal::never()
    }

    #[test]
    fn batches_cover_the_input_in_order() {
        for batch_size in [1, 3, 7, 100] {
            for count in [0, 1, 2, 6, 7, 99, 100, 101, 250] {
                let rows: Vec<usize> = (0..count).collect();
                let chunks: Vec<&[usize]> = batches(&rows, batch_size).collect();

                assert_eq!(chunks.len(), count.div_ceil(batch_size));
                if let Some((last, full)) = chunks.split_last() {
                    assert!(full.iter().all(|chunk| chunk.len() == batch_size));
                    assert!(!last.is_empty() && last.len() <= batch_size);
                }
                assert_eq!(chunks.concat(), rows);
            }
        }
    }

    #[tokio::test]
    async fn writes_every_batch_and_commits_once() {
        let mut store = MemoryStore::default();
        let rows = route_shapes(250);

        let inserted = persist(&mut store, &rows, 1, &options(100), &never())
            .await
            .unwrap();

        assert_eq!(inserted, 250);
        assert_eq!(store.batch_sizes, vec![100, 100, 50]);
        assert_eq!(store.transactions_begun, 1);
        assert_eq!(store.committed.len(), 250);
        assert!(store.staged.is_none());
        assert!(
            store
                .committed
                .values()
                .all(|row| row.generated && row.feed_version_id == 1)
        );
    }

    #[tokio::test]
    async fn failure_on_last_batch_leaves_store_untouched() {
        let mut store = MemoryStore::default();
        persist(&mut store, &route_shapes(10), 1, &options(100), &never())
            .await
            .unwrap();
        let before = store.committed.clone();

        store.batch_sizes.clear();
        store.fail_execute_on_batch = Some(2);

        let mut newer = route_shapes(250);
        for row in &mut newer {
            row.shape_id = row.shape_id.map(|id| id + 1000);
        }

        let err = persist(&mut store, &newer, 2, &options(100), &never())
            .await
            .unwrap_err();

        match err {
            RouteGeometryError::Write {
                batch_index, rows, ..
            } => {
                assert_eq!(batch_index, 2);
                assert_eq!(rows, 50);
            }
            other => panic!("expected a write error, got {:?}", other),
        }
        assert_eq!(store.batch_sizes, vec![100, 100, 50]);
        assert_eq!(store.committed, before);
        assert!(store.staged.is_none());
    }

    #[tokio::test]
    async fn build_failure_rolls_back() {
        let mut store = MemoryStore {
            fail_build_on_batch: Some(1),
            ..Default::default()
        };

        let err = persist(&mut store, &route_shapes(4), 1, &options(2), &never())
            .await
            .unwrap_err();

        match err {
            RouteGeometryError::QueryBuild { route_ids, reason } => {
                assert_eq!(route_ids, vec![2]);
                assert!(reason.starts_with("batch 1"));
            }
            other => panic!("expected a build error, got {:?}", other),
        }
        assert!(store.committed.is_empty());
    }

    #[tokio::test]
    async fn persisting_twice_is_the_same_as_once() {
        let rows = route_shapes(7);

        let mut once = MemoryStore::default();
        persist(&mut once, &rows, 3, &options(3), &never())
            .await
            .unwrap();

        let mut twice = MemoryStore::default();
        for _ in 0..2 {
            persist(&mut twice, &rows, 3, &options(3), &never())
                .await
                .unwrap();
        }

        assert_eq!(once.committed, twice.committed);
        assert_eq!(twice.committed.len(), 7);
    }

    #[tokio::test]
    async fn upsert_replaces_the_whole_row() {
        let mut store = MemoryStore::default();
        persist(
            &mut store,
            &[route_shape(1, 0, Some(4))],
            1,
            &options(100),
            &never(),
        )
        .await
        .unwrap();

        let union = RouteShape {
            shape_id: None,
            geometry: geo::Geometry::MultiLineString(geo::MultiLineString::new(vec![
                line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)],
                line_string![(x: 1.0, y: 0.0), (x: 1.0, y: 1.0)],
            ])),
            centroid: geo::Point::new(0.75, 0.25),
            ..route_shape(1, 0, None)
        };
        persist(&mut store, &[union.clone()], 2, &options(100), &never())
            .await
            .unwrap();

        let stored = store.committed.get(&(1, 0)).unwrap();
        assert_eq!(stored.feed_version_id, 2);
        assert_eq!(stored.shape_id, None);
        assert_eq!(stored.geometry, union.geometry);
        assert_eq!(stored.centroid, union.centroid);
        assert_eq!(store.committed.len(), 1);
    }

    #[tokio::test]
    async fn panic_in_a_batch_rolls_back_then_propagates() {
        let mut store = MemoryStore {
            panic_on_batch: Some(1),
            ..Default::default()
        };
        let rows = route_shapes(5);

        let outcome = AssertUnwindSafe(persist(&mut store, &rows, 1, &options(2), &never()))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        assert!(store.committed.is_empty());
        assert!(store.staged.is_none());
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let mut store = MemoryStore::default();
        let (handle, cancel) = CancelSignal::pair();
        handle.cancel();

        let err = persist(&mut store, &route_shapes(5), 1, &options(2), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RouteGeometryError::Cancelled));
        assert!(store.committed.is_empty());
        assert!(store.staged.is_none());
        assert!(store.batch_sizes.is_empty());
        assert_eq!(store.in_flight_cancels, 1);
    }

    #[tokio::test]
    async fn duplicate_keys_in_a_batch_fail_the_write() {
        let mut store = MemoryStore::default();
        let rows = vec![route_shape(1, 0, Some(1)), route_shape(1, 0, Some(2))];

        let err = persist(&mut store, &rows, 1, &options(100), &never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RouteGeometryError::Write {
                batch_index: 0,
                rows: 2,
                ..
            }
        ));
        assert!(store.committed.is_empty());
        assert!(store.staged.is_none());
    }

    #[tokio::test]
    async fn empty_input_opens_no_transaction() {
        let mut store = MemoryStore::default();

        let inserted = persist(&mut store, &[], 1, &options(100), &never())
            .await
            .unwrap();

        assert_eq!(inserted, 0);
        assert_eq!(store.transactions_begun, 0);
    }

    #[tokio::test]
    async fn zero_batch_size_is_an_input_error() {
        let mut store = MemoryStore::default();

        let err = persist(&mut store, &route_shapes(3), 1, &options(0), &never())
            .await
            .unwrap_err();

        assert!(matches!(err, RouteGeometryError::Input(_)));
        assert_eq!(store.transactions_begun, 0);
    }
}
