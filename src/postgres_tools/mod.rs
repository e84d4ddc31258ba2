// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license
use crate::config::StoreConfig;
use crate::error::RouteGeometryError;
use diesel::result::QueryResult;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::ManagerConfig;
use diesel_async::pooled_connection::RecyclingMethod;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, TransactionManager};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tokio_postgres::NoTls;
use tracing::{debug, error, warn};

/// This type alias is the pool, which can be quried for connections.
pub type RouteGeometryPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Type alias to the pooled connection
/// This must be used in a single thread, since it is mutable
pub type RouteGeometryConn<'a> =
    bb8::PooledConnection<'a, AsyncDieselConnectionManager<AsyncPgConnection>>;

pub async fn make_async_pool(
    config: &StoreConfig,
) -> Result<RouteGeometryPool, RouteGeometryError> {
    let mut custom_conf = ManagerConfig::default();

    custom_conf.recycling_method = RecyclingMethod::Fast;

    let manager: AsyncDieselConnectionManager<AsyncPgConnection> =
        AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
            config.database_url.as_str(),
            custom_conf,
        );

    Pool::builder()
        .max_size(config.max_connections)
        .build(manager)
        .await
        .map_err(|e| RouteGeometryError::Connection(e.to_string()))
}

/// Checks a connection out of the pool. bb8 connects lazily, so this is where
/// an unreachable database shows up.
pub async fn checkout(
    pool: &RouteGeometryPool,
) -> Result<RouteGeometryConn<'_>, RouteGeometryError> {
    pool.get()
        .await
        .map_err(|e| RouteGeometryError::Connection(e.to_string()))
}

/// Cooperative cancellation shared by every store operation of a run.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the paired handle fires. Dropping the handle without
    /// firing it leaves this pending forever.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }

        futures::future::pending::<()>().await
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Explicit transaction boundaries over a store session.
pub trait TransactionScope: Send {
    fn begin(&mut self) -> impl Future<Output = QueryResult<()>> + Send;
    fn commit(&mut self) -> impl Future<Output = QueryResult<()>> + Send;
    fn rollback(&mut self) -> impl Future<Output = QueryResult<()>> + Send;
    /// Asks the server to abort the statement currently running on this
    /// session, if any.
    fn cancel_in_flight(&mut self) -> impl Future<Output = ()> + Send;
}

impl TransactionScope for AsyncPgConnection {
    async fn begin(&mut self) -> QueryResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::begin_transaction(self)
            .await
    }

    async fn commit(&mut self) -> QueryResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(self)
            .await
    }

    async fn rollback(&mut self) -> QueryResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(
            self,
        )
        .await
    }

    async fn cancel_in_flight(&mut self) {
        if let Err(e) = self.cancel_token().cancel_query(NoTls).await {
            warn!(error = %e, "could not cancel the running statement");
        }
    }
}

enum Outcome<R> {
    Finished(Result<R, RouteGeometryError>),
    Panicked(Box<dyn std::any::Any + Send>),
    Cancelled,
}

/// Runs `callback` inside one transaction.
///
/// Commits only when the callback returns `Ok`. An error, a cancellation of
/// `cancel` or a panic inside the callback rolls the transaction back first;
/// the panic is then resumed. On cancellation the statement still running on
/// the server is aborted before the rollback is sent.
pub async fn with_transaction<'a, C, R, F>(
    conn: &mut C,
    cancel: &CancelSignal,
    callback: F,
) -> Result<R, RouteGeometryError>
where
    C: TransactionScope,
    F: for<'r> FnOnce(&'r mut C) -> ScopedBoxFuture<'a, 'r, Result<R, RouteGeometryError>>
        + Send
        + 'a,
    R: Send + 'a,
{
    conn.begin().await.map_err(RouteGeometryError::Transaction)?;

    let outcome = {
        let work = AssertUnwindSafe(callback(&mut *conn)).catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = work => match result {
                Ok(result) => Outcome::Finished(result),
                Err(panic) => Outcome::Panicked(panic),
            },
        }
    };

    match outcome {
        Outcome::Finished(Ok(value)) => {
            conn.commit().await.map_err(RouteGeometryError::Transaction)?;
            debug!("transaction committed");
            Ok(value)
        }
        Outcome::Finished(Err(err)) => {
            rollback_logged(conn).await;
            error!(error = %err, "transaction errored, rolled back");
            Err(err)
        }
        Outcome::Cancelled => {
            conn.cancel_in_flight().await;
            rollback_logged(conn).await;
            warn!("transaction cancelled, rolled back");
            Err(RouteGeometryError::Cancelled)
        }
        Outcome::Panicked(panic) => {
            rollback_logged(conn).await;
            error!("transaction panicked, rolled back");
            std::panic::resume_unwind(panic)
        }
    }
}

// rollback errors are logged, the caller gets the first failure
async fn rollback_logged<C: TransactionScope>(conn: &mut C) {
    if let Err(e) = conn.rollback().await {
        error!(error = %e, "error during transaction rollback");
    }
}
