// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::error::RouteGeometryError;
use std::time::Duration;

/// Rows per upsert statement.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 2;

/// How the trip shapes of one route/direction are reduced to a single geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AggregationPolicy {
    /// Keep the longest trip shape, remembering its id
    #[default]
    Selection,
    /// Merge every trip shape into one multi-line geometry
    Union,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateOptions {
    pub feed_version_id: i64,
    /// Empty means every route of the feed version.
    pub route_ids: Vec<i64>,
    pub policy: AggregationPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistOptions {
    pub batch_size: usize,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

/// Everything one run of the generator needs, resolved up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub store: StoreConfig,
    pub aggregate: AggregateOptions,
    pub persist: PersistOptions,
    pub dry_run: bool,
    pub verbose: bool,
    pub timeout: Option<Duration>,
}

pub fn parse_feed_version_id(token: &str) -> Result<i64, RouteGeometryError> {
    token.trim().parse::<i64>().map_err(|e| {
        RouteGeometryError::Input(format!(
            "feed version id {:?} is not an integer: {}",
            token, e
        ))
    })
}

pub fn require_database_url(database_url: Option<String>) -> Result<String, RouteGeometryError> {
    match database_url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(RouteGeometryError::Input(String::from(
            "a database url is required, pass --database-url or set DATABASE_URL",
        ))),
    }
}

/// Bind parameters of one tl_route_geometries row in an upsert statement.
pub const PARAMS_PER_ROUTE_GEOMETRY: usize = 7;

/// Postgres accepts at most `u16::MAX` bind parameters per statement.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / PARAMS_PER_ROUTE_GEOMETRY;

pub fn validate_batch_size(batch_size: usize) -> Result<usize, RouteGeometryError> {
    if batch_size == 0 {
        return Err(RouteGeometryError::Input(String::from(
            "batch size must be at least 1",
        )));
    }

    if batch_size > MAX_BATCH_SIZE {
        return Err(RouteGeometryError::Input(format!(
            "batch size {} is above the maximum of {} rows per statement",
            batch_size, MAX_BATCH_SIZE
        )));
    }

    Ok(batch_size)
}
