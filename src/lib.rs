// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

pub mod config;
pub mod error;
pub mod models;
pub mod postgis_to_diesel;
pub mod postgres_tools;
pub mod route_shapes;
pub mod schema;

pub use config::{
    AggregateOptions, AggregationPolicy, GeneratorConfig, PersistOptions, StoreConfig,
};
pub use error::RouteGeometryError;
pub use route_shapes::{RouteShape, aggregate, persist};

pub const WGS_84_SRID: u32 = 4326;
