// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

// Larch computes a representative geometry for every route/direction of a
// feed version from the shapes of its trips, and stores it in tl_route_geometries.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use route_geometry::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONNECTIONS, parse_feed_version_id, require_database_url,
    validate_batch_size,
};
use route_geometry::postgres_tools::{CancelHandle, CancelSignal, checkout, make_async_pool};
use route_geometry::route_shapes::dry_run::render_table;
use route_geometry::{
    AggregateOptions, AggregationPolicy, GeneratorConfig, PersistOptions, RouteGeometryError,
    StoreConfig, aggregate, persist,
};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate geometries for your gtfs routes in transitland",
    long_about = "Generate geometries for your gtfs routes in transitland.\nUses your trips geometries in order to compute the route shape."
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Compute route geometries for a feed version and store them
    Generate(GenerateArgs),
    /// Print the version
    Version,
}

#[derive(clap::Args, Debug, Clone)]
struct GenerateArgs {
    /// Feed version whose trips are aggregated
    feed_version_id: String,
    /// Restrict the computation to these routes, comma separated
    #[arg(long, value_delimiter = ',')]
    route_ids: Vec<i64>,
    #[arg(long, value_enum, default_value_t = AggregationPolicy::Selection)]
    policy: AggregationPolicy,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Print the computed geometries instead of writing them
    #[arg(long)]
    dry_run: bool,
    /// Abort, rolling back any open transaction, after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,
}

impl TryFrom<GenerateArgs> for GeneratorConfig {
    type Error = RouteGeometryError;

    fn try_from(args: GenerateArgs) -> Result<Self, Self::Error> {
        let feed_version_id = parse_feed_version_id(&args.feed_version_id)?;
        let database_url = require_database_url(args.database_url)?;
        let batch_size = validate_batch_size(args.batch_size)?;

        Ok(GeneratorConfig {
            store: StoreConfig {
                database_url,
                max_connections: args.max_connections.max(1),
            },
            aggregate: AggregateOptions {
                feed_version_id,
                route_ids: args.route_ids,
                policy: args.policy,
            },
            persist: PersistOptions { batch_size },
            dry_run: args.dry_run,
            verbose: args.verbose,
            timeout: args.timeout_secs.map(Duration::from_secs),
        })
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

// fires the cancel handle on ctrl-c or once the timeout elapses
fn spawn_cancel_watcher(cancel_handle: CancelHandle, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("interrupt received, cancelling"),
            _ = deadline => warn!(?timeout, "timeout reached, cancelling"),
        }

        cancel_handle.cancel();
    });
}

async fn run(config: GeneratorConfig) -> Result<(), RouteGeometryError> {
    let (cancel_handle, cancel) = CancelSignal::pair();
    spawn_cancel_watcher(cancel_handle, config.timeout);

    let pool = make_async_pool(&config.store).await?;
    let mut conn = checkout(&pool).await?;

    let route_shapes = aggregate(&mut conn, &config.aggregate, &cancel).await?;

    if config.dry_run {
        print!("{}", render_table(&route_shapes, config.verbose));
        return Ok(());
    }

    let inserted_routes = persist(
        &mut *conn,
        &route_shapes,
        config.aggregate.feed_version_id,
        &config.persist,
        &cancel,
    )
    .await?;

    info!(
        feed_version_id = config.aggregate.feed_version_id,
        route_shapes = route_shapes.len(),
        inserted_routes,
        "route geometries generated"
    );

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!(
                "larch Version: {} - Profile: {}",
                env!("CARGO_PKG_VERSION"),
                if cfg!(debug_assertions) {
                    "debug"
                } else {
                    "release"
                }
            );
            ExitCode::SUCCESS
        }
        Commands::Generate(generate_args) => {
            init_tracing(generate_args.verbose);

            let result = match GeneratorConfig::try_from(generate_args) {
                Ok(config) => run(config).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{:#}", anyhow::Error::from(e));
                    ExitCode::FAILURE
                }
            }
        }
    }
}
