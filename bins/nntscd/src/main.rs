//! # nntscd - Network Time Series Collector Daemon
//!
//! Runs the full collector: the broker consumer and RRD poller feeding
//! the store, the export bus forwarding stream births and live records,
//! and the query server answering client requests.
//!
//! ## Usage
//!
//! ```bash
//! # First run: build the database schema
//! nntscd --config /etc/nntsc.yaml --create-db
//!
//! # Register rollup views for the parser-declared aggregations
//! nntscd --config /etc/nntsc.yaml --continuous-queries
//!
//! # Normal operation
//! nntscd --config /etc/nntsc.yaml --foreground
//! RUST_LOG=debug nntscd --config /etc/nntsc.yaml --foreground
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 store error,
//! 3 broker error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nntsc_core::{Config, EventSender};
use nntsc_parsers::ParserRegistry;
use nntsc_server::{
    BrokerConsumer, BusSubscriptions, CommandRrdSource, ExportDrain, QueryServer, RrdPoller,
};
use nntsc_store::{DbInsert, StreamCache};

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_BROKER: u8 = 3;

/// Command-line arguments for the collector daemon
#[derive(Parser, Debug)]
#[command(name = "nntscd")]
#[command(about = "Network time series collector")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Stay attached to the terminal and log there
    #[arg(short, long)]
    foreground: bool,

    /// Build the database schema from scratch, then exit
    #[arg(long)]
    create_db: bool,

    /// Register server-side rollup views for the parser-declared
    /// continuous queries, then exit
    #[arg(long)]
    continuous_queries: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Process supervision and log shipping are the service manager's
    // business; --foreground only picks the log format.
    let fmt = tracing_subscriber::fmt::layer().with_ansi(args.foreground);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt)
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "cannot load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let registry = ParserRegistry::standard();
    let specs = registry.collection_specs();

    let mut db = match DbInsert::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "cannot connect to database");
            return ExitCode::from(EXIT_STORE);
        }
    };

    if args.create_db {
        return match db.build_schema(&specs).await {
            Ok(()) => {
                info!("database schema created");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "schema creation failed");
                ExitCode::from(EXIT_STORE)
            }
        };
    }

    if args.continuous_queries {
        return match db.create_rollup_views(&specs).await {
            Ok(()) => {
                info!("rollup views registered");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "rollup registration failed");
                ExitCode::from(EXIT_STORE)
            }
        };
    }

    match run(config, registry, db).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(
    config: Config,
    mut registry: ParserRegistry,
    mut db: DbInsert,
) -> Result<(), u8> {
    match db.schema_ready().await {
        Ok(true) => {}
        Ok(false) => {
            error!("database schema missing, run with --create-db first");
            return Err(EXIT_STORE);
        }
        Err(e) => {
            error!(error = %e, "cannot inspect database schema");
            return Err(EXIT_STORE);
        }
    }
    if let Err(e) = db.prime_partitions().await {
        error!(error = %e, "cannot inspect existing partitions");
        return Err(EXIT_STORE);
    }
    match registry.register_existing(&mut db).await {
        Ok(count) => info!(streams = count, "loaded existing streams"),
        Err(e) => {
            error!(error = %e, "cannot load existing streams (has --create-db been run?)");
            return Err(EXIT_STORE);
        }
    }

    if let Err(e) = BrokerConsumer::validate(&config.broker) {
        error!(error = %e, "broker configuration rejected");
        return Err(EXIT_BROKER);
    }

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    // Export bus: producer handle shared by the pipeline tasks, one
    // drain task forwarding to the exchange and local subscribers.
    let (bus, bus_rx) = EventSender::channel(config.exporter.queue_depth);
    let subscriptions = BusSubscriptions::new();
    let drain = match ExportDrain::new(
        &config.broker,
        bus_rx,
        Arc::clone(&subscriptions),
        cancel.child_token(),
    ) {
        Ok(drain) => drain,
        Err(e) => {
            error!(error = %e, "cannot build export publisher");
            return Err(EXIT_BROKER);
        }
    };
    handles.push(tokio::spawn(drain.run()));

    // Broker consumer: owns the primary store connection.
    let consumer = BrokerConsumer::new(
        config.broker.clone(),
        db,
        registry,
        bus.clone(),
        cancel.child_token(),
    );
    handles.push(tokio::spawn(consumer.run()));

    // RRD poller: its own store connection, per the one-connection-
    // per-task rule.
    if let Some(list) = &config.rrd.list {
        let rrd_db = match DbInsert::connect(&config.database).await {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "cannot open store connection for RRD poller");
                return Err(EXIT_STORE);
            }
        };
        let poller = match RrdPoller::bootstrap(
            CommandRrdSource,
            rrd_db,
            bus.clone(),
            list,
            Duration::from_secs(config.rrd.poll_interval),
            cancel.child_token(),
        )
        .await
        {
            Ok(poller) => poller,
            Err(e) => {
                error!(error = %e, "RRD poller bootstrap failed");
                return Err(EXIT_STORE);
            }
        };
        handles.push(tokio::spawn(poller.run()));
    }

    // Query server.
    let cache = Arc::new(StreamCache::new(Duration::from_secs(config.database.cachetime)));
    let server = QueryServer::new(
        config.exporter.clone(),
        config.database.clone(),
        cache,
        subscriptions,
        cancel.child_token(),
    );
    let server_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "query server failed");
            server_cancel.cancel();
        }
    }));

    info!("nntscd running");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    // Pipeline tasks drain their pending batches on cancellation
    // before exiting.
    for handle in handles {
        let _ = handle.await;
    }
    info!("nntscd stopped");
    Ok(())
}
