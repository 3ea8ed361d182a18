//! pollwire binary.
//!
//! `pollwire ingest` streams matched votes from the upstream filter endpoint
//! into the broker; `pollwire tally` drains the broker into durable poll
//! results. The two halves share nothing but the broker topic and are meant
//! to run as independent processes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pollwire::bus::{self, RedisTransport, VoteConsumer, VoteHandler};
use pollwire::config::StreamCredentials;
use pollwire::logging;
use pollwire::store::PgPollStore;
use pollwire::stream::supervisor::ConnectionSupervisor;
use pollwire::stream::{self, StreamIngester};
use pollwire::tally::{FlushOutcome, TallyAggregator, FLUSH_INTERVAL};

/// Stream-to-poll vote tally pipeline
#[derive(Parser, Debug)]
#[command(name = "pollwire")]
#[command(version, about, long_about = None)]
struct Args {
    /// Poll store connection URL
    #[arg(long, env = "POLLWIRE_DATABASE_URL")]
    database_url: String,

    /// Broker connection URL
    #[arg(long, env = "POLLWIRE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Broker topic carrying vote events
    #[arg(long, env = "POLLWIRE_TOPIC", default_value = "votes")]
    topic: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream matched votes from the upstream filter endpoint into the broker
    Ingest {
        /// Upstream filtered-stream endpoint
        #[arg(long, env = "POLLWIRE_STREAM_URL")]
        stream_url: String,
    },
    /// Drain the broker into durable poll results
    Tally {
        /// Consumer group shared by tally workers
        #[arg(long, env = "POLLWIRE_GROUP", default_value = "tally")]
        group: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("POLLWIRE_GIT_HASH"),
        built = env!("POLLWIRE_BUILD_DATE"),
        "starting pollwire"
    );

    let result = match &args.command {
        Command::Ingest { stream_url } => run_ingest(&args, stream_url).await,
        Command::Tally { group } => run_tally(&args, group).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

/// Completes when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending::<()>().await;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping"),
        _ = sigint.recv() => tracing::info!("received SIGINT, stopping"),
    }
}

async fn run_ingest(args: &Args, stream_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = StreamCredentials::from_env()?;

    tracing::info!("connecting to poll store");
    let store = Arc::new(PgPollStore::connect(&args.database_url).await?);

    tracing::info!("connecting to broker");
    let transport = RedisTransport::connect(&args.redis_url, &args.topic).await?;

    let supervisor = Arc::new(ConnectionSupervisor::new());

    let (votes_tx, votes_rx) = mpsc::unbounded_channel();
    let publisher_stopped = bus::publish_votes(transport, votes_rx);

    let ingester = StreamIngester::new(
        stream_url,
        credentials,
        store.clone(),
        supervisor.clone(),
        votes_tx,
    )?;
    let ingest_task = tokio::spawn(async move { ingester.run().await });

    let refresh_task = tokio::spawn(stream::force_reconnect_loop(
        supervisor.clone(),
        stream::FORCED_CLOSE_INTERVAL,
    ));

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            // Marks the stop flag and force-closes the live connection; the
            // ingestion loop sees the flag before its next cycle.
            supervisor.shutdown();
        });
    }

    ingest_task.await?;
    refresh_task.await?;

    // The ingester (and with it the only vote sender) is gone; the channel
    // is closed, so the publisher drains whatever is queued and stops.
    let _ = publisher_stopped.await;

    store.close().await;
    tracing::info!("ingest shutdown complete");
    Ok(())
}

async fn run_tally(args: &Args, group: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("connecting to poll store");
    let store = Arc::new(PgPollStore::connect(&args.database_url).await?);

    tracing::info!("connecting to broker");
    let consumer_name = format!("{}-{}", group, std::process::id());
    let consumer =
        VoteConsumer::connect(&args.redis_url, &args.topic, group, &consumer_name).await?;

    let aggregator = Arc::new(TallyAggregator::new(store.clone()));
    let stop = CancellationToken::new();

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        });
    }

    let consume_task = {
        let handler: Arc<dyn VoteHandler> = aggregator.clone();
        tokio::spawn(consumer.run(handler, stop.clone()))
    };

    let flush_task = {
        let aggregator = aggregator.clone();
        let stop = stop.clone();
        tokio::spawn(async move { aggregator.run(FLUSH_INTERVAL, stop).await })
    };

    consume_task.await?;
    flush_task.await?;

    // Deliveries have stopped; one best-effort final flush. Anything that
    // still fails here is lost.
    if aggregator.flush().await == FlushOutcome::Partial {
        tracing::warn!("final flush incomplete, remaining votes lost");
    }

    store.close().await;
    tracing::info!("tally shutdown complete");
    Ok(())
}
