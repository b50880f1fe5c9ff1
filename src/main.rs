use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gridmirror::config::{AppConfig, CliConfig, FileConfig};
use gridmirror::feed::FeedClient;
use gridmirror::limiter::{ApiLimits, MediaLimits, RateLimiter};
use gridmirror::media_worker::MediaDownloader;
use gridmirror::object_store::S3ObjectStore;
use gridmirror::pipeline::{NoOpAlertHook, PipelineDeps, Processors};
use gridmirror::replication::CycleDriver;
use gridmirror::scheduler::Scheduler;
use gridmirror::store::{postgres, PgReplicationStore, ReplicationStore};

#[derive(Parser, Debug)]
#[command(about = "Replication worker mirroring a listing feed into PostgreSQL + S3")]
struct CliArgs {
    /// Path to a TOML configuration file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the remote feed.
    #[clap(long)]
    pub feed_base_url: Option<String>,

    /// Originating system name used in every feed filter.
    #[clap(long)]
    pub originating_system: Option<String>,

    /// PostgreSQL connection string.
    #[clap(long)]
    pub database_url: Option<String>,

    /// Database connection pool size.
    #[clap(long)]
    pub database_pool_size: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let cli_args = CliArgs::parse();
    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli = CliConfig {
        feed_base_url: cli_args.feed_base_url,
        originating_system: cli_args.originating_system,
        database_url: cli_args.database_url,
        database_pool_size: cli_args.database_pool_size,
    };
    let config = AppConfig::resolve(&cli, file_config)?;
    info!(
        "Configuration resolved for originating system '{}'",
        config.feed.originating_system
    );

    let pool = postgres::connect(&config.database.url, config.database.pool_size).await?;
    let store: Arc<dyn ReplicationStore> = Arc::new(PgReplicationStore::new(pool));
    info!("Database connection established");

    let limiter = Arc::new(RateLimiter::new(
        ApiLimits::default(),
        MediaLimits {
            soft_cap_bytes: config.media.soft_cap_bytes(),
            hard_cap_bytes: config.media.hard_cap_bytes(),
        },
    ));

    let objects = Arc::new(S3ObjectStore::new(&config.object_store));
    let feed = Arc::new(FeedClient::new(
        &config.feed,
        Arc::clone(&limiter),
        Arc::clone(&store),
    )?);

    let processors = Arc::new(Processors::new(PipelineDeps {
        store: Arc::clone(&store),
        objects: objects.clone(),
        feed: feed.clone(),
        alert: Arc::new(NoOpAlertHook),
        media: config.media.clone(),
        public_domain: config.object_store.public_domain.clone(),
    }));

    let driver = Arc::new(CycleDriver::new(
        Arc::clone(&store),
        feed.clone(),
        processors,
        config.feed.clone(),
    ));

    let downloader = Arc::new(MediaDownloader::new(
        Arc::clone(&store),
        objects.clone(),
        feed,
        config.media.clone(),
        config.object_store.public_domain.clone(),
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(
        store,
        objects,
        driver,
        downloader,
        limiter,
        config.cadence.clone(),
        config.retention.clone(),
        shutdown.clone(),
    );

    // Signal handling: first signal starts the drain, the scheduler does
    // the rest.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {e}");
                signal_token.cancel();
            }
        }
    });

    info!("Starting replication worker");
    scheduler.run().await?;
    info!("Replication worker exited cleanly");
    Ok(())
}
