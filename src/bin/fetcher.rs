use clap::Parser;
use tokio_util::sync::CancellationToken;

use packvault::fetch::Fetcher;
use packvault::metrics::{self, Metrics};
use packvault::schedule::WeekMap;
use packvault::store::PackStore;
use packvault::{db, logging};

/// Fetch scheduler: pops the queue and performs incremental git fetches
/// into blob storage, one repository at a time. Multiple fetcher processes
/// may run against the same queue.
#[derive(Parser, Debug)]
#[command(name = "fetcher")]
#[command(about = "Archive queued repositories into blob storage")]
struct Args {
    /// Postgres DSN for the queue and fetch index
    #[arg(long, env = "DB_ADDR")]
    db_addr: String,

    /// Blob-store bucket receiving packfiles
    #[arg(long, env = "FETCHER_BUCKET_NAME")]
    bucket: String,

    /// Byte cap for repositories that are not whitelisted
    #[arg(long, env = "MAX_REPO_SIZE")]
    max_repo_size: u64,

    /// Base64-packed weekly hour bitmap; unset means always-on
    #[arg(long, env = "SCHEDULE")]
    schedule: Option<String>,

    /// InfluxDB endpoint for counters; unset disables export
    #[arg(long, env = "INFLUX_ADDR")]
    influx_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logging::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        tracing::error!(error = %err, "fetcher failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    packvault::cancel_on_signal(cancel.clone());

    let metrics = Metrics::new();
    if let Some(addr) = &args.influx_addr {
        metrics::spawn_influx_export(metrics.clone(), addr.clone(), "fetcher", cancel.clone())
            .await?;
    }

    let schedule = match &args.schedule {
        Some(packed) => WeekMap::parse(packed)?,
        None => WeekMap::always(),
    };

    tracing::info!("opening queue and index");
    let pool = db::create_pool(&args.db_addr).await?;
    let queue = db::Queue::open(pool.clone()).await?;
    let index = db::Index::open(pool).await?;

    tracing::info!(bucket = %args.bucket, "opening blob store");
    let store = PackStore::new(args.bucket).await;

    let fetcher = Fetcher {
        queue,
        index,
        store,
        schedule,
        max_repo_size: args.max_repo_size,
        metrics: metrics.clone(),
        cancel,
    };

    fetcher.run().await?;
    tracing::info!(counters = %metrics.dump(), "final counters");
    Ok(())
}
