use clap::Parser;
use tokio_util::sync::CancellationToken;

use packvault::archive::HourStamp;
use packvault::ingest::Drinker;
use packvault::metrics::{self, Metrics};
use packvault::stars::StarTracker;
use packvault::{db, logging};

/// Timeline drinker: consumes the hourly event archive, keeps the star
/// tracker current, and enqueues repositories worth archiving.
#[derive(Parser, Debug)]
#[command(name = "ingestor")]
#[command(about = "Consume the hourly GitHub event archive into the fetch queue")]
struct Args {
    /// Postgres DSN for the queue and fetch index
    #[arg(long, env = "DB_ADDR")]
    db_addr: String,

    /// Bearer token for GitHub API lookups
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: String,

    /// SQLite file holding the star tracker cache and the resume checkpoint
    #[arg(long, env = "CACHE_PATH")]
    cache_path: String,

    /// Legacy plain-text checkpoint file, read when the cache has none
    #[arg(long, env = "RESUME_PATH")]
    resume_path: Option<String>,

    /// InfluxDB endpoint for counters; unset disables export
    #[arg(long, env = "INFLUX_ADDR")]
    influx_addr: Option<String>,

    /// Consume this single hourly archive and exit, without checkpointing
    #[arg(value_name = "YYYY-MM-DD-HH")]
    hour: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    logging::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        tracing::error!(error = %err, "ingestor failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    packvault::cancel_on_signal(cancel.clone());

    let metrics = Metrics::new();
    if let Some(addr) = &args.influx_addr {
        metrics::spawn_influx_export(metrics.clone(), addr.clone(), "ingestor", cancel.clone())
            .await?;
    }

    tracing::info!("opening queue and index");
    let pool = db::create_pool(&args.db_addr).await?;
    let queue = db::Queue::open(pool.clone()).await?;
    let index = db::Index::open(pool).await?;

    tracing::info!(path = %args.cache_path, "opening star tracker cache");
    let stars = StarTracker::open(&args.cache_path, &args.github_token).await?;

    let http = reqwest::Client::builder()
        .user_agent(packvault::USER_AGENT)
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()?;

    let drinker = Drinker {
        queue,
        index,
        stars,
        http,
        metrics: metrics.clone(),
        cancel,
    };

    if let Some(hour) = &args.hour {
        let hour = HourStamp::parse(hour)?;
        drinker.drink_hour(hour).await?;
        tracing::info!(counters = %metrics.dump(), "one-shot hour consumed");
        return Ok(());
    }

    let start = match drinker.stars.load_checkpoint().await? {
        Some(hour) => {
            tracing::info!(archive = %hour, "resuming from checkpoint");
            hour
        }
        None => match legacy_resume(args.resume_path.as_deref()) {
            Some(hour) => {
                tracing::info!(archive = %hour, "resuming from legacy checkpoint file");
                hour
            }
            None => {
                let hour = HourStamp::hours_before_now(12);
                tracing::info!(archive = %hour, "no checkpoint found, starting 12 hours ago");
                hour
            }
        },
    };

    drinker.run(start).await?;
    tracing::info!(counters = %metrics.dump(), "final counters");
    Ok(())
}

fn legacy_resume(path: Option<&str>) -> Option<HourStamp> {
    let contents = std::fs::read_to_string(path?).ok()?;
    HourStamp::parse(contents.trim()).ok()
}
