use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use packvault::metrics::{self, Metrics};
use packvault::modsync::Reconciler;
use packvault::trello::Trello;
use packvault::{db, logging};

/// Moderation reconciler: keeps the blacklist table and the Trello board
/// in agreement, with the board winning disagreements.
#[derive(Parser, Debug)]
#[command(name = "modsync")]
#[command(about = "Sync the blacklist with the moderation board")]
struct Args {
    /// Postgres DSN for the fetch index
    #[arg(long, env = "DB_ADDR")]
    db_addr: String,

    #[arg(long, env = "TRELLO_KEY")]
    trello_key: String,

    #[arg(long, env = "TRELLO_TOKEN")]
    trello_token: String,

    /// Board id carrying the Whitelist and Blacklist lists
    #[arg(long, env = "BLACKLIST_BOARD")]
    board: String,

    /// Seconds between reconciliation passes
    #[arg(long, env = "INTERVAL", default_value_t = 60)]
    interval: u64,

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
        tracing::error!(error = %err, "modsync failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    packvault::cancel_on_signal(cancel.clone());

    let metrics = Metrics::new();
    if let Some(addr) = &args.influx_addr {
        metrics::spawn_influx_export(metrics.clone(), addr.clone(), "modsync", cancel.clone())
            .await?;
    }

    tracing::info!("opening index");
    let pool = db::create_pool(&args.db_addr).await?;
    let index = db::Index::open(pool).await?;

    let reconciler = Reconciler {
        index,
        trello: Trello::new(args.trello_key, args.trello_token)?,
        board: args.board,
        interval: Duration::from_secs(args.interval),
        metrics: metrics.clone(),
        cancel,
    };

    reconciler.run().await?;
    tracing::info!(counters = %metrics.dump(), "final counters");
    Ok(())
}
