// tangle - storage node command line

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tanglestore::snapshot::{SnapshotConfig, SnapshotOutcome};
use tanglestore::storage::StoreConfig;
use tanglestore::{Node, NodeConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tangle", version, about = "Tangle storage node")]
struct Cli {
    /// Database directory
    #[arg(long, default_value = "data")]
    db: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum bytes per storage write transaction
    #[arg(long)]
    max_txn_bytes: Option<usize>,

    /// Directory computed snapshots are exported to
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Total supply snapshot balances must add up to
    #[arg(long)]
    expected_supply: Option<i64>,

    /// Seconds to wait for in-flight writers before a snapshot starts
    #[arg(long, default_value_t = 3)]
    settle_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until interrupted
    Run {
        /// Snapshot file loaded at startup
        #[arg(long)]
        snapshot_file: Option<PathBuf>,

        /// Hours between automatic snapshots, 0 disables them
        #[arg(long, default_value_t = 0)]
        snapshot_interval_hours: u64,

        /// Hours of history kept by automatic snapshots
        #[arg(long, default_value_t = 24)]
        retention_hours: u64,
    },
    /// Load a `<timestamp>.snap` file and exit
    LoadSnapshot { file: PathBuf },
    /// Compute a snapshot at the given unix timestamp and exit
    MakeSnapshot { cutoff: i64 },
    /// Print the current tips
    Tips,
    /// Print storage and snapshot status
    Status,
}

fn build_config(cli: &Cli) -> NodeConfig {
    let mut store = StoreConfig::new();
    if let Some(bytes) = cli.max_txn_bytes {
        store = store.with_max_txn_bytes(bytes);
    }

    let mut snapshot = SnapshotConfig::new().with_settle_delay(Duration::from_secs(cli.settle_secs));
    if let Some(dir) = &cli.snapshot_dir {
        snapshot = snapshot.with_snapshot_dir(dir);
    }
    if let Some(supply) = cli.expected_supply {
        snapshot = snapshot.with_expected_supply(supply);
    }

    let mut config = NodeConfig::new().with_db_path(&cli.db).with_store(store);
    if let Command::Run {
        snapshot_file,
        snapshot_interval_hours,
        retention_hours,
    } = &cli.command
    {
        snapshot = snapshot
            .with_interval(Duration::from_secs(snapshot_interval_hours * 3600))
            .with_retention(Duration::from_secs(retention_hours * 3600));
        if let Some(file) = snapshot_file {
            config = config.with_load_file(file);
        }
    }
    config.with_snapshot(snapshot)
}

fn report(outcome: SnapshotOutcome) {
    match outcome {
        SnapshotOutcome::Applied { timestamp } => println!("snapshot applied at {}", timestamp),
        SnapshotOutcome::NotNewer { current } => {
            println!("snapshot skipped, current cutoff is {}", current)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&cli);
    let mut node = Node::start(config).await?;

    match cli.command {
        Command::Run { .. } => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                }
                fatal = node.wait_fatal() => {
                    error!(error = %fatal, "Refusing to continue on an inconsistent ledger");
                    std::process::exit(1);
                }
            }
        }
        Command::LoadSnapshot { file } => report(node.snapshots().load_snapshot(file).await?),
        Command::MakeSnapshot { cutoff } => report(node.snapshots().make_snapshot(cutoff).await?),
        Command::Tips => {
            for hash in node.queries().get_tips().hashes {
                println!("{}", hash);
            }
        }
        Command::Status => {
            let stats = node.ledger().db().stats();
            println!("keys: {}", stats.key_count);
            println!("disk bytes: {}", stats.disk_size_bytes);
            println!("tips: {}", node.ledger().tip_set().len());
            println!("snapshot cutoff: {}", node.snapshots().current_cutoff_timestamp());
            println!("snapshot phase: {:?}", node.snapshots().phase());
        }
    }

    node.shutdown().await?;
    Ok(())
}
