//! KeyFS admin CLI
//!
//! Operator commands against a replicated namespace whose drives live in
//! redb files under the cluster data directory.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use keyfs_client::{FileStore, InodeRecord};
use keyfs_common::config::Config;
use keyfs_common::{DriveId, PartitionId};
use keyfs_namespace::{Namespace, RedbConnector, ReplicatedNamespace};
use keyfs_pathmap::PathService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "keyfs-admin")]
#[command(about = "KeyFS cluster administration")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "KEYFS_CONFIG", default_value = "/etc/keyfs/keyfs.toml")]
    config: String,

    /// Directory holding the drive databases (overrides config)
    #[arg(long, env = "KEYFS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Space reported per drive, in bytes
    #[arg(long, default_value_t = 1 << 40)]
    drive_bytes: u64,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show every partition's drives and fencing state
    Status {
        /// Print the cluster map as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe every drive
    SelfCheck,
    /// Show aggregate space usage
    Capacity,
    /// Mark a drive RED
    Disable {
        /// Partition the drive belongs to
        #[arg(short, long)]
        partition: PartitionId,
        /// Drive as host:port
        drive: String,
    },
    /// Bring a drive back and wait for its resync to finish
    Enable {
        /// Partition the drive belongs to
        #[arg(short, long)]
        partition: PartitionId,
        /// Drive as host:port
        drive: String,
    },
    /// Make every replica of a key agree
    Repair {
        /// Storage key
        key: String,
    },
    /// Show the path mutation log
    Log,
    /// Finish renames left behind by crashed clients
    RecoverRenames,
}

fn parse_drive(drive: &str) -> Result<DriveId> {
    let (host, port) = drive
        .rsplit_once(':')
        .with_context(|| format!("drive '{drive}' is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in '{drive}'"))?;
    Ok(DriveId::new(host, port))
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn print_status(ns: &ReplicatedNamespace) {
    println!("Cluster Status");
    println!("==============");
    for partition in ns.cluster_map() {
        let log = partition
            .log_partition_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "Partition {}  version {}  log partition {}",
            partition.partition_id, partition.cluster_version, log
        );
        for drive in &partition.drives {
            println!("  {:<24} {}", drive.id().to_string(), drive.status);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    if let Some(data_dir) = args.data_dir {
        config.cluster.data_dir = data_dir;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Cluster '{}' with {} partitions, drives under {}",
        config.cluster.name,
        config.cluster.partitions.len(),
        config.cluster.data_dir.display()
    );
    let connector = Arc::new(RedbConnector::new(
        config.cluster.data_dir.clone(),
        args.drive_bytes,
    ));
    let ns = Arc::new(ReplicatedNamespace::new(
        config.cluster.initial_partitions(),
        connector,
        config.namespace.clone(),
    )?);
    if let Err(e) = ns.refresh_all().await {
        warn!("Could not refresh every partition: {}", e);
    }

    match args.command {
        Commands::Status { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&ns.cluster_map())?);
            } else {
                print_status(&ns);
            }
        }
        Commands::SelfCheck => {
            if ns.self_check().await? {
                println!("All drives healthy");
            } else {
                bail!("self-check failed; see the log for the drives involved");
            }
        }
        Commands::Capacity => {
            let capacity = ns.capacity().await?;
            println!("Total: {}", format_size(capacity.total_bytes));
            println!("Used:  {}", format_size(capacity.used_bytes));
            println!("Free:  {}", format_size(capacity.free_bytes()));
        }
        Commands::Disable { partition, drive } => {
            let drive = parse_drive(&drive)?;
            ns.disable_drive(partition, &drive).await?;
            println!("Drive {drive} in partition {partition} is RED");
        }
        Commands::Enable { partition, drive } => {
            let drive = parse_drive(&drive)?;
            let resync = ns.enable_drive(partition, &drive).await?;
            println!("Resynchronizing {drive}...");
            resync.await.context("resync task panicked")??;
            println!("Drive {drive} in partition {partition} is GREEN");
        }
        Commands::Repair { key } => match ns.read_repair(&key).await? {
            Some(version) => println!("{key}: all replicas at version {version}"),
            None => println!("{key}: absent on every replica"),
        },
        Commands::Log => {
            let paths = PathService::new(ns as Arc<dyn Namespace>, config.path_map);
            let latest = paths.log().latest_sequence().await?;
            let snapshot = paths.log().read_snapshot().await?.map(|s| s.version);
            let reached = paths.catch_up().await?;
            println!("Latest sequence:  {latest}");
            match snapshot {
                Some(version) => println!("Snapshot version: {version}"),
                None => println!("Snapshot version: none"),
            }
            println!("Replayed to:      {reached}");
            println!("Mappings:         {}", paths.map().len());
        }
        Commands::RecoverRenames => {
            let ns = ns as Arc<dyn Namespace>;
            let paths = Arc::new(PathService::new(Arc::clone(&ns), config.path_map));
            let store: FileStore<InodeRecord> =
                FileStore::new(ns, paths, &config.cache, config.client);
            let report = store.recover_interrupted_renames().await?;
            println!("Recovered: {}", report.recovered);
            println!("Deferred:  {}", report.deferred);
            println!("Failed:    {}", report.failed);
            if report.failed > 0 {
                bail!("{} rename markers need manual repair", report.failed);
            }
        }
    }

    Ok(())
}
