//! WolfRepl - MySQL/MariaDB Replication Control Engine
//!
//! Command line front end: each command runs one replication operation
//! against a live topology and prints the resulting snapshot as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfrepl::config::{LoggingConfig, WolfReplConfig};
use wolfrepl::error::{Error, OpResult, Result};
use wolfrepl::executor::MySqlTopology;
use wolfrepl::instance::{BinlogCoordinates, InstanceKey, OperationGtidHint};
use wolfrepl::replication::ReplicationController;

/// WolfRepl - MySQL/MariaDB Replication Control Engine
#[derive(Parser)]
#[command(name = "wolfrepl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrepl.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Dry run: check preconditions, change nothing
    #[arg(long)]
    noop: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start both replication threads
    StartReplica {
        /// Instance as host:port
        instance: InstanceKey,
    },

    /// Stop both replication threads
    StopReplica { instance: InstanceKey },

    /// Stop the IO thread, let the SQL thread catch up, then stop
    StopReplicaNicely {
        instance: InstanceKey,

        /// Seconds to wait for the SQL thread (0 = 24h)
        #[arg(short, long, default_value_t = 0)]
        timeout: u64,
    },

    /// Stop then start replication
    RestartReplica { instance: InstanceKey },

    /// Point a replica at a new source
    ChangeMaster {
        instance: InstanceKey,

        /// New source as host:port
        master: InstanceKey,

        /// Source binary log file; omit to continue by GTID
        #[arg(long)]
        log_file: Option<String>,

        /// Source binary log position
        #[arg(long, default_value_t = 4)]
        log_pos: u64,

        /// GTID hint (deny, neutral, force)
        #[arg(long, default_value = "neutral")]
        gtid: OperationGtidHint,

        /// Use the source hostname as given
        #[arg(long)]
        skip_unresolve: bool,
    },

    /// Skip the event the SQL thread failed on
    SkipQuery { instance: InstanceKey },

    /// Continue from the start of the source's next binary log
    SkipToNextBinlog { instance: InstanceKey },

    /// Forget the replica's source (RESET SLAVE ALL)
    ResetReplica { instance: InstanceKey },

    /// Compute semi-sync actions for a master's replicas without applying them
    AnalyzeSemiSync {
        master: InstanceKey,

        /// Replica to consider even if it is not replicating
        #[arg(long)]
        include: Option<InstanceKey>,

        /// Enforce exactly wait-for-replica-count acking replicas
        #[arg(long)]
        exact: bool,
    },

    /// Apply the semi-sync policy to one replica
    EnableSemiSyncReplica { instance: InstanceKey },

    /// Set read_only
    SetReadOnly { instance: InstanceKey },

    /// Clear read_only
    SetWriteable { instance: InstanceKey },

    /// Rotate binary logs
    FlushBinaryLogs {
        instance: InstanceKey,

        /// Number of rotations
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Rotate until this log file is current
        #[arg(long, conflicts_with = "count")]
        to: Option<String>,
    },

    /// Show the credentials the replica uses for its source
    Credentials { instance: InstanceKey },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        WolfReplConfig::from_file(&cli.config)?
    } else {
        WolfReplConfig::default()
    };
    config.noop |= cli.noop;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    // Initialize logging
    init_logging(&config.logging)?;
    if !cli.config.exists() {
        tracing::debug!("No configuration at {}, using defaults", cli.config.display());
    }

    let topology = Arc::new(MySqlTopology::new(&config.topology));
    let controller = ReplicationController::with_topology(topology.clone(), &config);

    let result = run(&controller, cli.command).await;
    topology.close().await;
    result
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let json = logging.format == "json";
    let file = match &logging.file {
        Some(path) => Some(std::sync::Mutex::new(
            std::fs::OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match (file, json) {
        (Some(file), true) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .init(),
        (Some(file), false) => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
            .init(),
        (None, true) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        (None, false) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

async fn run(controller: &ReplicationController, command: Commands) -> Result<()> {
    match command {
        Commands::StartReplica { instance } => report(controller.start_replication(&instance).await),
        Commands::StopReplica { instance } => report(controller.stop_replication(&instance).await),
        Commands::StopReplicaNicely { instance, timeout } => report(
            controller
                .stop_replication_nicely(&instance, Duration::from_secs(timeout))
                .await,
        ),
        Commands::RestartReplica { instance } => report(controller.restart_replication(&instance).await),
        Commands::ChangeMaster {
            instance,
            master,
            log_file,
            log_pos,
            gtid,
            skip_unresolve,
        } => {
            let coordinates = log_file
                .map(|file| BinlogCoordinates::new(file, log_pos))
                .unwrap_or_default();
            report(
                controller
                    .change_master_to(&instance, &master, &coordinates, skip_unresolve, gtid)
                    .await,
            )
        }
        Commands::SkipQuery { instance } => report(controller.skip_query(&instance).await),
        Commands::SkipToNextBinlog { instance } => report(controller.skip_to_next_binary_log(&instance).await),
        Commands::ResetReplica { instance } => report(controller.reset_replication(&instance).await),
        Commands::AnalyzeSemiSync { master, include, exact } => {
            let analysis = controller
                .analyze_semi_sync_replica_topology(&master, include.as_ref(), exact)
                .await?;
            print_json(&analysis)
        }
        Commands::EnableSemiSyncReplica { instance } => {
            let replica = controller.refresh_topology_instance(&instance).await?;
            report(controller.maybe_enable_semi_sync_replica(replica).await)
        }
        Commands::SetReadOnly { instance } => report(controller.set_read_only(&instance, true).await),
        Commands::SetWriteable { instance } => report(controller.set_read_only(&instance, false).await),
        Commands::FlushBinaryLogs { instance, count, to } => match to {
            Some(log_file) => report(controller.flush_binary_logs_to(&instance, &log_file).await),
            None => report(controller.flush_binary_logs(&instance, count).await),
        },
        Commands::Credentials { instance } => {
            let credentials = controller.read_replication_credentials(&instance).await?;
            print_json(&credentials)
        }
    }
}

/// Print the snapshot; on failure print the last known snapshot, then fail
fn report(result: OpResult) -> Result<()> {
    match result {
        Ok(instance) => print_json(&instance),
        Err(e) => {
            let (error, instance) = e.into_parts();
            if let Some(instance) = instance {
                print_json(&instance)?;
            }
            Err(error)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
