use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use txcoord_core::{CoordinatorConfig, SessionId, ShardId, Timestamp, TransactionId, Vote};
use txcoord_state::{
    DecisionLog, InMemoryReplicaSet, RemoteParticipantClient, SimCluster, SledDecisionLog,
    TransactionCoordinatorService,
};

#[derive(Parser)]
#[command(name = "txcoord")]
#[command(about = "Cross-shard two-phase commit coordinator", long_about = None)]
struct Cli {
    /// Coordinator configuration file (yaml, toml or json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run transactions through the coordinator against simulated shards
    Simulate {
        /// Number of participant shards
        #[arg(long, default_value_t = 3)]
        participants: usize,

        /// Index of a shard that votes abort
        #[arg(long)]
        abort_at: Option<usize>,

        /// Transactions to run, one session each
        #[arg(long, default_value_t = 1)]
        transactions: u64,

        /// Persist coordinator documents in a sled database at this path
        #[arg(long)]
        log_path: Option<PathBuf>,

        /// Client-side wait bound per transaction
        #[arg(long)]
        max_time_ms: Option<u64>,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = CoordinatorConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Simulate {
            participants,
            abort_at,
            transactions,
            log_path,
            max_time_ms,
        } => {
            simulate(
                config,
                participants,
                abort_at,
                transactions,
                log_path,
                max_time_ms.map(Duration::from_millis),
            )
            .await?;
        }
    }
    Ok(())
}

async fn simulate(
    config: CoordinatorConfig,
    participants: usize,
    abort_at: Option<usize>,
    transactions: u64,
    log_path: Option<PathBuf>,
    max_wait: Option<Duration>,
) -> Result<()> {
    anyhow::ensure!(participants > 0, "at least one participant is required");

    let cluster = SimCluster::new();
    for index in 0..participants {
        let vote = if Some(index) == abort_at {
            Vote::Abort {
                reason: "simulated conflict".to_string(),
            }
        } else {
            Vote::Commit {
                prepare_timestamp: Timestamp(100 + index as u64),
            }
        };
        cluster.add_shard(format!("shard{}", index), vote);
    }
    let shards: Vec<ShardId> = cluster.shard_ids();

    let log: Arc<dyn DecisionLog> = match &log_path {
        Some(path) => Arc::new(
            SledDecisionLog::open(path)
                .with_context(|| format!("opening decision log at {}", path.display()))?,
        ),
        None => {
            let replica_set = InMemoryReplicaSet::new();
            cluster.attach_durability_monitor(replica_set.clone());
            Arc::new(replica_set.elect_primary())
        }
    };

    let client = Arc::new(RemoteParticipantClient::new(cluster.clone()));
    let service = TransactionCoordinatorService::new(client, config);
    let recovered = service.on_step_up(log).await?;
    if recovered.total() > 0 {
        info!("resumed {} coordinators from the decision log", recovered.total());
    }

    let mut pending = Vec::new();
    for number in 1..=transactions {
        let txn_id = TransactionId::new(SessionId::new(), number);
        let service = service.clone();
        let shards = shards.clone();
        pending.push(tokio::spawn(async move {
            let result = service.coordinate_commit(&txn_id, shards, max_wait).await;
            (txn_id, result)
        }));
    }

    println!("{}", serde_json::to_string_pretty(&service.report())?);

    for task in pending {
        let (txn_id, result) = task.await?;
        match result {
            Ok(decision) => println!("{} -> {}", txn_id, decision),
            Err(err) => println!("{} -> error: {}", txn_id, err),
        }
    }

    service.catalog().join().await;
    for shard in &shards {
        let journal = cluster.received(shard.as_str());
        let names: Vec<_> = journal.iter().map(|c| c.name()).collect();
        println!("{}: {}", shard, names.join(", "));
    }

    if log_path.is_none() && cluster.violations() > 0 {
        anyhow::bail!(
            "{} decisions were delivered before they were durable",
            cluster.violations()
        );
    }
    Ok(())
}
