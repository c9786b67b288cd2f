use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use traceshard_core::{
    ApiResponse, Assignment, Caller, ErrorKind, PlacementRequest, RebalanceReport, ShardingService, SystemStats,
    TraceShardConfig,
};
use traceshard_ledger::{MemoryLedger, RecordId, ShardId};

mod scenario;

use scenario::Scenario;

#[derive(Parser)]
#[command(name = "traceshard-cli")]
#[command(about = "traceshard placement tooling", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); TRACESHARD__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed an in-memory ledger from a scenario and place records on it
    Simulate {
        #[arg(long)]
        scenario: PathBuf,

        /// Records to place
        #[arg(long, default_value_t = 100)]
        records: u64,

        #[arg(long, default_value = "product")]
        shard_type: String,

        #[arg(long)]
        region: Option<String>,

        /// Resource units each record costs
        #[arg(long, default_value_t = 1.0)]
        cost: f64,

        /// 1 (lowest) to 10
        #[arg(long, default_value_t = 5)]
        priority: u8,

        /// Run a rebalancing pass after placement
        #[arg(long)]
        rebalance: bool,
    },

    /// Print the effective configuration
    CheckConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationSummary {
    shards: Vec<ShardId>,
    placed: u64,
    capacity_exhausted: u64,
    failed: u64,
    per_shard: Vec<(ShardId, u64)>,
    rebalance: Option<RebalanceReport>,
    stats: SystemStats,
}

async fn simulate(
    config: TraceShardConfig,
    scenario: Scenario,
    records: u64,
    request: PlacementRequest,
    rebalance: bool,
) -> Result<SimulationSummary> {
    let ledger = Arc::new(MemoryLedger::new());
    let service = ShardingService::new(ledger.clone(), config);
    let shards = scenario.seed(&service, ledger.as_ref()).await?;
    info!("seeded {} shard(s)", shards.len());

    let admin = Caller::admin(scenario.admin.clone());
    let mut placed = 0;
    let mut capacity_exhausted = 0;
    let mut failed = 0;
    let mut per_shard: Vec<(ShardId, u64)> = shards.iter().map(|id| (*id, 0)).collect();

    for n in 0..records {
        let record = RecordId::new(format!("sim-{}", n));
        match service.assign_record(&admin, &record, &request).await {
            Ok(Assignment { shard_id, .. }) => {
                placed += 1;
                if let Some(slot) = per_shard.iter_mut().find(|(id, _)| *id == shard_id) {
                    slot.1 += 1;
                }
            }
            Err(e) if e.kind() == ErrorKind::CapacityExhausted => capacity_exhausted += 1,
            Err(e) => {
                warn!("record {} not placed: {}", record, e);
                failed += 1;
            }
        }
    }
    info!("placed {} of {} record(s)", placed, records);

    let rebalance = if rebalance {
        Some(service.trigger_rebalancing(&admin).await?)
    } else {
        None
    };

    let stats = service.get_system_stats().await?;
    Ok(SimulationSummary {
        shards,
        placed,
        capacity_exhausted,
        failed,
        per_shard,
        rebalance,
        stats,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = TraceShardConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Simulate {
            scenario,
            records,
            shard_type,
            region,
            cost,
            priority,
            rebalance,
        } => {
            let scenario = Scenario::load(&scenario)?;
            let request = PlacementRequest::parse(&shard_type, cost, priority, region.as_deref())?;
            info!(
                "placing {} {} record(s) at priority {}",
                records,
                request.shard_type,
                request.priority.value()
            );
            let summary = simulate(config, scenario, records, request, rebalance).await?;
            println!("{}", serde_json::to_string_pretty(&ApiResponse::ok(summary, "simulation complete"))?);
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
