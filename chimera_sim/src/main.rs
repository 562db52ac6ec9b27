//! Chimera DST Simulator CLI
//!
//! Run deterministic simulation scenarios, or drive the live services
//! against a real clock and a sled database with `--live`.

use chimera_core::{Chimera, ChimeraConfig, HarvestStore, SledHarvestStore, TargetStatus};
use chimera_env::TokioContext;
use chimera_sim::scenarios::ScenarioId;
use chimera_sim::{ScenarioResult, ScenarioRunner};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Chimera Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "chimera-sim")]
#[command(about = "Run deterministic simulation tests for Chimera", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (see --help for names, or "all")
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Harvest cycles per sweep scenario
    #[arg(short, long, default_value = "200")]
    cycles: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Run the live services for this many seconds instead of scenarios
    #[arg(long)]
    live: Option<u64>,

    /// Database path for --live
    #[arg(long, default_value = "chimera.db")]
    db: String,
}

/// Runs both services on the tokio clock until `secs` elapse.
fn run_live(secs: u64, seed: u64, db: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = Arc::new(SledHarvestStore::open(db)?);
        let seeded = store.seed_defaults()?;
        if seeded > 0 {
            info!("Seeded {} default targets into {}", seeded, db);
        }

        let context = Arc::new(TokioContext::seeded(seed));
        let app = Chimera::new(context, store, ChimeraConfig::default());
        app.start_background_tasks();
        info!("{}", app.deploy_circuit().await);

        let pending = app.store().list_targets_by_status(TargetStatus::Pending)?;
        if let Some(target) = pending.first() {
            app.start_harvest(target.id)?;
        }

        let deadline = Duration::from_secs(secs);
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        while started.elapsed() < deadline {
            ticker.tick().await;
            let status = app.status();
            info!(
                circuit = %status.circuit.status,
                ip = ?status.circuit.ip,
                harvester = status.harvester_running,
                records = app.harvested_records()?.len(),
                "Status"
            );
        }

        app.shutdown().await;
        for target in app.targets()? {
            info!(
                "  target {} [{}] {}",
                target.id,
                target.status,
                target.label()
            );
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if let Some(secs) = args.live {
        info!("Chimera live run: {}s (seed={}, db={})", secs, base_seed, args.db);
        if let Err(e) = run_live(secs, base_seed, &args.db) {
            error!("Live run failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if !args.json {
        info!("Chimera DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed).with_cycles(args.cycles);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "time_secs": r.final_time_secs,
                    "cycles": r.metrics.cycles,
                    "records_found": r.metrics.records_found,
                    "targets_completed": r.metrics.targets_completed,
                    "circuit_states": r.metrics.circuit_states,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}
