//! # phoneswitch simulator
//!
//! Runs the arbiter against simulated radios and prints the final snapshot
//! as JSON on stdout.
//!
//! ## Usage
//!
//! ```bash
//! # Seeded random churn on the default two-endpoint config
//! phoneswitch-sim --seed 7 --steps 200
//!
//! # Scripted scenario with an explicit arbiter config
//! phoneswitch-sim --config arbiter.toml --scenario steps.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use phoneswitch::ArbiterConfig;
use phoneswitch_sim::{RandomScenario, ScenarioFile, SimRadioConfig, Simulation, Step};

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ArbiterConfig::from_file(path)?,
        None => ArbiterConfig::default(),
    };
    let radio_cfg = SimRadioConfig {
        attach_latency: Duration::from_millis(args.latency_ms),
        detach_latency: Duration::from_millis(args.latency_ms / 2),
    };

    let steps: Vec<Step> = match &args.scenario {
        Some(path) => ScenarioFile::from_file(path)?.steps,
        None => RandomScenario::new(args.seed, config.endpoint_count).steps(args.steps),
    };

    tracing::info!(
        endpoints = config.endpoint_count,
        steps = steps.len(),
        seed = args.seed,
        scenario = ?args.scenario,
        "phoneswitch-sim starting"
    );

    // ── Run ─────────────────────────────────────────────────────
    let mut sim = Simulation::start(config, radio_cfg)?;
    let mut violations = 0usize;
    for (idx, step) in steps.iter().enumerate() {
        sim.apply(step)?;
        let snap = sim.snapshot();
        if snap.non_idle_count() > 1 {
            violations += 1;
            tracing::error!(step = idx, ?step, endpoints = ?snap.endpoints, "more than one radio up");
        }
    }

    if !sim.settle(Duration::from_secs(10)) {
        tracing::warn!("final settle timed out");
    }
    if let Err(e) = sim.check() {
        violations += 1;
        tracing::error!(error = %e, "settled state check failed");
    }
    let rejected = sim.rejected().len();

    // ── Report ──────────────────────────────────────────────────
    let snapshot = sim.shutdown();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    tracing::info!(rejected, violations, "phoneswitch-sim finished");

    if violations > 0 {
        anyhow::bail!("{} invariant violation(s)", violations);
    }
    Ok(())
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Run the data-connection arbiter against simulated radios.
#[derive(Parser, Debug)]
#[command(name = "phoneswitch-sim", about = "Data-connection arbiter simulator")]
struct Args {
    /// Arbiter config TOML (built-in defaults if omitted).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenario TOML with [[steps]]; random churn if omitted.
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Seed for random churn.
    #[arg(long, env = "PHONESWITCH_SEED", default_value_t = 1)]
    seed: u64,

    /// Number of random steps.
    #[arg(long, default_value_t = 100)]
    steps: usize,

    /// Simulated attach latency in milliseconds; detach takes half.
    #[arg(short, long = "latency", default_value_t = 20)]
    latency_ms: u64,
}
