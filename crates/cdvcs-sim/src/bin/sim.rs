#![forbid(unsafe_code)]

use std::env;
use std::io;

use anyhow::Result;
use cdvcs_sim::campaign::{CampaignConfig, format_violation, replay_seed, run_campaign};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "cdvcs-sim: seeded convergence campaigns for the commit-graph CRDT",
    long_about = None
)]
struct Cli {
    /// First seed of the campaign.
    #[arg(long, default_value_t = 0)]
    seed_start: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 100)]
    seeds: u64,

    /// Replay one seed and print its trace instead of running a campaign.
    #[arg(long, conflicts_with_all = ["seed_start", "seeds"])]
    replay: Option<u64>,

    #[arg(long, default_value_t = 5)]
    agents: usize,

    #[arg(long, default_value_t = 24)]
    rounds: u64,

    /// Peers each new op is sent to.
    #[arg(long, default_value_t = 2)]
    fanout: usize,

    #[arg(long, default_value_t = 30)]
    commit_percent: u8,

    #[arg(long, default_value_t = 20)]
    pull_percent: u8,

    #[arg(long, default_value_t = 10)]
    drop_percent: u8,

    #[arg(long, default_value_t = 5)]
    duplicate_percent: u8,

    #[arg(long, default_value_t = 10)]
    reorder_percent: u8,

    #[arg(long, default_value_t = 5)]
    partition_percent: u8,

    /// Maximum delivery delay in rounds.
    #[arg(long, default_value_t = 3)]
    max_delay: u8,

    /// Emit JSON output instead of human-readable text.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn campaign(&self) -> CampaignConfig {
        CampaignConfig {
            seed_range: self.seed_start..self.seed_start.saturating_add(self.seeds),
            agent_count: self.agents,
            rounds: self.rounds,
            fanout: self.fanout,
            commit_percent: self.commit_percent,
            pull_percent: self.pull_percent,
            fault_drop_percent: self.drop_percent,
            fault_duplicate_percent: self.duplicate_percent,
            fault_reorder_percent: self.reorder_percent,
            fault_partition_percent: self.partition_percent,
            fault_max_delay: self.max_delay,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.campaign();

    if let Some(seed) = cli.replay {
        let trace = replay_seed(seed, &config)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&trace.result.trace)?);
        } else {
            for event in &trace.result.trace {
                println!("[{:>3}] {:?}", event.round, event.kind);
            }
            println!(
                "seed {seed}: ops={} conflicts={} declined_pulls={} passed={}",
                trace.result.ops.len(),
                trace.result.conflicts_observed,
                trace.result.pulls_declined,
                trace.oracle.passed
            );
            for violation in &trace.oracle.violations {
                println!("  {}", format_violation(violation));
            }
        }
        if !trace.oracle.passed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let report = run_campaign(&config)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} interesting={} ops={}",
            report.seeds_run, report.seeds_passed, report.interesting_states_reached, report.ops_emitted
        );
        for failure in &report.failures {
            println!("seed {} failed:", failure.seed);
            for violation in &failure.violations {
                println!("  {violation}");
            }
        }
        if let Some(seed) = report.first_failure {
            println!("replay with: cdvcs-sim --replay {seed}");
        }
    }

    if !report.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CDVCS_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "cdvcs_sim=debug,cdvcs_core=debug,info"
        } else {
            "cdvcs_sim=info,warn"
        })
    });

    let format = env::var("CDVCS_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry.with(fmt::layer().compact().with_writer(io::stderr)).init();
        }
    }
}
