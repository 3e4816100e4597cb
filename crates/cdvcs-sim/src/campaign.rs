//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds across configurable parameters, collecting pass/fail
//! results and identifying the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::rng::DeterministicRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign-level configuration controlling how many seeds to run and
/// what simulation parameters to use for each seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    pub agent_count: usize,
    pub rounds: u64,
    /// Number of peers each new op is sent to.
    pub fanout: usize,
    pub commit_percent: u8,
    pub pull_percent: u8,
    pub fault_drop_percent: u8,
    pub fault_duplicate_percent: u8,
    pub fault_reorder_percent: u8,
    pub fault_partition_percent: u8,
    /// Maximum delivery delay in rounds.
    pub fault_max_delay: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            agent_count: 5,
            rounds: 24,
            fanout: 2,
            commit_percent: 30,
            pull_percent: 20,
            fault_drop_percent: 10,
            fault_duplicate_percent: 5,
            fault_reorder_percent: 10,
            fault_partition_percent: 5,
            fault_max_delay: 3,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            agent_count: self.agent_count,
            rounds: self.rounds,
            fanout: self.fanout,
            commit_rate_percent: self.commit_percent,
            pull_rate_percent: self.pull_percent,
            fault: FaultConfig {
                max_delay_rounds: self.fault_max_delay,
                drop_rate_percent: self.fault_drop_percent,
                duplicate_rate_percent: self.fault_duplicate_percent,
                reorder_rate_percent: self.fault_reorder_percent,
                partition_rate_percent: self.fault_partition_percent,
            },
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.agent_count == 0 {
            bail!("agent_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let percents = [
            self.commit_percent,
            self.pull_percent,
            self.fault_drop_percent,
            self.fault_duplicate_percent,
            self.fault_reorder_percent,
            self.fault_partition_percent,
        ];
        if percents.iter().any(|p| *p > 100) {
            bail!("percentages must be within 0..=100");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that hit a conflict, a declined pull or a destructive fault.
    pub interesting_states_reached: usize,
    /// Total ops emitted across all seeds.
    pub ops_emitted: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Detailed trace produced by replaying a single seed.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run a full campaign across all seeds in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        ops_emitted: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = simulate(seed, config)?;
        report.seeds_run += 1;
        report.ops_emitted += trace.result.ops.len();
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed and return Ok(()) on pass, Err(violations) on failure.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the simulation itself encounters an internal
/// error. The inner `Result` distinguishes pass from invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = simulate(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    simulate(seed, config)
}

fn simulate(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let result = Simulator::new(config.sim_config_for_seed(seed))?.run()?;
    let mut oracle_rng = DeterministicRng::new(seed.wrapping_add(0xDEAD));
    let oracle = ConvergenceOracle::check_all(&result, &mut oracle_rng);
    Ok(DetailedTrace { result, oracle })
}

/// Format an invariant violation into a human-readable string.
#[must_use]
pub fn format_violation(v: &InvariantViolation) -> String {
    match v {
        InvariantViolation::Convergence {
            agent_a,
            agent_b,
            only_in_a,
            only_in_b,
            heads_differ,
        } => format!(
            "Convergence: agents {agent_a} and {agent_b} diverge \
             (only_in_a={only_in_a:?}, only_in_b={only_in_b:?}, heads_differ={heads_differ})"
        ),
        InvariantViolation::Commutativity {
            permutation_index,
            missing_commits,
            extra_commits,
            heads_differ,
        } => format!(
            "Commutativity: permutation {permutation_index} diverges \
             (missing={missing_commits:?}, extra={extra_commits:?}, heads_differ={heads_differ})"
        ),
        InvariantViolation::Idempotence { agent, op_id } => {
            format!("Idempotence: re-joining op {op_id} changed agent {agent}")
        }
        InvariantViolation::Monotonicity {
            agent,
            op_id,
            round,
            lost_heads,
            graph_before,
            graph_after,
        } => format!(
            "Monotonicity: op {op_id} at round {round} regressed agent {agent} \
             (graph {graph_before} -> {graph_after}, lost_heads={lost_heads:?})"
        ),
        InvariantViolation::HeadPruning { agent, branch, heads } => {
            format!("HeadPruning: agent {agent} branch {branch} has unpruned heads {heads:?}")
        }
    }
}
