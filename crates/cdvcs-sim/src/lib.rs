//! Deterministic simulation of CDVCS replicas over a faulty network.
//!
//! Agents commit, resolve conflicts and fast-forward from each other. Every
//! change is a downstream op that is broadcast through a
//! [`SimulatedNetwork`](network::SimulatedNetwork) which delays, drops,
//! duplicates, reorders and partitions. After the last round the network
//! is drained and an anti-entropy pass hands every agent the ops it never
//! received; the [`oracle`] then checks the join laws on the outcome.
//!
//! A seed fully determines a run.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod agent;
pub mod campaign;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Result, bail};
use cdvcs_core::Context;
use cdvcs_core::crdt::cdvcs::{self, CdvcsOp, DEFAULT_BRANCH, OpMethod};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::agent::{AgentId, AgentState, SimulatedAgent};
use crate::network::{DeliverOutcome, FaultConfig, NetworkMessage, SimulatedNetwork};
use crate::rng::DeterministicRng;

/// Clock origin for simulated commits.
const EPOCH_MS: i64 = 1_700_000_000_000;

/// Parameters for one simulated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub agent_count: usize,
    pub rounds: u64,
    /// Peers each new op is sent to.
    pub fanout: usize,
    /// Chance per agent and round to commit (or resolve a conflict).
    pub commit_rate_percent: u8,
    /// Chance per agent and round to fast-forward from a random peer when
    /// it did not commit.
    pub pull_rate_percent: u8,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            agent_count: 4,
            rounds: 16,
            fanout: 2,
            commit_rate_percent: 30,
            pull_rate_percent: 20,
            fault: FaultConfig::default(),
        }
    }
}

/// What happened at one step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceEventKind {
    Emit {
        agent: AgentId,
        op_id: usize,
        method: OpMethod,
    },
    PullDeclined {
        agent: AgentId,
        peer: AgentId,
        reason: String,
    },
    Send {
        from: AgentId,
        to: AgentId,
        op_id: usize,
        dropped: bool,
        duplicated: bool,
        delay_rounds: u8,
    },
    Deliver {
        from: AgentId,
        to: AgentId,
        op_id: usize,
        duplicate: bool,
        graph_before: usize,
        graph_after: usize,
        /// Default-branch heads before and after the join.
        heads_before: Vec<String>,
        heads_after: Vec<String>,
    },
    Reorder {
        count: usize,
    },
    Partition {
        agent: AgentId,
        isolated: bool,
    },
    /// Anti-entropy handed `ops` missed ops to `agent`.
    Repair {
        agent: AgentId,
        ops: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

/// Outcome of a run, ready for the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    pub trace: Vec<TraceEvent>,
    /// Final agent values, by agent id.
    pub states: Vec<AgentState>,
    /// Every op emitted, indexed by op id. Op 0 creates the repository.
    pub ops: Vec<CdvcsOp>,
    /// Deliveries that left an agent's default branch conflicted.
    pub conflicts_observed: usize,
    pub pulls_declined: usize,
    /// At least one conflict, declined pull or destructive fault occurred.
    pub interesting_state_reached: bool,
}

/// Drives one seeded run.
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    ctx: Context,
    network: SimulatedNetwork,
    agents: Vec<SimulatedAgent>,
    ops: Vec<CdvcsOp>,
    trace: Vec<TraceEvent>,
    conflicts_observed: usize,
    pulls_declined: usize,
    faults_hit: usize,
}

impl Simulator {
    /// Set up agents that all start from the same fresh repository.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty agent set or if the root commit
    /// cannot be created.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.agent_count == 0 {
            bail!("agent_count must be > 0");
        }

        let ctx = Context::deterministic(EPOCH_MS);
        let origin = cdvcs::new_repository(&ctx, "origin", Some("simulated repository"), Vec::new())?;
        let mut agents: Vec<SimulatedAgent> = (0..config.agent_count).map(SimulatedAgent::new).collect();
        for agent in &mut agents {
            agent.observe(0, &origin.op);
        }

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            network: SimulatedNetwork::new(config.fault),
            config,
            ctx,
            agents,
            ops: vec![origin.op],
            trace: Vec::new(),
            conflicts_observed: 0,
            pulls_declined: 0,
            faults_hit: 0,
        })
    }

    /// Run every round, then drain and repair.
    ///
    /// # Errors
    ///
    /// Returns an error on structural failures from the core engine.
    pub fn run(mut self) -> Result<SimulationResult> {
        debug!(
            seed = self.config.seed,
            agents = self.config.agent_count,
            rounds = self.config.rounds,
            "simulation started"
        );

        for round in 0..self.config.rounds {
            self.maybe_toggle_partition(round);
            for agent in 0..self.agents.len() {
                if self.rng.hit_rate_percent(self.config.commit_rate_percent) {
                    self.local_work(agent, round)?;
                } else if self.agents.len() > 1 && self.rng.hit_rate_percent(self.config.pull_rate_percent) {
                    self.pull_from_peer(agent, round)?;
                }
            }
            let outcome = self.network.deliver_ready(round, &mut self.rng);
            self.deliver(round, outcome);
        }

        let end = self.config.rounds;
        self.network.heal();
        let outcome = self.network.drain(&mut self.rng);
        self.deliver(end, outcome);
        self.repair(end);

        debug!(
            seed = self.config.seed,
            ops = self.ops.len(),
            conflicts = self.conflicts_observed,
            declined = self.pulls_declined,
            "simulation finished"
        );

        Ok(SimulationResult {
            states: self.agents.iter().map(SimulatedAgent::snapshot).collect(),
            interesting_state_reached: self.conflicts_observed > 0 || self.pulls_declined > 0 || self.faults_hit > 0,
            conflicts_observed: self.conflicts_observed,
            pulls_declined: self.pulls_declined,
            trace: self.trace,
            ops: self.ops,
        })
    }

    fn push(&mut self, round: u64, kind: TraceEventKind) {
        trace!(round, ?kind, "sim event");
        self.trace.push(TraceEvent { round, kind });
    }

    fn maybe_toggle_partition(&mut self, round: u64) {
        if self.agents.len() < 2 || !self.rng.hit_rate_percent(self.config.fault.partition_rate_percent) {
            return;
        }
        let agent = self.rng.next_index(self.agents.len());
        let isolated = !self.network.is_partitioned(agent);
        self.network.set_partitioned(agent, isolated);
        if isolated {
            self.faults_hit += 1;
        }
        self.push(round, TraceEventKind::Partition { agent, isolated });
    }

    fn local_work(&mut self, agent: AgentId, round: u64) -> Result<()> {
        let staged = self.agents[agent].work(&self.ctx, round)?;
        self.emit(agent, staged.op, round);
        Ok(())
    }

    fn pull_from_peer(&mut self, agent: AgentId, round: u64) -> Result<()> {
        // Any agent but `agent` itself.
        let offset = 1 + self.rng.next_index(self.agents.len() - 1);
        let peer = (agent + offset) % self.agents.len();

        let remote = self.agents[peer].state().clone();
        match self.agents[agent].pull_from(&remote)? {
            Ok(op) => self.emit(agent, op, round),
            Err(rejection) => {
                self.pulls_declined += 1;
                self.push(
                    round,
                    TraceEventKind::PullDeclined {
                        agent,
                        peer,
                        reason: rejection.kind().to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Record a locally produced op, join it at its author and broadcast it.
    fn emit(&mut self, agent: AgentId, op: CdvcsOp, round: u64) {
        let op_id = self.ops.len();
        let method = op.method;
        self.agents[agent].observe(op_id, &op);
        self.ops.push(op);
        self.push(round, TraceEventKind::Emit { agent, op_id, method });

        let peers: Vec<AgentId> = (0..self.agents.len()).filter(|peer| *peer != agent).collect();
        let targets = self.rng.shuffled(&peers);
        for to in targets.into_iter().take(self.config.fanout) {
            let message = NetworkMessage { from: agent, to, op_id };
            let outcome = self.network.send(message, round, &mut self.rng);
            if outcome.dropped || outcome.duplicated {
                self.faults_hit += 1;
            }
            self.push(
                round,
                TraceEventKind::Send {
                    from: agent,
                    to,
                    op_id,
                    dropped: outcome.dropped,
                    duplicated: outcome.duplicated,
                    delay_rounds: outcome.delay_rounds,
                },
            );
        }
    }

    fn deliver(&mut self, round: u64, outcome: DeliverOutcome) {
        if outcome.reordered {
            self.faults_hit += 1;
            self.push(
                round,
                TraceEventKind::Reorder {
                    count: outcome.delivered.len(),
                },
            );
        }
        for message in outcome.delivered {
            self.join_at(round, message.from, message.to, message.op_id);
        }
    }

    fn join_at(&mut self, round: u64, from: AgentId, to: AgentId, op_id: usize) {
        let agent = &mut self.agents[to];
        let duplicate = agent.has_seen(op_id);
        let heads_before = default_heads(agent);
        let (graph_before, graph_after) = agent.observe(op_id, &self.ops[op_id]);
        let heads_after = default_heads(agent);

        if heads_after.len() > 1 && heads_before.len() <= 1 {
            self.conflicts_observed += 1;
        }
        self.push(
            round,
            TraceEventKind::Deliver {
                from,
                to,
                op_id,
                duplicate,
                graph_before,
                graph_after,
                heads_before,
                heads_after,
            },
        );
    }

    /// Anti-entropy: every agent joins, in op order, the ops it missed.
    fn repair(&mut self, round: u64) {
        for agent in 0..self.agents.len() {
            let missed: Vec<usize> = (0..self.ops.len())
                .filter(|op_id| !self.agents[agent].has_seen(*op_id))
                .collect();
            if missed.is_empty() {
                continue;
            }
            for &op_id in &missed {
                self.agents[agent].observe(op_id, &self.ops[op_id]);
            }
            self.push(
                round,
                TraceEventKind::Repair {
                    agent,
                    ops: missed.len(),
                },
            );
        }
    }
}

fn default_heads(agent: &SimulatedAgent) -> Vec<String> {
    agent
        .state()
        .heads(DEFAULT_BRANCH)
        .map(|heads| heads.iter().map(ToString::to_string).collect())
        .unwrap_or_default()
}

pub fn init() {
    tracing::info!("cdvcs-sim initialized");
}
