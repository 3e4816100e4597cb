use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::rng::DeterministicRng;

/// Fault injection configuration for simulated op delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends dropped.
    pub drop_rate_percent: u8,
    /// Percentage of sends duplicated.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of reversing the ready batch at each tick.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round to toggle a random partition.
    pub partition_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            reorder_rate_percent: 5,
            partition_rate_percent: 2,
        }
    }
}

/// A downstream op in flight. Ops live in the simulator's op table; the
/// message carries the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub from: AgentId,
    pub to: AgentId,
    pub op_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMessage {
    deliver_at_round: u64,
    message: NetworkMessage,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

/// Result of delivering all ready messages for a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<NetworkMessage>,
    pub reordered: bool,
}

/// Deterministic fault-injecting network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingMessage>,
    partitioned_agents: BTreeSet<AgentId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            partitioned_agents: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Isolate or reconnect an agent.
    pub fn set_partitioned(&mut self, agent: AgentId, isolated: bool) {
        if isolated {
            self.partitioned_agents.insert(agent);
        } else {
            self.partitioned_agents.remove(&agent);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, agent: AgentId) -> bool {
        self.partitioned_agents.contains(&agent)
    }

    /// Reconnect every agent.
    pub fn heal(&mut self) {
        self.partitioned_agents.clear();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send a message with fault injection.
    pub fn send(&mut self, message: NetworkMessage, round: u64, rng: &mut DeterministicRng) -> SendOutcome {
        if self.is_partitioned(message.from) || self.is_partitioned(message.to) {
            return SendOutcome::DROPPED;
        }
        if rng.hit_rate_percent(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let delay_bound = u64::from(self.fault.max_delay_rounds).saturating_add(1);
        let delay = u8::try_from(rng.next_bounded(delay_bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));
        self.pending.push(PendingMessage {
            deliver_at_round,
            message,
        });

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            // The copy may arrive later than the original.
            let extra = u64::from(rng.hit_rate_percent(50));
            self.pending.push(PendingMessage {
                deliver_at_round: deliver_at_round.saturating_add(extra),
                message,
            });
        }

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Deliver every message whose round has arrived.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (mut ready, future): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.pending = future;

        let reordered = ready.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            ready.reverse();
        }

        DeliverOutcome {
            delivered: ready.into_iter().map(|pending| pending.message).collect(),
            reordered,
        }
    }

    /// Deliver everything still in flight, ignoring delays.
    pub fn drain(&mut self, rng: &mut DeterministicRng) -> DeliverOutcome {
        self.deliver_ready(u64::MAX, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: AgentId, to: AgentId, op_id: usize) -> NetworkMessage {
        NetworkMessage { from, to, op_id }
    }

    fn no_faults() -> FaultConfig {
        FaultConfig {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
        }
    }

    #[test]
    fn clean_network_delivers_in_round() {
        let mut rng = DeterministicRng::new(0);
        let mut net = SimulatedNetwork::new(no_faults());
        let outcome = net.send(message(0, 1, 7), 3, &mut rng);
        assert!(!outcome.dropped);

        let delivered = net.deliver_ready(3, &mut rng);
        assert_eq!(delivered.delivered, vec![message(0, 1, 7)]);
        assert_eq!(net.pending_len(), 0);
    }

    #[test]
    fn partition_drops_both_directions() {
        let mut rng = DeterministicRng::new(0);
        let mut net = SimulatedNetwork::new(no_faults());
        net.set_partitioned(1, true);
        assert!(net.send(message(0, 1, 0), 0, &mut rng).dropped);
        assert!(net.send(message(1, 2, 0), 0, &mut rng).dropped);

        net.heal();
        assert!(!net.send(message(0, 1, 0), 0, &mut rng).dropped);
    }

    #[test]
    fn full_drop_rate_loses_everything() {
        let mut rng = DeterministicRng::new(0);
        let mut net = SimulatedNetwork::new(FaultConfig {
            drop_rate_percent: 100,
            ..no_faults()
        });
        for op_id in 0..10 {
            assert!(net.send(message(0, 1, op_id), 0, &mut rng).dropped);
        }
        assert_eq!(net.pending_len(), 0);
    }

    #[test]
    fn duplicates_are_both_delivered() {
        let mut rng = DeterministicRng::new(0);
        let mut net = SimulatedNetwork::new(FaultConfig {
            duplicate_rate_percent: 100,
            ..no_faults()
        });
        assert!(net.send(message(0, 1, 4), 0, &mut rng).duplicated);
        assert_eq!(net.drain(&mut rng).delivered.len(), 2);
    }

    #[test]
    fn delayed_messages_wait() {
        let mut rng = DeterministicRng::new(5);
        let mut net = SimulatedNetwork::new(FaultConfig {
            max_delay_rounds: 3,
            ..no_faults()
        });
        let mut sent = 0;
        for op_id in 0..20 {
            sent += usize::from(!net.send(message(0, 1, op_id), 0, &mut rng).dropped);
        }
        let mut delivered = 0;
        for round in 0..=3 {
            delivered += net.deliver_ready(round, &mut rng).delivered.len();
        }
        assert_eq!(delivered, sent);
    }
}
