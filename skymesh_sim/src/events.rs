//! Scheduled events: faults and diagnostics keyed by simulation step.

use serde::{Deserialize, Serialize};
use skymesh_core::NodeId;
use std::collections::BTreeMap;

/// Node ids travel as their names (`SH1O2S3`, `GS1`) in config files.
mod node_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use skymesh_core::NodeId;

    pub fn serialize<S: Serializer>(node: &NodeId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(node)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NodeId, D::Error> {
        let name = String::deserialize(d)?;
        name.parse().map_err(D::Error::custom)
    }
}

/// Something to do at a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Damage `ratio` of all satellites, drawn from the undamaged ones
    Damage { ratio: f64 },

    /// Restore every damaged satellite
    Recovery,

    /// Dump a node's routing table
    RouteTable {
        #[serde(with = "node_name")]
        node: NodeId,
    },

    /// CPU/memory snapshot of every machine
    Utility,

    Ping {
        #[serde(with = "node_name")]
        src: NodeId,
        #[serde(with = "node_name")]
        dst: NodeId,
    },

    /// Throughput test
    Perf {
        #[serde(with = "node_name")]
        src: NodeId,
        #[serde(with = "node_name")]
        dst: NodeId,
    },

    /// Route every subnet of `dst` through the interface facing `via`
    NextHop {
        #[serde(with = "node_name")]
        src: NodeId,
        #[serde(with = "node_name")]
        dst: NodeId,
        #[serde(with = "node_name")]
        via: NodeId,
    },
}

impl Event {
    /// Faults change link state and run inline; everything else is a
    /// diagnostic and runs detached from the step barrier.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Damage { .. } | Self::Recovery)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Damage { .. } => "damage",
            Self::Recovery => "recovery",
            Self::RouteTable { .. } => "route_table",
            Self::Utility => "utility",
            Self::Ping { .. } => "ping",
            Self::Perf { .. } => "perf",
            Self::NextHop { .. } => "next_hop",
        }
    }

    /// Nodes the event refers to.
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Self::Damage { .. } | Self::Recovery | Self::Utility => Vec::new(),
            Self::RouteTable { node } => vec![*node],
            Self::Ping { src, dst } | Self::Perf { src, dst } => vec![*src, *dst],
            Self::NextHop { src, dst, via } => vec![*src, *dst, *via],
        }
    }
}

/// An event with its trigger step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub step: usize,

    #[serde(flatten)]
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(step: usize, event: Event) -> Self {
        Self { step, event }
    }
}

/// Pending events ordered by step, then by insertion.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    pending: BTreeMap<usize, Vec<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, scheduled: ScheduledEvent) {
        self.pending
            .entry(scheduled.step)
            .or_default()
            .push(scheduled.event);
    }

    /// Removes and returns every event due at or before `step`.
    pub fn pop_due(&mut self, step: usize) -> Vec<(usize, Event)> {
        let later = self.pending.split_off(&(step + 1));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_iter()
            .flat_map(|(s, events)| events.into_iter().map(move |e| (s, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl FromIterator<ScheduledEvent> for EventQueue {
    fn from_iter<I: IntoIterator<Item = ScheduledEvent>>(iter: I) -> Self {
        let mut queue = Self::new();
        for scheduled in iter {
            queue.push(scheduled);
        }
        queue
    }
}
