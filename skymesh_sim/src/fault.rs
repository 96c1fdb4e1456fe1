//! Fault injection: random node damage and full recovery.
//!
//! Damage is node-scoped: the owning machine forces 100% loss on every
//! interface of a damaged satellite. The injector only decides *which*
//! satellites; the scheduler ships the decision to the machines.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use skymesh_core::{Assignment, NodeId};
use skymesh_env::MachineId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Tracks the damaged set and draws new victims.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    /// Every satellite of the constellation
    population: Vec<NodeId>,

    damaged: BTreeSet<NodeId>,

    rng: ChaCha8Rng,
}

impl FaultInjector {
    /// Creates an injector over `population`, seeded for reproducible draws.
    pub fn new(population: Vec<NodeId>, seed: u64) -> Self {
        Self {
            population,
            damaged: BTreeSet::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Injector over every satellite of an assignment.
    pub fn for_assignment(assignment: &Assignment, seed: u64) -> Self {
        Self::new(assignment.satellites().map(NodeId::from).collect(), seed)
    }

    pub fn damaged(&self) -> &BTreeSet<NodeId> {
        &self.damaged
    }

    pub fn population(&self) -> usize {
        self.population.len()
    }

    /// Number of satellites a damage event of `ratio` asks for.
    pub fn need(&self, ratio: f64) -> usize {
        (ratio * self.population.len() as f64).round() as usize
    }

    /// Draws `round(ratio * population)` undamaged satellites uniformly
    /// without replacement and marks them damaged.
    ///
    /// When fewer undamaged satellites remain, all of them are drawn.
    pub fn damage(&mut self, ratio: f64) -> Vec<NodeId> {
        let need = self.need(ratio);
        let pool: Vec<NodeId> = self
            .population
            .iter()
            .copied()
            .filter(|n| !self.damaged.contains(n))
            .collect();
        if need > pool.len() {
            warn!(
                "damage ratio {} needs {} satellites, only {} undamaged",
                ratio,
                need,
                pool.len()
            );
        }

        let mut picked: Vec<NodeId> = pool
            .choose_multiple(&mut self.rng, need.min(pool.len()))
            .copied()
            .collect();
        picked.sort();
        self.damaged.extend(picked.iter().copied());
        picked
    }

    /// Clears the damaged set, returning what it held.
    pub fn recover(&mut self) -> BTreeSet<NodeId> {
        std::mem::take(&mut self.damaged)
    }
}

/// Groups nodes by the machine hosting them. Unknown nodes are dropped.
pub fn by_machine(nodes: &[NodeId], assignment: &Assignment) -> BTreeMap<MachineId, Vec<NodeId>> {
    let mut groups: BTreeMap<MachineId, Vec<NodeId>> = BTreeMap::new();
    for node in nodes {
        if let Some(machine) = assignment.machine_of(*node) {
            groups.entry(machine).or_default().push(*node);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn population(n: u32) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::sat(0, i / 10, i % 10)).collect()
    }

    #[test]
    fn test_damage_thirty_percent_of_hundred() {
        let mut faults = FaultInjector::new(population(100), 42);
        let victims = faults.damage(0.3);
        assert_eq!(victims.len(), 30);
        assert_eq!(faults.damaged().len(), 30);

        let restored = faults.recover();
        assert_eq!(restored.len(), 30);
        assert!(faults.damaged().is_empty());

        // the whole population is eligible again
        assert_eq!(faults.damage(1.0).len(), 100);
    }

    #[test]
    fn test_damage_draws_from_undamaged_pool() {
        let mut faults = FaultInjector::new(population(10), 1);
        let first: BTreeSet<_> = faults.damage(0.5).into_iter().collect();
        let second: BTreeSet<_> = faults.damage(0.5).into_iter().collect();
        assert!(first.is_disjoint(&second));
        assert_eq!(faults.damaged().len(), 10);
        assert!(faults.damage(0.5).is_empty());
    }

    #[test]
    fn test_same_seed_same_victims() {
        let a = FaultInjector::new(population(50), 9).damage(0.2);
        let b = FaultInjector::new(population(50), 9).damage(0.2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_by_machine() {
        let assignment = Assignment::parse_manifest("0\n3 s1\n0 0 0\n3 s2\n1 1 1\n\n10.0.0.1\n10.0.0.2\n").unwrap();
        let groups = by_machine(
            &[NodeId::sat(0, 0, 0), NodeId::sat(1, 2, 2), NodeId::sat(0, 1, 1), NodeId::sat(5, 0, 0)],
            &assignment,
        );
        assert_eq!(groups[&MachineId(0)], vec![NodeId::sat(0, 0, 0), NodeId::sat(0, 1, 1)]);
        assert_eq!(groups[&MachineId(1)], vec![NodeId::sat(1, 2, 2)]);
        assert_eq!(groups.len(), 2);
    }

    proptest! {
        #[test]
        fn test_damaged_set_bounded_by_need(ratio in 0.0f64..=1.0, seed in any::<u64>()) {
            let mut faults = FaultInjector::new(population(100), seed);
            let need = faults.need(ratio);
            let victims = faults.damage(ratio);
            prop_assert_eq!(victims.len(), need);
            prop_assert!(faults.damaged().len() <= need);
            faults.recover();
            prop_assert!(faults.damaged().is_empty());
        }
    }
}
