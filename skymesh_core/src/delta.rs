//! Delta Engine - minimal change between consecutive snapshots.
//!
//! The orchestrator only ever applies deltas, never full graphs, so per-step
//! OS work scales with churn rather than with constellation size.

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::model::{Link, NodeId};
use crate::topology::TopologySnapshot;

/// Delay changes at or below this (ms) are not worth reshaping for.
pub const DELAY_EPSILON_MS: f64 = 1e-2;

/// Add/update/delete lists for one transition, each sorted by index.
///
/// `deleted` carries the link as it was; `updated` and `added` carry the
/// link as it now is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub added: Vec<Link>,
    pub updated: Vec<Link>,
    pub deleted: Vec<Link>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    /// Applies this delta to `base`, returning the next snapshot.
    ///
    /// Links omitted from the delta keep their `base` delay.
    pub fn apply(&self, base: &TopologySnapshot) -> TopologySnapshot {
        let mut next = base.clone();
        for link in &self.deleted {
            next.remove(link.index);
        }
        for link in self.updated.iter().chain(&self.added) {
            next.remove(link.index);
            // Indices are unique after the removal above.
            let _ = next.insert(*link);
        }
        next
    }

    /// Merges another delta for a disjoint layer into this one.
    pub fn extend(&mut self, other: Delta) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
        self.sort();
    }

    /// Entries whose endpoint `a` is `node`, in index order.
    pub fn owned_by(&self, node: NodeId) -> Delta {
        let pick = |links: &[Link]| links.iter().filter(|l| l.a == node).copied().collect();
        Delta {
            added: pick(&self.added),
            updated: pick(&self.updated),
            deleted: pick(&self.deleted),
        }
    }

    fn sort(&mut self) {
        for list in [&mut self.added, &mut self.updated, &mut self.deleted] {
            list.sort_by_key(|l| l.index);
        }
    }
}

/// Diffs two snapshots of the same layer.
///
/// An index present in both with different endpoints means two pairings
/// share one index; that is an `IdentityViolation` and no delta is produced.
pub fn diff(old: &TopologySnapshot, new: &TopologySnapshot) -> Result<Delta, TopologyError> {
    let mut delta = Delta::default();

    for link in old.iter() {
        match new.get(link.index) {
            None => delta.deleted.push(*link),
            Some(next) if !next.same_endpoints(link) => {
                return Err(TopologyError::IdentityViolation {
                    index: link.index,
                    existing: format!("{}-{}", link.a, link.b),
                    conflicting: format!("{}-{}", next.a, next.b),
                });
            }
            Some(next) => {
                if (next.delay_ms - link.delay_ms).abs() > DELAY_EPSILON_MS {
                    delta.updated.push(*next);
                }
            }
        }
    }
    for link in new.iter() {
        if !old.contains(link.index) {
            delta.added.push(*link);
        }
    }

    delta.sort();
    Ok(delta)
}
