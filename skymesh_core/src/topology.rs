//! Topology Builder - link graphs per time step.
//!
//! Turns sampled positions into one ISL snapshot per (shell, step) and one
//! merged GSL snapshot per step, every link tagged with its persistent index.
//!
//! # Index space
//!
//! ```text
//! 0 ........................ isl_total-1 | isl_total ............ <= 65535
//! shell 0 ISLs | shell 1 ISLs | ...      | GSLs, first-seen order
//! ```
//!
//! ISL indices follow from static structure (a fixed `(orbit, slot)`
//! traversal), so they need no table. GSL endpoints change on handover, so
//! GSL indices come from [`GslIndexTable`], which hands out a new index the
//! first time a `(ground station, satellite)` pairing is seen and reuses it
//! afterwards, even across gaps.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::delta::{diff, Delta};
use crate::error::TopologyError;
use crate::geometry::{delay_ms, max_slant_range_km, to_cbf, PositionTable};
use crate::model::{GroundStation, Link, Lla, NodeId, SatId, Shell};

/// Largest index that still maps onto a `/24` subnet and a tunnel key.
pub const MAX_LINK_INDEX: u32 = u16::MAX as u32;

/// How satellites inside a shell are linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IslStyle {
    /// Next satellite in the same orbit plus same slot in the next orbit,
    /// both with wrap-around.
    #[default]
    #[serde(alias = "Grid")]
    Grid,
}

impl IslStyle {
    /// Static endpoint pairs of one shell, in allocation order.
    pub fn pairs(&self, shell_idx: u32, shell: &Shell) -> Result<Vec<(SatId, SatId)>, TopologyError> {
        match self {
            Self::Grid => grid_pairs(shell_idx, shell),
        }
    }
}

fn grid_pairs(shell_idx: u32, shell: &Shell) -> Result<Vec<(SatId, SatId)>, TopologyError> {
    let (orbits, slots) = (shell.orbit_count, shell.sats_per_orbit);
    if orbits < 2 || slots < 2 {
        return Err(TopologyError::shell(
            &shell.name,
            "grid links need at least 2 orbits and 2 satellites per orbit (a satellite would be its own neighbour)",
        ));
    }

    // With only two orbits (or slots) both wrap directions reach the same
    // neighbour; such pairs are allocated once.
    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(2 * shell.satellite_count());
    for orbit in 0..orbits {
        for slot in 0..slots {
            let me = SatId::new(shell_idx, orbit, slot);
            let next_in_orbit = SatId::new(shell_idx, orbit, (slot + 1) % slots);
            let next_orbit = SatId::new(shell_idx, (orbit + 1) % orbits, slot);
            for peer in [next_in_orbit, next_orbit] {
                let key = if me < peer { (me, peer) } else { (peer, me) };
                if seen.insert(key) {
                    pairs.push((me, peer));
                }
            }
        }
    }
    Ok(pairs)
}

/// How ground stations pick satellites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GslStyle {
    /// Bind to the `antennas` nearest satellites in range, across all shells.
    LeastDelay { antennas: usize },
}

impl Default for GslStyle {
    fn default() -> Self {
        Self::LeastDelay { antennas: 1 }
    }
}

/// Lookup table giving GSL pairings stable indices.
#[derive(Debug, Clone)]
pub struct GslIndexTable {
    next: u32,
    table: HashMap<(u32, SatId), u32>,
}

impl GslIndexTable {
    /// Creates a table allocating from `first_index`.
    pub fn new(first_index: u32) -> Self {
        Self {
            next: first_index,
            table: HashMap::new(),
        }
    }

    /// Returns the index of a pairing, allocating it on first sight.
    pub fn index_for(&mut self, gid: u32, sat: SatId) -> Result<u32, TopologyError> {
        if let Some(&index) = self.table.get(&(gid, sat)) {
            return Ok(index);
        }
        let index = self.next;
        if index > MAX_LINK_INDEX {
            return Err(TopologyError::IndexSpaceExhausted(index));
        }
        self.next += 1;
        self.table.insert((gid, sat), index);
        Ok(index)
    }

    /// Number of pairings seen so far.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// The complete link set of one layer at one step, keyed by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    links: BTreeMap<u32, Link>,
}

impl TopologySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a link, rejecting an index already bound to other endpoints.
    pub fn insert(&mut self, link: Link) -> Result<(), TopologyError> {
        if let Some(existing) = self.links.get(&link.index) {
            if !existing.same_endpoints(&link) {
                return Err(TopologyError::IdentityViolation {
                    index: link.index,
                    existing: format!("{}-{}", existing.a, existing.b),
                    conflicting: format!("{}-{}", link.a, link.b),
                });
            }
        }
        self.links.insert(link.index, link);
        Ok(())
    }

    pub fn get(&self, index: u32) -> Option<&Link> {
        self.links.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.links.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Links with `node` as an endpoint, in index order.
    pub fn links_of(&self, node: NodeId) -> impl Iterator<Item = &Link> {
        self.links
            .values()
            .filter(move |l| l.a == node || l.b == node)
    }

    pub(crate) fn remove(&mut self, index: u32) -> Option<Link> {
        self.links.remove(&index)
    }
}

impl FromIterator<Link> for TopologySnapshot {
    /// Collects links; a later duplicate index overwrites an earlier one.
    fn from_iter<I: IntoIterator<Item = Link>>(iter: I) -> Self {
        Self {
            links: iter.into_iter().map(|l| (l.index, l)).collect(),
        }
    }
}

/// Link styles and visibility limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// ISL style
    pub isl_style: IslStyle,

    /// GSL style
    pub gsl_style: GslStyle,

    /// Minimum elevation at which a ground station sees a satellite (degrees)
    pub min_elevation_deg: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            isl_style: IslStyle::Grid,
            gsl_style: GslStyle::default(),
            min_elevation_deg: 25.0,
        }
    }
}

impl TopologyConfig {
    pub fn with_antennas(mut self, antennas: usize) -> Self {
        self.gsl_style = GslStyle::LeastDelay { antennas };
        self
    }

    pub fn with_min_elevation(mut self, degrees: f64) -> Self {
        self.min_elevation_deg = degrees;
        self
    }
}

/// Every snapshot of the run, plus the positions they were built from.
#[derive(Debug, Clone)]
pub struct Timeline {
    shells: Vec<Shell>,
    ground_stations: Vec<GroundStation>,
    positions: PositionTable,
    steps: usize,

    /// `[shell][step]`
    isl: Vec<Vec<TopologySnapshot>>,

    /// `[step]`
    gsl: Vec<TopologySnapshot>,

    /// Delta into each snapshot, same layout as `isl`
    isl_deltas: Vec<Vec<Delta>>,

    /// Delta into each snapshot, same layout as `gsl`
    gsl_deltas: Vec<Delta>,
}

impl Timeline {
    /// Builds all snapshots for `steps` sampled positions.
    pub fn build(
        shells: Vec<Shell>,
        ground_stations: Vec<GroundStation>,
        positions: PositionTable,
        steps: usize,
        config: &TopologyConfig,
    ) -> Result<Self, TopologyError> {
        for shell in &shells {
            shell.validate()?;
        }
        for (i, gs) in ground_stations.iter().enumerate() {
            gs.validate()?;
            if gs.id as usize != i {
                return Err(TopologyError::InvalidGroundStation {
                    id: gs.id,
                    reason: format!("ids must be dense, expected {}", i),
                });
            }
        }

        let mut isl = Vec::with_capacity(shells.len());
        let mut next_index: u32 = 0;
        for (shell_idx, shell) in shells.iter().enumerate() {
            let pairs = config.isl_style.pairs(shell_idx as u32, shell)?;
            let first = next_index;
            let last = first as u64 + pairs.len() as u64;
            if last > MAX_LINK_INDEX as u64 + 1 {
                return Err(TopologyError::IndexSpaceExhausted(last as u32));
            }
            next_index = last as u32;

            let mut per_step = Vec::with_capacity(steps);
            for t in 0..steps {
                let mut snapshot = TopologySnapshot::new();
                for (offset, (a, b)) in pairs.iter().enumerate() {
                    let pa = sat_position(&positions, shell, *a, t)?;
                    let pb = sat_position(&positions, shell, *b, t)?;
                    let delay = delay_ms((to_cbf(pa) - to_cbf(pb)).norm());
                    snapshot.insert(Link::new(
                        first + offset as u32,
                        NodeId::Satellite(*a),
                        NodeId::Satellite(*b),
                        delay,
                    ))?;
                }
                per_step.push(snapshot);
            }
            debug!(
                "shell {}: {} ISLs, indices {}..{}",
                shell.name,
                pairs.len(),
                first,
                next_index
            );
            isl.push(per_step);
        }

        let mut timeline = Self {
            shells,
            ground_stations,
            positions,
            steps,
            isl,
            gsl: Vec::with_capacity(steps),
            isl_deltas: Vec::new(),
            gsl_deltas: Vec::new(),
        };
        timeline.build_gsl(next_index, config)?;

        // Every index must name the same pairing for the whole run.
        timeline.isl_deltas = timeline
            .isl
            .iter()
            .map(|layer| layer_deltas(layer))
            .collect::<Result<_, _>>()?;
        timeline.gsl_deltas = layer_deltas(&timeline.gsl)?;
        Ok(timeline)
    }

    fn build_gsl(&mut self, first_index: u32, config: &TopologyConfig) -> Result<(), TopologyError> {
        let GslStyle::LeastDelay { antennas } = config.gsl_style;
        let ranges: Vec<f64> = self
            .shells
            .iter()
            .map(|s| max_slant_range_km(s.altitude_km, config.min_elevation_deg))
            .collect();
        let ground: Vec<Vector3<f64>> = self
            .ground_stations
            .iter()
            .map(|gs| to_cbf(&gs.lla()))
            .collect();

        let mut table = GslIndexTable::new(first_index);
        for t in 0..self.steps {
            let sats = self.sat_vectors(t)?;
            let mut snapshot = TopologySnapshot::new();
            for (gs, gpos) in self.ground_stations.iter().zip(&ground) {
                let mut candidates: Vec<(f64, SatId)> = sats
                    .iter()
                    .map(|(sat, pos)| ((pos - gpos).norm(), *sat))
                    .filter(|(dist, sat)| *dist <= ranges[sat.shell as usize])
                    .collect();
                candidates.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)));
                for (dist, sat) in candidates.into_iter().take(antennas) {
                    let index = table.index_for(gs.id, sat)?;
                    snapshot.insert(Link::new(
                        index,
                        NodeId::Ground(gs.id),
                        NodeId::Satellite(sat),
                        delay_ms(dist),
                    ))?;
                }
            }
            self.gsl.push(snapshot);
        }
        debug!("{} distinct GSL pairings", table.len());
        Ok(())
    }

    fn sat_vectors(&self, t: usize) -> Result<Vec<(SatId, Vector3<f64>)>, TopologyError> {
        let mut out = Vec::new();
        for (shell_idx, shell) in self.shells.iter().enumerate() {
            for orbit in 0..shell.orbit_count {
                for slot in 0..shell.sats_per_orbit {
                    let sat = SatId::new(shell_idx as u32, orbit, slot);
                    out.push((sat, to_cbf(sat_position(&self.positions, shell, sat, t)?)));
                }
            }
        }
        Ok(out)
    }

    pub fn shells(&self) -> &[Shell] {
        &self.shells
    }

    pub fn ground_stations(&self) -> &[GroundStation] {
        &self.ground_stations
    }

    /// Number of sampled steps (snapshots per layer).
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn total_satellites(&self) -> usize {
        self.shells.iter().map(Shell::satellite_count).sum()
    }

    pub fn isl_snapshot(&self, shell: u32, t: usize) -> Option<&TopologySnapshot> {
        self.isl.get(shell as usize)?.get(t)
    }

    pub fn gsl_snapshot(&self, t: usize) -> Option<&TopologySnapshot> {
        self.gsl.get(t)
    }

    /// ISL delta into step `t`; step 0 diffs against the empty graph.
    pub fn isl_delta(&self, shell: u32, t: usize) -> Option<Delta> {
        self.isl_deltas.get(shell as usize)?.get(t).cloned()
    }

    /// GSL delta into step `t`; step 0 diffs against the empty graph.
    pub fn gsl_delta(&self, t: usize) -> Option<Delta> {
        self.gsl_deltas.get(t).cloned()
    }

    /// Position of a node at step `t`.
    pub fn position(&self, node: NodeId, t: usize) -> Option<Lla> {
        match node {
            NodeId::Ground(gid) => self.ground_stations.get(gid as usize).map(|g| g.lla()),
            NodeId::Satellite(sat) => {
                let shell = self.shells.get(sat.shell as usize)?;
                if sat.orbit >= shell.orbit_count || sat.slot >= shell.sats_per_orbit {
                    return None;
                }
                self.positions
                    .get(sat.shell, shell.flat_index(sat.orbit, sat.slot), t)
                    .copied()
            }
        }
    }

    /// Straight-line distance between two nodes at step `t` (km).
    pub fn distance_km(&self, a: NodeId, b: NodeId, t: usize) -> Option<f64> {
        let pa = self.position(a, t)?;
        let pb = self.position(b, t)?;
        Some((to_cbf(&pa) - to_cbf(&pb)).norm())
    }

    /// ISL neighbours of a satellite at step `t`, with link delay.
    pub fn neighbours(&self, sat: SatId, t: usize) -> Vec<(NodeId, f64)> {
        let node = NodeId::Satellite(sat);
        self.isl_snapshot(sat.shell, t)
            .map(|snap| {
                snap.links_of(node)
                    .filter_map(|l| l.peer_of(node).map(|p| (p, l.delay_ms)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ground stations bound to a satellite at step `t`, with link delay.
    pub fn ground_stations_of(&self, sat: SatId, t: usize) -> Vec<(u32, f64)> {
        let node = NodeId::Satellite(sat);
        self.gsl_snapshot(t)
            .map(|snap| {
                snap.links_of(node)
                    .filter_map(|l| match l.a {
                        NodeId::Ground(gid) => Some((gid, l.delay_ms)),
                        NodeId::Satellite(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Deltas into every snapshot of a layer; step 0 diffs against the empty graph.
fn layer_deltas(layer: &[TopologySnapshot]) -> Result<Vec<Delta>, TopologyError> {
    let empty = TopologySnapshot::new();
    let mut previous = &empty;
    let mut deltas = Vec::with_capacity(layer.len());
    for snapshot in layer {
        deltas.push(diff(previous, snapshot)?);
        previous = snapshot;
    }
    Ok(deltas)
}

fn sat_position<'a>(
    positions: &'a PositionTable,
    shell: &Shell,
    sat: SatId,
    t: usize,
) -> Result<&'a Lla, TopologyError> {
    positions
        .get(sat.shell, shell.flat_index(sat.orbit, sat.slot), t)
        .ok_or_else(|| {
            TopologyError::Positions(format!("no position for {} at step {}", NodeId::Satellite(sat), t))
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    /// Evenly spaced satellites on circular orbits, moving `drift` degrees of
    /// longitude per step.
    pub(crate) fn grid_positions(shell: &Shell, steps: usize, drift: f64) -> Vec<Vec<Lla>> {
        let mut out = Vec::new();
        for orbit in 0..shell.orbit_count {
            for slot in 0..shell.sats_per_orbit {
                let seq = (0..steps)
                    .map(|t| {
                        let lon = -180.0
                            + 360.0 * orbit as f64 / shell.orbit_count as f64
                            + drift * t as f64;
                        let lat = -60.0 + 120.0 * slot as f64 / shell.sats_per_orbit as f64;
                        Lla::new(lat, (lon + 180.0).rem_euclid(360.0) - 180.0, shell.altitude_km)
                    })
                    .collect();
                out.push(seq);
            }
        }
        out
    }

    pub(crate) fn timeline(
        shells: Vec<Shell>,
        ground: Vec<GroundStation>,
        steps: usize,
        config: &TopologyConfig,
    ) -> Timeline {
        let raw = shells.iter().map(|s| grid_positions(s, steps, 1.5)).collect();
        Timeline::build(shells, ground, PositionTable::from_raw(raw), steps, config).unwrap()
    }

    #[test]
    fn test_two_by_two_grid_has_four_links() {
        let shell = Shell::new("tiny", 550.0, 53.0, 2, 2);
        let tl = timeline(vec![shell], vec![], 3, &TopologyConfig::default());
        for t in 0..3 {
            let snap = tl.isl_snapshot(0, t).unwrap();
            assert_eq!(snap.len(), 4);
            for orbit in 0..2 {
                for slot in 0..2 {
                    let node = NodeId::sat(0, orbit, slot);
                    let mut peers: Vec<_> = snap.links_of(node).filter_map(|l| l.peer_of(node)).collect();
                    peers.sort();
                    peers.dedup();
                    assert_eq!(peers.len(), 2, "{} should have two neighbours", node);
                    assert!(!peers.contains(&node));
                }
            }
        }
    }

    #[test]
    fn test_grid_rejects_self_loops() {
        for (o, s) in [(1, 4), (4, 1), (1, 1)] {
            let shell = Shell::new("thin", 550.0, 53.0, o, s);
            assert!(IslStyle::Grid.pairs(0, &shell).is_err());
        }
    }

    #[test]
    fn test_grid_degree_on_larger_shell() {
        let shell = Shell::new("s", 550.0, 53.0, 5, 7);
        let pairs = IslStyle::Grid.pairs(0, &shell).unwrap();
        assert_eq!(pairs.len(), 2 * 35);
    }

    #[test]
    fn test_indices_global_across_shells() {
        let shells = vec![
            Shell::new("a", 550.0, 53.0, 3, 3),
            Shell::new("b", 1100.0, 70.0, 4, 4),
        ];
        let tl = timeline(shells, vec![], 2, &TopologyConfig::default());
        let a: Vec<u32> = tl.isl_snapshot(0, 0).unwrap().iter().map(|l| l.index).collect();
        let b: Vec<u32> = tl.isl_snapshot(1, 0).unwrap().iter().map(|l| l.index).collect();
        assert_eq!(a, (0..18).collect::<Vec<_>>());
        assert_eq!(b, (18..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_gsl_table_reuses_index_after_gap() {
        let mut table = GslIndexTable::new(100);
        let s1 = SatId::new(0, 0, 0);
        let s2 = SatId::new(0, 0, 1);
        assert_eq!(table.index_for(0, s1).unwrap(), 100);
        assert_eq!(table.index_for(0, s2).unwrap(), 101);
        assert_eq!(table.index_for(1, s1).unwrap(), 102);
        assert_eq!(table.index_for(0, s1).unwrap(), 100);
    }

    #[test]
    fn test_gsl_table_exhaustion() {
        let mut table = GslIndexTable::new(MAX_LINK_INDEX);
        assert!(table.index_for(0, SatId::new(0, 0, 0)).is_ok());
        assert!(matches!(
            table.index_for(0, SatId::new(0, 0, 1)),
            Err(TopologyError::IndexSpaceExhausted(_))
        ));
    }

    #[test]
    fn test_identity_violation_detected() {
        let mut snap = TopologySnapshot::new();
        snap.insert(Link::new(7, NodeId::Ground(0), NodeId::sat(0, 0, 0), 2.0)).unwrap();
        // Same endpoints: fine (reshaped).
        snap.insert(Link::new(7, NodeId::Ground(0), NodeId::sat(0, 0, 0), 2.5)).unwrap();
        let err = snap
            .insert(Link::new(7, NodeId::Ground(0), NodeId::sat(0, 0, 1), 2.0))
            .unwrap_err();
        assert!(matches!(err, TopologyError::IdentityViolation { index: 7, .. }));
    }

    #[test]
    fn test_ground_station_binds_nearest_in_range() {
        let shell = Shell::new("s", 550.0, 53.0, 4, 6);
        let gs = GroundStation::new(0, 0.0, 0.0);
        let config = TopologyConfig::default().with_antennas(2).with_min_elevation(10.0);
        let tl = timeline(vec![shell], vec![gs], 4, &config);
        let first_gsl = tl.isl_snapshot(0, 0).unwrap().len() as u32;

        for t in 0..4 {
            let snap = tl.gsl_snapshot(t).unwrap();
            assert!(snap.len() <= 2);
            let range = max_slant_range_km(550.0, 10.0);
            for link in snap.iter() {
                assert!(link.index >= first_gsl);
                let d = tl.distance_km(link.a, link.b, t).unwrap();
                assert!(d <= range);
                assert_relative_eq!(link.delay_ms, delay_ms(d), epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_ground_station_out_of_range_is_empty() {
        let shell = Shell::new("s", 550.0, 53.0, 3, 3);
        let gs = GroundStation::new(0, 0.0, 0.0);
        let config = TopologyConfig::default().with_min_elevation(89.99);
        let tl = timeline(vec![shell], vec![gs], 2, &config);
        assert!(tl.gsl_snapshot(0).unwrap().is_empty());
    }

    #[test]
    fn test_query_helpers() {
        let shell = Shell::new("s", 550.0, 53.0, 3, 4);
        let tl = timeline(vec![shell], vec![GroundStation::new(0, 10.0, 10.0)], 2, &TopologyConfig::default());
        let sat = SatId::new(0, 1, 1);
        let neighbours = tl.neighbours(sat, 0);
        assert_eq!(neighbours.len(), 4);
        assert!(neighbours.iter().any(|(n, _)| *n == NodeId::sat(0, 1, 2)));
        assert!(neighbours.iter().any(|(n, _)| *n == NodeId::sat(0, 2, 1)));

        assert_eq!(tl.position(NodeId::Ground(0), 1).unwrap().lat_deg, 10.0);
        assert!(tl.position(NodeId::sat(0, 9, 0), 0).is_none());
        assert_relative_eq!(
            tl.distance_km(NodeId::Satellite(sat), NodeId::Satellite(sat), 0).unwrap(),
            0.0
        );

        let gsl = tl.gsl_snapshot(0).unwrap();
        if let Some(link) = gsl.iter().next() {
            let bound = link.b.as_sat().unwrap();
            assert_eq!(tl.ground_stations_of(bound, 0)[0].0, 0);
        };
    }

    #[test]
    fn test_regained_pairing_keeps_its_index() {
        let shell = Shell::new("s", 550.0, 53.0, 2, 2);
        let at = |lons: [f64; 5]| lons.iter().map(|lon| Lla::new(0.0, *lon, 550.0)).collect::<Vec<_>>();
        // sat 0 overhead, handover to sat 1, back to sat 0, nobody, sat 0 again
        let raw = vec![vec![
            at([0.0, 90.0, 0.5, 90.0, 0.0]),
            at([90.0, 1.0, 90.0, 90.0, 90.0]),
            at([-90.0; 5]),
            at([180.0; 5]),
        ]];
        let tl = Timeline::build(
            vec![shell],
            vec![GroundStation::new(0, 0.0, 0.0)],
            PositionTable::from_raw(raw),
            5,
            &TopologyConfig::default(),
        )
        .unwrap();

        let bound: Vec<Vec<(u32, NodeId)>> = (0..5)
            .map(|t| tl.gsl_snapshot(t).unwrap().iter().map(|l| (l.index, l.b)).collect())
            .collect();
        let first = (4, NodeId::sat(0, 0, 0));
        let second = (5, NodeId::sat(0, 0, 1));
        assert_eq!(bound, vec![vec![first], vec![second], vec![first], vec![], vec![first]]);

        let indices = |links: &[Link]| links.iter().map(|l| l.index).collect::<Vec<_>>();
        let handover = tl.gsl_delta(1).unwrap();
        assert_eq!((indices(&handover.deleted), indices(&handover.added)), (vec![4], vec![5]));
        let back = tl.gsl_delta(2).unwrap();
        assert_eq!((indices(&back.deleted), indices(&back.added)), (vec![5], vec![4]));
        assert_eq!(indices(&tl.gsl_delta(3).unwrap().deleted), vec![4]);
        assert_eq!(indices(&tl.gsl_delta(4).unwrap().added), vec![4]);
    }

    proptest! {
        #[test]
        fn test_isl_index_stable_across_steps(orbits in 2u32..6, slots in 2u32..6) {
            let shell = Shell::new("p", 600.0, 60.0, orbits, slots);
            let tl = timeline(vec![shell.clone()], vec![], 3, &TopologyConfig::default());
            let tl_again = timeline(vec![shell], vec![], 3, &TopologyConfig::default());
            let first: Vec<_> = tl.isl_snapshot(0, 0).unwrap().iter().map(|l| (l.index, l.a, l.b)).collect();
            for t in 1..3 {
                let later: Vec<_> = tl.isl_snapshot(0, t).unwrap().iter().map(|l| (l.index, l.a, l.b)).collect();
                prop_assert_eq!(&first, &later);
            }
            let again: Vec<_> = tl_again.isl_snapshot(0, 2).unwrap().iter().map(|l| (l.index, l.a, l.b)).collect();
            prop_assert_eq!(first, again);
        }

        #[test]
        fn test_gsl_pairing_and_index_stay_bound(
            orbits in 2u32..5,
            slots in 2u32..5,
            drift in 0.0f64..40.0,
            steps in 2usize..8,
            antennas in 1usize..3,
            stations in prop::collection::vec((-50.0f64..50.0, -180.0f64..180.0), 1..4),
        ) {
            let shell = Shell::new("p", 550.0, 53.0, orbits, slots);
            let ground: Vec<GroundStation> = stations
                .iter()
                .enumerate()
                .map(|(i, (lat, lon))| GroundStation::new(i as u32, *lat, *lon))
                .collect();
            let config = TopologyConfig::default().with_antennas(antennas).with_min_elevation(10.0);
            let raw = vec![grid_positions(&shell, steps, drift)];
            let tl = Timeline::build(vec![shell], ground, PositionTable::from_raw(raw), steps, &config).unwrap();
            let first_gsl = tl.isl_snapshot(0, 0).unwrap().len() as u32;

            let mut by_pairing: HashMap<(NodeId, NodeId), u32> = HashMap::new();
            let mut by_index: HashMap<u32, (NodeId, NodeId)> = HashMap::new();
            for t in 0..steps {
                for link in tl.gsl_snapshot(t).unwrap().iter() {
                    prop_assert!(link.index >= first_gsl);
                    let pairing = (link.a, link.b);
                    let index = *by_pairing.entry(pairing).or_insert(link.index);
                    prop_assert_eq!(index, link.index, "{:?} changed index", pairing);
                    let named = *by_index.entry(link.index).or_insert(pairing);
                    prop_assert_eq!(named, pairing, "index {} names two pairings", link.index);
                }
                prop_assert!(tl.gsl_delta(t).is_some());
            }
        }
    }
}
