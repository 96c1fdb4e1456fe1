//! Partitioner - which machine hosts which node.
//!
//! Placement is shell-granular: every satellite of a shell lives on the same
//! machine, shells dealt round-robin. A ground station follows the satellite
//! it is bound to at step 0 so that its first link is a local veth pair.
//!
//! The [`Assignment`] is built once, serialized as the manifest and shipped
//! to every agent; after that it is read-only.
//!
//! # Manifest format
//!
//! ```text
//! 0 0 1            ground station -> machine id
//! 22 shell1        orbit_count shell_name
//! 0 0 0 ... 0      machine id per slot (sats_per_orbit entries)
//! 4 shell2
//! 1 1 1 1
//!                  blank line
//! 10.0.0.1         machine 0 address
//! 10.0.0.2         machine 1 address
//! ```

use serde::{Deserialize, Serialize};
use skymesh_env::MachineId;
use std::path::Path;

use crate::error::ManifestError;
use crate::model::{NodeId, SatId, Shell};
use crate::topology::TopologySnapshot;

/// Placement of one shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellPlacement {
    /// Shell name (diff directory)
    pub name: String,

    /// Number of orbits
    pub orbit_count: u32,

    /// Machine per slot; its length is the satellites per orbit
    pub slots: Vec<MachineId>,
}

impl ShellPlacement {
    pub fn sats_per_orbit(&self) -> u32 {
        self.slots.len() as u32
    }

    /// `(orbits, satellites per orbit)`
    pub fn grid(&self) -> (u32, u32) {
        (self.orbit_count, self.sats_per_orbit())
    }
}

/// Node to machine mapping plus the reachable address of every machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Machine per ground station
    pub ground: Vec<MachineId>,

    /// Placement per shell
    pub shells: Vec<ShellPlacement>,

    /// Reachable address per machine (tunnel endpoints)
    pub machines: Vec<String>,
}

impl Assignment {
    /// Machine that hosts `node`, if the node exists.
    pub fn machine_of(&self, node: NodeId) -> Option<MachineId> {
        match node {
            NodeId::Ground(gid) => self.ground.get(gid as usize).copied(),
            NodeId::Satellite(sat) => {
                let shell = self.shells.get(sat.shell as usize)?;
                if sat.orbit >= shell.orbit_count {
                    return None;
                }
                shell.slots.get(sat.slot as usize).copied()
            }
        }
    }

    /// Reachable address of a machine.
    pub fn address(&self, machine: MachineId) -> Option<&str> {
        self.machines.get(machine.index()).map(String::as_str)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Every satellite in `(shell, orbit, slot)` order.
    pub fn satellites(&self) -> impl Iterator<Item = SatId> + '_ {
        self.shells.iter().enumerate().flat_map(|(i, shell)| {
            (0..shell.orbit_count).flat_map(move |orbit| {
                (0..shell.sats_per_orbit()).map(move |slot| SatId::new(i as u32, orbit, slot))
            })
        })
    }

    /// Every node: satellites first, then ground stations.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.satellites()
            .map(NodeId::Satellite)
            .chain((0..self.ground.len() as u32).map(NodeId::Ground))
    }

    /// Nodes hosted on `machine`, in registry order.
    pub fn local_nodes(&self, machine: MachineId) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| self.machine_of(*n) == Some(machine))
            .collect()
    }

    pub fn is_local(&self, node: NodeId, machine: MachineId) -> bool {
        self.machine_of(node) == Some(machine)
    }

    /// Serializes the manifest.
    pub fn to_manifest(&self) -> String {
        let ids = |ids: &[MachineId]| {
            ids.iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let mut out = String::new();
        out.push_str(&ids(&self.ground));
        out.push('\n');
        for shell in &self.shells {
            out.push_str(&format!("{} {}\n", shell.orbit_count, shell.name));
            out.push_str(&ids(&shell.slots));
            out.push('\n');
        }
        out.push('\n');
        for address in &self.machines {
            out.push_str(address);
            out.push('\n');
        }
        out
    }

    /// Parses a manifest.
    pub fn parse_manifest(text: &str) -> Result<Self, ManifestError> {
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));

        let parse_ids = |lineno: usize, line: &str| -> Result<Vec<MachineId>, ManifestError> {
            line.split_whitespace()
                .map(|tok| {
                    tok.parse()
                        .map_err(|_| ManifestError::malformed(lineno, format!("bad machine id '{}'", tok)))
                })
                .collect()
        };

        let (lineno, first) = lines
            .next()
            .ok_or_else(|| ManifestError::malformed(1, "empty manifest"))?;
        let ground = parse_ids(lineno, first)?;

        let mut shells = Vec::new();
        let mut last = lineno;
        loop {
            let Some((lineno, header)) = lines.next() else {
                return Err(ManifestError::malformed(last + 1, "missing blank line before addresses"));
            };
            if header.is_empty() {
                break;
            }
            let (count, name) = header
                .split_once(char::is_whitespace)
                .ok_or_else(|| ManifestError::malformed(lineno, "expected 'orbit_count name'"))?;
            let orbit_count: u32 = count
                .parse()
                .map_err(|_| ManifestError::malformed(lineno, format!("bad orbit count '{}'", count)))?;
            let (slot_line, slot_ids) = lines
                .next()
                .ok_or_else(|| ManifestError::malformed(lineno + 1, "missing slot assignment line"))?;
            let slots = parse_ids(slot_line, slot_ids)?;
            last = slot_line;
            if slots.is_empty() {
                return Err(ManifestError::malformed(slot_line, "empty slot assignment"));
            }
            shells.push(ShellPlacement {
                name: name.trim().to_string(),
                orbit_count,
                slots,
            });
        }

        let machines: Vec<String> = lines
            .map(|(_, l)| l)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let assignment = Self {
            ground,
            shells,
            machines,
        };
        assignment.check_machines()?;
        Ok(assignment)
    }

    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::parse_manifest(&std::fs::read_to_string(path)?)
    }

    /// Writes the manifest file.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        std::fs::write(path, self.to_manifest())?;
        Ok(())
    }

    fn check_machines(&self) -> Result<(), ManifestError> {
        let used = self
            .ground
            .iter()
            .chain(self.shells.iter().flat_map(|s| s.slots.iter()));
        for machine in used {
            if machine.index() >= self.machines.len() {
                return Err(ManifestError::UnknownMachine(machine.0));
            }
        }
        Ok(())
    }
}

/// Builds the assignment.
///
/// Shell `i` goes to machine `i % M`. Ground station `g` goes to the machine
/// of the nearest satellite it is bound to in `gsl_t0`, or machine 0 when it
/// is bound to none.
pub fn partition(
    shells: &[Shell],
    ground_count: usize,
    gsl_t0: &TopologySnapshot,
    machines: Vec<String>,
) -> Result<Assignment, ManifestError> {
    if machines.is_empty() {
        return Err(ManifestError::malformed(0, "no machines configured"));
    }
    let m = machines.len() as u32;

    let placements: Vec<ShellPlacement> = shells
        .iter()
        .enumerate()
        .map(|(i, shell)| ShellPlacement {
            name: shell.name.clone(),
            orbit_count: shell.orbit_count,
            slots: vec![MachineId(i as u32 % m); shell.sats_per_orbit as usize],
        })
        .collect();

    let ground = (0..ground_count as u32)
        .map(|gid| {
            gsl_t0
                .links_of(NodeId::Ground(gid))
                .min_by(|x, y| x.delay_ms.total_cmp(&y.delay_ms))
                .and_then(|l| l.b.as_sat())
                .and_then(|sat| {
                    placements
                        .get(sat.shell as usize)
                        .and_then(|p| p.slots.get(sat.slot as usize))
                        .copied()
                })
                .unwrap_or_default()
        })
        .collect();

    let assignment = Assignment {
        ground,
        shells: placements,
        machines,
    };
    assignment.check_machines()?;
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Link;

    fn shells() -> Vec<Shell> {
        vec![
            Shell::new("s1", 550.0, 53.0, 3, 4),
            Shell::new("s2", 1100.0, 70.0, 2, 3),
            Shell::new("s3", 1300.0, 80.0, 2, 2),
        ]
    }

    #[test]
    fn test_shells_round_robin() {
        let gsl = TopologySnapshot::new();
        let a = partition(&shells(), 0, &gsl, vec!["h0".into(), "h1".into()]).unwrap();
        assert_eq!(a.machine_of(NodeId::sat(0, 2, 3)), Some(MachineId(0)));
        assert_eq!(a.machine_of(NodeId::sat(1, 0, 0)), Some(MachineId(1)));
        assert_eq!(a.machine_of(NodeId::sat(2, 1, 1)), Some(MachineId(0)));
        assert_eq!(a.machine_of(NodeId::sat(0, 3, 0)), None);
        assert_eq!(a.local_nodes(MachineId(1)).len(), 6);
        for (placement, shell) in a.shells.iter().zip(shells()) {
            assert_eq!(placement.grid(), shell.grid());
        }
    }

    #[test]
    fn test_ground_station_follows_nearest_bound_satellite() {
        let mut gsl = TopologySnapshot::new();
        gsl.insert(Link::new(100, NodeId::Ground(0), NodeId::sat(1, 0, 0), 4.0)).unwrap();
        gsl.insert(Link::new(101, NodeId::Ground(0), NodeId::sat(0, 0, 0), 6.0)).unwrap();
        let a = partition(&shells(), 2, &gsl, vec!["h0".into(), "h1".into()]).unwrap();
        assert_eq!(a.ground, vec![MachineId(1), MachineId(0)]);
    }

    #[test]
    fn test_manifest_round_trip() {
        let mut gsl = TopologySnapshot::new();
        gsl.insert(Link::new(100, NodeId::Ground(1), NodeId::sat(1, 0, 0), 4.0)).unwrap();
        let a = partition(&shells(), 2, &gsl, vec!["10.0.0.1".into(), "10.0.0.2".into()]).unwrap();
        let text = a.to_manifest();
        assert_eq!(
            text,
            "0 1\n3 s1\n0 0 0 0\n2 s2\n1 1 1\n2 s3\n0 0\n\n10.0.0.1\n10.0.0.2\n"
        );
        assert_eq!(Assignment::parse_manifest(&text).unwrap(), a);
    }

    #[test]
    fn test_manifest_without_ground_stations() {
        let a = partition(&shells()[..1], 0, &TopologySnapshot::new(), vec!["h".into()]).unwrap();
        let parsed = Assignment::parse_manifest(&a.to_manifest()).unwrap();
        assert!(parsed.ground.is_empty());
        assert_eq!(parsed.shells.len(), 1);
    }

    #[test]
    fn test_manifest_errors() {
        assert!(matches!(
            Assignment::parse_manifest("0\n2 s\n0 x\n\nh\n"),
            Err(ManifestError::Malformed { line: 3, .. })
        ));
        assert!(matches!(
            Assignment::parse_manifest("0\n2 s\n0 1\n\nh\n"),
            Err(ManifestError::UnknownMachine(1))
        ));
        assert!(Assignment::parse_manifest("0\n2 s\n0 0\n").is_err());
    }

    #[test]
    fn test_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assign.txt");
        let a = partition(&shells(), 1, &TopologySnapshot::new(), vec!["h".into()]).unwrap();
        a.save(&path).unwrap();
        assert_eq!(Assignment::load(&path).unwrap(), a);
        assert!(Assignment::load(&dir.path().join("missing.txt")).is_err());
    }
}
