//! Constellation data model: shells, ground stations, nodes and links.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TopologyError;

/// One orbital layer: a regular `orbit_count x sats_per_orbit` grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shell {
    /// Name used for diff directories and the manifest (no whitespace)
    pub name: String,

    /// Orbit altitude above the Earth surface (km)
    pub altitude_km: f64,

    /// Orbit inclination (degrees)
    pub inclination_deg: f64,

    /// Walker phase factor between adjacent orbits
    #[serde(default)]
    pub phase_shift: u32,

    /// Number of orbital planes
    pub orbit_count: u32,

    /// Satellites per orbital plane
    pub sats_per_orbit: u32,
}

impl Shell {
    /// Creates a shell.
    pub fn new(
        name: impl Into<String>,
        altitude_km: f64,
        inclination_deg: f64,
        orbit_count: u32,
        sats_per_orbit: u32,
    ) -> Self {
        Self {
            name: name.into(),
            altitude_km,
            inclination_deg,
            phase_shift: 0,
            orbit_count,
            sats_per_orbit,
        }
    }

    /// Sets the Walker phase factor.
    pub fn with_phase_shift(mut self, phase_shift: u32) -> Self {
        self.phase_shift = phase_shift;
        self
    }

    /// Total satellites in this shell.
    pub fn satellite_count(&self) -> usize {
        self.orbit_count as usize * self.sats_per_orbit as usize
    }

    /// `(orbits, satellites per orbit)`
    pub fn grid(&self) -> (u32, u32) {
        (self.orbit_count, self.sats_per_orbit)
    }

    /// Flat position of `(orbit, slot)` in orbit-major order.
    pub fn flat_index(&self, orbit: u32, slot: u32) -> usize {
        orbit as usize * self.sats_per_orbit as usize + slot as usize
    }

    /// Validates parameters that every later stage relies on.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(TopologyError::shell(
                &self.name,
                "name must be non-empty without whitespace",
            ));
        }
        if self.orbit_count == 0 || self.sats_per_orbit == 0 {
            return Err(TopologyError::shell(&self.name, "empty satellite grid"));
        }
        if !(self.altitude_km > 0.0) {
            return Err(TopologyError::shell(&self.name, "altitude must be positive"));
        }
        if !(0.0..=180.0).contains(&self.inclination_deg) {
            return Err(TopologyError::shell(
                &self.name,
                "inclination must be within [0, 180]",
            ));
        }
        Ok(())
    }
}

/// A fixed ground station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundStation {
    /// Dense id, also the position in the ground-station list
    pub id: u32,

    /// Latitude (degrees)
    pub latitude_deg: f64,

    /// Longitude (degrees)
    pub longitude_deg: f64,

    /// Altitude above the surface (km)
    #[serde(default)]
    pub altitude_km: f64,
}

impl GroundStation {
    /// Creates a ground station at sea level.
    pub fn new(id: u32, latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            id,
            latitude_deg,
            longitude_deg,
            altitude_km: 0.0,
        }
    }

    /// Geodetic position.
    pub fn lla(&self) -> Lla {
        Lla::new(self.latitude_deg, self.longitude_deg, self.altitude_km)
    }

    /// Validates coordinates.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if !(-90.0..=90.0).contains(&self.latitude_deg)
            || !(-180.0..=180.0).contains(&self.longitude_deg)
        {
            return Err(TopologyError::InvalidGroundStation {
                id: self.id,
                reason: format!(
                    "coordinates ({}, {}) out of range",
                    self.latitude_deg, self.longitude_deg
                ),
            });
        }
        Ok(())
    }
}

/// Geodetic position: latitude, longitude (degrees), altitude (km).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Lla {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_km: f64,
}

impl Lla {
    pub fn new(lat_deg: f64, lon_deg: f64, alt_km: f64) -> Self {
        Self {
            lat_deg,
            lon_deg,
            alt_km,
        }
    }
}

/// Identity of one satellite: `(shell, orbit, slot)`, all zero-based.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SatId {
    pub shell: u32,
    pub orbit: u32,
    pub slot: u32,
}

impl SatId {
    pub fn new(shell: u32, orbit: u32, slot: u32) -> Self {
        Self { shell, orbit, slot }
    }
}

/// The unit of placement and addressing.
///
/// Satellites order before ground stations, which is also the order nodes
/// are listed in registry files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum NodeId {
    Satellite(SatId),
    Ground(u32),
}

impl NodeId {
    pub fn sat(shell: u32, orbit: u32, slot: u32) -> Self {
        Self::Satellite(SatId::new(shell, orbit, slot))
    }

    pub fn is_ground(&self) -> bool {
        matches!(self, Self::Ground(_))
    }

    pub fn as_sat(&self) -> Option<SatId> {
        match self {
            Self::Satellite(sat) => Some(*sat),
            Self::Ground(_) => None,
        }
    }
}

impl From<SatId> for NodeId {
    fn from(sat: SatId) -> Self {
        Self::Satellite(sat)
    }
}

/// Node names are `SH{shell}O{orbit}S{slot}` and `GS{id}`, one-based.
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satellite(s) => write!(f, "SH{}O{}S{}", s.shell + 1, s.orbit + 1, s.slot + 1),
            Self::Ground(gid) => write!(f, "GS{}", gid + 1),
        }
    }
}

/// Error for an unparseable node name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid node name: {0}")]
pub struct NodeNameError(pub String);

impl FromStr for NodeId {
    type Err = NodeNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || NodeNameError(s.to_string());
        let one_based = |digits: &str| -> Result<u32, NodeNameError> {
            match digits.parse::<u32>() {
                Ok(n) if n >= 1 => Ok(n - 1),
                _ => Err(bad()),
            }
        };

        if let Some(rest) = s.strip_prefix("GS") {
            return Ok(Self::Ground(one_based(rest)?));
        }
        let rest = s.strip_prefix("SH").ok_or_else(bad)?;
        let (shell, rest) = rest.split_once('O').ok_or_else(bad)?;
        let (orbit, slot) = rest.split_once('S').ok_or_else(bad)?;
        Ok(Self::sat(one_based(shell)?, one_based(orbit)?, one_based(slot)?))
    }
}

/// The two link classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// Satellite to satellite
    Isl,
    /// Ground station to satellite
    Gsl,
}

/// One link at one instant.
///
/// `index` is the persistent identity: the same endpoint pair carries the
/// same index for the whole run. For GSLs `a` is the ground station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub index: u32,
    pub a: NodeId,
    pub b: NodeId,
    pub delay_ms: f64,
}

impl Link {
    pub fn new(index: u32, a: NodeId, b: NodeId, delay_ms: f64) -> Self {
        Self {
            index,
            a,
            b,
            delay_ms,
        }
    }

    pub fn kind(&self) -> LinkKind {
        if self.a.is_ground() || self.b.is_ground() {
            LinkKind::Gsl
        } else {
            LinkKind::Isl
        }
    }

    /// True if both links join the same endpoints.
    pub fn same_endpoints(&self, other: &Link) -> bool {
        self.a == other.a && self.b == other.b
    }

    /// The endpoint opposite `node`, if `node` is an endpoint.
    pub fn peer_of(&self, node: NodeId) -> Option<NodeId> {
        if self.a == node {
            Some(self.b)
        } else if self.b == node {
            Some(self.a)
        } else {
            None
        }
    }
}
