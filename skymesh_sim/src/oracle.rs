//! Ground truth positions for simulation.
//!
//! The oracle propagates an ideal Walker-delta constellation: circular
//! orbits, evenly spaced planes and slots, and a rotating Earth underneath.
//! It stands in for a full propagator, which is plugged in through the same
//! `PositionProvider` trait.

use nalgebra::{Rotation3, Vector3};
use skymesh_core::geometry::{PositionProvider, EARTH_RADIUS_KM};
use skymesh_core::{Lla, Shell, TopologyError};
use std::f64::consts::PI;

/// Earth gravitational parameter (km^3/s^2).
pub const MU_EARTH: f64 = 398_600.441_8;

/// Earth rotation rate (rad/s).
pub const EARTH_ROTATION_RAD_S: f64 = 7.292_115_9e-5;

/// Circular Walker-delta propagator.
#[derive(Debug, Clone)]
pub struct WalkerOracle {
    /// Earth rotation rate; zero keeps longitudes in the inertial frame
    rotation_rad_s: f64,
}

impl Default for WalkerOracle {
    fn default() -> Self {
        Self {
            rotation_rad_s: EARTH_ROTATION_RAD_S,
        }
    }
}

impl WalkerOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables Earth rotation.
    pub fn inertial(mut self) -> Self {
        self.rotation_rad_s = 0.0;
        self
    }

    /// Orbital period of a shell (s).
    pub fn period_s(shell: &Shell) -> f64 {
        let a = EARTH_RADIUS_KM + shell.altitude_km;
        2.0 * PI * (a.powi(3) / MU_EARTH).sqrt()
    }

    /// Inertial position of one satellite at `t` seconds.
    pub fn eci(shell: &Shell, orbit: u32, slot: u32, t: f64) -> Vector3<f64> {
        let a = EARTH_RADIUS_KM + shell.altitude_km;
        let n = (MU_EARTH / a.powi(3)).sqrt();
        let (planes, per_plane) = (shell.orbit_count as f64, shell.sats_per_orbit as f64);

        let raan = 2.0 * PI * orbit as f64 / planes;
        let phase = 2.0 * PI * slot as f64 / per_plane
            + 2.0 * PI * shell.phase_shift as f64 * orbit as f64 / (planes * per_plane);
        let u = phase + n * t;

        let in_plane = Vector3::new(a * u.cos(), a * u.sin(), 0.0);
        let incline = Rotation3::from_axis_angle(&Vector3::x_axis(), shell.inclination_deg.to_radians());
        let node = Rotation3::from_axis_angle(&Vector3::z_axis(), raan);
        node * incline * in_plane
    }

    fn lla(&self, shell: &Shell, orbit: u32, slot: u32, t: f64) -> Lla {
        let r = Self::eci(shell, orbit, slot, t);
        let lat = (r.z / r.norm()).asin().to_degrees();
        let lon = (r.y.atan2(r.x) - self.rotation_rad_s * t).to_degrees();
        let lon = (lon + 180.0).rem_euclid(360.0) - 180.0;
        Lla::new(lat, lon, shell.altitude_km)
    }
}

impl PositionProvider for WalkerOracle {
    fn positions(&self, shell: &Shell, sample_times: &[f64]) -> Result<Vec<Vec<Lla>>, TopologyError> {
        shell.validate()?;
        let mut out = Vec::with_capacity(shell.satellite_count());
        for orbit in 0..shell.orbit_count {
            for slot in 0..shell.sats_per_orbit {
                out.push(
                    sample_times
                        .iter()
                        .map(|&t| self.lla(shell, orbit, slot, t))
                        .collect(),
                );
            }
        }
        Ok(out)
    }
}
