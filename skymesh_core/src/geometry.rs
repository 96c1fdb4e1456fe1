//! Geodetic to Cartesian conversion and propagation delay.
//!
//! Everything here is a pure function of its inputs. Distances are computed
//! in a Cartesian, Earth-body-fixed frame (CBF) over a spherical Earth.

use nalgebra::Vector3;

use crate::error::TopologyError;
use crate::model::{Lla, Shell};

/// Mean Earth radius (km).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Speed of light in vacuum (km/s).
pub const SPEED_OF_LIGHT_KM_S: f64 = 299_792.458;

/// Effective signal speed (km/s), about 0.586 c.
///
/// The same constant is used for ISL and GSL delays.
pub const C_EFF_KM_S: f64 = 17.31 / 29.5 * SPEED_OF_LIGHT_KM_S;

/// Converts a geodetic position to the CBF frame (km).
pub fn to_cbf(lla: &Lla) -> Vector3<f64> {
    let r = EARTH_RADIUS_KM + lla.alt_km;
    let lat = lla.lat_deg.to_radians();
    let lon = lla.lon_deg.to_radians();
    Vector3::new(
        r * lat.cos() * lon.cos(),
        r * lat.cos() * lon.sin(),
        r * lat.sin(),
    )
}

/// Straight-line distance between two geodetic positions (km).
pub fn distance_km(a: &Lla, b: &Lla) -> f64 {
    (to_cbf(a) - to_cbf(b)).norm()
}

/// One-way propagation delay for a distance (ms).
pub fn delay_ms(distance_km: f64) -> f64 {
    distance_km / C_EFF_KM_S * 1000.0
}

/// Maximum slant range from a ground station to a satellite at
/// `altitude_km` seen at no less than `min_elevation_deg` (km).
pub fn max_slant_range_km(altitude_km: f64, min_elevation_deg: f64) -> f64 {
    let r = EARTH_RADIUS_KM;
    let r_sin = r * min_elevation_deg.to_radians().sin();
    -r_sin + (r_sin * r_sin + altitude_km * altitude_km + 2.0 * r * altitude_km).sqrt()
}

/// Source of satellite positions over the run.
///
/// Given a shell and the sample times (seconds from the run start), returns
/// one position sequence per satellite in orbit-major order; each sequence
/// has one entry per sample time.
pub trait PositionProvider: Send + Sync {
    fn positions(&self, shell: &Shell, sample_times: &[f64]) -> Result<Vec<Vec<Lla>>, TopologyError>;
}

/// Positions of every satellite of every shell at every step.
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    /// `[shell][flat satellite index][step]`
    shells: Vec<Vec<Vec<Lla>>>,
}

impl PositionTable {
    /// Samples `provider` for each shell and checks the returned shape.
    pub fn sample(
        provider: &dyn PositionProvider,
        shells: &[Shell],
        sample_times: &[f64],
    ) -> Result<Self, TopologyError> {
        let mut table = Vec::with_capacity(shells.len());
        for shell in shells {
            let positions = provider.positions(shell, sample_times)?;
            if positions.len() != shell.satellite_count() {
                return Err(TopologyError::Positions(format!(
                    "shell {} returned {} satellites, expected {}",
                    shell.name,
                    positions.len(),
                    shell.satellite_count()
                )));
            }
            if let Some(short) = positions.iter().find(|p| p.len() != sample_times.len()) {
                return Err(TopologyError::Positions(format!(
                    "shell {} returned {} samples, expected {}",
                    shell.name,
                    short.len(),
                    sample_times.len()
                )));
            }
            table.push(positions);
        }
        Ok(Self { shells: table })
    }

    /// Builds a table from precomputed positions.
    pub fn from_raw(shells: Vec<Vec<Vec<Lla>>>) -> Self {
        Self { shells }
    }

    /// Position of one satellite at one step.
    pub fn get(&self, shell: u32, flat: usize, step: usize) -> Option<&Lla> {
        self.shells.get(shell as usize)?.get(flat)?.get(step)
    }
}
