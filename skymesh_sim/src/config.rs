//! Emulation configuration, read from the constellation JSON file.
//!
//! Keys follow the established configuration format, so existing files load
//! unchanged:
//!
//! ```json
//! {
//!   "Name": "starlink",
//!   "Satellite link": "Grid",
//!   "Link policy": "LeastDelay",
//!   "update_time (s)": 1,
//!   "Duration (s)": 60,
//!   "satellite link bandwidth (\"X\" Gbps)": 5,
//!   "sat-ground bandwidth (\"X\" Gbps)": 2,
//!   "satellite link loss (\"X\"% )": 0,
//!   "sat-ground loss (\"X\"% )": 1,
//!   "antenna number": 1,
//!   "antenna elevation angle": 25,
//!   "Machines": [{"IP": "10.0.0.1", "username": "root", "dir": "/root/skymesh"}],
//!   "Shells": [{"Altitude (km)": 550, "Inclination": 53, "Phase shift": 1,
//!               "Orbits": 5, "Satellites per orbit": 5}],
//!   "Ground stations": [{"Latitude": 50.11, "Longitude": 8.68}]
//! }
//! ```

use serde::{Deserialize, Serialize};
use skymesh_core::orchestrator::{LinkParams, OrchestratorConfig};
use skymesh_core::routing::OspfConfig;
use skymesh_core::{GroundStation, GslStyle, IslStyle, NodeId, Shell, TopologyConfig};
use skymesh_env::SshHost;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::events::{Event, ScheduledEvent};

/// One shell of the constellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Directory and manifest name; `shell{n}` when absent
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "Altitude (km)")]
    pub altitude_km: f64,

    /// Degrees
    #[serde(rename = "Inclination")]
    pub inclination_deg: f64,

    #[serde(rename = "Phase shift", default)]
    pub phase_shift: u32,

    #[serde(rename = "Orbits")]
    pub orbits: u32,

    #[serde(rename = "Satellites per orbit")]
    pub sats_per_orbit: u32,
}

impl ShellConfig {
    pub fn new(altitude_km: f64, inclination_deg: f64, orbits: u32, sats_per_orbit: u32) -> Self {
        Self {
            name: None,
            altitude_km,
            inclination_deg,
            phase_shift: 0,
            orbits,
            sats_per_orbit,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_phase_shift(mut self, phase_shift: u32) -> Self {
        self.phase_shift = phase_shift;
        self
    }

    fn to_shell(&self, idx: usize) -> Shell {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("shell{}", idx + 1));
        Shell::new(
            name,
            self.altitude_km,
            self.inclination_deg,
            self.orbits,
            self.sats_per_orbit,
        )
        .with_phase_shift(self.phase_shift)
    }
}

/// A ground station; its id is its position in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundStationConfig {
    #[serde(rename = "Latitude")]
    pub latitude_deg: f64,

    #[serde(rename = "Longitude")]
    pub longitude_deg: f64,
}

impl GroundStationConfig {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }
}

/// A machine of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Address other machines terminate tunnels on, also the ssh target
    #[serde(rename = "IP")]
    pub address: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    /// Agent work directory on the machine
    #[serde(default = "default_work_dir")]
    pub dir: PathBuf,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/skymesh")
}

impl MachineConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: default_ssh_port(),
            username: default_username(),
            dir: default_work_dir(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn ssh_host(&self) -> SshHost {
        let mut host = SshHost::new(&self.address);
        host.user = self.username.clone();
        host.port = self.port;
        host
    }
}

/// GSL selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkPolicy {
    #[default]
    #[serde(rename = "LeastDelay", alias = "least_delay")]
    LeastDelay,
}

/// Where events of a step sit relative to that step's link update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrdering {
    /// Events due at `t` run before the delta of `t + 1` is applied, so they
    /// observe the topology of step `t`.
    #[default]
    DispatchBeforeApply,

    /// The delta of `t + 1` is applied first; events due at `t + 1` then
    /// observe the topology they are scheduled against.
    ApplyBeforeDispatch,
}

/// Everything the coordinator needs for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationConfig {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Satellite link", default)]
    pub isl_style: IslStyle,

    /// Only `IPv4` addressing is supported
    #[serde(rename = "IP version", default = "default_ip_version")]
    pub ip_version: String,

    #[serde(rename = "Link policy", default)]
    pub link_policy: LinkPolicy,

    /// Seconds per step
    #[serde(rename = "update_time (s)", default = "default_step_interval")]
    pub step_interval_s: u64,

    #[serde(rename = "Duration (s)")]
    pub duration_s: u64,

    #[serde(rename = "satellite link bandwidth (\"X\" Gbps)", default = "default_bandwidth")]
    pub isl_bandwidth_gbit: f64,

    #[serde(rename = "sat-ground bandwidth (\"X\" Gbps)", default = "default_bandwidth")]
    pub gsl_bandwidth_gbit: f64,

    #[serde(rename = "satellite link loss (\"X\"% )", default)]
    pub isl_loss_pct: f64,

    #[serde(rename = "sat-ground loss (\"X\"% )", default)]
    pub gsl_loss_pct: f64,

    /// Satellites each ground station binds to
    #[serde(rename = "antenna number", default = "default_antennas")]
    pub antennas: usize,

    /// Degrees
    #[serde(rename = "antenna elevation angle", default = "default_elevation")]
    pub min_elevation_deg: f64,

    #[serde(rename = "Machines")]
    pub machines: Vec<MachineConfig>,

    #[serde(rename = "Shells")]
    pub shells: Vec<ShellConfig>,

    #[serde(rename = "Ground stations", default)]
    pub ground_stations: Vec<GroundStationConfig>,

    /// OSPF hello interval (s)
    #[serde(rename = "hello_interval (s)", default = "default_hello")]
    pub hello_interval_s: u32,

    #[serde(rename = "Event ordering", default)]
    pub ordering: EventOrdering,

    /// Per-step acknowledgement timeout; 0 waits forever
    #[serde(rename = "Step timeout (ms)", default)]
    pub step_timeout_ms: u64,

    /// Seed of the damage selection
    #[serde(rename = "Seed", default)]
    pub seed: u64,

    /// Concurrent link operations per agent
    #[serde(rename = "Max parallel", default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Agent executable on every machine
    #[serde(rename = "Agent binary", default = "default_agent_bin")]
    pub agent_bin: String,

    /// Coordinator-side directory for diffs, manifests and diagnostics
    #[serde(rename = "Run directory", default = "default_run_dir")]
    pub run_dir: PathBuf,

    #[serde(rename = "Events", default)]
    pub events: Vec<ScheduledEvent>,
}

fn default_ip_version() -> String {
    "IPv4".to_string()
}

fn default_step_interval() -> u64 {
    1
}

fn default_bandwidth() -> f64 {
    10.0
}

fn default_antennas() -> usize {
    1
}

fn default_elevation() -> f64 {
    25.0
}

fn default_hello() -> u32 {
    1
}

fn default_max_parallel() -> usize {
    64
}

fn default_agent_bin() -> String {
    "skymesh-agent".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./skymesh-run")
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            name: "skymesh".to_string(),
            isl_style: IslStyle::Grid,
            ip_version: default_ip_version(),
            link_policy: LinkPolicy::LeastDelay,
            step_interval_s: default_step_interval(),
            duration_s: 60,
            isl_bandwidth_gbit: default_bandwidth(),
            gsl_bandwidth_gbit: default_bandwidth(),
            isl_loss_pct: 0.0,
            gsl_loss_pct: 0.0,
            antennas: default_antennas(),
            min_elevation_deg: default_elevation(),
            machines: vec![MachineConfig::new("127.0.0.1")],
            shells: Vec::new(),
            ground_stations: Vec::new(),
            hello_interval_s: default_hello(),
            ordering: EventOrdering::default(),
            step_timeout_ms: 0,
            seed: 0,
            max_parallel: default_max_parallel(),
            agent_bin: default_agent_bin(),
            run_dir: default_run_dir(),
            events: Vec::new(),
        }
    }
}

impl EmulationConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses and validates a configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shells.push(shell);
        self
    }

    pub fn with_ground_station(mut self, gs: GroundStationConfig) -> Self {
        self.ground_stations.push(gs);
        self
    }

    pub fn with_machines(mut self, machines: Vec<MachineConfig>) -> Self {
        self.machines = machines;
        self
    }

    pub fn with_timing(mut self, step_interval_s: u64, duration_s: u64) -> Self {
        self.step_interval_s = step_interval_s;
        self.duration_s = duration_s;
        self
    }

    pub fn with_isl(mut self, bandwidth_gbit: f64, loss_pct: f64) -> Self {
        self.isl_bandwidth_gbit = bandwidth_gbit;
        self.isl_loss_pct = loss_pct;
        self
    }

    pub fn with_gsl(mut self, bandwidth_gbit: f64, loss_pct: f64) -> Self {
        self.gsl_bandwidth_gbit = bandwidth_gbit;
        self.gsl_loss_pct = loss_pct;
        self
    }

    pub fn with_event(mut self, step: usize, event: Event) -> Self {
        self.events.push(ScheduledEvent::new(step, event));
        self
    }

    pub fn with_ordering(mut self, ordering: EventOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_step_timeout(mut self, ms: u64) -> Self {
        self.step_timeout_ms = ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Checks everything that would otherwise fail after nodes exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ip_version.eq_ignore_ascii_case("ipv4") {
            return Err(ConfigError::invalid(format!(
                "IP version {} is not supported",
                self.ip_version
            )));
        }
        if self.step_interval_s == 0 {
            return Err(ConfigError::invalid("update_time must be positive"));
        }
        if self.duration_s < self.step_interval_s {
            return Err(ConfigError::invalid("duration is shorter than one step"));
        }
        if self.machines.is_empty() {
            return Err(ConfigError::invalid("no machines configured"));
        }
        if self.shells.is_empty() {
            return Err(ConfigError::invalid("no shells configured"));
        }
        if self.antennas == 0 {
            return Err(ConfigError::invalid("antenna number must be at least 1"));
        }
        if !(0.0..90.0).contains(&self.min_elevation_deg) {
            return Err(ConfigError::invalid("antenna elevation angle must be within [0, 90)"));
        }
        for (what, bw, loss) in [
            ("satellite link", self.isl_bandwidth_gbit, self.isl_loss_pct),
            ("sat-ground", self.gsl_bandwidth_gbit, self.gsl_loss_pct),
        ] {
            if !(bw > 0.0) {
                return Err(ConfigError::invalid(format!("{} bandwidth must be positive", what)));
            }
            if !(0.0..=100.0).contains(&loss) {
                return Err(ConfigError::invalid(format!("{} loss must be within [0, 100]", what)));
            }
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::invalid("max parallel must be at least 1"));
        }

        let shells = self.shells();
        let mut names = HashSet::new();
        for shell in &shells {
            shell.validate().map_err(|e| ConfigError::invalid(e.to_string()))?;
            if !names.insert(shell.name.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate shell name {}", shell.name)));
            }
        }
        for gs in self.ground_stations() {
            gs.validate().map_err(|e| ConfigError::invalid(e.to_string()))?;
        }

        for scheduled in &self.events {
            if let Event::Damage { ratio } = scheduled.event {
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(ConfigError::invalid(format!(
                        "damage ratio {} at step {} is outside [0, 1]",
                        ratio, scheduled.step
                    )));
                }
            }
            for node in scheduled.event.nodes() {
                if !self.has_node(node) {
                    return Err(ConfigError::invalid(format!(
                        "{} event at step {} names unknown node {}",
                        scheduled.event.name(),
                        scheduled.step,
                        node
                    )));
                }
            }
        }
        Ok(())
    }

    fn has_node(&self, node: NodeId) -> bool {
        match node {
            NodeId::Ground(gid) => (gid as usize) < self.ground_stations.len(),
            NodeId::Satellite(sat) => self
                .shells
                .get(sat.shell as usize)
                .is_some_and(|s| sat.orbit < s.orbits && sat.slot < s.sats_per_orbit),
        }
    }

    pub fn shells(&self) -> Vec<Shell> {
        self.shells
            .iter()
            .enumerate()
            .map(|(i, s)| s.to_shell(i))
            .collect()
    }

    pub fn ground_stations(&self) -> Vec<GroundStation> {
        self.ground_stations
            .iter()
            .enumerate()
            .map(|(i, g)| GroundStation::new(i as u32, g.latitude_deg, g.longitude_deg))
            .collect()
    }

    pub fn total_satellites(&self) -> usize {
        self.shells
            .iter()
            .map(|s| s.orbits as usize * s.sats_per_orbit as usize)
            .sum()
    }

    pub fn topology_config(&self) -> TopologyConfig {
        let LinkPolicy::LeastDelay = self.link_policy;
        TopologyConfig {
            isl_style: self.isl_style,
            gsl_style: GslStyle::LeastDelay {
                antennas: self.antennas,
            },
            min_elevation_deg: self.min_elevation_deg,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_isl(LinkParams::new(self.isl_bandwidth_gbit, self.isl_loss_pct))
            .with_gsl(LinkParams::new(self.gsl_bandwidth_gbit, self.gsl_loss_pct))
            .with_max_parallel(self.max_parallel)
    }

    pub fn ospf_config(&self) -> OspfConfig {
        OspfConfig::default().with_hello_interval(self.hello_interval_s)
    }

    /// Number of steps after the initial one.
    pub fn steps(&self) -> usize {
        (self.duration_s / self.step_interval_s) as usize
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_secs(self.step_interval_s)
    }

    /// Sample times of every snapshot, initial one included.
    pub fn sample_times(&self) -> Vec<f64> {
        (0..=self.steps())
            .map(|k| (k as u64 * self.step_interval_s) as f64)
            .collect()
    }

    pub fn machine_addresses(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.address.clone()).collect()
    }

    pub fn ssh_hosts(&self) -> Vec<SshHost> {
        self.machines.iter().map(MachineConfig::ssh_host).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "Name": "starlink",
        "Satellite link": "Grid",
        "IP version": "IPv4",
        "Link policy": "LeastDelay",
        "update_time (s)": 1,
        "Duration (s)": 20,
        "satellite link bandwidth (\"X\" Gbps)": 5,
        "sat-ground bandwidth (\"X\" Gbps)": 2,
        "satellite link loss (\"X\"% )": 0,
        "sat-ground loss (\"X\"% )": 1,
        "antenna number": 1,
        "antenna elevation angle": 25,
        "Machines": [{"IP": "10.0.0.1"}, {"IP": "10.0.0.2", "username": "emu", "dir": "/srv/sky"}],
        "Shells": [
            {"Altitude (km)": 550, "Inclination": 53, "Phase shift": 1, "Orbits": 5, "Satellites per orbit": 5}
        ],
        "Ground stations": [{"Latitude": 50.11, "Longitude": 8.68}, {"Latitude": 46.63, "Longitude": 14.31}],
        "Events": [
            {"step": 5, "type": "damage", "ratio": 0.3},
            {"step": 10, "type": "recovery"},
            {"step": 3, "type": "ping", "src": "SH1O3S3", "dst": "GS2"}
        ]
    }"#;

    #[test]
    fn test_sample_config_loads() {
        let config = EmulationConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.name, "starlink");
        assert_eq!(config.steps(), 20);
        assert_eq!(config.sample_times().len(), 21);
        assert_eq!(config.total_satellites(), 25);
        assert_eq!(config.shells()[0].name, "shell1");
        assert_eq!(config.shells()[0].phase_shift, 1);
        assert_eq!(config.ground_stations()[1].id, 1);
        assert_eq!(config.ordering, EventOrdering::DispatchBeforeApply);
        assert_eq!(config.events.len(), 3);

        let hosts = config.ssh_hosts();
        assert_eq!(hosts[1].user, "emu");
        assert_eq!(config.machines[0].dir, PathBuf::from("/tmp/skymesh"));

        let links = config.orchestrator_config();
        assert_eq!(links.gsl, LinkParams::new(2.0, 1.0));
        assert_eq!(
            config.topology_config().gsl_style,
            GslStyle::LeastDelay { antennas: 1 }
        );
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let base = EmulationConfig::from_json(SAMPLE).unwrap();

        let mut c = base.clone();
        c.machines.clear();
        assert!(c.validate().is_err());

        let c = base.clone().with_timing(0, 10);
        assert!(c.validate().is_err());

        let c = base.clone().with_shell(ShellConfig::new(550.0, 53.0, 1, 4).with_name("shell1"));
        assert!(c.validate().is_err(), "duplicate shell name");

        let c = base.clone().with_event(2, Event::Damage { ratio: 1.5 });
        assert!(c.validate().is_err());

        let c = base.clone().with_event(
            2,
            Event::RouteTable {
                node: NodeId::sat(0, 5, 0),
            },
        );
        assert!(c.validate().is_err(), "orbit out of range");

        let c = base.with_gsl(2.0, 120.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_builder_defaults_validate() {
        let config = EmulationConfig::default()
            .with_shell(ShellConfig::new(550.0, 53.0, 4, 4))
            .with_timing(2, 9);
        config.validate().unwrap();
        assert_eq!(config.steps(), 4);
        assert_eq!(config.sample_times(), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }
}
