//! Run preparation: positions -> timeline -> diff files, manifest and
//! per-machine agent settings, all under the run directory.
//!
//! ```text
//! <run_dir>/
//! ├── assign.txt          manifest, shipped to every machine
//! ├── agent-<m>.json      settings of machine m (agent.json remotely)
//! ├── bird.conf
//! ├── <shell>/<t>.txt     ISL diffs, t = 0..=steps
//! ├── GS-<n>/<t>.txt      GSL diffs
//! └── machine-<m>/        staged work dir of an in-process agent
//! ```

use skymesh_core::diff_file::{gsl_path, isl_path, write_step};
use skymesh_core::nodes::{manifest_path, MANIFEST_FILE};
use skymesh_core::routing::BIRD_CONF_FILE;
use skymesh_core::runtime::SETTINGS_FILE;
use skymesh_core::{
    partition, AgentSettings, Assignment, PositionProvider, PositionTable, Timeline, TopologySnapshot,
};
use skymesh_env::MachineId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::EmulationConfig;
use crate::error::RunError;

/// Timeline and placement of a run, plus where its files live.
pub struct Prepared {
    pub timeline: Timeline,
    pub assignment: Arc<Assignment>,
    pub run_dir: PathBuf,
}

impl Prepared {
    /// Samples positions, builds every snapshot and partitions the nodes.
    pub fn build(config: &EmulationConfig, provider: &dyn PositionProvider) -> Result<Self, RunError> {
        let shells = config.shells();
        let ground = config.ground_stations();
        let times = config.sample_times();

        let positions = PositionTable::sample(provider, &shells, &times)?;
        let timeline = Timeline::build(
            shells.clone(),
            ground,
            positions,
            times.len(),
            &config.topology_config(),
        )?;

        let empty = TopologySnapshot::new();
        let gsl_t0 = timeline.gsl_snapshot(0).unwrap_or(&empty);
        let assignment = partition(
            &shells,
            timeline.ground_stations().len(),
            gsl_t0,
            config.machine_addresses(),
        )?;
        info!(
            "✓ timeline: {} satellites, {} ground stations, {} steps over {} machines",
            timeline.total_satellites(),
            timeline.ground_stations().len(),
            config.steps(),
            assignment.machine_count()
        );

        Ok(Self {
            timeline,
            assignment: Arc::new(assignment),
            run_dir: config.run_dir.clone(),
        })
    }

    /// Writes manifest, diffs, settings and routing config.
    pub fn write(&self, config: &EmulationConfig) -> Result<(), RunError> {
        std::fs::create_dir_all(&self.run_dir)?;
        self.assignment.save(&manifest_path(&self.run_dir))?;
        for t in 0..self.timeline.steps() {
            write_step(&self.run_dir, &self.timeline, t)?;
        }
        for m in 0..self.assignment.machine_count() {
            let settings = AgentSettings::default()
                .with_machine(MachineId(m as u32))
                .with_links(config.orchestrator_config())
                .with_ospf(config.ospf_config());
            std::fs::write(self.settings_path(MachineId(m as u32)), settings.to_json()?)?;
        }
        std::fs::write(self.run_dir.join(BIRD_CONF_FILE), config.ospf_config().render())?;
        info!("✓ run files written to {}", self.run_dir.display());
        Ok(())
    }

    pub fn settings_path(&self, machine: MachineId) -> PathBuf {
        self.run_dir.join(format!("agent-{}.json", machine))
    }

    /// Files machine `machine` needs: `(local path, path in its work dir)`.
    ///
    /// Only the ISL diffs of shells the machine hosts satellites of are
    /// included.
    pub fn uploads(&self, machine: MachineId) -> Vec<(PathBuf, PathBuf)> {
        let rel = Path::new("");
        let mut files = vec![
            (manifest_path(&self.run_dir), PathBuf::from(MANIFEST_FILE)),
            (self.settings_path(machine), PathBuf::from(SETTINGS_FILE)),
            (self.run_dir.join(BIRD_CONF_FILE), PathBuf::from(BIRD_CONF_FILE)),
        ];
        let steps = self.timeline.steps();
        for shell in &self.assignment.shells {
            if !shell.slots.contains(&machine) {
                continue;
            }
            for t in 0..steps {
                files.push((
                    isl_path(&self.run_dir, &shell.name, t),
                    isl_path(rel, &shell.name, t),
                ));
            }
        }
        let ground = self.assignment.ground.len();
        if ground > 0 {
            for t in 0..steps {
                files.push((gsl_path(&self.run_dir, ground, t), gsl_path(rel, ground, t)));
            }
        }
        files
    }

    /// Copies a machine's files into `<run_dir>/machine-<m>/` for an
    /// in-process agent and returns that directory.
    pub fn stage_local(&self, machine: MachineId) -> Result<PathBuf, RunError> {
        let dir = self.run_dir.join(format!("machine-{}", machine));
        for (local, relative) in self.uploads(machine) {
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(local, target)?;
        }
        Ok(dir)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GroundStationConfig, MachineConfig, ShellConfig};
    use crate::oracle::WalkerOracle;
    use skymesh_core::NodeId;

    pub(crate) fn small_config(run_dir: &Path) -> EmulationConfig {
        EmulationConfig::default()
            .with_shell(ShellConfig::new(550.0, 53.0, 4, 4).with_phase_shift(1))
            .with_shell(ShellConfig::new(1100.0, 70.0, 3, 3).with_name("upper"))
            .with_ground_station(GroundStationConfig::new(50.11, 8.68))
            .with_machines(vec![MachineConfig::new("10.0.0.1"), MachineConfig::new("10.0.0.2")])
            .with_timing(10, 30)
            .with_run_dir(run_dir)
    }

    #[test]
    fn test_build_samples_initial_plus_steps() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let prepared = Prepared::build(&config, &WalkerOracle::new()).unwrap();

        assert_eq!(prepared.timeline.steps(), config.steps() + 1);
        assert_eq!(prepared.assignment.machine_of(NodeId::sat(0, 3, 3)), Some(MachineId(0)));
        assert_eq!(prepared.assignment.machine_of(NodeId::sat(1, 2, 2)), Some(MachineId(1)));
    }

    #[test]
    fn test_write_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let prepared = Prepared::build(&config, &WalkerOracle::new()).unwrap();
        prepared.write(&config).unwrap();

        let manifest = Assignment::load(&manifest_path(dir.path())).unwrap();
        assert_eq!(&manifest, prepared.assignment.as_ref());
        assert!(isl_path(dir.path(), "upper", 3).exists());
        assert!(dir.path().join("bird.conf").exists());

        let settings: AgentSettings =
            serde_json::from_str(&std::fs::read_to_string(prepared.settings_path(MachineId(1))).unwrap()).unwrap();
        assert_eq!(settings.machine, MachineId(1));
        assert_eq!(settings.links, config.orchestrator_config());

        // machine 0 hosts shell1 only: 3 fixed files + 4 ISL + 4 GSL diffs
        let uploads = prepared.uploads(MachineId(0));
        assert_eq!(uploads.len(), 3 + 4 + 4);
        assert!(uploads.iter().all(|(local, _)| local.exists()));
        assert!(uploads.iter().any(|(_, rel)| rel == Path::new("shell1/2.txt")));
        assert!(!uploads.iter().any(|(_, rel)| rel.starts_with("upper")));

        let staged = prepared.stage_local(MachineId(0)).unwrap();
        assert!(staged.join(SETTINGS_FILE).exists());
        assert!(staged.join("GS-1").join("3.txt").exists());
    }
}
