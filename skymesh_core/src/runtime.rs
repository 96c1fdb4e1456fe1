//! Agent Runtime - one machine's view of the emulation.
//!
//! Ties the engines to an agent's work directory. Every agent invocation is
//! one-shot: it opens the runtime from the files the coordinator shipped,
//! performs one command, persists what must survive and exits.
//!
//! # Work directory
//!
//! ```text
//! <work_dir>/
//! ├── assign.txt            manifest (Assignment)
//! ├── agent.json            AgentSettings
//! ├── container_pid.txt     node registry
//! ├── damage_list.txt       damaged local nodes
//! ├── bird.conf
//! ├── <shell>/<step>.txt    ISL diffs
//! └── GS-<n>/<step>.txt     GSL diffs
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use skymesh_core::runtime::AgentRuntime;
//! use skymesh_core::iproute::IpRouteBackend;
//!
//! let runtime = AgentRuntime::open(work_dir, Arc::new(IpRouteBackend::new())).await?;
//! let report = runtime.apply_step(3).await?;
//! ```

use serde::{Deserialize, Serialize};
use skymesh_env::MachineId;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::backend::LinkBackend;
use crate::delta::Delta;
use crate::diagnostics;
use crate::diff_file::{gsl_path, isl_path, parse_gsl, parse_isl};
use crate::error::AgentError;
use crate::model::NodeId;
use crate::nodes::{damage_path, load_damage, manifest_path, save_damage};
use crate::orchestrator::{ApplyReport, LinkOrchestrator, OrchestratorConfig};
use crate::partition::Assignment;
use crate::routing::OspfConfig;

/// Settings file name inside an agent's work dir.
pub const SETTINGS_FILE: &str = "agent.json";

/// Per-machine settings written by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// This machine's id in the manifest
    pub machine: MachineId,

    /// Link parameters and worker bound
    pub links: OrchestratorConfig,

    /// Routing daemon
    pub ospf: OspfConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            machine: MachineId(0),
            links: OrchestratorConfig::default(),
            ospf: OspfConfig::default(),
        }
    }
}

impl AgentSettings {
    pub fn with_machine(mut self, machine: MachineId) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_links(mut self, links: OrchestratorConfig) -> Self {
        self.links = links;
        self
    }

    pub fn with_ospf(mut self, ospf: OspfConfig) -> Self {
        self.ospf = ospf;
        self
    }

    /// Reads `agent.json`; a missing file yields the defaults.
    pub async fn load(dir: &Path) -> Result<Self, AgentError> {
        match tokio::fs::read_to_string(dir.join(SETTINGS_FILE)).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn save(&self, dir: &Path) -> Result<(), AgentError> {
        tokio::fs::write(dir.join(SETTINGS_FILE), self.to_json()?).await?;
        Ok(())
    }
}

/// One machine's agent.
///
/// Generic over the link backend, allowing the same agent code to drive
/// real namespaces or an in-memory model.
pub struct AgentRuntime<B: LinkBackend> {
    work_dir: PathBuf,
    settings: AgentSettings,
    assignment: Arc<Assignment>,
    orchestrator: LinkOrchestrator<B>,
}

impl<B: LinkBackend> AgentRuntime<B> {
    /// Opens the runtime from a work directory.
    pub async fn open(work_dir: impl Into<PathBuf>, backend: Arc<B>) -> Result<Self, AgentError> {
        let work_dir = work_dir.into();
        let settings = AgentSettings::load(&work_dir).await?;
        let manifest = tokio::fs::read_to_string(manifest_path(&work_dir)).await?;
        let assignment = Arc::new(Assignment::parse_manifest(&manifest)?);
        let damaged = load_damage(&damage_path(&work_dir)).await?;

        let orchestrator = LinkOrchestrator::new(
            settings.machine,
            Arc::clone(&assignment),
            backend,
            settings.links.clone(),
        )
        .with_damaged(damaged);

        Ok(Self {
            work_dir,
            settings,
            assignment,
            orchestrator,
        })
    }

    pub fn machine(&self) -> MachineId {
        self.settings.machine
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn assignment(&self) -> &Arc<Assignment> {
        &self.assignment
    }

    pub fn orchestrator(&self) -> &LinkOrchestrator<B> {
        &self.orchestrator
    }

    pub fn backend(&self) -> &Arc<B> {
        self.orchestrator.backend()
    }

    /// Nodes hosted on this machine.
    pub fn local_nodes(&self) -> Vec<NodeId> {
        self.assignment.local_nodes(self.machine())
    }

    /// Reads the diffs of `step` that concern this machine: the ISL file of
    /// every shell it hosts satellites of, plus the GSL file.
    pub async fn load_step(&self, step: usize) -> Result<Delta, AgentError> {
        let mut delta = Delta::default();
        for (i, shell) in self.assignment.shells.iter().enumerate() {
            if !shell.slots.contains(&self.machine()) {
                continue;
            }
            let path = isl_path(&self.work_dir, &shell.name, step);
            let text = tokio::fs::read_to_string(&path).await?;
            let part = parse_isl(&text, i as u32, shell.grid()).map_err(|source| AgentError::Diff {
                path: path.display().to_string(),
                source,
            })?;
            delta.extend(part);
        }

        let ground = self.assignment.ground.len();
        if ground > 0 {
            let path = gsl_path(&self.work_dir, ground, step);
            let text = tokio::fs::read_to_string(&path).await?;
            let part = parse_gsl(&text, ground).map_err(|source| AgentError::Diff {
                path: path.display().to_string(),
                source,
            })?;
            delta.extend(part);
        }
        Ok(delta)
    }

    /// Applies the diffs of `step`. Step 0 creates every link.
    pub async fn apply_step(&self, step: usize) -> Result<ApplyReport, AgentError> {
        let delta = self.load_step(step).await?;
        let report = self.orchestrator.apply(&delta).await;
        info!(
            "machine {} step {}: -{} ~{} +{} ({} failed)",
            self.machine(),
            step,
            report.deleted,
            report.updated,
            report.added,
            report.failures.len()
        );
        Ok(report)
    }

    /// Damages local nodes and persists the damage set.
    pub async fn damage(&mut self, nodes: &[NodeId]) -> Result<ApplyReport, AgentError> {
        let report = self.orchestrator.damage(nodes).await;
        save_damage(&damage_path(&self.work_dir), self.orchestrator.damaged()).await?;
        Ok(report)
    }

    /// Recovers every damaged local node and clears the damage set.
    pub async fn recover(&mut self) -> Result<ApplyReport, AgentError> {
        let report = self.orchestrator.recover().await;
        save_damage(&damage_path(&self.work_dir), self.orchestrator.damaged()).await?;
        Ok(report)
    }

    /// Address of local node `node` as seen from `from`.
    pub async fn address_of(&self, node: NodeId, from: &str) -> Result<Option<Ipv4Addr>, AgentError> {
        let addrs = diagnostics::addresses(self.backend().as_ref(), &node.to_string()).await?;
        Ok(diagnostics::pick_address(&addrs, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::diff_file::write_step;
    use crate::model::{GroundStation, Shell};
    use crate::orchestrator::{LinkParams, DAMAGED_LOSS_PCT};
    use crate::partition::partition;
    use crate::topology::tests::timeline;
    use crate::topology::TopologyConfig;
    use approx::assert_relative_eq;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        expected_t0: usize,
    }

    fn fixture() -> Fixture {
        let shell = Shell::new("shellA", 550.0, 53.0, 3, 3);
        let ground = vec![GroundStation::new(0, -20.0, -60.0)];
        let tl = timeline(vec![shell.clone()], ground, 3, &TopologyConfig::default());
        let gsl_t0 = tl.gsl_snapshot(0).unwrap();
        let assignment = partition(&[shell], 1, gsl_t0, vec!["127.0.0.1".into()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        assignment.save(&manifest_path(dir.path())).unwrap();
        for t in 0..3 {
            write_step(dir.path(), &tl, t).unwrap();
        }
        let names: Vec<String> = assignment.nodes().map(|n| n.to_string()).collect();
        let expected_t0 = tl.isl_delta(0, 0).unwrap().added.len() + tl.gsl_delta(0).unwrap().added.len();
        Fixture {
            dir,
            backend: Arc::new(MemoryBackend::with_namespaces(names)),
            expected_t0,
        }
    }

    #[tokio::test]
    async fn test_settings_default_when_missing_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AgentSettings::load(dir.path()).await.unwrap(), AgentSettings::default());

        let settings = AgentSettings::default()
            .with_machine(MachineId(2))
            .with_links(OrchestratorConfig::default().with_gsl(LinkParams::new(1.0, 3.0)));
        settings.save(dir.path()).await.unwrap();
        assert_eq!(AgentSettings::load(dir.path()).await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_apply_steps_from_diff_files() {
        let fx = fixture();
        let runtime = AgentRuntime::open(fx.dir.path(), Arc::clone(&fx.backend)).await.unwrap();
        assert_eq!(runtime.local_nodes().len(), 10);

        let report = runtime.apply_step(0).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.added, fx.expected_t0);

        for t in 1..3 {
            let report = runtime.apply_step(t).await.unwrap();
            assert!(report.is_clean(), "step {} failed: {:?}", t, report.failures);
        }
        assert!(runtime.apply_step(7).await.is_err());
    }

    #[tokio::test]
    async fn test_damage_survives_reopen() {
        let fx = fixture();
        let victim = NodeId::sat(0, 0, 0);
        {
            let mut runtime = AgentRuntime::open(fx.dir.path(), Arc::clone(&fx.backend)).await.unwrap();
            runtime.apply_step(0).await.unwrap();
            runtime.damage(&[victim]).await.unwrap();
        }

        let mut runtime = AgentRuntime::open(fx.dir.path(), Arc::clone(&fx.backend)).await.unwrap();
        assert!(runtime.orchestrator().damaged().contains(&victim));
        let iface = fx.backend.interface_names("SH1O1S1")[0].clone();
        let shaping = fx.backend.interface("SH1O1S1", &iface).unwrap().shaping.unwrap();
        assert_relative_eq!(shaping.loss_pct, DAMAGED_LOSS_PCT);

        runtime.recover().await.unwrap();
        assert!(!damage_path(fx.dir.path()).exists());
        let shaping = fx.backend.interface("SH1O1S1", &iface).unwrap().shaping.unwrap();
        assert!(shaping.loss_pct < DAMAGED_LOSS_PCT);
    }
}
