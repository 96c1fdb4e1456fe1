//! Emulation runner: ties preparation, the fleet and the scheduler together.

use skymesh_core::{MemoryBackend, PositionProvider};
use skymesh_env::{EmulationContext, MachineId, RemoteChannel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EmulationConfig;
use crate::error::RunError;
use crate::fleet::{LocalAgent, MachineAgent, RemoteAgent};
use crate::prepare::Prepared;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::summary::RunSummary;

/// Where each machine keeps its work dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkDirs {
    /// The `Dir` of each machine's config entry
    #[default]
    Configured,

    /// `<run_dir>/machine-<m>`, for fleets that share one host
    RunDir,
}

/// A prepared emulation, ready to run against some fleet.
pub struct Emulation {
    config: EmulationConfig,
    prepared: Prepared,
}

impl Emulation {
    /// Builds the timeline and writes every run file.
    pub fn prepare(config: EmulationConfig, provider: &dyn PositionProvider) -> Result<Self, RunError> {
        config.validate()?;
        let prepared = Prepared::build(&config, provider)?;
        prepared.write(&config)?;
        Ok(Self { config, prepared })
    }

    pub fn config(&self) -> &EmulationConfig {
        &self.config
    }

    pub fn prepared(&self) -> &Prepared {
        &self.prepared
    }

    fn machines(&self) -> impl Iterator<Item = MachineId> {
        (0..self.prepared.assignment.machine_count() as u32).map(MachineId)
    }

    fn work_dir(&self, machine: MachineId, dirs: WorkDirs) -> PathBuf {
        match dirs {
            WorkDirs::Configured => self.config.machines[machine.index()].dir.clone(),
            WorkDirs::RunDir => self.prepared.run_dir.join(format!("machine-{}", machine)),
        }
    }

    /// Agents reached through `channel`, one per machine.
    pub fn remote_agents<C: RemoteChannel>(&self, channel: Arc<C>, dirs: WorkDirs) -> Vec<Arc<RemoteAgent<C>>> {
        self.machines()
            .map(|m| {
                Arc::new(
                    RemoteAgent::new(m, Arc::clone(&channel), &self.config.agent_bin, self.work_dir(m, dirs))
                        .with_uploads(self.prepared.uploads(m)),
                )
            })
            .collect()
    }

    /// Runs the emulation on real machines.
    pub async fn run_remote<C, Ctx>(&self, channel: Arc<C>, dirs: WorkDirs, ctx: Arc<Ctx>) -> Result<RunSummary, RunError>
    where
        C: RemoteChannel,
        Ctx: EmulationContext + 'static,
    {
        let agents = self.remote_agents(channel, dirs);
        self.run_with(agents, ctx).await
    }

    /// Runs the emulation in-process, every machine backed by an in-memory
    /// link table.
    pub async fn run_in_memory<Ctx>(&self, ctx: Arc<Ctx>) -> Result<RunSummary, RunError>
    where
        Ctx: EmulationContext + 'static,
    {
        let mut agents = Vec::new();
        for machine in self.machines() {
            let names = self
                .prepared
                .assignment
                .local_nodes(machine)
                .into_iter()
                .map(|n| n.to_string());
            let backend = Arc::new(MemoryBackend::with_namespaces(names));
            let work_dir = self.prepared.stage_local(machine)?;
            agents.push(Arc::new(LocalAgent::open(work_dir, backend).await?));
        }
        self.run_with(agents, ctx).await
    }

    async fn run_with<A, Ctx>(&self, agents: Vec<Arc<A>>, ctx: Arc<Ctx>) -> Result<RunSummary, RunError>
    where
        A: MachineAgent,
        Ctx: EmulationContext + 'static,
    {
        info!(
            "starting run: {} steps of {}s, seed {}",
            self.config.steps(),
            self.config.step_interval_s,
            ctx.seed()
        );
        let mut scheduler = Scheduler::new(
            ctx,
            agents,
            Arc::clone(&self.prepared.assignment),
            SchedulerConfig::from_config(&self.config),
            self.prepared.run_dir.clone(),
        )?
        .with_events(self.config.events.iter().cloned());

        let summary = scheduler.run().await;
        if summary.is_healthy() {
            info!("✓ run complete: {} steps in {}ms", summary.completed_steps, summary.wall_time_ms);
        } else {
            warn!(
                "run complete with {} missed acknowledgements and {} link failures",
                summary.missed_acks.len(),
                summary.link_failures.len()
            );
        }
        Ok(summary)
    }
}

/// Removes every emulated node from every configured machine.
///
/// Returns the machines that could not be cleaned.
pub async fn clean<C: RemoteChannel>(config: &EmulationConfig, channel: Arc<C>, dirs: WorkDirs) -> Vec<MachineId> {
    let mut failed = Vec::new();
    for (m, machine) in config.machines.iter().enumerate() {
        let id = MachineId(m as u32);
        let work_dir = match dirs {
            WorkDirs::Configured => machine.dir.clone(),
            WorkDirs::RunDir => config.run_dir.join(format!("machine-{}", id)),
        };
        let agent = RemoteAgent::new(id, Arc::clone(&channel), &config.agent_bin, work_dir);
        match agent.clean().await {
            Ok(()) => info!("✓ machine {} cleaned", id),
            Err(e) => {
                warn!("machine {} not cleaned: {}", id, e);
                failed.push(id);
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VirtualContext;
    use crate::events::Event;
    use crate::oracle::WalkerOracle;
    use crate::prepare::tests::small_config;
    use async_trait::async_trait;
    use skymesh_core::{ApplyReport, NodeId};
    use skymesh_env::EnvError;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_dry_run_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path()).with_event(
            1,
            Event::RouteTable {
                node: NodeId::Ground(0),
            },
        );
        let emulation = Emulation::prepare(config, &WalkerOracle::new()).unwrap();

        let summary = emulation.run_in_memory(VirtualContext::shared(1)).await.unwrap();
        assert!(summary.is_healthy());
        assert_eq!(summary.completed_steps, 3);
        assert!(summary.added > 0);
        assert!(dir.path().join("route-GS1_1.txt").exists());
    }

    #[test]
    fn test_prepare_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path()).with_timing(0, 30);
        assert!(matches!(
            Emulation::prepare(config, &WalkerOracle::new()),
            Err(RunError::Config(_))
        ));
    }

    /// Channel that records commands per machine and acknowledges with an
    /// empty report.
    #[derive(Default)]
    struct RecordingChannel {
        commands: StdMutex<Vec<(MachineId, Vec<String>)>>,
        down: Option<MachineId>,
    }

    #[async_trait]
    impl RemoteChannel for RecordingChannel {
        async fn exec(&self, machine: MachineId, command: &[String]) -> Result<String, EnvError> {
            if self.down == Some(machine) {
                return Err(EnvError::MachineUnreachable(machine));
            }
            self.commands.lock().unwrap().push((machine, command.to_vec()));
            Ok(format!("{}\n", serde_json::to_string(&ApplyReport::default()).unwrap()))
        }

        async fn upload(&self, _machine: MachineId, _local: &Path, _remote: &Path) -> Result<(), EnvError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_run_drives_every_machine() {
        let dir = tempfile::tempdir().unwrap();
        let emulation = Emulation::prepare(small_config(dir.path()), &WalkerOracle::new()).unwrap();
        let channel = Arc::new(RecordingChannel::default());

        let summary = emulation
            .run_remote(Arc::clone(&channel), WorkDirs::RunDir, VirtualContext::shared(0))
            .await
            .unwrap();
        assert!(summary.is_healthy());

        let commands = channel.commands.lock().unwrap().clone();
        for m in 0..2 {
            let steps: Vec<&str> = commands
                .iter()
                .filter(|(machine, argv)| machine.0 == m && argv[3] == "networks")
                .map(|(_, argv)| argv[4].as_str())
                .collect();
            assert_eq!(steps, vec!["0", "1", "2", "3"]);
        }
        let work_dir = dir.path().join("machine-1").display().to_string();
        assert!(commands.iter().any(|(m, argv)| m.0 == 1 && argv[2] == work_dir));
    }

    #[tokio::test]
    async fn test_clean_reports_unreachable_machines() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let channel = Arc::new(RecordingChannel {
            down: Some(MachineId(1)),
            ..Default::default()
        });
        let failed = clean(&config, channel, WorkDirs::Configured).await;
        assert_eq!(failed, vec![MachineId(1)]);
    }
}
