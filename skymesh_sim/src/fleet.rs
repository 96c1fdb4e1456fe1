//! Machine agent handles.
//!
//! The coordinator talks to every machine through [`MachineAgent`]. In
//! production each call is one `skymesh-agent` invocation over the remote
//! channel; in tests and dry runs the agent runs in-process on top of an
//! in-memory link backend.
//!
//! ```text
//! Scheduler ──► MachineAgent ──┬─► RemoteAgent ── ssh ──► skymesh-agent --dir <work> networks 7
//!                              └─► LocalAgent ──────────► AgentRuntime<MemoryBackend>
//! ```

use async_trait::async_trait;
use skymesh_core::backend::IfAddr;
use skymesh_core::{diagnostics, AgentRuntime, ApplyReport, LinkBackend, NodeId};
use skymesh_env::{MachineId, RemoteChannel};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RunError;

/// A diagnostic run on one machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Ping { src: NodeId, dst: Ipv4Addr },
    Perf { src: NodeId, dst: Ipv4Addr },
    PerfServer { node: NodeId },
    RouteTable { node: NodeId },
    /// Route every prefix of `dst_addrs` out of `src` through interface `via`
    NextHop {
        src: NodeId,
        via: NodeId,
        dst_addrs: Vec<IfAddr>,
    },
    Addresses { node: NodeId },
    Utility,
}

impl Diagnostic {
    /// Agent command line arguments.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Ping { src, dst } => vec!["ping".into(), src.to_string(), dst.to_string()],
            Self::Perf { src, dst } => vec!["iperf".into(), src.to_string(), dst.to_string()],
            Self::PerfServer { node } => vec!["iperf-server".into(), node.to_string()],
            Self::RouteTable { node } => vec!["rtable".into(), node.to_string()],
            Self::NextHop { src, via, dst_addrs } => {
                let mut argv = vec!["sr".into(), src.to_string(), via.to_string()];
                argv.extend(dst_addrs.iter().map(IfAddr::to_string));
                argv
            }
            Self::Addresses { node } => vec!["ip".into(), node.to_string()],
            Self::Utility => vec!["utility".into()],
        }
    }
}

/// The coordinator's handle on one machine.
#[async_trait]
pub trait MachineAgent: Send + Sync + 'static {
    fn machine(&self) -> MachineId;

    /// Creates the machine's nodes, applies step 0 and starts routing.
    async fn bootstrap(&self) -> Result<ApplyReport, RunError>;

    /// Applies the diffs of `step`.
    async fn apply_step(&self, step: usize) -> Result<ApplyReport, RunError>;

    /// Damages the given nodes of this machine.
    async fn damage(&self, nodes: &[NodeId]) -> Result<ApplyReport, RunError>;

    /// Recovers every damaged node of this machine.
    async fn recover(&self) -> Result<ApplyReport, RunError>;

    /// Runs a diagnostic and returns its raw output.
    async fn diagnose(&self, diagnostic: &Diagnostic) -> Result<String, RunError>;

    /// Removes every node of this machine.
    async fn clean(&self) -> Result<(), RunError>;
}

/// Agent reached through a [`RemoteChannel`].
pub struct RemoteAgent<C: RemoteChannel> {
    machine: MachineId,
    channel: Arc<C>,
    agent_bin: String,
    work_dir: PathBuf,

    /// `(local file, path relative to the work dir)` shipped at bootstrap
    uploads: Vec<(PathBuf, PathBuf)>,
}

impl<C: RemoteChannel> RemoteAgent<C> {
    pub fn new(machine: MachineId, channel: Arc<C>, agent_bin: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            machine,
            channel,
            agent_bin: agent_bin.into(),
            work_dir: work_dir.into(),
            uploads: Vec::new(),
        }
    }

    pub fn with_uploads(mut self, uploads: Vec<(PathBuf, PathBuf)>) -> Self {
        self.uploads = uploads;
        self
    }

    /// Full command line of an agent invocation.
    pub fn command(&self, args: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.agent_bin.clone(),
            "--dir".to_string(),
            self.work_dir.display().to_string(),
        ];
        argv.extend(args.iter().cloned());
        argv
    }

    async fn exec(&self, args: &[String]) -> Result<String, RunError> {
        let argv = self.command(args);
        debug!("machine {}: {}", self.machine, argv.join(" "));
        Ok(self.channel.exec(self.machine, &argv).await?)
    }

    /// Runs a command whose last stdout line is an [`ApplyReport`].
    async fn exec_report(&self, args: &[String]) -> Result<ApplyReport, RunError> {
        let output = self.exec(args).await?;
        parse_report(&output).ok_or_else(|| RunError::Protocol {
            machine: self.machine,
            output: output.trim().to_string(),
        })
    }
}

/// Parses the report an agent prints as its last line.
pub fn parse_report(output: &str) -> Option<ApplyReport> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line).ok()
}

#[async_trait]
impl<C: RemoteChannel> MachineAgent for RemoteAgent<C> {
    fn machine(&self) -> MachineId {
        self.machine
    }

    async fn bootstrap(&self) -> Result<ApplyReport, RunError> {
        for (local, relative) in &self.uploads {
            self.channel
                .upload(self.machine, local, &self.work_dir.join(relative))
                .await?;
        }
        info!("machine {}: uploaded {} files", self.machine, self.uploads.len());

        self.exec(&["nodes".to_string()]).await?;
        let report = self.exec_report(&["networks".to_string(), "0".to_string()]).await?;
        self.exec(&["routed".to_string()]).await?;
        Ok(report)
    }

    async fn apply_step(&self, step: usize) -> Result<ApplyReport, RunError> {
        self.exec_report(&["networks".to_string(), step.to_string()])
            .await
    }

    async fn damage(&self, nodes: &[NodeId]) -> Result<ApplyReport, RunError> {
        let mut args = vec!["damage".to_string()];
        args.extend(nodes.iter().map(NodeId::to_string));
        self.exec_report(&args).await
    }

    async fn recover(&self) -> Result<ApplyReport, RunError> {
        self.exec_report(&["recovery".to_string()]).await
    }

    async fn diagnose(&self, diagnostic: &Diagnostic) -> Result<String, RunError> {
        self.exec(&diagnostic.argv()).await
    }

    async fn clean(&self) -> Result<(), RunError> {
        self.exec(&["clean".to_string()]).await.map(|_| ())
    }
}

/// Agent running in this process.
pub struct LocalAgent<B: LinkBackend> {
    machine: MachineId,
    runtime: Mutex<AgentRuntime<B>>,
}

impl<B: LinkBackend> LocalAgent<B> {
    pub fn new(runtime: AgentRuntime<B>) -> Self {
        Self {
            machine: runtime.machine(),
            runtime: Mutex::new(runtime),
        }
    }

    /// Opens the runtime of a prepared work dir.
    pub async fn open(work_dir: impl Into<PathBuf>, backend: Arc<B>) -> Result<Self, RunError> {
        Ok(Self::new(AgentRuntime::open(work_dir, backend).await?))
    }

    pub async fn backend(&self) -> Arc<B> {
        Arc::clone(self.runtime.lock().await.backend())
    }
}

#[async_trait]
impl<B: LinkBackend> MachineAgent for LocalAgent<B> {
    fn machine(&self) -> MachineId {
        self.machine
    }

    async fn bootstrap(&self) -> Result<ApplyReport, RunError> {
        self.apply_step(0).await
    }

    async fn apply_step(&self, step: usize) -> Result<ApplyReport, RunError> {
        Ok(self.runtime.lock().await.apply_step(step).await?)
    }

    async fn damage(&self, nodes: &[NodeId]) -> Result<ApplyReport, RunError> {
        Ok(self.runtime.lock().await.damage(nodes).await?)
    }

    async fn recover(&self) -> Result<ApplyReport, RunError> {
        Ok(self.runtime.lock().await.recover().await?)
    }

    async fn diagnose(&self, diagnostic: &Diagnostic) -> Result<String, RunError> {
        let backend = self.backend().await;
        let backend = backend.as_ref();
        let output = match diagnostic {
            Diagnostic::Ping { src, dst } => diagnostics::ping(backend, &src.to_string(), *dst).await,
            Diagnostic::Perf { src, dst } => {
                diagnostics::iperf_client(backend, &src.to_string(), *dst).await
            }
            Diagnostic::PerfServer { node } => diagnostics::iperf_server(backend, &node.to_string()).await,
            Diagnostic::RouteTable { node } => diagnostics::route_table(backend, &node.to_string()).await,
            Diagnostic::NextHop { src, via, dst_addrs } => {
                let addrs: Vec<(String, IfAddr)> =
                    dst_addrs.iter().map(|a| (String::new(), *a)).collect();
                diagnostics::set_next_hop(backend, &src.to_string(), &addrs, &via.to_string())
                    .await
                    .map(|prefixes| prefixes.join("\n"))
            }
            Diagnostic::Addresses { node } => {
                diagnostics::address_listing(backend, &node.to_string()).await
            }
            Diagnostic::Utility => diagnostics::utility_snapshot().await,
        };
        Ok(output.map_err(skymesh_core::AgentError::from)?)
    }

    async fn clean(&self) -> Result<(), RunError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skymesh_env::EnvError;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Channel answering every command with a canned reply.
    #[derive(Default)]
    struct ScriptedChannel {
        reply: String,
        unreachable: bool,
        commands: StdMutex<Vec<Vec<String>>>,
        uploads: StdMutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl RemoteChannel for ScriptedChannel {
        async fn exec(&self, machine: MachineId, command: &[String]) -> Result<String, EnvError> {
            self.commands.lock().unwrap().push(command.to_vec());
            if self.unreachable {
                return Err(EnvError::MachineUnreachable(machine));
            }
            Ok(self.reply.clone())
        }

        async fn upload(&self, _machine: MachineId, _local: &Path, remote: &Path) -> Result<(), EnvError> {
            self.uploads.lock().unwrap().push(remote.to_path_buf());
            Ok(())
        }
    }

    fn report_line() -> String {
        let report = ApplyReport {
            added: 3,
            ..Default::default()
        };
        format!("some log line\n{}\n", serde_json::to_string(&report).unwrap())
    }

    #[test]
    fn test_diagnostic_argv() {
        let sr = Diagnostic::NextHop {
            src: NodeId::sat(0, 0, 0),
            via: NodeId::sat(0, 0, 1),
            dst_addrs: vec!["9.0.1.40/24".parse().unwrap()],
        };
        assert_eq!(sr.argv(), vec!["sr", "SH1O1S1", "SH1O1S2", "9.0.1.40/24"]);
        let ping = Diagnostic::Ping {
            src: NodeId::Ground(0),
            dst: Ipv4Addr::new(10, 0, 0, 40),
        };
        assert_eq!(ping.argv(), vec!["ping", "GS1", "10.0.0.40"]);
    }

    #[test]
    fn test_parse_report_takes_last_line() {
        assert_eq!(parse_report(&report_line()).unwrap().added, 3);
        assert!(parse_report("not json\n").is_none());
        assert!(parse_report("").is_none());
    }

    #[tokio::test]
    async fn test_remote_agent_commands() {
        let channel = Arc::new(ScriptedChannel {
            reply: report_line(),
            ..Default::default()
        });
        let agent = RemoteAgent::new(MachineId(1), Arc::clone(&channel), "skymesh-agent", "/srv/sky")
            .with_uploads(vec![(PathBuf::from("/tmp/run/assign.txt"), PathBuf::from("assign.txt"))]);

        let report = agent.bootstrap().await.unwrap();
        assert_eq!(report.added, 3);
        agent.apply_step(4).await.unwrap();
        agent.damage(&[NodeId::sat(0, 1, 1)]).await.unwrap();

        let commands = channel.commands.lock().unwrap().clone();
        assert_eq!(commands[0], vec!["skymesh-agent", "--dir", "/srv/sky", "nodes"]);
        assert_eq!(commands[1][3..], ["networks", "0"]);
        assert_eq!(commands[2][3..], ["routed"]);
        assert_eq!(commands[3][3..], ["networks", "4"]);
        assert_eq!(commands[4][3..], ["damage", "SH1O2S2"]);
        assert_eq!(
            channel.uploads.lock().unwrap()[0],
            PathBuf::from("/srv/sky/assign.txt")
        );
    }

    #[tokio::test]
    async fn test_remote_agent_errors() {
        let garbled = RemoteAgent::new(
            MachineId(0),
            Arc::new(ScriptedChannel {
                reply: "Segmentation fault".into(),
                ..Default::default()
            }),
            "skymesh-agent",
            "/w",
        );
        assert!(matches!(garbled.apply_step(1).await, Err(RunError::Protocol { .. })));

        let gone = RemoteAgent::new(
            MachineId(2),
            Arc::new(ScriptedChannel {
                unreachable: true,
                ..Default::default()
            }),
            "skymesh-agent",
            "/w",
        );
        let err = gone.apply_step(1).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
