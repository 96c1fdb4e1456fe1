//! Real-time event scheduler.
//!
//! Drives the fleet through the run in lock-step with the clock:
//!
//! ```text
//! for t in 0..steps:
//!     ┌─────────────────────────────────────────────┐
//!     │ dispatch events due at t                    │  faults inline,
//!     │   damage / recovery ──► owning machines     │  diagnostics detached
//!     │   ping / perf / rtable / sr / utility ──► ⟳ │
//!     ├─────────────────────────────────────────────┤
//!     │ apply delta t+1 on every machine (barrier)  │
//!     ├─────────────────────────────────────────────┤
//!     │ sleep(interval - elapsed) or log overrun    │
//!     └─────────────────────────────────────────────┘
//! join every detached diagnostic
//! ```
//!
//! Time comes from an [`EmulationContext`], so tests run whole schedules on a
//! virtual clock.

use skymesh_core::{diagnostics, ApplyReport, Assignment, NodeId};
use skymesh_env::{EmulationContext, MachineId};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{EmulationConfig, EventOrdering};
use crate::error::RunError;
use crate::events::{Event, EventQueue, ScheduledEvent};
use crate::fault::{by_machine, FaultInjector};
use crate::fleet::{Diagnostic, MachineAgent};
use crate::summary::{DiagnosticRecord, FaultRecord, Overrun, RunSummary};

/// Timing and ordering of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Steps after the initial one
    pub steps: usize,

    pub step_interval: Duration,

    pub ordering: EventOrdering,

    /// Acknowledgement timeout per machine and step
    pub step_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            steps: 0,
            step_interval: Duration::from_secs(1),
            ordering: EventOrdering::default(),
            step_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &EmulationConfig) -> Self {
        Self {
            steps: config.steps(),
            step_interval: config.step_interval(),
            ordering: config.ordering,
            step_timeout: (config.step_timeout_ms > 0)
                .then(|| Duration::from_millis(config.step_timeout_ms)),
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    pub fn with_ordering(mut self, ordering: EventOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// The coordinator's control loop.
pub struct Scheduler<Ctx: EmulationContext, A: MachineAgent> {
    ctx: Arc<Ctx>,

    /// Indexed by machine id
    agents: Arc<Vec<Arc<A>>>,

    assignment: Arc<Assignment>,
    config: SchedulerConfig,
    queue: EventQueue,
    faults: FaultInjector,

    /// Where diagnostic outputs are written
    output_dir: PathBuf,
}

impl<Ctx: EmulationContext, A: MachineAgent> Scheduler<Ctx, A> {
    /// Creates a scheduler. `agents[m]` must be the agent of machine `m`.
    pub fn new(
        ctx: Arc<Ctx>,
        agents: Vec<Arc<A>>,
        assignment: Arc<Assignment>,
        config: SchedulerConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, RunError> {
        if let Some((m, _)) = agents
            .iter()
            .enumerate()
            .find(|(m, a)| a.machine().index() != *m)
        {
            return Err(RunError::UnknownMachine(MachineId(m as u32)));
        }
        if agents.len() < assignment.machine_count() {
            return Err(RunError::UnknownMachine(MachineId(agents.len() as u32)));
        }
        let faults = FaultInjector::for_assignment(&assignment, ctx.seed());
        Ok(Self {
            ctx,
            agents: Arc::new(agents),
            assignment,
            config,
            queue: EventQueue::new(),
            faults,
            output_dir: output_dir.into(),
        })
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = ScheduledEvent>) -> Self {
        for scheduled in events {
            self.queue.push(scheduled);
        }
        self
    }

    pub fn damaged(&self) -> &BTreeSet<NodeId> {
        self.faults.damaged()
    }

    /// Bootstraps every machine, then runs the loop.
    pub async fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::new(self.config.steps);
        self.bootstrap(&mut summary).await;
        self.run_loop(&mut summary).await;
        summary
    }

    /// Creates nodes and the step-0 links on every machine.
    pub async fn bootstrap(&self, summary: &mut RunSummary) {
        self.fan_out(0, summary, |agent| async move { agent.bootstrap().await })
            .await;
        info!(
            "✓ fleet bootstrapped: {} links on {} machines",
            summary.added,
            self.agents.len()
        );
    }

    /// Steps `1..=steps`, then joins outstanding diagnostics.
    pub async fn run_loop(&mut self, summary: &mut RunSummary) {
        let started = self.ctx.now();
        let interval = self.config.step_interval;
        let mut detached: JoinSet<DiagnosticRecord> = JoinSet::new();

        for t in 0..self.config.steps {
            let tick = self.ctx.now();
            match self.config.ordering {
                EventOrdering::DispatchBeforeApply => {
                    self.dispatch(t, summary, &mut detached).await;
                    self.apply(t + 1, summary).await;
                }
                EventOrdering::ApplyBeforeDispatch => {
                    self.apply(t + 1, summary).await;
                    self.dispatch(t + 1, summary, &mut detached).await;
                }
            }
            summary.completed_steps += 1;

            let elapsed = self.ctx.now().saturating_sub(tick);
            if elapsed > interval {
                warn!(
                    "step {} overran: {}ms of {}ms",
                    t + 1,
                    elapsed.as_millis(),
                    interval.as_millis()
                );
                summary.overruns.push(Overrun {
                    step: t + 1,
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_ms: interval.as_millis() as u64,
                });
            } else {
                self.ctx.sleep(interval - elapsed).await;
            }
            info!("t = {}/{} ({}ms)", t + 1, self.config.steps, elapsed.as_millis());
        }

        summary.events_skipped = self.queue.len();
        if summary.events_skipped > 0 {
            warn!(
                "{} events scheduled past step {} were not run",
                summary.events_skipped, self.config.steps
            );
        }

        if !detached.is_empty() {
            info!("waiting for {} diagnostics", detached.len());
        }
        while let Some(joined) = detached.join_next().await {
            match joined {
                Ok(record) => summary.diagnostics.push(record),
                Err(e) => warn!("diagnostic task failed: {}", e),
            }
        }
        summary.diagnostics.sort_by_key(|d| d.step);
        summary.wall_time_ms = self.ctx.now().saturating_sub(started).as_millis() as u64;
    }

    async fn apply(&self, step: usize, summary: &mut RunSummary) {
        self.fan_out(step, summary, move |agent| async move {
            agent.apply_step(step).await
        })
        .await;
    }

    /// Runs `call` on every machine concurrently and waits for all of them.
    /// Failures and timeouts are recorded as missed acknowledgements.
    async fn fan_out<F, Fut>(&self, step: usize, summary: &mut RunSummary, call: F)
    where
        F: Fn(Arc<A>) -> Fut,
        Fut: Future<Output = Result<ApplyReport, RunError>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();
        for agent in self.agents.iter() {
            let machine = agent.machine();
            pending.insert(machine);
            let call = call(Arc::clone(agent));
            let timeout = self.config.step_timeout;
            tasks.spawn(async move {
                let result = match timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or(Err(RunError::Timeout {
                            machine,
                            timeout_ms: limit.as_millis() as u64,
                        })),
                    None => call.await,
                };
                (machine, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((machine, result)) = joined else {
                continue;
            };
            pending.remove(&machine);
            match result {
                Ok(report) => {
                    debug!(
                        "machine {} step {}: -{} ~{} +{}",
                        machine, step, report.deleted, report.updated, report.added
                    );
                    for failure in &report.failures {
                        warn!(
                            "machine {} step {}: link {:?} on {}: {}",
                            machine, step, failure.index, failure.node, failure.error
                        );
                    }
                    summary.record_report(step, machine, report);
                }
                Err(e) => {
                    warn!("machine {} missed step {}: {}", machine, step, e);
                    summary.record_missed_ack(step, machine, &e);
                }
            }
        }

        for machine in pending {
            let e = RunError::Protocol {
                machine,
                output: "agent task aborted".to_string(),
            };
            warn!("machine {} missed step {}: {}", machine, step, e);
            summary.record_missed_ack(step, machine, &e);
        }
    }

    /// Fires every event due by `step`. Faults complete in place, in queue
    /// order; diagnostics are spawned into `detached`.
    async fn dispatch(
        &mut self,
        step: usize,
        summary: &mut RunSummary,
        detached: &mut JoinSet<DiagnosticRecord>,
    ) {
        for (due, event) in self.queue.pop_due(step) {
            debug!("step {}: {} (scheduled for {})", step, event.name(), due);
            match event {
                // Awaited here, not spawned.
                Event::Damage { ratio } => self.damage(step, ratio, summary).await,
                Event::Recovery => self.recover(step, summary).await,
                diagnostic => {
                    let agents = Arc::clone(&self.agents);
                    let assignment = Arc::clone(&self.assignment);
                    let output_dir = self.output_dir.clone();
                    detached.spawn(run_diagnostic(agents, assignment, output_dir, step, diagnostic));
                }
            }
        }
    }

    async fn damage(&mut self, step: usize, ratio: f64, summary: &mut RunSummary) {
        let victims = self.faults.damage(ratio);
        let mut record = FaultRecord {
            step,
            kind: "damage",
            nodes: victims.len(),
            failed_machines: Vec::new(),
        };
        for (machine, nodes) in by_machine(&victims, &self.assignment) {
            match self.agent(machine) {
                Ok(agent) => match agent.damage(&nodes).await {
                    Ok(report) => summary.record_report(step, machine, report),
                    Err(e) => {
                        warn!("damage on machine {} failed: {}", machine, e);
                        record.failed_machines.push(machine);
                    }
                },
                Err(e) => {
                    warn!("{}", e);
                    record.failed_machines.push(machine);
                }
            }
        }
        info!(
            "step {}: damaged {} satellites ({} total)",
            step,
            victims.len(),
            self.faults.damaged().len()
        );
        summary.faults.push(record);
    }

    async fn recover(&mut self, step: usize, summary: &mut RunSummary) {
        let restored = self.faults.recover();
        let mut record = FaultRecord {
            step,
            kind: "recovery",
            nodes: restored.len(),
            failed_machines: Vec::new(),
        };
        for agent in self.agents.iter() {
            match agent.recover().await {
                Ok(report) => summary.record_report(step, agent.machine(), report),
                Err(e) => {
                    warn!("recovery on machine {} failed: {}", agent.machine(), e);
                    record.failed_machines.push(agent.machine());
                }
            }
        }
        info!("step {}: recovered {} satellites", step, restored.len());
        summary.faults.push(record);
    }

    fn agent(&self, machine: MachineId) -> Result<&Arc<A>, RunError> {
        self.agents
            .get(machine.index())
            .ok_or(RunError::UnknownMachine(machine))
    }
}

fn agent_of<'a, A: MachineAgent>(
    agents: &'a [Arc<A>],
    assignment: &Assignment,
    node: NodeId,
) -> Result<&'a Arc<A>, RunError> {
    let machine = assignment
        .machine_of(node)
        .ok_or_else(|| RunError::NoAddress(node.to_string()))?;
    agents.get(machine.index()).ok_or(RunError::UnknownMachine(machine))
}

/// Address of `dst` as seen from `from`, looked up on `dst`'s machine.
async fn resolve<A: MachineAgent>(
    agents: &[Arc<A>],
    assignment: &Assignment,
    dst: NodeId,
    from: NodeId,
) -> Result<Ipv4Addr, RunError> {
    let listing = agent_of(agents, assignment, dst)?
        .diagnose(&Diagnostic::Addresses { node: dst })
        .await?;
    let addrs = diagnostics::parse_brief_addrs(&listing);
    diagnostics::pick_address(&addrs, &from.to_string())
        .ok_or_else(|| RunError::NoAddress(dst.to_string()))
}

/// Runs one diagnostic event; returns `(file name, contents)` to store.
async fn diagnose<A: MachineAgent>(
    agents: &[Arc<A>],
    assignment: &Assignment,
    step: usize,
    event: &Event,
) -> Result<Option<(String, String)>, RunError> {
    match *event {
        Event::RouteTable { node } => {
            let out = agent_of(agents, assignment, node)?
                .diagnose(&Diagnostic::RouteTable { node })
                .await?;
            Ok(Some((format!("route-{}_{}.txt", node, step), out)))
        }
        Event::Utility => {
            let mut out = String::new();
            for agent in agents {
                let snapshot = agent.diagnose(&Diagnostic::Utility).await?;
                out.push_str(&format!("machine {}:\n{}\n", agent.machine(), snapshot.trim_end()));
            }
            Ok(Some((format!("utility-info_{}.txt", step), out)))
        }
        Event::Ping { src, dst } => {
            let addr = resolve(agents, assignment, dst, src).await?;
            let out = agent_of(agents, assignment, src)?
                .diagnose(&Diagnostic::Ping { src, dst: addr })
                .await?;
            Ok(Some((format!("ping-{}-{}_{}.txt", src, dst, step), out)))
        }
        Event::Perf { src, dst } => {
            let addr = resolve(agents, assignment, dst, src).await?;
            agent_of(agents, assignment, dst)?
                .diagnose(&Diagnostic::PerfServer { node: dst })
                .await?;
            let out = agent_of(agents, assignment, src)?
                .diagnose(&Diagnostic::Perf { src, dst: addr })
                .await?;
            Ok(Some((format!("perf-{}-{}_{}.txt", src, dst, step), out)))
        }
        Event::NextHop { src, dst, via } => {
            let listing = agent_of(agents, assignment, dst)?
                .diagnose(&Diagnostic::Addresses { node: dst })
                .await?;
            let dst_addrs = diagnostics::parse_brief_addrs(&listing)
                .into_iter()
                .map(|(_, addr)| addr)
                .collect();
            let out = agent_of(agents, assignment, src)?
                .diagnose(&Diagnostic::NextHop { src, via, dst_addrs })
                .await?;
            info!("step {}: {} routes to {} via {}: {}", step, src, dst, via, out.replace('\n', " "));
            Ok(None)
        }
        Event::Damage { .. } | Event::Recovery => Ok(None),
    }
}

async fn run_diagnostic<A: MachineAgent>(
    agents: Arc<Vec<Arc<A>>>,
    assignment: Arc<Assignment>,
    output_dir: PathBuf,
    step: usize,
    event: Event,
) -> DiagnosticRecord {
    let kind = event.name();
    let outcome = match diagnose(&agents, &assignment, step, &event).await {
        Ok(Some((file, contents))) => tokio::fs::write(output_dir.join(&file), contents)
            .await
            .map(|_| Some(file))
            .map_err(RunError::from),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(file) => DiagnosticRecord {
            step,
            kind,
            file,
            error: None,
        },
        Err(e) => {
            warn!("step {}: {} failed: {}", step, kind, e);
            DiagnosticRecord {
                step,
                kind,
                file: None,
                error: Some(e.to_string()),
            }
        }
    }
}
