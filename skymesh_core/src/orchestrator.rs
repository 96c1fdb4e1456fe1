//! Link-Lifecycle Orchestrator - applies deltas to one machine's namespaces.
//!
//! Each link moves through `absent -> active -> active(reshaped) -> absent`,
//! driven only by delta entries for its index:
//!
//! ```text
//!            added                 updated (delay/loss/rate only)
//!  absent ----------> active <------------------------------+
//!    ^                  |  \_______________________________/
//!    |     deleted      |
//!    +------------------+
//! ```
//!
//! Both endpoints local: a veth pair between the two node namespaces.
//! One endpoint local: the local end of a VXLAN tunnel keyed by the link
//! index. Neither: not this machine's business.
//!
//! # Concurrency
//!
//! A step runs in two phases: all deletions, then updates and additions.
//! Inside a phase links are independent tasks on a `JoinSet` bounded by a
//! semaphore. Entering a namespace is not reentrant per node, so each task
//! holds the lock of every node it touches; locks are taken in node order so
//! two tasks sharing nodes cannot deadlock.
//!
//! # Failure isolation
//!
//! A failing link is logged and recorded in [`ApplyReport::failures`]; the
//! other links of the step still run.

use serde::{Deserialize, Serialize};
use skymesh_env::MachineId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::addressing::{endpoint_addr, interface_name, side_of, staging_name, vni, LINK_PREFIX_LEN};
use crate::backend::{IfAddr, LinkBackend, Shaping, TunnelSpec};
use crate::delta::Delta;
use crate::error::LinkError;
use crate::model::{Link, LinkKind, NodeId};
use crate::partition::Assignment;

/// Loss forced on every interface of a damaged node (%).
pub const DAMAGED_LOSS_PCT: f64 = 100.0;

/// Nominal rate and loss of one link class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Bandwidth (Gbit/s)
    pub rate_gbit: f64,

    /// Packet loss (%)
    pub loss_pct: f64,
}

impl LinkParams {
    pub fn new(rate_gbit: f64, loss_pct: f64) -> Self {
        Self {
            rate_gbit,
            loss_pct,
        }
    }
}

impl Default for LinkParams {
    fn default() -> Self {
        Self::new(10.0, 0.0)
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// ISL rate and loss
    pub isl: LinkParams,

    /// GSL rate and loss
    pub gsl: LinkParams,

    /// Maximum link operations in flight
    pub max_parallel: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            isl: LinkParams::default(),
            gsl: LinkParams::default(),
            max_parallel: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_isl(mut self, params: LinkParams) -> Self {
        self.isl = params;
        self
    }

    pub fn with_gsl(mut self, params: LinkParams) -> Self {
        self.gsl = params;
        self
    }

    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    /// Nominal parameters of a link class.
    pub fn params(&self, kind: LinkKind) -> LinkParams {
        match kind {
            LinkKind::Isl => self.isl,
            LinkKind::Gsl => self.gsl,
        }
    }
}

/// Kind of operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOp {
    Add,
    Update,
    Delete,
    Damage,
    Recover,
}

/// One recorded per-link (or per-interface) failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkFailure {
    /// Link index, when the failure concerns one link
    pub index: Option<u32>,

    /// Node whose namespace was involved
    pub node: String,

    pub op: LinkOp,

    pub error: String,
}

/// Outcome of applying one delta (or one damage/recovery).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub deleted: usize,
    pub updated: usize,
    pub added: usize,

    /// Interfaces reshaped by damage or recovery
    pub reshaped: usize,

    /// Entries ignored because no endpoint is local
    pub foreign: usize,

    pub failures: Vec<LinkFailure>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Adds another report's counts and failures to this one.
    pub fn merge(&mut self, other: ApplyReport) {
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.added += other.added;
        self.reshaped += other.reshaped;
        self.foreign += other.foreign;
        self.failures.extend(other.failures);
    }

    fn count(&mut self, op: LinkOp) {
        match op {
            LinkOp::Add => self.added += 1,
            LinkOp::Update => self.updated += 1,
            LinkOp::Delete => self.deleted += 1,
            LinkOp::Damage | LinkOp::Recover => self.reshaped += 1,
        }
    }
}

/// Per-node async locks, created on first use.
#[derive(Debug, Default)]
pub struct NodeLocks {
    locks: std::sync::Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, node: NodeId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(node).or_default().clone()
    }

    /// Locks every node in `nodes`, in node order.
    pub async fn lock(&self, nodes: &[NodeId]) -> Vec<OwnedMutexGuard<()>> {
        let mut ordered = nodes.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut guards = Vec::with_capacity(ordered.len());
        for node in ordered {
            guards.push(self.handle(node).lock_owned().await);
        }
        guards
    }
}

/// Where a link lives from this machine's point of view.
#[derive(Debug, Clone)]
enum Placement {
    /// Both endpoints here: veth pair
    Local { a: NodeId, b: NodeId },
    /// One endpoint here: tunnel to the peer's machine
    Tunnel {
        local: NodeId,
        remote: NodeId,
        remote_addr: String,
    },
    /// Neither endpoint here
    Foreign,
}

/// State shared by the worker tasks of a step.
struct Shared<B: LinkBackend> {
    backend: Arc<B>,
    locks: NodeLocks,
    config: OrchestratorConfig,
}

/// Drives one machine's links to match a stream of deltas.
///
/// Generic over the backend, so the same code runs against iproute2 in
/// production and against [`crate::backend::MemoryBackend`] in tests.
pub struct LinkOrchestrator<B: LinkBackend> {
    machine: MachineId,
    assignment: Arc<Assignment>,
    shared: Arc<Shared<B>>,
    damaged: BTreeSet<NodeId>,
}

impl<B: LinkBackend> LinkOrchestrator<B> {
    pub fn new(
        machine: MachineId,
        assignment: Arc<Assignment>,
        backend: Arc<B>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            machine,
            assignment,
            shared: Arc::new(Shared {
                backend,
                locks: NodeLocks::new(),
                config,
            }),
            damaged: BTreeSet::new(),
        }
    }

    /// Restores a previously persisted damage set.
    pub fn with_damaged(mut self, damaged: BTreeSet<NodeId>) -> Self {
        self.damaged = damaged;
        self
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Local nodes currently damaged.
    pub fn damaged(&self) -> &BTreeSet<NodeId> {
        &self.damaged
    }

    fn placement(&self, link: &Link) -> Result<Placement, LinkError> {
        let owner = |node: NodeId| {
            self.assignment
                .machine_of(node)
                .ok_or_else(|| LinkError::NotLocal(node.to_string()))
        };
        let (ma, mb) = (owner(link.a)?, owner(link.b)?);
        let here = self.machine;
        let tunnel = |local: NodeId, remote: NodeId, machine: MachineId| {
            let remote_addr = self
                .assignment
                .address(machine)
                .ok_or_else(|| LinkError::NotLocal(format!("machine {}", machine)))?
                .to_string();
            Ok(Placement::Tunnel {
                local,
                remote,
                remote_addr,
            })
        };
        match (ma == here, mb == here) {
            (true, true) => Ok(Placement::Local {
                a: link.a,
                b: link.b,
            }),
            (true, false) => tunnel(link.a, link.b, mb),
            (false, true) => tunnel(link.b, link.a, ma),
            (false, false) => Ok(Placement::Foreign),
        }
    }

    /// Applies one delta: deletions first, then updates and additions.
    pub async fn apply(&self, delta: &Delta) -> ApplyReport {
        let damaged = Arc::new(self.damaged.clone());
        let mut report = self
            .run_phase(delta.deleted.iter().map(|l| (LinkOp::Delete, *l)), &damaged)
            .await;
        let rest = delta
            .updated
            .iter()
            .map(|l| (LinkOp::Update, *l))
            .chain(delta.added.iter().map(|l| (LinkOp::Add, *l)));
        report.merge(self.run_phase(rest, &damaged).await);

        if report.is_clean() {
            debug!(
                "machine {}: -{} ~{} +{}",
                self.machine, report.deleted, report.updated, report.added
            );
        } else {
            warn!(
                "machine {}: -{} ~{} +{} with {} failed links",
                self.machine,
                report.deleted,
                report.updated,
                report.added,
                report.failures.len()
            );
        }
        report
    }

    async fn run_phase(
        &self,
        jobs: impl Iterator<Item = (LinkOp, Link)>,
        damaged: &Arc<BTreeSet<NodeId>>,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let permits = Arc::new(Semaphore::new(self.shared.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for (op, link) in jobs {
            let placement = match self.placement(&link) {
                Ok(Placement::Foreign) => {
                    report.foreign += 1;
                    continue;
                }
                Ok(p) => p,
                Err(e) => {
                    report.failures.push(failure(op, &link, &e));
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);
            let permits = Arc::clone(&permits);
            let damaged = Arc::clone(damaged);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = shared.run(op, &link, &placement, &damaged).await;
                (op, link, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((op, _, Ok(()))) => report.count(op),
                Ok((op, link, Err(e))) => {
                    warn!("link {} {:?} failed: {}", link.index, op, e);
                    report.failures.push(failure(op, &link, &e));
                }
                Err(e) => {
                    warn!("link task aborted: {}", e);
                    report.failures.push(LinkFailure {
                        index: None,
                        node: String::new(),
                        op: LinkOp::Add,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Forces 100% loss on every interface of the given local nodes.
    ///
    /// Delay and rate stay as they are. Non-local nodes are ignored.
    pub async fn damage(&mut self, nodes: &[NodeId]) -> ApplyReport {
        let local: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| self.assignment.is_local(*n, self.machine))
            .collect();
        self.damaged.extend(local.iter().copied());
        let report = self
            .reshape_nodes(local, LinkOp::Damage, |_, shaping| {
                shaping.with_loss(DAMAGED_LOSS_PCT)
            })
            .await;
        info!(
            "machine {}: damaged {} nodes ({} interfaces)",
            self.machine,
            self.damaged.len(),
            report.reshaped
        );
        report
    }

    /// Restores nominal loss on every damaged node and clears the set.
    pub async fn recover(&mut self) -> ApplyReport {
        let nodes: Vec<NodeId> = std::mem::take(&mut self.damaged).into_iter().collect();
        let config = self.shared.config.clone();
        let report = self
            .reshape_nodes(nodes, LinkOp::Recover, move |kind, shaping| {
                shaping.with_loss(config.params(kind).loss_pct)
            })
            .await;
        info!(
            "machine {}: recovered {} interfaces",
            self.machine, report.reshaped
        );
        report
    }

    async fn reshape_nodes<F>(&self, nodes: Vec<NodeId>, op: LinkOp, reshape: F) -> ApplyReport
    where
        F: Fn(LinkKind, Shaping) -> Shaping + Send + Sync + Clone + 'static,
    {
        let mut report = ApplyReport::default();
        let permits = Arc::new(Semaphore::new(self.shared.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for node in nodes {
            let shared = Arc::clone(&self.shared);
            let permits = Arc::clone(&permits);
            let reshape = reshape.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = shared.reshape_node(node, &reshape).await;
                (node, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(n))) => report.reshaped += n,
                Ok((node, Err(e))) => {
                    warn!("{:?} of {} failed: {}", op, node, e);
                    report.failures.push(LinkFailure {
                        index: None,
                        node: node.to_string(),
                        op,
                        error: e.to_string(),
                    });
                }
                Err(e) => warn!("reshape task aborted: {}", e),
            }
        }
        report
    }
}

fn failure(op: LinkOp, link: &Link, err: &LinkError) -> LinkFailure {
    LinkFailure {
        index: Some(link.index),
        node: link.a.to_string(),
        op,
        error: err.to_string(),
    }
}

/// Class of the link behind an interface inside `node`.
fn interface_kind(node: NodeId, ifname: &str) -> LinkKind {
    let peer_is_ground = ifname
        .parse::<NodeId>()
        .map(|p| p.is_ground())
        .unwrap_or(false);
    if node.is_ground() || peer_is_ground {
        LinkKind::Gsl
    } else {
        LinkKind::Isl
    }
}

impl<B: LinkBackend> Shared<B> {
    fn shaping(&self, link: &Link, node: NodeId, damaged: &BTreeSet<NodeId>) -> Shaping {
        let params = self.config.params(link.kind());
        let loss = if damaged.contains(&node) {
            DAMAGED_LOSS_PCT
        } else {
            params.loss_pct
        };
        Shaping::new(link.delay_ms, loss, params.rate_gbit)
    }

    fn addr(link: &Link, node: NodeId) -> Result<IfAddr, LinkError> {
        let side = side_of(link, node).ok_or_else(|| LinkError::NotLocal(node.to_string()))?;
        Ok(IfAddr::new(
            endpoint_addr(link.kind(), link.index, side),
            LINK_PREFIX_LEN,
        ))
    }

    async fn run(
        &self,
        op: LinkOp,
        link: &Link,
        placement: &Placement,
        damaged: &BTreeSet<NodeId>,
    ) -> Result<(), LinkError> {
        let nodes = match placement {
            Placement::Local { a, b } => vec![*a, *b],
            Placement::Tunnel { local, .. } => vec![*local],
            Placement::Foreign => return Ok(()),
        };
        let _guards = self.locks.lock(&nodes).await;
        match op {
            LinkOp::Add => self.add(link, placement, damaged).await,
            LinkOp::Update => self.update(link, placement, damaged).await,
            LinkOp::Delete => self.delete(link, placement).await,
            LinkOp::Damage | LinkOp::Recover => Ok(()),
        }
    }

    /// Creates the link, or reshapes it if it already exists.
    async fn add(&self, link: &Link, placement: &Placement, damaged: &BTreeSet<NodeId>) -> Result<(), LinkError> {
        let backend = &self.backend;
        match placement {
            Placement::Local { a, b } => {
                let (ns_a, if_a) = (a.to_string(), interface_name(*b));
                let (ns_b, if_b) = (b.to_string(), interface_name(*a));
                let has_a = backend.interface_exists(&ns_a, &if_a).await?;
                let has_b = backend.interface_exists(&ns_b, &if_b).await?;
                if has_a && has_b {
                    debug!("link {} already present, reshaping", link.index);
                    backend.change_shaping(&ns_a, &if_a, self.shaping(link, *a, damaged)).await?;
                    return backend.change_shaping(&ns_b, &if_b, self.shaping(link, *b, damaged)).await;
                }
                if has_a {
                    backend.delete_interface(&ns_a, &if_a).await?;
                } else if has_b {
                    backend.delete_interface(&ns_b, &if_b).await?;
                }
                backend.create_veth(&ns_a, &if_a, &ns_b, &if_b).await?;
                backend
                    .init_interface(&ns_a, &if_a, Self::addr(link, *a)?, self.shaping(link, *a, damaged))
                    .await?;
                backend
                    .init_interface(&ns_b, &if_b, Self::addr(link, *b)?, self.shaping(link, *b, damaged))
                    .await
            }
            Placement::Tunnel {
                local,
                remote,
                remote_addr,
            } => {
                let (ns, ifname) = (local.to_string(), interface_name(*remote));
                let shaping = self.shaping(link, *local, damaged);
                if backend.interface_exists(&ns, &ifname).await? {
                    debug!("tunnel {} already present, reshaping", link.index);
                    return backend.change_shaping(&ns, &ifname, shaping).await;
                }
                let tunnel = TunnelSpec {
                    vni: vni(link.index),
                    remote: remote_addr.clone(),
                    staging_name: staging_name(link.index),
                };
                backend.create_vxlan(&ns, &ifname, &tunnel).await?;
                backend
                    .init_interface(&ns, &ifname, Self::addr(link, *local)?, shaping)
                    .await
            }
            Placement::Foreign => Ok(()),
        }
    }

    /// Reshapes in place; a link that is not there is created instead.
    async fn update(&self, link: &Link, placement: &Placement, damaged: &BTreeSet<NodeId>) -> Result<(), LinkError> {
        let ends: Vec<(NodeId, NodeId)> = match placement {
            Placement::Local { a, b } => vec![(*a, *b), (*b, *a)],
            Placement::Tunnel { local, remote, .. } => vec![(*local, *remote)],
            Placement::Foreign => return Ok(()),
        };
        for (node, peer) in &ends {
            let (ns, ifname) = (node.to_string(), interface_name(*peer));
            if !self.backend.interface_exists(&ns, &ifname).await? {
                warn!("link {} missing on update, re-adding", link.index);
                return self.add(link, placement, damaged).await;
            }
        }
        for (node, peer) in ends {
            self.backend
                .change_shaping(&node.to_string(), &interface_name(peer), self.shaping(link, node, damaged))
                .await?;
        }
        Ok(())
    }

    /// Tears the link down; missing interfaces are already gone.
    async fn delete(&self, link: &Link, placement: &Placement) -> Result<(), LinkError> {
        let ends: Vec<(NodeId, NodeId)> = match placement {
            Placement::Local { a, b } => vec![(*a, *b), (*b, *a)],
            Placement::Tunnel { local, remote, .. } => vec![(*local, *remote)],
            Placement::Foreign => return Ok(()),
        };
        let mut removed = false;
        for (node, peer) in ends {
            let (ns, ifname) = (node.to_string(), interface_name(peer));
            // Removing one veth end also removes the other.
            if self.backend.interface_exists(&ns, &ifname).await? {
                self.backend.delete_interface(&ns, &ifname).await?;
                removed = true;
            }
        }
        if !removed {
            debug!("link {} already absent", link.index);
        }
        Ok(())
    }

    async fn reshape_node<F>(&self, node: NodeId, reshape: &F) -> Result<usize, LinkError>
    where
        F: Fn(LinkKind, Shaping) -> Shaping,
    {
        let _guards = self.locks.lock(&[node]).await;
        let ns = node.to_string();
        let mut count = 0;
        for iface in self.backend.interfaces(&ns).await? {
            let Some(current) = iface.shaping else { continue };
            let next = reshape(interface_kind(node, &iface.name), current);
            self.backend.change_shaping(&ns, &iface.name, next).await?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::SatId;
    use approx::assert_relative_eq;

    /// Shell 0 on machine 0, shell 1 on machine 1, GS1 on machine 0.
    fn assignment() -> Arc<Assignment> {
        Arc::new(
            Assignment::parse_manifest("0\n3 s1\n0 0 0\n3 s2\n1 1 1\n\n10.0.0.1\n10.0.0.2\n").unwrap(),
        )
    }

    fn backend_for(machine: MachineId) -> Arc<MemoryBackend> {
        let names: Vec<String> = assignment()
            .local_nodes(machine)
            .iter()
            .map(|n| n.to_string())
            .collect();
        Arc::new(MemoryBackend::with_namespaces(names))
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_isl(LinkParams::new(5.0, 0.0))
            .with_gsl(LinkParams::new(1.0, 2.0))
    }

    fn isl(index: u32, a: (u32, u32), b: (u32, u32), delay: f64) -> Link {
        Link::new(index, NodeId::sat(0, a.0, a.1), NodeId::sat(0, b.0, b.1), delay)
    }

    fn orchestrator(machine: MachineId) -> LinkOrchestrator<MemoryBackend> {
        LinkOrchestrator::new(machine, assignment(), backend_for(machine), config())
    }

    #[tokio::test]
    async fn test_add_local_link_creates_shaped_veth() {
        let orch = orchestrator(MachineId(0));
        let delta = Delta {
            added: vec![isl(4, (0, 1), (0, 2), 7.5)],
            ..Default::default()
        };
        let report = orch.apply(&delta).await;
        assert_eq!(report.added, 1);
        assert!(report.is_clean());

        let backend = orch.backend();
        let a = backend.interface("SH1O1S2", "SH1O1S3").unwrap();
        let b = backend.interface("SH1O1S3", "SH1O1S2").unwrap();
        assert!(a.up && b.up);
        assert_eq!(a.addr.unwrap().addr.to_string(), "10.0.4.10");
        assert_eq!(b.addr.unwrap().addr.to_string(), "10.0.4.40");
        let shaping = a.shaping.unwrap();
        assert_relative_eq!(shaping.delay_ms, 7.5);
        assert_relative_eq!(shaping.rate_gbit, 5.0);
    }

    #[tokio::test]
    async fn test_update_reshapes_in_place() {
        let orch = orchestrator(MachineId(0));
        let link = isl(0, (0, 0), (0, 1), 3.0);
        orch.apply(&Delta { added: vec![link], ..Default::default() }).await;
        let before = orch.backend().op_counts();

        let moved = Link { delay_ms: 3.4, ..link };
        let report = orch.apply(&Delta { updated: vec![moved], ..Default::default() }).await;
        assert_eq!(report.updated, 1);
        let after = orch.backend().op_counts();
        assert_eq!(after.creates, before.creates);
        assert_eq!(after.deletes, before.deletes);
        assert_eq!(after.reshapes, before.reshapes + 2);
        let iface = orch.backend().interface("SH1O1S1", "SH1O1S2").unwrap();
        assert_relative_eq!(iface.shaping.unwrap().delay_ms, 3.4);
    }

    #[tokio::test]
    async fn test_update_of_absent_link_adds_it() {
        let orch = orchestrator(MachineId(0));
        let report = orch
            .apply(&Delta { updated: vec![isl(1, (1, 0), (1, 1), 2.0)], ..Default::default() })
            .await;
        assert!(report.is_clean());
        assert!(orch.backend().interface("SH1O2S1", "SH1O2S2").is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_pair_and_tolerates_absence() {
        let orch = orchestrator(MachineId(0));
        let link = isl(2, (2, 0), (2, 1), 2.0);
        orch.apply(&Delta { added: vec![link], ..Default::default() }).await;
        let delete = Delta { deleted: vec![link], ..Default::default() };
        let report = orch.apply(&delete).await;
        assert_eq!(report.deleted, 1);
        assert!(orch.backend().interface_names("SH1O3S1").is_empty());
        assert!(orch.backend().interface_names("SH1O3S2").is_empty());

        let again = orch.apply(&delete).await;
        assert!(again.is_clean());
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let orch = orchestrator(MachineId(0));
        let delta = Delta {
            added: vec![
                isl(0, (0, 0), (0, 1), 1.0),
                isl(1, (0, 1), (0, 2), 1.0),
                isl(2, (0, 0), (1, 0), 1.0),
                Link::new(40, NodeId::Ground(0), NodeId::sat(1, 0, 0), 3.0),
            ],
            ..Default::default()
        };
        orch.apply(&delta).await;
        let snapshot = |o: &LinkOrchestrator<MemoryBackend>| {
            assignment()
                .local_nodes(MachineId(0))
                .iter()
                .map(|n| o.backend().interface_names(&n.to_string()))
                .collect::<Vec<_>>()
        };
        let once = snapshot(&orch);
        let creates = orch.backend().op_counts().creates;

        let report = orch.apply(&delta).await;
        assert!(report.is_clean());
        assert_eq!(snapshot(&orch), once);
        assert_eq!(orch.backend().op_counts().creates, creates);
    }

    #[tokio::test]
    async fn test_cross_machine_link_is_one_tunnel_end() {
        let link = Link::new(40, NodeId::Ground(0), NodeId::sat(1, 2, 2), 3.0);
        let delta = Delta { added: vec![link], ..Default::default() };

        let here = orchestrator(MachineId(0));
        let report = here.apply(&delta).await;
        assert_eq!(report.added, 1);
        let gs_side = here.backend().interface("GS1", "SH2O3S3").unwrap();
        assert_eq!(gs_side.addr.unwrap().addr.to_string(), "9.0.40.10");
        assert_relative_eq!(gs_side.shaping.unwrap().loss_pct, 2.0);

        let there = orchestrator(MachineId(1));
        there.apply(&delta).await;
        let sat_side = there.backend().interface("SH2O3S3", "GS1").unwrap();
        assert_eq!(sat_side.addr.unwrap().addr.to_string(), "9.0.40.40");
    }

    #[tokio::test]
    async fn test_foreign_links_are_skipped() {
        let orch = orchestrator(MachineId(1));
        let report = orch
            .apply(&Delta { added: vec![isl(0, (0, 0), (0, 1), 1.0)], ..Default::default() })
            .await;
        assert_eq!(report.foreign, 1);
        assert_eq!(report.added, 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_link() {
        let backend = Arc::new(MemoryBackend::with_namespaces(["SH1O1S1", "SH1O1S2"]));
        let orch = LinkOrchestrator::new(MachineId(0), assignment(), backend, config());
        let delta = Delta {
            added: vec![isl(0, (0, 0), (0, 1), 1.0), isl(1, (0, 1), (0, 2), 1.0)],
            ..Default::default()
        };
        let report = orch.apply(&delta).await;
        assert_eq!(report.added, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, Some(1));
        assert_eq!(report.failures[0].op, LinkOp::Add);
    }

    #[tokio::test]
    async fn test_damage_and_recover() {
        let mut orch = orchestrator(MachineId(0));
        let delta = Delta {
            added: vec![
                isl(0, (0, 0), (0, 1), 1.0),
                Link::new(40, NodeId::Ground(0), NodeId::sat(0, 0, 0), 3.0),
            ],
            ..Default::default()
        };
        orch.apply(&delta).await;

        let victim = NodeId::sat(0, 0, 0);
        let report = orch.damage(&[victim, NodeId::sat(1, 0, 0)]).await;
        assert_eq!(report.reshaped, 2);
        assert_eq!(orch.damaged().len(), 1);
        for ifname in ["SH1O1S2", "GS1"] {
            let s = orch.backend().interface("SH1O1S1", ifname).unwrap().shaping.unwrap();
            assert_relative_eq!(s.loss_pct, DAMAGED_LOSS_PCT);
        }
        let gs_ifc = orch.backend().interface("SH1O1S1", "GS1").unwrap().shaping.unwrap();
        assert_relative_eq!(gs_ifc.delay_ms, 3.0);
        // The peer's side is untouched.
        let peer = orch.backend().interface("SH1O1S2", "SH1O1S1").unwrap().shaping.unwrap();
        assert_relative_eq!(peer.loss_pct, 0.0);

        // Updates keep a damaged node dark.
        let moved = Link::new(0, NodeId::sat(0, 0, 0), NodeId::sat(0, 0, 1), 1.5);
        orch.apply(&Delta { updated: vec![moved], ..Default::default() }).await;
        let s = orch.backend().interface("SH1O1S1", "SH1O1S2").unwrap().shaping.unwrap();
        assert_relative_eq!(s.loss_pct, DAMAGED_LOSS_PCT);

        let report = orch.recover().await;
        assert_eq!(report.reshaped, 2);
        assert!(orch.damaged().is_empty());
        let isl_s = orch.backend().interface("SH1O1S1", "SH1O1S2").unwrap().shaping.unwrap();
        let gsl_s = orch.backend().interface("SH1O1S1", "GS1").unwrap().shaping.unwrap();
        assert_relative_eq!(isl_s.loss_pct, 0.0);
        assert_relative_eq!(gsl_s.loss_pct, 2.0);
        assert_relative_eq!(isl_s.delay_ms, 1.5);
    }

    #[tokio::test]
    async fn test_node_locks_serialize_same_node() {
        let locks = Arc::new(NodeLocks::new());
        let a = NodeId::Satellite(SatId::new(0, 0, 0));
        let b = NodeId::Satellite(SatId::new(0, 0, 1));
        let held = locks.lock(&[b, a]).await;
        assert_eq!(held.len(), 2);

        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move { other.lock(&[a]).await.len() });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
