//! Node registry - the sandboxes hosting this machine's nodes.
//!
//! One sandbox process per local node; its network namespace is registered
//! under the node's name. The registry file lists every node of the manifest
//! in order, `name:pid` for local nodes and `NA` for nodes hosted elsewhere,
//! so one-shot agent invocations can find the nodes created by `nodes`.
//!
//! The damage file holds the names of the local nodes currently damaged, one
//! per line.

use skymesh_env::{MachineId, ProcessHandle, SandboxLauncher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::LinkBackend;
use crate::error::{LinkError, ManifestError};
use crate::model::NodeId;
use crate::partition::Assignment;

/// Manifest file name inside an agent's work dir.
pub const MANIFEST_FILE: &str = "assign.txt";

/// Registry file name inside an agent's work dir.
pub const REGISTRY_FILE: &str = "container_pid.txt";

/// Damage file name inside an agent's work dir.
pub const DAMAGE_FILE: &str = "damage_list.txt";

/// Registry placeholder for a node hosted on another machine.
pub const NOT_ASSIGNED: &str = "NA";

/// Sysctls set inside every node.
const NODE_SYSCTLS: &[&str] = &[
    "net.ipv4.conf.all.forwarding=1",
    "net.ipv6.conf.all.forwarding=1",
];

/// Sysctls set once on the host. Thousands of peers overflow the default
/// neighbour tables.
pub const HOST_SYSCTLS: &[&str] = &[
    "net.ipv4.neigh.default.gc_thresh1=4096",
    "net.ipv4.neigh.default.gc_thresh2=8192",
    "net.ipv4.neigh.default.gc_thresh3=16384",
    "net.ipv6.neigh.default.gc_thresh1=4096",
    "net.ipv6.neigh.default.gc_thresh2=8192",
    "net.ipv6.neigh.default.gc_thresh3=16384",
];

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn registry_path(dir: &Path) -> PathBuf {
    dir.join(REGISTRY_FILE)
}

pub fn damage_path(dir: &Path) -> PathBuf {
    dir.join(DAMAGE_FILE)
}

/// Node to sandbox mapping of one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRegistry {
    /// Every manifest node in order; `None` when hosted elsewhere
    entries: Vec<(NodeId, Option<ProcessHandle>)>,

    /// Position of each node in `entries`
    slots: HashMap<NodeId, usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry listing every manifest node, none spawned yet.
    pub fn layout(assignment: &Assignment) -> Self {
        let entries: Vec<_> = assignment.nodes().map(|n| (n, None)).collect();
        let slots = entries.iter().enumerate().map(|(i, (n, _))| (*n, i)).collect();
        Self { entries, slots }
    }

    pub fn set(&mut self, node: NodeId, handle: ProcessHandle) {
        match self.slots.get(&node) {
            Some(&i) => self.entries[i].1 = Some(handle),
            None => {
                self.slots.insert(node, self.entries.len());
                self.entries.push((node, Some(handle)));
            }
        }
    }

    pub fn handle(&self, node: NodeId) -> Option<ProcessHandle> {
        self.slots.get(&node).and_then(|&i| self.entries[i].1)
    }

    /// Nodes with a live sandbox, in registry order.
    pub fn local(&self) -> impl Iterator<Item = (NodeId, ProcessHandle)> + '_ {
        self.entries.iter().filter_map(|(n, h)| h.map(|h| (*n, h)))
    }

    pub fn local_count(&self) -> usize {
        self.local().count()
    }

    /// Renders the registry file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (node, handle) in &self.entries {
            match handle {
                Some(h) => out.push_str(&format!("{}:{}\n", node, h.pid)),
                None => {
                    out.push_str(NOT_ASSIGNED);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Parses a registry file. `NA` lines carry no node and are dropped.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut registry = Self::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line == NOT_ASSIGNED {
                continue;
            }
            let (name, pid) = line
                .split_once(':')
                .ok_or_else(|| ManifestError::malformed(i + 1, "expected 'name:pid'"))?;
            let node: NodeId = name
                .parse()
                .map_err(|e: crate::model::NodeNameError| ManifestError::malformed(i + 1, e.to_string()))?;
            let pid: u32 = pid
                .trim()
                .parse()
                .map_err(|_| ManifestError::malformed(i + 1, format!("bad pid '{}'", pid)))?;
            registry.set(node, ProcessHandle::new(pid));
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ManifestError> {
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

/// Reads the damage file; a missing file is an empty set.
pub async fn load_damage(path: &Path) -> Result<BTreeSet<NodeId>, ManifestError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e.into()),
    };
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            l.trim()
                .parse()
                .map_err(|_| ManifestError::malformed(i + 1, format!("bad node name '{}'", l.trim())))
        })
        .collect()
}

/// Writes the damage file; an empty set removes it.
pub async fn save_damage(path: &Path, damaged: &BTreeSet<NodeId>) -> Result<(), ManifestError> {
    if damaged.is_empty() {
        return match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        };
    }
    let body: String = damaged.iter().map(|n| format!("{}\n", n)).collect();
    tokio::fs::write(path, body).await?;
    Ok(())
}

/// Creates and removes the sandboxes of one machine.
pub struct NodeManager<B: LinkBackend, L: SandboxLauncher> {
    work_dir: PathBuf,
    backend: Arc<B>,
    launcher: Arc<L>,
}

impl<B: LinkBackend, L: SandboxLauncher> NodeManager<B, L> {
    pub fn new(work_dir: impl Into<PathBuf>, backend: Arc<B>, launcher: Arc<L>) -> Self {
        Self {
            work_dir: work_dir.into(),
            backend,
            launcher,
        }
    }

    /// Sandbox directory of a node.
    pub fn node_dir(&self, node: NodeId) -> PathBuf {
        self.work_dir.join("overlay").join(node.to_string())
    }

    /// Spawns a sandbox for every local node that does not have one yet,
    /// registers its namespace and persists the registry.
    ///
    /// Nodes already in an existing registry are kept, so a crashed
    /// bootstrap can be resumed.
    pub async fn bootstrap(
        &self,
        assignment: &Assignment,
        machine: MachineId,
    ) -> Result<NodeRegistry, LinkError> {
        let path = registry_path(&self.work_dir);
        let previous = if path.exists() {
            NodeRegistry::load(&path).await?
        } else {
            NodeRegistry::new()
        };

        let mut registry = NodeRegistry::layout(assignment);
        let mut spawned = 0;
        for node in assignment.local_nodes(machine) {
            let name = node.to_string();
            if let Some(handle) = previous.handle(node) {
                debug!("{} already running (pid {})", name, handle);
                registry.set(node, handle);
                continue;
            }
            let handle = self.launcher.spawn(&self.node_dir(node), &name).await?;
            self.backend.attach_namespace(&name, handle).await?;
            let mut sysctl = vec!["sysctl".to_string(), "-w".to_string()];
            sysctl.extend(NODE_SYSCTLS.iter().map(|s| s.to_string()));
            self.backend.exec_in(&name, &sysctl).await?;
            registry.set(node, handle);
            spawned += 1;
            if spawned % 64 == 0 {
                self.save_registry(&registry).await?;
            }
        }
        self.save_registry(&registry).await?;
        info!(
            "✓ machine {}: {} nodes up ({} spawned)",
            machine,
            registry.local_count(),
            spawned
        );
        Ok(registry)
    }

    async fn save_registry(&self, registry: &NodeRegistry) -> Result<(), LinkError> {
        Ok(registry.save(&registry_path(&self.work_dir)).await?)
    }

    /// Removes every sandbox in the registry along with the registry and
    /// damage files. Individual failures are logged and skipped.
    pub async fn clean(&self, registry: &NodeRegistry) -> usize {
        let mut removed = 0;
        for (node, handle) in registry.local() {
            let name = node.to_string();
            if let Err(e) = self.backend.detach_namespace(&name).await {
                warn!("detach {}: {}", name, e);
            }
            match self.launcher.terminate(handle).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("terminate {} (pid {}): {}", name, handle, e),
            }
        }
        for path in [registry_path(&self.work_dir), damage_path(&self.work_dir)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("remove {}: {}", path.display(), e);
                }
            }
        }
        info!("✓ removed {} nodes", removed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use async_trait::async_trait;
    use skymesh_env::EnvError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLauncher {
        next_pid: AtomicU32,
        terminated: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl SandboxLauncher for FakeLauncher {
        async fn spawn(&self, _work_dir: &Path, _node_name: &str) -> Result<ProcessHandle, EnvError> {
            Ok(ProcessHandle::new(1000 + self.next_pid.fetch_add(1, Ordering::SeqCst)))
        }

        async fn terminate(&self, handle: ProcessHandle) -> Result<(), EnvError> {
            self.terminated.lock().unwrap().push(handle.pid);
            Ok(())
        }
    }

    fn assignment() -> Assignment {
        Assignment::parse_manifest("1 0\n2 s1\n0 1\n\nh0\nh1\n").unwrap()
    }

    #[test]
    fn test_registry_set_keeps_manifest_order() {
        let mut registry = NodeRegistry::layout(&assignment());
        registry.set(NodeId::Ground(1), ProcessHandle::new(12));
        registry.set(NodeId::sat(0, 0, 0), ProcessHandle::new(11));
        registry.set(NodeId::Ground(1), ProcessHandle::new(13));
        assert_eq!(registry.render(), "SH1O1S1:11\nNA\nNA\nNA\nNA\nGS2:13\n");
        assert_eq!(registry.handle(NodeId::Ground(1)), Some(ProcessHandle::new(13)));
        assert_eq!(registry.handle(NodeId::sat(0, 1, 1)), None);

        // Nodes outside the manifest are appended once.
        registry.set(NodeId::Ground(7), ProcessHandle::new(20));
        registry.set(NodeId::Ground(7), ProcessHandle::new(21));
        assert_eq!(registry.local_count(), 3);
        assert!(registry.render().ends_with("GS2:13\nGS8:21\n"));
    }

    #[test]
    fn test_registry_render_and_parse() {
        let mut registry = NodeRegistry::layout(&assignment());
        registry.set(NodeId::sat(0, 0, 0), ProcessHandle::new(11));
        registry.set(NodeId::Ground(1), ProcessHandle::new(12));
        let text = registry.render();
        assert_eq!(text, "SH1O1S1:11\nNA\nNA\nNA\nNA\nGS2:12\n");

        let parsed = NodeRegistry::parse(&text).unwrap();
        assert_eq!(parsed.handle(NodeId::Ground(1)), Some(ProcessHandle::new(12)));
        assert_eq!(parsed.local_count(), 2);
        assert!(NodeRegistry::parse("SH1O1S1-11\n").is_err());
    }

    #[tokio::test]
    async fn test_damage_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = damage_path(dir.path());
        assert!(load_damage(&path).await.unwrap().is_empty());

        let damaged: BTreeSet<NodeId> = [NodeId::sat(0, 1, 0), NodeId::sat(0, 0, 0)].into();
        save_damage(&path, &damaged).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "SH1O1S1\nSH1O2S1\n");
        assert_eq!(load_damage(&path).await.unwrap(), damaged);

        save_damage(&path, &BTreeSet::new()).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bootstrap_resume_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let launcher = Arc::new(FakeLauncher::default());
        let manager = NodeManager::new(dir.path(), Arc::clone(&backend), Arc::clone(&launcher));

        let registry = manager.bootstrap(&assignment(), MachineId(0)).await.unwrap();
        assert_eq!(registry.local_count(), 3);
        assert_eq!(
            backend.namespaces().await.unwrap(),
            vec!["GS2".to_string(), "SH1O1S1".to_string(), "SH1O2S1".to_string()]
        );
        let sysctls = backend.exec_log();
        assert_eq!(sysctls.len(), 3);
        assert_eq!(sysctls[0].1[0], "sysctl");

        // A second run finds every node in the registry.
        let again = manager.bootstrap(&assignment(), MachineId(0)).await.unwrap();
        assert_eq!(again, registry);
        assert_eq!(backend.exec_log().len(), 3);

        assert_eq!(manager.clean(&again).await, 3);
        assert_eq!(launcher.terminated.lock().unwrap().len(), 3);
        assert!(!registry_path(dir.path()).exists());
        assert!(backend.namespaces().await.unwrap().is_empty());
    }
}
