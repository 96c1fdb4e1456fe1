//! Link backend: the OS operations the orchestrator is allowed to perform.
//!
//! Every call is scoped to one node namespace. Implementations:
//!
//! - **Production**: `IpRouteBackend` - `ip`/`tc` from iproute2
//! - **Tests**: `MemoryBackend` - interface tables in memory

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skymesh_env::ProcessHandle;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::error::LinkError;

/// Netem-style shaping of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shaping {
    /// One-way delay (ms)
    pub delay_ms: f64,

    /// Packet loss (%)
    pub loss_pct: f64,

    /// Rate limit (Gbit/s)
    pub rate_gbit: f64,
}

impl Shaping {
    pub fn new(delay_ms: f64, loss_pct: f64, rate_gbit: f64) -> Self {
        Self {
            delay_ms,
            loss_pct,
            rate_gbit,
        }
    }

    /// Same delay and rate, different loss.
    pub fn with_loss(self, loss_pct: f64) -> Self {
        Self { loss_pct, ..self }
    }
}

/// An IPv4 interface address with prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfAddr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl IfAddr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

impl std::fmt::Display for IfAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Parses `a.b.c.d/len`.
impl std::str::FromStr for IfAddr {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LinkError::Parse {
            tool: "address".to_string(),
            output: s.to_string(),
        };
        let (addr, len) = s.trim().split_once('/').ok_or_else(bad)?;
        let addr = addr.parse().map_err(|_| bad())?;
        let prefix_len: u8 = len.parse().map_err(|_| bad())?;
        if prefix_len > 32 {
            return Err(bad());
        }
        Ok(Self::new(addr, prefix_len))
    }
}

/// What a backend reports about one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceState {
    pub name: String,
    pub addr: Option<IfAddr>,
    pub shaping: Option<Shaping>,
    pub up: bool,
}

/// Parameters of one VXLAN tunnel end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Tunnel key
    pub vni: u32,

    /// Underlay address of the peer machine
    pub remote: String,

    /// Name used in the root namespace before the move
    pub staging_name: String,
}

/// OS operations on node namespaces.
#[async_trait]
pub trait LinkBackend: Send + Sync + 'static {
    /// Registers `name` as the network namespace of a sandbox process.
    async fn attach_namespace(&self, name: &str, handle: ProcessHandle) -> Result<(), LinkError>;

    /// Removes a namespace registration.
    async fn detach_namespace(&self, name: &str) -> Result<(), LinkError>;

    /// Registered namespace names.
    async fn namespaces(&self) -> Result<Vec<String>, LinkError>;

    /// Creates a veth pair with one end in each namespace.
    async fn create_veth(&self, ns_a: &str, if_a: &str, ns_b: &str, if_b: &str) -> Result<(), LinkError>;

    /// Creates one tunnel end inside `ns`, named `ifname`.
    async fn create_vxlan(&self, ns: &str, ifname: &str, tunnel: &TunnelSpec) -> Result<(), LinkError>;

    /// Assigns the address, installs shaping and brings the interface up,
    /// in that order.
    async fn init_interface(&self, ns: &str, ifname: &str, addr: IfAddr, shaping: Shaping) -> Result<(), LinkError>;

    /// Replaces the shaping of an existing interface in place.
    async fn change_shaping(&self, ns: &str, ifname: &str, shaping: Shaping) -> Result<(), LinkError>;

    /// Deletes an interface; deleting one veth end removes its peer.
    async fn delete_interface(&self, ns: &str, ifname: &str) -> Result<(), LinkError>;

    async fn interface_exists(&self, ns: &str, ifname: &str) -> Result<bool, LinkError>;

    /// Link interfaces of a namespace (loopback excluded).
    async fn interfaces(&self, ns: &str) -> Result<Vec<InterfaceState>, LinkError>;

    /// Runs a command inside a namespace and returns its stdout.
    async fn exec_in(&self, ns: &str, argv: &[String]) -> Result<String, LinkError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    namespaces: BTreeMap<String, BTreeMap<String, InterfaceState>>,
    veth_peers: HashMap<(String, String), (String, String)>,
    exec_log: Vec<(String, Vec<String>)>,
    exec_replies: HashMap<String, String>,
    creates: usize,
    deletes: usize,
    reshapes: usize,
}

impl MemoryState {
    fn ns_mut(&mut self, ns: &str) -> Result<&mut BTreeMap<String, InterfaceState>, LinkError> {
        self.namespaces
            .get_mut(ns)
            .ok_or_else(|| LinkError::NamespaceMissing(ns.to_string()))
    }

    fn iface_mut(&mut self, ns: &str, ifname: &str) -> Result<&mut InterfaceState, LinkError> {
        self.ns_mut(ns)?
            .get_mut(ifname)
            .ok_or_else(|| LinkError::missing(ns, ifname))
    }

    fn add_iface(&mut self, ns: &str, ifname: &str) -> Result<(), LinkError> {
        let table = self.ns_mut(ns)?;
        if table.contains_key(ifname) {
            return Err(LinkError::InterfaceExists {
                namespace: ns.to_string(),
                ifname: ifname.to_string(),
            });
        }
        table.insert(
            ifname.to_string(),
            InterfaceState {
                name: ifname.to_string(),
                addr: None,
                shaping: None,
                up: false,
            },
        );
        Ok(())
    }
}

/// In-memory backend that behaves like a kernel with strict error checks:
/// creating an existing interface or touching a missing one fails.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

/// Counters of mutating operations performed on a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpCounts {
    pub creates: usize,
    pub deletes: usize,
    pub reshapes: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with the given namespaces already registered.
    pub fn with_namespaces<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            for name in names {
                state.namespaces.insert(name.into(), BTreeMap::new());
            }
        }
        backend
    }

    /// Sets the stdout returned by `exec_in` for commands starting with
    /// `program`.
    pub fn reply_to(&self, program: &str, stdout: &str) {
        self.lock().exec_replies.insert(program.to_string(), stdout.to_string());
    }

    /// Snapshot of one interface.
    pub fn interface(&self, ns: &str, ifname: &str) -> Option<InterfaceState> {
        self.lock().namespaces.get(ns)?.get(ifname).cloned()
    }

    /// Interface names of a namespace, sorted.
    pub fn interface_names(&self, ns: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(ns)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Commands run through `exec_in`, in order.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.lock().exec_log.clone()
    }

    pub fn op_counts(&self) -> OpCounts {
        let state = self.lock();
        OpCounts {
            creates: state.creates,
            deletes: state.deletes,
            reshapes: state.reshapes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves the tables consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LinkBackend for MemoryBackend {
    async fn attach_namespace(&self, name: &str, _handle: ProcessHandle) -> Result<(), LinkError> {
        self.lock()
            .namespaces
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn detach_namespace(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.namespaces.remove(name);
        state
            .veth_peers
            .retain(|(ns, _), (peer_ns, _)| ns.as_str() != name && peer_ns.as_str() != name);
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>, LinkError> {
        Ok(self.lock().namespaces.keys().cloned().collect())
    }

    async fn create_veth(&self, ns_a: &str, if_a: &str, ns_b: &str, if_b: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.ns_mut(ns_b)?;
        state.add_iface(ns_a, if_a)?;
        if let Err(e) = state.add_iface(ns_b, if_b) {
            if let Ok(table) = state.ns_mut(ns_a) {
                table.remove(if_a);
            }
            return Err(e);
        }
        let a = (ns_a.to_string(), if_a.to_string());
        let b = (ns_b.to_string(), if_b.to_string());
        state.veth_peers.insert(a.clone(), b.clone());
        state.veth_peers.insert(b, a);
        state.creates += 1;
        Ok(())
    }

    async fn create_vxlan(&self, ns: &str, ifname: &str, _tunnel: &TunnelSpec) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.add_iface(ns, ifname)?;
        state.creates += 1;
        Ok(())
    }

    async fn init_interface(&self, ns: &str, ifname: &str, addr: IfAddr, shaping: Shaping) -> Result<(), LinkError> {
        let mut state = self.lock();
        let iface = state.iface_mut(ns, ifname)?;
        iface.addr = Some(addr);
        iface.shaping = Some(shaping);
        iface.up = true;
        Ok(())
    }

    async fn change_shaping(&self, ns: &str, ifname: &str, shaping: Shaping) -> Result<(), LinkError> {
        let mut state = self.lock();
        state.iface_mut(ns, ifname)?.shaping = Some(shaping);
        state.reshapes += 1;
        Ok(())
    }

    async fn delete_interface(&self, ns: &str, ifname: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        if state.ns_mut(ns)?.remove(ifname).is_none() {
            return Err(LinkError::missing(ns, ifname));
        }
        if let Some((peer_ns, peer_if)) = state.veth_peers.remove(&(ns.to_string(), ifname.to_string())) {
            state.veth_peers.remove(&(peer_ns.clone(), peer_if.clone()));
            if let Ok(table) = state.ns_mut(&peer_ns) {
                table.remove(&peer_if);
            }
        }
        state.deletes += 1;
        Ok(())
    }

    async fn interface_exists(&self, ns: &str, ifname: &str) -> Result<bool, LinkError> {
        let mut state = self.lock();
        Ok(state.ns_mut(ns)?.contains_key(ifname))
    }

    async fn interfaces(&self, ns: &str) -> Result<Vec<InterfaceState>, LinkError> {
        let mut state = self.lock();
        Ok(state.ns_mut(ns)?.values().cloned().collect())
    }

    async fn exec_in(&self, ns: &str, argv: &[String]) -> Result<String, LinkError> {
        let mut state = self.lock();
        state.ns_mut(ns)?;
        state.exec_log.push((ns.to_string(), argv.to_vec()));
        if let Some(reply) = argv.first().and_then(|program| state.exec_replies.get(program)) {
            return Ok(reply.clone());
        }
        // Address listings reflect the modelled interfaces
        if argv.iter().map(String::as_str).eq(["ip", "-br", "addr", "show"]) {
            let listing: String = state
                .ns_mut(ns)?
                .values()
                .filter_map(|iface| {
                    let addr = iface.addr?;
                    let status = if iface.up { "UP" } else { "DOWN" };
                    Some(format!("{}@if0 {} {}\n", iface.name, status, addr))
                })
                .collect();
            return Ok(listing);
        }
        Ok(String::new())
    }
}
