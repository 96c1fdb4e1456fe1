//! SkyMesh Core - satellite network emulation engines
//!
//! Turns a constellation description into a stream of per-step link changes
//! and applies those changes to the network namespaces of one machine:
//! 1. **Topology**: positions -> ISL/GSL snapshots with stable link indices
//! 2. **Delta**: minimal add/update/delete sets between consecutive snapshots
//! 3. **Partition**: node placement across machines, shipped as the manifest
//! 4. **Orchestration**: per-machine link lifecycle over veth pairs and VXLAN
//!    tunnels with netem shaping

pub mod addressing;
pub mod backend;
pub mod delta;
pub mod diagnostics;
pub mod diff_file;
pub mod error;
pub mod geometry;
pub mod iproute;
pub mod model;
pub mod nodes;
pub mod orchestrator;
pub mod partition;
pub mod routing;
pub mod runtime;
pub mod topology;

// Re-export key types for convenience
pub use backend::{LinkBackend, MemoryBackend, Shaping};
pub use delta::{diff, Delta, DELAY_EPSILON_MS};
pub use error::{AgentError, DiffFormatError, LinkError, ManifestError, TopologyError};
pub use geometry::{PositionProvider, PositionTable};
pub use iproute::IpRouteBackend;
pub use model::{GroundStation, Link, LinkKind, Lla, NodeId, SatId, Shell};
pub use orchestrator::{ApplyReport, LinkOrchestrator, LinkParams, OrchestratorConfig};
pub use partition::{partition, Assignment};
pub use runtime::{AgentRuntime, AgentSettings};
pub use topology::{GslStyle, IslStyle, Timeline, TopologyConfig, TopologySnapshot};
