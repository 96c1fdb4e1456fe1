//! Common types for the SkyMesh environment abstraction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of one physical machine in the emulation fleet.
///
/// Machine ids are dense indices into the manifest's address list, so the
/// coordinator is always machine-agnostic: machine `0` is simply the first
/// address configured.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct MachineId(pub u32);

impl MachineId {
    /// Returns the id as a vector index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MachineId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(MachineId)
    }
}

/// Handle to a sandboxed node process.
///
/// The pid is stable for the lifetime of the node and is what later
/// namespace-entry and signal operations are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// OS process id of the sandbox init process
    pub pid: u32,
}

impl ProcessHandle {
    /// Creates a handle from a raw pid.
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Path of the network namespace owned by this process.
    pub fn netns_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/net", self.pid))
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_parse_and_display() {
        let id: MachineId = " 3 ".parse().unwrap();
        assert_eq!(id, MachineId(3));
        assert_eq!(id.to_string(), "3");
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn test_process_handle_netns_path() {
        let handle = ProcessHandle::new(4242);
        assert_eq!(handle.netns_path(), PathBuf::from("/proc/4242/ns/net"));
    }
}
