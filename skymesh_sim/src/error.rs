//! Error types for the coordinator.

use skymesh_core::{AgentError, ManifestError, TopologyError};
use skymesh_env::{EnvError, MachineId};
use thiserror::Error;

/// Configuration problems. Fatal: reported before any node is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// Errors of a run.
///
/// Configuration, topology and manifest errors abort the run. The per-machine
/// variants are recorded in the run summary and the run continues.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Remote execution failed or the machine is unreachable
    #[error(transparent)]
    Env(#[from] EnvError),

    /// An in-process agent failed
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The agent answered with something that is not a report
    #[error("Unexpected reply from machine {machine}: {output}")]
    Protocol { machine: MachineId, output: String },

    /// The machine did not acknowledge within the step timeout
    #[error("Machine {machine} did not acknowledge within {timeout_ms}ms")]
    Timeout { machine: MachineId, timeout_ms: u64 },

    /// A diagnostic target has no address to reach it on
    #[error("No address found for node {0}")]
    NoAddress(String),

    /// No agent handle for a machine referenced by the manifest
    #[error("No agent for machine {0}")]
    UnknownMachine(MachineId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// True if the machine itself could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Env(e) if e.is_unreachable()) || matches!(self, Self::Timeout { .. })
    }
}
