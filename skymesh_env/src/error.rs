//! Error types for the SkyMesh environment abstraction.

use crate::types::MachineId;
use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A remote command reached the machine but failed there
    #[error("Remote error on machine {machine}: {reason}")]
    RemoteError { machine: MachineId, reason: String },

    /// The machine could not be reached at all
    #[error("Machine unreachable: {0}")]
    MachineUnreachable(MachineId),

    /// A local or remote process exited with a non-zero status
    #[error("Command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The sandbox launcher could not create a node
    #[error("Sandbox error: {0}")]
    SandboxError(String),

    /// Underlying I/O failure (spawn, file copy, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a remote error.
    pub fn remote(machine: MachineId, reason: impl Into<String>) -> Self {
        Self::RemoteError {
            machine,
            reason: reason.into(),
        }
    }

    /// Creates a sandbox error.
    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::SandboxError(msg.into())
    }

    /// Returns true if the failure means the machine itself is gone, as
    /// opposed to a command that ran and failed.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::MachineUnreachable(_) | Self::Timeout(_))
    }
}
