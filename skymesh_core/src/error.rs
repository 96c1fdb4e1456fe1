//! Error types for the SkyMesh engines.

use skymesh_env::EnvError;
use thiserror::Error;

/// Errors raised while building the topology timeline.
///
/// All of these are fatal: they abort the run before any node is created.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Malformed shell parameters
    #[error("Invalid shell '{name}': {reason}")]
    InvalidShell { name: String, reason: String },

    /// Malformed ground-station parameters
    #[error("Invalid ground station {id}: {reason}")]
    InvalidGroundStation { id: u32, reason: String },

    /// Two links computed with the same index but different endpoints
    #[error("Link index {index} bound to both {existing} and {conflicting}")]
    IdentityViolation {
        index: u32,
        existing: String,
        conflicting: String,
    },

    /// The constellation needs more link indices than addressing allows
    #[error("Link index space exhausted: index {0} exceeds 65535")]
    IndexSpaceExhausted(u32),

    /// The position provider returned an unexpected shape
    #[error("Position provider error: {0}")]
    Positions(String),
}

impl TopologyError {
    /// Creates an invalid-shell error.
    pub fn shell(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidShell {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors parsing a per-step diff file.
#[derive(Debug, Error)]
pub enum DiffFormatError {
    /// A line could not be parsed
    #[error("Diff line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// The file has a different node count than the constellation
    #[error("Diff file has {found} node lines, expected {expected}")]
    NodeCount { expected: usize, found: usize },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiffFormatError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

/// Errors parsing or loading the manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A line could not be parsed
    #[error("Manifest line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// An assignment refers to a machine without an address
    #[error("Machine {0} is assigned nodes but has no address")]
    UnknownMachine(u32),

    /// The manifest file is missing or unreadable
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

/// Errors from one OS-level link operation.
///
/// These are per-link: the orchestrator records them and keeps going.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The node's namespace does not exist
    #[error("Namespace missing: {0}")]
    NamespaceMissing(String),

    /// The interface already exists where a fresh one was required
    #[error("Interface {ifname} already exists in {namespace}")]
    InterfaceExists { namespace: String, ifname: String },

    /// The interface does not exist
    #[error("Interface {ifname} missing in {namespace}")]
    InterfaceMissing { namespace: String, ifname: String },

    /// The node is not hosted on this machine
    #[error("Node {0} is not local to this machine")]
    NotLocal(String),

    /// Unparseable output from an OS tool
    #[error("Unexpected output from {tool}: {output}")]
    Parse { tool: String, output: String },

    /// The underlying command failed
    #[error(transparent)]
    Env(#[from] EnvError),

    /// Local file I/O (registry, damage list, settings)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unreadable registry or damage file
    #[error("State file: {0}")]
    State(#[from] ManifestError),
}

/// Errors of a machine agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or malformed manifest, registry or damage file
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Malformed diff file
    #[error("{path}: {source}")]
    Diff {
        path: String,
        #[source]
        source: DiffFormatError,
    },

    /// Unreadable agent settings
    #[error("Agent settings: {0}")]
    Settings(#[from] serde_json::Error),

    /// A node operation failed outright
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    pub(crate) fn missing(namespace: &str, ifname: &str) -> Self {
        Self::InterfaceMissing {
            namespace: namespace.to_string(),
            ifname: ifname.to_string(),
        }
    }
}
