//! SkyMesh Coordinator
//!
//! Drives a distributed satellite network emulation from one control host:
//! prepares the per-step link diffs of a constellation, ships them to the
//! machine agents and advances the whole fleet one step per wall-clock
//! interval, firing fault and diagnostic events along the way.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Coordinator                           │
//! │  EmulationConfig ──► Prepared (timeline, manifest, diffs)    │
//! │                           │                                  │
//! │  ┌────────────────────────▼───────────────────────────────┐  │
//! │  │ Scheduler (EmulationContext clock + EventQueue)        │  │
//! │  │   FaultInjector        diagnostics (detached tasks)    │  │
//! │  └────────────────────────┬───────────────────────────────┘  │
//! │                           │ MachineAgent                     │
//! └───────────────────────────┼──────────────────────────────────┘
//!            ┌────────────────┼────────────────┐
//!       ┌────▼────┐      ┌────▼────┐      ┌────▼────┐
//!       │ agent 0 │◄────►│ agent 1 │◄────►│ agent 2 │   VXLAN between
//!       └─────────┘      └─────────┘      └─────────┘   machines
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use skymesh_sim::{EmulationConfig, Emulation, VirtualContext, WalkerOracle};
//!
//! let config = EmulationConfig::load(Path::new("skymesh.json"))?;
//! let emulation = Emulation::prepare(config, &WalkerOracle::new())?;
//! let summary = emulation.run_in_memory(VirtualContext::shared(42)).await?;
//! ```

pub mod config;
mod context;
pub mod error;
pub mod events;
pub mod fault;
pub mod fleet;
mod oracle;
pub mod prepare;
pub mod runner;
pub mod scheduler;
pub mod summary;

pub use config::{EmulationConfig, EventOrdering, GroundStationConfig, MachineConfig, ShellConfig};
pub use context::VirtualContext;
pub use error::{ConfigError, RunError};
pub use events::{Event, EventQueue, ScheduledEvent};
pub use fault::FaultInjector;
pub use fleet::{Diagnostic, LocalAgent, MachineAgent, RemoteAgent};
pub use oracle::WalkerOracle;
pub use prepare::Prepared;
pub use runner::{Emulation, WorkDirs};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use summary::RunSummary;
