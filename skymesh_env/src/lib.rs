//! SkyMesh Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the SkyMesh engines run
//! against real machines in production and against in-memory fakes in tests.
//!
//! # Core Concept: Intercept Every Outside Effect
//!
//! The emulator touches the outside world in exactly three ways:
//! - Time (`now()`, `sleep()`) used to pace the simulated clock
//! - Remote execution (`exec()`, `upload()`) used to drive machine agents
//! - Sandboxes (`spawn()`, `terminate()`) used to create one isolated network
//!   stack per emulated node
//!
//! Each of these is a trait with a production implementation here and a
//! deterministic implementation in the simulation crate or the tests.
//!
//! # Example
//!
//! ```ignore
//! use skymesh_env::{EmulationContext, RemoteChannel, MachineId};
//!
//! async fn step<Ctx: EmulationContext, Ch: RemoteChannel>(ctx: &Ctx, ch: &Ch) {
//!     let started = ctx.now();
//!     ch.exec(MachineId(0), &["skymesh-agent".into(), "networks".into(), "1".into()]).await.ok();
//!     ctx.sleep(Duration::from_secs(1).saturating_sub(ctx.now() - started)).await;
//! }
//! ```

mod context;
mod error;
mod process;
mod remote;
mod sandbox;
mod tokio_impl;
mod types;

pub use context::EmulationContext;
pub use error::EnvError;
pub use process::{run_command, shell_join};
pub use remote::{LocalChannel, RemoteChannel, SshChannel, SshHost};
pub use sandbox::{SandboxLauncher, UnshareLauncher};
pub use tokio_impl::TokioContext;
pub use types::{MachineId, ProcessHandle};
