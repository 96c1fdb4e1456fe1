//! Sandbox launcher: one isolated process (and network stack) per node.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::EnvError;
use crate::process::run_command;
use crate::types::ProcessHandle;

/// Creates and destroys the isolated process that hosts one emulated node.
///
/// The returned handle's pid is the anchor for every later namespace entry
/// (`/proc/<pid>/ns/net`) and for termination.
#[async_trait]
pub trait SandboxLauncher: Send + Sync + 'static {
    /// Spawns a sandbox for `node_name` rooted at `work_dir`.
    async fn spawn(&self, work_dir: &Path, node_name: &str) -> Result<ProcessHandle, EnvError>;

    /// Terminates a sandbox previously returned by `spawn`.
    async fn terminate(&self, handle: ProcessHandle) -> Result<(), EnvError>;
}

/// Launcher built on util-linux `unshare`.
///
/// Each node gets fresh network, UTS, IPC, mount and pid namespaces. The
/// sandbox sets its hostname to the node name and then idles until killed.
#[derive(Debug, Clone)]
pub struct UnshareLauncher {
    unshare_bin: String,
}

impl UnshareLauncher {
    /// Creates a launcher using `unshare` from `PATH`.
    pub fn new() -> Self {
        Self {
            unshare_bin: "unshare".to_string(),
        }
    }

    /// Overrides the `unshare` binary.
    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.unshare_bin = path.into();
        self
    }

    fn args(node_name: &str) -> Vec<String> {
        [
            "--net",
            "--uts",
            "--ipc",
            "--mount",
            "--pid",
            "--fork",
            "--mount-proc",
            "sh",
            "-c",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(format!(
            "hostname {}; exec sleep infinity",
            node_name
        )))
        .collect()
    }
}

impl Default for UnshareLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxLauncher for UnshareLauncher {
    async fn spawn(&self, work_dir: &Path, node_name: &str) -> Result<ProcessHandle, EnvError> {
        tokio::fs::create_dir_all(work_dir).await?;
        let child = Command::new(&self.unshare_bin)
            .args(Self::args(node_name))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| EnvError::sandbox(format!("{} exited before reporting a pid", node_name)))?;
        debug!("spawned sandbox {} (pid {})", node_name, pid);
        Ok(ProcessHandle::new(pid))
    }

    async fn terminate(&self, handle: ProcessHandle) -> Result<(), EnvError> {
        run_command("kill", &["-9".to_string(), handle.pid.to_string()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshare_args_set_hostname() {
        let args = UnshareLauncher::args("SH1O2S3");
        assert_eq!(args[0], "--net");
        assert!(args.contains(&"--mount-proc".to_string()));
        assert_eq!(args.last().unwrap(), "hostname SH1O2S3; exec sleep infinity");
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let launcher = UnshareLauncher::new().with_binary("/nonexistent/unshare");
        let dir = tempfile::tempdir().unwrap();
        let err = launcher.spawn(dir.path(), "GS1").await.unwrap_err();
        assert!(matches!(err, EnvError::Io(_)));
    }
}
