//! Remote execution channel between the coordinator and machine agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EnvError;
use crate::process::{run_command, shell_join};
use crate::types::MachineId;

/// Abstraction for command/response I/O with machine agents.
///
/// Every coordinator-to-agent interaction is a blocking command: the caller
/// issues it and waits for its completion, which is what turns each emulation
/// step into a barrier across the fleet.
///
/// # Implementations
///
/// - **Production**: `SshChannel` (ssh/scp), `LocalChannel` (single host)
/// - **Tests**: in-process fakes recording commands
///
/// ```text
/// Coordinator                 Channel                  Agent (machine m)
///   |-- upload(m, diff) ------->|------------------------>| <workdir>/<shell>/<t>.txt
///   |-- exec(m, networks t) --->|------------------------>| apply delta
///   |<------------------------- |<------- stdout ---------|
/// ```
#[async_trait]
pub trait RemoteChannel: Send + Sync + 'static {
    /// Executes a command on a machine and returns its stdout.
    ///
    /// # Returns
    /// * `Ok(stdout)` - the command ran and exited successfully
    /// * `Err(EnvError::MachineUnreachable)` - the machine could not be contacted
    /// * `Err(EnvError::CommandFailed)` - the command ran and failed
    async fn exec(&self, machine: MachineId, command: &[String]) -> Result<String, EnvError>;

    /// Copies a local file to a path on the machine.
    async fn upload(&self, machine: MachineId, local: &Path, remote: &Path)
        -> Result<(), EnvError>;
}

/// Login details of one machine reachable over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHost {
    /// Host name or address
    pub address: String,

    /// Login user
    #[serde(default = "default_user")]
    pub user: String,

    /// ssh port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl SshHost {
    /// Creates a host entry with the default user and port.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: default_user(),
            port: default_port(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Remote channel backed by the system `ssh` and `scp` binaries.
///
/// Authentication is delegated entirely to the ssh client configuration
/// (agent, keys, `~/.ssh/config`); batch mode keeps a missing key from
/// turning into an interactive prompt that would stall a step.
pub struct SshChannel {
    hosts: Vec<SshHost>,
    connect_timeout_secs: u32,
}

impl SshChannel {
    /// Creates a channel over the given hosts, indexed by machine id.
    pub fn new(hosts: Vec<SshHost>) -> Self {
        Self {
            hosts,
            connect_timeout_secs: 10,
        }
    }

    /// Sets the ssh connect timeout.
    pub fn with_connect_timeout(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn host(&self, machine: MachineId) -> Result<&SshHost, EnvError> {
        self.hosts
            .get(machine.index())
            .ok_or(EnvError::MachineUnreachable(machine))
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }
}

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

fn classify(machine: MachineId, err: EnvError) -> EnvError {
    match err {
        EnvError::CommandFailed { status, .. } if status == SSH_CONNECTION_FAILURE => {
            EnvError::MachineUnreachable(machine)
        }
        EnvError::CommandFailed { stderr, .. } => EnvError::remote(machine, stderr),
        other => other,
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, machine: MachineId, command: &[String]) -> Result<String, EnvError> {
        let host = self.host(machine)?;
        let mut args = self.common_options();
        args.extend([
            "-p".to_string(),
            host.port.to_string(),
            host.destination(),
            "--".to_string(),
            shell_join(command),
        ]);
        run_command("ssh", &args)
            .await
            .map_err(|e| classify(machine, e))
    }

    async fn upload(
        &self,
        machine: MachineId,
        local: &Path,
        remote: &Path,
    ) -> Result<(), EnvError> {
        let host = self.host(machine)?;
        if let Some(parent) = remote.parent() {
            let mkdir = vec![
                "mkdir".to_string(),
                "-p".to_string(),
                parent.display().to_string(),
            ];
            self.exec(machine, &mkdir).await?;
        }
        let mut args = self.common_options();
        args.extend([
            "-P".to_string(),
            host.port.to_string(),
            local.display().to_string(),
            format!("{}:{}", host.destination(), remote.display()),
        ]);
        run_command("scp", &args)
            .await
            .map(|_| ())
            .map_err(|e| classify(machine, e))
    }
}

/// Remote channel for a fleet that is really the local host.
///
/// Commands run as local subprocesses and uploads are file copies. Every
/// machine id maps to the same host, which is how a single-machine run is
/// expressed without special cases in the coordinator.
#[derive(Debug, Default, Clone)]
pub struct LocalChannel;

impl LocalChannel {
    /// Creates a local channel.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    async fn exec(&self, machine: MachineId, command: &[String]) -> Result<String, EnvError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EnvError::remote(machine, "empty command"))?;
        run_command(program, args).await.map_err(|e| match e {
            EnvError::CommandFailed { stderr, .. } => EnvError::remote(machine, stderr),
            other => other,
        })
    }

    async fn upload(
        &self,
        _machine: MachineId,
        local: &Path,
        remote: &Path,
    ) -> Result<(), EnvError> {
        if local == remote {
            return Ok(());
        }
        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_host_defaults() {
        let host = SshHost::new("10.0.0.7");
        assert_eq!(host.user, "root");
        assert_eq!(host.port, 22);
        assert_eq!(host.destination(), "root@10.0.0.7");
    }

    #[test]
    fn test_classify_connection_failure() {
        let err = EnvError::CommandFailed {
            command: "ssh".into(),
            status: 255,
            stderr: "Connection refused".into(),
        };
        assert!(classify(MachineId(2), err).is_unreachable());
    }

    #[tokio::test]
    async fn test_ssh_channel_unknown_machine() {
        let channel = SshChannel::new(vec![SshHost::new("127.0.0.1")]);
        let err = channel
            .exec(MachineId(5), &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::MachineUnreachable(MachineId(5))));
    }

    #[tokio::test]
    async fn test_local_channel_exec_and_upload() {
        let channel = LocalChannel::new();
        let out = channel
            .exec(MachineId(0), &["echo".to_string(), "step".to_string()])
            .await
            .unwrap();
        assert_eq!(out.trim(), "step");

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        tokio::fs::write(&src, "payload").await.unwrap();
        let dst = dir.path().join("nested/b.txt");
        channel.upload(MachineId(0), &src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&dst).await.unwrap(), "payload");
    }
}
