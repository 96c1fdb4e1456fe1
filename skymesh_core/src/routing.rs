//! Routing daemon: BIRD running OSPF over every link interface.
//!
//! Link interfaces are named after their peer, so two patterns (`SH*` and
//! `GS*`) cover every ISL and GSL a node will ever have; the same
//! configuration file serves every node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::LinkBackend;
use crate::error::LinkError;
use crate::model::NodeId;

/// Configuration file name inside an agent's work dir.
pub const BIRD_CONF_FILE: &str = "bird.conf";

/// OSPF settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OspfConfig {
    /// Hello interval (s); BIRD's default of 10 s reacts too slowly to
    /// handovers
    pub hello_interval_s: u32,

    /// Cost of every link interface
    pub cost: u32,

    /// Log file inside each node
    pub log_path: String,
}

impl Default for OspfConfig {
    fn default() -> Self {
        Self {
            hello_interval_s: 1,
            cost: 256,
            log_path: "/var/log/bird.log".to_string(),
        }
    }
}

impl OspfConfig {
    pub fn with_hello_interval(mut self, secs: u32) -> Self {
        self.hello_interval_s = secs.max(1);
        self
    }

    /// Renders `bird.conf`.
    pub fn render(&self) -> String {
        let mut out = format!(
            "log \"{}\" {{ warning, error, auth, fatal, bug }};\n",
            self.log_path
        );
        out.push_str(
            "protocol device {\n}\n\
             protocol direct {\n    disabled;\n    ipv4;\n    ipv6;\n}\n\
             protocol kernel {\n    ipv4 {\n        export all;\n    };\n}\n\
             protocol static {\n    ipv4;\n}\n\
             protocol ospf {\n    ipv4 {\n        import all;\n        export all;\n    };\n    area 0 {\n",
        );
        for pattern in ["SH*", "GS*"] {
            out.push_str(&format!(
                "        interface \"{}\" {{\n            type ptp;\n            cost {};\n            hello {};\n        }};\n",
                pattern, self.cost, self.hello_interval_s
            ));
        }
        out.push_str("    };\n}\n");
        out
    }

    /// Writes `bird.conf` into `dir` and returns its path.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf, LinkError> {
        let path = dir.join(BIRD_CONF_FILE);
        tokio::fs::write(&path, self.render()).await?;
        Ok(path)
    }
}

/// Command starting BIRD inside a node.
pub fn bird_command(conf: &Path) -> Vec<String> {
    let ctl = conf.with_file_name("bird.ctl");
    vec![
        "bird".to_string(),
        "-c".to_string(),
        conf.display().to_string(),
        "-s".to_string(),
        ctl.display().to_string(),
    ]
}

/// Starts BIRD in each of `nodes`. Nodes where it fails to start are logged
/// and returned; the others keep running.
pub async fn start_daemons<B: LinkBackend>(
    backend: &B,
    conf: &Path,
    nodes: &[NodeId],
) -> Vec<(NodeId, LinkError)> {
    let argv = bird_command(conf);
    let mut failed = Vec::new();
    for node in nodes {
        if let Err(e) = backend.exec_in(&node.to_string(), &argv).await {
            warn!("bird in {}: {}", node, e);
            failed.push((*node, e));
        }
    }
    info!(
        "✓ routing daemons started on {}/{} nodes",
        nodes.len() - failed.len(),
        nodes.len()
    );
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_config_covers_both_link_classes() {
        let conf = OspfConfig::default().with_hello_interval(5).render();
        assert!(conf.contains("protocol ospf {"));
        assert!(conf.contains("interface \"SH*\""));
        assert!(conf.contains("interface \"GS*\""));
        assert_eq!(conf.matches("hello 5;").count(), 2);
        assert_eq!(conf.matches('{').count(), conf.matches('}').count());
    }

    #[tokio::test]
    async fn test_start_daemons_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let conf = OspfConfig::default().write(dir.path()).await.unwrap();
        assert!(conf.ends_with(BIRD_CONF_FILE));

        let backend = MemoryBackend::with_namespaces(["SH1O1S1"]);
        let failed = start_daemons(&backend, &conf, &[NodeId::sat(0, 0, 0), NodeId::Ground(0)]).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, NodeId::Ground(0));

        let log = backend.exec_log();
        assert_eq!(log[0].1[0], "bird");
        assert!(log[0].1[4].ends_with("bird.ctl"));
    }
}
