//! Production link backend driving iproute2 (`ip`, `tc`).

use async_trait::async_trait;
use skymesh_env::{run_command, EnvError, ProcessHandle};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::addressing::VXLAN_PORT;
use crate::backend::{IfAddr, InterfaceState, LinkBackend, Shaping, TunnelSpec};
use crate::error::LinkError;

/// Backend running `ip` and `tc` as subprocesses.
#[derive(Debug, Clone, Default)]
pub struct IpRouteBackend {
    /// Underlay device for tunnels; the kernel picks one when unset
    underlay_dev: Option<String>,
}

impl IpRouteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins VXLAN tunnels to an underlay device.
    pub fn with_underlay(mut self, dev: impl Into<String>) -> Self {
        self.underlay_dev = Some(dev.into());
        self
    }

    async fn ip(&self, args: &[String]) -> Result<String, LinkError> {
        Ok(run_command("ip", args).await?)
    }

    async fn ip_ns(&self, ns: &str, args: &[&str]) -> Result<String, LinkError> {
        let mut argv = vec!["-n".to_string(), ns.to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        self.ip(&argv).await
    }

    async fn tc_ns(&self, ns: &str, args: &[String]) -> Result<String, LinkError> {
        let mut argv = vec!["netns".into(), "exec".into(), ns.to_string(), "tc".into()];
        argv.extend(args.iter().cloned());
        self.ip(&argv).await
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// `netem` arguments for a shaping.
pub fn netem_args(shaping: &Shaping) -> Vec<String> {
    vec![
        "netem".into(),
        "delay".into(),
        format!("{}ms", shaping.delay_ms),
        "loss".into(),
        format!("{}%", shaping.loss_pct),
        "rate".into(),
        format!("{}Gbit", shaping.rate_gbit),
    ]
}

fn parse_time_ms(raw: &str) -> Option<f64> {
    let (num, factor) = if let Some(v) = raw.strip_suffix("us") {
        (v, 1e-3)
    } else if let Some(v) = raw.strip_suffix("ms") {
        (v, 1.0)
    } else if let Some(v) = raw.strip_suffix('s') {
        (v, 1e3)
    } else {
        (raw, 1.0)
    };
    num.parse::<f64>().ok().map(|v| v * factor)
}

fn parse_rate_gbit(raw: &str) -> Option<f64> {
    let units = [("Gbit", 1.0), ("Mbit", 1e-3), ("Kbit", 1e-6), ("bit", 1e-9)];
    units.iter().find_map(|(suffix, factor)| {
        raw.strip_suffix(suffix)
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v * factor)
    })
}

/// Parses `tc qdisc show` output into per-device netem shaping.
pub fn parse_qdisc_show(output: &str) -> HashMap<String, Shaping> {
    let mut out = HashMap::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.get(1) != Some(&"netem") {
            continue;
        }
        let value_after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        let Some(dev) = value_after("dev") else { continue };
        let delay = value_after("delay").and_then(parse_time_ms).unwrap_or(0.0);
        let loss = value_after("loss")
            .and_then(|v| v.trim_end_matches('%').parse::<f64>().ok())
            .unwrap_or(0.0);
        let rate = value_after("rate").and_then(parse_rate_gbit).unwrap_or(0.0);
        out.insert(dev.to_string(), Shaping::new(delay, loss, rate));
    }
    out
}

/// Parses `ip -o link show` into `(name, up)` pairs, loopback excluded.
pub fn parse_link_show(output: &str) -> Vec<(String, bool)> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let _index = tokens.next()?;
            let raw = tokens.next()?.trim_end_matches(':');
            let name = raw.split('@').next()?.to_string();
            let flags = tokens.next().unwrap_or("");
            (name != "lo").then(|| (name, flags.contains("UP")))
        })
        .collect()
}

/// Parses `ip -o -4 addr show` into `(device, address)` pairs.
pub fn parse_addr_show(output: &str) -> Vec<(String, IfAddr)> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let dev = tokens.get(1)?.to_string();
            let pos = tokens.iter().position(|t| *t == "inet")?;
            let (addr, prefix) = tokens.get(pos + 1)?.split_once('/')?;
            let addr: Ipv4Addr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            (dev != "lo").then(|| (dev, IfAddr::new(addr, prefix)))
        })
        .collect()
}

fn is_missing_device(err: &LinkError) -> bool {
    matches!(
        err,
        LinkError::Env(EnvError::CommandFailed { stderr, .. }) if stderr.contains("does not exist")
    )
}

#[async_trait]
impl LinkBackend for IpRouteBackend {
    async fn attach_namespace(&self, name: &str, handle: ProcessHandle) -> Result<(), LinkError> {
        self.ip(&strings(&["netns", "attach", name, &handle.pid.to_string()]))
            .await
            .map(|_| ())
    }

    async fn detach_namespace(&self, name: &str) -> Result<(), LinkError> {
        self.ip(&strings(&["netns", "delete", name])).await.map(|_| ())
    }

    async fn namespaces(&self) -> Result<Vec<String>, LinkError> {
        let out = self.ip(&strings(&["netns", "list"])).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn create_veth(&self, ns_a: &str, if_a: &str, ns_b: &str, if_b: &str) -> Result<(), LinkError> {
        self.ip(&strings(&[
            "link", "add", "name", if_a, "netns", ns_a, "type", "veth", "peer", "name", if_b, "netns", ns_b,
        ]))
        .await
        .map(|_| ())
    }

    async fn create_vxlan(&self, ns: &str, ifname: &str, tunnel: &TunnelSpec) -> Result<(), LinkError> {
        let staging = tunnel.staging_name.as_str();
        let mut add = strings(&["link", "add", staging, "type", "vxlan"]);
        add.extend([
            "id".to_string(),
            tunnel.vni.to_string(),
            "remote".to_string(),
            tunnel.remote.clone(),
            "dstport".to_string(),
            VXLAN_PORT.to_string(),
        ]);
        if let Some(dev) = &self.underlay_dev {
            add.extend(["dev".to_string(), dev.clone()]);
        }
        self.ip(&add).await?;

        let moved = async {
            self.ip(&strings(&["link", "set", staging, "netns", ns])).await?;
            self.ip_ns(ns, &["link", "set", staging, "name", ifname]).await
        }
        .await;
        if let Err(e) = moved {
            // Leave nothing behind in the root namespace.
            let _ = self.ip(&strings(&["link", "del", staging])).await;
            let _ = self.ip_ns(ns, &["link", "del", staging]).await;
            return Err(e);
        }
        Ok(())
    }

    async fn init_interface(&self, ns: &str, ifname: &str, addr: IfAddr, shaping: Shaping) -> Result<(), LinkError> {
        self.ip_ns(ns, &["addr", "add", &addr.to_string(), "dev", ifname])
            .await?;
        let mut tc = strings(&["qdisc", "add", "dev", ifname, "root"]);
        tc.extend(netem_args(&shaping));
        self.tc_ns(ns, &tc).await?;
        self.ip_ns(ns, &["link", "set", ifname, "up"]).await.map(|_| ())
    }

    async fn change_shaping(&self, ns: &str, ifname: &str, shaping: Shaping) -> Result<(), LinkError> {
        let mut tc = strings(&["qdisc", "change", "dev", ifname, "root"]);
        tc.extend(netem_args(&shaping));
        self.tc_ns(ns, &tc).await.map(|_| ())
    }

    async fn delete_interface(&self, ns: &str, ifname: &str) -> Result<(), LinkError> {
        match self.ip_ns(ns, &["link", "del", ifname]).await {
            Err(e) if is_missing_device(&e) => Err(LinkError::missing(ns, ifname)),
            other => other.map(|_| ()),
        }
    }

    async fn interface_exists(&self, ns: &str, ifname: &str) -> Result<bool, LinkError> {
        match self.ip_ns(ns, &["link", "show", ifname]).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing_device(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn interfaces(&self, ns: &str) -> Result<Vec<InterfaceState>, LinkError> {
        let links = parse_link_show(&self.ip_ns(ns, &["-o", "link", "show"]).await?);
        let addrs: HashMap<String, IfAddr> =
            parse_addr_show(&self.ip_ns(ns, &["-o", "-4", "addr", "show"]).await?)
                .into_iter()
                .collect();
        let shaping = parse_qdisc_show(&self.tc_ns(ns, &strings(&["qdisc", "show"])).await?);
        Ok(links
            .into_iter()
            .map(|(name, up)| InterfaceState {
                addr: addrs.get(&name).copied(),
                shaping: shaping.get(&name).copied(),
                up,
                name,
            })
            .collect())
    }

    async fn exec_in(&self, ns: &str, argv: &[String]) -> Result<String, LinkError> {
        let mut full = strings(&["netns", "exec", ns]);
        full.extend(argv.iter().cloned());
        self.ip(&full).await
    }
}
