//! Diagnostics run inside node namespaces: reachability, throughput, routing
//! tables and next-hop overrides, plus the host utility snapshot.
//!
//! Every function returns the tool's raw output; the coordinator stores it
//! under the run directory.

use std::net::Ipv4Addr;

use crate::backend::{IfAddr, LinkBackend};
use crate::error::LinkError;

/// Probes per ping.
pub const PING_COUNT: u32 = 4;

/// Interval between probes (s).
pub const PING_INTERVAL_S: f64 = 0.01;

/// Throughput test length (s).
pub const IPERF_SECONDS: u32 = 5;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Parses `ip -br addr show`: `(interface, IPv4 address)` per interface,
/// loopback excluded.
pub fn parse_brief_addrs(output: &str) -> Vec<(String, IfAddr)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?.split('@').next()?.to_string();
            if name == "lo" {
                return None;
            }
            let _state = fields.next()?;
            let (addr, prefix) = fields.next()?.split_once('/')?;
            let addr: Ipv4Addr = addr.parse().ok()?;
            let prefix_len: u8 = prefix.parse().ok()?;
            Some((name, IfAddr::new(addr, prefix_len)))
        })
        .collect()
}

/// Address to reach a node at, given its interface listing: the interface
/// facing `from` if there is one, else its first address.
pub fn pick_address(addrs: &[(String, IfAddr)], from: &str) -> Option<Ipv4Addr> {
    addrs
        .iter()
        .find(|(name, _)| name == from)
        .or_else(|| addrs.first())
        .map(|(_, a)| a.addr)
}

/// Raw `ip -br addr show` output of a node.
pub async fn address_listing<B: LinkBackend>(backend: &B, node: &str) -> Result<String, LinkError> {
    backend.exec_in(node, &argv(&["ip", "-br", "addr", "show"])).await
}

/// Interface addresses of a node.
pub async fn addresses<B: LinkBackend>(backend: &B, node: &str) -> Result<Vec<(String, IfAddr)>, LinkError> {
    Ok(parse_brief_addrs(&address_listing(backend, node).await?))
}

/// `ping` from `src` to `dst`.
pub async fn ping<B: LinkBackend>(backend: &B, src: &str, dst: Ipv4Addr) -> Result<String, LinkError> {
    let count = PING_COUNT.to_string();
    let interval = PING_INTERVAL_S.to_string();
    let dst = dst.to_string();
    backend
        .exec_in(src, &argv(&["ping", "-c", &count, "-i", &interval, &dst]))
        .await
}

/// Starts a daemonized `iperf3` server in `node` that handles a single
/// client and exits.
pub async fn iperf_server<B: LinkBackend>(backend: &B, node: &str) -> Result<String, LinkError> {
    backend
        .exec_in(node, &argv(&["iperf3", "-s", "-1", "-D"]))
        .await
}

/// `iperf3` client in `src` against a server listening on `dst`.
pub async fn iperf_client<B: LinkBackend>(backend: &B, src: &str, dst: Ipv4Addr) -> Result<String, LinkError> {
    let secs = IPERF_SECONDS.to_string();
    let dst = dst.to_string();
    backend
        .exec_in(src, &argv(&["iperf3", "-c", &dst, "-t", &secs]))
        .await
}

/// Throughput test from `src` to a server started in `server`, both local.
pub async fn iperf<B: LinkBackend>(
    backend: &B,
    src: &str,
    server: &str,
    dst: Ipv4Addr,
) -> Result<String, LinkError> {
    iperf_server(backend, server).await?;
    iperf_client(backend, src, dst).await
}

/// Routing table of a node.
pub async fn route_table<B: LinkBackend>(backend: &B, node: &str) -> Result<String, LinkError> {
    backend.exec_in(node, &argv(&["ip", "route"])).await
}

/// Routes every subnet of the destination through the interface `via`.
///
/// `dst_addrs` is the destination's interface listing; returns the prefixes
/// installed.
pub async fn set_next_hop<B: LinkBackend>(
    backend: &B,
    src: &str,
    dst_addrs: &[(String, IfAddr)],
    via: &str,
) -> Result<Vec<String>, LinkError> {
    let mut installed = Vec::new();
    for (_, addr) in dst_addrs {
        let [a, b, c, _] = addr.addr.octets();
        let prefix = format!("{}.{}.{}.0/{}", a, b, c, addr.prefix_len);
        backend
            .exec_in(src, &argv(&["ip", "route", "replace", &prefix, "dev", via]))
            .await?;
        installed.push(prefix);
    }
    Ok(installed)
}

/// Host CPU and memory snapshot.
pub async fn utility_snapshot() -> Result<String, LinkError> {
    Ok(skymesh_env::run_command::<&str>("vmstat", &[]).await?)
}
