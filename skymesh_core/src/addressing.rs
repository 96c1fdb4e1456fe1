//! OS-level addressing derived from link indices.
//!
//! Every link owns a `/24`: ISLs under `10.0.0.0/8`, GSLs under `9.0.0.0/8`,
//! with the index split over the second and third octets. Endpoint `a` takes
//! host `.10`, endpoint `b` takes `.40`. Inter-machine links are VXLAN
//! tunnels keyed by `index + 1`.

use std::net::Ipv4Addr;

use crate::model::{Link, LinkKind, NodeId};

/// VXLAN UDP destination port.
pub const VXLAN_PORT: u16 = 4789;

/// Prefix length of every link subnet.
pub const LINK_PREFIX_LEN: u8 = 24;

const HOST_A: u8 = 10;
const HOST_B: u8 = 40;

/// Which end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Network address of a link's subnet.
pub fn subnet(kind: LinkKind, index: u32) -> Ipv4Addr {
    let first = match kind {
        LinkKind::Isl => 10,
        LinkKind::Gsl => 9,
    };
    Ipv4Addr::new(first, (index >> 8) as u8, (index & 0xff) as u8, 0)
}

/// Address of one endpoint.
pub fn endpoint_addr(kind: LinkKind, index: u32, side: Side) -> Ipv4Addr {
    let [a, b, c, _] = subnet(kind, index).octets();
    let host = match side {
        Side::A => HOST_A,
        Side::B => HOST_B,
    };
    Ipv4Addr::new(a, b, c, host)
}

/// VXLAN network identifier of a link: the link index itself.
pub fn vni(index: u32) -> u32 {
    index
}

/// Name of the interface inside `node` facing `peer`.
pub fn interface_name(peer: NodeId) -> String {
    peer.to_string()
}

/// Root-namespace name used while a tunnel is created, before it is moved
/// into its node.
pub fn staging_name(index: u32) -> String {
    format!("vx{}", index)
}

/// Which side of `link` `node` is.
pub fn side_of(link: &Link, node: NodeId) -> Option<Side> {
    if link.a == node {
        Some(Side::A)
    } else if link.b == node {
        Some(Side::B)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnets_split_index_over_octets() {
        assert_eq!(subnet(LinkKind::Isl, 0), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(subnet(LinkKind::Isl, 258), Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(subnet(LinkKind::Gsl, 65535), Ipv4Addr::new(9, 255, 255, 0));
    }

    #[test]
    fn test_endpoint_hosts() {
        assert_eq!(endpoint_addr(LinkKind::Isl, 3, Side::A), Ipv4Addr::new(10, 0, 3, 10));
        assert_eq!(endpoint_addr(LinkKind::Gsl, 3, Side::B), Ipv4Addr::new(9, 0, 3, 40));
    }

    #[test]
    fn test_interface_and_tunnel_names() {
        assert_eq!(interface_name(NodeId::sat(0, 1, 2)), "SH1O2S3");
        assert_eq!(staging_name(77), "vx77");
        assert_eq!(vni(0), 0);
        assert_eq!(vni(77), 77);

        let link = Link::new(1, NodeId::Ground(0), NodeId::sat(0, 0, 0), 1.0);
        assert_eq!(side_of(&link, NodeId::Ground(0)), Some(Side::A));
        assert_eq!(side_of(&link, NodeId::sat(0, 0, 0)), Some(Side::B));
        assert_eq!(side_of(&link, NodeId::Ground(1)), None);
    }
}
