//! Flow identity
//!
//! A conversation is identified by its protocol, both endpoints and the VLAN
//! it travels on. The key is normalized so both packet orderings of the same
//! conversation produce the same value.

use std::net::IpAddr;

use super::packet::{Direction, IpProtocol, Observation};

/// Normalized 6-tuple identifying a bidirectional flow
///
/// Side `a` is always the lower `(ip, port)` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: IpProtocol,
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub vlan_id: u16,
}

/// Which key side sent a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    A,
    B,
}

impl FlowKey {
    /// Build the key for an observation, along with the side that sent it
    pub fn from_observation(obs: &Observation) -> (Self, KeySide) {
        if (obs.src_ip, obs.src_port) <= (obs.dst_ip, obs.dst_port) {
            (
                Self {
                    protocol: obs.protocol,
                    ip_a: obs.src_ip,
                    ip_b: obs.dst_ip,
                    port_a: obs.src_port,
                    port_b: obs.dst_port,
                    vlan_id: obs.vlan_id,
                },
                KeySide::A,
            )
        } else {
            (
                Self {
                    protocol: obs.protocol,
                    ip_a: obs.dst_ip,
                    ip_b: obs.src_ip,
                    port_a: obs.dst_port,
                    port_b: obs.src_port,
                    vlan_id: obs.vlan_id,
                },
                KeySide::B,
            )
        }
    }
}

impl KeySide {
    /// Direction of a packet sent from `self`, for a flow whose source is `src_side`
    pub fn direction(self, src_side: KeySide) -> Direction {
        if self == src_side {
            Direction::Src2Dst
        } else {
            Direction::Dst2Src
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn make_observation(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Observation {
        Observation::new(
            0,
            IpAddr::V4(Ipv4Addr::from(src)),
            IpAddr::V4(Ipv4Addr::from(dst)),
            IpProtocol::Tcp,
        )
        .with_ports(sport, dport)
    }

    #[test]
    fn test_key_is_commutative() {
        let fwd = make_observation([192, 168, 1, 100], 54321, [10, 0, 0, 1], 80);
        let rev = make_observation([10, 0, 0, 1], 80, [192, 168, 1, 100], 54321);

        let (k1, s1) = FlowKey::from_observation(&fwd);
        let (k2, s2) = FlowKey::from_observation(&rev);

        assert_eq!(k1, k2);
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_direction_follows_first_sender() {
        let first = make_observation([10, 0, 0, 9], 1000, [10, 0, 0, 1], 53);
        let reply = make_observation([10, 0, 0, 1], 53, [10, 0, 0, 9], 1000);

        let (_, src_side) = FlowKey::from_observation(&first);
        let (_, reply_side) = FlowKey::from_observation(&reply);

        assert_eq!(src_side.direction(src_side), Direction::Src2Dst);
        assert_eq!(reply_side.direction(src_side), Direction::Dst2Src);
    }

    #[test]
    fn test_vlan_separates_flows() {
        let a = make_observation([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        let b = a.clone().with_vlan(100);

        assert_ne!(FlowKey::from_observation(&a).0, FlowKey::from_observation(&b).0);
    }

    #[test]
    fn test_same_ip_different_ports() {
        let a = make_observation([10, 0, 0, 1], 5000, [10, 0, 0, 1], 4000);
        let b = make_observation([10, 0, 0, 1], 4000, [10, 0, 0, 1], 5000);
        let (ka, sa) = FlowKey::from_observation(&a);
        let (kb, sb) = FlowKey::from_observation(&b);

        assert_eq!(ka, kb);
        assert_eq!(sa, KeySide::B);
        assert_eq!(sb, KeySide::A);
        assert_eq!(ka.port_a, 4000);
    }
}
