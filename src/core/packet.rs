//! Decoded packet observations
//!
//! An [`Observation`] is one captured packet reduced to the fields flow
//! metering needs. Packet sources produce them; the meter consumes each
//! one immediately.

use std::net::IpAddr;
use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }
}

/// Packet direction relative to the side that opened the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the flow's source (the sender of its first packet)
    #[default]
    Src2Dst,
    /// Sent by the flow's destination
    Dst2Src,
}

impl Direction {
    pub fn as_u8(self) -> u8 {
        match self {
            Direction::Src2Dst => 0,
            Direction::Dst2Src => 1,
        }
    }
}

/// One decoded packet
#[derive(Debug, Clone)]
pub struct Observation {
    /// Capture timestamp (milliseconds since the epoch)
    pub timestamp_ms: u64,
    /// Transport protocol
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// 802.1Q VLAN id (0 when untagged)
    pub vlan_id: u16,
    /// Packet was carried inside a tunnel
    pub tunnel: bool,
    /// Frame length on the wire
    pub raw_size: u32,
    /// IP packet length, header included
    pub ip_size: u32,
    /// Transport payload length
    pub payload_size: u32,
    /// TCP flags (all clear for non-TCP)
    pub tcp_flags: TcpFlags,
    /// Transport payload bytes, for classifiers and plugins
    pub payload: Vec<u8>,
    /// Direction within its flow, filled in by the meter
    pub direction: Direction,
}

impl Observation {
    /// Create an observation with minimal info; sizes and ports start at zero
    pub fn new(timestamp_ms: u64, src_ip: IpAddr, dst_ip: IpAddr, protocol: IpProtocol) -> Self {
        Self {
            timestamp_ms,
            protocol,
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            vlan_id: 0,
            tunnel: false,
            raw_size: 0,
            ip_size: 0,
            payload_size: 0,
            tcp_flags: TcpFlags::default(),
            payload: Vec::new(),
            direction: Direction::Src2Dst,
        }
    }

    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn with_sizes(mut self, raw_size: u32, ip_size: u32) -> Self {
        self.raw_size = raw_size;
        self.ip_size = ip_size;
        self
    }

    pub fn with_tcp_flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    pub fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    /// Attach payload bytes; `payload_size` follows the slice length
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_size = payload.len() as u32;
        self.payload = payload;
        self
    }

    /// IP version (4 or 6)
    pub fn version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }
}

/// True for private, loopback and link-local addresses
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_tcp_flags_roundtrip_bits() {
        let flags = TcpFlags::from_u8(0x12);
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert_eq!(flags.to_u8(), 0x12);
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(47), IpProtocol::Other(47));
        assert_eq!(u8::from(IpProtocol::Udp), 17);
    }

    #[test]
    fn test_observation_version() {
        let v4 = Observation::new(
            0,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpProtocol::Udp,
        );
        assert_eq!(v4.version(), 4);

        let v6 = Observation::new(
            0,
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpProtocol::Udp,
        )
        .with_payload(vec![1, 2, 3]);
        assert_eq!(v6.version(), 6);
        assert_eq!(v6.payload_size, 3);
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(172, 31, 3, 224))));
        assert!(!is_private_ip(&IpAddr::V4(Ipv4Addr::new(216, 58, 212, 100))));
        assert!(is_private_ip(&"fd00::1".parse().unwrap()));
        assert!(!is_private_ip(&"2001:4860::8888".parse().unwrap()));
    }
}
