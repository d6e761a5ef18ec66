//! Frame decoding
//!
//! Turns captured link-layer frames into [`Observation`]s. Non-IP frames
//! (ARP, LLDP, ...) decode to `None` and never reach the meter.
//!
//! GTP-U user plane traffic is decapsulated: the observation describes the
//! inner IP packet and carries `tunnel = true`.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice, VlanSlice};

use super::packet::{IpProtocol, Observation, TcpFlags};

/// Decode an Ethernet II frame, honouring single and double 802.1Q tags
///
/// `wire_len` is the original frame length, which may exceed `frame.len()`
/// when the capture was truncated by its snaplen.
pub fn decode_ethernet(frame: &[u8], wire_len: u32, timestamp_ms: u64) -> Option<Observation> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;
    let vlan_id = match &sliced.vlan {
        Some(VlanSlice::SingleVlan(vlan)) => vlan.vlan_identifier().value(),
        Some(VlanSlice::DoubleVlan(vlan)) => vlan.outer().vlan_identifier().value(),
        None => 0,
    };
    build_observation(&sliced, vlan_id, wire_len, timestamp_ms)
}

/// Decode a raw IP packet (no link layer)
pub fn decode_ip(packet: &[u8], wire_len: u32, timestamp_ms: u64) -> Option<Observation> {
    let sliced = SlicedPacket::from_ip(packet).ok()?;
    build_observation(&sliced, 0, wire_len, timestamp_ms)
}

/// GTP-U registered UDP port
const GTP_U_PORT: u16 = 2152;

/// GTP message type carrying a user packet (G-PDU)
const GTP_G_PDU: u8 = 0xff;

fn build_observation(
    sliced: &SlicedPacket<'_>,
    vlan_id: u16,
    wire_len: u32,
    timestamp_ms: u64,
) -> Option<Observation> {
    let inner = gtp_user_packet(sliced)
        .and_then(|packet| SlicedPacket::from_ip(packet).ok())
        .and_then(|inner| build_observation(&inner, vlan_id, wire_len, timestamp_ms));
    if let Some(mut obs) = inner {
        obs.tunnel = true;
        return Some(obs);
    }

    let (src_ip, dst_ip, protocol, ip_size) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(ipv4.payload().ip_number.0),
                u32::from(header.total_len()),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(ipv6.payload().ip_number.0),
                u32::from(header.payload_length()) + 40,
            )
        }
        _ => return None,
    };

    let mut obs = Observation::new(timestamp_ms, src_ip, dst_ip, protocol);
    obs.vlan_id = vlan_id;
    obs.raw_size = wire_len;
    obs.ip_size = ip_size;

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            obs.src_port = tcp.source_port();
            obs.dst_port = tcp.destination_port();
            obs.tcp_flags = TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            };
            obs = obs.with_payload(tcp.payload().to_vec());
        }
        Some(TransportSlice::Udp(udp)) => {
            obs.src_port = udp.source_port();
            obs.dst_port = udp.destination_port();
            obs = obs.with_payload(udp.payload().to_vec());
        }
        Some(TransportSlice::Icmpv4(icmp)) => {
            obs = obs.with_payload(icmp.payload().to_vec());
        }
        Some(TransportSlice::Icmpv6(icmp)) => {
            obs = obs.with_payload(icmp.payload().to_vec());
        }
        _ => {}
    }

    Some(obs)
}

/// Inner IP packet of a GTP-U G-PDU, if `sliced` is one
fn gtp_user_packet<'a>(sliced: &SlicedPacket<'a>) -> Option<&'a [u8]> {
    let Some(TransportSlice::Udp(udp)) = &sliced.transport else {
        return None;
    };
    if udp.source_port() != GTP_U_PORT && udp.destination_port() != GTP_U_PORT {
        return None;
    }
    let payload = udp.payload();
    let (&flags, rest) = payload.split_first()?;
    // Version 1, protocol type GTP
    if (flags >> 5) != 1 || (flags & 0x10) == 0 || *rest.first()? != GTP_G_PDU {
        return None;
    }

    // Mandatory header: flags, type, length (2), TEID (4)
    let mut offset = 8;
    if flags & 0x07 != 0 {
        // Sequence number (2), N-PDU number (1), next extension type (1)
        let mut next_ext = *payload.get(offset + 3)?;
        offset += 4;
        while next_ext != 0 {
            // Extension length is counted in 4-byte units and ends with the next type
            let units = usize::from(*payload.get(offset)?);
            if units == 0 {
                return None;
            }
            offset += units * 4;
            next_ext = *payload.get(offset - 1)?;
        }
    }
    payload.get(offset..).filter(|inner| !inner.is_empty())
}
