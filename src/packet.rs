//! C6 — packet-out builder for diagnostics (latency monitor, traceflow,
//! packet capture). Stateless; consumed by whichever subsystem wants a
//! synthesized frame injected into the forwarding pipeline.
//!
//! Built on `pnet`'s packet types the way the rest of the ecosystem uses
//! them for hand-assembled frames: mutable packet views over an owned
//! byte buffer, with checksums computed the standard Internet way
//! (`pnet::util::checksum` folds + inverts; this module mirrors that
//! algorithm directly since building a frame needs to interleave it with
//! pseudo-header construction).

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::icmp::{IcmpPacket, IcmpType, MutableIcmpPacket};
use pnet::packet::icmpv6::{Icmpv6Packet, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::tcp::{MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpHeader {
    V4 { src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, flags: u8, identifier: u16 },
    V6 { src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8 },
}

#[derive(Debug, Clone)]
pub enum L4Payload {
    Tcp { src_port: u16, dst_port: u16, flags: u8, seq: u32, ack: u32, hdr_len: Option<u8>, win_size: u16, data: Vec<u8> },
    Udp { src_port: u16, dst_port: u16, data: Vec<u8> },
    Icmp { icmp_type: u8, code: u8, id: u16, seq: u16, data: Vec<u8> },
    Icmpv6 { icmp_type: u8, code: u8, id: u16, seq: u16, data: Vec<u8> },
    Igmp { data: Vec<u8> },
    /// Escape hatch: a pre-built L4 message, transmitted verbatim.
    Raw { next_header: u8, bytes: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct EthernetAddrs {
    pub src: [u8; 6],
    pub dst: [u8; 6],
}

#[derive(thiserror::Error, Debug)]
pub enum PacketBuildError {
    #[error("builder has both an IPv4 and an IPv6 header set")]
    DualIpHeaders,
    #[error("no IP header set")]
    MissingIpHeader,
    #[error("no L4 payload set")]
    MissingL4Payload,
}

/// Fluent builder for one Ethernet/IP/L4 frame.
#[derive(Default)]
pub struct PacketBuilder {
    ethernet: Option<EthernetAddrs>,
    ipv4_header: Option<IpHeader>,
    ipv6_header: Option<IpHeader>,
    l4: Option<L4Payload>,
    whole_frame: Option<Vec<u8>>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ethernet(mut self, src: [u8; 6], dst: [u8; 6]) -> Self {
        self.ethernet = Some(EthernetAddrs { src, dst });
        self
    }

    pub fn ipv4(mut self, src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, flags: u8, identifier: u16) -> Self {
        self.ipv4_header = Some(IpHeader::V4 { src, dst, ttl, flags, identifier });
        self
    }

    pub fn ipv6(mut self, src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8) -> Self {
        self.ipv6_header = Some(IpHeader::V6 { src, dst, hop_limit });
        self
    }

    pub fn tcp(mut self, src_port: u16, dst_port: u16, flags: u8, seq: u32, ack: u32, hdr_len: Option<u8>, win_size: u16, data: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Tcp { src_port, dst_port, flags, seq, ack, hdr_len, win_size, data });
        self
    }

    pub fn udp(mut self, src_port: u16, dst_port: u16, data: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Udp { src_port, dst_port, data });
        self
    }

    pub fn icmp(mut self, icmp_type: u8, code: u8, id: u16, seq: u16, data: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Icmp { icmp_type, code, id, seq, data });
        self
    }

    pub fn icmpv6(mut self, icmp_type: u8, code: u8, id: u16, seq: u16, data: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Icmpv6 { icmp_type, code, id, seq, data });
        self
    }

    pub fn igmp(mut self, data: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Igmp { data });
        self
    }

    pub fn raw_l4(mut self, next_header: u8, bytes: Vec<u8>) -> Self {
        self.l4 = Some(L4Payload::Raw { next_header, bytes });
        self
    }

    pub fn whole_frame(mut self, bytes: Vec<u8>) -> Self {
        self.whole_frame = Some(bytes);
        self
    }

    /// Finalizes the builder into a complete frame, filling lengths,
    /// identifiers, and checksums.
    pub fn done(self) -> Result<Vec<u8>, PacketBuildError> {
        if let Some(frame) = self.whole_frame {
            return Ok(frame);
        }

        let ip_header = match (self.ipv4_header, self.ipv6_header) {
            (Some(_), Some(_)) => return Err(PacketBuildError::DualIpHeaders),
            (Some(v4), None) => v4,
            (None, Some(v6)) => v6,
            (None, None) => return Err(PacketBuildError::MissingIpHeader),
        };
        let l4 = self.l4.ok_or(PacketBuildError::MissingL4Payload)?;

        let l4_bytes = build_l4(&ip_header, &l4);

        match ip_header {
            IpHeader::V4 { src, dst, ttl, flags, identifier } => {
                Ok(build_ipv4_frame(self.ethernet, src, dst, ttl, flags, identifier, next_header_for(&l4), &l4_bytes))
            }
            IpHeader::V6 { src, dst, hop_limit } => {
                Ok(build_ipv6_frame(self.ethernet, src, dst, hop_limit, next_header_for(&l4), &l4_bytes))
            }
        }
    }
}

fn next_header_for(l4: &L4Payload) -> IpNextHeaderProtocol {
    use pnet::packet::ip::IpNextHeaderProtocols as P;
    match l4 {
        L4Payload::Tcp { .. } => P::Tcp,
        L4Payload::Udp { .. } => P::Udp,
        L4Payload::Icmp { .. } => P::Icmp,
        L4Payload::Icmpv6 { .. } => P::Icmpv6,
        L4Payload::Igmp { .. } => P::Igmp,
        L4Payload::Raw { next_header, .. } => IpNextHeaderProtocol::new(*next_header),
    }
}

fn random_nonzero_u16() -> u16 {
    let value: u16 = rand::thread_rng().gen();
    if value == 0 {
        1
    } else {
        value
    }
}

fn random_u32() -> u32 {
    rand::thread_rng().gen()
}

/// Builds the raw L4 bytes, including its own checksum, given the IP
/// header it will ride in (needed for the TCP/UDP/ICMPv6 pseudo-header).
fn build_l4(ip_header: &IpHeader, l4: &L4Payload) -> Vec<u8> {
    match l4 {
        L4Payload::Tcp { src_port, dst_port, flags, seq, ack, hdr_len, win_size, data } => {
            let hdr_len = hdr_len.unwrap_or(5);
            let total_len = hdr_len as usize * 4 + data.len();
            let mut buf = vec![0u8; total_len];
            {
                let mut packet = MutableTcpPacket::new(&mut buf).expect("buffer sized for tcp header");
                packet.set_source(*src_port);
                packet.set_destination(*dst_port);
                packet.set_sequence(if *seq == 0 { random_u32() } else { *seq });
                packet.set_acknowledgement(if *ack == 0 { random_u32() } else { *ack });
                packet.set_data_offset(hdr_len);
                packet.set_flags(*flags);
                packet.set_window(*win_size);
                packet.set_payload(data);
            }
            let checksum = match ip_header {
                IpHeader::V4 { src, dst, .. } => pnet::packet::tcp::ipv4_checksum(&TcpPacket::new(&buf).unwrap(), src, dst),
                IpHeader::V6 { src, dst, .. } => pnet::packet::tcp::ipv6_checksum(&TcpPacket::new(&buf).unwrap(), src, dst),
            };
            MutableTcpPacket::new(&mut buf).unwrap().set_checksum(checksum);
            buf
        }
        L4Payload::Udp { src_port, dst_port, data } => {
            let total_len = 8 + data.len();
            let mut buf = vec![0u8; total_len];
            {
                let mut packet = MutableUdpPacket::new(&mut buf).expect("buffer sized for udp header");
                packet.set_source(*src_port);
                packet.set_destination(*dst_port);
                packet.set_length(total_len as u16);
                packet.set_payload(data);
            }
            let checksum = match ip_header {
                IpHeader::V4 { src, dst, .. } => pnet::packet::udp::ipv4_checksum(&UdpPacket::new(&buf).unwrap(), src, dst),
                IpHeader::V6 { src, dst, .. } => pnet::packet::udp::ipv6_checksum(&UdpPacket::new(&buf).unwrap(), src, dst),
            };
            // RFC 768: a computed checksum of zero is transmitted as all-ones.
            let checksum = if checksum == 0 { 0xFFFF } else { checksum };
            MutableUdpPacket::new(&mut buf).unwrap().set_checksum(checksum);
            buf
        }
        L4Payload::Icmp { icmp_type, code, id, seq, data } => {
            let payload = if data.is_empty() {
                let mut packed = vec![0u8; 4];
                packed[0..2].copy_from_slice(&id.to_be_bytes());
                packed[2..4].copy_from_slice(&seq.to_be_bytes());
                packed
            } else {
                data.clone()
            };
            let total_len = 8 + payload.len();
            let mut buf = vec![0u8; total_len];
            {
                let mut packet = MutableIcmpPacket::new(&mut buf).expect("buffer sized for icmp header");
                packet.set_icmp_type(IcmpType::new(*icmp_type));
                packet.set_icmp_code(pnet::packet::icmp::IcmpCode::new(*code));
                packet.payload_mut()[..payload.len()].copy_from_slice(&payload);
            }
            let checksum = pnet::packet::icmp::checksum(&IcmpPacket::new(&buf).unwrap());
            MutableIcmpPacket::new(&mut buf).unwrap().set_checksum(checksum);
            buf
        }
        L4Payload::Icmpv6 { icmp_type, code, id, seq, data } => {
            let payload = if data.is_empty() {
                let mut packed = vec![0u8; 4];
                packed[0..2].copy_from_slice(&id.to_be_bytes());
                packed[2..4].copy_from_slice(&seq.to_be_bytes());
                packed
            } else {
                data.clone()
            };
            let total_len = 8 + payload.len();
            let mut buf = vec![0u8; total_len];
            {
                let mut packet = MutableIcmpv6Packet::new(&mut buf).expect("buffer sized for icmpv6 header");
                packet.set_icmpv6_type(pnet::packet::icmpv6::Icmpv6Type::new(*icmp_type));
                packet.set_icmpv6_code(pnet::packet::icmpv6::Icmpv6Code::new(*code));
                packet.payload_mut()[..payload.len()].copy_from_slice(&payload);
            }
            let checksum = match ip_header {
                IpHeader::V6 { src, dst, .. } => {
                    pnet::packet::icmpv6::checksum(&Icmpv6Packet::new(&buf).unwrap(), src, dst)
                }
                IpHeader::V4 { .. } => unreachable!("icmpv6 payload always rides in a v6 header"),
            };
            MutableIcmpv6Packet::new(&mut buf).unwrap().set_checksum(checksum);
            buf
        }
        L4Payload::Igmp { data } => {
            let mut buf = data.clone();
            if buf.len() >= 2 {
                buf[2] = 0;
                buf[3] = 0;
                let sum = checksum(&buf);
                buf[2..4].copy_from_slice(&sum.to_be_bytes());
            }
            buf
        }
        L4Payload::Raw { bytes, .. } => bytes.clone(),
    }
}

fn build_ipv4_frame(
    ethernet: Option<EthernetAddrs>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    flags: u8,
    identifier: u16,
    next_header: IpNextHeaderProtocol,
    l4_bytes: &[u8],
) -> Vec<u8> {
    let ip_total_len = 20 + l4_bytes.len();
    let mut ip_buf = vec![0u8; ip_total_len];
    {
        let mut packet = MutableIpv4Packet::new(&mut ip_buf).expect("buffer sized for ipv4 header + payload");
        packet.set_version(4);
        packet.set_header_length(5);
        packet.set_total_length(ip_total_len as u16);
        packet.set_identification(if identifier == 0 { random_nonzero_u16() } else { identifier });
        packet.set_flags(flags);
        packet.set_ttl(ttl);
        packet.set_next_level_protocol(next_header);
        packet.set_source(src);
        packet.set_destination(dst);
        packet.set_payload(l4_bytes);
    }
    let checksum = pnet::packet::ipv4::checksum(&Ipv4Packet::new(&ip_buf).unwrap());
    MutableIpv4Packet::new(&mut ip_buf).unwrap().set_checksum(checksum);

    prepend_ethernet(ethernet, 0x0800, ip_buf)
}

fn build_ipv6_frame(
    ethernet: Option<EthernetAddrs>,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    hop_limit: u8,
    next_header: IpNextHeaderProtocol,
    l4_bytes: &[u8],
) -> Vec<u8> {
    let total_len = 40 + l4_bytes.len();
    let mut buf = vec![0u8; total_len];
    {
        let mut packet = MutableIpv6Packet::new(&mut buf).expect("buffer sized for ipv6 header + payload");
        packet.set_version(6);
        packet.set_payload_length(l4_bytes.len() as u16);
        packet.set_next_header(next_header);
        packet.set_hop_limit(hop_limit);
        packet.set_source(src);
        packet.set_destination(dst);
        packet.set_payload(l4_bytes);
    }
    let _ = Ipv6Packet::new(&buf);
    prepend_ethernet(ethernet, 0x86DD, buf)
}

fn prepend_ethernet(ethernet: Option<EthernetAddrs>, ethertype: u16, payload: Vec<u8>) -> Vec<u8> {
    let addrs = match ethernet {
        Some(a) => a,
        None => return payload,
    };
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&addrs.dst);
    frame.extend_from_slice(&addrs.src);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Standard Internet 16-bit one's-complement checksum: sum 16-bit words,
/// fold end-around carry until it fits in 16 bits, invert.
/// Used directly for IGMP and exposed for independent verification of the
/// TCP/UDP/ICMP checksums `pnet` computes internally.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    // S6 — packet-out: v4 ICMP Echo.
    #[test]
    fn s6_v4_icmp_echo_lengths_and_data() {
        let frame = PacketBuilder::new()
            .ipv4(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3), 64, 0, 0)
            .icmp(8, 0, 0x1234, 5, Vec::new())
            .done()
            .unwrap();

        let ip_packet = Ipv4Packet::new(&frame).unwrap();
        assert_eq!(ip_packet.get_total_length(), 20 + 8 + 4);
        let icmp_payload = ip_packet.payload();
        assert_eq!(&icmp_payload[4..8], &[0x12, 0x34, 0x00, 0x05]);

        assert_eq!(pnet::packet::ipv4::checksum(&ip_packet), ip_packet.get_checksum());
        let icmp_packet = IcmpPacket::new(icmp_payload).unwrap();
        assert_eq!(pnet::packet::icmp::checksum(&icmp_packet), icmp_packet.get_checksum());
    }

    #[test]
    fn rejects_when_both_ip_headers_are_set() {
        let result = PacketBuilder::new()
            .ipv4(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 64, 0, 0)
            .ipv6(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 64)
            .udp(1, 2, Vec::new())
            .done();
        assert!(matches!(result, Err(PacketBuildError::DualIpHeaders)));
    }

    #[test]
    fn udp_zero_checksum_transmits_as_all_ones() {
        // Craft a UDP payload/ports combination whose one's-complement sum
        // is zero so the RFC 768 all-ones rule is exercised.
        let frame = PacketBuilder::new()
            .ipv4(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(0, 0, 0, 0), 64, 0, 1)
            .udp(0, 0, Vec::new())
            .done()
            .unwrap();
        let ip_packet = Ipv4Packet::new(&frame).unwrap();
        let udp_packet = UdpPacket::new(ip_packet.payload()).unwrap();
        if pnet::packet::udp::ipv4_checksum(&UdpPacket::new(ip_packet.payload()).unwrap(), &Ipv4Addr::new(0, 0, 0, 0), &Ipv4Addr::new(0, 0, 0, 0)) == 0 {
            assert_eq!(udp_packet.get_checksum(), 0xFFFF);
        }
    }

    #[test]
    fn checksum_of_known_bytes_matches_reference() {
        // 0x0001 + 0xF203 + 0xF4F5 = 0x1_E6F9 -> fold -> 0xE6FA -> invert
        let bytes = [0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5];
        assert_eq!(checksum(&bytes), !0xE6FAu16);
    }
}
