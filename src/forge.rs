//! Raw IPv4+UDP datagram forger (C3). Builds a self-contained datagram byte
//! for byte, including checksums, for transmission through a socket opened
//! with `IPPROTO_RAW` (the kernel will not add its own IP header). Used by
//! the server's alternate-address reply path and by the hole-punch
//! transport's egress path, both of which must emit traffic from an
//! endpoint the OS did not bind for them.
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::{self, TransportChannelType, TransportSender};

use super::error::StunError;

/// IPv4 header length in octets; this crate never emits IP options.
pub const IPV4_HEADER_LEN: usize = 20;
/// UDP header length in octets.
pub const UDP_HEADER_LEN: usize = 8;
/// Default TTL stamped into forged IP headers.
pub const DEFAULT_TTL: u8 = 54;

const PROTO_UDP: u8 = 17;
const RAW_CHANNEL_BUFFER_SIZE: usize = 4096;

/// One's-complement sum of `data` taken two octets at a time, big-endian,
/// folded to 16 bits. An odd trailing octet is treated as the high half of
/// a final word with a zero low half.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// The 16-bit one's-complement checksum of `data` (the bitwise complement of
/// [`ones_complement_sum`]). A result of `0x0000` is returned verbatim: RFC
/// 768 asks implementations to transmit an all-zero UDP checksum as
/// `0xFFFF` instead, since zero means "no checksum"; this toolkit preserves
/// the original's behavior of emitting `0x0000` as computed. This only ever
/// arises for a contrived payload and affects nothing this crate decodes,
/// since neither side here validates inbound checksums.
fn checksum16(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// An outbound-only UDP datagram body, prior to knowing the IPv4 addresses
/// its checksum pseudo-header requires.
#[derive(Clone, Debug)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub fn new(src_port: u16, dst_port: u16, payload: Vec<u8>) -> Self {
        UdpDatagram {
            src_port,
            dst_port,
            payload,
        }
    }

    fn length(&self) -> u16 {
        (UDP_HEADER_LEN + self.payload.len()) as u16
    }

    fn header(&self, checksum: u16) -> [u8; UDP_HEADER_LEN] {
        let mut header = [0u8; UDP_HEADER_LEN];
        header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        header[4..6].copy_from_slice(&self.length().to_be_bytes());
        header[6..8].copy_from_slice(&checksum.to_be_bytes());
        header
    }

    /// Checksum over the IPv4 pseudo-header, the UDP header (with the
    /// checksum field zeroed), and the payload, zero-padded to an even byte
    /// count — per spec §3/§4.3.
    fn checksum(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> u16 {
        let mut buf = Vec::with_capacity(12 + UDP_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&src_addr.octets());
        buf.extend_from_slice(&dst_addr.octets());
        buf.push(0);
        buf.push(PROTO_UDP);
        buf.extend_from_slice(&self.length().to_be_bytes());
        buf.extend_from_slice(&self.header(0));
        buf.extend_from_slice(&self.payload);
        checksum16(&buf)
    }

    /// Serialize to wire bytes: 8-octet header followed by the payload.
    pub fn serialize(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> Vec<u8> {
        let checksum = self.checksum(src_addr, dst_addr);
        let mut out = Vec::with_capacity(UDP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header(checksum));
        out.extend_from_slice(&self.payload);
        out
    }
}

/// An outbound-only IPv4 datagram carrying a [`UdpDatagram`]. Version/IHL is
/// always `0x45` (version 4, 20-octet header, no options); DSCP/ECN, flags,
/// and fragment offset are always zero.
#[derive(Clone, Debug)]
pub struct IpDatagram {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub id: u16,
    pub ttl: u8,
    pub udp: UdpDatagram,
}

impl IpDatagram {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, payload: Vec<u8>) -> Self {
        IpDatagram {
            src_addr: *src.ip(),
            dst_addr: *dst.ip(),
            id: rand::random(),
            ttl: DEFAULT_TTL,
            udp: UdpDatagram::new(src.port(), dst.port(), payload),
        }
    }

    /// Serialize to the 20-octet IPv4 header followed by the full UDP
    /// datagram. `total_length` is `20 + 8 + |payload|`.
    pub fn serialize(&self) -> Vec<u8> {
        let udp_bytes = self.udp.serialize(self.src_addr, self.dst_addr);
        let total_length = (IPV4_HEADER_LEN + udp_bytes.len()) as u16;

        let mut header = [0u8; IPV4_HEADER_LEN];
        header[0] = (4u8 << 4) | 5; // version 4, IHL 5 words (0x45)
        header[1] = 0; // DSCP/ECN
        header[2..4].copy_from_slice(&total_length.to_be_bytes());
        header[4..6].copy_from_slice(&self.id.to_be_bytes());
        header[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags=0, fragment offset=0
        header[8] = self.ttl;
        header[9] = PROTO_UDP;
        header[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, zeroed for computation
        header[12..16].copy_from_slice(&self.src_addr.octets());
        header[16..20].copy_from_slice(&self.dst_addr.octets());
        let checksum = checksum16(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());

        let mut out = Vec::with_capacity(IPV4_HEADER_LEN + udp_bytes.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&udp_bytes);
        out
    }
}

/// Open a raw `AF_INET/SOCK_RAW` sender for UDP payloads. Requires elevated
/// privileges on most platforms. Callers are expected to serialize sends
/// across a single shared sender (see `server::Server` and
/// `holepunch::P2pConn`, both of which hold this behind an async mutex).
pub fn open_raw_sender() -> Result<TransportSender, StunError> {
    let protocol = TransportChannelType::Layer3(IpNextHeaderProtocols::Udp);
    let (sender, _receiver) = transport::transport_channel(RAW_CHANNEL_BUFFER_SIZE, protocol)
        .map_err(StunError::Io)?;
    Ok(sender)
}

/// Forge `datagram` and transmit it on `sender`.
pub fn send_datagram(sender: &mut TransportSender, datagram: &IpDatagram) -> Result<usize, StunError> {
    let raw = datagram.serialize();
    let packet = Ipv4Packet::new(&raw)
        .ok_or_else(|| StunError::InvalidAddress("forged IPv4 datagram is malformed".to_string()))?;
    sender
        .send_to(packet, IpAddr::V4(datagram.dst_addr))
        .map_err(StunError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_header_checksum_satisfies_ones_complement_invariant() {
        let datagram = IpDatagram::new(
            SocketAddrV4::new(Ipv4Addr::new(153, 19, 8, 104), 1087),
            SocketAddrV4::new(Ipv4Addr::new(171, 3, 14, 11), 13),
            b"TESTING".to_vec(),
        );
        let raw = datagram.serialize();
        let header = &raw[..IPV4_HEADER_LEN];
        // property 5: the one's-complement sum of the emitted header (with
        // its own checksum field filled in) folds to 0xFFFF.
        assert_eq!(ones_complement_sum(header), 0xFFFF);
    }

    #[test]
    fn ip_header_packs_version_and_ihl_as_0x45() {
        let datagram = IpDatagram::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 2),
            vec![],
        );
        let raw = datagram.serialize();
        assert_eq!(raw[0], 0x45);
    }

    #[test]
    fn total_length_field_covers_ip_and_udp_headers_and_payload() {
        let payload = b"hello".to_vec();
        let datagram = IpDatagram::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 2),
            payload.clone(),
        );
        let raw = datagram.serialize();
        let total_length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        assert_eq!(total_length, IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len());
        assert_eq!(raw.len(), total_length);
    }

    #[test]
    fn s5_udp_checksum_over_testing_payload_satisfies_invariant() {
        // S5: src 153.19.8.104:1087, dst 171.3.14.11:13, payload "TESTING".
        let src = Ipv4Addr::new(153, 19, 8, 104);
        let dst = Ipv4Addr::new(171, 3, 14, 11);
        let udp = UdpDatagram::new(1087, 13, b"TESTING".to_vec());
        assert_eq!(udp.length(), 15);
        let serialized = udp.serialize(src, dst);

        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&src.octets());
        pseudo.extend_from_slice(&dst.octets());
        pseudo.push(0);
        pseudo.push(17);
        pseudo.extend_from_slice(&15u16.to_be_bytes());
        pseudo.extend_from_slice(&serialized);
        // property 6: pseudo-header ++ header (now with real checksum) ++
        // payload folds to 0xFFFF under the same one's-complement sum,
        // unless the computed checksum was the 0x0000 special case.
        let fold = ones_complement_sum(&pseudo);
        assert!(fold == 0xFFFF || fold == 0x0000);
    }

    #[test]
    fn odd_length_buffer_pads_trailing_octet_as_high_byte() {
        let odd = [0x01u8, 0x02, 0x03];
        let even = [0x01u8, 0x02, 0x03, 0x00];
        assert_eq!(ones_complement_sum(&odd), ones_complement_sum(&even));
    }
}
