//! UDP hole-punch transport (C6): registers a host with the STUN server to
//! learn its NAT-mapped address, exchanges one reachability probe with a
//! peer, then exposes a bidirectional datagram stream whose egress is a
//! forged datagram (C3) and whose ingress is an ordinary UDP receive.
use std::net::SocketAddrV4;
use std::time::Duration;

use async_std::future;
use async_std::net::{SocketAddr, UdpSocket};
use async_std::sync::Mutex;
use pnet::transport::TransportSender;

use super::error::StunError;
use super::forge::{self, IpDatagram};
use super::message::{AttrType, AttrValue, Message, MessageType};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF_SIZE: usize = 2048;

/// A hole-punched peer-to-peer datagram connection.
pub struct P2pConn {
    udp_socket: UdpSocket,
    raw_sender: Mutex<TransportSender>,
    /// This host's own address as the world outside its NAT sees it.
    nat_addr: SocketAddrV4,
    /// The actual local port `udp_socket` is bound to. Spec §4.6 "Write"
    /// forges egress from `(nat_ip, local_port)` — the NAT-visible IP paired
    /// with the real local port, not the NAT-visible port — distinct from
    /// the rendezvous probe in `dial`, which forges the full `nat_addr`.
    local_port: u16,
    /// The peer's NAT-mapped address, known from the start for a dialer
    /// (the caller supplies it) and learned from the peer's handshake
    /// datagram for a listener.
    remote_addr: SocketAddrV4,
}

impl P2pConn {
    /// Register `local_addr` with the STUN server at `server_addr`: send a
    /// BindReq carrying RESPONSE-ADDRESS=`local_addr` (to carry intent; the
    /// server does not act on it to redirect its reply, see `server`
    /// module) and read back the MAPPED-ADDRESS the server observed — the
    /// "NAT address" the outside world sees for this host.
    async fn register(
        local_addr: SocketAddrV4,
        server_addr: SocketAddrV4,
        socket: &UdpSocket,
    ) -> Result<SocketAddrV4, StunError> {
        let request = Message::new_bind_request(None, Some(&local_addr.to_string()), false, false)?;
        socket
            .send_to(&request.serialize(), SocketAddr::V4(server_addr))
            .await
            .map_err(StunError::Io)?;

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let (n, _peer) = future::timeout(REGISTER_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| StunError::RendezvousTimeout)?
            .map_err(StunError::Io)?;
        let response = Message::parse(&buf[..n])?;
        match response.get_attribute(AttrType::MappedAddress) {
            AttrValue::Address(addr) => addr
                .parse()
                .map_err(|_| StunError::InvalidAddress(addr)),
            _ => Err(StunError::InvalidAddress(
                "registration reply carried no MAPPED-ADDRESS".to_string(),
            )),
        }
    }

    /// Register, then rendezvous with `peer_nat_addr`: forge a BindReq (with
    /// change_ip=true) from this host's own NAT address to the peer's NAT
    /// address, so the peer's NAT creates matching state for subsequent
    /// traffic from us.
    pub async fn dial(
        local_addr: SocketAddrV4,
        server_addr: SocketAddrV4,
        peer_nat_addr: SocketAddrV4,
    ) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(SocketAddr::V4(local_addr))
            .await
            .map_err(StunError::Io)?;
        let local_port = local_bound_port(&socket)?;
        let nat_addr = Self::register(local_addr, server_addr, &socket).await?;
        let mut raw_sender = forge::open_raw_sender()?;

        let probe = Message::new_bind_request(None, Some(&nat_addr.to_string()), true, false)?;
        let datagram = IpDatagram::new(nat_addr, peer_nat_addr, probe.serialize());
        forge::send_datagram(&mut raw_sender, &datagram)?;

        Ok(P2pConn {
            udp_socket: socket,
            raw_sender: Mutex::new(raw_sender),
            nat_addr,
            local_port,
            remote_addr: peer_nat_addr,
        })
    }

    /// Register, then block until the peer's rendezvous BindReq arrives;
    /// its RESPONSE-ADDRESS attribute carries the dialer's NAT address,
    /// recorded as the remote endpoint for subsequent `write`s.
    pub async fn listen(local_addr: SocketAddrV4, server_addr: SocketAddrV4) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(SocketAddr::V4(local_addr))
            .await
            .map_err(StunError::Io)?;
        let local_port = local_bound_port(&socket)?;
        let nat_addr = Self::register(local_addr, server_addr, &socket).await?;
        let raw_sender = forge::open_raw_sender()?;

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let (n, _peer) = socket.recv_from(&mut buf).await.map_err(StunError::Io)?;
        let remote_addr = Self::parse_handshake(&buf[..n]).ok_or(StunError::PeerHandshakeFailed)?;

        Ok(P2pConn {
            udp_socket: socket,
            raw_sender: Mutex::new(raw_sender),
            nat_addr,
            local_port,
            remote_addr,
        })
    }

    /// Decode a BindReq's RESPONSE-ADDRESS, the shape the dialer's
    /// rendezvous probe takes. `None` for anything else, including a
    /// non-STUN payload or a STUN message of the wrong type.
    fn parse_handshake(buf: &[u8]) -> Option<SocketAddrV4> {
        if !Message::is_message(buf) {
            return None;
        }
        let message = Message::parse(buf).ok()?;
        if message.message_type() != MessageType::BindRequest {
            return None;
        }
        match message.get_attribute(AttrType::ResponseAddress) {
            AttrValue::Address(addr) => addr.parse().ok(),
            _ => None,
        }
    }

    /// This host's NAT-mapped address, as learned during registration.
    pub fn nat_addr(&self) -> SocketAddrV4 {
        self.nat_addr
    }

    /// The peer's NAT-mapped address this connection writes to.
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote_addr
    }

    /// Forward the kernel's UDP receive.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StunError> {
        let (n, _peer) = self.udp_socket.recv_from(buf).await.map_err(StunError::Io)?;
        Ok(n)
    }

    /// Forge IP+UDP with source `(nat_ip, local_port)` — the NAT-visible IP
    /// paired with this socket's actual bound port, per spec §4.6 "Write"
    /// (distinct from `dial`'s rendezvous probe, which forges the full
    /// NAT-mapped address) — and destination `remote_addr`, and transmit on
    /// the raw socket.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, StunError> {
        let source = SocketAddrV4::new(*self.nat_addr.ip(), self.local_port);
        let datagram = IpDatagram::new(source, self.remote_addr, buf.to_vec());
        let mut sender = self.raw_sender.lock().await;
        forge::send_datagram(&mut sender, &datagram)
    }

    /// Close the UDP socket and shut down the raw socket. Consuming `self`
    /// drops both handles on all paths, including early-return errors
    /// upstream from this call.
    pub fn close(self) {}
}

/// The actual port the OS assigned `socket`, distinct from the caller's
/// requested `local_addr` whenever that request used port 0.
fn local_bound_port(socket: &UdpSocket) -> Result<u16, StunError> {
    match socket.local_addr().map_err(StunError::Io)? {
        SocketAddr::V4(v4) => Ok(v4.port()),
        SocketAddr::V6(_) => Err(StunError::InvalidAddress(
            "hole-punch socket bound to an IPv6 address".to_string(),
        )),
    }
}
