//! STUN server (C4): a single-threaded UDP reactor that answers BindReq
//! with MAPPED/SOURCE/CHANGED addresses, replying either from the listener
//! socket or — when CHANGE-REQUEST asks for it — from a forged alternate
//! (IP, port) via the raw-packet forger (C3). Purely reactive: no per-client
//! state survives between datagrams, and nothing is retransmitted.
use std::net::{Ipv4Addr, SocketAddrV4};

use async_std::net::{SocketAddr, UdpSocket};
use async_std::sync::Mutex;
use pnet::transport::TransportSender;

use super::error::StunError;
use super::forge::{self, IpDatagram};
use super::message::{AttrType, AttrValue, Message, MessageType};

const RECV_BUF_SIZE: usize = 2048;
/// Fixed ceiling `K` the alternate port wraps around at when no configured
/// `AlternateEndpoint` is provided (spec §4.4(c): "incremented modulo a
/// fixed ceiling"). Kept comfortably inside the non-reserved, non-ephemeral
/// range.
const DEFAULT_PORT_CEILING: u16 = 60000;

/// A second (IP, port) pair the server can advertise as CHANGED-ADDRESS and
/// reply from when CHANGE-REQUEST asks for an alternate endpoint. Spec §9
/// note 4 and the accompanying Open Question flag that the original never
/// provisions a real second interface; configuring one here is the
/// resolution chosen for this rewrite (see DESIGN.md). Leaving this unset
/// falls back to spec §4.4(c)'s mutate-last-octet/increment-port scheme,
/// reproducing the original's placeholder-only behavior.
#[derive(Clone, Copy, Debug)]
pub struct AlternateEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// A single-threaded UDP reactor bound to one well-known endpoint.
pub struct Server {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    alternate: Option<AlternateEndpoint>,
    port_ceiling: u16,
    // Opened lazily: binding the listener needs no privilege, but a raw
    // AF_INET/SOCK_RAW sender does, and not every deployment ever serves a
    // CHANGE-REQUEST. Pooled per spec §4.4/§5 once opened.
    raw_sender: Mutex<Option<TransportSender>>,
}

impl Server {
    pub async fn bind(local_addr: SocketAddrV4, alternate: Option<AlternateEndpoint>) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(SocketAddr::V4(local_addr))
            .await
            .map_err(StunError::Io)?;
        Ok(Server {
            socket,
            local_addr,
            alternate,
            port_ceiling: DEFAULT_PORT_CEILING,
            raw_sender: Mutex::new(None),
        })
    }

    /// Run the reactor loop forever. A socket error on the listener is
    /// fatal, per spec §7; a codec error from any one datagram is logged
    /// and the loop continues.
    pub async fn serve(&self) -> Result<(), StunError> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await.map_err(StunError::Io)?;
            let peer = match peer {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue, // IPv6 is out of scope (spec §1)
            };
            if let Err(e) = self.handle_datagram(&buf[..n], peer).await {
                log::warn!("dropping malformed datagram from {}: {}", peer, e);
            }
        }
    }

    async fn handle_datagram(&self, buf: &[u8], peer: SocketAddrV4) -> Result<(), StunError> {
        if !Message::is_message(buf) {
            return Ok(());
        }
        let request = Message::parse(buf)?;
        log::debug!("{} -> {:?} from {}", self.local_addr, request.message_type(), peer);
        match request.message_type() {
            MessageType::BindRequest => self.handle_bind_request(&request, peer).await,
            MessageType::ShareSecretRequest => {
                log::debug!("ShareSecretReq from {} accepted as a stub (unimplemented)", peer);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_bind_request(&self, request: &Message, peer: SocketAddrV4) -> Result<(), StunError> {
        let mapped = peer.to_string();
        let source = self.local_addr.to_string();
        // The "changed" address is a placeholder equal to the requester's
        // own endpoint when no second interface is configured — semantically
        // wrong per RFC 3489 but latent, since the classifier never reads
        // it (spec §9 note 4).
        let changed = self
            .alternate
            .map(|a| SocketAddrV4::new(a.ip, a.port).to_string())
            .unwrap_or_else(|| mapped.clone());
        let response = Message::new_bind_response(request.transaction_id(), &mapped, &source, &changed)?;

        let (change_ip, change_port) = match request.get_attribute(AttrType::ChangeRequest) {
            AttrValue::ChangeFlags { change_ip, change_port } => (change_ip, change_port),
            _ => (false, false),
        };

        let raw = response.serialize();
        if !change_ip && !change_port {
            self.socket
                .send_to(&raw, SocketAddr::V4(peer))
                .await
                .map_err(StunError::Io)?;
            return Ok(());
        }

        let alt_source = self.alternate_source(change_ip, change_port);
        let datagram = IpDatagram::new(alt_source, peer, raw);
        let mut guard = self.raw_sender.lock().await;
        if guard.is_none() {
            *guard = Some(forge::open_raw_sender()?);
        }
        forge::send_datagram(guard.as_mut().unwrap(), &datagram)?;
        Ok(())
    }

    /// Compute the source endpoint to reply from when CHANGE-REQUEST asks
    /// for an alternate IP and/or port: the configured [`AlternateEndpoint`]
    /// when one exists, else spec §4.4(c)'s fallback — mutate the local IP's
    /// last octet and/or increment the local port modulo a fixed ceiling.
    fn alternate_source(&self, change_ip: bool, change_port: bool) -> SocketAddrV4 {
        if let Some(alt) = self.alternate {
            let ip = if change_ip { alt.ip } else { *self.local_addr.ip() };
            let port = if change_port { alt.port } else { self.local_addr.port() };
            return SocketAddrV4::new(ip, port);
        }
        let ip = if change_ip {
            mutate_last_octet(*self.local_addr.ip())
        } else {
            *self.local_addr.ip()
        };
        let port = if change_port {
            self.local_addr.port().wrapping_add(1) % self.port_ceiling
        } else {
            self.local_addr.port()
        };
        SocketAddrV4::new(ip, port)
    }
}

fn mutate_last_octet(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, d] = ip.octets();
    let mutated = (d as u16 % 254) as u8 + 1;
    Ipv4Addr::new(a, b, c, mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutate_last_octet_wraps_within_the_valid_host_range() {
        assert_eq!(mutate_last_octet(Ipv4Addr::new(10, 0, 0, 1)), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(mutate_last_octet(Ipv4Addr::new(10, 0, 0, 253)), Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(mutate_last_octet(Ipv4Addr::new(10, 0, 0, 254)), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[async_std::test]
    async fn alternate_source_falls_back_to_mutated_local_endpoint_when_unconfigured() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        let alt = server.alternate_source(false, true);
        assert_eq!(*alt.ip(), *server.local_addr.ip());
        assert_eq!(alt.port(), server.local_addr.port().wrapping_add(1) % DEFAULT_PORT_CEILING);
    }

    #[async_std::test]
    async fn alternate_source_prefers_a_configured_endpoint() {
        let configured = AlternateEndpoint {
            ip: Ipv4Addr::new(198, 51, 100, 9),
            port: 3479,
        };
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Some(configured))
            .await
            .unwrap();
        let alt = server.alternate_source(true, true);
        assert_eq!(*alt.ip(), configured.ip);
        assert_eq!(alt.port(), configured.port);
    }
}
