use thiserror::Error;

/// Errors surfaced by the codec, server, classifier, and hole-punch transport.
#[derive(Error, Debug)]
pub enum StunError {
    /// The buffer is shorter than the 20-octet header, or the message type is
    /// not one of the six recognized codes.
    #[error("buffer is not a valid STUN message header")]
    BadHeader,
    /// An address string could not be parsed, or an address attribute value
    /// was shorter than 8 octets.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// A classifier test's ten-second deadline elapsed with no response.
    #[error("no response before the rendezvous deadline")]
    RendezvousTimeout,
    /// A socket operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The first datagram received by a hole-punch listener was not a
    /// `BindReq` carrying a RESPONSE-ADDRESS attribute.
    #[error("peer handshake failed: expected a BindReq with RESPONSE-ADDRESS")]
    PeerHandshakeFailed,
}
