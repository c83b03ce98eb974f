//! Codec for the 8-octet MAPPED-ADDRESS wire form used by every address
//! attribute in the legacy dialect (RFC 3489 §11.2.1). Only IPv4 is
//! supported; the family octet is always 0x0001.
use std::net::Ipv4Addr;

use super::error::StunError;

/// IPv4 address family, as written into the second octet of the attribute
/// value. The leading octet is reserved and always zero, so on the wire the
/// pair reads `[0x00, 0x01]` — indistinguishable from a naive "family in the
/// first two octets" encoding, but the zero byte is reserved padding, not
/// part of the family field.
const FAMILY_IPV4: u8 = 0x01;

/// Encode `"a.b.c.d[:port]"` into the 8-octet `[0x00, family, port_hi,
/// port_lo, a, b, c, d]` form. Port defaults to 0 when omitted.
pub fn encode_address(addr: &str) -> Result<[u8; 8], StunError> {
    let trimmed = addr.trim();
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| StunError::InvalidAddress(addr.to_string()))?;
            (host, port)
        }
        None => (trimmed, 0u16),
    };
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| StunError::InvalidAddress(addr.to_string()))?;

    let mut bytes = [0u8; 8];
    bytes[0] = 0x00;
    bytes[1] = FAMILY_IPV4;
    bytes[2..4].copy_from_slice(&port.to_be_bytes());
    bytes[4..8].copy_from_slice(&ip.octets());
    Ok(bytes)
}

/// Decode an 8-octet address attribute value back into `"a.b.c.d:port"`.
pub fn decode_address(bytes: &[u8]) -> Result<String, StunError> {
    if bytes.len() < 8 {
        return Err(StunError::InvalidAddress(format!(
            "address attribute is {} octets, need 8",
            bytes.len()
        )));
    }
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Ok(format!("{}:{}", ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_address_and_port() {
        let original = "203.0.113.7:3478";
        let encoded = encode_address(original).unwrap();
        assert_eq!(decode_address(&encoded).unwrap(), original);
    }

    #[test]
    fn encodes_mapped_address_example() {
        // S2: 203.0.113.7:3478 -> 00 01 0D 96 CB 00 71 07
        let encoded = encode_address("203.0.113.7:3478").unwrap();
        assert_eq!(encoded, [0x00, 0x01, 0x0D, 0x96, 0xCB, 0x00, 0x71, 0x07]);
    }

    #[test]
    fn defaults_port_to_zero_when_absent() {
        let encoded = encode_address("10.0.0.1").unwrap();
        assert_eq!(decode_address(&encoded).unwrap(), "10.0.0.1:0");
    }

    #[test]
    fn rejects_non_dotted_quad_input() {
        assert!(encode_address("not-an-address").is_err());
        assert!(encode_address("example.com:80").is_err());
    }

    #[test]
    fn rejects_short_decode_buffer() {
        assert!(decode_address(&[0x00, 0x01, 0x00]).is_err());
    }
}
