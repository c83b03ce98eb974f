//! This module implements the legacy STUN protocol message processing based
//! on RFC 3489. Only the six classic message types and the eleven original
//! attribute types are modeled; the modern magic-cookie dialect (RFC 8489)
//! is out of scope.
use std::fmt;

use rand::{thread_rng, Rng};

use super::address;
use super::error::StunError;

/// STUN header size in octets: 2 (type) + 2 (length) + 16 (transaction id).
pub const HEADER_BYTE_SIZE: usize = 20;
/// Transaction id size in octets.
pub const TRANSACTION_ID_SIZE: usize = 16;

// Message types
const TYPE_BIND_REQUEST: u16 = 0x0001;
const TYPE_BIND_RESPONSE: u16 = 0x0101;
const TYPE_BIND_ERROR_RESPONSE: u16 = 0x0111;
const TYPE_SHARE_SECRET_REQUEST: u16 = 0x0002;
const TYPE_SHARE_SECRET_RESPONSE: u16 = 0x0102;
const TYPE_SHARE_SECRET_ERROR_RESPONSE: u16 = 0x0112;

/// Enum representing a legacy STUN message type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageType {
    BindRequest,
    BindResponse,
    BindErrorResponse,
    ShareSecretRequest,
    ShareSecretResponse,
    ShareSecretErrorResponse,
}

impl MessageType {
    /// Convert from u16 to MessageType. Unknown codes have no valid message
    /// type in the legacy dialect.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            TYPE_BIND_REQUEST => Some(Self::BindRequest),
            TYPE_BIND_RESPONSE => Some(Self::BindResponse),
            TYPE_BIND_ERROR_RESPONSE => Some(Self::BindErrorResponse),
            TYPE_SHARE_SECRET_REQUEST => Some(Self::ShareSecretRequest),
            TYPE_SHARE_SECRET_RESPONSE => Some(Self::ShareSecretResponse),
            TYPE_SHARE_SECRET_ERROR_RESPONSE => Some(Self::ShareSecretErrorResponse),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::BindRequest => TYPE_BIND_REQUEST,
            Self::BindResponse => TYPE_BIND_RESPONSE,
            Self::BindErrorResponse => TYPE_BIND_ERROR_RESPONSE,
            Self::ShareSecretRequest => TYPE_SHARE_SECRET_REQUEST,
            Self::ShareSecretResponse => TYPE_SHARE_SECRET_RESPONSE,
            Self::ShareSecretErrorResponse => TYPE_SHARE_SECRET_ERROR_RESPONSE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::BindRequest => "BindReq",
            Self::BindResponse => "BindResp",
            Self::BindErrorResponse => "BindErrorResp",
            Self::ShareSecretRequest => "ShareSecretReq",
            Self::ShareSecretResponse => "ShareSecretResp",
            Self::ShareSecretErrorResponse => "ShareSecretErrorResp",
        }
    }
}

// Attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_RESPONSE_ADDRESS: u16 = 0x0002;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_PASSWORD: u16 = 0x0007;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_UNKNOWN_ATTRIBUTES: u16 = 0x000a;
const ATTR_REFLECTED_FROM: u16 = 0x000b;

/// Enum representing a legacy STUN attribute type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttrType {
    MappedAddress,
    ResponseAddress,
    ChangeRequest,
    SourceAddress,
    ChangedAddress,
    Username,
    Password,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ReflectedFrom,
}

impl AttrType {
    /// Convert from u16 to AttrType. `None` for anything outside
    /// 0x0001..=0x000b, per spec: such codes end attribute parsing.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            ATTR_MAPPED_ADDRESS => Some(Self::MappedAddress),
            ATTR_RESPONSE_ADDRESS => Some(Self::ResponseAddress),
            ATTR_CHANGE_REQUEST => Some(Self::ChangeRequest),
            ATTR_SOURCE_ADDRESS => Some(Self::SourceAddress),
            ATTR_CHANGED_ADDRESS => Some(Self::ChangedAddress),
            ATTR_USERNAME => Some(Self::Username),
            ATTR_PASSWORD => Some(Self::Password),
            ATTR_MESSAGE_INTEGRITY => Some(Self::MessageIntegrity),
            ATTR_ERROR_CODE => Some(Self::ErrorCode),
            ATTR_UNKNOWN_ATTRIBUTES => Some(Self::UnknownAttributes),
            ATTR_REFLECTED_FROM => Some(Self::ReflectedFrom),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::MappedAddress => ATTR_MAPPED_ADDRESS,
            Self::ResponseAddress => ATTR_RESPONSE_ADDRESS,
            Self::ChangeRequest => ATTR_CHANGE_REQUEST,
            Self::SourceAddress => ATTR_SOURCE_ADDRESS,
            Self::ChangedAddress => ATTR_CHANGED_ADDRESS,
            Self::Username => ATTR_USERNAME,
            Self::Password => ATTR_PASSWORD,
            Self::MessageIntegrity => ATTR_MESSAGE_INTEGRITY,
            Self::ErrorCode => ATTR_ERROR_CODE,
            Self::UnknownAttributes => ATTR_UNKNOWN_ATTRIBUTES,
            Self::ReflectedFrom => ATTR_REFLECTED_FROM,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::MappedAddress => "MAPPED-ADDRESS",
            Self::ResponseAddress => "RESPONSE-ADDRESS",
            Self::ChangeRequest => "CHANGE-REQUEST",
            Self::SourceAddress => "SOURCE-ADDRESS",
            Self::ChangedAddress => "CHANGED-ADDRESS",
            Self::Username => "USERNAME",
            Self::Password => "PASSWORD",
            Self::MessageIntegrity => "MESSAGE-INTEGRITY",
            Self::ErrorCode => "ERROR-CODE",
            Self::UnknownAttributes => "UNKNOWN-ATTRIBUTES",
            Self::ReflectedFrom => "REFLECTED-FROM",
        }
    }
}

/// A single attribute TLV as seen on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub attr_type: AttrType,
    pub value: Vec<u8>,
}

impl Attribute {
    fn to_raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(4 + self.value.len());
        raw.extend(&self.attr_type.to_u16().to_be_bytes());
        raw.extend(&(self.value.len() as u16).to_be_bytes());
        raw.extend(&self.value);
        raw
    }
}

/// Typed readback of an attribute's value, per spec §4.1.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttrValue {
    /// `"a.b.c.d:port"`, for the four address-family attributes.
    Address(String),
    /// The decoded CHANGE-REQUEST flags: `(change_ip, change_port)`.
    ChangeFlags { change_ip: bool, change_port: bool },
    /// The attribute is absent, or is one of the six reserved
    /// auth/error/reflected-from types that this crate does not interpret.
    Unset,
}

/// Generate a 4-octet CHANGE-REQUEST value: 3 zero octets followed by a
/// flag octet with bit 2 = change-IP (0x04), bit 1 = change-port (0x02).
///
/// Two divergent encoders exist in the source this crate was ported from:
/// one ANDs flags into a value that is always zero and emits a 2-octet
/// value with `length` lying about being 8; the other ORs flags into a
/// 4-octet value with `length` 4. This implements the latter.
fn change_request_value(change_ip: bool, change_port: bool) -> Vec<u8> {
    let mut flags: u8 = 0;
    if change_ip {
        flags |= 0x04;
    }
    if change_port {
        flags |= 0x02;
    }
    vec![0, 0, 0, flags]
}

fn random_transaction_id() -> [u8; TRANSACTION_ID_SIZE] {
    thread_rng().gen::<[u8; TRANSACTION_ID_SIZE]>()
}

/// A legacy STUN protocol message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    message_type: MessageType,
    transaction_id: [u8; TRANSACTION_ID_SIZE],
    attributes: Vec<Attribute>,
}

impl Message {
    /// `true` iff `buf` has at least 2 octets whose first two octets decode
    /// to one of the six known message types. A full 20-octet header is NOT
    /// required at detection time.
    pub fn is_message(buf: &[u8]) -> bool {
        buf.len() >= 2
            && MessageType::from_u16(u16::from_be_bytes([buf[0], buf[1]])).is_some()
    }

    /// Build a BindReq. `response_address`, when supplied, is always
    /// attached as RESPONSE-ADDRESS (the source this was ported from gated
    /// that on `change_ip`, which made Test I' — a plain request carrying
    /// RESPONSE-ADDRESS with no CHANGE-REQUEST — impossible to construct).
    pub fn new_bind_request(
        transaction_id: Option<[u8; TRANSACTION_ID_SIZE]>,
        response_address: Option<&str>,
        change_ip: bool,
        change_port: bool,
    ) -> Result<Message, StunError> {
        let transaction_id = transaction_id.unwrap_or_else(random_transaction_id);
        let mut attributes = Vec::with_capacity(2);
        if let Some(addr) = response_address {
            let value = address::encode_address(addr)?;
            attributes.push(Attribute {
                attr_type: AttrType::ResponseAddress,
                value: value.to_vec(),
            });
        }
        if change_ip || change_port {
            attributes.push(Attribute {
                attr_type: AttrType::ChangeRequest,
                value: change_request_value(change_ip, change_port),
            });
        }
        Ok(Message {
            message_type: MessageType::BindRequest,
            transaction_id,
            attributes,
        })
    }

    /// Build a BindResp carrying MAPPED-ADDRESS, SOURCE-ADDRESS, and
    /// CHANGED-ADDRESS, in that order.
    pub fn new_bind_response(
        transaction_id: [u8; TRANSACTION_ID_SIZE],
        mapped_address: &str,
        source_address: &str,
        changed_address: &str,
    ) -> Result<Message, StunError> {
        let mapped = address::encode_address(mapped_address)?;
        let source = address::encode_address(source_address)?;
        let changed = address::encode_address(changed_address)?;
        Ok(Message {
            message_type: MessageType::BindResponse,
            transaction_id,
            attributes: vec![
                Attribute {
                    attr_type: AttrType::MappedAddress,
                    value: mapped.to_vec(),
                },
                Attribute {
                    attr_type: AttrType::SourceAddress,
                    value: source.to_vec(),
                },
                Attribute {
                    attr_type: AttrType::ChangedAddress,
                    value: changed.to_vec(),
                },
            ],
        })
    }

    /// Parse a message from raw bytes. Permissive: an unrecognized
    /// attribute type ends iteration without erroring, and a declared
    /// attribute length that runs past the buffer's actual end also ends
    /// iteration rather than erroring — any attributes parsed before that
    /// point are kept. The header's `length` field is read but, per spec,
    /// never used to bound iteration; the buffer's actual length does.
    pub fn parse(buf: &[u8]) -> Result<Message, StunError> {
        if buf.len() < HEADER_BYTE_SIZE {
            return Err(StunError::BadHeader);
        }
        let message_type = MessageType::from_u16(u16::from_be_bytes([buf[0], buf[1]]))
            .ok_or(StunError::BadHeader)?;
        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        transaction_id.copy_from_slice(&buf[4..HEADER_BYTE_SIZE]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_BYTE_SIZE;
        while buf.len() - offset >= 4 {
            let type_code = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_type = match AttrType::from_u16(type_code) {
                Some(t) => t,
                None => break,
            };
            let length = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4;
            if buf.len() - offset < length {
                break;
            }
            attributes.push(Attribute {
                attr_type,
                value: buf[offset..offset + length].to_vec(),
            });
            offset += length;
        }

        Ok(Message {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Serialize to wire bytes, recomputing `length` from the attributes.
    pub fn serialize(&self) -> Vec<u8> {
        let body: Vec<u8> = self.attributes.iter().flat_map(Attribute::to_raw).collect();
        let mut bytes = Vec::with_capacity(HEADER_BYTE_SIZE + body.len());
        bytes.extend(&self.message_type.to_u16().to_be_bytes());
        bytes.extend(&(body.len() as u16).to_be_bytes());
        bytes.extend(&self.transaction_id);
        bytes.extend(body);
        bytes
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn transaction_id(&self) -> [u8; TRANSACTION_ID_SIZE] {
        self.transaction_id
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Typed view of the first attribute matching `attr_type`.
    pub fn get_attribute(&self, attr_type: AttrType) -> AttrValue {
        let attribute = match self.attributes.iter().find(|a| a.attr_type == attr_type) {
            Some(a) => a,
            None => return AttrValue::Unset,
        };
        match attr_type {
            AttrType::MappedAddress
            | AttrType::ResponseAddress
            | AttrType::SourceAddress
            | AttrType::ChangedAddress => address::decode_address(&attribute.value)
                .map(AttrValue::Address)
                .unwrap_or(AttrValue::Unset),
            AttrType::ChangeRequest => {
                if attribute.value.len() < 4 {
                    return AttrValue::Unset;
                }
                let flags = attribute.value[3];
                AttrValue::ChangeFlags {
                    change_ip: flags & 0x04 != 0,
                    change_port: flags & 0x02 != 0,
                }
            }
            AttrType::Username
            | AttrType::Password
            | AttrType::MessageIntegrity
            | AttrType::ErrorCode
            | AttrType::UnknownAttributes
            | AttrType::ReflectedFrom => AttrValue::Unset,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message: {{messageType:{}, transactionId: {}, attributes: [",
            self.message_type.name(),
            self.transaction_id.iter().map(|b| format!("{:02x}", b)).collect::<String>(),
        )?;
        for attribute in &self.attributes {
            write!(
                f,
                "{}: {:?}, ",
                attribute.attr_type.name(),
                self.get_attribute(attribute.attr_type)
            )?;
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_request_round_trips_through_serialize_and_parse() {
        let msg = Message::new_bind_request(None, Some("127.0.0.1:4000"), true, true).unwrap();
        let parsed = Message::parse(&msg.serialize()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn bind_response_round_trips_through_serialize_and_parse() {
        let tid = [7u8; TRANSACTION_ID_SIZE];
        let msg =
            Message::new_bind_response(tid, "198.51.100.2:4000", "10.0.0.1:3478", "198.51.100.2:4000")
                .unwrap();
        let parsed = Message::parse(&msg.serialize()).unwrap();
        assert_eq!(msg, parsed);
        assert_eq!(parsed.transaction_id(), tid);
    }

    #[test]
    fn serialized_length_field_matches_attribute_bytes() {
        let msg = Message::new_bind_request(None, Some("127.0.0.1:4000"), true, false).unwrap();
        let raw = msg.serialize();
        let declared_length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        assert_eq!(declared_length, raw.len() - HEADER_BYTE_SIZE);
    }

    #[test]
    fn change_request_sets_exactly_the_requested_bits() {
        assert_eq!(change_request_value(true, false), vec![0, 0, 0, 0x04]);
        assert_eq!(change_request_value(false, true), vec![0, 0, 0, 0x02]);
        assert_eq!(change_request_value(true, true), vec![0, 0, 0, 0x06]);
        assert_eq!(change_request_value(false, false), vec![0, 0, 0, 0x00]);
    }

    #[test]
    fn response_address_is_emitted_without_change_ip() {
        // Test I' needs RESPONSE-ADDRESS with no CHANGE-REQUEST attribute at all.
        let msg = Message::new_bind_request(None, Some("127.0.0.1:4000"), false, false).unwrap();
        match msg.get_attribute(AttrType::ResponseAddress) {
            AttrValue::Address(addr) => assert_eq!(addr, "127.0.0.1:4000"),
            other => panic!("expected address, got {:?}", other),
        }
        assert_eq!(msg.get_attribute(AttrType::ChangeRequest), AttrValue::Unset);
    }

    #[test]
    fn is_message_detects_only_known_codes() {
        assert!(Message::is_message(&[0x01, 0x01]));
        assert!(Message::is_message(&[0x01, 0x12]));
        assert!(!Message::is_message(&[0xff, 0xff]));
        assert!(!Message::is_message(&[0x00]));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(matches!(
            Message::parse(&[0x00, 0x01]),
            Err(StunError::BadHeader)
        ));
    }

    #[test]
    fn parse_rejects_unknown_message_type() {
        let mut buf = vec![0u8; HEADER_BYTE_SIZE];
        buf[0] = 0xff;
        buf[1] = 0xff;
        assert!(matches!(Message::parse(&buf), Err(StunError::BadHeader)));
    }

    #[test]
    fn parse_stops_at_first_unrecognized_attribute_type() {
        let mut buf = vec![0u8; HEADER_BYTE_SIZE];
        buf[0] = 0x01;
        buf[1] = 0x01; // BindResp
        buf.extend(&0x0001u16.to_be_bytes()); // MAPPED-ADDRESS
        buf.extend(&8u16.to_be_bytes());
        buf.extend(&[0x00, 0x01, 0x00, 0x00, 127, 0, 0, 1]);
        buf.extend(&0x00ffu16.to_be_bytes()); // unrecognized attribute type
        buf.extend(&4u16.to_be_bytes());
        buf.extend(&[1, 2, 3, 4]);

        let msg = Message::parse(&buf).unwrap();
        assert_eq!(msg.attributes().len(), 1);
        assert_eq!(msg.attributes()[0].attr_type, AttrType::MappedAddress);
    }

    #[test]
    fn s1_bind_req_hex_decode() {
        let hex = "000100189566c74d10037c4d7bbb0407d1e2c649000200080001303c2418eec2000300080000";
        let bytes: Vec<u8> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect();
        let msg = Message::parse(&bytes).unwrap();
        assert_eq!(msg.message_type(), MessageType::BindRequest);
        assert_eq!(
            msg.transaction_id(),
            [
                0x95, 0x66, 0xc7, 0x4d, 0x10, 0x03, 0x7c, 0x4d, 0x7b, 0xbb, 0x04, 0x07, 0xd1, 0xe2,
                0xc6, 0x49
            ]
        );
        assert_eq!(msg.attributes()[0].attr_type, AttrType::ResponseAddress);
        assert_eq!(msg.attributes()[0].value.len(), 8);
    }
}
