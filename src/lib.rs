//! A legacy RFC 3489 STUN toolkit: a wire codec for the classic
//! (pre-magic-cookie) message format, a raw-socket IPv4+UDP datagram
//! forger, a reactive STUN server, a NAT-behavior classifier that drives
//! RFC 3489 §10.1's three-test probe, and a UDP hole-punching transport
//! built on top of all four.
//!
//! Only IPv4 is supported. The modern RFC 5389/8489 dialect (magic cookie,
//! XOR-MAPPED-ADDRESS), TCP/TLS transports, and the long-term credential
//! attributes (USERNAME, PASSWORD, MESSAGE-INTEGRITY, ERROR-CODE,
//! UNKNOWN-ATTRIBUTES, REFLECTED-FROM) are out of scope: those six
//! attribute codes round-trip through the wire codec but always decode to
//! [`AttrValue::Unset`].
//!
//! ## Example: classify the NAT between this host and a server
//!
//! ```no_run
//! use async_std::task;
//! use stun3489::classifier::Classifier;
//!
//! task::block_on(async {
//!     let local = "0.0.0.0:0".parse().unwrap();
//!     let server = "127.0.0.1:3478".parse().unwrap();
//!     let classifier = Classifier::new(local, server).await.unwrap();
//!     println!("{:?}", classifier.classify().await);
//! });
//! ```

pub mod address;
pub mod classifier;
pub mod error;
pub mod forge;
pub mod holepunch;
pub mod message;
pub mod server;

pub use classifier::{Classifier, NatType};
pub use error::StunError;
pub use holepunch::P2pConn;
pub use message::{AttrType, AttrValue, Attribute, Message, MessageType};
pub use server::{AlternateEndpoint, Server};
