//! NAT-behavior classifier (C5): drives the three-test probe (RFC 3489
//! §10.1) over a single UDP socket and maps the outcomes to one of seven
//! NAT categories. Grounded on the teacher's `Client` in the original
//! `src/client.rs`: one background reader task decodes inbound responses
//! and routes each to the waiter registered for its transaction id, via a
//! `HashMap<TransactionId, mpsc::Sender<Message>>` exactly like the
//! teacher's `transactions` map. Responses for which no waiter is
//! registered (a stray late arrival) are dropped, matching spec §5.
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_std::future;
use async_std::net::{SocketAddr, UdpSocket};
use async_std::sync::Mutex;
use async_std::task;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use futures::SinkExt;

use super::error::StunError;
use super::message::{AttrType, AttrValue, Message, MessageType, TRANSACTION_ID_SIZE};

/// Each test in the classifier is bounded by this deadline; a timeout is an
/// answer ("not received"), not an error.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF_SIZE: usize = 2048;

/// One of the seven NAT categories from RFC 3489 §5.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NatType {
    OpenInternet,
    FirewallBlocksUdp,
    FirewallAllowsUdp,
    FullConeNat,
    SymmetricNat,
    RestrictedConeNat,
    RestrictedPortConeNat,
}

type Waiters = Arc<Mutex<HashMap<[u8; TRANSACTION_ID_SIZE], mpsc::Sender<Message>>>>;

/// Drives the probe. Holds one UDP socket and a background reader task that
/// posts each decoded `BindResp` to whichever test is currently waiting on
/// its transaction id.
pub struct Classifier {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddrV4,
    server_addr: SocketAddrV4,
    waiters: Waiters,
    running: Arc<AtomicBool>,
}

impl Classifier {
    pub async fn new(local_addr: SocketAddrV4, server_addr: SocketAddrV4) -> Result<Self, StunError> {
        let socket = Arc::new(
            UdpSocket::bind(SocketAddr::V4(local_addr))
                .await
                .map_err(StunError::Io)?,
        );
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        task::spawn(Self::run_reader(socket.clone(), waiters.clone(), running.clone()));
        Ok(Classifier {
            socket,
            local_addr,
            server_addr,
            waiters,
            running,
        })
    }

    async fn run_reader(socket: Arc<UdpSocket>, waiters: Waiters, running: Arc<AtomicBool>) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        while running.load(Ordering::Relaxed) {
            let n = match socket.recv_from(&mut buf).await {
                Ok((n, _peer)) => n,
                Err(_) => return,
            };
            if !Message::is_message(&buf[..n]) {
                continue;
            }
            let message = match Message::parse(&buf[..n]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if message.message_type() != MessageType::BindResponse {
                continue;
            }
            let waiter = {
                let mut locked = waiters.lock().await;
                locked.remove(&message.transaction_id())
            };
            if let Some(mut tx) = waiter {
                tx.send(message).await.ok();
            }
            // No waiter registered: a stray/late response. Dropped per spec.
        }
    }

    /// Send `request` to `target` and wait up to [`TEST_TIMEOUT`] for a
    /// matching response, keyed by transaction id.
    async fn exchange(&self, request: Message, target: SocketAddrV4) -> Option<Message> {
        let tid = request.transaction_id();
        let (tx, mut rx) = mpsc::channel(1);
        self.waiters.lock().await.insert(tid, tx);

        let send_result = self
            .socket
            .send_to(&request.serialize(), SocketAddr::V4(target))
            .await;
        if send_result.is_err() {
            self.waiters.lock().await.remove(&tid);
            return None;
        }

        let response = future::timeout(TEST_TIMEOUT, rx.next()).await.ok().flatten();
        self.waiters.lock().await.remove(&tid);
        response
    }

    /// Test I: plain BindReq, no CHANGE-REQUEST. Returns the MAPPED-ADDRESS
    /// string if a response arrives.
    pub async fn test_i(&self) -> Option<String> {
        let request = Message::new_bind_request(None, None, false, false).ok()?;
        let response = self.exchange(request, self.server_addr).await?;
        match response.get_attribute(AttrType::MappedAddress) {
            AttrValue::Address(addr) => Some(addr),
            _ => None,
        }
    }

    /// Test I′: plain BindReq carrying RESPONSE-ADDRESS equal to a
    /// previously observed mapped address (attached to carry intent, per
    /// spec §4.5 — the server does not redirect its reply based on it).
    /// Returns whether a response arrives.
    pub async fn test_i_prime(&self, previously_mapped: &str) -> bool {
        let request = match Message::new_bind_request(None, Some(previously_mapped), false, false) {
            Ok(r) => r,
            Err(_) => return false,
        };
        self.exchange(request, self.server_addr).await.is_some()
    }

    /// Test II: BindReq with CHANGE-REQUEST (change_ip=true, change_port=true).
    pub async fn test_ii(&self) -> bool {
        let request = match Message::new_bind_request(None, None, true, true) {
            Ok(r) => r,
            Err(_) => return false,
        };
        self.exchange(request, self.server_addr).await.is_some()
    }

    /// Test III: BindReq with CHANGE-REQUEST (change_ip=false, change_port=true).
    pub async fn test_iii(&self) -> bool {
        let request = match Message::new_bind_request(None, None, false, true) {
            Ok(r) => r,
            Err(_) => return false,
        };
        self.exchange(request, self.server_addr).await.is_some()
    }

    /// Run the decision tree exactly once (spec §4.5); infallible — a
    /// timeout on any test is consumed as "not received", never propagated
    /// as an error. Each branch of [`decide`] is evaluated lazily, one test
    /// at a time, so a test whose outcome the tree doesn't need is never run.
    pub async fn classify(&self) -> NatType {
        let local = self.local_addr.to_string();
        let mapped = match self.test_i().await {
            None => return NatType::FirewallBlocksUdp,
            Some(mapped) => mapped,
        };
        let mapped_equals_local = mapped == local;

        if mapped_equals_local {
            let test_ii = self.test_ii().await;
            return decide(TestOutcomes {
                test_i_received: true,
                mapped_equals_local: true,
                test_ii,
                test_i_prime: false,
                test_iii: false,
            });
        }

        let test_ii = self.test_ii().await;
        if test_ii {
            return decide(TestOutcomes {
                test_i_received: true,
                mapped_equals_local: false,
                test_ii: true,
                test_i_prime: false,
                test_iii: false,
            });
        }

        let test_i_prime = self.test_i_prime(&mapped).await;
        if !test_i_prime {
            return decide(TestOutcomes {
                test_i_received: true,
                mapped_equals_local: false,
                test_ii: false,
                test_i_prime: false,
                test_iii: false,
            });
        }

        let test_iii = self.test_iii().await;
        decide(TestOutcomes {
            test_i_received: true,
            mapped_equals_local: false,
            test_ii: false,
            test_i_prime: true,
            test_iii,
        })
    }
}

/// The outcome of each classifier test that [`decide`] might consult. Fields
/// the decision tree short-circuits past (spec §4.5: a test not reached is
/// simply never run) are conventionally `false`/ignored by the branch that
/// doesn't need them.
#[derive(Clone, Copy, Debug)]
struct TestOutcomes {
    test_i_received: bool,
    mapped_equals_local: bool,
    test_ii: bool,
    test_i_prime: bool,
    test_iii: bool,
}

/// The RFC 3489 §10.1 decision tree (spec §4.5), as a pure function of test
/// outcomes. Split out from [`Classifier::classify`] so the tree itself is
/// testable without a network: "given a fixed sequence of test outcomes, the
/// decision tree always yields the table in §4.5" (spec §8 property 7).
fn decide(outcomes: TestOutcomes) -> NatType {
    if !outcomes.test_i_received {
        return NatType::FirewallBlocksUdp;
    }
    if outcomes.mapped_equals_local {
        return if outcomes.test_ii {
            NatType::OpenInternet
        } else {
            NatType::FirewallAllowsUdp
        };
    }
    if outcomes.test_ii {
        return NatType::FullConeNat;
    }
    if !outcomes.test_i_prime {
        return NatType::SymmetricNat;
    }
    if outcomes.test_iii {
        NatType::RestrictedConeNat
    } else {
        NatType::RestrictedPortConeNat
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddrV4, SocketAddrV4) {
        ("127.0.0.1:0".parse().unwrap(), "127.0.0.1:3478".parse().unwrap())
    }

    #[async_std::test]
    async fn classifier_binds_its_local_socket() {
        let (local, server) = addrs();
        let classifier = Classifier::new(local, server).await.unwrap();
        assert_eq!(classifier.server_addr, server);
    }

    #[async_std::test]
    async fn test_i_times_out_against_an_unreachable_server() {
        let local: SocketAddrV4 = "127.0.0.1:0".parse().unwrap();
        // Port 1 is reserved/unlikely to have a STUN server; nothing should
        // answer within the (shortened, for the test) deadline.
        let server: SocketAddrV4 = "127.0.0.1:1".parse().unwrap();
        let classifier = Classifier::new(local, server).await.unwrap();
        // Exercise the exchange plumbing end-to-end without waiting the
        // full ten seconds: a closed/unreachable UDP destination errors
        // synchronously on most platforms rather than timing out, but
        // either outcome must yield "no response" rather than panicking.
        let result = classifier.test_i().await;
        assert!(result.is_none());
    }

    fn all_unreached() -> TestOutcomes {
        TestOutcomes {
            test_i_received: true,
            mapped_equals_local: false,
            test_ii: false,
            test_i_prime: false,
            test_iii: false,
        }
    }

    #[test]
    fn test_i_not_received_is_firewall_blocks_udp() {
        let outcomes = TestOutcomes {
            test_i_received: false,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::FirewallBlocksUdp);
    }

    #[test]
    fn s3_mapped_equals_local_and_test_ii_received_is_open_internet() {
        let outcomes = TestOutcomes {
            mapped_equals_local: true,
            test_ii: true,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::OpenInternet);
    }

    #[test]
    fn mapped_equals_local_and_test_ii_not_received_is_firewall_allows_udp() {
        let outcomes = TestOutcomes {
            mapped_equals_local: true,
            test_ii: false,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::FirewallAllowsUdp);
    }

    #[test]
    fn mapped_differs_and_test_ii_received_is_full_cone_nat() {
        let outcomes = TestOutcomes {
            test_ii: true,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::FullConeNat);
    }

    #[test]
    fn s4_mapped_differs_test_ii_and_test_i_prime_not_received_is_symmetric_nat() {
        let outcomes = TestOutcomes {
            test_ii: false,
            test_i_prime: false,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::SymmetricNat);
    }

    #[test]
    fn mapped_differs_test_i_prime_received_and_test_iii_received_is_restricted_cone_nat() {
        let outcomes = TestOutcomes {
            test_ii: false,
            test_i_prime: true,
            test_iii: true,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::RestrictedConeNat);
    }

    #[test]
    fn mapped_differs_test_i_prime_received_and_test_iii_not_received_is_restricted_port_cone_nat() {
        let outcomes = TestOutcomes {
            test_ii: false,
            test_i_prime: true,
            test_iii: false,
            ..all_unreached()
        };
        assert_eq!(decide(outcomes), NatType::RestrictedPortConeNat);
    }
}
