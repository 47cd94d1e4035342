//! Multicast socket and in-process message bus
//!
//! Advertiser and scanner talk to an [`MdnsBus`]; the socket bridges the
//! bus onto 224.0.0.251 / ff02::fb port 5353. Truncated responses are
//! reassembled at the receive boundary so bus consumers always see whole
//! messages.

use crate::codec::{self, DnsMessage};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use weft_core::{Error, Result};

/// mDNS IPv4 multicast group.
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// mDNS IPv6 multicast group.
pub const MDNS_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);
/// mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// How long a TC-flagged head waits for its continuations.
const REASSEMBLY_WINDOW: Duration = Duration::from_millis(500);

/// In-process fan-out of DNS messages.
///
/// Every published message reaches every subscriber, including the local
/// advertiser and scanner; tests wire components together with a bus and
/// no socket at all.
#[derive(Clone)]
pub struct MdnsBus {
    tx: broadcast::Sender<DnsMessage>,
}

impl Default for MdnsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MdnsBus {
    const QUEUE_DEPTH: usize = 64;

    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::QUEUE_DEPTH);
        Self { tx }
    }

    /// Publish a message to all subscribers. Messages without subscribers
    /// are dropped silently.
    pub fn publish(&self, message: DnsMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DnsMessage> {
        self.tx.subscribe()
    }
}

/// Reassembles TC-flagged message trains by transaction id.
pub struct Reassembler {
    pending: Mutex<HashMap<u16, (DnsMessage, Instant)>>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one decoded datagram; returns a complete message when the
    /// train is finished.
    pub fn push(&self, message: DnsMessage, now: Instant) -> Option<DnsMessage> {
        let mut pending = self.pending.lock();
        pending.retain(|_, (_, started)| now.duration_since(*started) < REASSEMBLY_WINDOW);

        match pending.remove(&message.transaction_id) {
            Some((mut head, started)) => {
                codec::merge_continuation(&mut head, message);
                if head.truncated {
                    pending.insert(head.transaction_id, (head, started));
                    None
                } else {
                    Some(head)
                }
            }
            None if message.truncated => {
                pending.insert(message.transaction_id, (message, now));
                None
            }
            None => Some(message),
        }
    }
}

/// Multicast UDP endpoint bridging the bus to the network.
pub struct MdnsSocket {
    socket: Arc<UdpSocket>,
    bus: MdnsBus,
    target: SocketAddr,
}

impl MdnsSocket {
    /// Bind the IPv4 multicast socket, joining the group on every
    /// multicast-capable interface (or the given one).
    pub fn bind_v4(bus: MdnsBus, interface: Option<Ipv4Addr>) -> Result<Arc<Self>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::Network(format!("socket create failed: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::Network(format!("reuse address failed: {e}")))?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT).into())
            .map_err(|e| Error::Network(format!("bind failed: {e}")))?;

        match interface {
            Some(interface) => {
                socket
                    .join_multicast_v4(&MDNS_IPV4_GROUP, &interface)
                    .map_err(|e| Error::Network(format!("multicast join failed: {e}")))?;
            }
            None => {
                let mut joined = false;
                for iface in if_addrs::get_if_addrs().unwrap_or_default() {
                    if let IpAddr::V4(addr) = iface.ip() {
                        if iface.is_loopback() {
                            continue;
                        }
                        if socket.join_multicast_v4(&MDNS_IPV4_GROUP, &addr).is_ok() {
                            joined = true;
                        }
                    }
                }
                if !joined {
                    socket
                        .join_multicast_v4(&MDNS_IPV4_GROUP, &Ipv4Addr::UNSPECIFIED)
                        .map_err(|e| {
                            Error::Network(format!("multicast join failed: {e}"))
                        })?;
                }
            }
        }
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| Error::Network(format!("multicast loop failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Network(format!("nonblocking failed: {e}")))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| Error::Network(format!("socket conversion failed: {e}")))?;

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            bus,
            target: SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_GROUP, MDNS_PORT)),
        }))
    }

    /// Pump datagrams between the bus and the network until the socket
    /// errors. Outgoing messages are split per the truncation rules;
    /// incoming TC trains are reassembled before they reach the bus.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let reassembler = Reassembler::new();
        let mut from_bus = self.bus.subscribe();
        let mut buf = vec![0u8; 9000];

        loop {
            tokio::select! {
                outgoing = from_bus.recv() => {
                    let Ok(message) = outgoing else { return Ok(()) };
                    match codec::encode_with_truncation(&message) {
                        Ok(datagrams) => {
                            for datagram in datagrams {
                                if let Err(e) = self.socket.send_to(&datagram, self.target).await {
                                    warn!("mdns send failed: {e}");
                                }
                            }
                        }
                        Err(e) => warn!("mdns encode failed: {e}"),
                    }
                }
                incoming = self.socket.recv_from(&mut buf) => {
                    let (len, from) = incoming
                        .map_err(|e| Error::Network(format!("mdns recv failed: {e}")))?;
                    match codec::decode(&buf[..len]) {
                        Ok(message) => {
                            if let Some(complete) = reassembler.push(message, Instant::now()) {
                                self.bus.publish(complete);
                            }
                        }
                        Err(e) => debug!("ignoring undecodable mdns datagram from {from}: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DnsRecord, RecordValue};

    fn record(name: &str) -> DnsRecord {
        DnsRecord::new(name, 120, RecordValue::Txt(vec!["a=1".into()]))
    }

    #[test]
    fn test_reassembler_passthrough() {
        let reassembler = Reassembler::new();
        let message = DnsMessage::response(1);
        let out = reassembler.push(message.clone(), Instant::now()).unwrap();
        assert_eq!(out, message);
    }

    #[test]
    fn test_reassembler_merges_by_transaction_id() {
        let reassembler = Reassembler::new();
        let now = Instant::now();

        let mut head = DnsMessage::response(9);
        head.truncated = true;
        head.answers.push(record("one.local"));
        assert!(reassembler.push(head, now).is_none());

        // A different transaction id passes straight through.
        let other = DnsMessage::response(10);
        assert!(reassembler.push(other, now).is_some());

        let mut tail = DnsMessage::response(9);
        tail.answers.push(record("two.local"));
        let merged = reassembler.push(tail, now).unwrap();
        assert_eq!(merged.answers.len(), 2);
        assert!(!merged.truncated);
    }

    #[test]
    fn test_reassembler_three_part_train() {
        let reassembler = Reassembler::new();
        let now = Instant::now();

        let mut head = DnsMessage::response(5);
        head.truncated = true;
        head.answers.push(record("one.local"));
        assert!(reassembler.push(head, now).is_none());

        let mut middle = DnsMessage::response(5);
        middle.truncated = true;
        middle.answers.push(record("two.local"));
        assert!(reassembler.push(middle, now).is_none());

        let mut tail = DnsMessage::response(5);
        tail.answers.push(record("three.local"));
        let merged = reassembler.push(tail, now).unwrap();
        assert_eq!(merged.answers.len(), 3);
    }

    #[test]
    fn test_stale_head_expires() {
        let reassembler = Reassembler::new();
        let start = Instant::now();

        let mut head = DnsMessage::response(5);
        head.truncated = true;
        head.answers.push(record("one.local"));
        assert!(reassembler.push(head, start).is_none());

        // Long after the window, the continuation stands alone.
        let mut tail = DnsMessage::response(5);
        tail.answers.push(record("late.local"));
        let out = reassembler
            .push(tail, start + Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.answers.len(), 1);
        assert_eq!(out.answers[0].name, "late.local");
    }

    #[tokio::test]
    async fn test_bus_fanout() {
        let bus = MdnsBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DnsMessage::response(3));
        assert_eq!(a.recv().await.unwrap().transaction_id, 3);
        assert_eq!(b.recv().await.unwrap().transaction_id, 3);
    }
}
