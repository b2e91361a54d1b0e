// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport legs: bound sockets the dispatcher sends and receives through.
//!
//! A leg has a fixed identity `(proto, addr, port)` and a SIP contact. It
//! frames and parses wire traffic, stamps its own `Via` onto outgoing
//! requests, strips its own `Via` from incoming responses, and performs the
//! `Record-Route`/`Max-Forwards` edits a forwarding element applies at its
//! boundaries. Everything above the socket — queueing, retransmission, hop
//! selection — belongs to `sip-dispatch`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sip_observe::leg_metrics;
use sip_wire::{derived_branch, Packet, Proto, Via};

mod framing;
mod hop;
mod tcp;
mod udp;

pub use framing::drain_frames;
pub use hop::HopAddr;
pub use tcp::TcpLeg;
pub use udp::UdpLeg;

static LEG_SEQ: AtomicU64 = AtomicU64::new(1);

/// Value inserted when a request arrives without `Max-Forwards`.
const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Identity of a leg: transport triple plus an instance tag, so two legs
/// bound to the same address (e.g. across a re-bind) stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegKey {
    pub proto: Proto,
    pub addr: SocketAddr,
    pub seq: u64,
}

impl LegKey {
    /// Allocates a key with a fresh instance tag.
    pub fn next(proto: Proto, addr: SocketAddr) -> Self {
        Self {
            proto,
            addr,
            seq: LEG_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One packet received by a leg.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub from: SocketAddr,
}

/// A bound transport endpoint.
#[async_trait]
pub trait Leg: Send + Sync + 'static {
    /// Transport protocol this leg speaks.
    fn proto(&self) -> Proto;

    /// Local socket address the leg is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// SIP contact naming this leg, e.g. `sip:10.0.0.1:5060;transport=tcp`.
    fn contact(&self) -> &str;

    /// Stable identity used by the registry and for leg comparison.
    fn key(&self) -> LegKey;

    /// Receive loop: feeds parsed inbound packets into `sink` until the
    /// socket fails or the receiver is dropped. The registry spawns this
    /// and aborts it when the leg is removed.
    async fn run(&self, sink: mpsc::Sender<Inbound>) -> Result<()>;

    /// Sends one packet towards `dst`. The returned future completes when
    /// the transport has taken ownership of the bytes: immediately after
    /// `send_to` for UDP, after connect+write for TCP.
    async fn deliver(&self, packet: &Packet, dst: &HopAddr) -> Result<()>;

    /// Conjunctive reachability check used during hop finalisation. `None`
    /// criteria always match; the base implementation only discriminates on
    /// protocol, which is all an unconstrained leg can judge.
    fn can_deliver_to(&self, proto: Option<Proto>, host: Option<&str>, port: Option<u16>) -> bool {
        let _ = (host, port);
        proto.map_or(true, |p| p == self.proto())
    }

    /// Renders the `Via` value this leg stamps onto outgoing requests.
    fn own_via(&self, packet: &Packet) -> String {
        let local = self.local_addr();
        Via::render(
            self.proto(),
            &local.ip().to_string(),
            local.port(),
            &derived_branch(packet),
        )
    }

    /// Serialises `packet` for the wire, prepending this leg's `Via` to
    /// requests. The queued packet itself is never mutated, so retransmits
    /// produce identical bytes.
    fn wire_bytes(&self, packet: &Packet) -> Bytes {
        if packet.is_request() {
            let mut framed = packet.clone();
            framed.prepend_via(self.own_via(packet));
            framed.to_bytes()
        } else {
            packet.to_bytes()
        }
    }

    /// `Record-Route` value advertising this leg.
    fn record_route(&self) -> String {
        let local = self.local_addr();
        match self.proto() {
            Proto::Udp => format!("<sip:{}:{};lr>", local.ip(), local.port()),
            Proto::Tcp => format!("<sip:{}:{};transport=tcp;lr>", local.ip(), local.port()),
        }
    }

    /// Boundary edits applied when a packet enters through this leg on its
    /// way to being forwarded: `Max-Forwards` enforcement and this leg's
    /// `Record-Route`. Errors mean the packet must be dropped.
    fn forward_incoming(&self, packet: &mut Packet) -> Result<()> {
        if !packet.is_request() {
            return Ok(());
        }
        let hops = match packet.headers.get("Max-Forwards") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .map_err(|_| anyhow!("unparsable Max-Forwards {:?}", value.as_str()))?,
            None => DEFAULT_MAX_FORWARDS,
        };
        if hops == 0 {
            return Err(anyhow!("Max-Forwards exhausted"));
        }
        packet.headers.set("Max-Forwards", (hops - 1).to_string());
        packet.headers.prepend("Record-Route", self.record_route());
        Ok(())
    }

    /// Boundary edits applied when a packet leaves through this leg: a second
    /// `Record-Route` when the packet crosses between two different legs.
    fn forward_outgoing(&self, packet: &mut Packet, incoming: LegKey) -> Result<()> {
        if packet.is_request() && incoming != self.key() {
            packet.headers.prepend("Record-Route", self.record_route());
        }
        Ok(())
    }

    /// Decodes raw transport bytes into an [`Inbound`], applying the leg
    /// boundary rules: unparsable traffic is dropped here, and a response's
    /// topmost `Via` is removed when it names this leg.
    fn decode(&self, raw: &[u8], from: SocketAddr) -> Option<Inbound> {
        decode_raw(self.proto(), self.local_addr(), raw, from)
    }
}

/// Returns true when `via` names the sent-by of a leg at `local`/`proto`.
fn via_matches(via: &Via, proto: Proto, local: SocketAddr) -> bool {
    via.proto() == Some(proto)
        && via.host.as_str() == local.ip().to_string()
        && via.port.unwrap_or(5060) == local.port()
}

/// Leg-boundary decode shared between the trait and detached session tasks.
pub(crate) fn decode_raw(
    proto: Proto,
    local: SocketAddr,
    raw: &[u8],
    from: SocketAddr,
) -> Option<Inbound> {
    let mut packet = match Packet::parse(raw) {
        Ok(packet) => packet,
        Err(e) => {
            leg_metrics().on_error(proto.as_str(), "parse");
            debug!(%from, error = %e, "dropping unparsable packet");
            return None;
        }
    };
    if packet.is_response() {
        match packet.top_via() {
            Some(via) if via_matches(&via, proto, local) => {
                packet.pop_top_via();
            }
            _ => {
                // A response whose top Via does not name us was either
                // misrouted or spoofed.
                warn!(%from, "dropping response with foreign top Via");
                leg_metrics().on_error(proto.as_str(), "via");
                return None;
            }
        }
    }
    leg_metrics().on_packet_received(proto.as_str());
    Some(Inbound { packet, from })
}

/// Builds the default contact string for a leg identity.
pub(crate) fn contact_for(proto: Proto, addr: SocketAddr) -> SmolStr {
    match proto {
        Proto::Udp => SmolStr::new(format!("sip:{}:{}", addr.ip(), addr.port())),
        Proto::Tcp => SmolStr::new(format!("sip:{}:{};transport=tcp", addr.ip(), addr.port())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_wire::{Headers, Method};

    struct FakeLeg {
        key: LegKey,
        contact: SmolStr,
    }

    impl FakeLeg {
        fn new(proto: Proto, addr: &str) -> Self {
            let addr: SocketAddr = addr.parse().unwrap();
            Self {
                key: LegKey::next(proto, addr),
                contact: contact_for(proto, addr),
            }
        }
    }

    #[async_trait]
    impl Leg for FakeLeg {
        fn proto(&self) -> Proto {
            self.key.proto
        }
        fn local_addr(&self) -> SocketAddr {
            self.key.addr
        }
        fn contact(&self) -> &str {
            self.contact.as_str()
        }
        fn key(&self) -> LegKey {
            self.key
        }
        async fn run(&self, _sink: mpsc::Sender<Inbound>) -> Result<()> {
            Ok(())
        }
        async fn deliver(&self, _packet: &Packet, _dst: &HopAddr) -> Result<()> {
            Ok(())
        }
    }

    fn request() -> Packet {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bKc1");
        headers.push("CSeq", "1 INVITE");
        headers.push("Call-ID", "c1");
        Packet::request(Method::Invite, "sip:bob@example.com", headers)
    }

    #[test]
    fn wire_bytes_prepends_own_via_to_requests() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let text = String::from_utf8(leg.wire_bytes(&request()).to_vec()).unwrap();
        let first_via = text
            .lines()
            .find(|l| l.starts_with("Via:"))
            .expect("via present");
        assert!(first_via.contains("10.0.0.1:5060"), "{first_via}");
        // Original Via still below ours.
        assert!(text.contains("client.example.com"));
    }

    #[test]
    fn wire_bytes_is_stable_across_calls() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let packet = request();
        assert_eq!(leg.wire_bytes(&packet), leg.wire_bytes(&packet));
    }

    #[test]
    fn forward_incoming_decrements_max_forwards() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let mut packet = request();
        packet.headers.push("Max-Forwards", "70");
        leg.forward_incoming(&mut packet).unwrap();
        assert_eq!(packet.headers.get("Max-Forwards").unwrap().as_str(), "69");
        assert!(packet
            .headers
            .get("Record-Route")
            .unwrap()
            .contains("10.0.0.1"));
    }

    #[test]
    fn forward_incoming_rejects_exhausted_max_forwards() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let mut packet = request();
        packet.headers.push("Max-Forwards", "0");
        assert!(leg.forward_incoming(&mut packet).is_err());
    }

    #[test]
    fn forward_outgoing_adds_second_record_route_across_legs() {
        let leg_a = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let leg_b = FakeLeg::new(Proto::Tcp, "10.0.0.2:5060");
        let mut packet = request();
        leg_a.forward_incoming(&mut packet).unwrap();
        leg_b.forward_outgoing(&mut packet, leg_a.key()).unwrap();
        let routes: Vec<_> = packet
            .headers
            .get_all("Record-Route")
            .map(|v| v.to_string())
            .collect();
        assert_eq!(routes.len(), 2);
        assert!(routes[0].contains("10.0.0.2"), "outgoing leg on top");
        assert!(routes[1].contains("10.0.0.1"));
    }

    #[test]
    fn forward_outgoing_same_leg_adds_nothing() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let mut packet = request();
        leg.forward_incoming(&mut packet).unwrap();
        leg.forward_outgoing(&mut packet, leg.key()).unwrap();
        assert_eq!(packet.headers.get_all("Record-Route").count(), 1);
    }

    #[test]
    fn decode_strips_own_via_from_response() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let raw = b"SIP/2.0 200 OK\r\n\
                    Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKown\r\n\
                    Via: SIP/2.0/UDP client.example.com;branch=z9hG4bKc1\r\n\
                    CSeq: 1 INVITE\r\nCall-ID: c1\r\nContent-Length: 0\r\n\r\n";
        let inbound = leg.decode(raw, "192.0.2.9:5060".parse().unwrap()).unwrap();
        let top = inbound.packet.top_via().unwrap();
        assert_eq!(top.host.as_str(), "client.example.com");
    }

    #[test]
    fn decode_drops_response_with_foreign_via() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        let raw = b"SIP/2.0 200 OK\r\n\
                    Via: SIP/2.0/UDP somewhere.else:5060;branch=z9hG4bKx\r\n\
                    CSeq: 1 INVITE\r\nCall-ID: c1\r\nContent-Length: 0\r\n\r\n";
        assert!(leg.decode(raw, "192.0.2.9:5060".parse().unwrap()).is_none());
    }

    #[test]
    fn decode_drops_garbage() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        assert!(leg
            .decode(b"not sip at all", "192.0.2.9:5060".parse().unwrap())
            .is_none());
    }

    #[test]
    fn can_deliver_to_discriminates_on_proto() {
        let leg = FakeLeg::new(Proto::Udp, "10.0.0.1:5060");
        assert!(leg.can_deliver_to(Some(Proto::Udp), None, None));
        assert!(!leg.can_deliver_to(Some(Proto::Tcp), None, None));
        assert!(leg.can_deliver_to(None, Some("example.com"), Some(5060)));
    }
}
