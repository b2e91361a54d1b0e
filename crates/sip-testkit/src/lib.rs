// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the dispatch core.
//!
//! Provides minimal request/response builders and a scriptable [`MockLeg`]
//! whose delivery behaviour (succeed, fail, hang) drives the queue's state
//! machine deterministically in tests.
//!
//! # Example
//! ```
//! use sip_testkit::build_invite;
//! let invite = build_invite("sip:alice@example.com", "z9hG4bKtest", "call-1");
//! assert_eq!(invite.tid().as_str(), "z9hG4bKtest|1 INVITE");
//! ```

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use sip_legs::{HopAddr, Inbound, Leg, LegKey};
use sip_wire::{Headers, Method, Packet, Proto};

/// Constructs a minimal INVITE request.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Packet {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={}", branch),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", "1 INVITE");
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@client.example.com:5060>");
    headers.push("Content-Length", "0");
    Packet::request(Method::Invite, uri, headers)
}

/// Constructs a minimal request with an arbitrary method.
pub fn build_request(method: Method, uri: &str, branch: &str, call_id: &str) -> Packet {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={}", branch),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("1 {}", method.as_str()));
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");
    Packet::request(method, uri, headers)
}

/// Constructs a response carrying the given `CSeq` and `Call-ID`.
pub fn build_response(code: u16, reason: &str, cseq: &str, call_id: &str) -> Packet {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKresp",
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>;tag=5678");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", cseq);
    headers.push("Content-Length", "0");
    Packet::response(code, reason, headers)
}

/// How a [`MockLeg`] answers `deliver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverBehavior {
    /// Complete immediately with success (a UDP leg after `send_to`).
    Succeed,
    /// Complete immediately with the given error.
    Fail(String),
    /// Never complete (a TCP connect that hangs until cancelled).
    Hang,
}

/// A leg double that records deliveries and behaves as scripted.
pub struct MockLeg {
    key: LegKey,
    contact: SmolStr,
    behavior: Mutex<DeliverBehavior>,
    deliveries: Mutex<Vec<(Packet, HopAddr)>>,
}

impl MockLeg {
    pub fn new(proto: Proto, addr: &str) -> std::sync::Arc<Self> {
        let addr: SocketAddr = addr.parse().expect("valid socket address");
        std::sync::Arc::new(Self {
            key: LegKey::next(proto, addr),
            contact: SmolStr::new(match proto {
                Proto::Udp => format!("sip:{}:{}", addr.ip(), addr.port()),
                Proto::Tcp => format!("sip:{}:{};transport=tcp", addr.ip(), addr.port()),
            }),
            behavior: Mutex::new(DeliverBehavior::Succeed),
            deliveries: Mutex::new(Vec::new()),
        })
    }

    pub fn udp(addr: &str) -> std::sync::Arc<Self> {
        Self::new(Proto::Udp, addr)
    }

    pub fn tcp(addr: &str) -> std::sync::Arc<Self> {
        Self::new(Proto::Tcp, addr)
    }

    /// Scripts how subsequent `deliver` calls behave.
    pub fn set_behavior(&self, behavior: DeliverBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Snapshot of every delivery attempt so far.
    pub fn deliveries(&self) -> Vec<(Packet, HopAddr)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Polls until `n` deliveries were attempted or the timeout elapses.
    /// Returns whether the count was reached.
    pub async fn wait_for_deliveries(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.delivery_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.delivery_count() >= n
    }
}

#[async_trait]
impl Leg for MockLeg {
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
        // Mock legs have no socket; inbound traffic is injected by calling
        // the dispatcher's receive directly. Park until aborted.
        std::future::pending().await
    }

    async fn deliver(&self, packet: &Packet, dst: &HopAddr) -> Result<()> {
        let behavior = self.behavior.lock().unwrap().clone();
        self.deliveries
            .lock()
            .unwrap()
            .push((packet.clone(), dst.clone()));
        match behavior {
            DeliverBehavior::Succeed => Ok(()),
            DeliverBehavior::Fail(msg) => Err(anyhow!(msg)),
            DeliverBehavior::Hang => std::future::pending().await,
        }
    }
}
