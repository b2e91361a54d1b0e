// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};

use sip_observe::leg_metrics;
use sip_wire::{Packet, Proto};

use crate::{contact_for, HopAddr, Inbound, Leg, LegKey};

/// A leg bound to a UDP socket.
///
/// Delivery is fire-and-forget: the future completes as soon as the datagram
/// is handed to the kernel, which is what "UDP success is immediate" means to
/// the dispatcher's queue.
pub struct UdpLeg {
    socket: Arc<UdpSocket>,
    key: LegKey,
    contact: SmolStr,
}

impl UdpLeg {
    /// Binds a new UDP leg.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(Arc::new(socket))
    }

    /// Wraps an already-bound socket.
    pub fn from_socket(socket: Arc<UdpSocket>) -> Result<Self> {
        let local = socket.local_addr()?;
        info!(%local, "leg ready (udp)");
        Ok(Self {
            socket,
            key: LegKey::next(Proto::Udp, local),
            contact: contact_for(Proto::Udp, local),
        })
    }
}

#[async_trait]
impl Leg for UdpLeg {
    fn proto(&self) -> Proto {
        Proto::Udp
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

    async fn run(&self, sink: mpsc::Sender<Inbound>) -> Result<()> {
        let mut buf = vec![0u8; 65_535];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if n == buf.len() {
                        error!(%from, max = n, "udp datagram likely truncated (buffer full)");
                        leg_metrics().on_error("udp", "truncate");
                    }
                    let Some(inbound) = self.decode(&buf[..n], from) else {
                        continue;
                    };
                    if sink.send(inbound).await.is_err() {
                        error!("receiver dropped; shutting down udp leg loop");
                        return Ok(());
                    }
                }
                Err(e) => {
                    error!(%e, "udp recv_from error");
                    leg_metrics().on_error("udp", "recv");
                }
            }
        }
    }

    async fn deliver(&self, packet: &Packet, dst: &HopAddr) -> Result<()> {
        let target = dst.to_socket_addr().await?;
        let bytes = self.wire_bytes(packet);
        self.socket.send_to(&bytes, target).await?;
        leg_metrics().on_packet_sent("udp");
        Ok(())
    }
}
