// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sip_observe::leg_metrics;
use sip_wire::{Packet, Proto};

use crate::framing::{drain_frames, MAX_BUFFER_SIZE};
use crate::{contact_for, HopAddr, Inbound, Leg, LegKey};

/// Maximum number of concurrent inbound sessions per leg.
const MAX_CONCURRENT_SESSIONS: usize = 1024;

/// Maximum idle time before a session is closed. Guards the session table
/// against peers that connect and go silent.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for outbound connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    key: LegKey,
    contact: SmolStr,
    /// Writer channels per peer; inbound and outbound sessions both register
    /// here so responses can reuse the connection a request arrived on.
    conns: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    /// Sink installed by `run`; outbound sessions created before the leg is
    /// running discard whatever the peer sends back.
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
}

/// A leg backed by a TCP listener plus on-demand outbound connections.
///
/// Delivery succeeds once the bytes are handed to the peer socket; the
/// dispatcher treats that as the transport taking ownership.
pub struct TcpLeg {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TcpLeg {
    /// Binds a new TCP leg with `SO_REUSEADDR` set.
    pub async fn bind(addr: &str) -> Result<Self> {
        let bind_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow!("invalid bind address: {}", e))?;

        let listener = {
            use socket2::{Domain, Protocol, Socket, Type};

            let socket = Socket::new(
                Domain::for_address(bind_addr),
                Type::STREAM,
                Some(Protocol::TCP),
            )?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&bind_addr.into())?;
            socket.listen(128)?;

            let std_listener: std::net::TcpListener = socket.into();
            TcpListener::from_std(std_listener)?
        };
        let local = listener.local_addr()?;
        info!(%local, "leg ready (tcp)");
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                key: LegKey::next(Proto::Tcp, local),
                contact: contact_for(Proto::Tcp, local),
                conns: DashMap::new(),
                inbound: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl Leg for TcpLeg {
    fn proto(&self) -> Proto {
        Proto::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.key.addr
    }

    fn contact(&self) -> &str {
        self.shared.contact.as_str()
    }

    fn key(&self) -> LegKey {
        self.shared.key
    }

    async fn run(&self, sink: mpsc::Sender<Inbound>) -> Result<()> {
        *self.shared.inbound.lock().unwrap() = Some(sink.clone());
        let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_SESSIONS));
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(%e, "tcp accept error");
                    leg_metrics().on_error("tcp", "accept");
                    continue;
                }
            };
            let permit = match limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%peer, "tcp session limit reached; dropping connection");
                    leg_metrics().on_error("tcp", "session-limit");
                    continue;
                }
            };
            let shared = self.shared.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let writer = spawn_session(shared.clone(), stream, peer, Some(sink));
                // Session ends when the writer channel closes.
                writer.closed().await;
            });
        }
    }

    async fn deliver(&self, packet: &Packet, dst: &HopAddr) -> Result<()> {
        let target = dst.to_socket_addr().await?;
        let bytes = self.wire_bytes(packet);

        // Reuse a live session when one exists.
        if let Some(tx) = self.shared.conns.get(&target).map(|e| e.value().clone()) {
            if tx.send(bytes.clone()).await.is_ok() {
                leg_metrics().on_packet_sent("tcp");
                return Ok(());
            }
            debug!(peer = %target, "stale tcp session, reconnecting");
            self.shared.conns.remove(&target);
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| anyhow!("tcp connect timeout after {:?} to {}", CONNECT_TIMEOUT, target))??;
        leg_metrics().on_connect("tcp");

        let sink = self.shared.inbound.lock().unwrap().clone();
        let tx = spawn_session(self.shared.clone(), stream, target, sink);
        tx.send(bytes)
            .await
            .map_err(|_| anyhow!("tcp session writer closed"))?;
        leg_metrics().on_packet_sent("tcp");
        Ok(())
    }
}

/// Starts reader and writer tasks for one connection and registers the writer
/// channel under the peer address. Returns the writer channel.
fn spawn_session(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    sink: Option<mpsc::Sender<Inbound>>,
) -> mpsc::Sender<Bytes> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    shared.conns.insert(peer, tx.clone());

    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if let Err(e) = writer.write_all(&buf).await {
                error!(%e, "tcp write error");
                leg_metrics().on_error("tcp", "write");
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let reader_shared = shared.clone();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if buf.len() >= MAX_BUFFER_SIZE {
                warn!(%peer, buffer = buf.len(), "tcp buffer limit exceeded, closing session");
                leg_metrics().on_error("tcp", "buffer-overflow");
                break;
            }
            match tokio::time::timeout(SESSION_IDLE_TIMEOUT, reader.read_buf(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    let frames = match drain_frames(&mut buf) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!(%peer, error = %e, "tcp framing error, closing session");
                            leg_metrics().on_error("tcp", "framing");
                            break;
                        }
                    };
                    for frame in frames {
                        let Some(inbound) =
                            crate::decode_raw(Proto::Tcp, reader_shared.key.addr, &frame, peer)
                        else {
                            continue;
                        };
                        match &sink {
                            Some(sink) => {
                                if sink.send(inbound).await.is_err() {
                                    debug!(%peer, "inbound sink closed, ending tcp session");
                                    reader_shared.conns.remove(&peer);
                                    return;
                                }
                            }
                            None => {
                                debug!(%peer, "tcp leg not running; discarding inbound frame")
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!(%e, "tcp read error");
                    leg_metrics().on_error("tcp", "read");
                    break;
                }
                Err(_) => {
                    debug!(%peer, "tcp session idle timeout");
                    break;
                }
            }
        }
        reader_shared.conns.remove(&peer);
    });

    tx
}
