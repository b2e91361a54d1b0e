// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stateless-proxy forwarding layered on the dispatcher.
//!
//! Responses are routed by their topmost `Via`; requests consume `Route`
//! headers or fall back to hop resolution of the Request-URI. Either way the
//! packet leaves through exactly one leg with its `Contact` headers
//! rewritten, and is dispatched without retransmissions — a stateless proxy
//! never retransmits on its own (RFC 3261 §16.11).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use smol_str::SmolStr;
use tracing::{debug, warn};

use sip_dispatch::{DeliverOptions, Dispatcher, PacketReceiver, Target};
use sip_legs::{HopAddr, Leg};
use sip_wire::{Method, Packet, Proto, SipUri};

mod contact;

pub use contact::{rewrite_contacts, ContactRewriter, XorContactRewriter};

/// Hook consuming REGISTER requests before they are forwarded.
#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    /// Returns `true` when the request was handled and must not be proxied.
    async fn handle_register(
        &self,
        packet: &Packet,
        leg: &Arc<dyn Leg>,
        from: SocketAddr,
    ) -> bool;
}

/// Hook applied to a packet right before it leaves, for SDP/NAT rewriting.
pub trait NatHelper: Send + Sync + 'static {
    fn apply(&self, packet: &mut Packet, incoming: &dyn Leg, outgoing: &dyn Leg, from: SocketAddr);
}

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct StatelessProxyConfig {
    /// Port assumed when the top `Via` carries none. 5060 matches observed
    /// behaviour; deployments fronting `sips` may set 5061.
    pub via_default_port: u16,
}

impl Default for StatelessProxyConfig {
    fn default() -> Self {
        Self {
            via_default_port: 5060,
        }
    }
}

/// The stateless forwarder. Install it as the dispatcher's receiver.
pub struct StatelessProxy {
    dispatcher: Arc<Dispatcher>,
    rewriter: Arc<dyn ContactRewriter>,
    registrar: Option<Arc<dyn Registrar>>,
    nathelper: Option<Arc<dyn NatHelper>>,
    config: StatelessProxyConfig,
}

impl StatelessProxy {
    /// Builds a forwarder over `dispatcher` with the default contact
    /// rewriter keyed off the currently registered legs.
    pub fn new(dispatcher: Arc<Dispatcher>, config: StatelessProxyConfig) -> Self {
        let legs = dispatcher.get_legs(&Default::default());
        let rewriter = Arc::new(XorContactRewriter::from_legs(&legs));
        Self {
            dispatcher,
            rewriter,
            registrar: None,
            nathelper: None,
            config,
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_nathelper(mut self, nathelper: Arc<dyn NatHelper>) -> Self {
        self.nathelper = Some(nathelper);
        self
    }

    /// Replaces the contact rewriter (any reversible transform works).
    pub fn with_rewriter(mut self, rewriter: Arc<dyn ContactRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Response path: the topmost `Via` names the next hop.
    async fn forward_response(&self, packet: Packet, leg: Arc<dyn Leg>, from: SocketAddr) {
        let Some(via) = packet.top_via() else {
            debug!(%from, "response without Via, dropping");
            return;
        };
        let port = via.port.unwrap_or(self.config.via_default_port);
        let proto = via.proto().unwrap_or_else(|| leg.proto());
        let mut dst = HopAddr::new(proto, via.host.clone(), port);

        if dst.ip().is_none() {
            match self.dispatcher.dns_host2ip(dst.host.as_str()).await {
                Ok(ip) => dst = dst.with_host(ip.to_string()),
                Err(e) => {
                    debug!(host = %dst.host, error = %e, "via host unresolvable, dropping");
                    return;
                }
            }
        }

        // A received= parameter pins the return path to the leg that saw
        // the request arrive.
        let outgoing = if let Some(received) = via.received() {
            let (addr, port) = split_received(received);
            let Ok(addr) = addr.parse::<IpAddr>() else {
                debug!(%received, "unparsable received=, dropping response");
                return;
            };
            let restricted = self
                .dispatcher
                .get_legs(&Default::default())
                .into_iter()
                .filter(|candidate| {
                    candidate.local_addr().ip() == addr
                        && port.map_or(true, |p| candidate.local_addr().port() == p)
                })
                .find(|candidate| {
                    candidate.can_deliver_to(
                        Some(dst.proto),
                        Some(dst.host.as_str()),
                        Some(dst.port),
                    )
                });
            match restricted {
                Some(leg) => Some(leg),
                None => {
                    debug!(%received, "no leg matches received=, dropping response");
                    return;
                }
            }
        } else {
            None
        };

        self.finalise(packet, leg, outgoing, vec![dst], from).await;
    }

    /// Request path: `Route` headers first, hop resolution otherwise.
    async fn forward_request(&self, mut packet: Packet, leg: Arc<dyn Leg>, from: SocketAddr) {
        let mut outgoing: Option<Arc<dyn Leg>> = None;
        let mut dsts: Vec<HopAddr> = Vec::new();
        let mut resolved: Option<Vec<Target>> = None;

        // A top Route naming one of our own legs is consumed; it only told
        // the upstream element to send here.
        if let Some(route) = packet.headers.get("Route").cloned() {
            if let Some(route_uri) = SipUri::parse(&route) {
                if let Some(own) = self.leg_for_uri(&route_uri) {
                    outgoing = Some(own);
                    packet.headers.pop_first("Route");
                }
            }
        }

        // The next Route, if any, is the destination.
        if let Some(route) = packet.headers.get("Route").cloned() {
            if let Some(route_uri) = SipUri::parse(&route) {
                let proto = route_uri.transport_param().unwrap_or(Proto::Udp);
                let port = route_uri.port.unwrap_or_else(|| route_uri.default_port());
                dsts.push(HopAddr::new(proto, route_uri.host.clone(), port));
            }
        }

        if dsts.is_empty() {
            let Some(uri) = packet.uri().cloned() else {
                debug!(%from, "request without URI, dropping");
                return;
            };
            // Arriving over TCP biases the outbound protocol the same way.
            let allowed: Option<&[Proto]> = match leg.proto() {
                Proto::Tcp => Some(&[Proto::Tcp, Proto::Udp]),
                Proto::Udp => None,
            };
            match self.dispatcher.resolve_uri(&uri, allowed, None).await {
                Ok(targets) => resolved = Some(targets),
                Err(e) => {
                    debug!(%uri, error = %e, "cannot resolve request target, dropping");
                    return;
                }
            }
        }

        // Substitute IPs for any hostnames left in the candidates.
        if let Some(targets) = resolved {
            for target in targets {
                match self.to_ip(target.addr).await {
                    Some(addr) => {
                        if outgoing.is_none() {
                            // Keep the resolver's leg pairing by collapsing
                            // to its first candidate's leg.
                            outgoing = Some(target.leg.clone());
                        }
                        dsts.push(addr);
                    }
                    None => continue,
                }
            }
        } else {
            let mut converted = Vec::new();
            for dst in dsts {
                if let Some(addr) = self.to_ip(dst).await {
                    converted.push(addr);
                }
            }
            dsts = converted;
        }

        if dsts.is_empty() {
            debug!(%from, "no destination for request, dropping");
            return;
        }
        self.finalise(packet, leg, outgoing, dsts, from).await;
    }

    /// Common tail: pick the outgoing leg, rewrite contacts, apply boundary
    /// edits and hand over to the dispatcher without retransmissions.
    async fn finalise(
        &self,
        mut packet: Packet,
        incoming: Arc<dyn Leg>,
        outgoing: Option<Arc<dyn Leg>>,
        mut dsts: Vec<HopAddr>,
        from: SocketAddr,
    ) {
        let outgoing = match outgoing {
            Some(leg) => leg,
            None => {
                let legs = self.dispatcher.get_legs(&Default::default());
                let mut paired: Vec<(Arc<dyn Leg>, HopAddr)> = Vec::new();
                for dst in dsts.drain(..) {
                    let candidate = legs.iter().find(|leg| {
                        leg.can_deliver_to(Some(dst.proto), Some(dst.host.as_str()), Some(dst.port))
                    });
                    if let Some(leg) = candidate {
                        paired.push((leg.clone(), dst));
                    }
                }
                if paired.is_empty() {
                    debug!(%from, "no leg can carry the packet, dropping");
                    return;
                }
                // Traffic that came in over TCP prefers to leave over TCP.
                if incoming.proto() == Proto::Tcp
                    && paired.iter().any(|(leg, _)| leg.proto() == Proto::Tcp)
                {
                    paired.retain(|(leg, _)| leg.proto() == Proto::Tcp);
                }
                let leg = paired[0].0.clone();
                dsts = paired.into_iter().map(|(_, dst)| dst).collect();
                leg
            }
        };

        rewrite_contacts(&mut packet, self.rewriter.as_ref(), outgoing.as_ref());

        if let Err(e) = outgoing.forward_outgoing(&mut packet, incoming.key()) {
            debug!(error = %e, "forward_outgoing rejected packet, dropping");
            return;
        }
        if let Some(nathelper) = &self.nathelper {
            nathelper.apply(&mut packet, incoming.as_ref(), outgoing.as_ref(), from);
        }

        let targets: Vec<Target> = dsts
            .into_iter()
            .map(|addr| Target {
                leg: outgoing.clone(),
                addr,
            })
            .collect();
        let id: SmolStr = packet.tid();
        let opts = DeliverOptions {
            id: Some(id.clone()),
            targets: Some(targets),
            do_retransmits: Some(false),
            callback: Some(Arc::new(move |err| {
                if let Some(err) = err {
                    warn!(%id, error = %err, "stateless forward failed");
                }
            })),
            ..Default::default()
        };
        self.dispatcher.deliver(packet, opts).await;
    }

    /// Finds the registered leg a URI names, if any.
    fn leg_for_uri(&self, uri: &SipUri) -> Option<Arc<dyn Leg>> {
        self.dispatcher
            .get_legs(&Default::default())
            .into_iter()
            .find(|leg| {
                let local = leg.local_addr();
                uri.host.as_str() == local.ip().to_string()
                    && uri.port.unwrap_or_else(|| uri.default_port()) == local.port()
            })
    }

    /// Hostname → IP substitution for one candidate; `None` drops it.
    async fn to_ip(&self, dst: HopAddr) -> Option<HopAddr> {
        if dst.ip().is_some() {
            return Some(dst);
        }
        match self.dispatcher.dns_host2ip(dst.host.as_str()).await {
            Ok(ip) => Some(dst.with_host(ip.to_string())),
            Err(e) => {
                debug!(host = %dst.host, error = %e, "dropping unresolvable candidate");
                None
            }
        }
    }
}

#[async_trait]
impl PacketReceiver for StatelessProxy {
    async fn receive(&self, mut packet: Packet, leg: Arc<dyn Leg>, from: SocketAddr) {
        if packet.is_request() && packet.method() == Some(&Method::Register) {
            if let Some(registrar) = &self.registrar {
                if registrar.handle_register(&packet, &leg, from).await {
                    return;
                }
            }
        }

        if let Err(e) = leg.forward_incoming(&mut packet) {
            debug!(%from, error = %e, "forward_incoming rejected packet, dropping");
            return;
        }

        if packet.is_response() {
            self.forward_response(packet, leg, from).await;
        } else {
            self.forward_request(packet, leg, from).await;
        }
    }
}

/// Splits a `received=ip[:port]` value.
fn split_received(value: &str) -> (&str, Option<u16>) {
    match value.rsplit_once(':') {
        Some((addr, port)) if !addr.is_empty() && !addr.contains(':') => {
            match port.parse() {
                Ok(port) => (addr, Some(port)),
                Err(_) => (value, None),
            }
        }
        _ => (value, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_received_handles_port_forms() {
        assert_eq!(split_received("192.0.2.4"), ("192.0.2.4", None));
        assert_eq!(split_received("192.0.2.4:5062"), ("192.0.2.4", Some(5062)));
        // IPv6 without brackets stays whole.
        assert_eq!(split_received("2001:db8::1"), ("2001:db8::1", None));
    }
}
