// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! URI → hop resolution.
//!
//! Given a request URI and the current legs, produces the prioritised list of
//! `(leg, proto:host:port)` attempts. Static routing (per-domain proxies, the
//! global outgoing proxy, embedded IP literals) is consulted before DNS;
//! DNS is SRV first, plain address records as the fallback.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use smol_str::SmolStr;
use tracing::debug;

use sip_dns::{srv_name, DnsClient};
use sip_legs::{HopAddr, Leg};
use sip_wire::{Proto, SipUri};

use crate::{DispatchError, Target};

/// One hop produced by static configuration or DNS.
///
/// `prio` is the SRV priority; non-SRV sources use `-1` so they sort ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopCandidate {
    pub prio: i32,
    pub proto: Proto,
    pub host: SmolStr,
    pub port: u16,
}

impl HopCandidate {
    fn hop(&self) -> HopAddr {
        HopAddr::new(self.proto, self.host.clone(), self.port)
    }
}

/// Expands the configuration form `[proto:]host[:port]` into one candidate
/// per protocol (or the single named one), `prio = -1`.
fn expand_spec(spec: &str) -> Result<Vec<HopCandidate>> {
    let (proto, host, port) =
        HopAddr::parse_spec(spec).ok_or_else(|| anyhow!("unparsable hop spec {:?}", spec))?;
    let port = port.unwrap_or(5060);
    let protos = match proto {
        Some(p) => vec![p],
        None => vec![Proto::Udp, Proto::Tcp],
    };
    Ok(protos
        .into_iter()
        .map(|proto| HopCandidate {
            prio: -1,
            proto,
            host: host.clone(),
            port,
        })
        .collect())
}

/// Static per-domain proxy table with longest-suffix lookup.
///
/// A lookup for `a.b.c` tries `a.b.c`, `*.b.c`, `*.c`, then the catch-all
/// `*`. Entries are normalised to candidate lists at insertion time.
#[derive(Debug, Clone, Default)]
pub struct DomainMap {
    entries: HashMap<SmolStr, Vec<HopCandidate>>,
}

impl DomainMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a domain mapped to a `[proto:]host[:port]` spec string.
    pub fn insert_spec(&mut self, domain: &str, spec: &str) -> Result<()> {
        let candidates = expand_spec(spec)?;
        self.entries
            .insert(SmolStr::new(domain.to_ascii_lowercase()), candidates);
        Ok(())
    }

    /// Inserts a domain mapped to explicit candidates.
    pub fn insert_candidates(&mut self, domain: &str, candidates: Vec<HopCandidate>) {
        self.entries
            .insert(SmolStr::new(domain.to_ascii_lowercase()), candidates);
    }

    /// Builds a map from `domain → spec` pairs (configuration files).
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut map = Self::new();
        for (domain, spec) in specs {
            map.insert_spec(domain, spec)?;
        }
        Ok(map)
    }

    /// Longest-suffix lookup as described on the type.
    pub fn lookup(&self, domain: &str) -> Option<&[HopCandidate]> {
        let domain = domain.to_ascii_lowercase();
        if let Some(found) = self.entries.get(domain.as_str()) {
            return Some(found);
        }
        let labels: Vec<&str> = domain.split('.').collect();
        for skip in 1..labels.len() {
            let wildcard = format!("*.{}", labels[skip..].join("."));
            if let Some(found) = self.entries.get(wildcard.as_str()) {
                return Some(found);
            }
        }
        self.entries.get("*").map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The resolver: static tables plus a DNS client.
pub struct HopResolver {
    domain2proxy: DomainMap,
    outgoing_proxy: Option<Vec<HopCandidate>>,
    dns: Arc<dyn DnsClient>,
}

impl HopResolver {
    /// Builds a resolver; a malformed outgoing-proxy spec is a configuration
    /// error and fails construction.
    pub fn new(
        dns: Arc<dyn DnsClient>,
        domain2proxy: DomainMap,
        outgoing_proxy: Option<&str>,
    ) -> Result<Self> {
        let outgoing_proxy = match outgoing_proxy {
            Some(spec) => Some(expand_spec(spec)?),
            None => None,
        };
        Ok(Self {
            domain2proxy,
            outgoing_proxy,
            dns,
        })
    }

    pub fn dns(&self) -> &Arc<dyn DnsClient> {
        &self.dns
    }

    /// Resolves a URI to prioritised `(leg, addr)` attempts.
    ///
    /// `allowed_protos`, when non-empty, filters the scheme-derived protocol
    /// preference while keeping the caller's order. `allowed_legs` restricts
    /// which legs may carry the result; `legs` is the full registry snapshot
    /// used otherwise.
    pub async fn resolve(
        &self,
        uri: &str,
        allowed_protos: Option<&[Proto]>,
        allowed_legs: Option<&[Arc<dyn Leg>]>,
        legs: &[Arc<dyn Leg>],
    ) -> Result<Vec<Target>, DispatchError> {
        let uri = SipUri::parse(uri).ok_or(DispatchError::HostUnreachable)?;
        let default_port = uri.port.unwrap_or_else(|| uri.default_port());

        // Protocol preference: sips forces TCP, an explicit transport
        // parameter wins, otherwise UDP then TCP.
        let preferred: Vec<Proto> = if uri.sips {
            vec![Proto::Tcp]
        } else if let Some(proto) = uri.transport_param() {
            vec![proto]
        } else {
            vec![Proto::Udp, Proto::Tcp]
        };
        let allowed: Vec<Proto> = match allowed_protos {
            Some(filter) if !filter.is_empty() => filter
                .iter()
                .copied()
                .filter(|p| preferred.contains(p))
                .collect(),
            _ => preferred,
        };
        if allowed.is_empty() {
            return Err(DispatchError::ProtocolUnsupported);
        }

        // Domain canonicalisation: IP literals match the static table under
        // their reversed in-addr.arpa name; real names lose trailing dots.
        let ip_literal: Option<IpAddr> = uri.host.parse().ok();
        let lookup_domain: SmolStr = match uri.host.parse::<Ipv4Addr>() {
            Ok(ip) => {
                let o = ip.octets();
                SmolStr::new(format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0]))
            }
            Err(_) => SmolStr::new(uri.host.trim_end_matches('.')),
        };

        let candidates = self
            .collect_candidates(&lookup_domain, ip_literal, default_port, &allowed)
            .await;

        finalise(candidates, &allowed, allowed_legs, legs)
    }

    /// Walks the hop sources in priority order; the first that yields any
    /// candidate wins.
    async fn collect_candidates(
        &self,
        domain: &str,
        ip_literal: Option<IpAddr>,
        default_port: u16,
        allowed: &[Proto],
    ) -> Vec<HopCandidate> {
        if let Some(found) = self.domain2proxy.lookup(domain) {
            debug!(domain, "hop from domain proxy table");
            return found.to_vec();
        }
        if let Some(proxy) = &self.outgoing_proxy {
            debug!(domain, "hop from outgoing proxy");
            return proxy.clone();
        }
        if let Some(ip) = ip_literal {
            return allowed
                .iter()
                .map(|&proto| HopCandidate {
                    prio: -1,
                    proto,
                    host: SmolStr::new(ip.to_string()),
                    port: default_port,
                })
                .collect();
        }
        self.dns_candidates(domain, default_port, allowed).await
    }

    /// DNS hop discovery: SRV per allowed protocol, then address records
    /// with `prio = -1` when no SRV answer exists at all.
    pub async fn dns_candidates(
        &self,
        domain: &str,
        default_port: u16,
        protos: &[Proto],
    ) -> Vec<HopCandidate> {
        let mut candidates = Vec::new();
        for &proto in protos {
            let name = srv_name(proto, domain);
            match self.dns.srv(&name).await {
                Ok(records) => {
                    candidates.extend(records.into_iter().map(|rec| HopCandidate {
                        prio: i32::from(rec.priority),
                        proto,
                        host: rec.target,
                        port: rec.port,
                    }));
                }
                Err(e) => debug!(name, error = %e, "srv lookup failed"),
            }
        }
        if !candidates.is_empty() {
            return candidates;
        }

        match self.dns.host(domain).await {
            Ok(addrs) => addrs
                .into_iter()
                .flat_map(|ip| {
                    protos.iter().map(move |&proto| HopCandidate {
                        prio: -1,
                        proto,
                        host: SmolStr::new(ip.to_string()),
                        port: default_port,
                    })
                })
                .collect(),
            Err(e) => {
                debug!(domain, error = %e, "address lookup failed");
                Vec::new()
            }
        }
    }

    /// Plain host → first IP lookup; `EINVAL` on failure.
    pub async fn host2ip(&self, host: &str) -> Result<IpAddr, DispatchError> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        self.dns
            .host(host)
            .await
            .ok()
            .and_then(|addrs| addrs.into_iter().next())
            .ok_or(DispatchError::DnsFailure)
    }
}

/// Sorts candidates, pins a leg to each, and drops the ones no leg can
/// carry. An empty result is `EHOSTUNREACH`.
fn finalise(
    mut candidates: Vec<HopCandidate>,
    allowed: &[Proto],
    allowed_legs: Option<&[Arc<dyn Leg>]>,
    legs: &[Arc<dyn Leg>],
) -> Result<Vec<Target>, DispatchError> {
    candidates.retain(|c| allowed.contains(&c.proto));
    // Stable: ties keep source (DNS answer) order.
    candidates.sort_by_key(|c| c.prio);

    let pool = allowed_legs.unwrap_or(legs);
    let mut targets = Vec::new();
    for candidate in candidates {
        let hop = candidate.hop();
        let leg = pool.iter().find(|leg| {
            leg.can_deliver_to(Some(hop.proto), Some(hop.host.as_str()), Some(hop.port))
        });
        match leg {
            Some(leg) => targets.push(Target {
                leg: leg.clone(),
                addr: hop,
            }),
            None => debug!(%hop, "no leg for candidate, dropping"),
        }
    }
    if targets.is_empty() {
        return Err(DispatchError::HostUnreachable);
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_spec_covers_both_protocols_by_default() {
        let candidates = expand_spec("10.0.0.9").unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].proto, Proto::Udp);
        assert_eq!(candidates[1].proto, Proto::Tcp);
        assert!(candidates.iter().all(|c| c.port == 5060 && c.prio == -1));
    }

    #[test]
    fn expand_spec_honours_proto_and_port() {
        let candidates = expand_spec("tcp:proxy.example.com:5070").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].proto, Proto::Tcp);
        assert_eq!(candidates[0].port, 5070);
    }

    #[test]
    fn expand_spec_rejects_garbage() {
        assert!(expand_spec("").is_err());
        assert!(expand_spec("host:notaport").is_err());
    }

    #[test]
    fn domain_map_walks_suffixes() {
        let mut map = DomainMap::new();
        map.insert_spec("a.b.c", "10.0.0.1").unwrap();
        map.insert_spec("*.b.c", "10.0.0.2").unwrap();
        map.insert_spec("*", "10.0.0.3").unwrap();

        assert_eq!(map.lookup("a.b.c").unwrap()[0].host.as_str(), "10.0.0.1");
        assert_eq!(map.lookup("x.b.c").unwrap()[0].host.as_str(), "10.0.0.2");
        // One label deeper still hits the *.b.c wildcard via suffix walk.
        assert_eq!(map.lookup("y.x.b.c").unwrap()[0].host.as_str(), "10.0.0.2");
        assert_eq!(
            map.lookup("unknown.invalid").unwrap()[0].host.as_str(),
            "10.0.0.3"
        );
    }

    #[test]
    fn domain_map_without_catchall_misses() {
        let mut map = DomainMap::new();
        map.insert_spec("example.com", "10.0.0.1").unwrap();
        assert!(map.lookup("other.org").is_none());
        assert!(map.lookup("example.com").is_some());
        assert!(map.lookup("EXAMPLE.com").is_some());
    }
}
