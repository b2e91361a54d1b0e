// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use smol_str::SmolStr;

use sip_wire::Proto;

/// A concrete delivery target: `proto:host:port`.
///
/// The host may still be a DNS name after hop resolution (SRV targets are
/// names); legs resolve it when they actually send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HopAddr {
    pub proto: Proto,
    pub host: SmolStr,
    pub port: u16,
}

impl HopAddr {
    pub fn new(proto: Proto, host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            proto,
            host: host.into(),
            port,
        }
    }

    /// Builds a target from a peer socket address (response return path).
    pub fn from_socket(proto: Proto, addr: SocketAddr) -> Self {
        Self {
            proto,
            host: SmolStr::new(addr.ip().to_string()),
            port: addr.port(),
        }
    }

    /// Parses the configuration form `[proto:]host[:port]`.
    ///
    /// The protocol and port stay optional so callers can expand one entry
    /// into a candidate per allowed protocol.
    pub fn parse_spec(input: &str) -> Option<(Option<Proto>, SmolStr, Option<u16>)> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let (proto, rest) = match input.split_once(':') {
            Some((head, rest)) if Proto::parse(head).is_some() => (Proto::parse(head), rest),
            _ => (None, input),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => return None,
            },
            _ => (rest, None),
        };
        if host.is_empty() {
            return None;
        }
        Some((proto, SmolStr::new(host.to_ascii_lowercase()), port))
    }

    /// Returns the host parsed as an IP address, if it is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Resolves this target to a socket address, looking the host up via the
    /// system resolver when it is not a literal.
    pub async fn to_socket_addr(&self) -> Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .ok_or_else(|| anyhow!("no address for {}", self.host))
    }

    /// Returns a copy with the host replaced (hostname→IP substitution).
    pub fn with_host(&self, host: impl Into<SmolStr>) -> Self {
        Self {
            proto: self.proto,
            host: host.into(),
            port: self.port,
        }
    }
}

impl fmt::Display for HopAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.proto, self.host, self.port)
    }
}
