// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::Proto;

/// Parsed SIP URI (RFC 3261 §19), reduced to the parts hop selection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub raw: SmolStr,
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl SipUri {
    /// Attempts to parse a `sip:` or `sips:` URI, tolerating angle brackets
    /// and a display name around it as found in `Route` and `Contact` values.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let inner = match trimmed.find('<') {
            Some(open) => {
                let close = trimmed[open..].find('>')? + open;
                &trimmed[open + 1..close]
            }
            None => trimmed,
        };

        let (scheme, rest) = inner.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let mut parts = rest.split(';');
        let base = parts.next()?.trim();
        let mut params = BTreeMap::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                ),
                None => params.insert(SmolStr::new(param.to_ascii_lowercase()), None),
            };
        }

        let (user, host_port) = match base.split_once('@') {
            Some((user, host)) => (Some(SmolStr::new(user.trim())), host.trim()),
            None => (None, base),
        };
        if host_port.is_empty() {
            return None;
        }
        let (host, port) = split_host_port(host_port)?;

        Some(Self {
            raw: SmolStr::new(inner),
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns the `transport=` URI parameter, if present and recognised.
    pub fn transport_param(&self) -> Option<Proto> {
        self.params
            .get("transport")?
            .as_ref()
            .and_then(|v| Proto::parse(v))
    }

    /// Default port implied by the scheme when the URI carries none.
    pub fn default_port(&self) -> u16 {
        if self.sips {
            5061
        } else {
            5060
        }
    }

    /// Returns the textual form this URI was parsed from.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw.as_str())
    }
}

/// Splits `host[:port]`, handling bracketed IPv6 literals.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        if let Some(port) = tail.strip_prefix(':') {
            return Some((host, Some(port.parse().ok()?)));
        }
        return Some((host, None));
    }
    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        _ => Some((input, None)),
    }
}
