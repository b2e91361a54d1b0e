// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Contact rewriting for the stateless forwarder.
//!
//! Outbound `Contact` headers are replaced with an opaque token at the
//! proxy's own address so later in-dialog requests route back through it;
//! inbound contacts carrying such a token are restored to the original
//! `user@host`. The transform must be reversible without state — the default
//! is an XOR stream keyed off the leg set, with a plaintext marker proving a
//! decode actually hit one of our tokens.

use std::sync::Arc;

use sip_legs::Leg;
use sip_wire::Packet;

/// Trailing marker appended before encoding; its absence after the reverse
/// transform rejects foreign hex strings.
const MARKER: &[u8] = b"MARKER";

/// Reversible `user@host` ↔ token transform. Implementations must satisfy
/// `decode(encode(x)) == Some(x)` and reject tokens they did not produce.
pub trait ContactRewriter: Send + Sync + 'static {
    fn encode(&self, user_host: &str) -> String;
    fn decode(&self, token: &str) -> Option<String>;
}

/// Default rewriter: XOR with a key derived from all legs, hex-encoded.
///
/// Every proxy instance fronting the same leg set derives the same key, so
/// tokens survive restarts without shared storage.
pub struct XorContactRewriter {
    key: Vec<u8>,
}

impl XorContactRewriter {
    /// Derives the key from the legs' `proto:addr:port` identities, sorted
    /// so registration order does not matter.
    pub fn from_legs(legs: &[Arc<dyn Leg>]) -> Self {
        let mut ids: Vec<String> = legs
            .iter()
            .map(|leg| {
                let local = leg.local_addr();
                format!("{}:{}:{}", leg.proto(), local.ip(), local.port())
            })
            .collect();
        ids.sort();
        let digest = md5::compute(ids.concat());
        Self {
            key: digest.0.to_vec(),
        }
    }

    /// Uses an explicit key (tests, or key continuity across leg changes).
    pub fn with_key(key: Vec<u8>) -> Self {
        assert!(!key.is_empty(), "rewriter key must not be empty");
        Self { key }
    }

    fn xor(&self, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()];
        }
    }
}

impl ContactRewriter for XorContactRewriter {
    fn encode(&self, user_host: &str) -> String {
        let mut data = user_host.as_bytes().to_vec();
        data.extend_from_slice(MARKER);
        self.xor(&mut data);
        let mut out = String::with_capacity(data.len() * 2);
        for byte in &data {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    fn decode(&self, token: &str) -> Option<String> {
        if token.len() % 2 != 0 || token.is_empty() {
            return None;
        }
        let mut data = Vec::with_capacity(token.len() / 2);
        for chunk in token.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(chunk).ok()?;
            data.push(u8::from_str_radix(pair, 16).ok()?);
        }
        self.xor(&mut data);
        if !data.ends_with(MARKER) {
            return None;
        }
        data.truncate(data.len() - MARKER.len());
        String::from_utf8(data).ok()
    }
}

/// Rewrites every `Contact` header in place for forwarding through
/// `outgoing`. See the module docs for the two directions.
pub fn rewrite_contacts(packet: &mut Packet, rewriter: &dyn ContactRewriter, outgoing: &dyn Leg) {
    let values: Vec<String> = packet
        .headers
        .get_all("Contact")
        .map(|v| v.to_string())
        .collect();
    for (idx, value) in values.iter().enumerate() {
        if let Some(rewritten) = rewrite_contact_value(value, rewriter, outgoing) {
            packet.headers.set_nth("Contact", idx, rewritten);
        }
    }
}

/// Rewrites one `Contact` value, preserving display name, brackets and
/// parameters around the URI. Returns `None` when the value carries no
/// rewritable `sip:`/`sips:` URI with a user part.
fn rewrite_contact_value(
    value: &str,
    rewriter: &dyn ContactRewriter,
    outgoing: &dyn Leg,
) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let scheme_start = lower.find("sips:").or_else(|| lower.find("sip:"))?;
    let scheme_len = if lower[scheme_start..].starts_with("sips:") {
        5
    } else {
        4
    };
    let scheme = &value[scheme_start..scheme_start + scheme_len - 1];

    // The URI core runs to the closing bracket or the first parameter.
    let rest = &value[scheme_start + scheme_len..];
    let core_end = rest
        .find(|c| c == '>' || c == ';')
        .unwrap_or(rest.len());
    let core = &rest[..core_end];

    let (user, _host) = core.split_once('@')?;
    // A hex-only user part looks like a token we minted earlier; a failed
    // decode (an unlucky real username like "abc") falls through to encode.
    let restored = if !user.is_empty() && user.bytes().all(|b| b.is_ascii_hexdigit()) {
        rewriter.decode(user)
    } else {
        None
    };
    let replacement = match restored {
        Some(original) => format!("{}:{}", scheme, original),
        None => {
            let local = outgoing.local_addr();
            format!(
                "{}:{}@{}:{}",
                scheme,
                rewriter.encode(core),
                local.ip(),
                local.port()
            )
        }
    };

    let mut out = String::with_capacity(value.len() + replacement.len());
    out.push_str(&value[..scheme_start]);
    out.push_str(&replacement);
    out.push_str(&rest[core_end..]);
    Some(out)
}
