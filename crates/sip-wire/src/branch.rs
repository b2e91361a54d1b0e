// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::Packet;

/// Generates a fresh RFC 3261 magic-cookie branch identifier.
pub fn generate_branch() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

/// Derives the branch a leg stamps into its own `Via` when sending a request.
///
/// Retransmissions re-serialise the queued packet, so this must come out
/// identical every time; forwarded requests must also get a branch distinct
/// from the client's. Fingerprinting the transaction fields (including any
/// existing top branch) with MD5 gives both without mutating the stored
/// packet.
pub fn derived_branch(packet: &Packet) -> SmolStr {
    let branch = packet.branch().unwrap_or_default();
    let cseq = packet.cseq_raw().map(|s| s.as_str()).unwrap_or_default();
    let call_id = packet.call_id().map(|s| s.as_str()).unwrap_or_default();
    let uri = packet.uri().map(|s| s.as_str()).unwrap_or_default();
    let digest = md5::compute(format!("{}\0{}\0{}\0{}", branch, cseq, call_id, uri));
    SmolStr::new(format!("z9hG4bK{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Headers, Method};

    #[test]
    fn generated_branch_has_magic_cookie() {
        let branch = generate_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branch.len() > "z9hG4bK".len());
    }

    #[test]
    fn generated_branches_differ() {
        assert_ne!(generate_branch(), generate_branch());
    }

    #[test]
    fn derived_branch_is_stable() {
        let mut headers = Headers::new();
        headers.push("CSeq", "1 OPTIONS");
        headers.push("Call-ID", "c1");
        let packet = Packet::request(Method::Options, "sip:a@example.com", headers);
        let first = derived_branch(&packet);
        assert!(first.starts_with("z9hG4bK"));
        assert_eq!(first, derived_branch(&packet));
    }
}
