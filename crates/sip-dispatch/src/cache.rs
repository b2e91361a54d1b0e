// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::{Duration, Instant};

use dashmap::DashMap;
use smol_str::SmolStr;

use sip_wire::Packet;

/// How long a sent response stays answerable: about 64·T1.
pub const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(32);

#[derive(Debug, Clone)]
struct CacheEntry {
    packet: Packet,
    expire_at: Instant,
}

/// Stateless retransmission cache for sent responses, keyed `CSeq\0Call-ID`.
///
/// When a request retransmission arrives within the TTL, the cached response
/// is replayed by the dispatcher without involving the upper layer.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<SmolStr, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `response` under its cache key. Re-inserting refreshes expiry.
    pub fn insert(&self, response: &Packet, now: Instant) {
        self.entries.insert(
            response.cache_key(),
            CacheEntry {
                packet: response.clone(),
                expire_at: now + RESPONSE_CACHE_TTL,
            },
        );
    }

    /// Looks up a live entry; expired entries answer `None` even before the
    /// sweep evicts them.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<Packet> {
        let entry = self.entries.get(key)?;
        if entry.expire_at <= now {
            return None;
        }
        Some(entry.packet.clone())
    }

    /// Evicts expired entries and returns the earliest remaining expiry.
    pub fn sweep(&self, now: Instant) -> Option<Instant> {
        self.entries.retain(|_, entry| entry.expire_at > now);
        self.entries
            .iter()
            .map(|entry| entry.expire_at)
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_wire::Headers;

    fn response(cseq: &str, call_id: &str) -> Packet {
        let mut headers = Headers::new();
        headers.push("CSeq", cseq);
        headers.push("Call-ID", call_id);
        Packet::response(200, "OK", headers)
    }

    #[test]
    fn round_trips_by_cseq_and_call_id() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let resp = response("1 INVITE", "c1");
        cache.insert(&resp, now);

        let hit = cache.lookup("1 INVITE\0c1", now).expect("hit");
        assert_eq!(hit.code(), Some(200));
        assert!(cache.lookup("2 INVITE\0c1", now).is_none());
    }

    #[test]
    fn reinsert_overwrites_expiry() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let resp = response("1 INVITE", "c1");
        cache.insert(&resp, now);
        cache.insert(&resp, now + Duration::from_secs(10));
        assert_eq!(cache.len(), 1);
        // Still alive where the first insert alone would have expired.
        let later = now + Duration::from_secs(40);
        assert!(cache.lookup("1 INVITE\0c1", later).is_some());
    }

    #[test]
    fn expired_entries_answer_none_and_sweep_evicts() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        cache.insert(&response("1 INVITE", "c1"), now);

        let after = now + RESPONSE_CACHE_TTL + Duration::from_millis(1);
        assert!(cache.lookup("1 INVITE\0c1", after).is_none());
        assert_eq!(cache.sweep(after), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_returns_earliest_remaining_expiry() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        cache.insert(&response("1 INVITE", "c1"), now);
        cache.insert(&response("2 INVITE", "c2"), now + Duration::from_secs(5));

        let min = cache.sweep(now).expect("entries remain");
        assert_eq!(min, now + RESPONSE_CACHE_TTL);
    }
}
