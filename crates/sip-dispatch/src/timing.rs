// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Retransmission timing per RFC 3261 §17.
//!
//! A packet maps to one of three shapes: INVITE requests double their
//! interval without cap, other requests and final responses to INVITE double
//! up to T2, and everything else is sent once. Every schedule ends at the
//! 64·T1 hard limit, which is carried as a final non-firing element — the
//! queue treats it as the timeout marker.

use std::time::{Duration, Instant};

use sip_wire::{Method, Packet};

/// RTT estimate, RFC 3261 Table 4.
pub const T1_DEFAULT: Duration = Duration::from_millis(500);

/// Maximum retransmit interval for non-INVITE transactions.
pub const T2_DEFAULT: Duration = Duration::from_secs(4);

/// How a packet kind retransmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Geometric doubling, no interval cap (INVITE requests).
    Uncapped,
    /// Geometric doubling capped at T2.
    Capped,
    /// Single shot.
    None,
}

/// Derives retransmission schedules from T1/T2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    pub t1: Duration,
    pub t2: Duration,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            t1: T1_DEFAULT,
            t2: T2_DEFAULT,
        }
    }
}

impl RetransmitPolicy {
    /// The absolute retransmission window: 64·T1.
    pub fn hard_limit(&self) -> Duration {
        self.t1 * 64
    }

    /// Computes the absolute retransmit schedule for `packet`, or `None`
    /// when the packet kind never retransmits.
    ///
    /// The returned timestamps are strictly increasing; all but the last are
    /// firing instants, the last is `now + 64·T1` and only marks expiry.
    pub fn schedule_for(&self, packet: &Packet, now: Instant) -> Option<Vec<Instant>> {
        let cap = match Self::classify(packet) {
            Shape::None => return None,
            Shape::Uncapped => None,
            Shape::Capped => Some(self.t2),
        };

        let expire = now + self.hard_limit();
        let mut timeout = self.t1;
        let mut rtm = now + timeout;
        let mut schedule = Vec::new();
        while rtm < expire {
            schedule.push(rtm);
            timeout = match cap {
                Some(cap) => (timeout * 2).min(cap),
                None => timeout * 2,
            };
            rtm += timeout;
        }
        schedule.push(expire);
        Some(schedule)
    }

    fn classify(packet: &Packet) -> Shape {
        if packet.is_request() {
            return match packet.method() {
                Some(Method::Invite) => Shape::Uncapped,
                Some(Method::Ack) => Shape::None,
                _ => Shape::Capped,
            };
        }
        // Final responses to INVITE are retransmitted by the UAS until the
        // ACK arrives; everything else rides on the request retransmissions.
        match packet.code() {
            Some(code) if code > 100 && packet.cseq_method() == Some(Method::Invite) => {
                Shape::Capped
            }
            _ => Shape::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_wire::Headers;

    fn request(method: Method) -> Packet {
        let mut headers = Headers::new();
        headers.push("CSeq", format!("1 {}", method.as_str()));
        headers.push("Call-ID", "t1");
        Packet::request(method, "sip:a@example.com", headers)
    }

    fn response(code: u16, cseq_method: &str) -> Packet {
        let mut headers = Headers::new();
        headers.push("CSeq", format!("1 {}", cseq_method));
        headers.push("Call-ID", "t1");
        Packet::response(code, "x", headers)
    }

    fn offsets(schedule: &[Instant], base: Instant) -> Vec<f64> {
        schedule
            .iter()
            .map(|t| t.duration_since(base).as_secs_f64())
            .collect()
    }

    #[test]
    fn invite_doubles_without_cap() {
        let policy = RetransmitPolicy::default();
        let now = Instant::now();
        let schedule = policy.schedule_for(&request(Method::Invite), now).unwrap();
        assert_eq!(
            offsets(&schedule, now),
            vec![0.5, 1.5, 3.5, 7.5, 15.5, 31.5, 32.0]
        );
    }

    #[test]
    fn non_invite_caps_at_t2() {
        let policy = RetransmitPolicy::default();
        let now = Instant::now();
        let schedule = policy.schedule_for(&request(Method::Register), now).unwrap();
        assert_eq!(
            offsets(&schedule, now),
            vec![0.5, 1.5, 3.5, 7.5, 11.5, 15.5, 19.5, 23.5, 27.5, 31.5, 32.0]
        );
    }

    #[test]
    fn ack_never_retransmits() {
        let policy = RetransmitPolicy::default();
        assert!(policy
            .schedule_for(&request(Method::Ack), Instant::now())
            .is_none());
    }

    #[test]
    fn final_invite_response_retransmits_capped() {
        let policy = RetransmitPolicy::default();
        let now = Instant::now();
        let schedule = policy.schedule_for(&response(200, "INVITE"), now).unwrap();
        assert_eq!(offsets(&schedule, now)[..4], [0.5, 1.5, 3.5, 7.5]);
    }

    #[test]
    fn provisional_and_non_invite_responses_do_not_retransmit() {
        let policy = RetransmitPolicy::default();
        let now = Instant::now();
        assert!(policy.schedule_for(&response(100, "INVITE"), now).is_none());
        assert!(policy.schedule_for(&response(200, "BYE"), now).is_none());
    }

    #[test]
    fn schedule_is_strictly_increasing_and_ends_at_hard_limit() {
        let policy = RetransmitPolicy::default();
        let now = Instant::now();
        for packet in [request(Method::Invite), request(Method::Options)] {
            let schedule = policy.schedule_for(&packet, now).unwrap();
            for pair in schedule.windows(2) {
                assert!(pair[0] < pair[1], "schedule must increase");
            }
            let last = *schedule.last().unwrap();
            let delta = last.duration_since(now).as_secs_f64() - 32.0;
            assert!(delta.abs() < 0.001, "last element is the 64*T1 sentinel");
        }
    }

    #[test]
    fn custom_t1_scales_the_window() {
        let policy = RetransmitPolicy {
            t1: Duration::from_millis(100),
            t2: Duration::from_millis(400),
        };
        let now = Instant::now();
        let schedule = policy.schedule_for(&request(Method::Options), now).unwrap();
        let last = schedule.last().unwrap().duration_since(now);
        assert_eq!(last, Duration::from_millis(6400));
    }
}
