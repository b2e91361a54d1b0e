// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use smol_str::SmolStr;

use sip_legs::{HopAddr, Leg};
use sip_wire::{Packet, Proto};

use crate::DispatchError;

/// Completion hook of a queued delivery: called with `None` on success and
/// with the error otherwise. Shared so it can be invoked without holding the
/// queue lock, which keeps `cancel_delivery` safe to call from inside it.
pub type DeliveryCallback = Arc<dyn Fn(Option<DispatchError>) + Send + Sync>;

/// One resolved delivery attempt: which leg sends to which address.
///
/// Keeping leg and address in a single pair (rather than two parallel lists)
/// makes it impossible for them to go out of step.
#[derive(Clone)]
pub struct Target {
    pub leg: Arc<dyn Leg>,
    pub addr: HopAddr,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("leg", &self.leg.key())
            .field("addr", &self.addr)
            .finish()
    }
}

/// Lifecycle states of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for the hop resolver.
    Unresolved,
    /// Targets known; sends and retransmissions may happen.
    InFlight,
}

/// Events driving a queue entry through its state machine.
#[derive(Debug)]
pub enum DispatchEvent {
    /// Hop resolution finished.
    Resolved(Result<Vec<Target>, DispatchError>),
    /// A transport send attempt returned.
    SendComplete(Result<(), DispatchError>),
    /// A retransmit instant elapsed.
    RetransmitDue,
    /// The 64·T1 sentinel elapsed.
    Expired,
    /// The delivery was cancelled by id.
    Cancelled,
}

/// One in-flight delivery owned by the dispatcher's queue.
pub struct QueueEntry {
    /// Cancellation key; defaults to the packet's transaction id.
    pub id: SmolStr,
    pub packet: Packet,
    /// Candidate attempts in priority order; the head is the current target.
    pub targets: Vec<Target>,
    /// Firing instants, strictly increasing; the last element is the expiry
    /// sentinel, not a retransmit. `None` means single-shot.
    pub retransmits: Option<Vec<Instant>>,
    pub callback: Option<DeliveryCallback>,
    /// Restricts acceptable protocols during resolution.
    pub allowed_protos: Option<Vec<Proto>>,
    /// Restricts acceptable legs during resolution.
    pub allowed_legs: Option<Vec<Arc<dyn Leg>>>,
    pub created_at: Instant,
    pub state: EntryState,
}

impl QueueEntry {
    /// The attempt currently being sent to.
    pub fn current_target(&self) -> Option<&Target> {
        self.targets.first()
    }

    /// Drops the head target after a failed attempt so the next candidate is
    /// tried. The last candidate is never dropped: retransmissions still
    /// need somewhere to go. Returns whether an advance happened.
    pub fn advance_target(&mut self) -> bool {
        if self.targets.len() > 1 {
            self.targets.remove(0);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("targets", &self.targets)
            .field(
                "retransmits",
                &self.retransmits.as_ref().map(|r| r.len()),
            )
            .finish_non_exhaustive()
    }
}
