// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The dispatch core: everything between the transport legs and the
//! transaction/application layer.
//!
//! Owns the delivery queue with RFC 3261 §17 retransmission timing, the
//! stateless response cache, the leg registry, and the URI→hop resolver.
//! Outbound traffic enters through [`Dispatcher::deliver`]; inbound traffic
//! is demultiplexed by [`Dispatcher::receive`] to the registered
//! [`PacketReceiver`] unless a cached response answers it first.

mod cache;
mod dispatcher;
mod error;
mod queue;
mod registry;
mod resolve;
mod timing;

pub use cache::{ResponseCache, RESPONSE_CACHE_TTL};
pub use dispatcher::{
    DeliverOptions, Dispatcher, DispatcherConfig, PacketReceiver, TimerHandle,
};
pub use error::DispatchError;
pub use queue::{DeliveryCallback, DispatchEvent, EntryState, QueueEntry, Target};
pub use registry::{LegCriteria, LegRegistry};
pub use resolve::{DomainMap, HopCandidate, HopResolver};
pub use timing::{RetransmitPolicy, T1_DEFAULT, T2_DEFAULT};
