// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tokio::task::AbortHandle;
use tracing::debug;

use sip_legs::{Leg, LegKey};
use sip_wire::Proto;

/// Conjunctive leg selection criteria; `None` fields always match.
#[derive(Default, Clone)]
pub struct LegCriteria {
    pub proto: Option<Proto>,
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub key: Option<LegKey>,
    pub predicate: Option<Arc<dyn Fn(&dyn Leg) -> bool + Send + Sync>>,
}

impl LegCriteria {
    fn matches(&self, leg: &dyn Leg) -> bool {
        if let Some(proto) = self.proto {
            if leg.proto() != proto {
                return false;
            }
        }
        if let Some(addr) = self.addr {
            if leg.local_addr().ip() != addr {
                return false;
            }
        }
        if let Some(port) = self.port {
            if leg.local_addr().port() != port {
                return false;
            }
        }
        if let Some(key) = self.key {
            if leg.key() != key {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(leg) {
                return false;
            }
        }
        true
    }
}

struct RegisteredLeg {
    leg: Arc<dyn Leg>,
    tasks: Vec<AbortHandle>,
}

impl Drop for RegisteredLeg {
    fn drop(&mut self) {
        // A leg leaving the registry takes its receive tasks with it; no
        // inbound handler may outlive the registration.
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Owns the legs plus the receive tasks wired to each.
///
/// Order is preserved: the first registered leg that matches wins wherever a
/// single leg is picked.
#[derive(Default)]
pub struct LegRegistry {
    legs: RwLock<Vec<RegisteredLeg>>,
}

impl LegRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a leg together with the abort handles of its receive tasks.
    pub fn add(&self, leg: Arc<dyn Leg>, tasks: Vec<AbortHandle>) {
        debug!(key = ?leg.key(), "registering leg");
        self.legs.write().unwrap().push(RegisteredLeg { leg, tasks });
    }

    /// Removes a leg by identity; its receive tasks are aborted. Returns
    /// whether anything was removed.
    pub fn remove(&self, key: LegKey) -> bool {
        let mut legs = self.legs.write().unwrap();
        let before = legs.len();
        legs.retain(|entry| entry.leg.key() != key);
        before != legs.len()
    }

    /// Snapshot of every registered leg in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Leg>> {
        self.legs
            .read()
            .unwrap()
            .iter()
            .map(|entry| entry.leg.clone())
            .collect()
    }

    /// All legs matching the criteria; empty criteria return everything.
    pub fn matching(&self, criteria: &LegCriteria) -> Vec<Arc<dyn Leg>> {
        self.legs
            .read()
            .unwrap()
            .iter()
            .filter(|entry| criteria.matches(entry.leg.as_ref()))
            .map(|entry| entry.leg.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.legs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
