// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use sip_dns::{DnsClient, SystemDns};
use sip_legs::{HopAddr, Inbound, Leg, LegKey};
use sip_wire::{Packet, Proto};

use crate::{
    DeliveryCallback, DispatchError, DispatchEvent, DomainMap, EntryState, HopCandidate,
    HopResolver, LegCriteria, LegRegistry, QueueEntry, ResponseCache, RetransmitPolicy, Target,
};

/// Upper layer the dispatcher hands demultiplexed packets to.
#[async_trait]
pub trait PacketReceiver: Send + Sync + 'static {
    async fn receive(&self, packet: Packet, leg: Arc<dyn Leg>, from: SocketAddr);
}

/// Per-call options for [`Dispatcher::deliver`].
#[derive(Default)]
pub struct DeliverOptions {
    /// Cancellation key; defaults to the packet's transaction id.
    pub id: Option<SmolStr>,
    /// Pins the sending leg. Together with `dst_addr` this skips resolution
    /// entirely; alone it restricts which legs resolution may pick.
    pub leg: Option<Arc<dyn Leg>>,
    /// Pins the destination, skipping URI resolution.
    pub dst_addr: Option<HopAddr>,
    /// Full pre-resolved candidate list (leg/address pairs). Takes
    /// precedence over `leg`/`dst_addr` when non-empty.
    pub targets: Option<Vec<Target>>,
    /// Overrides the dispatcher-wide retransmission switch.
    pub do_retransmits: Option<bool>,
    pub callback: Option<DeliveryCallback>,
    /// Restricts acceptable protocols during resolution.
    pub allowed_protos: Option<Vec<Proto>>,
}

/// Construction parameters for [`Dispatcher::new`].
pub struct DispatcherConfig {
    /// DNS backend; defaults to the system resolver.
    pub dns: Option<Arc<dyn DnsClient>>,
    /// Global outgoing proxy as `[proto:]host[:port]`.
    pub outgoing_proxy: Option<String>,
    /// Static per-domain proxy table.
    pub domain2proxy: DomainMap,
    /// Dispatcher-wide retransmission switch.
    pub do_retransmits: bool,
    pub policy: RetransmitPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dns: None,
            outgoing_proxy: None,
            domain2proxy: DomainMap::new(),
            do_retransmits: true,
            policy: RetransmitPolicy::default(),
        }
    }
}

/// Cancellable handle for a timer started through the dispatcher.
pub struct TimerHandle {
    handle: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// The dispatch core.
///
/// Owns the leg registry, the delivery queue, the response cache and the hop
/// resolver. All async work (leg receive loops, send attempts, the expiry
/// tick) runs in tasks holding only weak or short-lived references back.
pub struct Dispatcher {
    registry: LegRegistry,
    queue: Mutex<Vec<QueueEntry>>,
    cache: ResponseCache,
    resolver: HopResolver,
    receiver: RwLock<Option<Arc<dyn PacketReceiver>>>,
    do_retransmits: bool,
    policy: RetransmitPolicy,
}

impl Dispatcher {
    /// Builds a dispatcher and registers the initial legs.
    ///
    /// Must run inside a tokio runtime: leg receive loops are spawned here.
    /// Configuration errors (a malformed outgoing proxy) fail construction.
    pub fn new(legs: Vec<Arc<dyn Leg>>, config: DispatcherConfig) -> Result<Arc<Self>> {
        let dns = config
            .dns
            .unwrap_or_else(|| Arc::new(SystemDns::new()) as Arc<dyn DnsClient>);
        let resolver =
            HopResolver::new(dns, config.domain2proxy, config.outgoing_proxy.as_deref())?;
        let dispatcher = Arc::new(Self {
            registry: LegRegistry::new(),
            queue: Mutex::new(Vec::new()),
            cache: ResponseCache::new(),
            resolver,
            receiver: RwLock::new(None),
            do_retransmits: config.do_retransmits,
            policy: config.policy,
        });
        for leg in legs {
            dispatcher.add_leg(leg);
        }
        Ok(dispatcher)
    }

    /// Installs the upper-layer receiver.
    pub fn set_receiver(&self, receiver: Arc<dyn PacketReceiver>) {
        *self.receiver.write().unwrap() = Some(receiver);
    }

    /// Registers a leg and spawns its receive plumbing: one task running the
    /// leg's socket loop, one draining parsed packets into [`receive`].
    /// The drain task holds only a weak dispatcher reference.
    ///
    /// [`receive`]: Dispatcher::receive
    pub fn add_leg(self: &Arc<Self>, leg: Arc<dyn Leg>) {
        let (tx, mut rx) = mpsc::channel::<Inbound>(64);

        let run_leg = leg.clone();
        let run_task = tokio::spawn(async move {
            if let Err(e) = run_leg.run(tx).await {
                warn!(key = ?run_leg.key(), error = %e, "leg receive loop ended");
            }
        });

        let weak = Arc::downgrade(self);
        let drain_leg = leg.clone();
        let drain_task = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let Some(dispatcher) = weak.upgrade() else { break };
                dispatcher
                    .receive(inbound.packet, drain_leg.clone(), inbound.from)
                    .await;
            }
        });

        self.registry
            .add(leg, vec![run_task.abort_handle(), drain_task.abort_handle()]);
    }

    /// Removes a leg by identity; its receive tasks are aborted with it.
    pub fn remove_leg(&self, key: LegKey) -> bool {
        self.registry.remove(key)
    }

    /// Legs matching the criteria; empty criteria return all.
    pub fn get_legs(&self, criteria: &LegCriteria) -> Vec<Arc<dyn Leg>> {
        self.registry.matching(criteria)
    }

    /// Submits a packet for delivery and returns its queue id.
    ///
    /// Responses are inserted into the response cache and must arrive with
    /// `leg` and `dst_addr` pinned — their return path is the top `Via`, not
    /// a URI, so sending one without a known path is a programmer error.
    /// All failures after this point are reported through the callback; this
    /// method itself never fails.
    pub async fn deliver(self: &Arc<Self>, packet: Packet, opts: DeliverOptions) -> SmolStr {
        let now = Instant::now();
        let has_pinned_path = opts.targets.as_ref().is_some_and(|t| !t.is_empty())
            || (opts.leg.is_some() && opts.dst_addr.is_some());
        if packet.is_response() {
            self.cache.insert(&packet, now);
            assert!(
                has_pinned_path,
                "response delivery requires leg and dst_addr"
            );
        }

        let id = opts.id.unwrap_or_else(|| packet.tid());
        let do_retransmits = opts.do_retransmits.unwrap_or(self.do_retransmits);
        let retransmits = if do_retransmits {
            self.policy.schedule_for(&packet, now)
        } else {
            None
        };

        let mut allowed_legs: Option<Vec<Arc<dyn Leg>>> = None;
        let targets: Vec<Target> = if let Some(targets) =
            opts.targets.filter(|t| !t.is_empty())
        {
            targets
        } else {
            match (opts.leg, opts.dst_addr) {
                (Some(leg), Some(addr)) => vec![Target { leg, addr }],
                (None, Some(addr)) => {
                    // Destination known, leg not: pick the first leg that
                    // can carry it.
                    let leg = self.registry.all().into_iter().find(|leg| {
                        leg.can_deliver_to(
                            Some(addr.proto),
                            Some(addr.host.as_str()),
                            Some(addr.port),
                        )
                    });
                    match leg {
                        Some(leg) => vec![Target { leg, addr }],
                        None => {
                            if let Some(cb) = &opts.callback {
                                cb(Some(DispatchError::HostUnreachable));
                            }
                            return id;
                        }
                    }
                }
                (Some(leg), None) => {
                    allowed_legs = Some(vec![leg]);
                    Vec::new()
                }
                (None, None) => Vec::new(),
            }
        };

        let state = if targets.is_empty() {
            EntryState::Unresolved
        } else {
            EntryState::InFlight
        };
        let entry = QueueEntry {
            id: id.clone(),
            packet,
            targets,
            retransmits,
            callback: opts.callback,
            allowed_protos: opts.allowed_protos,
            allowed_legs,
            created_at: now,
            state,
        };
        self.queue.lock().unwrap().push(entry);

        match state {
            EntryState::InFlight => self.spawn_send(&id),
            EntryState::Unresolved => {
                // Re-read under the lock: a concurrent cancel may already
                // have removed the entry.
                let snapshot = {
                    let queue = self.queue.lock().unwrap();
                    queue.iter().find(|e| e.id == id).map(|entry| {
                        (
                            entry.packet.uri().cloned().unwrap_or_default(),
                            entry.allowed_protos.clone(),
                            entry.allowed_legs.clone(),
                        )
                    })
                };
                let Some((uri, protos, legs)) = snapshot else {
                    return id;
                };
                let result = self
                    .resolver
                    .resolve(
                        &uri,
                        protos.as_deref(),
                        legs.as_deref(),
                        &self.registry.all(),
                    )
                    .await;
                self.step(&id, DispatchEvent::Resolved(result));
            }
        }
        id
    }

    /// Removes every queued delivery matching `id`. Idempotent; a cancelled
    /// entry gets no further callbacks, and late transport completions for
    /// it are dropped.
    pub fn cancel_delivery(&self, id: &str) {
        let removed = {
            let mut queue = self.queue.lock().unwrap();
            let before = queue.len();
            queue.retain(|entry| entry.id != id);
            before - queue.len()
        };
        if removed > 0 {
            debug!(id, removed, "cancelled delivery");
        }
    }

    /// Inbound entry point. Requests answerable from the response cache are
    /// answered here — the receiver never sees them; everything else goes to
    /// the registered receiver, or is dropped when none is set.
    pub async fn receive(self: &Arc<Self>, packet: Packet, leg: Arc<dyn Leg>, from: SocketAddr) {
        if packet.is_request() {
            let key = packet.cache_key();
            if let Some(cached) = self.cache.lookup(&key, Instant::now()) {
                debug!(%from, "answering retransmitted request from response cache");
                let opts = DeliverOptions {
                    leg: Some(leg.clone()),
                    dst_addr: Some(HopAddr::from_socket(leg.proto(), from)),
                    ..Default::default()
                };
                self.deliver(cached, opts).await;
                return;
            }
        }
        let receiver = self.receiver.read().unwrap().clone();
        match receiver {
            Some(receiver) => receiver.receive(packet, leg, from).await,
            None => debug!(%from, "no receiver installed, dropping packet"),
        }
    }

    /// Periodic queue and cache sweep.
    ///
    /// Pops elapsed retransmit instants (re-sending when any fired), expires
    /// entries whose sentinel passed with `ETIMEDOUT`, evicts stale cache
    /// rows, and returns the earliest pending instant so callers can
    /// schedule a finer wake than the 1 Hz tick.
    pub fn queue_expire(self: &Arc<Self>, now: Instant) -> Option<Instant> {
        let mut expired = Vec::new();
        let mut due = Vec::new();
        let mut min_wake: Option<Instant> = None;
        {
            let mut queue = self.queue.lock().unwrap();
            for entry in queue.iter_mut() {
                let Some(schedule) = entry.retransmits.as_mut() else {
                    continue;
                };
                let mut fired = false;
                while schedule.first().is_some_and(|t| *t < now) {
                    schedule.remove(0);
                    fired = true;
                }
                if schedule.is_empty() {
                    expired.push(entry.id.clone());
                } else {
                    if fired {
                        due.push(entry.id.clone());
                    }
                    min_wake = merge_min(min_wake, schedule.first().copied());
                }
            }
        }
        for id in expired {
            self.step(&id, DispatchEvent::Expired);
        }
        for id in due {
            self.step(&id, DispatchEvent::RetransmitDue);
        }
        merge_min(min_wake, self.cache.sweep(now))
    }

    /// Spawns the 1 Hz expiry tick. The task holds a weak reference and dies
    /// with the dispatcher.
    pub fn spawn_expiry(self: &Arc<Self>) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let Some(dispatcher) = weak.upgrade() else { break };
                dispatcher.queue_expire(Instant::now());
            }
        });
        TimerHandle {
            handle: task.abort_handle(),
        }
    }

    /// One-shot (or repeating) timer on the dispatcher's runtime.
    pub fn add_timer<F>(&self, delay: Duration, repeat: Option<Duration>, mut f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
            if let Some(period) = repeat {
                let mut tick = tokio::time::interval(period);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    f();
                }
            }
        });
        TimerHandle {
            handle: task.abort_handle(),
        }
    }

    /// Resolves a URI against the current legs. See [`HopResolver::resolve`].
    pub async fn resolve_uri(
        &self,
        uri: &str,
        allowed_protos: Option<&[Proto]>,
        allowed_legs: Option<&[Arc<dyn Leg>]>,
    ) -> Result<Vec<Target>, DispatchError> {
        self.resolver
            .resolve(uri, allowed_protos, allowed_legs, &self.registry.all())
            .await
    }

    /// Host → IP through the configured DNS client (`EINVAL` on failure).
    pub async fn dns_host2ip(&self, host: &str) -> Result<std::net::IpAddr, DispatchError> {
        self.resolver.host2ip(host).await
    }

    /// SRV (with address fallback) hop discovery for a bare domain.
    pub async fn dns_domain2srv(
        &self,
        domain: &str,
        protos: &[Proto],
        default_port: u16,
    ) -> Vec<HopCandidate> {
        self.resolver
            .dns_candidates(domain, default_port, protos)
            .await
    }

    /// Number of queued deliveries (test and introspection aid).
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Applies one state-machine event to the entry with `id`. Events for
    /// ids no longer queued are dropped — that is what makes cancellation
    /// and removal safe against late completions.
    fn step(self: &Arc<Self>, id: &SmolStr, event: DispatchEvent) {
        enum FollowUp {
            None,
            Send,
            Callback(Option<DeliveryCallback>, Option<DispatchError>),
        }

        let follow_up = {
            let mut queue = self.queue.lock().unwrap();
            let Some(pos) = queue.iter().position(|e| &e.id == id) else {
                debug!(%id, ?event, "event for unqueued entry dropped");
                return;
            };
            match event {
                DispatchEvent::Resolved(Ok(targets)) => {
                    let entry = &mut queue[pos];
                    entry.targets = targets;
                    entry.state = EntryState::InFlight;
                    FollowUp::Send
                }
                DispatchEvent::Resolved(Err(e)) => {
                    let entry = queue.remove(pos);
                    FollowUp::Callback(entry.callback, Some(e))
                }
                DispatchEvent::SendComplete(Ok(())) => {
                    // Transport took ownership; single-shot entries report
                    // success, retransmitting entries just leave the queue.
                    let entry = queue.remove(pos);
                    if entry.retransmits.is_none() {
                        FollowUp::Callback(entry.callback, None)
                    } else {
                        FollowUp::None
                    }
                }
                DispatchEvent::SendComplete(Err(e)) => {
                    let entry = &mut queue[pos];
                    if entry.advance_target() {
                        FollowUp::Send
                    } else if entry.retransmits.is_some() {
                        // Stays queued; the next retransmit may succeed.
                        FollowUp::Callback(entry.callback.clone(), Some(e))
                    } else {
                        let entry = queue.remove(pos);
                        FollowUp::Callback(entry.callback, Some(e))
                    }
                }
                DispatchEvent::RetransmitDue => FollowUp::Send,
                DispatchEvent::Expired => {
                    let entry = queue.remove(pos);
                    FollowUp::Callback(entry.callback, Some(DispatchError::TimedOut))
                }
                DispatchEvent::Cancelled => {
                    queue.remove(pos);
                    FollowUp::None
                }
            }
        };

        match follow_up {
            FollowUp::None => {}
            FollowUp::Send => self.spawn_send(id),
            FollowUp::Callback(callback, error) => {
                if let Some(cb) = callback {
                    cb(error);
                }
            }
        }
    }

    /// Starts one send attempt towards the entry's head target. The attempt
    /// runs in its own task so a hung transport (TCP connect in progress)
    /// cannot stall the queue; its completion re-enters [`step`].
    ///
    /// [`step`]: Dispatcher::step
    fn spawn_send(self: &Arc<Self>, id: &SmolStr) {
        let (leg, addr, packet) = {
            let queue = self.queue.lock().unwrap();
            let Some(entry) = queue.iter().find(|e| &e.id == id) else {
                return;
            };
            let Some(target) = entry.current_target() else {
                debug!(%id, "send requested before resolution; skipping");
                return;
            };
            (target.leg.clone(), target.addr.clone(), entry.packet.clone())
        };

        let weak = Arc::downgrade(self);
        let id = id.clone();
        tokio::spawn(async move {
            let result = leg
                .deliver(&packet, &addr)
                .await
                .map_err(|e| DispatchError::Transport(e.to_string()));
            if let Err(e) = &result {
                debug!(%id, %addr, error = %e, "send attempt failed");
            }
            let Some(dispatcher) = weak.upgrade() else {
                return;
            };
            dispatcher.step(&id, DispatchEvent::SendComplete(result));
        });
    }
}

fn merge_min(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
