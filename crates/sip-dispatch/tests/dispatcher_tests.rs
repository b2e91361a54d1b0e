// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queue behaviour: caching, retransmission, cancellation and timeouts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use sip_dispatch::{
    DeliverOptions, DeliveryCallback, DispatchError, Dispatcher, DispatcherConfig, PacketReceiver,
};
use sip_dns::{DnsClient, StaticDns};
use sip_legs::{HopAddr, Leg};
use sip_testkit::{build_invite, build_request, build_response, DeliverBehavior, MockLeg};
use sip_wire::{Method, Packet};

#[derive(Default)]
struct CollectingReceiver {
    seen: Mutex<Vec<(Packet, SocketAddr)>>,
}

impl CollectingReceiver {
    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl PacketReceiver for CollectingReceiver {
    async fn receive(&self, packet: Packet, _leg: Arc<dyn Leg>, from: SocketAddr) {
        self.seen.lock().unwrap().push((packet, from));
    }
}

fn recorder() -> (DeliveryCallback, Arc<Mutex<Vec<Option<DispatchError>>>>) {
    let log: Arc<Mutex<Vec<Option<DispatchError>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (
        Arc::new(move |err| sink.lock().unwrap().push(err)),
        log,
    )
}

fn dispatcher(legs: Vec<Arc<dyn Leg>>) -> Arc<Dispatcher> {
    Dispatcher::new(
        legs,
        DispatcherConfig {
            dns: Some(Arc::new(StaticDns::new()) as Arc<dyn DnsClient>),
            ..Default::default()
        },
    )
    .expect("dispatcher")
}

fn hop(leg: &MockLeg, host: &str, port: u16) -> HopAddr {
    HopAddr::new(leg.proto(), host, port)
}

#[tokio::test]
async fn cached_response_answers_request_retransmission() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let receiver = Arc::new(CollectingReceiver::default());
    dispatcher.set_receiver(receiver.clone());

    // UAS sends a 200 for (1 INVITE, c1) through us.
    let ok = build_response(200, "OK", "1 INVITE", "c1");
    dispatcher
        .deliver(
            ok,
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.2", 5060)),
                ..Default::default()
            },
        )
        .await;
    assert!(leg.wait_for_deliveries(1, Duration::from_secs(1)).await);

    // The peer retransmits the INVITE; the cache answers, the receiver
    // stays untouched.
    let from: SocketAddr = "192.0.2.9:5060".parse().unwrap();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKinv", "c1");
    dispatcher.receive(invite, leg.clone(), from).await;

    assert!(leg.wait_for_deliveries(2, Duration::from_secs(1)).await);
    let (replayed, dst) = leg.deliveries()[1].clone();
    assert_eq!(replayed.code(), Some(200));
    assert_eq!(dst.to_string(), "udp:192.0.2.9:5060");
    assert_eq!(receiver.count(), 0, "receiver must not see the request");
}

#[tokio::test]
async fn expired_cache_entry_reaches_the_receiver() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let receiver = Arc::new(CollectingReceiver::default());
    dispatcher.set_receiver(receiver.clone());

    let ok = build_response(200, "OK", "1 INVITE", "c1");
    dispatcher
        .deliver(
            ok,
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.2", 5060)),
                ..Default::default()
            },
        )
        .await;
    assert!(leg.wait_for_deliveries(1, Duration::from_secs(1)).await);

    // 32 s later the cache entry is swept.
    dispatcher.queue_expire(Instant::now() + Duration::from_secs(33));

    let from: SocketAddr = "192.0.2.9:5060".parse().unwrap();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKinv", "c1");
    dispatcher.receive(invite, leg.clone(), from).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(receiver.count(), 1, "request must reach the receiver");
    assert_eq!(leg.delivery_count(), 1, "no replay after expiry");
}

#[tokio::test]
async fn hung_transport_retransmits_then_cancel_stops_everything() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    leg.set_behavior(DeliverBehavior::Hang);
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let (callback, log) = recorder();

    let started = Instant::now();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKs4", "c4");
    let id = dispatcher
        .deliver(
            invite,
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(id.as_str(), "z9hG4bKs4|1 INVITE");
    assert!(leg.wait_for_deliveries(1, Duration::from_secs(1)).await);

    // 0.6 s in: the 0.5 s mark fired, exactly one retransmit.
    dispatcher.queue_expire(started + Duration::from_millis(600));
    assert!(leg.wait_for_deliveries(2, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(leg.delivery_count(), 2);

    // 0.8 s in: cancelled. Later sweeps must not send or call back.
    dispatcher.cancel_delivery(&id);
    dispatcher.cancel_delivery(&id); // idempotent
    dispatcher.queue_expire(started + Duration::from_secs(40));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(leg.delivery_count(), 2, "no sends after cancel");
    assert!(log.lock().unwrap().is_empty(), "no callbacks after cancel");
    assert_eq!(dispatcher.queue_len(), 0);
}

#[tokio::test]
async fn exhausted_schedule_times_out() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    leg.set_behavior(DeliverBehavior::Hang);
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let (callback, log) = recorder();

    let started = Instant::now();
    dispatcher
        .deliver(
            build_invite("sip:bob@example.com", "z9hG4bKto", "c5"),
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;

    // Everything including the 64*T1 sentinel elapses in one sweep.
    dispatcher.queue_expire(started + Duration::from_secs(33));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*log.lock().unwrap(), vec![Some(DispatchError::TimedOut)]);
    assert_eq!(dispatcher.queue_len(), 0);
}

#[tokio::test]
async fn single_shot_success_reports_and_leaves_queue() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let (callback, log) = recorder();

    dispatcher
        .deliver(
            build_request(Method::Ack, "sip:bob@example.com", "z9hG4bKack", "c6"),
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;

    assert!(leg.wait_for_deliveries(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*log.lock().unwrap(), vec![None]);
    assert_eq!(dispatcher.queue_len(), 0);
}

#[tokio::test]
async fn transport_error_on_single_shot_surfaces() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    leg.set_behavior(DeliverBehavior::Fail("socket closed".into()));
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let (callback, log) = recorder();

    dispatcher
        .deliver(
            build_request(Method::Ack, "sip:bob@example.com", "z9hG4bKerr", "c7"),
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;

    assert!(leg.wait_for_deliveries(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let log = log.lock().unwrap();
    assert!(matches!(log[0], Some(DispatchError::Transport(_))));
    assert_eq!(dispatcher.queue_len(), 0);
}

#[tokio::test]
async fn failed_candidate_advances_to_the_next() {
    // UDP leg refuses, TCP leg accepts; IP-literal resolution yields both
    // candidates in that order.
    let udp = MockLeg::udp("10.0.0.1:5060");
    udp.set_behavior(DeliverBehavior::Fail("port unreachable".into()));
    let tcp = MockLeg::tcp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![udp.clone() as Arc<dyn Leg>, tcp.clone()]);
    let (callback, log) = recorder();

    dispatcher
        .deliver(
            build_request(Method::Options, "sip:x@192.0.2.5:5070", "z9hG4bKadv", "c8"),
            DeliverOptions {
                do_retransmits: Some(false),
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;

    assert!(udp.wait_for_deliveries(1, Duration::from_secs(1)).await);
    assert!(tcp.wait_for_deliveries(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(tcp.deliveries()[0].1.to_string(), "tcp:192.0.2.5:5070");
    assert_eq!(*log.lock().unwrap(), vec![None], "second attempt won");
    assert_eq!(dispatcher.queue_len(), 0);
}

#[tokio::test]
async fn unresolvable_uri_fails_through_the_callback() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let (callback, log) = recorder();

    dispatcher
        .deliver(
            build_request(Method::Options, "sip:x@nowhere.invalid", "z9hG4bKnr", "c9"),
            DeliverOptions {
                callback: Some(callback),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![Some(DispatchError::HostUnreachable)]
    );
    assert_eq!(dispatcher.queue_len(), 0);
    assert_eq!(leg.delivery_count(), 0);
}

#[tokio::test]
async fn queue_expire_reports_next_wake() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    leg.set_behavior(DeliverBehavior::Hang);
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);

    let started = Instant::now();
    dispatcher
        .deliver(
            build_invite("sip:bob@example.com", "z9hG4bKwake", "c10"),
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                ..Default::default()
            },
        )
        .await;

    let wake = dispatcher
        .queue_expire(started + Duration::from_millis(600))
        .expect("pending work remains");
    // Next firing is the 1.5 s mark (small scheduling slack allowed).
    assert!(wake <= started + Duration::from_millis(1600));
    assert!(wake > started + Duration::from_millis(600));
}

#[tokio::test]
async fn without_receiver_inbound_requests_are_dropped() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    let dispatcher = dispatcher(vec![leg.clone() as Arc<dyn Leg>]);
    let from: SocketAddr = "192.0.2.9:5060".parse().unwrap();
    // Must not panic or deliver anything.
    dispatcher
        .receive(
            build_invite("sip:bob@example.com", "z9hG4bKdrop", "c11"),
            leg.clone(),
            from,
        )
        .await;
    assert_eq!(leg.delivery_count(), 0);
}

#[tokio::test]
async fn expiry_task_drives_retransmissions() {
    let leg = MockLeg::udp("10.0.0.1:5060");
    leg.set_behavior(DeliverBehavior::Hang);
    let dispatcher = Dispatcher::new(
        vec![leg.clone() as Arc<dyn Leg>],
        DispatcherConfig {
            dns: Some(Arc::new(StaticDns::new()) as Arc<dyn DnsClient>),
            policy: sip_dispatch::RetransmitPolicy {
                t1: Duration::from_millis(50),
                t2: Duration::from_millis(200),
            },
            ..Default::default()
        },
    )
    .unwrap();
    let tick = dispatcher.spawn_expiry();

    dispatcher
        .deliver(
            build_invite("sip:bob@example.com", "z9hG4bKtick", "c12"),
            DeliverOptions {
                leg: Some(leg.clone()),
                dst_addr: Some(hop(&leg, "192.0.2.7", 5060)),
                ..Default::default()
            },
        )
        .await;

    // With T1=50ms the whole 64*T1 window is 3.2s; the 1 Hz sweep fires a
    // few retransmissions along the way.
    assert!(leg.wait_for_deliveries(2, Duration::from_secs(3)).await);
    tick.cancel();
}
