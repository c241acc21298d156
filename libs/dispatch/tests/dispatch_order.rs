//! End-to-end dispatch tests: supervisor thread, actor threads, and a
//! loopback network driven from the test.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use mtnet_dispatch::{
    handler_fn, ConnectionActor, ConnectionContext, Handler, HostSupervisor, SupervisorConfig,
};
use mtnet_transport::{ConnectionId, LoopbackNetwork, NetworkLoop, Packet};
use proptest::prelude::*;

type Seen = (ConnectionId, Vec<u8>, ThreadId);

fn config() -> SupervisorConfig {
    SupervisorConfig {
        poll_timeout: Duration::from_millis(2),
        thread_name: "test-host".to_string(),
        ..SupervisorConfig::default()
    }
}

fn recording(tx: mpsc::Sender<Seen>) -> impl FnMut(&ConnectionContext) -> Box<dyn Handler> + Send + 'static {
    move |_ctx: &ConnectionContext| {
        let tx = tx.clone();
        Box::new(handler_fn(move |ctx, packet: Packet| {
            let _ = tx.send((ctx.id(), packet.data().to_vec(), thread::current().id()));
            Ok(())
        })) as Box<dyn Handler>
    }
}

#[test]
fn test_interleaved_connections_keep_per_connection_order() {
    let (tx, rx) = mpsc::channel();
    let (net, controller) = LoopbackNetwork::new();
    let mut supervisor = HostSupervisor::new(net, recording(tx), config());
    supervisor.launch().unwrap();

    let peers: Vec<ConnectionId> = (0..4)
        .map(|i| controller.connect_peer(SocketAddr::from(([10, 0, 0, i], 4000))))
        .collect();

    for seq in 0..50u32 {
        for id in &peers {
            controller.receive(*id, Packet::reliable(seq.to_be_bytes().to_vec()));
        }
    }
    for id in &peers {
        controller.disconnect_peer(*id);
    }

    let mut per_conn: HashMap<ConnectionId, Vec<(u32, ThreadId)>> = HashMap::new();
    for _ in 0..(50 * peers.len()) {
        let (id, data, tid) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let seq = u32::from_be_bytes(data.try_into().unwrap());
        per_conn.entry(id).or_default().push((seq, tid));
    }

    let mut threads = HashSet::new();
    for id in &peers {
        let seen = &per_conn[id];
        let order: Vec<u32> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, t)| *t == seen[0].1));
        threads.insert(seen[0].1);
    }

    // One worker per connection.
    assert_eq!(threads.len(), peers.len());

    supervisor.shutdown().unwrap();
    assert_eq!(supervisor.connection_count(), 0);
}

#[test]
fn test_reply_from_actor_reaches_network() {
    let (net, controller) = LoopbackNetwork::new();
    let upper = |_ctx: &ConnectionContext| {
        handler_fn(|ctx, packet: Packet| {
            ctx.reply(Packet::reliable(packet.data().to_ascii_uppercase()))?;
            Ok(())
        })
    };
    let mut supervisor = HostSupervisor::new(net, upper, config());
    supervisor.launch().unwrap();

    let id = controller.connect_peer("10.1.1.1:6000".parse().unwrap());
    controller.receive(id, Packet::reliable(&b"hello"[..]));

    let delivered = controller.wait_for_delivered(1, Duration::from_secs(5));
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, id);
    assert_eq!(delivered[0].1.data(), b"HELLO");

    supervisor.shutdown().unwrap();
}

#[test]
fn test_rejected_reply_does_not_stop_actor() {
    let (tx, rx) = mpsc::channel();
    let (net, controller) = LoopbackNetwork::new();
    let echo = move |_ctx: &ConnectionContext| {
        let tx = tx.clone();
        handler_fn(move |ctx, packet: Packet| {
            let result = ctx.reply(packet);
            let _ = tx.send(result.is_ok());
            result?;
            Ok(())
        })
    };
    let mut supervisor = HostSupervisor::new(net, echo, config());
    supervisor.launch().unwrap();

    let id = controller.connect_peer("10.1.1.2:6000".parse().unwrap());
    controller.reject_sends(Some("congested"));
    controller.receive(id, Packet::unreliable(&b"dropped"[..]));
    assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());

    controller.reject_sends(None);
    controller.receive(id, Packet::reliable(&b"kept"[..]));
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

    let delivered = controller.wait_for_delivered(1, Duration::from_secs(5));
    assert_eq!(delivered[0].1.data(), b"kept");
    supervisor.shutdown().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_actor_preserves_enqueue_order(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..64),
        wake_every in 1usize..8,
    ) {
        let (net, _controller) = LoopbackNetwork::new();
        let ctx = ConnectionContext::new(
            ConnectionId::from_raw(1),
            "127.0.0.1:9999".parse().unwrap(),
            net.outbox(),
        );

        let (tx, rx) = mpsc::channel();
        let mut actor = ConnectionActor::new(ctx);
        actor.launch(handler_fn(move |_ctx, packet: Packet| {
            let _ = tx.send(packet.data().to_vec());
            Ok(())
        })).unwrap();

        for (i, payload) in payloads.iter().enumerate() {
            actor.enqueue(Packet::reliable(payload.clone())).unwrap();
            if i % wake_every == 0 {
                actor.wake();
            }
        }

        let report = actor.shutdown().unwrap();
        prop_assert_eq!(report.packets_handled, payloads.len() as u64);
        prop_assert_eq!(rx.try_iter().collect::<Vec<_>>(), payloads);
    }
}
