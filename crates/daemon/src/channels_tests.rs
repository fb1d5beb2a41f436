// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

fn bus() -> (ChannelBus, Arc<ConnRegistry>) {
    let conns = Arc::new(ConnRegistry::new());
    (ChannelBus::new(Arc::clone(&conns)), conns)
}

#[tokio::test]
async fn subscribe_is_idempotent() {
    let (bus, conns) = bus();
    let (conn, _rx) = conns.register();

    assert_eq!(bus.subscribe(conn.id, "t"), 1);
    assert_eq!(bus.subscribe(conn.id, "t"), 1);
    assert_eq!(bus.subscription_count(), 1);
}

#[tokio::test]
async fn publish_excludes_sender() {
    let (bus, conns) = bus();
    let (publisher, mut pub_rx) = conns.register();
    let (subscriber, mut sub_rx) = conns.register();

    bus.subscribe(publisher.id, "t");
    bus.subscribe(subscriber.id, "t");

    let delivered = bus.publish(publisher.id, "t", &json!({"event": "x"}));
    assert_eq!(delivered, 1);

    let frame = sub_rx.try_recv().expect("subscriber should receive");
    match frame {
        Response::ChannelMessage { channel, message, .. } => {
            assert_eq!(channel, "t");
            assert_eq!(message, json!({"event": "x"}));
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert!(pub_rx.try_recv().is_err(), "publisher must not self-deliver");
}

#[tokio::test]
async fn publish_to_unknown_channel_delivers_zero() {
    let (bus, conns) = bus();
    let (conn, _rx) = conns.register();
    assert_eq!(bus.publish(conn.id, "nobody-home", &json!(1)), 0);
}

#[tokio::test]
async fn internal_publisher_reaches_all_subscribers() {
    let (bus, conns) = bus();
    let (a, mut a_rx) = conns.register();
    let (b, mut b_rx) = conns.register();
    bus.subscribe(a.id, "t");
    bus.subscribe(b.id, "t");

    // emit() from user code publishes as the synthetic instance handle
    let delivered = bus.publish(ConnId::INSTANCE, "t", &json!({"n": 1}));
    assert_eq!(delivered, 2);
    assert!(a_rx.try_recv().is_ok());
    assert!(b_rx.try_recv().is_ok());
}

#[tokio::test]
async fn unsubscribe_removes_channel_when_empty() {
    let (bus, conns) = bus();
    let (conn, _rx) = conns.register();

    bus.subscribe(conn.id, "t");
    assert!(bus.unsubscribe(conn.id, "t"));
    assert!(!bus.unsubscribe(conn.id, "t"));
    assert_eq!(bus.subscription_count(), 0);

    // Publishing to the now-deleted channel is a no-op
    assert_eq!(bus.publish(ConnId::INSTANCE, "t", &json!(1)), 0);
}

#[tokio::test]
async fn dropped_connection_is_removed_from_every_channel() {
    let (bus, conns) = bus();
    let (conn, _rx) = conns.register();
    bus.subscribe(conn.id, "a");
    bus.subscribe(conn.id, "b");

    bus.drop_connection(conn.id);
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn closed_connection_does_not_count_as_delivered() {
    let (bus, conns) = bus();
    let (publisher, _p_rx) = conns.register();
    let (subscriber, _s_rx) = conns.register();
    bus.subscribe(subscriber.id, "t");

    subscriber.close();
    assert_eq!(bus.publish(publisher.id, "t", &json!(1)), 0);
}

#[tokio::test]
async fn full_outbox_drops_frame_and_counts_it() {
    let (bus, conns) = bus();
    let (publisher, _p_rx) = conns.register();
    let (subscriber, _s_rx) = conns.register();
    bus.subscribe(subscriber.id, "t");

    // Fill the subscriber's outbox to capacity without draining it.
    let mut sent = 0;
    while subscriber.try_send(Response::Pong { id: "fill".to_string() }) {
        sent += 1;
    }
    assert_eq!(sent, crate::listener::OUTBOX_CAPACITY);

    assert_eq!(bus.publish(publisher.id, "t", &json!(1)), 0);
    assert_eq!(bus.dropped_count(), 1);
}
