mod common;

use common::*;
use pulselink_core::protocol::{codes, Action};
use pulselink_core::transport::{TransportEvent, TransportKind};
use pulselink_core::{ChannelState, ConnectionState, Realtime};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn attach_resolves_when_attached_arrives() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });

    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Attach);
    assert_eq!(sent.channel.as_deref(), Some("orders"));

    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    attach.await.unwrap().unwrap();
    assert_eq!(channel.state(), ChannelState::Attached);
}

#[tokio::test(start_paused = true)]
async fn attach_timeout_rejects_then_autonomously_reattaches() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });

    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Attach);

    // never answer: the attach deadline (50ms) expires
    let err = attach.await.unwrap().unwrap_err();
    assert_eq!(err.code, codes::ATTACH_TIMED_OUT);
    assert_eq!(err.status_code, 408);
    assert!(channel.wait_for_state(ChannelState::Suspended).await);

    // the channel re-enters attaching on its own after the channel backoff
    let resent = next_sent(&mut conn).await;
    assert_eq!(resent.action, Action::Attach);
    assert!(channel.wait_for_state(ChannelState::Attaching).await);

    // and settles once the server finally confirms
    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    assert!(channel.wait_for_state(ChannelState::Attached).await);
}

#[tokio::test(start_paused = true)]
async fn failed_channel_rejects_every_operation_without_io() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Attach);

    conn.events
        .send(TransportEvent::Protocol(channel_error_msg(
            "orders", 40160, 401, "permission denied",
        )))
        .await
        .unwrap();

    let err = attach.await.unwrap().unwrap_err();
    assert_eq!(err.code, 40160);
    assert_eq!(channel.state(), ChannelState::Failed);

    // every subsequent operation rejects immediately with the stored error
    let err = channel
        .publish("created", serde_json::json!({"id": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.code, 40160);
    let err = channel.subscribe().await.unwrap_err();
    assert_eq!(err.code, 40160);
    let presence = channel.presence();
    assert_eq!(presence.enter("alice", None).await.unwrap_err().code, 40160);
    assert_eq!(presence.leave("alice").await.unwrap_err().code, 40160);
    assert_eq!(presence.get().await.unwrap_err().code, 40160);
    assert_eq!(presence.subscribe().await.unwrap_err().code, 40160);

    // none of those rejections touched the network
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn detach_on_detached_channel_is_a_silent_no_op() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    next_sent(&mut conn).await;
    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    attach.await.unwrap().unwrap();

    let detach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.detach().await }
    });
    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Detach);
    conn.events
        .send(TransportEvent::Protocol(detached_msg("orders")))
        .await
        .unwrap();
    detach.await.unwrap().unwrap();
    assert_eq!(channel.state(), ChannelState::Detached);

    // a second detach resolves immediately and writes nothing to the wire
    channel.detach().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn operations_queued_while_attaching_settle_with_the_attach() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Attach);

    // issued while attaching: held until the attach settles
    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("created", serde_json::json!({"id": 7})).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(conn.sent.try_recv().is_err());

    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    attach.await.unwrap().unwrap();

    let sent = next_sent(&mut conn).await;
    assert_eq!(sent.action, Action::Message);
    let serial = sent.msg_serial.unwrap();
    conn.events
        .send(TransportEvent::Protocol(ack_msg(serial, 1)))
        .await
        .unwrap();
    publish.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsolicited_detached_triggers_immediate_reattach() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    next_sent(&mut conn).await;
    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    attach.await.unwrap().unwrap();

    // server drops the attachment out of the blue
    conn.events
        .send(TransportEvent::Protocol(detached_msg("orders")))
        .await
        .unwrap();
    let resent = next_sent(&mut conn).await;
    assert_eq!(resent.action, Action::Attach);
    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    assert!(channel.wait_for_state(ChannelState::Attached).await);
}

#[tokio::test(start_paused = true)]
async fn connection_failure_fails_channels_and_their_operations() {
    init_tracing();
    let (factory, mut conns) = mock_factory(TransportKind::WebSocket);
    let realtime = Realtime::new(test_options(), factories(vec![factory]));
    let mut conn = establish(&realtime, &mut conns, 60_000).await;

    let channel = realtime.channel("orders").await.unwrap();
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    next_sent(&mut conn).await;
    conn.events
        .send(TransportEvent::Protocol(attached_msg("orders")))
        .await
        .unwrap();
    attach.await.unwrap().unwrap();

    conn.events
        .send(TransportEvent::Protocol(error_msg(
            codes::UNAUTHORIZED,
            401,
            "token revoked",
        )))
        .await
        .unwrap();
    assert!(
        realtime
            .connection()
            .wait_for_state(ConnectionState::Failed)
            .await
    );
    assert!(channel.wait_for_state(ChannelState::Failed).await);

    let err = channel
        .publish("created", serde_json::json!({"id": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::UNAUTHORIZED);
}
