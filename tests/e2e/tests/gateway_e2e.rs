//! End-to-end tests: real socket clients against a gateway driving a scripted
//! or loopback bus.

use busgate_codec::{ErrorCode, Head, InfoCode, OutgoingResultCode, Packet, WarnCode};
use busgate_e2e::TestGateway;
use busgate_network::test_utils::ScriptedBus;
use busgate_network::{LoopbackBus, SendOutcome};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_results_are_routed_to_their_submitter_only() {
    let bus = ScriptedBus::new();
    let gateway = TestGateway::start(bus.clone(), |_| {}).await.unwrap();

    let mut alice = gateway.client().await.unwrap();
    let mut bob = gateway.client().await.unwrap();

    bus.push_outcome(SendOutcome::Acknowledged);
    alice
        .send(&Packet::outgoing_message(0x22, b"from alice").unwrap())
        .await
        .unwrap();
    let (result, _) = alice.wait_for(Head::OutgoingResult, WAIT).await.unwrap();
    assert_eq!(result, Packet::outgoing_result(OutgoingResultCode::Success));

    // Bob submitted nothing and must not see alice's result.
    assert!(bob
        .next_packet_within(Duration::from_millis(100))
        .await
        .is_err());

    let gateway = gateway.stop().await.unwrap();
    assert_eq!(gateway.engine().pending_len(), 0);
}

#[tokio::test]
async fn test_byte_at_a_time_submission_is_reassembled() {
    let bus = ScriptedBus::new();
    let gateway = TestGateway::start(bus.clone(), |_| {}).await.unwrap();
    let mut client = gateway.client().await.unwrap();

    let frame = Packet::outgoing_message(0x07, b"slow").unwrap().encode().unwrap();
    for byte in frame.iter() {
        client.send_frame(std::slice::from_ref(byte)).await.unwrap();
        tokio::time::sleep(Duration::from_micros(200)).await;
    }

    let (result, _) = client.wait_for(Head::OutgoingResult, WAIT).await.unwrap();
    assert_eq!(result, Packet::outgoing_result(OutgoingResultCode::Success));
    assert_eq!(bus.sent()[0].payload, b"slow".to_vec());

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_loopback_bus_echoes_to_every_client() {
    let gateway = TestGateway::start(LoopbackBus::new(), |_| {}).await.unwrap();
    let mut sender = gateway.client().await.unwrap();
    let mut listener = gateway.client().await.unwrap();

    sender
        .send(&Packet::outgoing_message(0x22, b"echo").unwrap())
        .await
        .unwrap();

    let (result, _) = sender.wait_for(Head::OutgoingResult, WAIT).await.unwrap();
    assert_eq!(result, Packet::outgoing_result(OutgoingResultCode::Success));

    let expected = Packet::ingoing_message(0x22, b"echo").unwrap();
    let (echo, _) = sender.wait_for(Head::IngoingMessage, WAIT).await.unwrap();
    assert_eq!(echo, expected);
    let (echo, _) = listener.wait_for(Head::IngoingMessage, WAIT).await.unwrap();
    assert_eq!(echo, expected);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_degraded_start_recovers_when_bus_appears() {
    let bus = ScriptedBus::new();
    bus.set_connect_succeeds(false);
    let gateway = TestGateway::start(bus.clone(), |config| {
        config.server.reconnect_interval_ms = 10;
    })
    .await
    .unwrap();

    let mut client = gateway.client().await.unwrap();
    client
        .send(&Packet::outgoing_message(0x22, b"queued").unwrap())
        .await
        .unwrap();

    // While the bus is down the request waits without burning attempts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.sent().is_empty());

    bus.set_connect_succeeds(true);
    // The result of the reconnecting tick is queued ahead of the state broadcast.
    let (result, skipped) = client.wait_for(Head::OutgoingResult, WAIT).await.unwrap();
    assert_eq!(result, Packet::outgoing_result(OutgoingResultCode::Success));
    assert!(skipped.is_empty());
    let opened = client.next_packet_within(WAIT).await.unwrap();
    assert_eq!(opened, Packet::info(InfoCode::SerialOpened));

    let gateway = gateway.stop().await.unwrap();
    assert!(bus.connect_attempts() >= 2);
    assert_eq!(gateway.engine().health().snapshot().successes, 1);
}

#[tokio::test]
async fn test_low_success_rate_is_broadcast_once() {
    let bus = ScriptedBus::new();
    bus.set_default_outcome(SendOutcome::Unacknowledged);
    let gateway = TestGateway::start(bus.clone(), |config| {
        config.retry.max_attempts = 1;
        config.health.window = 2;
        config.health.min_success_rate = 0.5;
    })
    .await
    .unwrap();

    let mut submitter = gateway.client().await.unwrap();
    let mut observer = gateway.client().await.unwrap();

    for _ in 0..3 {
        submitter
            .send(&Packet::outgoing_message(0x22, b"lost").unwrap())
            .await
            .unwrap();
        let (result, _) = submitter.wait_for(Head::OutgoingResult, WAIT).await.unwrap();
        assert_eq!(result, Packet::outgoing_result(OutgoingResultCode::ConnectionLost));
    }

    let (warning, _) = observer.wait_for(Head::Warn, WAIT).await.unwrap();
    assert_eq!(warning, Packet::warn(WarnCode::LowSuccessRate));
    assert!(observer
        .next_packet_within(Duration::from_millis(100))
        .await
        .is_err());

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_pressure_warns_then_rejects() {
    let bus = ScriptedBus::new();
    let gateway = TestGateway::start(bus.clone(), |config| {
        config.retry.initial_backoff_ms = 10_000;
        config.retry.queue_warning_threshold = 2;
        config.retry.queue_capacity = 2;
    })
    .await
    .unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(gateway.client().await.unwrap());
    }
    let message = Packet::outgoing_message(0x22, b"wait").unwrap();

    clients[0].send(&message).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    clients[1].send(&message).await.unwrap();
    let (warning, _) = clients[1].wait_for(Head::Warn, WAIT).await.unwrap();
    assert_eq!(warning, Packet::warn(WarnCode::QueueFillingUp));

    clients[2].send(&message).await.unwrap();
    let (rejected, _) = clients[2].wait_for(Head::Error, WAIT).await.unwrap();
    assert_eq!(rejected, Packet::error(ErrorCode::RequestRejected));

    let gateway = gateway.stop().await.unwrap();
    assert_eq!(gateway.engine().pending_len(), 2);
    assert!(bus.sent().is_empty());
}

#[tokio::test]
async fn test_shutdown_removes_socket_and_closes_clients() {
    let first = TestGateway::start(ScriptedBus::new(), |_| {}).await.unwrap();
    let socket = first.socket().to_path_buf();
    assert!(socket.exists());
    let mut client = first.client().await.unwrap();
    assert!(!client.version().is_empty());

    let stopped = first.stop().await.unwrap();
    drop(stopped);
    assert!(!socket.exists());
    assert!(client
        .next_packet_within(Duration::from_millis(200))
        .await
        .is_err());
}
