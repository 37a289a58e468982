//! End-to-end tests: a real `DiscordRpc` with its IO thread running against
//! the in-memory companion.
//!
//! Every test drives `run_callbacks` from the test thread and polls with a
//! deadline, the way an application's frame loop would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hammer_presence::fake::{FakeCompanion, FakeConnection};
use hammer_presence::{DiscordRpc, ErrorCode, EventHandlers, Reply, RichPresence, RpcConfig};
use parking_lot::Mutex;
use serde_json::Value;

type Log = Arc<Mutex<Vec<String>>>;

const DEADLINE: Duration = Duration::from_secs(5);

/// Poll `condition`, running callbacks between attempts.
fn wait_for(rpc: &DiscordRpc, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        rpc.run_callbacks();
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Poll `condition` without delivering callbacks.
fn wait_quietly(mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn logging_handlers(log: &Log) -> EventHandlers {
    let (ready, disconnected, errored, join, request) =
        (log.clone(), log.clone(), log.clone(), log.clone(), log.clone());
    EventHandlers::default()
        .on_ready(move |user| ready.lock().push(format!("ready:{}", user.username)))
        .on_disconnected(move |code, msg| disconnected.lock().push(format!("disconnected:{code}:{msg}")))
        .on_errored(move |code, msg| errored.lock().push(format!("errored:{code}:{msg}")))
        .on_join_game(move |secret| join.lock().push(format!("join:{secret}")))
        .on_join_request(move |user| request.lock().push(format!("request:{}", user.user_id)))
}

fn start(log: &Log) -> (DiscordRpc, FakeCompanion) {
    let (transport, companion) = FakeConnection::pair();
    companion.respond_to_handshake("42", "alyx");
    let mut rpc = DiscordRpc::new(RpcConfig::for_testing());
    rpc.initialize("1234", logging_handlers(log), transport).unwrap();
    (rpc, companion)
}

/// Wait for the first READY to be delivered, then forget it.
fn connect(rpc: &DiscordRpc, log: &Log) {
    assert!(wait_for(rpc, || logged(log, "ready:alyx")));
    log.lock().clear();
}

fn commands_named(companion: &FakeCompanion, cmd: &str) -> Vec<Value> {
    companion
        .written_commands()
        .into_iter()
        .filter(|c| c["cmd"] == cmd)
        .collect()
}

fn logged(log: &Log, entry: &str) -> bool {
    log.lock().iter().any(|e| e == entry)
}

// ─── Connection Lifecycle ────────────────────────────────────────

#[test]
fn test_connect_delivers_ready() {
    let log = Log::default();
    let (rpc, companion) = start(&log);

    assert!(wait_for(&rpc, || logged(&log, "ready:alyx")));
    assert!(rpc.is_connected());

    let handshake = companion.written_frames().remove(0);
    assert_eq!(handshake.1["client_id"], "1234");
    assert_eq!(handshake.1["v"], 1);
}

#[test]
fn test_reconnect_reports_disconnect_before_ready() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    connect(&rpc, &log);

    companion.hang_up();
    assert!(wait_quietly(|| !rpc.is_connected()));
    companion.set_available(true);
    assert!(wait_quietly(|| companion.open_count() == 2 && rpc.is_connected()));

    rpc.run_callbacks();
    let expected = format!("disconnected:{}:Pipe closed", ErrorCode::PipeClosed as i32);
    assert_eq!(*log.lock(), [expected.as_str(), "ready:alyx"]);
}

#[test]
fn test_disconnect_while_down_reported_last() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    connect(&rpc, &log);

    companion.send_join_request("9", "eli");
    companion.hang_up();
    assert!(wait_quietly(|| !rpc.is_connected()));

    rpc.run_callbacks();
    let expected = format!("disconnected:{}:Pipe closed", ErrorCode::PipeClosed as i32);
    assert_eq!(*log.lock(), ["request:9", expected.as_str()]);
}

#[test]
fn test_repeated_reconnects_leave_app_connected() {
    let believes_connected = Arc::new(Mutex::new(false));
    let (up, down) = (believes_connected.clone(), believes_connected.clone());
    let handlers = EventHandlers::default()
        .on_ready(move |_| *up.lock() = true)
        .on_disconnected(move |_, _| *down.lock() = false);

    let (transport, companion) = FakeConnection::pair();
    companion.respond_to_handshake("42", "alyx");
    let mut rpc = DiscordRpc::new(RpcConfig::for_testing());
    rpc.initialize("1234", handlers, transport).unwrap();

    for round in 1..=25 {
        assert!(wait_for(&rpc, || companion.open_count() == round && rpc.is_connected()));
        rpc.run_callbacks();
        assert!(*believes_connected.lock(), "round {round}: app thinks it is offline");

        companion.hang_up();
        companion.set_available(true);
    }
}

#[test]
fn test_close_frame_reports_companion_reason() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));

    companion.send_close(4000, "Invalid client ID");
    assert!(wait_for(&rpc, || logged(&log, "disconnected:4000:Invalid client ID")));
}

#[test]
fn test_unavailable_companion_keeps_retrying() {
    let log = Log::default();
    let (transport, companion) = FakeConnection::pair();
    companion.set_available(false);
    companion.respond_to_handshake("42", "alyx");
    let mut rpc = DiscordRpc::new(RpcConfig::for_testing());
    rpc.initialize("1234", logging_handlers(&log), transport).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    rpc.run_callbacks();
    assert!(log.lock().is_empty());

    companion.set_available(true);
    assert!(wait_for(&rpc, || logged(&log, "ready:alyx")));
}

// ─── Presence ────────────────────────────────────────────────────

#[test]
fn test_presence_updates_coalesce_while_offline() {
    let log = Log::default();
    let (transport, companion) = FakeConnection::pair();
    companion.set_available(false);
    companion.respond_to_handshake("42", "alyx");
    let mut rpc = DiscordRpc::new(RpcConfig::for_testing());
    rpc.initialize("1234", logging_handlers(&log), transport).unwrap();

    for level in ["Level 1", "Level 2", "Level 3"] {
        rpc.update_presence(&RichPresence {
            state: Some("In game"),
            details: Some(level),
            party_size: 1,
            party_max: 4,
            ..Default::default()
        })
        .unwrap();
    }
    companion.set_available(true);

    assert!(wait_quietly(|| !commands_named(&companion, "SET_ACTIVITY").is_empty()));
    std::thread::sleep(Duration::from_millis(30));

    let updates = commands_named(&companion, "SET_ACTIVITY");
    assert_eq!(updates.len(), 1);
    let activity = &updates[0]["args"]["activity"];
    assert_eq!(activity["details"], "Level 3");
    assert_eq!(activity["party"]["size"], serde_json::json!([1, 4]));
}

#[test]
fn test_clear_presence_sends_no_activity() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));

    rpc.clear_presence().unwrap();
    assert!(wait_quietly(|| !commands_named(&companion, "SET_ACTIVITY").is_empty()));
    let update = commands_named(&companion, "SET_ACTIVITY").remove(0);
    assert!(update["args"].get("activity").is_none());
}

// ─── Subscriptions and Join Requests ─────────────────────────────

#[test]
fn test_handlers_drive_subscriptions() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    assert!(wait_quietly(|| commands_named(&companion, "SUBSCRIBE").len() == 2));

    let subscribed: Vec<_> = commands_named(&companion, "SUBSCRIBE")
        .iter()
        .map(|c| c["evt"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(subscribed, ["ACTIVITY_JOIN", "ACTIVITY_JOIN_REQUEST"]);

    // Drop the join request handler, keep the rest
    let join = log.clone();
    rpc.update_handlers(
        EventHandlers::default().on_join_game(move |secret| join.lock().push(format!("join:{secret}"))),
    );
    assert!(wait_quietly(|| !commands_named(&companion, "UNSUBSCRIBE").is_empty()));

    let unsubscribed = commands_named(&companion, "UNSUBSCRIBE");
    assert_eq!(unsubscribed.len(), 1);
    assert_eq!(unsubscribed[0]["evt"], "ACTIVITY_JOIN_REQUEST");
    assert_eq!(commands_named(&companion, "SUBSCRIBE").len(), 2);
}

#[test]
fn test_join_request_and_reply() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));

    companion.send_join_request("77", "barney");
    assert!(wait_for(&rpc, || logged(&log, "request:77")));

    rpc.respond("77", Reply::Yes).unwrap();
    assert!(wait_quietly(|| !commands_named(&companion, "SEND_ACTIVITY_JOIN_INVITE").is_empty()));
    let reply = commands_named(&companion, "SEND_ACTIVITY_JOIN_INVITE").remove(0);
    assert_eq!(reply["args"]["user_id"], "77");
}

#[test]
fn test_join_secret_and_error_delivered() {
    let log = Log::default();
    let (rpc, companion) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));

    companion.send_dispatch("ACTIVITY_JOIN", serde_json::json!({ "secret": "s3cret" }));
    companion.send_error("2", 4000, "child \"activity\" fails");
    assert!(wait_for(&rpc, || {
        logged(&log, "join:s3cret") && logged(&log, "errored:4000:child \"activity\" fails")
    }));
}

// ─── Shutdown ────────────────────────────────────────────────────

#[test]
fn test_shutdown_closes_transport() {
    let log = Log::default();
    let (mut rpc, companion) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));

    rpc.shutdown();
    assert!(!companion.is_client_open());
    assert!(!rpc.is_connected());

    // Nothing is delivered after shutdown
    companion.send_join_request("1", "x");
    log.lock().clear();
    rpc.run_callbacks();
    assert!(log.lock().is_empty());
    rpc.respond("1", Reply::No).unwrap();
}

#[test]
fn test_reinitialize_after_shutdown() {
    let log = Log::default();
    let (mut rpc, _first) = start(&log);
    assert!(wait_for(&rpc, || rpc.is_connected()));
    rpc.shutdown();

    let (transport, companion) = FakeConnection::pair();
    companion.respond_to_handshake("43", "kleiner");
    rpc.initialize("1234", logging_handlers(&log), transport).unwrap();
    assert!(wait_for(&rpc, || logged(&log, "ready:kleiner")));
}
