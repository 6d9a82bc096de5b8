//! End-to-end dispatch tests: drive the server actor with control
//! messages and check the replies it queues for the bus.

use fluid_settings::{persist, Definition, Schema, SettingType, SettingsStore};
use fluid_settings_daemon::{DaemonConfig, PeerKind, Server, ServerEvent};
use fluid_settings_model::{commands, Address, Message, Timestamp};
use std::net::SocketAddr;
use std::path::Path;
use tokio::sync::mpsc;

struct TestServer {
    server: Server,
    bus_rx: mpsc::Receiver<Message>,
    // keeps the event channel open for the server's lifetime
    _event_tx: mpsc::Sender<ServerEvent>,
    _dir: tempfile::TempDir,
}

fn test_schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert(Definition::new("test::name", SettingType::String).dynamic());
    schema.insert(
        Definition::new("test::lang", SettingType::String)
            .with_default("en")
            .dynamic(),
    );
    schema.insert(Definition::new("test::x", SettingType::String).dynamic());
    schema.insert(Definition::new("test::serial-number", SettingType::String).dynamic());
    schema
}

fn make_server(listener: &str) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        settings: dir.path().join("settings.conf").display().to_string(),
        server_name: "unit".to_string(),
        ..DaemonConfig::default()
    };
    let store = SettingsStore::new(test_schema());
    let (bus_tx, bus_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    let listener_address: SocketAddr = listener.parse().unwrap();
    let server = Server::new(
        config,
        store,
        listener_address,
        bus_tx,
        event_tx.clone(),
        event_rx,
    );
    TestServer {
        server,
        bus_rx,
        _event_tx: event_tx,
        _dir: dir,
    }
}

fn request(command: &str) -> Message {
    let mut msg = Message::new(command);
    msg.from = Some(Address::new("web1", "backend"));
    msg.to = Some(Address::service("fluid_settings"));
    msg
}

fn put(name: &str, value: &str, priority: i64, timestamp: i64) -> Message {
    request(commands::PUT)
        .with_param("name", name)
        .with_param("value", value)
        .with_param("priority", priority.to_string())
        .with_param("timestamp", timestamp.to_string())
}

const T1: i64 = 1_700_000_000_000_000_000;
const T2: i64 = 1_700_000_001_000_000_000;

#[tokio::test]
async fn put_then_get() {
    let mut t = make_server("127.0.0.1:4049");

    t.server
        .dispatch_bus(put("test::name", "hello", 50, T1))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::UPDATED);
    assert_eq!(reply.param("name"), Some("test::name"));
    assert_eq!(reply.param("reason"), Some("new"));
    assert_eq!(reply.to, Some(Address::new("web1", "backend")));

    t.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::name"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::VALUE);
    assert_eq!(reply.param("value"), Some("hello"));
}

#[tokio::test]
async fn default_fallback_and_delete() {
    let mut t = make_server("127.0.0.1:4049");
    let get = || request(commands::GET).with_param("name", "test::lang");

    t.server.dispatch_bus(get()).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::DEFAULT_VALUE);
    assert_eq!(reply.param("value"), Some("en"));

    t.server.dispatch_bus(put("test::lang", "fr", 50, T1)).await;
    t.bus_rx.try_recv().unwrap();

    t.server.dispatch_bus(get()).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::VALUE);
    assert_eq!(reply.param("value"), Some("fr"));

    t.server
        .dispatch_bus(request(commands::DELETE).with_param("name", "test::lang"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::DELETED);
    assert_eq!(reply.param("message"), None);

    t.server.dispatch_bus(get()).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::DEFAULT_VALUE);
    assert_eq!(reply.param("value"), Some("en"));
}

#[tokio::test]
async fn priority_shadowing() {
    let mut t = make_server("127.0.0.1:4049");
    t.server.dispatch_bus(put("test::x", "admin", 50, T1)).await;
    t.bus_rx.try_recv().unwrap();
    t.server.dispatch_bus(put("test::x", "app", 60, T2)).await;
    t.bus_rx.try_recv().unwrap();

    t.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::x"))
        .await;
    assert_eq!(t.bus_rx.try_recv().unwrap().param("value"), Some("app"));

    t.server
        .dispatch_bus(
            request(commands::GET)
                .with_param("name", "test::x")
                .with_param("priority", "50"),
        )
        .await;
    assert_eq!(t.bus_rx.try_recv().unwrap().param("value"), Some("admin"));

    t.server
        .dispatch_bus(
            request(commands::GET)
                .with_param("name", "test::x")
                .with_param("all", "true"),
        )
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::ALL_VALUES);
    assert_eq!(reply.param("values"), Some("admin,app"));
}

#[tokio::test]
async fn older_put_is_unchanged() {
    let mut t = make_server("127.0.0.1:4049");
    t.server
        .dispatch_bus(put("test::x", "new", 50, 2_000_000_000_000_000_000))
        .await;
    t.bus_rx.try_recv().unwrap();

    t.server
        .dispatch_bus(put("test::x", "old", 50, 1_700_000_000_000_000_001))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::UPDATED);
    assert_eq!(reply.param("reason"), Some("unchanged"));

    t.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::x"))
        .await;
    assert_eq!(t.bus_rx.try_recv().unwrap().param("value"), Some("new"));
}

#[tokio::test]
async fn listen_replays_current_values_then_ready() {
    let mut t = make_server("127.0.0.1:4049");
    t.server.dispatch_bus(put("test::x", "app", 60, T1)).await;
    t.bus_rx.try_recv().unwrap();

    t.server
        .dispatch_bus(request(commands::LISTEN).with_param("names", "test::x,test::lang"))
        .await;

    let registered = t.bus_rx.try_recv().unwrap();
    assert_eq!(registered.command, commands::REGISTERED);
    assert_eq!(registered.param("message"), None);

    let first = t.bus_rx.try_recv().unwrap();
    assert_eq!(first.command, commands::VALUE_UPDATED);
    assert_eq!(first.param("name"), Some("test::x"));
    assert_eq!(first.param("value"), Some("app"));
    assert_eq!(first.param("message"), Some("current value"));

    let second = t.bus_rx.try_recv().unwrap();
    assert_eq!(second.param("name"), Some("test::lang"));
    assert_eq!(second.param("value"), Some("en"));

    let ready = t.bus_rx.try_recv().unwrap();
    assert_eq!(ready.command, commands::FLUID_READY);
    assert_eq!(ready.param("errcnt"), None);

    // a later change fans out to the subscriber
    t.server.dispatch_bus(put("test::x", "again", 60, T2)).await;
    let updated = t.bus_rx.try_recv().unwrap();
    assert_eq!(updated.command, commands::UPDATED);
    let push = t.bus_rx.try_recv().unwrap();
    assert_eq!(push.command, commands::VALUE_UPDATED);
    assert_eq!(push.to, Some(Address::new("web1", "backend")));
    assert_eq!(push.param("value"), Some("again"));

    // registering again is reported
    t.server
        .dispatch_bus(request(commands::LISTEN).with_param("names", "test::x"))
        .await;
    let again = t.bus_rx.try_recv().unwrap();
    assert_eq!(again.param("message"), Some("already registered"));
}

#[tokio::test]
async fn listen_counts_unknown_names() {
    let mut t = make_server("127.0.0.1:4049");
    t.server
        .dispatch_bus(request(commands::LISTEN).with_param("names", "no::such,test::lang"))
        .await;

    assert_eq!(t.bus_rx.try_recv().unwrap().command, commands::REGISTERED);
    let first = t.bus_rx.try_recv().unwrap();
    assert_eq!(first.param("name"), Some("no::such"));
    assert_eq!(first.param("reason"), Some("value undefined"));
    let second = t.bus_rx.try_recv().unwrap();
    assert_eq!(second.param("value"), Some("en"));
    let ready = t.bus_rx.try_recv().unwrap();
    assert_eq!(ready.command, commands::FLUID_READY);
    assert_eq!(ready.param("errcnt"), Some("1"));
}

#[tokio::test]
async fn forget_semantics() {
    let mut t = make_server("127.0.0.1:4049");
    t.server
        .dispatch_bus(request(commands::LISTEN).with_param("names", "test::x"))
        .await;
    while t.bus_rx.try_recv().is_ok() {}

    t.server
        .dispatch_bus(request(commands::FORGET).with_param("names", "test::x"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::FORGET);
    assert_eq!(reply.param("message"), None);

    t.server
        .dispatch_bus(request(commands::FORGET).with_param("names", "test::x"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.param("message"), Some("not listening"));

    // an empty names list is a protocol error
    t.server
        .dispatch_bus(request(commands::FORGET).with_param("names", " , "))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::INVALID);
}

#[tokio::test]
async fn protocol_errors_reply_invalid() {
    let mut t = make_server("127.0.0.1:4049");

    t.server.dispatch_bus(request(commands::GET)).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::INVALID);
    assert_eq!(reply.param("command"), Some(commands::GET));
    assert!(reply.param("message").unwrap().contains("name"));

    t.server
        .dispatch_bus(
            request(commands::GET)
                .with_param("name", "test::x")
                .with_param("all", "true")
                .with_param("priority", "50"),
        )
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::INVALID);
    assert!(reply.param("message").unwrap().contains("mutually exclusive"));

    t.server
        .dispatch_bus(put("test::x", "v", 100, T1))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::INVALID);

    // LISTEN without an envelope cannot be registered
    t.server
        .dispatch_bus(Message::new(commands::LISTEN).with_param("names", "test::x"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::INVALID);

    t.server.dispatch_bus(request("FLUID_SETTINGS_BOGUS")).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::UNKNOWN);
    assert_eq!(reply.param("command"), Some("FLUID_SETTINGS_BOGUS"));
}

#[tokio::test]
async fn wire_names_are_canonicalized() {
    let mut t = make_server("127.0.0.1:4049");
    t.server
        .dispatch_bus(put("test::serial_number", "v", 50, T1))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::UPDATED);
    assert_eq!(reply.param("name"), Some("test::serial-number"));

    t.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::serial_number"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::VALUE);
    assert_eq!(reply.param("value"), Some("v"));
}

#[tokio::test]
async fn gossip_tie_break_initiates_when_we_precede() {
    // our listener address precedes the gossiped one, so we dial out
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let theirs = listener.local_addr().unwrap();
    let mut t = make_server("127.0.0.1:1");

    t.server
        .dispatch_bus(request(commands::GOSSIP).with_param("my_ip", theirs.to_string()))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::CONNECTED);
    assert_eq!(reply.param("my_ip"), Some("127.0.0.1:1"));
    assert_eq!(reply.param("message"), Some("we sent you a connection request"));

    // the outbound link actually dials the advertised endpoint
    tokio::time::timeout(std::time::Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection was initiated")
        .unwrap();
}

#[tokio::test]
async fn gossip_tie_break_defers_when_they_precede() {
    let mut t = make_server("127.0.0.1:65000");

    t.server
        .dispatch_bus(request(commands::GOSSIP).with_param("my_ip", "127.0.0.1:4049"))
        .await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::CONNECTED);
    assert_eq!(reply.param("message"), Some("you connect to us"));

    // a CONNECTED message runs the same tie-break without replying
    t.server
        .dispatch_bus(request(commands::CONNECTED).with_param("my_ip", "127.0.0.1:4049"))
        .await;
    assert!(t.bus_rx.try_recv().is_err());
}

#[tokio::test]
async fn peer_changes_do_not_echo_back() {
    let mut t = make_server("127.0.0.1:4049");

    // register a fake replication link
    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    t.server
        .handle_event(ServerEvent::PeerConnected {
            id: 8,
            kind: PeerKind::Inbound,
            remote: "127.0.0.1:5001".parse().unwrap(),
            tx: peer_tx,
        })
        .await;

    // convergence from that peer: merge applies, no echo
    let changed = Message::new(commands::VALUE_CHANGED)
        .with_param("name", "test::x")
        .with_param("values", format!("50|{T1}|from-peer\n"));
    t.server
        .handle_event(ServerEvent::PeerMessage { id: 8, msg: changed })
        .await;

    t.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::x"))
        .await;
    assert_eq!(
        t.bus_rx.try_recv().unwrap().param("value"),
        Some("from-peer")
    );
    assert!(peer_rx.try_recv().is_err(), "peer change echoed back");

    // a local change does replicate out
    t.server.dispatch_bus(put("test::x", "local", 50, T2)).await;
    t.bus_rx.try_recv().unwrap();
    let push = peer_rx.try_recv().unwrap();
    assert_eq!(push.command, commands::VALUE_CHANGED);
    assert_eq!(push.param("name"), Some("test::x"));
    assert!(push.param("values").unwrap().contains("local"));
}

#[tokio::test]
async fn service_down_drops_subscriptions() {
    let mut t = make_server("127.0.0.1:4049");
    t.server
        .dispatch_bus(request(commands::LISTEN).with_param("names", "test::x"))
        .await;
    while t.bus_rx.try_recv().is_ok() {}

    let mut status = Message::new(commands::STATUS);
    status.set_param("service", "backend");
    status.set_param("server", "web1");
    status.set_param("status", "down");
    t.server.dispatch_bus(status).await;

    t.server.dispatch_bus(put("test::x", "v", 50, T1)).await;
    let reply = t.bus_rx.try_recv().unwrap();
    assert_eq!(reply.command, commands::UPDATED);
    // no VALUE_UPDATED followed: the subscriber is gone
    assert!(t.bus_rx.try_recv().is_err());
}

#[tokio::test]
async fn two_daemons_converge_through_value_changed() {
    let mut a = make_server("127.0.0.1:4049");
    let mut b = make_server("127.0.0.1:4051");

    // wire a fake link on A and capture what it replicates
    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    a.server
        .handle_event(ServerEvent::PeerConnected {
            id: 1,
            kind: PeerKind::Outbound,
            remote: "127.0.0.1:4051".parse().unwrap(),
            tx: peer_tx,
        })
        .await;

    a.server.dispatch_bus(put("test::x", "v1", 50, T1)).await;
    a.bus_rx.try_recv().unwrap();
    let push = peer_rx.try_recv().unwrap();
    assert_eq!(push.command, commands::VALUE_CHANGED);

    // deliver the captured push to B as if it came over the link
    b.server
        .handle_event(ServerEvent::PeerMessage { id: 9, msg: push })
        .await;
    b.server
        .dispatch_bus(request(commands::GET).with_param("name", "test::x"))
        .await;
    assert_eq!(b.bus_rx.try_recv().unwrap().param("value"), Some("v1"));

    // concurrent writes at the same priority: the larger timestamp wins
    // on both daemons no matter the arrival order
    b.server.dispatch_bus(put("test::x", "v2", 50, T2)).await;
    b.bus_rx.try_recv().unwrap();
    let a_blob = Message::new(commands::VALUE_CHANGED)
        .with_param("name", "test::x")
        .with_param("values", format!("50|{T2}|v2\n"));
    a.server
        .handle_event(ServerEvent::PeerMessage { id: 1, msg: a_blob })
        .await;

    for t in [&mut a, &mut b] {
        t.server
            .dispatch_bus(request(commands::GET).with_param("name", "test::x"))
            .await;
        assert_eq!(t.bus_rx.try_recv().unwrap().param("value"), Some("v2"));
    }
}

#[tokio::test]
async fn settings_survive_a_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.conf");

    let mut store = SettingsStore::new(test_schema());
    store.set(
        "test::x",
        "persisted",
        fluid_settings_model::priority::ADMINISTRATOR,
        Timestamp::from_nanos(T1),
    );
    persist::save(&store, Path::new(&path)).unwrap();

    let mut reloaded = SettingsStore::new(test_schema());
    assert_eq!(persist::load(&mut reloaded, Path::new(&path)).unwrap(), 1);
    assert_eq!(
        reloaded.effective_value("test::x"),
        Some("persisted".to_string())
    );
}
