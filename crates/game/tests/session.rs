use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tandem::{
    DispatchQueue, Frame, Message, NetConfig, ReliablePacket, ReplicationEngine, UdpTransport,
    decode, encode, transmit_all,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn spawn_server(port: u16, config: NetConfig) -> (UdpTransport, Arc<Mutex<ReplicationEngine>>) {
    let mut transport = UdpTransport::bind(("127.0.0.1", port)).unwrap();
    let engine = Arc::new(Mutex::new(ReplicationEngine::new(
        "it-server".into(),
        config,
        Arc::new(DispatchQueue::new()),
    )));

    let sender = transport.sender().unwrap();
    let handler_engine = Arc::clone(&engine);
    transport
        .start_receive_loop(move |bytes, from| {
            let outbound = handler_engine
                .lock()
                .unwrap()
                .handle_datagram(from, bytes, Instant::now());
            transmit_all(&sender, &outbound);
        })
        .unwrap();

    (transport, engine)
}

fn spawn_client(server: SocketAddr) -> (UdpTransport, Arc<Mutex<Vec<Frame>>>) {
    let mut transport = UdpTransport::bind_ephemeral(server).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    transport
        .start_receive_loop(move |bytes, _| {
            if let Ok(frame) = decode(bytes) {
                sink.lock().unwrap().push(frame);
            }
        })
        .unwrap();

    (transport, received)
}

fn send_bare(transport: &UdpTransport, message: Message) {
    let bytes = encode(&Frame::Bare(message)).unwrap();
    transport.sender().unwrap().send(&bytes);
}

fn send_reliable(transport: &UdpTransport, sequence: u32, message: Message) {
    let packet = ReliablePacket {
        sequence,
        ack_sequence: 0,
        is_ack: false,
        needs_ack: true,
        payload: Some(message),
        sent_at_ms: 0,
    };
    let bytes = encode(&Frame::Reliable(packet)).unwrap();
    transport.sender().unwrap().send(&bytes);
}

fn wait_for<F>(received: &Arc<Mutex<Vec<Frame>>>, timeout_ms: u64, predicate: F) -> bool
where
    F: Fn(&[Frame]) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if predicate(&received.lock().unwrap()) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn has_payload<F>(frames: &[Frame], predicate: F) -> bool
where
    F: Fn(&Message) -> bool,
{
    frames
        .iter()
        .filter_map(|f| f.payload())
        .any(|m| predicate(m))
}

#[test]
fn test_handshake_over_localhost() {
    let port = next_port();
    let (_server, engine) = spawn_server(port, NetConfig::default());
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let (client, received) = spawn_client(server_addr);
    send_reliable(
        &client,
        1,
        Message::Username {
            name: "alice".into(),
        },
    );

    assert!(
        wait_for(&received, 500, |frames| {
            has_payload(frames, |m| {
                matches!(m, Message::ServerName { name } if name == "it-server")
            }) && has_payload(frames, |m| {
                matches!(m, Message::PlayerList { players } if players.len() == 1)
            })
        }),
        "handshake reply did not arrive"
    );

    // The USERNAME was reliability-wrapped, so an ACK must come back too.
    assert!(wait_for(&received, 500, |frames| {
        frames.iter().any(|f| {
            matches!(f, Frame::Reliable(p) if p.is_ack && p.ack_sequence == 1)
        })
    }));

    assert_eq!(engine.lock().unwrap().session_count(), 1);
}

#[test]
fn test_third_client_gets_no_reply() {
    let port = next_port();
    let (_server, engine) = spawn_server(port, NetConfig::default());
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let (alice, alice_rx) = spawn_client(server_addr);
    let (bob, bob_rx) = spawn_client(server_addr);

    send_bare(
        &alice,
        Message::Username {
            name: "alice".into(),
        },
    );
    send_bare(&bob, Message::Username { name: "bob".into() });

    assert!(wait_for(&alice_rx, 500, |f| {
        has_payload(f, |m| matches!(m, Message::ServerName { .. }))
    }));
    assert!(wait_for(&bob_rx, 500, |f| {
        has_payload(f, |m| matches!(m, Message::ServerName { .. }))
    }));

    let (eve, eve_rx) = spawn_client(server_addr);
    send_bare(&eve, Message::Username { name: "eve".into() });

    // The capacity rejection is silent; eve simply never hears back.
    assert!(!wait_for(&eve_rx, 300, |f| !f.is_empty()));
    assert_eq!(engine.lock().unwrap().session_count(), 2);
}

#[test]
fn test_heartbeat_keeps_session_alive_until_silence() {
    let port = next_port();
    let config = NetConfig {
        disconnection_timeout: Duration::from_millis(300),
        ..NetConfig::default()
    };
    let (server, engine) = spawn_server(port, config);
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let (client, received) = spawn_client(server_addr);
    send_bare(
        &client,
        Message::Username {
            name: "alice".into(),
        },
    );
    assert!(wait_for(&received, 500, |f| {
        has_payload(f, |m| matches!(m, Message::ServerName { .. }))
    }));

    // Heartbeats well inside the timeout keep the session alive.
    let sender = server.sender().unwrap();
    for _ in 0..6 {
        send_bare(&client, Message::Ping);
        thread::sleep(Duration::from_millis(100));
        let outbound = engine.lock().unwrap().tick(Instant::now());
        transmit_all(&sender, &outbound);
        assert_eq!(engine.lock().unwrap().session_count(), 1);
    }

    // Silence past the timeout evicts.
    thread::sleep(Duration::from_millis(450));
    let outbound = engine.lock().unwrap().tick(Instant::now());
    transmit_all(&sender, &outbound);
    assert_eq!(engine.lock().unwrap().session_count(), 0);
}
