//! Integration tests for the three-way handshake.
//!
//! Each test binds real `tokio::net::UdpSocket`s on loopback, runs the
//! server half in a background task, and checks the state both sides end up
//! in.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use microtcp::packet::flags;
use microtcp::{
    Config, ConnError, Connection, ConnectionState, Control, Segment, Simulator, SimulatorConfig,
    Socket,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_config() -> Config {
    Config {
        ack_timeout: Duration::from_millis(100),
        max_retries: 3,
        ..Config::default()
    }
}

/// Accept on a fresh server connection in a background task and connect a
/// fresh client to it.
async fn establish_pair() -> (Connection, Connection) {
    let mut server = Connection::bind(loopback(), fast_config()).await.unwrap();
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        server.accept().await?;
        Ok::<_, ConnError>(server)
    });

    let mut client = Connection::bind(loopback(), fast_config()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.connect(server_addr))
        .await
        .expect("client connect timed out")
        .expect("client connect failed");

    let server = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server accept timed out")
        .expect("server task panicked")
        .expect("server accept failed");

    (client, server)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake on loopback.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let (client, server) = establish_pair().await;

    assert_eq!(client.state, ConnectionState::Established);
    assert_eq!(server.state, ConnectionState::Established);
    assert_eq!(client.peer_addr(), Some(server.local_addr()));
    assert_eq!(server.peer_addr(), Some(client.local_addr()));

    assert_eq!(
        client.stats.transitions,
        vec![ConnectionState::SynSent, ConnectionState::Established]
    );
    assert_eq!(
        server.stats.transitions,
        vec![
            ConnectionState::Listen,
            ConnectionState::SynReceived,
            ConnectionState::Established
        ]
    );
}

/// The SYN consumes one sequence number on each side, and each side expects
/// exactly what the other will send next.
#[tokio::test]
async fn handshake_sequence_numbers_agree() {
    let (client, server) = establish_pair().await;

    assert_eq!(client.local_seq(), client.stats.local_isn.wrapping_add(1));
    assert_eq!(server.local_seq(), server.stats.local_isn.wrapping_add(1));
    assert_eq!(client.peer_ack_expected(), client.local_seq());
    assert_eq!(server.peer_ack_expected(), server.local_seq());

    assert_eq!(
        server.peer_seq_expected(),
        client.local_seq(),
        "server RCV.NXT should equal client SND.NXT after handshake"
    );
    assert_eq!(
        client.peer_seq_expected(),
        server.local_seq(),
        "client RCV.NXT should equal server SND.NXT after handshake"
    );
    assert_eq!(client.stats.peer_isn, server.stats.local_isn);
    assert_eq!(server.stats.peer_isn, client.stats.local_isn);
}

/// Windows are exchanged during the handshake and congestion control starts
/// from the configured values.
#[tokio::test]
async fn handshake_exchanges_windows_and_resets_congestion() {
    let (client, server) = establish_pair().await;
    let config = fast_config();

    assert_eq!(client.peer_advertised_window(), config.recv_buffer_len as u16);
    assert_eq!(server.peer_advertised_window(), config.recv_buffer_len as u16);
    assert_eq!(client.congestion_window(), config.init_cwnd);
    assert_eq!(client.slow_start_threshold(), config.init_ssthresh);
    assert_eq!(client.duplicate_ack_count(), 0);
    assert_eq!(client.congestion_state(), microtcp::CongestionState::SlowStart);
}

/// Connecting to an address where nobody answers should fail after the
/// retry budget rather than hang forever.
#[tokio::test]
async fn connect_to_silent_peer_exhausts_retries() {
    // Bound but never read from: SYNs vanish without an ICMP error.
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let mut client = Connection::bind(loopback(), fast_config()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), client.connect(silent_addr))
        .await
        .expect("connect should give up on its own");

    assert!(
        matches!(result, Err(ConnError::RetriesExhausted { attempts: 4 })),
        "expected RetriesExhausted, got: {result:?}"
    );
    assert_eq!(client.state, ConnectionState::Invalid);
    assert_eq!(client.stats.retransmissions, 3);
}

/// A reply with the wrong control bits aborts the active open.
#[tokio::test]
async fn connect_aborts_on_unexpected_control() {
    let fake = Socket::bind(loopback()).await.unwrap();
    let fake_addr = fake.local_addr;

    let responder = tokio::spawn(async move {
        let (syn, from) = fake.recv_from().await.unwrap();
        assert_eq!(syn.header.control, Control::SYN);
        let reply = Segment::new(500, syn.header.seq.wrapping_add(1), Control::ACK, 1024, Vec::new());
        fake.send_to(&reply, from).await.unwrap();
    });

    let mut client = Connection::bind(loopback(), fast_config()).await.unwrap();
    let result = client.connect(fake_addr).await;
    responder.await.unwrap();

    assert!(
        matches!(result, Err(ConnError::ConnectionAborted(c)) if c == Control::ACK),
        "expected ConnectionAborted, got: {result:?}"
    );
    assert_eq!(client.state, ConnectionState::Invalid);
}

/// A SYN+ACK that acknowledges the wrong sequence number aborts too.
#[tokio::test]
async fn connect_aborts_on_wrong_ack_number() {
    let fake = Socket::bind(loopback()).await.unwrap();
    let fake_addr = fake.local_addr;

    let responder = tokio::spawn(async move {
        let (syn, from) = fake.recv_from().await.unwrap();
        let reply = Segment::new(500, syn.header.seq.wrapping_add(7), Control::SYN_ACK, 1024, Vec::new());
        fake.send_to(&reply, from).await.unwrap();
    });

    let mut client = Connection::bind(loopback(), fast_config()).await.unwrap();
    let result = client.connect(fake_addr).await;
    responder.await.unwrap();

    assert!(matches!(result, Err(ConnError::ConnectionAborted(c)) if c == Control::SYN_ACK));
    assert_eq!(client.state, ConnectionState::Invalid);
}

/// The first segment a listener sees must be a SYN.
#[tokio::test]
async fn accept_aborts_on_non_syn() {
    let mut server = Connection::bind(loopback(), fast_config()).await.unwrap();
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        let result = server.accept().await;
        (server, result)
    });

    let raw = Socket::bind(loopback()).await.unwrap();
    let stray = Segment::new(1, 1, Control::ACK, 1024, Vec::new());
    raw.send_to(&stray, server_addr).await.unwrap();

    let (server, result) = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConnError::ConnectionAborted(c)) if c == Control::ACK));
    assert_eq!(server.state, ConnectionState::Invalid);
    assert_eq!(server.peer_addr(), None);
}

/// SYN together with FIN on the wire is rejected while listening.
#[tokio::test]
async fn accept_rejects_syn_fin() {
    let mut server = Connection::bind(loopback(), fast_config()).await.unwrap();
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        let result = server.accept().await;
        (server, result)
    });

    let mut bytes = Segment::new(1, 0, Control::SYN, 1024, Vec::new()).encode();
    bytes[8..10].copy_from_slice(&(flags::SYN | flags::FIN).to_be_bytes());
    let raw = UdpSocket::bind(loopback()).await.unwrap();
    raw.send_to(&bytes, server_addr).await.unwrap();

    let (server, result) = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConnError::InvalidControlCombination(0x0003))));
    assert_eq!(server.state, ConnectionState::Invalid);
}

/// A lost SYN+ACK is recovered by retransmission.
#[tokio::test]
async fn lost_syn_ack_is_retransmitted() {
    // The server's first datagram is the SYN+ACK.
    let udp = UdpSocket::bind(loopback()).await.unwrap();
    let socket = Socket::new(Simulator::new(udp, SimulatorConfig::dropping([0]))).unwrap();
    let mut server = Connection::open(socket, fast_config()).unwrap();
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        server.accept().await?;
        Ok::<_, ConnError>(server)
    });

    let mut client = Connection::bind(loopback(), fast_config()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.connect(server_addr))
        .await
        .unwrap()
        .unwrap();
    let server = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(client.state, ConnectionState::Established);
    assert_eq!(server.state, ConnectionState::Established);
    assert!(server.stats.retransmissions >= 1);
    assert_eq!(server.socket().get_ref().stats().dropped, 1);
}

/// A second handshake on an established connection is refused.
#[tokio::test]
async fn connect_twice_is_invalid_state() {
    let (mut client, server) = establish_pair().await;

    let result = client.connect(server.local_addr()).await;
    assert!(matches!(
        result,
        Err(ConnError::InvalidState(ConnectionState::Established))
    ));
    assert_eq!(client.state, ConnectionState::Established);
}
