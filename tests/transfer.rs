//! Integration tests for data transfer and connection teardown on a clean
//! loopback path.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinHandle;

use microtcp::{Config, ConnError, Connection, ConnectionState, Shutdown};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const GUARD: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn test_config() -> Config {
    Config {
        time_wait: Duration::from_millis(50),
        fin_wait_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

async fn establish_pair(config: Config) -> (Connection, Connection) {
    let mut server = Connection::bind(loopback(), config.clone()).await.unwrap();
    let server_addr = server.local_addr();
    let server_task = tokio::spawn(async move {
        server.accept().await?;
        Ok::<_, ConnError>(server)
    });

    let mut client = Connection::bind(loopback(), config).await.unwrap();
    tokio::time::timeout(GUARD, client.connect(server_addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let server = tokio::time::timeout(GUARD, server_task)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed");
    (client, server)
}

/// Read exactly `len` bytes with a caller buffer of `chunk` bytes.
async fn read_exact(conn: &mut Connection, len: usize, chunk: usize) -> Result<Vec<u8>, ConnError> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; chunk];
    while out.len() < len {
        let n = conn.recv(&mut buf).await?;
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Spawn a task that reads `len` bytes on `server` and hands both back.
fn spawn_reader(mut server: Connection, len: usize, chunk: usize) -> JoinHandle<(Connection, Vec<u8>)> {
    tokio::spawn(async move {
        let data = read_exact(&mut server, len, chunk).await.expect("server recv failed");
        (server, data)
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Data transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn small_message_round_trip() {
    let (mut client, server) = establish_pair(test_config()).await;

    let echo = tokio::spawn(async move {
        let mut server = server;
        let request = read_exact(&mut server, 5, 64).await.unwrap();
        server.send(b"world").await.unwrap();
        (server, request)
    });

    assert_eq!(client.send(b"hello").await.unwrap(), 5);
    let reply = tokio::time::timeout(GUARD, read_exact(&mut client, 5, 64))
        .await
        .unwrap()
        .unwrap();
    let (server, request) = tokio::time::timeout(GUARD, echo).await.unwrap().unwrap();

    assert_eq!(request, b"hello");
    assert_eq!(reply, b"world");
    assert_eq!(client.stats.bytes_sent, 5);
    assert_eq!(server.stats.bytes_received, 5);
    assert_eq!(server.stats.bytes_sent, 5);
}

/// 3600 bytes at MSS 1024 go out as three full segments and one 528-byte
/// tail, each acknowledged once, and arrive as a single reassembled read.
#[tokio::test]
async fn fragmented_write_is_reassembled() {
    let config = Config {
        time_wait: Duration::from_millis(50),
        ..Config::with_mss(1024)
    };
    let (mut client, mut server) = establish_pair(config).await;
    let start_seq = client.local_seq();
    let data = pattern(3600);

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let n = server.recv(&mut buf).await.unwrap();
        buf.truncate(n);
        (server, buf)
    });

    assert_eq!(client.send(&data).await.unwrap(), 3600);
    let (server, received) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    assert_eq!(received.len(), 3600, "one recv call returns the whole write");
    assert_eq!(received, data);
    assert_eq!(client.stats.data_segments_sent, 4);
    assert_eq!(client.stats.acks_received, 4);
    assert_eq!(client.stats.retransmissions, 0);
    assert_eq!(client.local_seq(), start_seq.wrapping_add(3600));
    assert_eq!(client.peer_ack_expected(), client.local_seq());
    assert_eq!(server.peer_seq_expected(), client.local_seq());
}

#[tokio::test]
async fn large_transfer_spans_many_bursts() {
    let (mut client, server) = establish_pair(test_config()).await;
    let data = pattern(100_000);

    let reader = spawn_reader(server, data.len(), 16 * 1024);
    tokio::time::timeout(GUARD, client.send(&data))
        .await
        .unwrap()
        .unwrap();
    let (_server, received) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    assert_eq!(received, data);
    assert_eq!(client.stats.bytes_sent, 100_000);
    assert!(client.congestion_window() > client.config().init_cwnd);
}

/// A caller buffer smaller than the message gets the rest on later calls.
#[tokio::test]
async fn small_caller_buffer_reads_in_pieces() {
    let (mut client, server) = establish_pair(test_config()).await;
    let data = pattern(5000);

    let reader = spawn_reader(server, data.len(), 700);
    client.send(&data).await.unwrap();
    let (server, received) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    assert_eq!(received, data);
    assert_eq!(server.receiver.buffered(), 0);
    assert_eq!(server.local_window(), server.config().recv_buffer_len as u16);
}

#[tokio::test]
async fn consecutive_writes_keep_boundaries_in_order() {
    let (mut client, server) = establish_pair(test_config()).await;

    let reader = spawn_reader(server, 3 + 4000 + 2, 8192);
    client.send(b"abc").await.unwrap();
    client.send(&pattern(4000)).await.unwrap();
    client.send(b"yz").await.unwrap();
    let (_server, received) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    let mut expected = b"abc".to_vec();
    expected.extend(pattern(4000));
    expected.extend_from_slice(b"yz");
    assert_eq!(received, expected);
}

/// A payload-free segment completes a `recv` without moving the expected
/// sequence number, and the stream carries on afterwards.
#[tokio::test]
async fn control_only_segment_yields_empty_read() {
    let (client, mut server) = establish_pair(test_config()).await;
    let expected = server.peer_seq_expected();

    let bare = microtcp::Segment::new(
        client.local_seq(),
        client.peer_seq_expected(),
        microtcp::Control::ACK,
        8192,
        Vec::new(),
    );
    client.socket().send_to(&bare, server.local_addr()).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(GUARD, server.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.peer_seq_expected(), expected);
    assert_eq!(server.state, ConnectionState::Established);

    let mut client = client;
    let reader = spawn_reader(server, 4, 16);
    client.send(b"next").await.unwrap();
    let (server, data) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();
    assert_eq!(data, b"next");
    assert_eq!(server.peer_seq_expected(), expected.wrapping_add(4));
}

#[tokio::test]
async fn zero_length_send_is_a_no_op() {
    let (mut client, _server) = establish_pair(test_config()).await;
    let seq = client.local_seq();

    assert_eq!(client.send(&[]).await.unwrap(), 0);
    assert_eq!(client.local_seq(), seq);
    assert_eq!(client.stats.data_segments_sent, 0);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Local shutdown walks both sides through the half-close states, and the
/// peer's reader sees end-of-stream.
#[tokio::test]
async fn local_shutdown_closes_both_sides() {
    let (mut client, server) = establish_pair(test_config()).await;

    let reader = tokio::spawn(async move {
        let mut server = server;
        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        let end = server.recv(&mut buf).await;
        (server, end)
    });

    client.send(b"bye").await.unwrap();
    let seq_before_fin = client.local_seq();
    tokio::time::timeout(GUARD, client.shutdown(Shutdown::Local))
        .await
        .unwrap()
        .unwrap();
    let (mut server, end) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    assert!(matches!(end, Err(ConnError::Eof)));
    assert_eq!(client.state, ConnectionState::Closed);
    assert_eq!(server.state, ConnectionState::Closed);
    assert_eq!(client.local_seq(), seq_before_fin.wrapping_add(1), "FIN consumes one sequence number");
    assert_eq!(server.peer_seq_expected(), client.local_seq());
    assert_eq!(client.peer_seq_expected(), server.local_seq());

    let tail = &client.stats.transitions[client.stats.transitions.len() - 2..];
    assert_eq!(tail, &[ConnectionState::ClosingByLocal, ConnectionState::Closed]);
    let tail = &server.stats.transitions[server.stats.transitions.len() - 2..];
    assert_eq!(tail, &[ConnectionState::ClosingByPeer, ConnectionState::Closed]);

    assert!(client.receiver.is_released());
    assert!(server.receiver.is_released());

    // The data path is gone on both sides.
    assert!(matches!(
        client.send(b"late").await,
        Err(ConnError::InvalidState(ConnectionState::Closed))
    ));
    assert!(matches!(
        server.send(b"late").await,
        Err(ConnError::InvalidState(ConnectionState::Closed))
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(server.recv(&mut buf).await, Err(ConnError::Eof)));
    // Only the side that saw the peer's FIN reports end of stream.
    assert!(matches!(
        client.recv(&mut buf).await,
        Err(ConnError::InvalidState(ConnectionState::Closed))
    ));
    assert!(matches!(
        client.shutdown(Shutdown::Local).await,
        Err(ConnError::InvalidState(ConnectionState::Closed))
    ));
}

/// The peer side can also be driven explicitly instead of through `recv`.
#[tokio::test]
async fn explicit_peer_shutdown() {
    let (mut client, server) = establish_pair(test_config()).await;

    let closer = tokio::spawn(async move {
        let mut server = server;
        let result = server.shutdown(Shutdown::Peer).await;
        (server, result)
    });

    client.shutdown(Shutdown::Local).await.unwrap();
    let (server, result) = tokio::time::timeout(GUARD, closer).await.unwrap().unwrap();

    result.unwrap();
    assert_eq!(client.state, ConnectionState::Closed);
    assert_eq!(server.state, ConnectionState::Closed);
}

/// A peer that never sends its own FIN makes local shutdown time out.
#[tokio::test]
async fn local_shutdown_times_out_without_peer_fin() {
    let config = Config {
        fin_wait_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (mut client, server) = establish_pair(config).await;

    // Acknowledge the FIN by hand but never answer with our own.
    let silent = tokio::spawn(async move {
        let (fin, from) = server.socket().recv_from().await.unwrap();
        assert!(fin.header.control.is_fin());
        let ack = microtcp::Segment::new(
            server.local_seq(),
            fin.header.seq.wrapping_add(1),
            microtcp::Control::ACK,
            1024,
            Vec::new(),
        );
        server.socket().send_to(&ack, from).await.unwrap();
        server
    });

    let result = tokio::time::timeout(GUARD, client.shutdown(Shutdown::Local))
        .await
        .unwrap();
    let _server = silent.await.unwrap();

    assert!(matches!(result, Err(ConnError::Timeout)), "got {result:?}");
    assert_eq!(client.state, ConnectionState::Closed);
    assert!(client
        .stats
        .transitions
        .contains(&ConnectionState::ClosingByLocal));
}

#[tokio::test]
async fn reset_propagates_to_peer() {
    let (mut client, server) = establish_pair(test_config()).await;

    let reader = tokio::spawn(async move {
        let mut server = server;
        let mut buf = [0u8; 16];
        let result = server.recv(&mut buf).await;
        (server, result)
    });

    client.reset().await.unwrap();
    let (server, result) = tokio::time::timeout(GUARD, reader).await.unwrap().unwrap();

    assert!(matches!(result, Err(ConnError::PeerReset)));
    assert_eq!(client.state, ConnectionState::Closed);
    assert_eq!(server.state, ConnectionState::Closed);
    assert!(server.receiver.is_released());
}

/// A closed connection can be opened again with a fresh receive buffer.
#[tokio::test]
async fn closed_connection_can_reopen() {
    let (mut client, server) = establish_pair(test_config()).await;
    let server_addr = server.local_addr();

    let closer = tokio::spawn(async move {
        let mut server = server;
        server.shutdown(Shutdown::Peer).await.unwrap();
        server.accept().await.unwrap();
        let data = read_exact(&mut server, 5, 16).await.unwrap();
        (server, data)
    });

    client.shutdown(Shutdown::Local).await.unwrap();
    let first_isn = client.stats.local_isn;
    client.connect(server_addr).await.unwrap();
    client.send(b"again").await.unwrap();
    let (server, data) = tokio::time::timeout(GUARD, closer).await.unwrap().unwrap();

    assert_eq!(&data, b"again");
    assert_eq!(server.state, ConnectionState::Established);
    assert_eq!(client.state, ConnectionState::Established);
    assert!(!client.receiver.is_released());
    assert_ne!(client.stats.local_isn, first_isn);
}
