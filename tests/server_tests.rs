//! End-to-end exercises of the server over loopback UDP: a real listener,
//! real ephemeral session sockets, and a scripted client on the other side.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use tftpd::config::TftpConfig;
use tftpd::engine::Engine;
use tftpd::transport::UdpTransport;
use tftpd::wire::{Mode, Packet};

struct TestServer {
    addr: SocketAddr,
    root: PathBuf,
}

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tftpd_e2e_{}_{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_server(name: &str, tweak: impl FnOnce(&mut TftpConfig)) -> TestServer {
    let root = temp_root(name);
    let mut config = TftpConfig {
        root_dir: root.clone(),
        ..TftpConfig::default()
    };
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.logging.audit_enabled = false;
    tweak(&mut config);

    let (tx, rx) = mpsc::channel(1024);
    let transport = UdpTransport::bind(config.bind_addr, tx.clone()).unwrap();
    let addr = transport.local_addr().unwrap();
    let engine = Engine::new(transport, &config, tx, rx);
    tokio::spawn(engine.run());

    TestServer { addr, root }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn send(socket: &UdpSocket, to: SocketAddr, packet: Packet) {
    socket.send_to(&packet.to_bytes(), to).await.unwrap();
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a server datagram")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = vec![0u8; 2048];
    let result =
        tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expected no further datagrams");
}

fn expect_data(frame: &[u8], block: u16) -> Vec<u8> {
    match Packet::parse(frame).unwrap() {
        Packet::Data { block: b, payload } => {
            assert_eq!(b, block, "unexpected block number");
            payload.to_vec()
        }
        other => panic!("expected DATA#{block}, got {other:?}"),
    }
}

fn expect_ack(frame: &[u8], block: u16) {
    match Packet::parse(frame).unwrap() {
        Packet::Ack { block: b } => assert_eq!(b, block, "unexpected ack block"),
        other => panic!("expected ACK#{block}, got {other:?}"),
    }
}

fn expect_error(frame: &[u8], code: u16) -> String {
    match Packet::parse(frame).unwrap() {
        Packet::Error { code: c, message } => {
            assert_eq!(c, code, "unexpected error code");
            message
        }
        other => panic!("expected ERROR({code}), got {other:?}"),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn serves_a_511_byte_file_in_one_data_packet() {
    let server = start_server("rrq-511", |_| {}).await;
    let content = pattern(511);
    std::fs::write(server.root.join("small.bin"), &content).unwrap();

    let sock = client().await;
    send(&sock, server.addr, Packet::Rrq { filename: "small.bin".into(), mode: Mode::Octet })
        .await;

    let (frame, tid) = recv(&sock).await;
    assert_ne!(tid.port(), server.addr.port(), "replies use a fresh TID");
    assert_eq!(frame.len(), 515);
    assert_eq!(expect_data(&frame, 1), content);

    send(&sock, tid, Packet::Ack { block: 1 }).await;
    expect_silence(&sock).await;
}

#[tokio::test]
async fn serves_a_1025_byte_file_in_three_blocks() {
    let server = start_server("rrq-1025", |_| {}).await;
    let content = pattern(1025);
    std::fs::write(server.root.join("medium.bin"), &content).unwrap();

    let sock = client().await;
    send(&sock, server.addr, Packet::Rrq { filename: "medium.bin".into(), mode: Mode::Octet })
        .await;

    let mut received = Vec::new();
    let mut tid = None;
    for (block, frame_len) in [(1u16, 516usize), (2, 516), (3, 5)] {
        let (frame, from) = recv(&sock).await;
        let tid = *tid.get_or_insert(from);
        assert_eq!(from, tid);
        assert_eq!(frame.len(), frame_len);
        received.extend(expect_data(&frame, block));
        send(&sock, tid, Packet::Ack { block }).await;
    }

    assert_eq!(received, content);
    expect_silence(&sock).await;
}

#[tokio::test]
async fn netascii_read_expands_a_trailing_line_feed() {
    let server = start_server("rrq-netascii", |_| {}).await;
    std::fs::write(server.root.join("hello.txt"), b"Hello\n").unwrap();

    let sock = client().await;
    send(&sock, server.addr, Packet::Rrq { filename: "hello.txt".into(), mode: Mode::Netascii })
        .await;

    let (frame, tid) = recv(&sock).await;
    assert_eq!(expect_data(&frame, 1), b"Hello\r\n");

    send(&sock, tid, Packet::Ack { block: 1 }).await;
    expect_silence(&sock).await;
}

#[tokio::test]
async fn upload_is_acked_blockwise_and_committed() {
    let server = start_server("wrq-flow", |_| {}).await;

    let sock = client().await;
    send(&sock, server.addr, Packet::Wrq { filename: "upload.bin".into(), mode: Mode::Octet })
        .await;

    let (frame, tid) = recv(&sock).await;
    expect_ack(&frame, 0);

    let payloads = [pattern(512), pattern(512), pattern(100)];
    let mut expected = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let block = (i + 1) as u16;
        expected.extend_from_slice(payload);
        send(
            &sock,
            tid,
            Packet::Data { block, payload: Bytes::from(payload.clone()) },
        )
        .await;
        let (frame, _) = recv(&sock).await;
        expect_ack(&frame, block);
    }

    let written = std::fs::read(server.root.join("upload.bin")).unwrap();
    assert_eq!(written.len(), 1124);
    assert_eq!(written, expected);

    // A retransmitted final block during the dally period is re-acked.
    send(
        &sock,
        tid,
        Packet::Data { block: 3, payload: Bytes::from(payloads[2].clone()) },
    )
    .await;
    let (frame, _) = recv(&sock).await;
    expect_ack(&frame, 3);
}

#[tokio::test]
async fn unanswered_read_retransmits_five_times_then_times_out() {
    // Tight clamps keep the whole timeout sequence around a quarter second.
    let server = start_server("rrq-timeout", |config| {
        config.rtt.min_ms = 5;
        config.rtt.max_ms = 40;
    })
    .await;
    std::fs::write(server.root.join("slow.bin"), pattern(1024)).unwrap();

    let sock = client().await;
    send(&sock, server.addr, Packet::Rrq { filename: "slow.bin".into(), mode: Mode::Octet })
        .await;

    // The original send plus five retransmissions, never acked.
    for _ in 0..6 {
        let (frame, _) = recv(&sock).await;
        assert_eq!(expect_data(&frame, 1).len(), 512);
    }

    let (frame, _) = recv(&sock).await;
    let message = expect_error(&frame, 0);
    assert_eq!(message, "Timed Out");
    expect_silence(&sock).await;
}

#[tokio::test]
async fn stray_ack_on_the_listening_socket_gets_unknown_tid() {
    let server = start_server("stray-ack", |_| {}).await;

    let sock = client().await;
    send(&sock, server.addr, Packet::Ack { block: 7 }).await;

    let (frame, from) = recv(&sock).await;
    assert_eq!(from, server.addr, "the reply comes from the well-known port");
    let message = expect_error(&frame, 5);
    assert_eq!(message, "Unknown TID.");
    expect_silence(&sock).await;
}

#[tokio::test]
async fn read_of_a_missing_file_is_answered_with_file_not_found() {
    let server = start_server("rrq-missing", |_| {}).await;

    let sock = client().await;
    send(&sock, server.addr, Packet::Rrq { filename: "nope.bin".into(), mode: Mode::Octet })
        .await;

    let (frame, _) = recv(&sock).await;
    let message = expect_error(&frame, 1);
    assert_eq!(message, "File not found.");
}

#[tokio::test]
async fn mail_write_lands_in_the_user_spool() {
    let spool = temp_root("spool");
    tftpd::filesystem::set_mail_prefix(spool.clone());
    let server = start_server("wrq-mail", |_| {}).await;

    let sock = client().await;
    send(&sock, server.addr, Packet::Wrq { filename: "alice".into(), mode: Mode::Mail }).await;

    let (frame, tid) = recv(&sock).await;
    expect_ack(&frame, 0);

    send(
        &sock,
        tid,
        Packet::Data { block: 1, payload: Bytes::from_static(b"a short message") },
    )
    .await;
    let (frame, _) = recv(&sock).await;
    expect_ack(&frame, 1);

    let user_dir = spool.join("alice");
    let entries: Vec<_> = std::fs::read_dir(&user_dir)
        .expect("per-user spool directory is created on demand")
        .collect::<std::io::Result<_>>()
        .unwrap();
    assert_eq!(entries.len(), 1);
    let deposited = std::fs::read(entries[0].path()).unwrap();
    assert_eq!(deposited, b"a short message");
}

#[tokio::test]
async fn concurrent_reads_from_one_client_use_distinct_tids() {
    let server = start_server("concurrent", |_| {}).await;
    let a = pattern(300);
    let b: Vec<u8> = pattern(400).iter().rev().copied().collect();
    std::fs::write(server.root.join("a.bin"), &a).unwrap();
    std::fs::write(server.root.join("b.bin"), &b).unwrap();

    // Two sockets on the same host, each its own transfer.
    let sock_a = client().await;
    let sock_b = client().await;
    send(&sock_a, server.addr, Packet::Rrq { filename: "a.bin".into(), mode: Mode::Octet }).await;
    send(&sock_b, server.addr, Packet::Rrq { filename: "b.bin".into(), mode: Mode::Octet }).await;

    let (frame_a, tid_a) = recv(&sock_a).await;
    let (frame_b, tid_b) = recv(&sock_b).await;
    assert_ne!(tid_a, tid_b);
    assert_eq!(expect_data(&frame_a, 1), a);
    assert_eq!(expect_data(&frame_b, 1), b);

    send(&sock_a, tid_a, Packet::Ack { block: 1 }).await;
    send(&sock_b, tid_b, Packet::Ack { block: 1 }).await;
    expect_silence(&sock_a).await;
    expect_silence(&sock_b).await;
}
