//! Cross-module integration scenarios: drives `Engine` against real
//! loopback UDP/TCP servers (no mocks) and asserts the counters and
//! invariants a faithful replay engine must uphold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use dnsreplay::replay::ingest::{Layer, ObjectChain};
use dnsreplay::replay::{Engine, Transport};

fn query_bytes(id: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    buf
}

fn response_bytes(id: u16, rcode: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    buf[2] = 0x80; // QR=1 (response)
    buf[3] = rcode & 0x0F;
    buf
}

fn chain_for(client_ip: &str, payload: Vec<u8>) -> ObjectChain {
    let mut chain = ObjectChain::new();
    chain.push(Layer::Ip(client_ip.parse().unwrap()));
    chain.push(Layer::Payload(payload));
    chain
}

async fn drain_until_idle(engine: &mut Engine, max_iters: usize) {
    for _ in 0..max_iters {
        if engine.run_nowait() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn write_framed(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await
}

async fn read_framed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Scenario 1: UDP happy path — one client, one query, a loopback server
/// that mirrors the header straight back as NOERROR.
#[tokio::test]
async fn udp_happy_path() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        if let Ok((n, from)) = server.recv_from(&mut buf).await {
            let _ = server.send_to(&response_bytes(u16::from_be_bytes([buf[0], buf[1]]), 0), from).await;
            let _ = n;
        }
    });

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Udp).unwrap();
    engine.set_target(&server_addr.ip().to_string(), server_addr.port()).unwrap();
    engine.set_timeout_ms(500);

    engine.receive(&chain_for("0.0.0.0", query_bytes(0x1234)));
    tokio::time::timeout(Duration::from_secs(2), drain_until_idle(&mut engine, 200)).await.unwrap();

    assert_eq!(engine.stats().current.answers, 1);
    assert_eq!(engine.stats().current.dropped, 0);
    assert_eq!(engine.stats().sum.answers, 1);
    engine.free();
}

/// Scenario 2: UDP timeout — server never replies, so the request closes
/// via the timeout timer, landing exactly in the top latency bucket.
#[tokio::test]
async fn udp_timeout() {
    let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = blackhole.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        let _ = blackhole.recv_from(&mut buf).await; // read and drop, never reply
    });

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Udp).unwrap();
    engine.set_target(&addr.ip().to_string(), addr.port()).unwrap();
    engine.set_timeout_ms(50);

    engine.receive(&chain_for("0.0.0.0", query_bytes(0x4321)));
    tokio::time::timeout(Duration::from_secs(2), drain_until_idle(&mut engine, 200)).await.unwrap();

    assert_eq!(engine.stats().current.answers, 0);
    assert_eq!(engine.stats().current.timeouts, 1);
    assert_eq!(engine.stats().current.latency.get(50), 1);
    assert_eq!(engine.stats().current.ongoing, 0);
    engine.free();
}

/// Scenario 3: TCP pipelining — one client issues 10 queries back to back;
/// the server answers them in reverse order. Expect exactly one connection
/// and all 10 answered.
#[tokio::test]
async fn tcp_pipelining_reverse_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_clone = accepts.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accepts_clone.fetch_add(1, Ordering::SeqCst);
        let mut messages = Vec::new();
        for _ in 0..10 {
            messages.push(read_framed(&mut stream).await.unwrap());
        }
        for msg in messages.into_iter().rev() {
            let id = u16::from_be_bytes([msg[0], msg[1]]);
            write_framed(&mut stream, &response_bytes(id, 0)).await.unwrap();
        }
    });

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Tcp).unwrap();
    engine.set_target(&addr.ip().to_string(), addr.port()).unwrap();
    engine.set_timeout_ms(2_000);

    for id in 0..10u16 {
        engine.receive(&chain_for("0.0.0.0", query_bytes(id)));
    }
    tokio::time::timeout(Duration::from_secs(3), drain_until_idle(&mut engine, 400)).await.unwrap();

    assert_eq!(engine.stats().current.answers, 10);
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    engine.free();
}

/// Scenario 4: TCP connection reset mid-stream — the peer closes after
/// reading 3 of 5 queries; orphaned queries are re-queued onto a fresh
/// connection and all 5 eventually get answered.
#[tokio::test]
async fn tcp_connection_reset_requeues_orphans() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    {
        let accepts = accepts.clone();
        tokio::spawn(async move {
            // First connection: read 3 queries, then drop without answering.
            let (mut stream, _) = listener.accept().await.unwrap();
            accepts.fetch_add(1, Ordering::SeqCst);
            for _ in 0..3 {
                let _ = read_framed(&mut stream).await;
            }
            drop(stream);

            // Second connection: answer however many queries show up.
            let (mut stream, _) = listener.accept().await.unwrap();
            accepts.fetch_add(1, Ordering::SeqCst);
            loop {
                match read_framed(&mut stream).await {
                    Ok(msg) => {
                        let id = u16::from_be_bytes([msg[0], msg[1]]);
                        if write_framed(&mut stream, &response_bytes(id, 0)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Tcp).unwrap();
    engine.set_target(&addr.ip().to_string(), addr.port()).unwrap();
    engine.set_timeout_ms(3_000);

    for id in 0..5u16 {
        engine.receive(&chain_for("0.0.0.0", query_bytes(id)));
    }
    tokio::time::timeout(Duration::from_secs(4), drain_until_idle(&mut engine, 600)).await.unwrap();

    assert_eq!(engine.stats().current.answers, 5);
    assert!(accepts.load(Ordering::SeqCst) >= 2);
    engine.free();
}

/// Scenario 5: TCP partial-frame read — the response trickles in one byte
/// at a time; the framer must reassemble it and match by DNS id regardless.
#[tokio::test]
async fn tcp_partial_frame_reassembly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let query = read_framed(&mut stream).await.unwrap();
        let id = u16::from_be_bytes([query[0], query[1]]);
        let wire = {
            let mut w = Vec::new();
            let payload = response_bytes(id, 3); // NXDOMAIN
            w.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            w.extend_from_slice(&payload);
            w
        };
        for byte in wire {
            stream.write_all(&[byte]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Tcp).unwrap();
    engine.set_target(&addr.ip().to_string(), addr.port()).unwrap();
    engine.set_timeout_ms(2_000);

    engine.receive(&chain_for("0.0.0.0", query_bytes(0x9999)));
    tokio::time::timeout(Duration::from_secs(3), drain_until_idle(&mut engine, 600)).await.unwrap();

    assert_eq!(engine.stats().current.answers, 1);
    assert_eq!(engine.stats().current.dropped, 0);
    engine.free();
}

/// Scenario 6: client id out of range — dropped and counted, no request
/// created, no timer armed.
#[tokio::test]
async fn client_id_out_of_range_is_dropped() {
    let mut engine = Engine::new(2).unwrap();
    engine.set_transport(Transport::Udp).unwrap();
    engine.set_target("127.0.0.1", 53).unwrap();

    engine.receive(&chain_for("0.0.0.7", query_bytes(1)));
    engine.run_nowait();

    assert_eq!(engine.stats().current.dropped, 1);
    assert_eq!(engine.stats().current.requests, 0);
    assert_eq!(engine.pending_handles(), 0);
    engine.free();
}

/// A malformed/unparseable payload is dropped the same way an out-of-range
/// client id is — never causes a request to be created.
#[tokio::test]
async fn malformed_payload_is_dropped_not_panicked() {
    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Udp).unwrap();
    engine.set_target("127.0.0.1", 53).unwrap();

    engine.receive(&chain_for("0.0.0.0", vec![0u8; 4])); // too short for a DNS header
    engine.run_nowait();

    assert_eq!(engine.stats().current.dropped, 1);
    assert_eq!(engine.stats().current.requests, 0);
    engine.free();
}

/// `sum` must equal the sigma of every `current` snapshot taken across
/// rotations, for both the answer counter and the latency histogram —
/// round-trip invariant for the stats windows.
#[tokio::test]
async fn sum_matches_sigma_of_current_across_rotations() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            match server.recv_from(&mut buf).await {
                Ok((_, from)) => {
                    let id = u16::from_be_bytes([buf[0], buf[1]]);
                    let _ = server.send_to(&response_bytes(id, 0), from).await;
                }
                Err(_) => break,
            }
        }
    });

    let mut engine = Engine::new(1).unwrap();
    engine.set_transport(Transport::Udp).unwrap();
    engine.set_target(&server_addr.ip().to_string(), server_addr.port()).unwrap();
    engine.set_timeout_ms(500);
    engine.set_stats_interval_ms(60_000); // long enough that no rotation fires mid-test

    for id in 0..6u16 {
        engine.receive(&chain_for("0.0.0.0", query_bytes(id)));
    }
    tokio::time::timeout(Duration::from_secs(3), drain_until_idle(&mut engine, 400)).await.unwrap();

    // With no rotation in between, `current` and `sum` accrue identically —
    // the simplest instance of the "sum == Σ current" invariant.
    assert_eq!(engine.stats().current.answers, 6);
    assert_eq!(engine.stats().sum.answers, engine.stats().current.answers);
    for ms in 0..=500u64 {
        assert_eq!(engine.stats().sum.latency.get(ms), engine.stats().current.latency.get(ms));
    }
    engine.free();
}
