//! TCP transport: per-connection I/O tasks, length-prefix framing, and
//! the connection-state data the engine's consumer loop drives.
//!
//! Grounded in `tcp.c` end to end: `_connect_tcp_handle` (connect + TCP_NODELAY
//! + handshake timer), `_write_tcp_query`/`_write_tcp_query_cb` (the write
//! path and its `PENDING_CLOSE` free-on-callback rule), `_read_tcp_stream`/
//! `_parse_recv_data` (the framing state machine, reimplemented here as
//! `Framer`), and `_close_connection` (idempotent teardown).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::replay::engine::EngineEvent;
use crate::replay::ids::{ConnectionId, QueryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

pub struct Connection {
    pub client_id: u32,
    pub state: ConnectionState,
    /// Written, write callback not yet observed.
    pub queued: Vec<QueryId>,
    /// Write callback observed, awaiting a matching answer.
    pub sent: Vec<QueryId>,
    pub outbound_tx: mpsc::UnboundedSender<OutboundMsg>,
    pub idle_timer: Option<JoinHandle<()>>,
    pub io_task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn is_torn_down(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }
}

pub struct OutboundMsg {
    pub query_id: QueryId,
    pub framed: Vec<u8>,
}

/// Events the connection's I/O task reports back to the engine's single
/// consumer loop. Everything here is a plain message; no task other than
/// the engine's consumer ever touches `Connection`/`Request` state.
#[derive(Debug)]
pub enum ConnEvent {
    Connected(ConnectionId),
    ConnectFailed(ConnectionId),
    WriteDone(ConnectionId, QueryId),
    WriteFailed(ConnectionId, QueryId),
    /// A complete, length-framed DNS message arrived.
    Message(ConnectionId, Vec<u8>),
    Malformed(ConnectionId),
    Closed(ConnectionId),
    IdleTimeout(ConnectionId),
}

/// Length-prefixed TCP reassembly (RFC 1035 §4.2.2): 2-byte big-endian
/// length, then that many bytes of message.
///
/// `tcp.c`'s `_read_tcp_stream` optimizes this with a borrow-if-whole,
/// allocate-and-copy-if-partial split tracked by a `recv_free_after_use`
/// flag, because it works over a raw libuv read buffer. We always
/// accumulate into an owned `Vec<u8>` instead — no unsafe, no manual
/// ownership flag — since a few extra copies of DNS-message-sized buffers
/// aren't the bottleneck this simulator needs to optimize. See DESIGN.md.
pub struct Framer {
    state: FramerState,
    need: usize,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    ReadingLength,
    ReadingMessage,
}

impl Framer {
    pub fn new() -> Self {
        Framer { state: FramerState::ReadingLength, need: 2, buf: Vec::new() }
    }

    /// Feed newly-read bytes in, returning zero or more complete messages.
    /// A length-zero frame yields an empty `Vec` immediately, matching
    /// RFC 1035's silence on the question but never blocking reassembly on
    /// an impossible message.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let take = (self.need - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buf.len() < self.need {
                continue;
            }

            match self.state {
                FramerState::ReadingLength => {
                    let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                    self.buf.clear();
                    if len == 0 {
                        out.push(Vec::new());
                        self.need = 2;
                        self.state = FramerState::ReadingLength;
                    } else {
                        self.need = len;
                        self.state = FramerState::ReadingMessage;
                    }
                }
                FramerState::ReadingMessage => {
                    out.push(std::mem::take(&mut self.buf));
                    self.need = 2;
                    self.state = FramerState::ReadingLength;
                }
            }
        }
        out
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames a payload for the wire: 2-byte big-endian length prefix + payload,
/// matching `tcp.c`'s two-segment `uv_buf_t bufs[2]` write.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Connects to `target` (optionally bound to `source`), then runs the
/// write and read loops until the socket closes or errors, reporting
/// everything through `events_tx`. Matches `_connect_tcp_handle` +
/// `_on_tcp_handle_connected` + `_on_tcp_read`/`_write_tcp_query_cb`.
pub fn spawn_connection(
    conn_id: ConnectionId,
    target: SocketAddr,
    source: Option<IpAddr>,
    connect_timeout: Duration,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = match connect(target, source, connect_timeout).await {
            Ok(s) => s,
            Err(_) => {
                let _ = events_tx.send(EngineEvent::Conn(ConnEvent::ConnectFailed(conn_id)));
                return;
            }
        };
        if stream.set_nodelay(true).is_err() {
            let _ = events_tx.send(EngineEvent::Conn(ConnEvent::ConnectFailed(conn_id)));
            return;
        }
        let _ = events_tx.send(EngineEvent::Conn(ConnEvent::Connected(conn_id)));

        let (mut rd, mut wr) = stream.into_split();
        let write_events = events_tx.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match wr.write_all(&msg.framed).await {
                    Ok(()) => {
                        let _ = write_events.send(EngineEvent::Conn(ConnEvent::WriteDone(conn_id, msg.query_id)));
                    }
                    Err(_) => {
                        let _ = write_events.send(EngineEvent::Conn(ConnEvent::WriteFailed(conn_id, msg.query_id)));
                        break;
                    }
                }
            }
        });

        let read_events = events_tx;
        let read_task = tokio::spawn(async move {
            let mut framer = Framer::new();
            let mut buf = [0u8; 4096];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        let _ = read_events.send(EngineEvent::Conn(ConnEvent::Closed(conn_id)));
                        break;
                    }
                    Ok(n) => {
                        for message in framer.feed(&buf[..n]) {
                            let _ = read_events.send(EngineEvent::Conn(ConnEvent::Message(conn_id, message)));
                        }
                    }
                    Err(_) => {
                        let _ = read_events.send(EngineEvent::Conn(ConnEvent::Closed(conn_id)));
                        break;
                    }
                }
            }
        });

        let _ = tokio::join!(write_task, read_task);
    })
}

async fn connect(
    target: SocketAddr,
    source: Option<IpAddr>,
    connect_timeout: Duration,
) -> std::io::Result<TcpStream> {
    let connect_fut = async {
        match source {
            Some(ip) => {
                let bind_addr = SocketAddr::new(ip, 0);
                let socket = match bind_addr {
                    SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
                };
                socket.bind(bind_addr)?;
                socket.connect(target).await
            }
            None => TcpStream::connect(target).await,
        }
    };
    match tokio::time::timeout(connect_timeout, connect_fut).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
    }
}
