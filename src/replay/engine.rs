//! The engine: a single consumer task that owns every mutable
//! piece of state (clients, requests, queries, connections, stats) and
//! drains an internal event channel fed by per-query/per-connection tokio
//! tasks. Grounded in `dnssim.c`'s `output_dnssim_new`/`_receive`/
//! `output_dnssim_run_nowait` and the libuv callback model those drive —
//! here expressed as `Engine::receive` (dispatch) and `Engine::run_nowait`
//! (drain + apply).

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::replay::client::ClientTable;
use crate::replay::config::{EngineConfig, Transport};
use crate::replay::errors::ConfigError;
use crate::replay::ids::{ConnectionId, RequestId};
use crate::replay::ingest::{extract_client_id, ObjectChain};
use crate::replay::packet::DnsHeaderView;
use crate::replay::request::{Completion, Query, Request, RequestState, TcpQuery, TcpQueryPhase, UdpQuery};
use crate::replay::slab::Slab;
use crate::replay::stats::StatsWindows;
use crate::replay::tcp::{self, ConnEvent, Connection, ConnectionState};
use crate::replay::udp::{self, UdpEvent};

pub(crate) enum EngineEvent {
    Udp(UdpEvent),
    Conn(ConnEvent),
    RequestTimeout(RequestId),
}

pub struct Engine {
    config: EngineConfig,
    clients: ClientTable,
    requests: Slab<Request>,
    queries: Slab<Query>,
    connections: Slab<Connection>,
    stats: StatsWindows,
    last_rotate: Instant,
    next_source_idx: usize,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
    pub fn new(max_clients: u32) -> Result<Engine, ConfigError> {
        if max_clients == 0 {
            return Err(ConfigError::ZeroClients);
        }
        let config = EngineConfig { max_clients, ..EngineConfig::default() };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Engine {
            clients: ClientTable::new(max_clients),
            requests: Slab::new(),
            queries: Slab::new(),
            connections: Slab::new(),
            stats: StatsWindows::new(config.timeout_ms),
            last_rotate: Instant::now(),
            next_source_idx: 0,
            config,
            events_tx,
            events_rx,
        })
    }

    pub fn set_transport(&mut self, transport: Transport) -> Result<(), ConfigError> {
        if transport == Transport::Tls {
            return Err(ConfigError::UnsupportedTransport(transport));
        }
        self.config.transport = transport;
        Ok(())
    }

    pub fn set_target(&mut self, host: &str, port: u16) -> Result<(), ConfigError> {
        let ip: IpAddr = host.parse().map_err(|_| ConfigError::InvalidTarget(host.to_string()))?;
        self.config.target = Some(SocketAddr::new(ip, port));
        Ok(())
    }

    pub fn add_source(&mut self, ip: &str) -> Result<(), ConfigError> {
        let ip: IpAddr = ip.parse().map_err(|_| ConfigError::InvalidSource(ip.to_string()))?;
        self.config.sources.push(ip);
        Ok(())
    }

    /// Resizes the latency histogram bound. Intended to be called before
    /// dispatch starts; changing it mid-run only affects requests created
    /// afterward's stats bucketing window (the live `current`/`sum`
    /// windows are rebuilt from scratch).
    pub fn set_timeout_ms(&mut self, ms: u64) {
        self.config.timeout_ms = ms;
        self.stats = StatsWindows::new(ms);
    }

    pub fn set_tcp_idle_timeout_ms(&mut self, ms: u64) {
        self.config.tcp_idle_timeout_ms = ms;
    }

    pub fn set_stats_interval_ms(&mut self, ms: u64) {
        self.config.stats_interval_ms = ms;
    }

    pub fn stats(&self) -> &StatsWindows {
        &self.stats
    }

    /// How many requests are still in flight, plus connections still
    /// trying to establish — the Rust analogue of `uv_run`'s "more events
    /// pending" signal.
    pub fn pending_handles(&self) -> usize {
        self.requests.len()
            + self
                .connections
                .iter()
                .filter(|(_, c)| matches!(c.state, ConnectionState::Connecting | ConnectionState::Active))
                .count()
    }

    /// Walks the object chain, extracts client id and
    /// payload, parses the DNS header, creates the request, and dispatches
    /// it on the configured transport. Never blocks — all I/O happens in
    /// spawned tasks. Mirrors `dnssim.c`'s `_receive`.
    pub fn receive(&mut self, chain: &ObjectChain) {
        let payload = match chain.payload() {
            Some(p) => p,
            None => {
                debug!("dropping object chain with no payload layer");
                self.stats.record_dropped();
                return;
            }
        };
        let dest_ip = match chain.destination_ip() {
            Some(ip) => ip,
            None => {
                debug!("dropping object chain with no ip layer");
                self.stats.record_dropped();
                return;
            }
        };

        let client_id = extract_client_id(dest_ip);
        if self.clients.get(client_id).is_none() {
            warn!("client id {} >= max_clients {}, dropping", client_id, self.clients.len());
            self.stats.record_dropped();
            return;
        }

        let header = match DnsHeaderView::parse(payload) {
            Ok(h) => h,
            Err(_) => {
                debug!("dropping malformed query payload");
                self.stats.record_dropped();
                return;
            }
        };

        let target = match self.config.target {
            Some(t) => t,
            None => {
                warn!("no target configured, dropping query");
                self.stats.record_dropped();
                return;
            }
        };

        let request = Request::new(client_id, payload.to_vec(), header.id);
        let request_id = self.requests.insert(request);
        self.stats.record_request();

        let timeout_handle = {
            let events_tx = self.events_tx.clone();
            let timeout = Duration::from_millis(self.config.timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events_tx.send(EngineEvent::RequestTimeout(request_id));
            })
        };
        self.requests.get_mut(request_id).unwrap().timeout_handle = Some(timeout_handle);

        let source = self.next_source();
        match self.config.transport {
            Transport::Udp | Transport::UdpOnly => self.dispatch_udp(request_id, target, source),
            Transport::Tcp => self.dispatch_tcp(request_id, client_id, target, source),
            Transport::Tls => unreachable!("rejected by set_transport"),
        }
    }

    /// Round-robin over the configured source-binding pool, matching the
    /// spec's `add_source`: "selection on bind is round-robin". Empty pool
    /// means "let the OS pick", same as before any sources are configured.
    fn next_source(&mut self) -> Option<IpAddr> {
        if self.config.sources.is_empty() {
            return None;
        }
        let ip = self.config.sources[self.next_source_idx % self.config.sources.len()];
        self.next_source_idx = self.next_source_idx.wrapping_add(1);
        Some(ip)
    }

    fn dispatch_udp(&mut self, request_id: RequestId, target: SocketAddr, source: Option<IpAddr>) {
        let payload = self.requests.get(request_id).unwrap().payload.clone();
        let events_tx = self.events_tx.clone();
        let task = udp::spawn_query(request_id, target, source, payload, events_tx);

        let query_id = self.queries.insert(Query::Udp(UdpQuery { request_id, task: Some(task) }));
        self.requests.get_mut(request_id).unwrap().queries.push(query_id);
    }

    fn dispatch_tcp(&mut self, request_id: RequestId, client_id: u32, target: SocketAddr, source: Option<IpAddr>) {
        let query_id = self.queries.insert(Query::Tcp(TcpQuery {
            request_id,
            connection_id: None,
            phase: TcpQueryPhase::PendingWrite,
        }));
        self.requests.get_mut(request_id).unwrap().queries.push(query_id);

        let client = self.clients.get_mut(client_id).expect("client id validated in receive()");
        client.pending.push_back(query_id);

        self.ensure_connection(client_id, target, source);
        if let Some(active) = self.find_active_connection(client_id) {
            self.flush_pending(active);
        }
    }

    fn find_active_connection(&self, client_id: u32) -> Option<ConnectionId> {
        let client = self.clients.get(client_id)?;
        client.connections.iter().copied().find(|&id| {
            self.connections.get(id).map(|c| c.state == ConnectionState::Active).unwrap_or(false)
        })
    }

    fn has_live_connection(&self, client_id: u32) -> bool {
        let Some(client) = self.clients.get(client_id) else { return false };
        client.connections.iter().any(|&id| {
            self.connections
                .get(id)
                .map(|c| matches!(c.state, ConnectionState::Connecting | ConnectionState::Active))
                .unwrap_or(false)
        })
    }

    fn ensure_connection(&mut self, client_id: u32, target: SocketAddr, source: Option<IpAddr>) {
        if self.has_live_connection(client_id) {
            return;
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn_id = self.connections.insert(Connection {
            client_id,
            state: ConnectionState::Connecting,
            queued: Vec::new(),
            sent: Vec::new(),
            outbound_tx,
            idle_timer: None,
            io_task: None,
        });

        let events_tx = self.events_tx.clone();
        // Bounds the connect handshake with the same duration the idle timer
        // uses post-connect — one timer value serving both expiries, per
        // §4.3/§9's "handshake timer" design note.
        let connect_timeout = Duration::from_millis(self.config.tcp_idle_timeout_ms.max(1));
        let io_task = tcp::spawn_connection(conn_id, target, source, connect_timeout, events_tx, outbound_rx);
        self.connections.get_mut(conn_id).unwrap().io_task = Some(io_task);

        self.clients.get_mut(client_id).unwrap().connections.push(conn_id);
    }

    /// Moves every pending query for `conn_id`'s client onto the wire.
    /// Grounded in `tcp.c`'s `_send_pending_queries`.
    fn flush_pending(&mut self, conn_id: ConnectionId) {
        let client_id = match self.connections.get(conn_id) {
            Some(c) if c.state == ConnectionState::Active => c.client_id,
            _ => return,
        };
        let pending: Vec<_> = self.clients.get_mut(client_id).unwrap().pending.drain(..).collect();
        for query_id in pending {
            let request_id = match self.queries.get(query_id) {
                Some(Query::Tcp(q)) => q.request_id,
                _ => continue,
            };
            let payload = match self.requests.get(request_id) {
                Some(r) => r.payload.clone(),
                None => continue,
            };
            let framed = tcp::frame(&payload);
            let conn = self.connections.get_mut(conn_id).unwrap();
            if conn.outbound_tx.send(tcp::OutboundMsg { query_id, framed }).is_err() {
                continue;
            }
            conn.queued.push(query_id);
            if let Some(Query::Tcp(q)) = self.queries.get_mut(query_id) {
                q.connection_id = Some(conn_id);
                q.phase = TcpQueryPhase::PendingWriteCb;
            }
        }
    }

    fn refresh_idle_timer(&mut self, conn_id: ConnectionId) {
        let idle = Duration::from_millis(self.config.tcp_idle_timeout_ms);
        let events_tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let _ = events_tx.send(EngineEvent::Conn(ConnEvent::IdleTimeout(conn_id)));
        });
        if let Some(conn) = self.connections.get_mut(conn_id) {
            if let Some(old) = conn.idle_timer.replace(handle) {
                old.abort();
            }
        }
    }

    /// Idempotent teardown. Re-pends still-ongoing queries for retry
    /// (the ORPHANED transition); queries whose request already finished
    /// are simply freed. Matches `tcp.c`'s `_close_connection` plus the
    /// retry-on-teardown behavior a reset-mid-stream connection requires.
    ///
    /// Drives the connection through `Closing` before `Closed` (monotone
    /// per §3) and, once every stranded query has been re-pended or freed,
    /// frees the slab slot itself — this is the one place a `Connection`
    /// is ever removed, so skipping it would leak a slot per connection
    /// ever opened.
    fn close_connection(&mut self, conn_id: ConnectionId) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(c) if !c.is_torn_down() => c,
            _ => return,
        };
        conn.state = ConnectionState::Closing;
        if let Some(timer) = conn.idle_timer.take() {
            timer.abort();
        }
        if let Some(io) = conn.io_task.take() {
            io.abort();
        }
        let client_id = conn.client_id;
        let stranded: Vec<_> = conn.queued.drain(..).chain(conn.sent.drain(..)).collect();
        conn.state = ConnectionState::Closed;

        if let Some(client) = self.clients.get_mut(client_id) {
            client.connections.retain(|&id| id != conn_id);
        }

        let target = self.config.target;
        let source = self.next_source();

        for query_id in stranded {
            let still_wanted = match self.queries.get(query_id) {
                Some(Query::Tcp(q)) => matches!(q.phase, TcpQueryPhase::PendingWriteCb | TcpQueryPhase::Sent)
                    && self.requests.get(q.request_id).map(|r| r.state == RequestState::Ongoing).unwrap_or(false),
                _ => false,
            };
            if still_wanted {
                if let Some(Query::Tcp(q)) = self.queries.get_mut(query_id) {
                    q.connection_id = None;
                    q.phase = TcpQueryPhase::PendingWrite;
                }
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.pending.push_back(query_id);
                }
            } else {
                self.free_query(query_id);
            }
        }

        self.connections.remove(conn_id);

        if let (Some(client), Some(target)) = (self.clients.get(client_id), target) {
            if !client.pending.is_empty() {
                self.ensure_connection(client_id, target, source);
                if let Some(active) = self.find_active_connection(client_id) {
                    self.flush_pending(active);
                }
            }
        }
    }

    /// Closes a single query: aborts its UDP task, or removes it from
    /// whatever list owns it on the TCP side. A query mid-write
    /// (`PendingWriteCb`) isn't freed yet — it's marked `PendingClose` and
    /// freed when the write callback fires, matching `tcp.c`'s
    /// `_write_tcp_query_cb` rule.
    fn close_query(&mut self, query_id: crate::replay::ids::QueryId) {
        let udp_task = match self.queries.get_mut(query_id) {
            Some(Query::Udp(q)) => Some(q.task.take()),
            Some(Query::Tcp(q)) => {
                match q.phase {
                    TcpQueryPhase::PendingWriteCb => {
                        q.phase = TcpQueryPhase::PendingClose;
                        return;
                    }
                    TcpQueryPhase::PendingWrite => {
                        let request_id = q.request_id;
                        let client_id = self.requests.get(request_id).map(|r| r.client_id).unwrap_or(0);
                        if let Some(client) = self.clients.get_mut(client_id) {
                            client.pending.retain(|&id| id != query_id);
                        }
                    }
                    TcpQueryPhase::Sent => {
                        if let Some(conn_id) = q.connection_id {
                            if let Some(conn) = self.connections.get_mut(conn_id) {
                                conn.sent.retain(|&id| id != query_id);
                            }
                        }
                    }
                    TcpQueryPhase::WriteFailed | TcpQueryPhase::PendingClose => {}
                }
                None
            }
            None => return,
        };
        if let Some(Some(task)) = udp_task {
            task.abort();
        }
        self.queries.remove(query_id);
    }

    fn free_query(&mut self, query_id: crate::replay::ids::QueryId) {
        self.queries.remove(query_id);
    }

    /// Idempotent request teardown: aborts the timeout timer, closes every
    /// child query, then frees the request. Matches `common.c`'s
    /// `_close_request`.
    fn close_request(&mut self, request_id: RequestId) {
        let request = match self.requests.get_mut(request_id) {
            Some(r) if r.state == RequestState::Ongoing => r,
            _ => return,
        };
        request.state = RequestState::Closing;
        if let Some(timer) = request.timeout_handle.take() {
            timer.abort();
        }
        self.stats.record_ongoing_done();
        let queries = std::mem::take(&mut self.requests.get_mut(request_id).unwrap().queries);
        for query_id in queries {
            self.close_query(query_id);
        }
        self.requests.remove(request_id);
    }

    fn complete(&mut self, request_id: RequestId, outcome: Completion) {
        let latency_ms = match self.requests.get(request_id) {
            Some(r) if r.state == RequestState::Ongoing => r.latency_ms(Instant::now(), self.config.timeout_ms),
            _ => return,
        };
        if let Some(r) = self.requests.get_mut(request_id) {
            r.ended_at = Some(r.created_at + Duration::from_millis(latency_ms));
        }
        match outcome {
            Completion::Answered { rcode } => self.stats.record_answer(rcode, latency_ms),
            Completion::TimedOut => self.stats.record_timeout(),
        }
        self.close_request(request_id);
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Udp(UdpEvent::Response(request_id, header)) => {
                let matches = self.requests.get(request_id).map(|r| r.dns_id == header.id).unwrap_or(false);
                if matches {
                    self.complete(request_id, Completion::Answered { rcode: header.rcode });
                } else {
                    debug!("dropping udp response with mismatched dns id");
                    self.stats.record_dropped();
                }
            }
            EngineEvent::Udp(UdpEvent::Malformed(_)) => {
                self.stats.record_dropped();
            }
            EngineEvent::Udp(UdpEvent::SendFailed(request_id)) => {
                self.stats.record_dropped();
                self.close_request(request_id);
            }
            EngineEvent::Conn(ConnEvent::Connected(conn_id)) => {
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.state = ConnectionState::Active;
                }
                self.refresh_idle_timer(conn_id);
                self.flush_pending(conn_id);
            }
            EngineEvent::Conn(ConnEvent::ConnectFailed(conn_id)) => {
                self.stats.record_dropped();
                self.close_connection(conn_id);
            }
            EngineEvent::Conn(ConnEvent::WriteDone(conn_id, query_id)) => {
                let phase = match self.queries.get(query_id) {
                    Some(Query::Tcp(q)) => Some(q.phase),
                    _ => None,
                };
                match phase {
                    Some(TcpQueryPhase::PendingClose) => self.free_query(query_id),
                    Some(_) => {
                        if let Some(conn) = self.connections.get_mut(conn_id) {
                            conn.queued.retain(|&id| id != query_id);
                            conn.sent.push(query_id);
                        }
                        if let Some(Query::Tcp(q)) = self.queries.get_mut(query_id) {
                            q.phase = TcpQueryPhase::Sent;
                        }
                        self.refresh_idle_timer(conn_id);
                    }
                    None => {}
                }
            }
            EngineEvent::Conn(ConnEvent::WriteFailed(conn_id, query_id)) => {
                if let Some(Query::Tcp(q)) = self.queries.get_mut(query_id) {
                    if q.phase != TcpQueryPhase::PendingClose {
                        q.phase = TcpQueryPhase::WriteFailed;
                    }
                }
                self.stats.record_dropped();
                self.close_connection(conn_id);
            }
            EngineEvent::Conn(ConnEvent::Message(conn_id, bytes)) => {
                self.handle_tcp_message(conn_id, &bytes);
            }
            EngineEvent::Conn(ConnEvent::Malformed(_)) => {
                self.stats.record_dropped();
            }
            EngineEvent::Conn(ConnEvent::Closed(conn_id)) => {
                self.close_connection(conn_id);
            }
            EngineEvent::Conn(ConnEvent::IdleTimeout(conn_id)) => {
                self.close_connection(conn_id);
            }
            EngineEvent::RequestTimeout(request_id) => {
                self.complete(request_id, Completion::TimedOut);
            }
        }
    }

    /// Scans the connection's `sent` list for a query whose request's DNS
    /// id matches, matching `tcp.c`'s `_process_tcp_dnsmsg`.
    fn handle_tcp_message(&mut self, conn_id: ConnectionId, bytes: &[u8]) {
        let header = match DnsHeaderView::parse(bytes) {
            Ok(h) => h,
            Err(_) => {
                self.stats.record_dropped();
                return;
            }
        };

        // The write half and the read half run as independent tokio tasks
        // (tcp.rs's `into_split`), so nothing orders a `WriteDone` ahead of
        // a `Message` the way one libuv loop would (§5). A fast responder
        // can answer while the query is still in `queued`, so both lists
        // are candidates, not just `sent`.
        let candidates: Vec<_> = match self.connections.get(conn_id) {
            Some(c) => c.sent.iter().chain(c.queued.iter()).copied().collect(),
            None => return,
        };

        let found = candidates.into_iter().find(|&query_id| {
            let request_id = match self.queries.get(query_id) {
                Some(Query::Tcp(q)) => q.request_id,
                _ => return false,
            };
            self.requests.get(request_id).map(|r| r.dns_id == header.id).unwrap_or(false)
        });

        match found {
            Some(query_id) => {
                let request_id = match self.queries.get(query_id) {
                    Some(Query::Tcp(q)) => q.request_id,
                    _ => return,
                };
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.sent.retain(|&id| id != query_id);
                    conn.queued.retain(|&id| id != query_id);
                }
                self.refresh_idle_timer(conn_id);
                self.complete(request_id, Completion::Answered { rcode: header.rcode });
            }
            None => {
                debug!("dropping tcp message with no matching sent/queued query");
                self.stats.record_dropped();
            }
        }
    }

    /// Drains every event ready right now, applies it, and rolls the
    /// stats window if its interval has elapsed. Returns
    /// `pending_handles()` so a caller can decide whether to keep polling,
    /// mirroring `output_dnssim_run_nowait`'s `uv_run(..., UV_RUN_NOWAIT)`.
    pub fn run_nowait(&mut self) -> usize {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
        self.maybe_rotate_stats();
        self.pending_handles()
    }

    fn maybe_rotate_stats(&mut self) {
        if self.last_rotate.elapsed() >= Duration::from_millis(self.config.stats_interval_ms) {
            self.stats.rotate();
            self.last_rotate = Instant::now();
        }
    }

    /// Aborts every outstanding task/timer. Consumes the engine since
    /// nothing can dispatch through it afterward.
    pub fn free(mut self) {
        for key in self.requests.keys() {
            if let Some(request) = self.requests.get_mut(key) {
                if let Some(timer) = request.timeout_handle.take() {
                    timer.abort();
                }
            }
        }
        for key in self.queries.keys() {
            if let Some(Query::Udp(q)) = self.queries.get_mut(key) {
                if let Some(task) = q.task.take() {
                    task.abort();
                }
            }
        }
        for key in self.connections.keys() {
            if let Some(conn) = self.connections.get_mut(key) {
                if let Some(timer) = conn.idle_timer.take() {
                    timer.abort();
                }
                if let Some(io) = conn.io_task.take() {
                    io.abort();
                }
            }
        }
    }
}
