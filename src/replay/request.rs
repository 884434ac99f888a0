//! Request record and its child queries.
//!
//! Grounded in `internal.h`'s `_output_dnssim_request` (qry list, client,
//! payload, dns_q, created_at/ended_at, timer, state) and `_output_dnssim_query`
//! plus its UDP/TCP specializations. `common.c`'s `_request_answered`,
//! `_close_request` and `_close_request_timeout` map to the methods below.

use std::time::Instant;
use tokio::task::JoinHandle;

use crate::replay::ids::{ConnectionId, QueryId, RequestId};
use crate::replay::packet::ResponseCode;

/// TCP-specific query lifecycle (`internal.h`'s query state enum, minus the
/// states that only make sense mid-write-callback since we model those as
/// distinct connection-queue membership instead — see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpQueryPhase {
    PendingWrite,
    PendingWriteCb,
    Sent,
    PendingClose,
    WriteFailed,
}

#[derive(Debug)]
pub struct UdpQuery {
    pub request_id: RequestId,
    pub task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct TcpQuery {
    pub request_id: RequestId,
    pub connection_id: Option<ConnectionId>,
    pub phase: TcpQueryPhase,
}

#[derive(Debug)]
pub enum Query {
    Udp(UdpQuery),
    Tcp(TcpQuery),
}

impl Query {
    pub fn request_id(&self) -> RequestId {
        match self {
            Query::Udp(q) => q.request_id,
            Query::Tcp(q) => q.request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Ongoing,
    Closing,
}

pub struct Request {
    pub client_id: u32,
    pub payload: Vec<u8>,
    pub dns_id: u16,
    pub created_at: Instant,
    pub ended_at: Option<Instant>,
    pub timeout_handle: Option<JoinHandle<()>>,
    pub state: RequestState,
    pub queries: Vec<QueryId>,
}

impl Request {
    pub fn new(client_id: u32, payload: Vec<u8>, dns_id: u16) -> Self {
        Request {
            client_id,
            payload,
            dns_id,
            created_at: Instant::now(),
            ended_at: None,
            timeout_handle: None,
            state: RequestState::Ongoing,
            queries: Vec::new(),
        }
    }

    /// Elapsed time since creation, clamped to `timeout_ms` — matches
    /// `_request_answered`'s `if (req->ended_at > ...) req->ended_at = ...`
    /// clamp so a race between the answer and the timeout firing never
    /// reports a latency above the configured bound.
    pub fn latency_ms(&self, now: Instant, timeout_ms: u64) -> u64 {
        let elapsed = now.saturating_duration_since(self.created_at).as_millis() as u64;
        elapsed.min(timeout_ms)
    }
}

/// Outcome of completing a request, returned to the engine so it can update
/// stats windows and the client/connection tables without `Request`
/// borrowing them back.
#[derive(Debug, Clone, Copy)]
pub enum Completion {
    Answered { rcode: ResponseCode },
    TimedOut,
}
