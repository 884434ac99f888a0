//! DNS traffic simulator
//!
//! Replays a log of captured DNS queries against a target resolver over UDP
//! or TCP, fanning connections out per logical client and tracking
//! per-request latency and rcode distribution in rotating stats windows.
//!
//! # Architecture
//!
//! * `replay` - the simulator engine: dispatch, transports, client table,
//!   stats windows, ingest

/// DNS traffic replay engine
pub mod replay;
