//! UDP transport: one socket per query, fire-and-forget send plus a
//! single recv, no retransmit.
//!
//! Grounded in `dnssim.c`'s UDP path (`_create_req_udp` et al.) and the
//! teacher's `DnsClient::send_udp_query` in `client.rs` for the
//! bind/send/recv shape. Unlike the original's UDP read callback — which
//! never correlated the response against the request's DNS id at all —
//! this implementation always checks the id match in the engine before
//! calling it answered.

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::replay::engine::EngineEvent;
use crate::replay::ids::RequestId;
use crate::replay::packet::{DnsHeaderView, PacketError};

#[derive(Debug)]
pub enum UdpEvent {
    /// A datagram arrived and parsed cleanly; the engine still checks the
    /// DNS id against the owning request before treating it as an answer.
    Response(RequestId, DnsHeaderView),
    Malformed(RequestId),
    SendFailed(RequestId),
}

pub fn spawn_query(
    request_id: RequestId,
    target: SocketAddr,
    source: Option<IpAddr>,
    payload: Vec<u8>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match bind(source, target).await {
            Ok(s) => s,
            Err(_) => {
                let _ = events_tx.send(EngineEvent::Udp(UdpEvent::SendFailed(request_id)));
                return;
            }
        };
        if socket.send_to(&payload, target).await.is_err() {
            let _ = events_tx.send(EngineEvent::Udp(UdpEvent::SendFailed(request_id)));
            return;
        }

        let mut buf = vec![0u8; 4096];
        match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => match DnsHeaderView::parse(&buf[..n]) {
                Ok(header) => {
                    let _ = events_tx.send(EngineEvent::Udp(UdpEvent::Response(request_id, header)));
                }
                Err(PacketError::TooShort(_)) => {
                    let _ = events_tx.send(EngineEvent::Udp(UdpEvent::Malformed(request_id)));
                }
            },
            Err(_) => {
                let _ = events_tx.send(EngineEvent::Udp(UdpEvent::Malformed(request_id)));
            }
        }
    })
}

async fn bind(source: Option<IpAddr>, target: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr = match source {
        Some(ip) => SocketAddr::new(ip, 0),
        None => match target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        },
    };
    UdpSocket::bind(bind_addr).await
}
