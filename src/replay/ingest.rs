//! Ingest producer stand-in.
//!
//! Grounded in `dnssim.c`'s `_receive`/`_extract_client`: the real dnsjit
//! pipeline hands the output module an object chain (payload layer linked
//! to an ip/ip6 layer via a `previous` pointer); this module defines the
//! Rust equivalent (`ObjectChain`, a flat `Vec<Layer>` rather than a boxed
//! linked list — an idiomatic simplification noted in DESIGN.md) plus a
//! minimal `QueryLogReader` that turns a captured-query log into chains,
//! since real pcap ingestion is a separate producer's job.

use std::io::BufRead;
use std::net::IpAddr;

use serde::Deserialize;

use crate::replay::errors::IngestError;

#[derive(Debug, Clone)]
pub enum Layer {
    Payload(Vec<u8>),
    Ip(IpAddr),
}

/// The chain the dispatcher walks to find a payload and destination IP.
/// Order doesn't matter; `receive()` looks each layer up by kind.
#[derive(Debug, Clone, Default)]
pub struct ObjectChain {
    layers: Vec<Layer>,
}

impl ObjectChain {
    pub fn new() -> Self {
        ObjectChain { layers: Vec::new() }
    }

    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.layers.iter().find_map(|l| match l {
            Layer::Payload(p) => Some(p.as_slice()),
            _ => None,
        })
    }

    pub fn destination_ip(&self) -> Option<IpAddr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ip(ip) => Some(*ip),
            _ => None,
        })
    }
}

/// Client id is the first four octets of the destination address, big
/// endian — identical treatment for IPv4 and IPv6 (the original only wires
/// IPv6's `uv_ip6_addr` and stubs IPv4 with a TODO in `output_dnssim_target`;
/// this crate treats both families the same way `_extract_client` reads the
/// first 4 octets).
pub fn extract_client_id(ip: IpAddr) -> u32 {
    let octets: [u8; 4] = match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };
    u32::from_be_bytes(octets)
}

#[derive(Debug, Deserialize)]
struct LogLine {
    src_ip: String,
    payload_hex: String,
}

/// Reads a query log: one JSON object per line, `{"src_ip": "...",
/// "payload_hex": "..."}`. A deliberately simple substitute for real
/// packet-capture ingestion.
pub struct QueryLogReader<R> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> QueryLogReader<R> {
    pub fn new(reader: R) -> Self {
        QueryLogReader { lines: reader.lines() }
    }
}

impl<R: BufRead> Iterator for QueryLogReader<R> {
    type Item = Result<ObjectChain, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(IngestError::Io(e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => return Some(Err(IngestError::MalformedLine(line))),
            };
            let ip: IpAddr = match parsed.src_ip.parse() {
                Ok(ip) => ip,
                Err(_) => return Some(Err(IngestError::MalformedLine(line))),
            };
            let payload = match hex::decode(parsed.payload_hex.trim()) {
                Ok(bytes) => bytes,
                Err(_) => return Some(Err(IngestError::MalformedLine(line))),
            };
            let mut chain = ObjectChain::new();
            chain.push(Layer::Ip(ip));
            chain.push(Layer::Payload(payload));
            return Some(Ok(chain));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn client_id_reads_first_four_octets_v4() {
        let ip: IpAddr = "10.20.30.40".parse().unwrap();
        assert_eq!(extract_client_id(ip), 0x0A14_1E28);
    }

    #[test]
    fn client_id_reads_first_four_octets_v6() {
        let ip: IpAddr = "0a14:1e28::1".parse().unwrap();
        assert_eq!(extract_client_id(ip), 0x0A14_1E28);
    }

    #[test]
    fn reader_parses_lines() {
        let data = "{\"src_ip\":\"127.0.0.1\",\"payload_hex\":\"deadbeef\"}\n";
        let mut reader = QueryLogReader::new(Cursor::new(data));
        let chain = reader.next().unwrap().unwrap();
        assert_eq!(chain.payload(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
        assert_eq!(chain.destination_ip(), Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn reader_reports_malformed_line() {
        let data = "not json\n";
        let mut reader = QueryLogReader::new(Cursor::new(data));
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn missing_payload_layer_yields_none() {
        let chain = ObjectChain::new();
        assert!(chain.payload().is_none());
        assert!(chain.destination_ip().is_none());
    }
}
