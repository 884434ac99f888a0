//! Minimal DNS header accessor.
//!
//! The core treats DNS wire parsing as supporting infrastructure — in a
//! full deployment a separate producer hands in an
//! already-parsed header. This module is the thin stand-in: enough of
//! RFC 1035 §4.1.1 to read the 16-bit id and 4-bit RCODE the engine needs
//! to correlate responses and bucket stats, nothing more (no question/answer
//! section decoding, no name compression, no EDNS0/OPT extended RCODE).

use derive_more::{Display, Error};

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum PacketError {
    #[display(fmt = "DNS header too short ({} bytes)", _0)]
    TooShort(#[error(not(source))] usize),
}

/// The 19 IANA-assigned RCODEs this simulator buckets, plus a catch-all.
///
/// Matches `protocol.rs::ResultCode`'s shape, generalized from its 6
/// variants to the full set `common.c`'s `_request_answered` switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
    BadVers,
    BadKey,
    BadTime,
    BadMode,
    BadName,
    BadAlg,
    BadTrunc,
    BadCookie,
    Other,
}

impl ResponseCode {
    /// All 19 named codes plus `Other`, in stable histogram-bucket order.
    pub const ALL: [ResponseCode; 20] = [
        ResponseCode::NoError,
        ResponseCode::FormErr,
        ResponseCode::ServFail,
        ResponseCode::NxDomain,
        ResponseCode::NotImp,
        ResponseCode::Refused,
        ResponseCode::YxDomain,
        ResponseCode::YxRrSet,
        ResponseCode::NxRrSet,
        ResponseCode::NotAuth,
        ResponseCode::NotZone,
        ResponseCode::BadVers,
        ResponseCode::BadKey,
        ResponseCode::BadTime,
        ResponseCode::BadMode,
        ResponseCode::BadName,
        ResponseCode::BadAlg,
        ResponseCode::BadTrunc,
        ResponseCode::BadCookie,
        ResponseCode::Other,
    ];

    pub fn index(self) -> usize {
        ResponseCode::ALL.iter().position(|c| *c == self).unwrap()
    }

    /// Decode the plain 4-bit header RCODE (0-15). Extended RCODEs that
    /// require EDNS0/OPT (16-23) can't be produced from a bare header, so
    /// any value this parser can't name maps to `Other` — tests that need
    /// the extended codes construct `ResponseCode` directly.
    pub fn from_header_nibble(v: u8) -> ResponseCode {
        match v & 0x0F {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            6 => ResponseCode::YxDomain,
            7 => ResponseCode::YxRrSet,
            8 => ResponseCode::NxRrSet,
            9 => ResponseCode::NotAuth,
            10 => ResponseCode::NotZone,
            _ => ResponseCode::Other,
        }
    }
}

/// A parsed view over a DNS message's 12-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeaderView {
    pub id: u16,
    pub is_response: bool,
    pub truncated: bool,
    pub rcode: ResponseCode,
}

impl DnsHeaderView {
    pub fn parse(buf: &[u8]) -> Result<DnsHeaderView, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }

        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags1 = buf[2];
        let flags2 = buf[3];

        Ok(DnsHeaderView {
            id,
            is_response: flags1 & 0x80 != 0,
            truncated: flags1 & 0x02 != 0,
            rcode: ResponseCode::from_header_nibble(flags2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u16, flags1: u8, flags2: u8) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&id.to_be_bytes());
        buf[2] = flags1;
        buf[3] = flags2;
        buf
    }

    #[test]
    fn parses_id_and_rcode() {
        let buf = header(0x1234, 0x80, 0x03);
        let view = DnsHeaderView::parse(&buf).unwrap();
        assert_eq!(view.id, 0x1234);
        assert!(view.is_response);
        assert_eq!(view.rcode, ResponseCode::NxDomain);
    }

    #[test]
    fn truncated_flag() {
        let buf = header(1, 0x02, 0);
        let view = DnsHeaderView::parse(&buf).unwrap();
        assert!(view.truncated);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = DnsHeaderView::parse(&[0u8; 4]).unwrap_err();
        assert_eq!(err, PacketError::TooShort(4));
    }

    #[test]
    fn unknown_nibble_maps_to_other() {
        assert_eq!(ResponseCode::from_header_nibble(11), ResponseCode::Other);
        assert_eq!(ResponseCode::from_header_nibble(15), ResponseCode::Other);
    }

    #[test]
    fn histogram_indices_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ResponseCode::ALL {
            assert!(seen.insert(code.index()));
        }
    }
}
