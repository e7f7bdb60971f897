//! The connection handshake of reliable UDP, which assigns a conv to a new session.
//!
//! ```ascii
//!  dialer                                   listener
//!    | -- nonce (4 bytes) ------------------> |  allocate conv, remember (addr -> conv, expiry)
//!    | <----------- nonce + conv (8 bytes) -- |
//!    | == ARQ: frame [0] (01 00 00 00 00) ==> |  first ARQ packet with a remembered conv
//!    |                                        |   creates the session
//! ```
//!
//! The dialer resends its nonce until it gets a reply. The listener answers every nonce from the
//!  same address with the same conv for as long as the handshake record lives, so a resent nonce
//!  does not burn convs.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Buf;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::util::random::Random;


pub const NONCE_LEN: usize = 4;
pub const REPLY_LEN: usize = 8;
/// The third handshake step, sent *through* the ARQ: a stream frame of length 1 with payload 0.
///  The peer layer ignores this frame.
pub const ACK_PACKET: [u8; 5] = [1, 0, 0, 0, 0];

pub fn encode_nonce(nonce: u32) -> [u8; NONCE_LEN] {
    nonce.to_le_bytes()
}

/// The listener's reply: echoed nonce followed by the allocated conv.
pub fn encode_reply(nonce: &[u8; NONCE_LEN], conv: u32) -> [u8; REPLY_LEN] {
    let mut reply = [0u8; REPLY_LEN];
    reply[..NONCE_LEN].copy_from_slice(nonce);
    reply[NONCE_LEN..].copy_from_slice(&conv.to_le_bytes());
    reply
}

/// Returns (nonce, conv) if `data` has the shape of a handshake reply.
pub fn parse_reply(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() != REPLY_LEN {
        return None;
    }
    let mut buf = data;
    let nonce = buf.get_u32_le();
    let conv = buf.get_u32_le();
    Some((nonce, conv))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandshakeRecord {
    pub conv: u32,
    pub expires_at_ms: u64,
}

/// Listener-side pending handshakes, keyed by the remote address.
pub struct HandshakeTable {
    records: FxHashMap<SocketAddr, HandshakeRecord>,
    last_conv: u32,
    ttl_ms: u64,
}

impl HandshakeTable {
    pub fn new<R: Random>(ttl_ms: u64) -> HandshakeTable {
        Self::with_first_conv(ttl_ms, R::next_u32())
    }

    pub fn with_first_conv(ttl_ms: u64, first_conv: u32) -> HandshakeTable {
        HandshakeTable {
            records: Default::default(),
            last_conv: first_conv.wrapping_sub(1),
            ttl_ms,
        }
    }

    /// Returns the conv of the pending handshake with `addr`, allocating one if there is none or
    ///  if it expired. A fresh conv is never 0, and never one that `in_use` reports or that another
    ///  pending handshake holds.
    pub fn get_or_allocate(&mut self, addr: SocketAddr, now_ms: u64, in_use: impl Fn(u32) -> bool) -> u32 {
        match self.records.get(&addr) {
            Some(record) if record.expires_at_ms > now_ms => return record.conv,
            Some(_) => {
                self.records.remove(&addr);
            }
            None => {}
        }

        let conv = loop {
            self.last_conv = self.last_conv.wrapping_add(1);
            let candidate = self.last_conv;
            if candidate == 0 || in_use(candidate) || self.records.values().any(|r| r.conv == candidate) {
                continue;
            }
            break candidate;
        };

        debug!("new handshake with {:?}: conv {}", addr, conv);
        self.records.insert(addr, HandshakeRecord {
            conv,
            expires_at_ms: now_ms + self.ttl_ms,
        });
        conv
    }

    /// Completes the handshake with `addr` if it is pending for exactly this conv and has not
    ///  expired yet, whether or not it was purged already.
    pub fn take_matching(&mut self, addr: SocketAddr, conv: u32, now_ms: u64) -> bool {
        match self.records.get(&addr) {
            Some(record) if record.conv == conv && record.expires_at_ms > now_ms => {
                self.records.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Discards expired records and returns how many there were.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|addr, record| {
            let keep = record.expires_at_ms > now_ms;
            if !keep {
                debug!("handshake with {:?} (conv {}) expired", addr, record.conv);
            }
            keep
        });
        before - self.records.len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&HandshakeRecord> {
        self.records.get(addr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Debug for HandshakeTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeTable{{pending:{}}}", self.records.len())
    }
}
