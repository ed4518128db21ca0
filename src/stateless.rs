//! Stateless packet routing.
//!
//! Version negotiation and stateless resets are produced by the engine
//! outside any connection. Over DNS they can only travel as the answer to
//! a query, so the server parks them here and hands each one out as the
//! payload for the first query that belongs to the same peer connection.

use crate::engine::{QuicEngine, StatelessPacket, LOCAL_CID_LEN, RESET_SECRET_LEN};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Pending packets kept at most
pub const STATELESS_QUEUE_MAX: usize = 64;

/// Pending packets older than this are dropped
pub const STATELESS_PACKET_TTL_US: u64 = 5_000_000;

const MAX_CID_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Long,
    Short,
}

/// Connection ids pulled out of a QUIC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicHeader<'a> {
    pub form: HeaderForm,
    pub dcid: &'a [u8],
    /// Empty for short headers
    pub scid: &'a [u8],
}

/// Parse the invariant part of a QUIC header
///
/// Short headers carry no length, so their DCID is assumed to be the
/// locally issued length.
pub fn parse_header(packet: &[u8]) -> Option<QuicHeader<'_>> {
    let first = *packet.first()?;
    if first & 0x80 == 0 {
        let dcid = packet.get(1..1 + LOCAL_CID_LEN)?;
        return Some(QuicHeader {
            form: HeaderForm::Short,
            dcid,
            scid: &[],
        });
    }

    // first byte, version
    let mut pos = 5;
    let dcid_len = *packet.get(pos)? as usize;
    if dcid_len > MAX_CID_LEN {
        return None;
    }
    pos += 1;
    let dcid = packet.get(pos..pos + dcid_len)?;
    pos += dcid_len;
    let scid_len = *packet.get(pos)? as usize;
    if scid_len > MAX_CID_LEN {
        return None;
    }
    pos += 1;
    let scid = packet.get(pos..pos + scid_len)?;
    Some(QuicHeader {
        form: HeaderForm::Long,
        dcid,
        scid,
    })
}

/// A connection-less packet waiting for a query to ride on
#[derive(Debug, Clone)]
pub struct PendingStatelessPacket {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub form: HeaderForm,
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    pub created_at: u64,
}

impl PendingStatelessPacket {
    fn parse(packet: StatelessPacket, now: u64) -> Option<Self> {
        let header = parse_header(&packet.bytes)?;
        let (form, dcid, scid) = (header.form, header.dcid.to_vec(), header.scid.to_vec());
        Some(Self {
            bytes: packet.bytes,
            peer: packet.peer,
            form,
            dcid,
            scid,
            created_at: now,
        })
    }

    fn trailing_token(&self) -> Option<&[u8]> {
        let len = self.bytes.len();
        if len < RESET_SECRET_LEN {
            return None;
        }
        Some(&self.bytes[len - RESET_SECRET_LEN..])
    }

    /// Whether this packet answers a query carrying `incoming`
    fn matches<F>(&self, incoming: &QuicHeader<'_>, reset_secret: &F) -> bool
    where
        F: Fn(&[u8]) -> Option<[u8; RESET_SECRET_LEN]>,
    {
        match (self.form, incoming.form) {
            (HeaderForm::Long, HeaderForm::Long) => {
                !incoming.scid.is_empty() && self.dcid == incoming.scid
            }
            (HeaderForm::Short, HeaderForm::Short) => {
                if incoming.dcid.is_empty() {
                    return false;
                }
                if !self.dcid.is_empty() && self.dcid == incoming.dcid {
                    return true;
                }
                match (reset_secret(incoming.dcid), self.trailing_token()) {
                    (Some(secret), Some(token)) => secret[..] == *token,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// Bounded queue of pending stateless packets
#[derive(Debug)]
pub struct StatelessRouter {
    queue: VecDeque<PendingStatelessPacket>,
    capacity: usize,
    ttl_us: u64,
}

impl Default for StatelessRouter {
    fn default() -> Self {
        Self::new(STATELESS_QUEUE_MAX, STATELESS_PACKET_TTL_US)
    }
}

impl StatelessRouter {
    pub fn new(capacity: usize, ttl_us: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            ttl_us,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, packet: StatelessPacket, now: u64) {
        let Some(pending) = PendingStatelessPacket::parse(packet, now) else {
            log::debug!("dropping unparsable stateless packet");
            return;
        };
        if self.queue.len() >= self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                log::debug!(
                    "stateless queue full, evicting packet for {} ({} bytes)",
                    evicted.peer,
                    evicted.bytes.len()
                );
            }
        }
        self.queue.push_back(pending);
    }

    /// Move everything the engine produced into the queue
    pub fn collect<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, now: u64) -> usize {
        let mut count = 0;
        while let Some(packet) = engine.take_stateless_packet() {
            self.push(packet, now);
            count += 1;
        }
        count
    }

    pub fn expire(&mut self, now: u64) {
        let ttl = self.ttl_us;
        let before = self.queue.len();
        self.queue
            .retain(|pending| now.saturating_sub(pending.created_at) < ttl);
        let expired = before - self.queue.len();
        if expired > 0 {
            log::debug!("expired {} stateless packets", expired);
        }
    }

    /// Dequeue the first pending packet that answers `incoming`
    ///
    /// `reset_secret` computes the reset token for a connection id.
    pub fn take_for<F>(&mut self, incoming: &[u8], now: u64, reset_secret: F) -> Option<Vec<u8>>
    where
        F: Fn(&[u8]) -> Option<[u8; RESET_SECRET_LEN]>,
    {
        self.expire(now);
        if self.queue.is_empty() {
            return None;
        }
        let header = parse_header(incoming)?;
        let index = self
            .queue
            .iter()
            .position(|pending| pending.matches(&header, &reset_secret))?;
        self.queue.remove(index).map(|pending| pending.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], 53))
    }

    fn long_packet(dcid: &[u8], scid: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xC0, 0, 0, 0, 1];
        bytes.push(dcid.len() as u8);
        bytes.extend_from_slice(dcid);
        bytes.push(scid.len() as u8);
        bytes.extend_from_slice(scid);
        bytes
    }

    fn short_packet(dcid: &[u8; 8], tail: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x41];
        bytes.extend_from_slice(dcid);
        bytes.extend_from_slice(tail);
        bytes
    }

    fn no_secret(_: &[u8]) -> Option<[u8; RESET_SECRET_LEN]> {
        None
    }

    #[test]
    fn test_parse_headers() {
        let long = long_packet(&[1, 2, 3], &[4, 5]);
        let header = parse_header(&long).unwrap();
        assert_eq!(header.form, HeaderForm::Long);
        assert_eq!(header.dcid, &[1, 2, 3]);
        assert_eq!(header.scid, &[4, 5]);

        let short = short_packet(&[9; 8], &[0xAA]);
        let header = parse_header(&short).unwrap();
        assert_eq!(header.form, HeaderForm::Short);
        assert_eq!(header.dcid, &[9; 8]);

        assert!(parse_header(&[0xC0, 0, 0]).is_none());
        assert!(parse_header(&[0x40, 1, 2]).is_none());
    }

    #[test]
    fn test_long_matches_on_scid() {
        let mut router = StatelessRouter::default();
        // Version negotiation addressed to the client's SCID
        router.push(
            StatelessPacket {
                bytes: long_packet(&[7; 8], &[8; 8]),
                peer: peer(),
            },
            0,
        );

        let unrelated = long_packet(&[8; 8], &[1; 8]);
        assert!(router.take_for(&unrelated, 1, no_secret).is_none());

        let query = long_packet(&[8; 8], &[7; 8]);
        let answer = router.take_for(&query, 1, no_secret).unwrap();
        assert_eq!(answer, long_packet(&[7; 8], &[8; 8]));
        assert!(router.is_empty());
    }

    #[test]
    fn test_short_matches_on_reset_secret() {
        let token = [0x5A; RESET_SECRET_LEN];
        let mut router = StatelessRouter::default();
        router.push(
            StatelessPacket {
                bytes: short_packet(&[0xEE; 8], &token),
                peer: peer(),
            },
            0,
        );

        let query = short_packet(&[3; 8], &[0x1f]);
        assert!(router.take_for(&query, 1, no_secret).is_none());
        let answer = router
            .take_for(&query, 1, |cid: &[u8]| (cid == [3; 8]).then_some(token))
            .unwrap();
        assert_eq!(&answer[answer.len() - RESET_SECRET_LEN..], &token);
    }

    #[test]
    fn test_short_matches_on_dcid() {
        let mut router = StatelessRouter::default();
        router.push(
            StatelessPacket {
                bytes: short_packet(&[3; 8], &[0; 20]),
                peer: peer(),
            },
            0,
        );
        let query = short_packet(&[3; 8], &[0x1f]);
        assert!(router.take_for(&query, 1, no_secret).is_some());
    }

    #[test]
    fn test_forms_never_cross() {
        let mut router = StatelessRouter::default();
        router.push(
            StatelessPacket {
                bytes: short_packet(&[3; 8], &[0; 20]),
                peer: peer(),
            },
            0,
        );
        let query = long_packet(&[3; 8], &[3; 8]);
        assert!(router.take_for(&query, 1, no_secret).is_none());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_empty_cids_never_match() {
        let mut router = StatelessRouter::default();
        router.push(
            StatelessPacket {
                bytes: long_packet(&[], &[1; 8]),
                peer: peer(),
            },
            0,
        );
        let query = long_packet(&[1; 8], &[]);
        assert!(router.take_for(&query, 1, no_secret).is_none());
    }

    #[test]
    fn test_expiry_and_eviction() {
        let mut router = StatelessRouter::new(2, 1000);
        for i in 0..3u8 {
            router.push(
                StatelessPacket {
                    bytes: long_packet(&[i; 8], &[0; 8]),
                    peer: peer(),
                },
                0,
            );
        }
        assert_eq!(router.len(), 2);
        // Oldest was evicted
        assert!(router
            .take_for(&long_packet(&[0; 8], &[0; 8]), 10, no_secret)
            .is_none());

        router.expire(1000);
        assert!(router.is_empty());
    }
}
