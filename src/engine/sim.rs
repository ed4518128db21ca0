//! In-process QUIC engine.
//!
//! `SimEngine` implements [`QuicEngine`] with a small QUIC-shaped wire:
//! long headers during the handshake, 8-byte connection ids, short headers
//! afterwards, and a handful of frames (ack, stream, reset, stop-sending, close,
//! poll). It has no loss recovery or crypto. It exists so sessions, the flow
//! governor and the stateless router can be driven end to end without the
//! C engine, and it records every steering call for assertions.
//!
//! ```text
//! long:  [0xC0|type] [version:4] [dcid_len] [dcid] [scid_len] [scid] frames...
//! short: [0x40] [dcid:8] frames...
//! ```

use super::{
    CloseReason, ConnHandle, EngineError, EngineEvent, Incoming, PathHandle, PathQuality,
    PreparedPacket, QuicEngine, Result, StatelessPacket, StreamId, FLOW_CONTROL_ERROR,
    LOCAL_CID_LEN, RESET_SECRET_LEN,
};
use crate::congestion::PathCongestion;
use bytes::{Buf, BufMut};
use ring::hmac;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

/// Wire version spoken by the simulated engine
pub const SIM_VERSION: u32 = 0x5151_0001;

/// One-byte poll frame: no payload, not ack-eliciting
pub const POLL_FRAME: u8 = 0x1f;

const FRAME_ACK: u8 = 0x02;
const FRAME_STREAM: u8 = 0x08;
const FRAME_RESET_STREAM: u8 = 0x04;
const FRAME_STOP_SENDING: u8 = 0x05;
const FRAME_CLOSE: u8 = 0x1c;
const FRAME_RESET_TOKEN: u8 = 0x07;

const LONG_INITIAL: u8 = 0xC0;
const LONG_HANDSHAKE: u8 = 0xD0;
const SHORT_HEADER: u8 = 0x40;

const STREAM_FRAME_OVERHEAD: usize = 1 + 8 + 1 + 2;
const DEFAULT_WAKE_DELAY_US: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug)]
enum Clock {
    Real(Instant),
    Manual(u64),
}

#[derive(Debug, Clone)]
enum OutFrame {
    Stream {
        stream: StreamId,
        data: Vec<u8>,
        fin: bool,
    },
    Reset {
        stream: StreamId,
        code: u64,
    },
    StopSending {
        stream: StreamId,
        code: u64,
    },
}

#[derive(Debug)]
struct SimPath {
    handle: PathHandle,
    peer: SocketAddr,
}

#[derive(Debug)]
struct SimConn {
    state: ConnState,
    local_cid: [u8; LOCAL_CID_LEN],
    remote_cid: Vec<u8>,
    handshake_pending: bool,
    ack_pending: bool,
    poll_requested: bool,
    close_pending: Option<u64>,
    paths: Vec<SimPath>,
    outbound: VecDeque<OutFrame>,
    received: HashMap<StreamId, u64>,
    consumed: HashMap<StreamId, u64>,
    /// Receive window fixed when the connection was created
    window: u64,
    peer_reset_token: Option<[u8; RESET_SECRET_LEN]>,
    flow_blocked: bool,
    quality: PathQuality,
}

impl SimConn {
    fn default_peer(&self) -> Option<SocketAddr> {
        self.paths.first().map(|p| p.peer)
    }

    /// Bytes received but not yet released by the application
    fn unconsumed(&self) -> u64 {
        let received: u64 = self.received.values().sum();
        let consumed: u64 = self.consumed.values().sum();
        received.saturating_sub(consumed)
    }
}

/// Steering calls observed by the engine
#[derive(Debug, Default, Clone)]
pub struct SimRecord {
    pub consumed: Vec<(ConnHandle, StreamId, u64)>,
    pub stop_sending: Vec<(ConnHandle, StreamId, u64)>,
    pub resets: Vec<(ConnHandle, StreamId, u64)>,
    pub configured: HashMap<(ConnHandle, PathHandle), PathCongestion>,
    pub polls_requested: usize,
    pub closed: Vec<(ConnHandle, u64)>,
    pub closed_immediately: Vec<ConnHandle>,
}

/// In-process engine, see module docs
#[derive(Debug)]
pub struct SimEngine {
    role: Role,
    clock: Clock,
    reset_key: hmac::Key,
    next_handle: u64,
    conns: BTreeMap<ConnHandle, SimConn>,
    by_cid: HashMap<[u8; LOCAL_CID_LEN], ConnHandle>,
    events: VecDeque<EngineEvent>,
    stateless: VecDeque<StatelessPacket>,
    wake_delay_us: u64,
    connection_window: u64,
    failing_probes: u32,
    record: SimRecord,
}

impl SimEngine {
    fn new(role: Role, reset_seed: &[u8]) -> Self {
        Self {
            role,
            clock: Clock::Real(Instant::now()),
            reset_key: hmac::Key::new(hmac::HMAC_SHA256, reset_seed),
            next_handle: 1,
            conns: BTreeMap::new(),
            by_cid: HashMap::new(),
            events: VecDeque::new(),
            stateless: VecDeque::new(),
            wake_delay_us: DEFAULT_WAKE_DELAY_US,
            connection_window: u64::MAX,
            failing_probes: 0,
            record: SimRecord::default(),
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client, &rand::random::<[u8; 16]>())
    }

    pub fn server(reset_seed: &[u8]) -> Self {
        Self::new(Role::Server, reset_seed)
    }

    /// Freeze time at `now` microseconds; advance with `advance`
    pub fn with_manual_clock(mut self, now: u64) -> Self {
        self.clock = Clock::Manual(now);
        self
    }

    pub fn advance(&mut self, micros: u64) {
        if let Clock::Manual(now) = &mut self.clock {
            *now += micros;
        }
    }

    pub fn record(&self) -> &SimRecord {
        &self.record
    }

    pub fn connection_window(&self) -> u64 {
        self.connection_window
    }

    pub fn connections(&self) -> Vec<ConnHandle> {
        self.conns.keys().copied().collect()
    }

    pub fn is_ready(&self, cnx: ConnHandle) -> bool {
        matches!(self.conns.get(&cnx), Some(conn) if conn.state == ConnState::Ready)
    }

    pub fn set_path_quality(&mut self, cnx: ConnHandle, quality: PathQuality) {
        if let Some(conn) = self.conns.get_mut(&cnx) {
            conn.quality = quality;
        }
    }

    pub fn set_flow_blocked(&mut self, cnx: ConnHandle, blocked: bool) {
        if let Some(conn) = self.conns.get_mut(&cnx) {
            conn.flow_blocked = blocked;
        }
    }

    pub fn set_wake_delay(&mut self, micros: u64) {
        self.wake_delay_us = micros;
    }

    /// Make the next `count` path probes fail
    pub fn fail_next_probes(&mut self, count: u32) {
        self.failing_probes = count;
    }

    /// Register a ready connection without a handshake
    pub fn open_connection(&mut self, peer: SocketAddr) -> ConnHandle {
        let cnx = self.insert_conn(peer, ConnState::Ready, vec![0xAA; LOCAL_CID_LEN]);
        self.events.push_back(EngineEvent::Ready { cnx });
        cnx
    }

    /// Deliver stream bytes as if they arrived from the peer
    pub fn inject_stream_data(&mut self, cnx: ConnHandle, stream: StreamId, data: &[u8], fin: bool) {
        if let Some(conn) = self.conns.get_mut(&cnx) {
            *conn.received.entry(stream).or_insert(0) += data.len() as u64;
        }
        self.events.push_back(EngineEvent::StreamData {
            cnx,
            stream,
            data: data.to_vec(),
            fin,
        });
    }

    pub fn inject_event(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }

    /// Connection id the engine issued for `cnx`
    pub fn local_cid(&self, cnx: ConnHandle) -> Option<[u8; LOCAL_CID_LEN]> {
        self.conns.get(&cnx).map(|conn| conn.local_cid)
    }

    fn insert_conn(&mut self, peer: SocketAddr, state: ConnState, remote_cid: Vec<u8>) -> ConnHandle {
        let cnx = ConnHandle(self.next_handle);
        let path = PathHandle(self.next_handle << 16);
        self.next_handle += 1;

        let role_tag: u8 = match self.role {
            Role::Client => 0xC1,
            Role::Server => 0x5E,
        };
        let mut local_cid = [0u8; LOCAL_CID_LEN];
        local_cid[0] = role_tag;
        local_cid[1..].copy_from_slice(&cnx.0.to_be_bytes()[1..]);

        self.conns.insert(
            cnx,
            SimConn {
                state,
                local_cid,
                remote_cid,
                handshake_pending: state == ConnState::Handshaking,
                ack_pending: false,
                poll_requested: false,
                close_pending: None,
                paths: vec![SimPath { handle: path, peer }],
                outbound: VecDeque::new(),
                received: HashMap::new(),
                consumed: HashMap::new(),
                window: self.connection_window,
                peer_reset_token: None,
                flow_blocked: false,
                quality: PathQuality::default(),
            },
        );
        self.by_cid.insert(local_cid, cnx);
        cnx
    }

    fn remove_conn(&mut self, cnx: ConnHandle) -> Option<SimConn> {
        let conn = self.conns.remove(&cnx)?;
        self.by_cid.remove(&conn.local_cid);
        Some(conn)
    }

    fn conn_mut(&mut self, cnx: ConnHandle) -> Result<&mut SimConn> {
        self.conns
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))
    }

    fn stateless_reset_for(&self, dcid: &[u8], peer: SocketAddr) -> StatelessPacket {
        let mut bytes = vec![SHORT_HEADER | 0x01];
        // Unpredictable-looking filler, never equal to the triggering DCID
        bytes.extend(dcid.iter().map(|b| !b));
        bytes.extend_from_slice(&[0xEE; 8]);
        bytes.extend_from_slice(&self.token(dcid));
        StatelessPacket { bytes, peer }
    }

    fn token(&self, cid: &[u8]) -> [u8; RESET_SECRET_LEN] {
        let tag = hmac::sign(&self.reset_key, cid);
        let mut token = [0u8; RESET_SECRET_LEN];
        token.copy_from_slice(&tag.as_ref()[..RESET_SECRET_LEN]);
        token
    }

    fn process_frames(&mut self, cnx: ConnHandle, mut frames: &[u8]) {
        while frames.has_remaining() {
            let kind = frames.get_u8();
            if matches!(kind, FRAME_STREAM | FRAME_RESET_STREAM | FRAME_STOP_SENDING) {
                if let Some(conn) = self.conns.get_mut(&cnx) {
                    conn.ack_pending = true;
                }
            }
            match kind {
                POLL_FRAME | FRAME_ACK => {}
                FRAME_STREAM if frames.remaining() >= STREAM_FRAME_OVERHEAD - 1 => {
                    let stream = frames.get_u64();
                    let fin = frames.get_u8() != 0;
                    let len = frames.get_u16() as usize;
                    if frames.remaining() < len {
                        return;
                    }
                    let data = frames[..len].to_vec();
                    frames.advance(len);
                    if let Some(conn) = self.conns.get_mut(&cnx) {
                        *conn.received.entry(stream).or_insert(0) += len as u64;
                        if conn.unconsumed() > conn.window {
                            conn.state = ConnState::Closed;
                            self.events.push_back(EngineEvent::Closed {
                                cnx,
                                reason: CloseReason {
                                    code: FLOW_CONTROL_ERROR,
                                    application: false,
                                    remote: false,
                                },
                            });
                            return;
                        }
                    }
                    self.events.push_back(EngineEvent::StreamData {
                        cnx,
                        stream,
                        data,
                        fin,
                    });
                }
                FRAME_RESET_STREAM | FRAME_STOP_SENDING if frames.remaining() >= 16 => {
                    let stream = frames.get_u64();
                    let code = frames.get_u64();
                    let event = if kind == FRAME_RESET_STREAM {
                        EngineEvent::StreamReset { cnx, stream, code }
                    } else {
                        EngineEvent::StopSending { cnx, stream, code }
                    };
                    self.events.push_back(event);
                }
                FRAME_RESET_TOKEN if frames.remaining() >= RESET_SECRET_LEN => {
                    let mut token = [0u8; RESET_SECRET_LEN];
                    frames.copy_to_slice(&mut token);
                    if let Some(conn) = self.conns.get_mut(&cnx) {
                        conn.peer_reset_token = Some(token);
                    }
                }
                FRAME_CLOSE if frames.remaining() >= 8 => {
                    let code = frames.get_u64();
                    if let Some(conn) = self.conns.get_mut(&cnx) {
                        conn.state = ConnState::Closed;
                    }
                    self.events.push_back(EngineEvent::Closed {
                        cnx,
                        reason: CloseReason {
                            code,
                            application: true,
                            remote: true,
                        },
                    });
                    return;
                }
                _ => return,
            }
        }
    }

    fn incoming_long(&mut self, packet: &[u8], peer: SocketAddr) -> Incoming {
        let mut buf = packet;
        let first = buf.get_u8();
        if buf.remaining() < 5 {
            return Incoming::default();
        }
        let version = buf.get_u32();
        let Some(dcid) = read_cid(&mut buf) else {
            return Incoming::default();
        };
        let Some(scid) = read_cid(&mut buf) else {
            return Incoming::default();
        };

        if version != SIM_VERSION {
            if self.role == Role::Server {
                // Version negotiation: swap the ids back to the sender
                let mut bytes = vec![LONG_INITIAL];
                bytes.put_u32(0);
                bytes.put_u8(scid.len() as u8);
                bytes.extend_from_slice(&scid);
                bytes.put_u8(dcid.len() as u8);
                bytes.extend_from_slice(&dcid);
                bytes.put_u32(SIM_VERSION);
                self.stateless.push_back(StatelessPacket { bytes, peer });
            }
            return Incoming::default();
        }

        let known = <[u8; LOCAL_CID_LEN]>::try_from(dcid.as_slice())
            .ok()
            .and_then(|cid| self.by_cid.get(&cid).copied());

        let cnx = match (known, self.role) {
            (Some(cnx), Role::Client) => {
                let conn = match self.conns.get_mut(&cnx) {
                    Some(conn) => conn,
                    None => return Incoming::default(),
                };
                conn.remote_cid = scid;
                if conn.state == ConnState::Handshaking {
                    conn.state = ConnState::Ready;
                    self.events.push_back(EngineEvent::Ready { cnx });
                }
                cnx
            }
            (Some(cnx), Role::Server) => cnx,
            (None, Role::Server) if first == LONG_INITIAL => {
                let cnx = self.insert_conn(peer, ConnState::Handshaking, scid);
                if let Some(conn) = self.conns.get_mut(&cnx) {
                    // Ready once the handshake reply is queued
                    conn.state = ConnState::Ready;
                }
                self.events.push_back(EngineEvent::Ready { cnx });
                cnx
            }
            _ => return Incoming::default(),
        };

        self.process_frames(cnx, buf);
        Incoming {
            cnx: Some(cnx),
            path: self.path_for_peer(cnx, peer),
        }
    }

    fn incoming_short(&mut self, packet: &[u8], peer: SocketAddr) -> Incoming {
        if packet.len() < 1 + LOCAL_CID_LEN {
            return Incoming::default();
        }
        let mut dcid = [0u8; LOCAL_CID_LEN];
        dcid.copy_from_slice(&packet[1..1 + LOCAL_CID_LEN]);

        let Some(cnx) = self.by_cid.get(&dcid).copied() else {
            match self.role {
                Role::Server => {
                    let reset = self.stateless_reset_for(&dcid, peer);
                    self.stateless.push_back(reset);
                }
                Role::Client => return self.detect_stateless_reset(packet, peer),
            }
            return Incoming::default();
        };

        self.process_frames(cnx, &packet[1 + LOCAL_CID_LEN..]);
        Incoming {
            cnx: Some(cnx),
            path: self.path_for_peer(cnx, peer),
        }
    }

    /// A short packet nobody owns may be a reset for one of our connections
    fn detect_stateless_reset(&mut self, packet: &[u8], peer: SocketAddr) -> Incoming {
        if packet.len() < 1 + LOCAL_CID_LEN + RESET_SECRET_LEN {
            return Incoming::default();
        }
        let tail = &packet[packet.len() - RESET_SECRET_LEN..];
        let Some(cnx) = self
            .conns
            .iter()
            .find(|(_, conn)| {
                conn.state != ConnState::Closed
                    && conn.peer_reset_token.map_or(false, |token| token[..] == *tail)
            })
            .map(|(cnx, _)| *cnx)
        else {
            return Incoming::default();
        };

        if let Some(conn) = self.conns.get_mut(&cnx) {
            conn.state = ConnState::Closed;
        }
        self.events.push_back(EngineEvent::Closed {
            cnx,
            reason: CloseReason {
                code: 0,
                application: false,
                remote: true,
            },
        });
        Incoming {
            cnx: Some(cnx),
            path: self.path_for_peer(cnx, peer),
        }
    }

    fn path_for_peer(&self, cnx: ConnHandle, peer: SocketAddr) -> Option<PathHandle> {
        let conn = self.conns.get(&cnx)?;
        conn.paths
            .iter()
            .find(|p| p.peer == peer)
            .or_else(|| conn.paths.first())
            .map(|p| p.handle)
    }
}

fn put_control(out: &mut Vec<u8>, kind: u8, stream: StreamId, code: u64) {
    out.put_u8(kind);
    out.put_u64(stream);
    out.put_u64(code);
}

fn read_cid(buf: &mut &[u8]) -> Option<Vec<u8>> {
    if !buf.has_remaining() {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return None;
    }
    let cid = buf[..len].to_vec();
    buf.advance(len);
    Some(cid)
}

impl QuicEngine for SimEngine {
    fn now(&self) -> u64 {
        match self.clock {
            Clock::Real(start) => start.elapsed().as_micros() as u64 + 1,
            Clock::Manual(now) => now,
        }
    }

    fn set_connection_window(&mut self, bytes: u64) {
        self.connection_window = bytes;
    }

    fn connect(&mut self, peer: SocketAddr, _now: u64) -> Result<ConnHandle> {
        if self.role != Role::Client {
            return Err(EngineError::InvalidArgument(
                "server engine cannot connect".into(),
            ));
        }
        let initial_dcid = rand::random::<[u8; LOCAL_CID_LEN]>().to_vec();
        Ok(self.insert_conn(peer, ConnState::Handshaking, initial_dcid))
    }

    fn incoming_packet(
        &mut self,
        packet: &[u8],
        peer: SocketAddr,
        _local: SocketAddr,
        _now: u64,
    ) -> Result<Incoming> {
        let Some(first) = packet.first() else {
            return Ok(Incoming::default());
        };
        if first & 0x80 != 0 {
            Ok(self.incoming_long(packet, peer))
        } else {
            Ok(self.incoming_short(packet, peer))
        }
    }

    fn prepare_packet(
        &mut self,
        cnx: ConnHandle,
        path: Option<PathHandle>,
        _now: u64,
        buf: &mut [u8],
    ) -> Result<Option<PreparedPacket>> {
        let role = self.role;
        let reset_token = self.conns.get(&cnx).map(|conn| self.token(&conn.local_cid));
        let conn = self
            .conns
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))?;
        if conn.state == ConnState::Closed {
            return Ok(None);
        }

        let peer = path
            .and_then(|handle| conn.paths.iter().find(|p| p.handle == handle))
            .map(|p| p.peer)
            .or_else(|| conn.default_peer())
            .ok_or(EngineError::UnknownConnection(cnx))?;

        let mut out: Vec<u8> = Vec::with_capacity(buf.len());
        let handshake = conn.handshake_pending;
        if handshake {
            let first = if role == Role::Client {
                LONG_INITIAL
            } else {
                LONG_HANDSHAKE
            };
            out.put_u8(first);
            out.put_u32(SIM_VERSION);
            out.put_u8(conn.remote_cid.len() as u8);
            out.extend_from_slice(&conn.remote_cid);
            out.put_u8(LOCAL_CID_LEN as u8);
            out.extend_from_slice(&conn.local_cid);
            conn.handshake_pending = false;
            if role == Role::Server {
                if let Some(token) = reset_token {
                    out.put_u8(FRAME_RESET_TOKEN);
                    out.extend_from_slice(&token);
                }
            }
        } else if conn.state == ConnState::Ready {
            out.put_u8(SHORT_HEADER);
            out.extend_from_slice(&conn.remote_cid);
        } else {
            return Ok(None);
        }
        let header_len = out.len();

        if let Some(code) = conn.close_pending.take() {
            out.put_u8(FRAME_CLOSE);
            out.put_u64(code);
            conn.state = ConnState::Closed;
            self.events.push_back(EngineEvent::Closed {
                cnx,
                reason: CloseReason::local(code),
            });
        } else if conn.state == ConnState::Ready {
            if conn.ack_pending {
                out.put_u8(FRAME_ACK);
                conn.ack_pending = false;
            }
            while let Some(frame) = conn.outbound.pop_front() {
                let room = buf.len().saturating_sub(out.len());
                match frame {
                    OutFrame::Stream { stream, data, fin } => {
                        if room <= STREAM_FRAME_OVERHEAD {
                            conn.outbound.push_front(OutFrame::Stream { stream, data, fin });
                            break;
                        }
                        let take = data.len().min(room - STREAM_FRAME_OVERHEAD).min(u16::MAX as usize);
                        let last = take == data.len();
                        out.put_u8(FRAME_STREAM);
                        out.put_u64(stream);
                        out.put_u8((fin && last) as u8);
                        out.put_u16(take as u16);
                        out.extend_from_slice(&data[..take]);
                        if !last {
                            conn.outbound.push_front(OutFrame::Stream {
                                stream,
                                data: data[take..].to_vec(),
                                fin,
                            });
                            break;
                        }
                    }
                    OutFrame::Reset { stream, code } => {
                        if room < 17 {
                            conn.outbound.push_front(OutFrame::Reset { stream, code });
                            break;
                        }
                        put_control(&mut out, FRAME_RESET_STREAM, stream, code);
                    }
                    OutFrame::StopSending { stream, code } => {
                        if room < 17 {
                            conn.outbound
                                .push_front(OutFrame::StopSending { stream, code });
                            break;
                        }
                        put_control(&mut out, FRAME_STOP_SENDING, stream, code);
                    }
                }
            }
        }

        if out.len() == header_len && conn.poll_requested {
            out.put_u8(POLL_FRAME);
        }
        conn.poll_requested = false;

        if out.len() == header_len && !handshake {
            return Ok(None);
        }
        if out.len() > buf.len() {
            return Err(EngineError::InvalidArgument(format!(
                "send buffer of {} bytes too small for {} byte packet",
                buf.len(),
                out.len()
            )));
        }

        buf[..out.len()].copy_from_slice(&out);
        Ok(Some(PreparedPacket {
            len: out.len(),
            peer,
            path: path.or_else(|| conn.paths.first().map(|p| p.handle)),
        }))
    }

    fn next_wake_delay(&self, _now: u64, max: u64) -> u64 {
        let busy = self.conns.values().any(|conn| {
            conn.state != ConnState::Closed
                && (conn.handshake_pending
                    || conn.close_pending.is_some()
                    || (conn.state == ConnState::Ready && !conn.outbound.is_empty()))
        });
        if busy {
            0
        } else {
            self.wake_delay_us.min(max)
        }
    }

    fn request_poll(&mut self, cnx: ConnHandle) {
        self.record.polls_requested += 1;
        if let Some(conn) = self.conns.get_mut(&cnx) {
            conn.poll_requested = true;
        }
    }

    fn has_ready_stream(&self, cnx: ConnHandle) -> bool {
        matches!(self.conns.get(&cnx), Some(conn) if conn.outbound.iter().any(|f| matches!(f, OutFrame::Stream { .. })))
    }

    fn is_flow_blocked(&self, cnx: ConnHandle) -> bool {
        matches!(self.conns.get(&cnx), Some(conn) if conn.flow_blocked)
    }

    fn path_quality(&self, cnx: ConnHandle, _path: Option<PathHandle>) -> PathQuality {
        self.conns
            .get(&cnx)
            .map(|conn| conn.quality)
            .unwrap_or_default()
    }

    fn find_path(&self, cnx: ConnHandle, peer: SocketAddr) -> Option<PathHandle> {
        self.conns
            .get(&cnx)?
            .paths
            .iter()
            .find(|p| p.peer == peer)
            .map(|p| p.handle)
    }

    fn probe_path(
        &mut self,
        cnx: ConnHandle,
        peer: SocketAddr,
        _local: SocketAddr,
        _now: u64,
    ) -> Result<PathHandle> {
        if self.failing_probes > 0 {
            self.failing_probes -= 1;
            return Err(EngineError::Rejected {
                op: "probe_new_path",
                code: -1,
            });
        }
        let conn = self.conn_mut(cnx)?;
        let handle = PathHandle((cnx.0 << 16) | conn.paths.len() as u64);
        conn.paths.push(SimPath { handle, peer });
        self.events.push_back(EngineEvent::PathAvailable {
            cnx,
            path: handle,
            peer,
        });
        Ok(handle)
    }

    fn configure_path(&mut self, cnx: ConnHandle, path: PathHandle, congestion: &PathCongestion) {
        self.record.configured.insert((cnx, path), *congestion);
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn stream_consumed(&mut self, cnx: ConnHandle, stream: StreamId, offset: u64) -> Result<()> {
        let conn = self.conn_mut(cnx)?;
        let received = conn.received.get(&stream).copied().unwrap_or(0);
        if offset > received {
            return Err(EngineError::Rejected {
                op: "stream_data_consumed",
                code: -1,
            });
        }
        let released = conn.consumed.entry(stream).or_insert(0);
        *released = (*released).max(offset);
        self.record.consumed.push((cnx, stream, offset));
        Ok(())
    }

    fn write_stream(
        &mut self,
        cnx: ConnHandle,
        stream: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<()> {
        let conn = self.conn_mut(cnx)?;
        conn.outbound.push_back(OutFrame::Stream {
            stream,
            data: data.to_vec(),
            fin,
        });
        Ok(())
    }

    fn stop_sending(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()> {
        self.conn_mut(cnx)?
            .outbound
            .push_back(OutFrame::StopSending { stream, code });
        self.record.stop_sending.push((cnx, stream, code));
        Ok(())
    }

    fn reset_stream(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()> {
        self.conn_mut(cnx)?
            .outbound
            .push_back(OutFrame::Reset { stream, code });
        self.record.resets.push((cnx, stream, code));
        Ok(())
    }

    fn close(&mut self, cnx: ConnHandle, code: u64) -> Result<()> {
        self.conn_mut(cnx)?.close_pending = Some(code);
        self.record.closed.push((cnx, code));
        Ok(())
    }

    fn close_immediate(&mut self, cnx: ConnHandle) {
        if self.remove_conn(cnx).is_some() {
            self.record.closed_immediately.push(cnx);
        }
    }

    fn take_stateless_packet(&mut self) -> Option<StatelessPacket> {
        self.stateless.pop_front()
    }

    fn reset_secret(&self, cid: &[u8]) -> Option<[u8; RESET_SECRET_LEN]> {
        if cid.is_empty() {
            return None;
        }
        Some(self.token(cid))
    }
}
