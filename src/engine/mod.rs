// QUIC engine adapter
//
// The tunnel never speaks QUIC itself. It steers an external engine through
// the narrow `QuicEngine` trait: feed it packets, ask it for packets, and
// collect what it reports through `poll_event`.
//
// - picoquic: FFI backend over the C engine (feature "picoquic")
// - sim: in-process engine with a QUIC-shaped wire, used by tests and demos
//
// Handles are opaque and copyable; they never expose engine pointers.

#[cfg(feature = "picoquic")]
pub mod picoquic;
pub mod sim;

pub use sim::SimEngine;

use crate::congestion::PathCongestion;
use std::net::SocketAddr;
use thiserror::Error;

/// QUIC stream identifier
pub type StreamId = u64;

/// Connection handle issued by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u64);

/// Unique path identifier within a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHandle(pub u64);

impl std::fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cnx#{}", self.0)
    }
}

/// Length of connection ids the tunnel issues
pub const LOCAL_CID_LEN: usize = 8;

/// Size of a stateless reset token
pub const RESET_SECRET_LEN: usize = 16;

/// Transport error raised when the peer overruns the receive window
pub const FLOW_CONTROL_ERROR: u64 = 0x03;

/// Application error for stream aborts and queue overflow
pub const APP_INTERNAL_ERROR: u64 = 0x101;

/// Application error when the local consumer went away
pub const APP_CANCEL_ERROR: u64 = 0x105;

/// Path metrics reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathQuality {
    /// Bytes per second, 0 when the controller does not pace
    pub pacing_rate: u64,
    /// Congestion window in bytes
    pub cwin: u64,
    /// Smoothed RTT in microseconds, 0 when unknown
    pub rtt: u64,
    pub bytes_in_transit: u64,
    pub sent: u64,
    pub lost: u64,
}

/// Result of `prepare_packet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedPacket {
    pub len: usize,
    pub peer: SocketAddr,
    pub path: Option<PathHandle>,
}

/// Where an incoming packet landed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Incoming {
    pub cnx: Option<ConnHandle>,
    pub path: Option<PathHandle>,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u64,
    pub application: bool,
    pub remote: bool,
}

impl CloseReason {
    pub fn local(code: u64) -> Self {
        Self {
            code,
            application: true,
            remote: false,
        }
    }
}

/// Callbacks from the engine, queued until the session drains them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Handshake complete (client) or connection accepted (server)
    Ready { cnx: ConnHandle },
    StreamData {
        cnx: ConnHandle,
        stream: StreamId,
        data: Vec<u8>,
        fin: bool,
    },
    StreamReset {
        cnx: ConnHandle,
        stream: StreamId,
        code: u64,
    },
    StopSending {
        cnx: ConnHandle,
        stream: StreamId,
        code: u64,
    },
    PathAvailable {
        cnx: ConnHandle,
        path: PathHandle,
        peer: SocketAddr,
    },
    PathDeleted { cnx: ConnHandle, path: PathHandle },
    Closed { cnx: ConnHandle, reason: CloseReason },
}

impl EngineEvent {
    pub fn cnx(&self) -> ConnHandle {
        match self {
            EngineEvent::Ready { cnx }
            | EngineEvent::StreamData { cnx, .. }
            | EngineEvent::StreamReset { cnx, .. }
            | EngineEvent::StopSending { cnx, .. }
            | EngineEvent::PathAvailable { cnx, .. }
            | EngineEvent::PathDeleted { cnx, .. }
            | EngineEvent::Closed { cnx, .. } => *cnx,
        }
    }
}

/// Packet the engine wants sent outside any connection
/// (version negotiation, retry, stateless reset)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessPacket {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine setup failed: {0}")]
    Setup(String),

    #[error("{op} failed with code {code}")]
    Rejected { op: &'static str, code: i32 },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnHandle),

    #[error("Unknown stream {stream} on {cnx}")]
    UnknownStream { cnx: ConnHandle, stream: StreamId },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The operations the tunnel needs from a QUIC implementation
///
/// Times are monotonic microseconds from `now()`. Engines are single
/// threaded: one session task owns the engine and calls it without locks.
pub trait QuicEngine: Send {
    fn now(&self) -> u64;

    /// Cap the connection-level receive window for connections created from now on
    fn set_connection_window(&mut self, bytes: u64);

    /// Start a client connection towards `peer`
    fn connect(&mut self, peer: SocketAddr, now: u64) -> Result<ConnHandle>;

    /// Feed one decoded QUIC datagram; stream callbacks surface via `poll_event`
    fn incoming_packet(
        &mut self,
        packet: &[u8],
        peer: SocketAddr,
        local: SocketAddr,
        now: u64,
    ) -> Result<Incoming>;

    /// Fill `buf` with the next packet for `cnx`, preferring `path`
    fn prepare_packet(
        &mut self,
        cnx: ConnHandle,
        path: Option<PathHandle>,
        now: u64,
        buf: &mut [u8],
    ) -> Result<Option<PreparedPacket>>;

    /// Microseconds until the engine next needs servicing, capped at `max`
    fn next_wake_delay(&self, now: u64, max: u64) -> u64;

    /// Make the next prepared packet carry a poll frame
    fn request_poll(&mut self, cnx: ConnHandle);

    /// Some stream has data queued to send
    fn has_ready_stream(&self, cnx: ConnHandle) -> bool;

    /// Sending is held back by connection or stream flow control
    fn is_flow_blocked(&self, cnx: ConnHandle) -> bool;

    /// Metrics for `path`, or the default path when `None` or unknown
    fn path_quality(&self, cnx: ConnHandle, path: Option<PathHandle>) -> PathQuality;

    fn find_path(&self, cnx: ConnHandle, peer: SocketAddr) -> Option<PathHandle>;

    /// Open an additional path towards `peer`
    fn probe_path(
        &mut self,
        cnx: ConnHandle,
        peer: SocketAddr,
        local: SocketAddr,
        now: u64,
    ) -> Result<PathHandle>;

    /// Apply mode, congestion algorithm and ack-delay policy to a path
    fn configure_path(&mut self, cnx: ConnHandle, path: PathHandle, congestion: &PathCongestion);

    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// Let the peer send past `offset` on `stream`
    fn stream_consumed(&mut self, cnx: ConnHandle, stream: StreamId, offset: u64) -> Result<()>;

    fn write_stream(
        &mut self,
        cnx: ConnHandle,
        stream: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<()>;

    fn stop_sending(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()>;

    fn reset_stream(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()>;

    /// Graceful close; the engine keeps the connection until draining ends
    fn close(&mut self, cnx: ConnHandle, code: u64) -> Result<()>;

    /// Drop all state for `cnx` without notifying the peer
    fn close_immediate(&mut self, cnx: ConnHandle);

    fn take_stateless_packet(&mut self) -> Option<StatelessPacket>;

    /// Stateless reset token for a connection id issued by this engine
    fn reset_secret(&self, cid: &[u8]) -> Option<[u8; RESET_SECRET_LEN]>;
}
