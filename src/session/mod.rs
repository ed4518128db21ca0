// Tunnel sessions
//
// A session owns one QUIC engine and turns its packets into DNS traffic.
//
// - connection: per-connection streams and the flow governor
// - client: query scheduling over one or more resolvers
// - server: answers queries with whatever the engine has queued
// - driver: tokio tasks that own a session and expose channel handles

pub mod client;
pub mod connection;
pub mod driver;
pub mod server;

pub use client::{ClientOptions, ClientSession, OutboundQuery};
pub use connection::{Connection, Stream, StreamRead, StreamState};
pub use driver::{spawn_client, spawn_server, ClientHandle, ClientTunnel, ServerHandle, ServerTunnel};
pub use server::{ServerOptions, ServerSession};

use crate::engine::{CloseReason, ConnHandle, StreamId};
use serde::Serialize;

/// What a session reports to the layer above
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake done (client) or connection accepted (server)
    Ready { cnx: ConnHandle },
    /// Stream data is waiting but flow control holds it back
    Blocked { cnx: ConnHandle },
    /// The peer opened a stream
    StreamOpened { cnx: ConnHandle, stream: StreamId },
    /// Unread data or a FIN arrived on a stream
    Readable { cnx: ConnHandle, stream: StreamId },
    Closed { cnx: ConnHandle, reason: CloseReason },
}

/// Counters logged periodically as JSON
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub queries_sent: u64,
    pub polls_sent: u64,
    /// Queries the socket refused with a transient error
    pub send_failures: u64,
    pub responses: u64,
    pub data_responses: u64,
    pub queries_received: u64,
    pub answers_with_data: u64,
    pub empty_answers: u64,
    pub error_replies: u64,
    pub dropped: u64,
    pub stateless_answers: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl SessionStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
