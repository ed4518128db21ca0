//! dnsquic: QUIC tunneled through DNS
//!
//! Client QUIC packets travel base32-encoded in the names of TXT queries
//! under a tunnel domain; server packets come back in the TXT answers.
//! Resolvers only ever see ordinary DNS traffic, and the QUIC engine only
//! ever sees datagrams.
//!
//! ## Layers
//!
//! - [`dns`]: query and response codec, domain matching, UDP plumbing
//! - [`engine`]: the `QuicEngine` seam, a simulated engine, and the
//!   picoquic binding behind the `picoquic` feature
//! - [`governor`]: per-stream receive queues with the single/multi stream
//!   switch
//! - [`poll`] and [`congestion`]: when to send empty polls and what each
//!   resolver path runs
//! - [`stateless`]: routing connection-less packets onto later answers
//! - [`session`]: client and server sessions plus their tokio drivers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnsquic::config::ResolverSpec;
//! use dnsquic::engine::SimEngine;
//! use dnsquic::session::{spawn_client, spawn_server, ClientOptions, ServerOptions};
//! use dnsquic::{PathMode, TunnelConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = TunnelConfig::default();
//! config.domains = vec!["t.example.com".to_string()];
//! config.server.listen = "127.0.0.1:5300".parse()?;
//! config.client.resolvers = vec![ResolverSpec {
//!     address: "127.0.0.1:5300".to_string(),
//!     mode: PathMode::Authoritative,
//! }];
//!
//! let _server = spawn_server(
//!     SimEngine::server(&[7u8; 16]),
//!     ServerOptions::from_config(&config)?,
//!     config.server.listen,
//!     true,
//! )
//! .await?;
//! let client = spawn_client(
//!     SimEngine::client(),
//!     ClientOptions::from_config(&config)?,
//!     config.client.bind,
//! )
//! .await?;
//!
//! let stream = client.handle.open_stream().await?;
//! client.handle.write(stream, b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod congestion;
pub mod dns;
pub mod engine;
pub mod governor;
pub mod pinning;
pub mod poll;
pub mod session;
pub mod stateless;

pub use config::{ConfigError, Resolver, TunnelConfig, TunnelMode};
pub use congestion::{CongestionAlgorithm, PathMode};
pub use dns::{DnsError, DomainMatcher, Rcode};
pub use engine::{CloseReason, ConnHandle, EngineError, QuicEngine, SimEngine, StreamId};
pub use governor::{FlowLimits, StreamMode};
pub use pinning::{CertPin, CertVerification};
pub use session::{
    spawn_client, spawn_server, ClientHandle, ClientOptions, ClientTunnel, ConnectionEvent,
    ServerHandle, ServerOptions, ServerTunnel, SessionStats, StreamRead,
};

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Tunnel error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// DNS encoding or decoding failed
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// The QUIC engine refused an operation
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown stream {0}")]
    UnknownStream(StreamId),

    /// The local side already finished the stream
    #[error("Stream {0} is closed for writing")]
    StreamClosed(StreamId),

    /// The session task has exited
    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid command: {0}")]
    InvalidCommand(&'static str),

    /// Setup failures with context (certificates, seeds, files)
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: TunnelError = EngineError::UnknownConnection(ConnHandle(7)).into();
        assert!(matches!(err, TunnelError::Engine(_)));
        assert_eq!(err.to_string(), "Engine error: Unknown connection cnx#7");

        let err: TunnelError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, TunnelError::Io(_)));

        assert_eq!(
            TunnelError::StreamClosed(4).to_string(),
            "Stream 4 is closed for writing"
        );
    }

    #[test]
    fn test_build_date_is_stamped() {
        assert!(!BUILD_DATE.is_empty());
    }
}
