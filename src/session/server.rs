//! Server session.
//!
//! Every valid query is answered exactly once. The payload is fed to the
//! engine, and the answer carries whatever the engine has queued for that
//! connection (or a pending stateless packet when no connection owns the
//! query). A query with nothing to carry gets NOERROR with no answers, so
//! resolvers never cache a negative result for poll names.

use super::connection::{Connection, StreamRead};
use super::{ConnectionEvent, SessionStats};
use crate::config::{ConfigError, TunnelConfig};
use crate::congestion::{CongestionSelector, PathMode};
use crate::dns::{decode_query, encode_response, DecodeQueryError, DomainMatcher, Rcode};
use crate::engine::{
    CloseReason, ConnHandle, EngineError, EngineEvent, Incoming, PathHandle, QuicEngine, StreamId,
};
use crate::governor::FlowLimits;
use crate::stateless::StatelessRouter;
use crate::{Result, TunnelError};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub domains: Vec<String>,
    /// Largest QUIC packet placed in one answer
    pub mtu: u32,
    /// Zero disables idle collection
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub limits: FlowLimits,
}

impl ServerOptions {
    pub fn from_config(config: &TunnelConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            domains: config.normalized_domains()?,
            mtu: config.server.mtu,
            idle_timeout: config.server.idle_timeout,
            max_connections: config.server.max_connections,
            limits: config.flow.limits(),
        })
    }
}

pub struct ServerSession<E: QuicEngine> {
    engine: E,
    matcher: DomainMatcher,
    options: ServerOptions,
    local: SocketAddr,
    selector: CongestionSelector,
    connections: BTreeMap<ConnHandle, Connection>,
    configured: HashSet<(ConnHandle, PathHandle)>,
    router: StatelessRouter,
    events: VecDeque<ConnectionEvent>,
    stats: SessionStats,
    draining: bool,
}

impl<E: QuicEngine> ServerSession<E> {
    pub fn new(mut engine: E, options: ServerOptions, local: SocketAddr) -> Result<Self> {
        if options.domains.is_empty() {
            return Err(ConfigError::NoDomains.into());
        }
        engine.set_connection_window(options.limits.connection_window);
        let matcher = DomainMatcher::new(options.domains.iter().cloned());
        for (inner, outer) in matcher.overlapping() {
            log::warn!("Domain {} overlaps {}", inner, outer);
        }
        log::info!(
            "Serving {} on {} (mtu {}, max {} connections)",
            options.domains.join(", "),
            local,
            options.mtu,
            options.max_connections
        );

        Ok(Self {
            engine,
            matcher,
            options,
            local,
            selector: CongestionSelector::server(),
            connections: BTreeMap::new(),
            configured: HashSet::new(),
            router: StatelessRouter::default(),
            events: VecDeque::new(),
            stats: SessionStats::default(),
            draining: false,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn connections(&self) -> Vec<ConnHandle> {
        self.connections.keys().copied().collect()
    }

    pub fn connection(&self, cnx: ConnHandle) -> Option<&Connection> {
        self.connections.get(&cnx)
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Answer one DNS query; `None` means no reply at all
    pub fn handle_query(&mut self, packet: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        self.stats.queries_received += 1;
        let query = match decode_query(packet, &self.matcher) {
            Ok(query) => query,
            Err(DecodeQueryError::Drop) => {
                self.stats.dropped += 1;
                log::trace!("Dropping undecodable query from {}", peer);
                return None;
            }
            Err(reply) => {
                self.stats.error_replies += 1;
                return reply.to_response();
            }
        };

        let now = self.engine.now();
        let payload = self.exchange(&query.payload, peer, now);
        self.drain_engine_events(now);

        let params = match payload.as_deref() {
            Some(payload) if !payload.is_empty() => {
                self.stats.answers_with_data += 1;
                query.response(Some(payload), None)
            }
            _ => {
                self.stats.empty_answers += 1;
                query.response(None, Some(Rcode::Ok))
            }
        };
        match encode_response(&params) {
            Ok(response) => Some(response),
            Err(e) => {
                log::warn!("Failed to encode answer for {}: {}", peer, e);
                None
            }
        }
    }

    /// Feed `packet` to the engine and fetch the packet to answer with
    fn exchange(&mut self, packet: &[u8], peer: SocketAddr, now: u64) -> Option<Vec<u8>> {
        let incoming = match self.engine.incoming_packet(packet, peer, self.local, now) {
            Ok(incoming) => incoming,
            Err(e) => {
                log::debug!("Engine rejected packet from {}: {}", peer, e);
                Incoming::default()
            }
        };
        self.drain_engine_events(now);
        self.router.collect(&mut self.engine, now);

        let Some(cnx) = incoming.cnx.filter(|cnx| self.connections.contains_key(cnx)) else {
            let engine = &self.engine;
            let answer = self
                .router
                .take_for(packet, now, |cid| engine.reset_secret(cid));
            if answer.is_some() {
                self.stats.stateless_answers += 1;
            }
            return answer;
        };

        if let Some(conn) = self.connections.get_mut(&cnx) {
            conn.touch(now);
        }
        if let Some(path) = incoming.path {
            if self.configured.insert((cnx, path)) {
                let congestion = self.selector.select(PathMode::Unknown);
                self.engine.configure_path(cnx, path, &congestion);
            }
        }

        let mut buf = vec![0u8; self.options.mtu as usize];
        match self.engine.prepare_packet(cnx, incoming.path, now, &mut buf) {
            Ok(Some(prepared)) => {
                buf.truncate(prepared.len);
                Some(buf)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("{}: prepare failed: {}", cnx, e);
                None
            }
        }
    }

    fn drain_engine_events(&mut self, now: u64) {
        while let Some(event) = self.engine.poll_event() {
            let cnx = event.cnx();
            if matches!(event, EngineEvent::Ready { .. }) && !self.connections.contains_key(&cnx) {
                if self.draining {
                    log::debug!("Refusing {}: shutting down", cnx);
                    self.engine.close_immediate(cnx);
                    continue;
                }
                if self.connections.len() >= self.options.max_connections {
                    log::warn!(
                        "Refusing {}: {} connections already open",
                        cnx,
                        self.connections.len()
                    );
                    self.engine.close_immediate(cnx);
                    continue;
                }
                log::info!("Accepted {}", cnx);
                self.connections
                    .insert(cnx, Connection::new(cnx, self.options.limits, now));
                self.stats.connections_opened += 1;
            }

            let Some(conn) = self.connections.get_mut(&cnx) else {
                log::debug!("Event for unknown {}", cnx);
                continue;
            };
            conn.on_engine_event(&mut self.engine, event, now, &mut self.events);
            if conn.closed().is_some() {
                self.forget(cnx);
            }
        }
    }

    fn forget(&mut self, cnx: ConnHandle) {
        if self.connections.remove(&cnx).is_some() {
            self.configured.retain(|(owner, _)| *owner != cnx);
            self.stats.connections_closed += 1;
        }
    }

    /// Drop connections idle for longer than the idle timeout
    pub fn collect_idle(&mut self) -> usize {
        let now = self.engine.now();
        self.router.expire(now);
        if self.options.idle_timeout.is_zero() {
            return 0;
        }
        let timeout = self.options.idle_timeout.as_micros() as u64;
        let idle: Vec<ConnHandle> = self
            .connections
            .values()
            .filter(|conn| now.saturating_sub(conn.last_activity()) >= timeout)
            .map(|conn| conn.cnx)
            .collect();

        for cnx in &idle {
            log::info!("Closing idle {}", cnx);
            self.engine.close_immediate(*cnx);
            self.forget(*cnx);
            self.events.push_back(ConnectionEvent::Closed {
                cnx: *cnx,
                reason: CloseReason::local(0),
            });
        }
        idle.len()
    }

    /// Close every connection gracefully and refuse new ones
    ///
    /// Each CLOSE frame rides on the answer to that peer's next query.
    /// Connections drop out as the engine reports them closed; see
    /// [`is_drained`](Self::is_drained).
    pub fn begin_shutdown(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        log::info!("Draining {} connection(s)", self.connections.len());
        for cnx in self.connections() {
            if let Err(e) = self.engine.close(cnx, 0) {
                log::debug!("{}: close failed ({}), dropping", cnx, e);
                self.engine.close_immediate(cnx);
                self.forget(cnx);
                self.events.push_back(ConnectionEvent::Closed {
                    cnx,
                    reason: CloseReason::local(0),
                });
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Shutdown started and every connection is gone
    pub fn is_drained(&self) -> bool {
        self.draining && self.connections.is_empty()
    }

    /// Drop every connection without notifying peers
    pub fn shutdown(&mut self) {
        for cnx in self.connections() {
            self.engine.close_immediate(cnx);
            self.forget(cnx);
            self.events.push_back(ConnectionEvent::Closed {
                cnx,
                reason: CloseReason::local(0),
            });
        }
        log::info!("Server session shut down");
    }

    fn conn_mut(&mut self, cnx: ConnHandle) -> Result<&mut Connection> {
        self.connections
            .get_mut(&cnx)
            .ok_or(TunnelError::Engine(EngineError::UnknownConnection(cnx)))
    }

    pub fn open_or_get_stream(&mut self, cnx: ConnHandle, stream: StreamId) -> Result<bool> {
        let conn = self
            .connections
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))?;
        Ok(conn.open_or_get_stream(&mut self.engine, stream))
    }

    pub fn read(&mut self, cnx: ConnHandle, stream: StreamId) -> Result<StreamRead> {
        let conn = self
            .connections
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))?;
        let read = conn.read(&mut self.engine, stream)?;
        conn.collect_streams();
        Ok(read)
    }

    pub fn write(&mut self, cnx: ConnHandle, stream: StreamId, data: &[u8]) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))?;
        conn.write(&mut self.engine, stream, data)
    }

    pub fn finish(&mut self, cnx: ConnHandle, stream: StreamId) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&cnx)
            .ok_or(EngineError::UnknownConnection(cnx))?;
        conn.close_stream(&mut self.engine, stream)?;
        conn.collect_streams();
        Ok(())
    }

    /// Graceful close; the CLOSE frame rides on the next answer
    pub fn close_connection(&mut self, cnx: ConnHandle, code: u64) -> Result<()> {
        self.conn_mut(cnx)?;
        self.engine.close(cnx, code)?;
        Ok(())
    }
}
