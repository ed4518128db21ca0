//! Client session.
//!
//! One QUIC connection spread over one or more resolver paths. Each loop
//! iteration drains what the engine wants to send into TXT queries, then
//! tops every path up with polls so the server always has a query to
//! answer. Responses are fed back into the engine.

use super::connection::{Connection, StreamRead};
use super::{ConnectionEvent, SessionStats};
use crate::config::{ConfigError, Resolver, TunnelConfig};
use crate::congestion::{path_probe_backoff, CongestionAlgorithm, CongestionSelector};
use crate::dns::{decode_response, encode_query, is_response, response_id};
use crate::engine::{CloseReason, EngineEvent, PathHandle, QuicEngine, StreamId};
use crate::governor::FlowLimits;
use crate::poll::{self, PollInputs, PollScheduler, AUTHORITATIVE_POLL_TIMEOUT_US};
use crate::Result;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

/// Longest the client loop sleeps with nothing outstanding
const MAX_IDLE_WAIT_US: u64 = 1_000_000;

/// Everything a client session needs besides the engine
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub domain: String,
    pub resolvers: Vec<Resolver>,
    /// Largest QUIC packet that fits one query
    pub mtu: u32,
    pub congestion_control: Option<CongestionAlgorithm>,
    pub idle_poll_interval: Duration,
    pub limits: FlowLimits,
}

impl ClientOptions {
    pub fn from_config(config: &TunnelConfig) -> std::result::Result<Self, ConfigError> {
        let domains = config.normalized_domains()?;
        Ok(Self {
            domain: domains[0].clone(),
            resolvers: config.resolvers()?,
            mtu: config.client_mtu()?,
            congestion_control: config.client.congestion_control,
            idle_poll_interval: config.client.idle_poll_interval,
            limits: config.flow.limits(),
        })
    }
}

/// One encoded query ready for the socket
#[derive(Debug, Clone)]
pub struct OutboundQuery {
    pub dest: SocketAddr,
    pub id: u16,
    pub packet: Vec<u8>,
    /// Carries nothing but a poll frame
    pub poll: bool,
}

#[derive(Debug)]
struct ResolverPath {
    resolver: Resolver,
    path: Option<PathHandle>,
    configured: bool,
    probe_attempts: u32,
    next_probe_at: u64,
    polls: PollScheduler,
}

pub struct ClientSession<E: QuicEngine> {
    engine: E,
    options: ClientOptions,
    selector: CongestionSelector,
    local: SocketAddr,
    conn: Connection,
    paths: Vec<ResolverPath>,
    next_query_id: u16,
    events: VecDeque<ConnectionEvent>,
    stats: SessionStats,
    blocked: bool,
}

impl<E: QuicEngine> ClientSession<E> {
    /// Start the handshake towards the first resolver
    pub fn new(mut engine: E, options: ClientOptions, local: SocketAddr) -> Result<Self> {
        let primary = options
            .resolvers
            .first()
            .copied()
            .ok_or(ConfigError::NoResolvers)?;
        let selector = CongestionSelector::client(primary.mode, options.congestion_control);

        engine.set_connection_window(options.limits.connection_window);
        let now = engine.now();
        let cnx = engine.connect(primary.addr, now)?;
        let paths = options
            .resolvers
            .iter()
            .enumerate()
            .map(|(index, resolver)| ResolverPath {
                resolver: *resolver,
                path: if index == 0 {
                    engine.find_path(cnx, resolver.addr)
                } else {
                    None
                },
                configured: false,
                probe_attempts: 0,
                next_probe_at: 0,
                polls: PollScheduler::new(
                    selector.select(resolver.mode).mode,
                    options.mtu,
                    options.idle_poll_interval,
                ),
            })
            .collect();

        log::info!(
            "Connecting to {} via {} resolver(s), mtu {}, congestion {}",
            options.domain,
            options.resolvers.len(),
            options.mtu,
            selector.connection_default()
        );

        Ok(Self {
            conn: Connection::new(cnx, options.limits, now),
            engine,
            options,
            selector,
            local,
            paths,
            next_query_id: rand::random(),
            events: VecDeque::new(),
            stats: SessionStats::default(),
            blocked: false,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_ready(&self) -> bool {
        self.conn.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.closed().is_some()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    fn drain_engine_events(&mut self, now: u64) {
        while let Some(event) = self.engine.poll_event() {
            if event.cnx() != self.conn.cnx {
                log::debug!("ignoring event for foreign {}", event.cnx());
                continue;
            }
            match &event {
                EngineEvent::PathAvailable { path, peer, .. } => {
                    if let Some(rp) = self
                        .paths
                        .iter_mut()
                        .find(|rp| rp.resolver.addr == *peer && rp.path.is_none())
                    {
                        rp.path = Some(*path);
                    }
                }
                EngineEvent::PathDeleted { path, .. } => {
                    if let Some(rp) = self.paths.iter_mut().find(|rp| rp.path == Some(*path)) {
                        log::info!("Path to resolver {} lost", rp.resolver.addr);
                        rp.path = None;
                        rp.configured = false;
                        rp.probe_attempts = 0;
                        rp.next_probe_at = now;
                        rp.polls.reset();
                    }
                }
                EngineEvent::Ready { .. } => {
                    log::info!("Connection ready");
                }
                EngineEvent::Closed { reason, .. } => {
                    log::info!(
                        "Connection closed (code {:#x}, {})",
                        reason.code,
                        if reason.remote { "remote" } else { "local" }
                    );
                }
                _ => {}
            }
            self.conn
                .on_engine_event(&mut self.engine, event, now, &mut self.events);
        }
    }

    fn probe_paths(&mut self, now: u64) {
        let cnx = self.conn.cnx;
        for rp in self.paths.iter_mut() {
            if rp.path.is_some() || now < rp.next_probe_at {
                continue;
            }
            match self.engine.probe_path(cnx, rp.resolver.addr, self.local, now) {
                Ok(path) => {
                    log::info!("Added path to resolver {} ({})", rp.resolver.addr, rp.resolver.mode);
                    rp.path = Some(path);
                    rp.probe_attempts = 0;
                }
                Err(e) => {
                    rp.probe_attempts = rp.probe_attempts.saturating_add(1);
                    let delay = path_probe_backoff(rp.probe_attempts);
                    rp.next_probe_at = now.saturating_add(delay.as_micros() as u64);
                    log::debug!(
                        "Probe of resolver {} failed ({}), retry in {:?}",
                        rp.resolver.addr,
                        e,
                        delay
                    );
                }
            }
        }
    }

    fn configure_paths(&mut self) {
        let cnx = self.conn.cnx;
        for rp in self.paths.iter_mut().filter(|rp| !rp.configured) {
            if let Some(path) = rp.path {
                let congestion = self.selector.select(rp.resolver.mode);
                self.engine.configure_path(cnx, path, &congestion);
                rp.configured = true;
                log::debug!(
                    "Path to {} runs {} ({})",
                    rp.resolver.addr,
                    congestion.algorithm,
                    congestion.mode
                );
            }
        }
    }

    fn encode(&mut self, payload: &[u8], dest: SocketAddr, poll: bool) -> Result<OutboundQuery> {
        let id = self.next_query_id;
        self.next_query_id = self.next_query_id.wrapping_add(1);
        let packet = encode_query(payload, &self.options.domain, id)?;
        Ok(OutboundQuery {
            dest,
            id,
            packet,
            poll,
        })
    }

    /// Everything that should go out now: data first, then polls
    pub fn prepare_queries(&mut self) -> Result<Vec<OutboundQuery>> {
        let now = self.engine.now();
        self.drain_engine_events(now);
        if self.is_closed() {
            return Ok(Vec::new());
        }
        if self.conn.is_ready() {
            self.probe_paths(now);
        }
        self.configure_paths();

        let cnx = self.conn.cnx;
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.options.mtu as usize];

        for index in 0..self.paths.len() {
            let Some(path) = self.paths[index].path else {
                continue;
            };
            let dest = self.paths[index].resolver.addr;
            let burst = self.paths[index].polls.burst_max();

            let mut data_sent = 0;
            while data_sent < burst {
                let Some(prepared) = self.engine.prepare_packet(cnx, Some(path), now, &mut buf)? else {
                    break;
                };
                let query = self.encode(&buf[..prepared.len], dest, false)?;
                out.push(query);
                data_sent += 1;
            }
            if data_sent > 0 {
                self.paths[index].polls.on_data_sent(now);
                self.stats.queries_sent += data_sent as u64;
            }

            if !self.conn.is_ready() {
                continue;
            }

            let inputs = PollInputs {
                now,
                data_sent,
                ready_stream: self.engine.has_ready_stream(cnx),
                flow_blocked: self.engine.is_flow_blocked(cnx),
                quality: self.engine.path_quality(cnx, Some(path)),
                wake_delay_us: self.engine.next_wake_delay(now, AUTHORITATIVE_POLL_TIMEOUT_US),
            };
            let due = self.paths[index].polls.polls_due(&inputs);
            for _ in 0..due {
                self.engine.request_poll(cnx);
                let Some(prepared) = self.engine.prepare_packet(cnx, Some(path), now, &mut buf)? else {
                    break;
                };
                let query = self.encode(&buf[..prepared.len], dest, true)?;
                self.paths[index].polls.on_poll_sent(query.id, now);
                self.stats.queries_sent += 1;
                self.stats.polls_sent += 1;
                out.push(query);
            }
        }

        let blocked = self.engine.has_ready_stream(cnx) && self.engine.is_flow_blocked(cnx);
        if blocked && !self.blocked {
            log::debug!("Sending blocked by flow control");
            self.events.push_back(ConnectionEvent::Blocked { cnx });
        }
        self.blocked = blocked;

        self.drain_engine_events(now);
        self.conn.collect_streams();
        Ok(out)
    }

    /// Undo the accounting for a query the socket refused
    ///
    /// A refused poll goes back to the pending count of its path, so the
    /// next round sends it again.
    pub fn on_send_failed(&mut self, query: &OutboundQuery) {
        self.stats.queries_sent = self.stats.queries_sent.saturating_sub(1);
        self.stats.send_failures += 1;
        if !query.poll {
            return;
        }
        self.stats.polls_sent = self.stats.polls_sent.saturating_sub(1);
        if let Some(rp) = self.paths.iter_mut().find(|rp| rp.resolver.addr == query.dest) {
            rp.polls.on_poll_unsent(query.id);
        }
    }

    /// Feed one DNS response from `peer`
    pub fn handle_response(&mut self, packet: &[u8], peer: SocketAddr) -> Result<()> {
        if !is_response(packet) {
            log::debug!("Ignoring non-response from {}", peer);
            return Ok(());
        }
        let Some(index) = self.paths.iter().position(|rp| rp.resolver.addr == peer) else {
            log::debug!("Ignoring response from unknown resolver {}", peer);
            return Ok(());
        };

        let now = self.engine.now();
        let id = response_id(packet);
        self.stats.responses += 1;

        match decode_response(packet) {
            Some(payload) => {
                self.stats.data_responses += 1;
                match self.engine.incoming_packet(&payload, peer, self.local, now) {
                    Ok(incoming) => {
                        let rp = &mut self.paths[index];
                        if rp.path.is_none() && incoming.cnx == Some(self.conn.cnx) {
                            rp.path = incoming.path;
                        }
                    }
                    Err(e) => log::debug!("Engine rejected packet from {}: {}", peer, e),
                }
                self.paths[index].polls.on_response(id, true);
            }
            None => self.paths[index].polls.on_response(id, false),
        }

        self.drain_engine_events(now);
        Ok(())
    }

    /// How long the driver may sleep before calling `prepare_queries`
    pub fn next_wait(&self) -> Duration {
        let now = self.engine.now();
        let engine_delay = self.engine.next_wake_delay(now, MAX_IDLE_WAIT_US);
        let idle_remaining = self
            .paths
            .iter()
            .filter(|rp| rp.path.is_some())
            .map(|rp| rp.polls.idle_remaining_us(now))
            .min()
            .unwrap_or(u64::MAX);
        let active = self.paths.iter().any(|rp| rp.polls.is_active())
            || self.engine.has_ready_stream(self.conn.cnx);
        poll::next_wait(engine_delay, idle_remaining, active)
    }

    /// Open the next client stream
    pub fn open_stream(&mut self) -> StreamId {
        let id = self.conn.next_stream_id();
        self.conn.open_or_get_stream(&mut self.engine, id);
        id
    }

    pub fn open_or_get_stream(&mut self, stream: StreamId) -> bool {
        self.conn.open_or_get_stream(&mut self.engine, stream)
    }

    pub fn read(&mut self, stream: StreamId) -> Result<StreamRead> {
        let read = self.conn.read(&mut self.engine, stream)?;
        self.conn.collect_streams();
        Ok(read)
    }

    pub fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<()> {
        self.conn.write(&mut self.engine, stream, data)
    }

    pub fn finish(&mut self, stream: StreamId) -> Result<()> {
        self.conn.close_stream(&mut self.engine, stream)?;
        self.conn.collect_streams();
        Ok(())
    }

    /// Graceful close; the CLOSE frame leaves with the next `prepare_queries`
    pub fn close(&mut self, code: u64) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.engine.close(self.conn.cnx, code)?;
        Ok(())
    }

    /// Drop the connection without waiting for the engine to drain
    pub fn abort(&mut self) {
        if self.is_closed() {
            return;
        }
        log::info!("Aborting {}", self.conn.cnx);
        self.engine.close_immediate(self.conn.cnx);
        self.conn.mark_closed(CloseReason::local(0), &mut self.events);
    }

    pub fn resolver_count(&self) -> usize {
        self.paths.len()
    }

    /// Resolvers with a live path
    pub fn active_paths(&self) -> usize {
        self.paths.iter().filter(|rp| rp.path.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::PathMode;
    use crate::dns::{decode_query, encode_response, DomainMatcher, Rcode};
    use crate::engine::{PathQuality, SimEngine};

    const DOMAIN: &str = "t.example.com";

    fn resolver(port: u16, mode: PathMode) -> Resolver {
        Resolver {
            addr: SocketAddr::from(([192, 0, 2, 1], port)),
            mode,
        }
    }

    fn options(resolvers: Vec<Resolver>) -> ClientOptions {
        ClientOptions {
            domain: DOMAIN.to_string(),
            resolvers,
            mtu: 120,
            congestion_control: None,
            idle_poll_interval: Duration::from_millis(2000),
            limits: FlowLimits::default(),
        }
    }

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    /// Answer `query` the way the server would, with `engine` as the peer
    fn answer(server: &mut SimEngine, query: &OutboundQuery, client_addr: SocketAddr) -> Vec<u8> {
        let matcher = DomainMatcher::new([DOMAIN]);
        let decoded = decode_query(&query.packet, &matcher).unwrap();
        let now = server.now();
        let incoming = server
            .incoming_packet(&decoded.payload, client_addr, query.dest, now)
            .unwrap();
        let mut buf = [0u8; 900];
        let reply = incoming
            .cnx
            .and_then(|cnx| server.prepare_packet(cnx, incoming.path, now, &mut buf).unwrap());
        match reply {
            Some(p) => encode_response(&decoded.response(Some(&buf[..p.len]), None)).unwrap(),
            None => encode_response(&decoded.response(None, Some(Rcode::Ok))).unwrap(),
        }
    }

    #[test]
    fn test_handshake_then_poll() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);

        let queries = session.prepare_queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(!queries[0].poll);

        let response = answer(&mut server, &queries[0], local());
        session.handle_response(&response, queries[0].dest).unwrap();
        assert!(session.is_ready());
        assert_eq!(session.poll_event(), Some(ConnectionEvent::Ready { cnx: session.connection().cnx }));

        // The handshake reply carried data, so one poll follows
        let queries = session.prepare_queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].poll);
        assert_eq!(session.stats().polls_sent, 1);

        // Empty answer: nothing more until the idle interval
        let response = answer(&mut server, &queries[0], local());
        session.handle_response(&response, queries[0].dest).unwrap();
        assert!(session.prepare_queries().unwrap().is_empty());

        session.engine_mut().advance(2_000_000);
        let queries = session.prepare_queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].poll);
    }

    #[test]
    fn test_stream_data_goes_out_as_queries() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();

        let stream = session.open_stream();
        assert_eq!(stream, 0);
        session.write(stream, &[0x42; 300]).unwrap();
        let queries = session.prepare_queries().unwrap();
        assert!(queries.len() >= 3);
        assert!(queries.iter().all(|q| !q.poll && q.packet.len() <= 512));
        // Data in flight suppresses polls this round
        assert_eq!(session.stats().polls_sent, 0);
    }

    #[test]
    fn test_extra_resolvers_probed_with_backoff() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![
                resolver(53, PathMode::Recursive),
                resolver(54, PathMode::Authoritative),
            ]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();

        session.engine_mut().fail_next_probes(1);
        session.prepare_queries().unwrap();
        assert_eq!(session.active_paths(), 1);

        // Retry only after the backoff
        session.engine_mut().advance(100_000);
        session.prepare_queries().unwrap();
        assert_eq!(session.active_paths(), 1);
        session.engine_mut().advance(200_000);
        session.prepare_queries().unwrap();
        assert_eq!(session.active_paths(), 2);

        let configured = &session.engine().record().configured;
        assert!(configured
            .values()
            .any(|c| c.mode == PathMode::Authoritative && c.disable_ack_delay));
    }

    #[test]
    fn test_blocked_reported_once() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();
        while session.poll_event().is_some() {}

        let cnx = session.connection().cnx;
        let stream = session.open_stream();
        // Large enough to outlast one burst
        session.write(stream, &[1u8; 4000]).unwrap();
        session.engine_mut().set_flow_blocked(cnx, true);
        session.prepare_queries().unwrap();
        session.prepare_queries().unwrap();

        let blocked: Vec<_> = std::iter::from_fn(|| session.poll_event())
            .filter(|e| matches!(e, ConnectionEvent::Blocked { .. }))
            .collect();
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn test_authoritative_polls_follow_pacing() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Authoritative)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();

        let cnx = session.connection().cnx;
        // No pacing rate: fall back to the congestion window, 4 packets
        session.engine_mut().set_path_quality(
            cnx,
            PathQuality {
                cwin: 480,
                rtt: 50_000,
                ..PathQuality::default()
            },
        );
        let polls = session.prepare_queries().unwrap();
        assert_eq!(polls.iter().filter(|q| q.poll).count(), 4);
        // Still in flight, no deficit
        assert!(session.prepare_queries().unwrap().is_empty());
    }

    #[test]
    fn test_responses_from_strangers_ignored() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session
            .handle_response(&response, SocketAddr::from(([203, 0, 113, 9], 53)))
            .unwrap();
        assert!(!session.is_ready());
        assert_eq!(session.stats().responses, 0);
    }

    #[test]
    fn test_refused_poll_is_sent_again() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();

        let queries = session.prepare_queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].poll);
        session.on_send_failed(&queries[0]);
        assert_eq!(session.stats().polls_sent, 0);
        assert_eq!(session.stats().queries_sent, 1);
        assert_eq!(session.stats().send_failures, 1);

        let retry = session.prepare_queries().unwrap();
        assert_eq!(retry.len(), 1);
        assert!(retry[0].poll);
        assert_eq!(session.stats().polls_sent, 1);
    }

    #[test]
    fn test_abort_skips_engine_drain() {
        let mut session = ClientSession::new(
            SimEngine::client().with_manual_clock(1),
            options(vec![resolver(53, PathMode::Recursive)]),
            local(),
        )
        .unwrap();
        let mut server = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let hello = session.prepare_queries().unwrap();
        let response = answer(&mut server, &hello[0], local());
        session.handle_response(&response, hello[0].dest).unwrap();
        while session.poll_event().is_some() {}

        let cnx = session.connection().cnx;
        session.abort();
        assert!(session.is_closed());
        assert_eq!(session.engine().record().closed_immediately, vec![cnx]);
        assert!(matches!(
            session.poll_event(),
            Some(ConnectionEvent::Closed { reason, .. }) if !reason.remote
        ));
        assert!(session.prepare_queries().unwrap().is_empty());
    }

    #[test]
    fn test_connection_window_reaches_engine() {
        let mut opts = options(vec![resolver(53, PathMode::Recursive)]);
        opts.limits.connection_window = 1024 * 1024;
        let session = ClientSession::new(SimEngine::client(), opts, local()).unwrap();
        assert_eq!(session.engine().connection_window(), 1024 * 1024);
    }
}
