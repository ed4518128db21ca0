//! Per-connection stream state.
//!
//! A `Connection` owns the streams of one QUIC connection together with
//! the flow governor that decides when received bytes count as consumed.
//! Engine callbacks land here through `on_engine_event`; the stream API
//! (`read`, `write`, `close_stream`) is called by the session on behalf of
//! the layer above.

use super::ConnectionEvent;
use crate::engine::{
    CloseReason, ConnHandle, EngineEvent, QuicEngine, StreamId, APP_INTERNAL_ERROR,
};
use crate::governor::{FlowGovernor, FlowLimits, ReceiveAction, StreamFlow, StreamMode};
use crate::{Result, TunnelError};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Open,
    /// Receive side overflowed; incoming data is dropped
    Stopped,
    /// Closed locally
    Closed,
}

#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    pub flow: StreamFlow,
    inbox: VecDeque<Vec<u8>>,
    local_fin: bool,
    remote_fin: bool,
    reset: bool,
}

impl Stream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            state: StreamState::Open,
            flow: StreamFlow::default(),
            inbox: VecDeque::new(),
            local_fin: false,
            remote_fin: false,
            reset: false,
        }
    }

    /// Bytes waiting to be read
    pub fn queued(&self) -> usize {
        self.inbox.iter().map(Vec::len).sum()
    }

    pub fn remote_finished(&self) -> bool {
        self.remote_fin
    }

    fn removable(&self) -> bool {
        self.inbox.is_empty() && self.remote_fin && (self.local_fin || self.reset)
    }
}

/// Result of draining a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRead {
    pub data: Vec<u8>,
    /// The peer finished and everything it sent has been read
    pub fin: bool,
}

#[derive(Debug)]
pub struct Connection {
    pub cnx: ConnHandle,
    governor: FlowGovernor,
    streams: BTreeMap<StreamId, Stream>,
    ready: bool,
    closed: Option<CloseReason>,
    last_activity: u64,
    next_local_stream: StreamId,
}

impl Connection {
    pub fn new(cnx: ConnHandle, limits: FlowLimits, now: u64) -> Self {
        Self {
            cnx,
            governor: FlowGovernor::new(limits),
            streams: BTreeMap::new(),
            ready: false,
            closed: None,
            last_activity: now,
            next_local_stream: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn closed(&self) -> Option<CloseReason> {
        self.closed
    }

    /// Record a close the engine will never report
    pub fn mark_closed(&mut self, reason: CloseReason, events: &mut VecDeque<ConnectionEvent>) {
        if self.closed.is_none() {
            self.closed = Some(reason);
            events.push_back(ConnectionEvent::Closed {
                cnx: self.cnx,
                reason,
            });
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.governor.mode()
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Next unused client-initiated bidirectional stream id
    pub fn next_stream_id(&mut self) -> StreamId {
        while self.streams.contains_key(&self.next_local_stream) {
            self.next_local_stream += 4;
        }
        let id = self.next_local_stream;
        self.next_local_stream += 4;
        id
    }

    fn insert_stream<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, id: StreamId) {
        if !self.streams.is_empty() && !self.governor.is_multi() {
            let failed = self.governor.enter_multi(
                engine,
                self.cnx,
                self.streams
                    .iter_mut()
                    .map(|(sid, stream)| (*sid, &mut stream.flow)),
            );
            for sid in failed {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    abort_stream(engine, self.cnx, stream);
                }
            }
        }
        self.streams.insert(id, Stream::new(id));
    }

    /// Returns true when the stream was created by this call
    pub fn open_or_get_stream<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, id: StreamId) -> bool {
        if self.streams.contains_key(&id) {
            return false;
        }
        self.insert_stream(engine, id);
        log::debug!("{}: stream {} opened ({} active)", self.cnx, id, self.streams.len());
        true
    }

    pub fn on_engine_event<E: QuicEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        event: EngineEvent,
        now: u64,
        events: &mut VecDeque<ConnectionEvent>,
    ) {
        let cnx = self.cnx;
        match event {
            EngineEvent::Ready { .. } => {
                if !self.ready {
                    self.ready = true;
                    events.push_back(ConnectionEvent::Ready { cnx });
                }
            }
            EngineEvent::StreamData {
                stream, data, fin, ..
            } => {
                self.touch(now);
                if self.open_or_get_stream(engine, stream) {
                    events.push_back(ConnectionEvent::StreamOpened { cnx, stream });
                }
                let Some(entry) = self.streams.get_mut(&stream) else {
                    return;
                };
                let action =
                    self.governor
                        .on_receive(engine, cnx, stream, &mut entry.flow, data.len(), fin);
                match action {
                    ReceiveAction::Deliver => {
                        // One notification per batch of unread data
                        let notify = entry.inbox.is_empty() && (!data.is_empty() || fin);
                        if !data.is_empty() {
                            entry.inbox.push_back(data);
                        }
                        if notify {
                            events.push_back(ConnectionEvent::Readable { cnx, stream });
                        }
                    }
                    ReceiveAction::Discard => {}
                    ReceiveAction::Overflow => {
                        entry.inbox.clear();
                        entry.state = StreamState::Stopped;
                    }
                    ReceiveAction::Reset => {
                        abort_stream(engine, cnx, entry);
                    }
                }
                if fin {
                    entry.remote_fin = true;
                }
            }
            EngineEvent::StreamReset { stream, code, .. } => {
                if let Some(entry) = self.streams.get_mut(&stream) {
                    log::debug!("{}: stream {} reset by peer (code {:#x})", cnx, stream, code);
                    entry.reset = true;
                    entry.remote_fin = true;
                }
            }
            EngineEvent::StopSending { stream, code, .. } => {
                if let Some(entry) = self.streams.get_mut(&stream) {
                    log::debug!("{}: peer stopped stream {} (code {:#x})", cnx, stream, code);
                    if !entry.local_fin {
                        if let Err(e) = engine.reset_stream(cnx, stream, code) {
                            log::debug!("{}: reset of stream {} failed: {}", cnx, stream, e);
                        }
                        entry.local_fin = true;
                    }
                }
            }
            EngineEvent::Closed { reason, .. } => {
                if self.closed.is_none() {
                    self.closed = Some(reason);
                    events.push_back(ConnectionEvent::Closed { cnx, reason });
                }
            }
            EngineEvent::PathAvailable { .. } | EngineEvent::PathDeleted { .. } => {}
        }
    }

    /// Drain everything queued on `id`
    pub fn read<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, id: StreamId) -> Result<StreamRead> {
        let cnx = self.cnx;
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::UnknownStream(id))?;

        let data: Vec<u8> = stream.inbox.drain(..).flatten().collect();
        if !data.is_empty()
            && !self
                .governor
                .on_drained(engine, cnx, id, &mut stream.flow, data.len())
        {
            abort_stream(engine, cnx, stream);
        }
        Ok(StreamRead {
            fin: stream.remote_fin && stream.inbox.is_empty(),
            data,
        })
    }

    pub fn write<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, id: StreamId, data: &[u8]) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::UnknownStream(id))?;
        if stream.local_fin {
            return Err(TunnelError::StreamClosed(id));
        }
        engine.write_stream(self.cnx, id, data, false)?;
        Ok(())
    }

    /// Send FIN on `id`
    pub fn close_stream<E: QuicEngine + ?Sized>(&mut self, engine: &mut E, id: StreamId) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(TunnelError::UnknownStream(id))?;
        if stream.local_fin {
            return Ok(());
        }
        engine.write_stream(self.cnx, id, &[], true)?;
        stream.local_fin = true;
        stream.state = StreamState::Closed;
        Ok(())
    }

    /// Drop streams that are finished both ways and fully read
    pub fn collect_streams(&mut self) -> usize {
        let before = self.streams.len();
        let cnx = self.cnx;
        self.streams.retain(|id, stream| {
            let keep = !stream.removable();
            if !keep {
                log::debug!("{}: stream {} done", cnx, id);
            }
            keep
        });
        before - self.streams.len()
    }
}

fn abort_stream<E: QuicEngine + ?Sized>(engine: &mut E, cnx: ConnHandle, stream: &mut Stream) {
    if let Err(e) = engine.stop_sending(cnx, stream.id, APP_INTERNAL_ERROR) {
        log::debug!("{}: stop_sending on stream {} failed: {}", cnx, stream.id, e);
    }
    if let Err(e) = engine.reset_stream(cnx, stream.id, APP_INTERNAL_ERROR) {
        log::debug!("{}: reset of stream {} failed: {}", cnx, stream.id, e);
    }
    stream.inbox.clear();
    stream.flow.queued = 0;
    stream.flow.discarding = true;
    stream.state = StreamState::Closed;
    stream.local_fin = true;
    stream.reset = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use std::net::SocketAddr;

    fn setup(limits: FlowLimits) -> (SimEngine, Connection, VecDeque<ConnectionEvent>) {
        let mut engine = SimEngine::server(&[2u8; 16]).with_manual_clock(1);
        let cnx = engine.open_connection(SocketAddr::from(([127, 0, 0, 1], 4000)));
        (engine, Connection::new(cnx, limits, 1), VecDeque::new())
    }

    fn deliver(
        engine: &mut SimEngine,
        conn: &mut Connection,
        events: &mut VecDeque<ConnectionEvent>,
        stream: StreamId,
        data: &[u8],
        fin: bool,
    ) {
        engine.inject_stream_data(conn.cnx, stream, data, fin);
        while let Some(event) = engine.poll_event() {
            conn.on_engine_event(engine, event, 1, events);
        }
    }

    #[test]
    fn test_single_stream_delivers_everything() {
        let (mut engine, mut conn, mut events) = setup(FlowLimits {
            max_queue: 16,
            reserve: 8,
            ..FlowLimits::default()
        });
        for _ in 0..10 {
            deliver(&mut engine, &mut conn, &mut events, 0, &[7u8; 10], false);
        }
        deliver(&mut engine, &mut conn, &mut events, 0, b"", true);

        assert_eq!(conn.mode(), StreamMode::Single);
        let read = conn.read(&mut engine, 0).unwrap();
        assert_eq!(read.data.len(), 100);
        assert!(read.fin);
        assert!(engine.record().stop_sending.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StreamOpened { stream: 0, .. })));
    }

    #[test]
    fn test_second_stream_switches_mode_for_good() {
        let (mut engine, mut conn, mut events) = setup(FlowLimits {
            reserve: 0,
            ..FlowLimits::default()
        });
        deliver(&mut engine, &mut conn, &mut events, 0, b"hello", false);
        assert_eq!(conn.stream(0).unwrap().flow.consumed, 0);

        deliver(&mut engine, &mut conn, &mut events, 4, b"world", false);
        assert_eq!(conn.mode(), StreamMode::Multi);
        // Promotion consumed what stream 0 already had
        assert_eq!(conn.stream(0).unwrap().flow.consumed, 5);

        // Finish and drain stream 4; mode stays multi
        deliver(&mut engine, &mut conn, &mut events, 4, b"", true);
        conn.read(&mut engine, 4).unwrap();
        conn.close_stream(&mut engine, 4).unwrap();
        assert_eq!(conn.collect_streams(), 1);
        assert_eq!(conn.stream_count(), 1);
        assert_eq!(conn.mode(), StreamMode::Multi);
    }

    #[test]
    fn test_overflow_stops_only_that_stream() {
        let (mut engine, mut conn, mut events) = setup(FlowLimits {
            max_queue: 8,
            reserve: 0,
            ..FlowLimits::default()
        });
        conn.open_or_get_stream(&mut engine, 0);
        conn.open_or_get_stream(&mut engine, 4);
        assert_eq!(conn.mode(), StreamMode::Multi);

        deliver(&mut engine, &mut conn, &mut events, 0, &[1u8; 6], false);
        deliver(&mut engine, &mut conn, &mut events, 0, &[1u8; 6], false);
        deliver(&mut engine, &mut conn, &mut events, 4, &[2u8; 6], false);

        assert_eq!(conn.stream(0).unwrap().state, StreamState::Stopped);
        assert_eq!(conn.stream(0).unwrap().queued(), 0);
        assert_eq!(conn.stream(4).unwrap().state, StreamState::Open);
        assert_eq!(conn.read(&mut engine, 4).unwrap().data, vec![2u8; 6]);
        assert_eq!(engine.record().stop_sending.len(), 1);
    }

    #[test]
    fn test_stream_kept_until_read() {
        let (mut engine, mut conn, mut events) = setup(FlowLimits::default());
        deliver(&mut engine, &mut conn, &mut events, 0, b"tail", true);
        conn.close_stream(&mut engine, 0).unwrap();
        assert_eq!(conn.collect_streams(), 0);

        let read = conn.read(&mut engine, 0).unwrap();
        assert_eq!(read.data, b"tail");
        assert!(read.fin);
        assert_eq!(conn.collect_streams(), 1);
        assert!(matches!(
            conn.read(&mut engine, 0),
            Err(TunnelError::UnknownStream(0))
        ));
    }

    #[test]
    fn test_write_after_close_fails() {
        let (mut engine, mut conn, _) = setup(FlowLimits::default());
        conn.open_or_get_stream(&mut engine, 0);
        conn.write(&mut engine, 0, b"x").unwrap();
        conn.close_stream(&mut engine, 0).unwrap();
        assert!(matches!(
            conn.write(&mut engine, 0, b"y"),
            Err(TunnelError::StreamClosed(0))
        ));
    }

    #[test]
    fn test_next_stream_id_skips_used() {
        let (mut engine, mut conn, _) = setup(FlowLimits::default());
        conn.open_or_get_stream(&mut engine, 0);
        assert_eq!(conn.next_stream_id(), 4);
        assert_eq!(conn.next_stream_id(), 8);
    }
}
