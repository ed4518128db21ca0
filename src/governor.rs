//! Receive-side flow control.
//!
//! The engine runs in explicit consumption mode: the peer may only send
//! past what the tunnel reports as consumed. While a connection carries a
//! single stream, consumption follows the local consumer plus a small
//! reserve, so nothing is ever dropped. Once a second stream shows up the
//! connection switches (for good) to multi-stream mode: bytes are consumed
//! on arrival and every stream gets a queue cap, so one slow consumer can
//! no longer stall the connection window for everyone else.

use crate::engine::{ConnHandle, QuicEngine, StreamId, APP_INTERNAL_ERROR};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stream queue cap in multi-stream mode
pub const DEFAULT_STREAM_QUEUE_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Consumption reserve in single-stream mode
pub const DEFAULT_CONN_RESERVE_BYTES: usize = 64 * 1024;

/// Connection-level receive window
pub const DEFAULT_CONNECTION_WINDOW: u64 = 8 * 1024 * 1024;

const INVARIANT_LOG_INTERVAL_US: u64 = 1_000_000;

/// Byte budgets for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    pub max_queue: usize,
    /// 0 disables the reserve
    pub reserve: usize,
    pub connection_window: u64,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_STREAM_QUEUE_MAX_BYTES,
            reserve: DEFAULT_CONN_RESERVE_BYTES,
            connection_window: DEFAULT_CONNECTION_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Single,
    Multi,
}

/// Receive accounting for one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFlow {
    /// Bytes delivered to the stream but not yet drained by the consumer
    pub queued: usize,
    /// Total bytes received from the peer
    pub rx: u64,
    /// Offset reported to the engine as consumed
    pub consumed: u64,
    pub fin: Option<u64>,
    pub discarding: bool,
    pub stop_sending_sent: bool,
}

impl StreamFlow {
    pub fn drained(&self) -> u64 {
        self.rx.saturating_sub(self.queued as u64)
    }
}

/// What to do with bytes that just arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveAction {
    /// Queue the bytes for the consumer
    Deliver,
    /// Drop the bytes; the stream is discarding
    Discard,
    /// Queue cap exceeded: drop these bytes and everything queued so far
    Overflow,
    /// Engine refused a consume; reset the stream
    Reset,
}

/// Consume target for single-stream mode
///
/// Drained bytes plus `reserve`, never past what was received or the FIN.
pub fn reserve_target_offset(rx: u64, queued: usize, fin: Option<u64>, reserve: usize) -> u64 {
    let drained = rx.saturating_sub(queued as u64);
    let target = if reserve > 0 {
        drained.saturating_add(reserve as u64).min(rx)
    } else {
        drained
    };
    match fin {
        Some(fin) => target.min(fin),
        None => target,
    }
}

/// Rate-limited reporting for states that should never happen
///
/// Logs at most once per interval; panics in test builds.
#[derive(Debug)]
pub struct InvariantReporter {
    interval_us: u64,
    last_log_at: AtomicU64,
}

impl InvariantReporter {
    pub const fn new(interval_us: u64) -> Self {
        Self {
            interval_us,
            last_log_at: AtomicU64::new(0),
        }
    }

    fn should_log(&self, now_us: u64) -> bool {
        let last = self.last_log_at.load(Ordering::Relaxed);
        if last != 0 && now_us.saturating_sub(last) < self.interval_us {
            return false;
        }
        self.last_log_at
            .compare_exchange(last, now_us.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn report<M>(&self, now_us: u64, make_message: M)
    where
        M: FnOnce() -> String,
    {
        let should_panic = cfg!(test);
        let should_log = self.should_log(now_us);
        if should_log || should_panic {
            let message = make_message();
            if should_log {
                log::error!("invariant violated: {}", message);
            }
            if should_panic {
                panic!("{}", message);
            }
        }
    }
}

/// Flow-control state for one connection
#[derive(Debug)]
pub struct FlowGovernor {
    mode: StreamMode,
    limits: FlowLimits,
    invariants: InvariantReporter,
}

impl FlowGovernor {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            mode: StreamMode::Single,
            limits,
            invariants: InvariantReporter::new(INVARIANT_LOG_INTERVAL_US),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_multi(&self) -> bool {
        self.mode == StreamMode::Multi
    }

    pub fn limits(&self) -> &FlowLimits {
        &self.limits
    }

    /// Advance the consumed offset to `target`; false when the engine refused
    fn consume<E: QuicEngine + ?Sized>(
        &self,
        engine: &mut E,
        cnx: ConnHandle,
        stream: StreamId,
        flow: &mut StreamFlow,
        target: u64,
        context: &str,
    ) -> bool {
        if target <= flow.consumed {
            return true;
        }
        if target > flow.rx {
            let now = engine.now();
            self.invariants.report(now, || {
                format!(
                    "stream {}: consume target {} beyond received {}",
                    stream, target, flow.rx
                )
            });
            return false;
        }
        match engine.stream_consumed(cnx, stream, target) {
            Ok(()) => {
                flow.consumed = target;
                true
            }
            Err(e) => {
                log::warn!(
                    "stream {}: stream_data_consumed failed{}: {} consumed_offset={} target={}",
                    stream,
                    context,
                    e,
                    flow.consumed,
                    target
                );
                false
            }
        }
    }

    /// Account for `len` bytes that arrived on `stream`
    pub fn on_receive<E: QuicEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        cnx: ConnHandle,
        stream: StreamId,
        flow: &mut StreamFlow,
        len: usize,
        fin: bool,
    ) -> ReceiveAction {
        flow.rx = flow.rx.saturating_add(len as u64);
        if fin {
            flow.fin = Some(flow.rx);
        }
        if len == 0 {
            return if flow.discarding {
                ReceiveAction::Discard
            } else {
                ReceiveAction::Deliver
            };
        }

        if flow.discarding {
            let rx = flow.rx;
            if !self.consume(engine, cnx, stream, flow, rx, "") {
                return ReceiveAction::Reset;
            }
            return ReceiveAction::Discard;
        }

        match self.mode {
            StreamMode::Multi => {
                let projected = flow.queued.saturating_add(len);
                if projected > self.limits.max_queue {
                    log::warn!(
                        "stream {}: queued_bytes {} + {} exceeds limit {}; stopping",
                        stream,
                        flow.queued,
                        len,
                        self.limits.max_queue
                    );
                    let rx = flow.rx;
                    self.consume(engine, cnx, stream, flow, rx, " on overflow");
                    if !flow.stop_sending_sent {
                        if let Err(e) = engine.stop_sending(cnx, stream, APP_INTERNAL_ERROR) {
                            log::debug!("stream {}: stop_sending failed: {}", stream, e);
                        }
                        flow.stop_sending_sent = true;
                    }
                    flow.discarding = true;
                    flow.queued = 0;
                    return ReceiveAction::Overflow;
                }

                flow.queued = projected;
                let rx = flow.rx;
                if !self.consume(engine, cnx, stream, flow, rx, "") {
                    return ReceiveAction::Reset;
                }
                ReceiveAction::Deliver
            }
            StreamMode::Single => {
                flow.queued = flow.queued.saturating_add(len);
                if self.limits.reserve > 0 {
                    let target = reserve_target_offset(
                        flow.rx,
                        flow.queued,
                        flow.fin,
                        self.limits.reserve,
                    );
                    if !self.consume(engine, cnx, stream, flow, target, "") {
                        return ReceiveAction::Reset;
                    }
                }
                ReceiveAction::Deliver
            }
        }
    }

    /// The consumer took `len` bytes off the stream's queue
    ///
    /// Returns false when the engine refused the new consumed offset.
    pub fn on_drained<E: QuicEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        cnx: ConnHandle,
        stream: StreamId,
        flow: &mut StreamFlow,
        len: usize,
    ) -> bool {
        if len > flow.queued {
            let now = engine.now();
            self.invariants.report(now, || {
                format!(
                    "stream {}: drained {} bytes with only {} queued",
                    stream, len, flow.queued
                )
            });
        }
        flow.queued = flow.queued.saturating_sub(len);
        if flow.discarding || self.mode == StreamMode::Multi {
            return true;
        }
        let target = reserve_target_offset(flow.rx, flow.queued, flow.fin, self.limits.reserve);
        self.consume(engine, cnx, stream, flow, target, "")
    }

    /// Switch to multi-stream mode, promoting every stream that is not
    /// already discarding. Returns the ids whose promotion failed; they
    /// need a reset. A no-op once in multi mode.
    pub fn enter_multi<'a, E, I>(&mut self, engine: &mut E, cnx: ConnHandle, streams: I) -> Vec<StreamId>
    where
        E: QuicEngine + ?Sized,
        I: IntoIterator<Item = (StreamId, &'a mut StreamFlow)>,
    {
        if self.mode == StreamMode::Multi {
            return Vec::new();
        }
        self.mode = StreamMode::Multi;
        log::info!("{}: switching to multi-stream flow control", cnx);

        let mut failed = Vec::new();
        for (stream, flow) in streams {
            if flow.discarding || flow.consumed >= flow.rx {
                continue;
            }
            let rx = flow.rx;
            if !self.consume(engine, cnx, stream, flow, rx, " during promote") {
                failed.push(stream);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use std::net::SocketAddr;

    fn setup() -> (SimEngine, ConnHandle) {
        let mut engine = SimEngine::server(&[1u8; 16]).with_manual_clock(1);
        let cnx = engine.open_connection(SocketAddr::from(([127, 0, 0, 1], 5300)));
        (engine, cnx)
    }

    #[test]
    fn test_reserve_target() {
        assert_eq!(reserve_target_offset(1000, 400, None, 100), 700);
        assert_eq!(reserve_target_offset(1000, 50, None, 100), 1000);
        assert_eq!(reserve_target_offset(1000, 400, Some(650), 100), 650);
        assert_eq!(reserve_target_offset(1000, 400, None, 0), 600);
    }

    #[test]
    fn test_single_mode_never_discards() {
        let (mut engine, cnx) = setup();
        let limits = FlowLimits {
            max_queue: 10,
            reserve: 4,
            ..FlowLimits::default()
        };
        let mut governor = FlowGovernor::new(limits);
        let mut flow = StreamFlow::default();

        engine.inject_stream_data(cnx, 0, &[0u8; 100], false);
        let action = governor.on_receive(&mut engine, cnx, 0, &mut flow, 100, false);
        assert_eq!(action, ReceiveAction::Deliver);
        assert_eq!(flow.queued, 100);
        // Nothing drained yet, only the reserve is released
        assert_eq!(flow.consumed, 4);

        assert!(governor.on_drained(&mut engine, cnx, 0, &mut flow, 60));
        assert_eq!(flow.consumed, 64);
        assert!(governor.on_drained(&mut engine, cnx, 0, &mut flow, 40));
        assert_eq!(flow.consumed, 100);
        assert!(engine.record().stop_sending.is_empty());
    }

    #[test]
    fn test_multi_mode_overflow_discards_one_stream() {
        let (mut engine, cnx) = setup();
        let limits = FlowLimits {
            max_queue: 100,
            reserve: 0,
            ..FlowLimits::default()
        };
        let mut governor = FlowGovernor::new(limits);
        let mut a = StreamFlow::default();
        let mut b = StreamFlow::default();
        governor.enter_multi(&mut engine, cnx, std::iter::empty());

        engine.inject_stream_data(cnx, 0, &[0u8; 80], false);
        assert_eq!(
            governor.on_receive(&mut engine, cnx, 0, &mut a, 80, false),
            ReceiveAction::Deliver
        );
        assert_eq!(a.consumed, 80);

        engine.inject_stream_data(cnx, 0, &[0u8; 40], false);
        assert_eq!(
            governor.on_receive(&mut engine, cnx, 0, &mut a, 40, false),
            ReceiveAction::Overflow
        );
        assert!(a.discarding);
        assert_eq!(a.consumed, 120);

        engine.inject_stream_data(cnx, 0, &[0u8; 10], false);
        assert_eq!(
            governor.on_receive(&mut engine, cnx, 0, &mut a, 10, false),
            ReceiveAction::Discard
        );
        assert_eq!(a.consumed, 130);
        assert_eq!(engine.record().stop_sending, vec![(cnx, 0, APP_INTERNAL_ERROR)]);

        engine.inject_stream_data(cnx, 4, &[0u8; 50], false);
        assert_eq!(
            governor.on_receive(&mut engine, cnx, 4, &mut b, 50, false),
            ReceiveAction::Deliver
        );
        assert!(!b.discarding);
    }

    #[test]
    fn test_enter_multi_promotes_once() {
        let (mut engine, cnx) = setup();
        let mut governor = FlowGovernor::new(FlowLimits {
            reserve: 0,
            ..FlowLimits::default()
        });
        let mut flow = StreamFlow::default();
        engine.inject_stream_data(cnx, 0, &[0u8; 30], false);
        governor.on_receive(&mut engine, cnx, 0, &mut flow, 30, false);
        assert_eq!(flow.consumed, 0);

        let failed = governor.enter_multi(&mut engine, cnx, vec![(0, &mut flow)]);
        assert!(failed.is_empty());
        assert_eq!(flow.consumed, 30);
        assert!(governor.is_multi());

        assert!(governor
            .enter_multi(&mut engine, cnx, std::iter::empty())
            .is_empty());
        assert_eq!(governor.mode(), StreamMode::Multi);
    }

    #[test]
    fn test_consume_failure_requests_reset() {
        let (mut engine, cnx) = setup();
        let mut governor = FlowGovernor::new(FlowLimits::default());
        governor.enter_multi(&mut engine, cnx, std::iter::empty());
        let mut flow = StreamFlow::default();
        // The engine never saw these bytes, so it refuses the consume
        engine.close_immediate(cnx);
        assert_eq!(
            governor.on_receive(&mut engine, cnx, 0, &mut flow, 10, false),
            ReceiveAction::Reset
        );
    }
}
