//! Poll scheduling.
//!
//! DNS is strictly request/response, so the server can only talk when the
//! client asks. The client keeps queries outstanding by sending "polls":
//! QUIC packets holding nothing but a poll frame. Recursive resolvers get
//! one poll per data-bearing response plus an idle keep-alive. Authoritative
//! paths size the number of polls in flight from the engine's pacing rate.

use crate::congestion::PathMode;
use crate::engine::PathQuality;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const PACING_GAIN_BASE: f64 = 1.0;
const PACING_GAIN_PROBE: f64 = 1.25;
const PACING_GAIN_EPSILON: f64 = 0.05;

/// In-flight authoritative polls are forgotten after this long
pub const AUTHORITATIVE_POLL_TIMEOUT_US: u64 = 5_000_000;

/// Ceiling for response-driven polls waiting to be sent
pub const MAX_POLL_BURST: usize = 10;

/// Packets prepared per resolver per loop iteration, before the mode multiplier
pub const PACKET_LOOP_SEND_MAX: usize = 10;

pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Upper bound on a wait while anything is outstanding
pub const MAX_ACTIVE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PacingBudgetSnapshot {
    pub pacing_rate: u64,
    pub qps: f64,
    pub gain: f64,
    pub target_inflight: usize,
}

/// Turns the engine's pacing rate into a number of polls to keep in flight
#[derive(Debug, Clone)]
pub struct PacingPollBudget {
    payload_bytes: f64,
    mtu: u32,
    last_pacing_rate: u64,
}

impl PacingPollBudget {
    pub fn new(mtu: u32) -> Self {
        Self {
            payload_bytes: mtu.max(1) as f64,
            mtu: mtu.max(1),
            last_pacing_rate: 0,
        }
    }

    pub fn target_inflight(&mut self, quality: &PathQuality, rtt_proxy_us: u64) -> PacingBudgetSnapshot {
        let pacing_rate = quality.pacing_rate;
        let rtt_seconds = derive_rtt_us(quality.rtt, rtt_proxy_us) as f64 / 1_000_000.0;

        if pacing_rate == 0 {
            let target_inflight = cwnd_target_polls(quality.cwin, self.mtu);
            self.last_pacing_rate = 0;
            return PacingBudgetSnapshot {
                pacing_rate,
                qps: target_inflight as f64 / rtt_seconds,
                gain: PACING_GAIN_BASE,
                target_inflight,
            };
        }

        let gain = self.next_gain(pacing_rate);
        let qps = (pacing_rate as f64 / self.payload_bytes) * gain;
        let target_inflight = (qps * rtt_seconds).ceil().min(usize::MAX as f64) as usize;

        PacingBudgetSnapshot {
            pacing_rate,
            qps,
            gain,
            target_inflight,
        }
    }

    fn next_gain(&mut self, pacing_rate: u64) -> f64 {
        let rising =
            pacing_rate as f64 > (self.last_pacing_rate as f64) * (1.0 + PACING_GAIN_EPSILON);
        self.last_pacing_rate = pacing_rate;
        if rising {
            PACING_GAIN_PROBE
        } else {
            PACING_GAIN_BASE
        }
    }
}

/// Engine RTT, else the proxy; never zero
fn derive_rtt_us(rtt_us: u64, rtt_proxy_us: u64) -> u64 {
    let candidate = if rtt_us > 0 { rtt_us } else { rtt_proxy_us };
    candidate.max(1)
}

/// Polls needed to cover a congestion window
pub fn cwnd_target_polls(cwin: u64, mtu: u32) -> usize {
    let mtu = mtu.max(1) as u64;
    let target = cwin.saturating_add(mtu - 1) / mtu;
    usize::try_from(target).unwrap_or(usize::MAX)
}

pub fn inflight_packet_estimate(bytes_in_transit: u64, mtu: u32) -> usize {
    let mtu = mtu.max(1) as u64;
    let packets = bytes_in_transit.saturating_add(mtu - 1) / mtu;
    usize::try_from(packets).unwrap_or(usize::MAX)
}

pub fn expire_inflight_polls(inflight: &mut HashMap<u16, u64>, now: u64) {
    if inflight.is_empty() {
        return;
    }
    let expire_before = now.saturating_sub(AUTHORITATIVE_POLL_TIMEOUT_US);
    inflight.retain(|_, sent_at| *sent_at > expire_before);
}

/// Inputs for one scheduling decision
#[derive(Debug, Clone, Copy, Default)]
pub struct PollInputs {
    pub now: u64,
    /// Data-bearing packets sent on this path during the current round
    pub data_sent: usize,
    pub ready_stream: bool,
    pub flow_blocked: bool,
    pub quality: PathQuality,
    /// Engine wake delay, used as RTT proxy
    pub wake_delay_us: u64,
}

/// Poll bookkeeping for one resolver path
#[derive(Debug, Clone)]
pub struct PollScheduler {
    mode: PathMode,
    idle_poll_interval_us: u64,
    pending_polls: usize,
    inflight: HashMap<u16, u64>,
    budget: Option<PacingPollBudget>,
    last_snapshot: Option<PacingBudgetSnapshot>,
    last_query_at: u64,
}

impl PollScheduler {
    pub fn new(mode: PathMode, mtu: u32, idle_poll_interval: Duration) -> Self {
        let budget = match mode {
            PathMode::Authoritative => Some(PacingPollBudget::new(mtu)),
            _ => None,
        };
        Self {
            mode,
            idle_poll_interval_us: idle_poll_interval.as_micros() as u64,
            pending_polls: 0,
            inflight: HashMap::new(),
            budget,
            last_snapshot: None,
            last_query_at: 0,
        }
    }

    pub fn mode(&self) -> PathMode {
        self.mode
    }

    pub fn pending_polls(&self) -> usize {
        self.pending_polls
    }

    pub fn inflight_polls(&self) -> usize {
        self.inflight.len()
    }

    pub fn last_snapshot(&self) -> Option<PacingBudgetSnapshot> {
        self.last_snapshot
    }

    /// Packets this path may send per loop iteration
    pub fn burst_max(&self) -> usize {
        PACKET_LOOP_SEND_MAX.saturating_mul(self.mode.loop_multiplier())
    }

    /// A response arrived from this path's resolver
    pub fn on_response(&mut self, id: Option<u16>, carried_data: bool) {
        if self.mode == PathMode::Authoritative {
            if let Some(id) = id {
                self.inflight.remove(&id);
            }
        }
        if carried_data {
            self.pending_polls = self.pending_polls.saturating_add(1).min(MAX_POLL_BURST);
        }
    }

    pub fn on_poll_sent(&mut self, id: u16, now: u64) {
        self.pending_polls = self.pending_polls.saturating_sub(1);
        self.last_query_at = now;
        if self.mode == PathMode::Authoritative {
            self.inflight.insert(id, now);
        }
    }

    /// The socket refused a poll; it is owed again
    pub fn on_poll_unsent(&mut self, id: u16) {
        self.inflight.remove(&id);
        self.pending_polls = self.pending_polls.saturating_add(1).min(MAX_POLL_BURST);
    }

    pub fn on_data_sent(&mut self, now: u64) {
        self.last_query_at = now;
    }

    /// Forget everything tied to the current path
    pub fn reset(&mut self) {
        self.pending_polls = 0;
        self.inflight.clear();
        self.last_snapshot = None;
    }

    fn idle_due(&self, now: u64) -> bool {
        self.idle_poll_interval_us > 0
            && now.saturating_sub(self.last_query_at) >= self.idle_poll_interval_us
    }

    /// Number of polls to send now
    pub fn polls_due(&mut self, inputs: &PollInputs) -> usize {
        if inputs.data_sent > 0 {
            // Data packets already solicit responses
            self.pending_polls = self.pending_polls.saturating_sub(inputs.data_sent);
            return 0;
        }
        if inputs.ready_stream && !inputs.flow_blocked {
            return 0;
        }

        let due = match (self.mode, self.budget.as_mut()) {
            (PathMode::Authoritative, Some(budget)) => {
                expire_inflight_polls(&mut self.inflight, inputs.now);
                let snapshot = budget.target_inflight(&inputs.quality, inputs.wake_delay_us);
                self.last_snapshot = Some(snapshot);
                let deficit = snapshot.target_inflight.saturating_sub(self.inflight.len());
                self.pending_polls.max(deficit)
            }
            _ => self.pending_polls,
        };

        let due = if due == 0 && self.idle_due(inputs.now) {
            1
        } else {
            due
        };
        due.min(self.burst_max())
    }

    /// Whether the next wait should be short
    pub fn is_active(&self) -> bool {
        self.pending_polls > 0 || !self.inflight.is_empty()
    }

    /// Microseconds until the idle keep-alive is due
    pub fn idle_remaining_us(&self, now: u64) -> u64 {
        if self.idle_poll_interval_us == 0 {
            return u64::MAX;
        }
        self.idle_poll_interval_us
            .saturating_sub(now.saturating_sub(self.last_query_at))
    }
}

/// How long the session loop may sleep
///
/// `engine_delay_us` is the engine's own wake delay; `active` means polls
/// or data are outstanding, in which case the wait is clamped.
pub fn next_wait(engine_delay_us: u64, idle_remaining_us: u64, active: bool) -> Duration {
    let wait = Duration::from_micros(engine_delay_us.min(idle_remaining_us));
    if active {
        wait.min(MAX_ACTIVE_WAIT)
    } else {
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality(pacing_rate: u64, cwin: u64, rtt: u64) -> PathQuality {
        PathQuality {
            pacing_rate,
            cwin,
            rtt,
            ..PathQuality::default()
        }
    }

    #[test]
    fn test_budget_from_pacing() {
        let mut budget = PacingPollBudget::new(1000);
        // 100 kB/s over 1000-byte payloads with probe gain, 100 ms RTT
        let snapshot = budget.target_inflight(&quality(100_000, 0, 100_000), 0);
        assert_eq!(snapshot.gain, 1.25);
        assert_eq!(snapshot.target_inflight, 13);

        // Same rate again: base gain
        let snapshot = budget.target_inflight(&quality(100_000, 0, 100_000), 0);
        assert_eq!(snapshot.gain, 1.0);
        assert_eq!(snapshot.target_inflight, 10);

        // Less than 5% growth stays at base gain
        let snapshot = budget.target_inflight(&quality(104_000, 0, 100_000), 0);
        assert_eq!(snapshot.gain, 1.0);
    }

    #[test]
    fn test_budget_cwnd_fallback_and_rtt_proxy() {
        let mut budget = PacingPollBudget::new(900);
        let snapshot = budget.target_inflight(&quality(0, 9001, 0), 20_000);
        assert_eq!(snapshot.target_inflight, 11);
        assert_eq!(snapshot.gain, 1.0);

        // RTT proxy is used when the engine RTT is unknown
        let snapshot = budget.target_inflight(&quality(90_000, 0, 0), 200_000);
        assert_eq!(snapshot.target_inflight, 25);
    }

    #[test]
    fn test_estimates() {
        assert_eq!(cwnd_target_polls(0, 900), 0);
        assert_eq!(cwnd_target_polls(901, 900), 2);
        assert_eq!(inflight_packet_estimate(1800, 900), 2);
    }

    #[test]
    fn test_expire_inflight() {
        let mut inflight = HashMap::new();
        inflight.insert(1u16, 1_000_000u64);
        inflight.insert(2u16, 5_500_000u64);
        expire_inflight_polls(&mut inflight, 6_000_000);
        assert!(!inflight.contains_key(&1));
        assert!(inflight.contains_key(&2));
    }

    #[test]
    fn test_recursive_polls_follow_responses() {
        let mut scheduler = PollScheduler::new(PathMode::Recursive, 900, Duration::from_secs(2));
        let inputs = PollInputs {
            now: 1,
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&inputs), 0);

        scheduler.on_response(Some(7), true);
        scheduler.on_response(Some(8), true);
        scheduler.on_response(Some(9), false);
        assert_eq!(scheduler.polls_due(&inputs), 2);

        for _ in 0..20 {
            scheduler.on_response(None, true);
        }
        assert_eq!(scheduler.pending_polls(), MAX_POLL_BURST);
    }

    #[test]
    fn test_polls_suppressed_by_data() {
        let mut scheduler = PollScheduler::new(PathMode::Recursive, 900, Duration::from_secs(2));
        scheduler.on_response(None, true);
        scheduler.on_response(None, true);

        let busy = PollInputs {
            now: 1,
            data_sent: 1,
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&busy), 0);
        assert_eq!(scheduler.pending_polls(), 1);

        let ready = PollInputs {
            now: 1,
            ready_stream: true,
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&ready), 0);

        let blocked = PollInputs {
            flow_blocked: true,
            ..ready
        };
        assert_eq!(scheduler.polls_due(&blocked), 1);
    }

    #[test]
    fn test_idle_keepalive() {
        let mut scheduler = PollScheduler::new(PathMode::Recursive, 900, Duration::from_millis(2000));
        scheduler.on_data_sent(1_000_000);
        let early = PollInputs {
            now: 2_000_000,
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&early), 0);
        let late = PollInputs {
            now: 3_000_000,
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&late), 1);
    }

    #[test]
    fn test_authoritative_fills_budget() {
        let mut scheduler = PollScheduler::new(PathMode::Authoritative, 1000, Duration::from_secs(2));
        assert_eq!(scheduler.burst_max(), 20);

        let inputs = PollInputs {
            now: 10,
            quality: quality(0, 5000, 50_000),
            ..PollInputs::default()
        };
        assert_eq!(scheduler.polls_due(&inputs), 5);
        scheduler.on_poll_sent(1, 10);
        scheduler.on_poll_sent(2, 10);
        assert_eq!(scheduler.inflight_polls(), 2);
        assert_eq!(scheduler.polls_due(&inputs), 3);

        scheduler.on_response(Some(1), false);
        assert_eq!(scheduler.inflight_polls(), 1);
    }

    #[test]
    fn test_unsent_poll_is_owed_again() {
        let mut scheduler = PollScheduler::new(PathMode::Authoritative, 1000, Duration::from_secs(2));
        scheduler.on_response(None, true);
        scheduler.on_poll_sent(3, 10);
        assert_eq!(scheduler.pending_polls(), 0);
        assert_eq!(scheduler.inflight_polls(), 1);

        scheduler.on_poll_unsent(3);
        assert_eq!(scheduler.pending_polls(), 1);
        assert_eq!(scheduler.inflight_polls(), 0);
    }

    #[test]
    fn test_next_wait_clamps_when_active() {
        assert_eq!(next_wait(1_000_000, u64::MAX, true), MAX_ACTIVE_WAIT);
        assert_eq!(next_wait(1_000_000, u64::MAX, false), Duration::from_secs(1));
        assert_eq!(next_wait(1_000_000, 300_000, false), Duration::from_millis(300));
    }
}
