use std::{collections::VecDeque, fmt};

use crate::{
    api::{
        transport::TransportPacketsFeedback,
        units::{DataRate, DataSize, TimeDelta, Timestamp},
    },
    config::ScreamTxConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Probing,
    CongestionAvoidance,
    FastRecovery,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::CongestionAvoidance => "congestion_avoidance",
            Self::FastRecovery => "fast_recovery",
        };
        f.write_str(name)
    }
}

/// What the latest feedback told us about the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionSignal {
    None,
    // Queue delay above target, the window shrank gradually.
    Delay,
    // Loss or ECN-CE that triggered a multiplicative decrease.
    Reduction,
    // Loss or ECN-CE within one RTT of the previous reduction.
    Coalesced,
}

/// Minimum one-way delay, tracked as per-minute minima over the last ten minutes.
#[derive(Debug, Default)]
struct BaseDelayHistory {
    minima: VecDeque<(Timestamp, TimeDelta)>,
}

impl BaseDelayHistory {
    const INTERVAL: TimeDelta = TimeDelta::from_seconds(60);
    const LENGTH: usize = 10;

    fn update(&mut self, now: Timestamp, one_way_delay: TimeDelta) {
        match self.minima.back_mut() {
            Some((start, min)) if now - *start < Self::INTERVAL => {
                *min = (*min).min(one_way_delay);
            }
            _ => {
                self.minima.push_back((now, one_way_delay));
                if self.minima.len() > Self::LENGTH {
                    self.minima.pop_front();
                }
            }
        }
    }

    fn base(&self) -> Option<TimeDelta> {
        self.minima.iter().map(|(_, min)| *min).min()
    }
}

/// The congestion window shared by every stream, and the state machine that moves it.
#[derive(Debug)]
pub struct CongestionWindow {
    config: ScreamTxConfig,
    state: WindowState,

    // Kept as float so small additive increases accumulate.
    cwnd: f64,
    // Highest data in flight since the previous feedback.
    bytes_in_flight_hi: DataSize,

    base_delay: BaseDelayHistory,
    queue_delay: f64,
    last_queue_delay_update: Option<Timestamp>,

    srtt: TimeDelta,
    has_rtt_sample: bool,

    // Smoothed fraction of resolved packets that were lost.
    loss_rate: f64,

    last_congestion_event: Option<Timestamp>,
    last_feedback: Option<Timestamp>,
    last_transmit: Option<Timestamp>,

    loss_events: u64,
    ecn_events: u64,
    window_reductions: u64,
    coalesced_events: u64,
}

impl CongestionWindow {
    const LOSS_RATE_SMOOTHING: f64 = 0.1;
    const MIN_RTT_FOR_RATE: TimeDelta = TimeDelta::from_millis(10);
    const MAX_RETRY_HINT: TimeDelta = TimeDelta::from_millis(50);
    const MIN_RETRY_HINT: TimeDelta = TimeDelta::from_millis(1);

    pub fn new(config: &ScreamTxConfig) -> Self {
        Self {
            config: config.clone(),
            state: WindowState::Idle,
            cwnd: config.initial_cwnd.bytes_float(),
            bytes_in_flight_hi: DataSize::zero(),
            base_delay: BaseDelayHistory::default(),
            queue_delay: 0.0,
            last_queue_delay_update: None,
            srtt: config.initial_rtt,
            has_rtt_sample: false,
            loss_rate: 0.0,
            last_congestion_event: None,
            last_feedback: None,
            last_transmit: None,
            loss_events: 0,
            ecn_events: 0,
            window_reductions: 0,
            coalesced_events: 0,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn cwnd(&self) -> DataSize {
        DataSize::from_bytes_float(self.cwnd)
    }

    pub fn queue_delay(&self) -> TimeDelta {
        TimeDelta::from_seconds_float(self.queue_delay)
    }

    pub fn srtt(&self) -> TimeDelta {
        self.srtt
    }

    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }

    pub fn loss_events(&self) -> u64 {
        self.loss_events
    }

    pub fn ecn_events(&self) -> u64 {
        self.ecn_events
    }

    pub fn window_reductions(&self) -> u64 {
        self.window_reductions
    }

    pub fn coalesced_events(&self) -> u64 {
        self.coalesced_events
    }

    /// The rate at which a full window drains over one smoothed RTT.
    pub fn allowed_rate(&self) -> DataRate {
        let rtt = self.srtt.max(Self::MIN_RTT_FOR_RATE);
        DataRate::from_bits_per_sec_float((self.cwnd * 8.0 / rtt.seconds_float()).round())
    }

    /// Whether `size` more bytes fit in the window. A lone packet always fits so
    /// an empty pipe can never deadlock.
    pub fn can_transmit(&self, bytes_in_flight: DataSize, size: DataSize) -> bool {
        bytes_in_flight.is_zero() || (bytes_in_flight + size).bytes_float() <= self.cwnd
    }

    /// How long to wait before polling again while the window is full.
    pub fn retry_hint(&self) -> TimeDelta {
        (self.srtt / 2i64).clamped(Self::MIN_RETRY_HINT, Self::MAX_RETRY_HINT)
    }

    /// Records a transmission, `bytes_in_flight` includes the new packet.
    pub fn on_transmit(&mut self, now: Timestamp, size: DataSize, bytes_in_flight: DataSize) {
        let was_empty = bytes_in_flight == size;
        let idle = self
            .last_transmit
            .map_or(true, |last| now - last >= self.config.idle_gap);

        if self.state == WindowState::Idle || (was_empty && idle && self.state != WindowState::Probing) {
            self.set_state(WindowState::Probing);
        }
        if self.last_feedback.is_none() || (was_empty && idle) {
            // The feedback timeout counts from the first packet after a quiet period.
            self.last_feedback = Some(now);
        }

        self.last_transmit = Some(now);
        self.bytes_in_flight_hi = self.bytes_in_flight_hi.max(bytes_in_flight);
    }

    /// Applies resolved feedback to the window. `max_rate` is the sum of the
    /// registered streams' maximum bitrates and caps the useful window.
    pub fn on_feedback(
        &mut self,
        feedback: &TransportPacketsFeedback,
        max_rate: DataRate,
    ) -> CongestionSignal {
        let now = feedback.feedback_time;
        self.last_feedback = Some(now);

        self.update_rtt(now, feedback);
        self.update_queue_delay(now, feedback);
        self.update_loss_rate(feedback);

        let has_loss = feedback.has_loss();
        let has_ce = feedback.has_congestion_experienced();
        if has_loss {
            self.loss_events += 1;
        }
        if has_ce {
            self.ecn_events += 1;
        }

        let signal = if has_loss || has_ce {
            self.on_congestion_event(now, has_loss)
        } else {
            self.on_acked(now, feedback.acked_size())
        };

        self.clamp(max_rate);
        self.bytes_in_flight_hi = feedback.data_in_flight;
        signal
    }

    /// Collapses the window when feedback stopped while data is in flight.
    /// Returns true when the timeout fired.
    pub fn check_feedback_timeout(&mut self, now: Timestamp, bytes_in_flight: DataSize) -> bool {
        if !self.is_feedback_timed_out(now, bytes_in_flight) {
            return false;
        }

        tracing::warn!(
            "No feedback for {:?} with {:?} in flight, resetting window",
            self.last_feedback.map(|last| now - last),
            bytes_in_flight
        );
        self.cwnd = self.config.min_cwnd.bytes_float();
        self.bytes_in_flight_hi = DataSize::zero();
        self.last_feedback = None;
        self.set_state(WindowState::Idle);
        true
    }

    pub fn is_feedback_timed_out(&self, now: Timestamp, bytes_in_flight: DataSize) -> bool {
        if bytes_in_flight.is_zero() || self.state == WindowState::Idle {
            return false;
        }
        self.last_feedback
            .map_or(false, |last| now - last >= self.config.feedback_timeout)
    }

    fn update_rtt(&mut self, now: Timestamp, feedback: &TransportPacketsFeedback) {
        let Some(newest) = feedback.last_sent_received() else {
            return;
        };
        let sample = (now - newest.sent_packet.send_time).max(TimeDelta::zero());
        if self.has_rtt_sample {
            self.srtt = self.srtt * 0.875 + sample * 0.125;
        } else {
            self.srtt = sample;
            self.has_rtt_sample = true;
        }
    }

    fn update_queue_delay(&mut self, now: Timestamp, feedback: &TransportPacketsFeedback) {
        let Some(one_way_delay) = feedback.min_one_way_delay() else {
            return;
        };
        self.base_delay.update(now, one_way_delay);
        let base = self.base_delay.base().unwrap_or(one_way_delay);
        let sample = (one_way_delay - base).max(TimeDelta::zero()).seconds_float();

        let alpha = match self.last_queue_delay_update {
            Some(last) if now > last => {
                let tau = self.config.queue_delay_smoothing.seconds_float();
                1.0 - (-(now - last).seconds_float() / tau).exp()
            }
            Some(_) => 0.0,
            None => 1.0,
        };
        self.queue_delay = (self.queue_delay + alpha * (sample - self.queue_delay)).max(0.0);
        self.last_queue_delay_update = Some(now);
    }

    fn update_loss_rate(&mut self, feedback: &TransportPacketsFeedback) {
        let total = feedback.packet_feedbacks.len();
        if total == 0 {
            return;
        }
        let lost = feedback.lost_with_send_info().count();
        let sample = lost as f64 / total as f64;
        self.loss_rate += Self::LOSS_RATE_SMOOTHING * (sample - self.loss_rate);
    }

    fn on_congestion_event(&mut self, now: Timestamp, is_loss: bool) -> CongestionSignal {
        let coalesced = self
            .last_congestion_event
            .map_or(false, |last| now - last < self.srtt);
        if coalesced {
            self.coalesced_events += 1;
            tracing::trace!("Congestion event within one RTT of the previous reduction, coalesced");
            return CongestionSignal::Coalesced;
        }

        let beta = if is_loss {
            self.config.loss_beta
        } else {
            self.config.ecn_beta
        };
        let before = self.cwnd;
        self.cwnd *= beta;
        self.window_reductions += 1;
        self.last_congestion_event = Some(now);
        tracing::debug!(
            "{} reduced window from {:.0} to {:.0} bytes",
            if is_loss { "Loss" } else { "ECN-CE" },
            before,
            self.cwnd
        );

        if self.state == WindowState::Probing {
            self.set_state(WindowState::CongestionAvoidance);
        }
        self.set_state(WindowState::FastRecovery);
        CongestionSignal::Reduction
    }

    fn on_acked(&mut self, now: Timestamp, acked: DataSize) -> CongestionSignal {
        let target = self.config.queue_delay_target.seconds_float();
        let can_grow = self.bytes_in_flight_hi.bytes_float() * 2.0 >= self.cwnd;
        let acked = acked.bytes_float();
        let mss = self.config.mss.bytes_float();

        match self.state {
            WindowState::Idle => CongestionSignal::None,
            WindowState::FastRecovery => {
                let recovered = self
                    .last_congestion_event
                    .map_or(true, |last| now - last >= self.srtt);
                if recovered {
                    self.set_state(WindowState::CongestionAvoidance);
                }
                CongestionSignal::None
            }
            WindowState::Probing => {
                if self.queue_delay > self.config.probing_exit_fraction * target {
                    self.set_state(WindowState::CongestionAvoidance);
                } else if can_grow {
                    self.cwnd += acked;
                }
                CongestionSignal::None
            }
            WindowState::CongestionAvoidance => {
                let off_target = (target - self.queue_delay) / target;
                if off_target >= 0.0 {
                    if can_grow {
                        self.cwnd += self.config.gain_up * off_target * acked * mss / self.cwnd;
                    }
                    CongestionSignal::None
                } else {
                    // Queue delay above target, back off in proportion to the excess.
                    let decrease = self.config.gain_down * -off_target * acked * mss / self.cwnd;
                    self.cwnd -= decrease.min(self.cwnd * (1.0 - self.config.loss_beta));
                    CongestionSignal::Delay
                }
            }
        }
    }

    fn clamp(&mut self, max_rate: DataRate) {
        let min_cwnd = self.config.min_cwnd.bytes_float();
        let mut max_cwnd = self.config.max_cwnd.bytes_float();
        if max_rate.is_finite() && !max_rate.is_zero() {
            // Two RTTs worth of the aggregate maximum bitrate is all the window can use.
            let useful = 2.0 * max_rate.bytes_per_sec_float() * self.srtt.seconds_float();
            max_cwnd = max_cwnd.min(useful.max(min_cwnd));
        }

        if !self.cwnd.is_finite() {
            tracing::warn!("Window became {}, resetting to minimum", self.cwnd);
            self.cwnd = min_cwnd;
        }
        self.cwnd = self.cwnd.clamp(min_cwnd, max_cwnd);
    }

    fn set_state(&mut self, state: WindowState) {
        if self.state != state {
            tracing::info!("Window state {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use test_trace::test;

    use super::*;
    use crate::api::transport::{EcnMarking, PacketResult, SentPacket};

    const MAX_RATE: DataRate = DataRate::from_kilobits_per_sec(100_000);

    fn sent(send_ms: i64) -> SentPacket {
        SentPacket {
            ssrc: 1,
            send_time: Timestamp::from_millis(send_ms),
            size: DataSize::from_bytes(1000),
            ..Default::default()
        }
    }

    fn acked(now_ms: i64, send_ms: i64, count: usize, owd_ms: i64, ecn: EcnMarking) -> TransportPacketsFeedback {
        TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(now_ms),
            data_in_flight: DataSize::zero(),
            packet_feedbacks: (0..count)
                .map(|_| {
                    PacketResult::received(sent(send_ms), Some(TimeDelta::from_millis(owd_ms)), ecn)
                })
                .collect(),
        }
    }

    fn lost(now_ms: i64, send_ms: i64) -> TransportPacketsFeedback {
        TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(now_ms),
            data_in_flight: DataSize::zero(),
            packet_feedbacks: vec![
                PacketResult::received(
                    sent(send_ms),
                    Some(TimeDelta::from_millis(20)),
                    EcnMarking::NotEct,
                ),
                PacketResult::lost(sent(send_ms)),
            ],
        }
    }

    fn probing_window() -> CongestionWindow {
        let mut window = CongestionWindow::new(&ScreamTxConfig::default());
        window.on_transmit(
            Timestamp::from_millis(0),
            DataSize::from_bytes(1000),
            DataSize::from_bytes(10_000),
        );
        window
    }

    #[test]
    fn starts_idle_and_probes_on_first_packet() {
        let mut window = CongestionWindow::new(&ScreamTxConfig::default());
        assert_eq!(window.state(), WindowState::Idle);
        assert_eq!(window.cwnd(), DataSize::from_bytes(10_000));

        window.on_transmit(
            Timestamp::from_millis(0),
            DataSize::from_bytes(1000),
            DataSize::from_bytes(1000),
        );
        assert_eq!(window.state(), WindowState::Probing);
    }

    #[test]
    fn window_gate() {
        let window = CongestionWindow::new(&ScreamTxConfig::default());
        assert!(window.can_transmit(DataSize::from_bytes(9000), DataSize::from_bytes(1000)));
        assert!(!window.can_transmit(DataSize::from_bytes(9001), DataSize::from_bytes(1000)));
        // An oversized packet still goes out on an empty pipe.
        assert!(window.can_transmit(DataSize::zero(), DataSize::from_bytes(20_000)));
        assert_eq!(window.retry_hint(), TimeDelta::from_millis(50));
    }

    #[test]
    fn probing_grows_by_acked_bytes() {
        let mut window = probing_window();
        let signal = window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(signal, CongestionSignal::None);
        assert_eq!(window.cwnd(), DataSize::from_bytes(15_000));
        assert_eq!(window.srtt(), TimeDelta::from_millis(50));
        assert_eq!(window.queue_delay(), TimeDelta::zero());
    }

    #[test]
    fn probing_exits_on_queue_delay() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 1, 20, EcnMarking::NotEct), MAX_RATE);
        // 60 ms of queueing on top of the 20 ms base, sampled long after the previous one.
        window.on_feedback(&acked(1050, 1000, 1, 80, EcnMarking::NotEct), MAX_RATE);
        assert!(window.queue_delay() > TimeDelta::from_millis(30));
        assert_eq!(window.state(), WindowState::CongestionAvoidance);
    }

    #[test]
    fn loss_reduces_once_per_rtt() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        let before = window.cwnd().bytes_float();

        assert_eq!(window.on_feedback(&lost(60, 10), MAX_RATE), CongestionSignal::Reduction);
        assert_eq!(window.state(), WindowState::FastRecovery);
        assert_relative_eq!(window.cwnd().bytes_float(), before * 0.7, epsilon = 1.0);

        // Second loss inside the same round trip.
        assert_eq!(window.on_feedback(&lost(70, 20), MAX_RATE), CongestionSignal::Coalesced);
        assert_eq!(window.window_reductions(), 1);
        assert_eq!(window.coalesced_events(), 1);
        assert_eq!(window.loss_events(), 2);
    }

    #[test]
    fn ecn_uses_gentler_backoff() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        let before = window.cwnd().bytes_float();

        let signal = window.on_feedback(&acked(60, 10, 1, 20, EcnMarking::Ce), MAX_RATE);
        assert_eq!(signal, CongestionSignal::Reduction);
        assert_relative_eq!(window.cwnd().bytes_float(), before * 0.8, epsilon = 1.0);
        assert_eq!(window.ecn_events(), 1);
        assert_eq!(window.loss_events(), 0);
    }

    #[test]
    fn fast_recovery_ends_after_one_rtt() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        window.on_feedback(&lost(60, 10), MAX_RATE);
        assert_eq!(window.state(), WindowState::FastRecovery);

        window.on_feedback(&acked(80, 30, 1, 20, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(window.state(), WindowState::FastRecovery);
        window.on_feedback(&acked(200, 150, 1, 20, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(window.state(), WindowState::CongestionAvoidance);
    }

    #[test]
    fn probing_restarts_after_idle_gap() {
        let mut window = probing_window();
        let packet = DataSize::from_bytes(1000);
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        window.on_feedback(&lost(60, 10), MAX_RATE);
        window.on_transmit(Timestamp::from_millis(100), packet, packet);
        assert_eq!(window.state(), WindowState::FastRecovery);
        window.on_feedback(&acked(200, 150, 1, 20, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(window.state(), WindowState::CongestionAvoidance);

        // The pipe is empty but the gap is shorter than idle_gap.
        window.on_transmit(Timestamp::from_millis(300), packet, packet);
        assert_eq!(window.state(), WindowState::CongestionAvoidance);

        window.on_transmit(Timestamp::from_millis(1300), packet, packet);
        assert_eq!(window.state(), WindowState::Probing);
        for i in 2..=6 {
            window.on_transmit(Timestamp::from_millis(1300 + i), packet, packet * i);
        }

        let before = window.cwnd().bytes_float();
        let signal = window.on_feedback(&acked(1350, 1300, 3, 20, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(signal, CongestionSignal::None);
        assert_eq!(window.state(), WindowState::Probing);
        assert_relative_eq!(window.cwnd().bytes_float(), before + 3000.0, epsilon = 1.0);
    }

    #[test]
    fn window_stays_within_bounds() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        for i in 0..50 {
            let now = 1000 + i * 1000;
            window.on_feedback(&lost(now, now - 50), MAX_RATE);
        }
        assert_eq!(window.cwnd(), DataSize::from_bytes(3000));

        // The useful window is capped by two RTTs of the aggregate maximum bitrate.
        let mut window = probing_window();
        for i in 0..20 {
            let now = 50 + i * 50;
            window.on_transmit(
                Timestamp::from_millis(now),
                DataSize::from_bytes(1000),
                window.cwnd(),
            );
            window.on_feedback(
                &acked(now, now - 50, 100, 20, EcnMarking::NotEct),
                DataRate::from_kilobits_per_sec(1000),
            );
        }
        // 2 * 125000 bytes/s * 50 ms
        assert_eq!(window.cwnd(), DataSize::from_bytes(12_500));
    }

    #[test]
    fn delay_above_target_shrinks_window() {
        let mut window = probing_window();
        window.on_feedback(&acked(50, 0, 5, 20, EcnMarking::NotEct), MAX_RATE);
        window.on_feedback(&acked(1050, 1000, 1, 80, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(window.state(), WindowState::CongestionAvoidance);

        let before = window.cwnd();
        let signal = window.on_feedback(&acked(2050, 2000, 5, 200, EcnMarking::NotEct), MAX_RATE);
        assert_eq!(signal, CongestionSignal::Delay);
        assert!(window.cwnd() < before);
        assert_eq!(window.window_reductions(), 0);
    }

    #[test]
    fn feedback_timeout_resets_window() {
        let mut window = probing_window();
        assert!(!window.check_feedback_timeout(Timestamp::from_millis(1000), DataSize::from_bytes(5000)));
        assert!(window.check_feedback_timeout(Timestamp::from_millis(2500), DataSize::from_bytes(5000)));
        assert_eq!(window.state(), WindowState::Idle);
        assert_eq!(window.cwnd(), DataSize::from_bytes(3000));

        // Nothing in flight, nothing to time out.
        let mut window = probing_window();
        assert!(!window.check_feedback_timeout(Timestamp::from_millis(5000), DataSize::zero()));
    }

    #[test]
    fn base_delay_history_forgets_old_minima() {
        let mut history = BaseDelayHistory::default();
        history.update(Timestamp::from_seconds(0), TimeDelta::from_millis(10));
        history.update(Timestamp::from_seconds(30), TimeDelta::from_millis(40));
        assert_eq!(history.base(), Some(TimeDelta::from_millis(10)));

        for minute in 1..=10 {
            history.update(Timestamp::from_seconds(minute * 60), TimeDelta::from_millis(30));
        }
        assert_eq!(history.base(), Some(TimeDelta::from_millis(30)));
    }

    #[test]
    fn allowed_rate_follows_window_and_rtt() {
        let window = CongestionWindow::new(&ScreamTxConfig::default());
        // 10000 bytes per 100 ms.
        assert_eq!(window.allowed_rate(), DataRate::from_kilobits_per_sec(800));
    }
}
