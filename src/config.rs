use crate::api::units::{DataRate, DataSize, TimeDelta};

/// Tuning for the sender side controller.
///
/// Out of range values are replaced with their defaults by [ScreamTxConfig::validate],
/// which [ScreamTx::new](crate::ScreamTx::new) calls before use.
#[derive(Debug, Clone)]
pub struct ScreamTxConfig {
    // Queue delay the controller steers towards.
    pub queue_delay_target: TimeDelta,

    // Congestion window bounds and starting point.
    pub min_cwnd: DataSize,
    pub initial_cwnd: DataSize,
    pub max_cwnd: DataSize,

    // Segment size used to scale additive increase.
    pub mss: DataSize,

    // Multiplicative decrease on loss and on ECN-CE respectively.
    pub loss_beta: f64,
    pub ecn_beta: f64,

    // Congestion avoidance gains for increase and delay based decrease.
    pub gain_up: f64,
    pub gain_down: f64,

    // Probing ends once the queue delay exceeds this fraction of the target.
    pub probing_exit_fraction: f64,

    // Time constant of the queue delay low-pass filter.
    pub queue_delay_smoothing: TimeDelta,

    // Max target bitrate increase per second of feedback.
    pub ramp_up_speed: DataRate,

    // Pacing rate relative to the target bitrate of a stream.
    pub pacing_headroom: f64,
    // Burst allowance of the pacer.
    pub pacing_window: TimeDelta,
    pub min_pacing_rate: DataRate,

    // RTT assumed until the first feedback arrives.
    pub initial_rtt: TimeDelta,

    // Number of later acknowledged packets before a gap counts as suspect.
    pub reorder_threshold: i64,

    // Sender side queueing above this reduces the stream target bitrate.
    pub max_rtp_queue_delay: TimeDelta,

    // No feedback for this long with data in flight resets the window.
    pub feedback_timeout: TimeDelta,

    // Transmission gap after which probing restarts.
    pub idle_gap: TimeDelta,

    // Upper bound of concurrently registered streams.
    pub max_streams: usize,
}

impl Default for ScreamTxConfig {
    fn default() -> Self {
        Self {
            queue_delay_target: TimeDelta::from_millis(60),
            min_cwnd: DataSize::from_bytes(3000),
            initial_cwnd: DataSize::from_bytes(10_000),
            max_cwnd: DataSize::from_bytes(8_000_000),
            mss: DataSize::from_bytes(1200),
            loss_beta: 0.7,
            ecn_beta: 0.8,
            gain_up: 1.0,
            gain_down: 2.0,
            probing_exit_fraction: 0.5,
            queue_delay_smoothing: TimeDelta::from_millis(50),
            ramp_up_speed: DataRate::from_kilobits_per_sec(200),
            pacing_headroom: 1.5,
            pacing_window: TimeDelta::from_millis(20),
            min_pacing_rate: DataRate::from_kilobits_per_sec(50),
            initial_rtt: TimeDelta::from_millis(100),
            reorder_threshold: 3,
            max_rtp_queue_delay: TimeDelta::from_millis(200),
            feedback_timeout: TimeDelta::from_seconds(2),
            idle_gap: TimeDelta::from_seconds(1),
            max_streams: 16,
        }
    }
}

impl ScreamTxConfig {
    pub fn validate(&mut self) {
        let default = Self::default();

        if self.queue_delay_target < TimeDelta::from_millis(1)
            || self.queue_delay_target > TimeDelta::from_seconds(2)
        {
            tracing::warn!("Queue delay target must be between 1 ms and 2 s");
            self.queue_delay_target = default.queue_delay_target;
        }
        if self.min_cwnd < self.mss || self.min_cwnd > self.max_cwnd {
            tracing::warn!("Minimum congestion window must be between one segment and the maximum window");
            self.min_cwnd = default.min_cwnd;
            self.max_cwnd = default.max_cwnd;
            self.mss = default.mss;
        }
        if self.initial_cwnd < self.min_cwnd || self.initial_cwnd > self.max_cwnd {
            tracing::warn!("Initial congestion window must be within the window bounds");
            self.initial_cwnd = self.min_cwnd.max(default.initial_cwnd.min(self.max_cwnd));
        }
        if !(self.loss_beta > 0.0 && self.loss_beta < 1.0) {
            tracing::warn!("Loss back-off factor must be between 0 and 1");
            self.loss_beta = default.loss_beta;
        }
        if !(self.ecn_beta > 0.0 && self.ecn_beta < 1.0) {
            tracing::warn!("ECN back-off factor must be between 0 and 1");
            self.ecn_beta = default.ecn_beta;
        }
        if !(self.gain_up > 0.0 && self.gain_up.is_finite()) {
            tracing::warn!("Window increase gain must be positive");
            self.gain_up = default.gain_up;
        }
        if !(self.gain_down > 0.0 && self.gain_down.is_finite()) {
            tracing::warn!("Window decrease gain must be positive");
            self.gain_down = default.gain_down;
        }
        if !(self.probing_exit_fraction > 0.0 && self.probing_exit_fraction <= 1.0) {
            tracing::warn!("Probing exit fraction must be in (0, 1]");
            self.probing_exit_fraction = default.probing_exit_fraction;
        }
        if self.queue_delay_smoothing <= TimeDelta::zero() {
            tracing::warn!("Queue delay smoothing must be positive");
            self.queue_delay_smoothing = default.queue_delay_smoothing;
        }
        if !(self.pacing_headroom >= 1.0 && self.pacing_headroom.is_finite()) {
            tracing::warn!("Pacing headroom must be at least 1.0");
            self.pacing_headroom = default.pacing_headroom;
        }
        if self.pacing_window <= TimeDelta::zero() {
            tracing::warn!("Pacing window must be positive");
            self.pacing_window = default.pacing_window;
        }
        if self.min_pacing_rate.is_zero() || self.min_pacing_rate.is_infinite() {
            tracing::warn!("Minimum pacing rate must be finite and positive");
            self.min_pacing_rate = default.min_pacing_rate;
        }
        if self.initial_rtt <= TimeDelta::zero() {
            tracing::warn!("Initial RTT must be positive");
            self.initial_rtt = default.initial_rtt;
        }
        if self.reorder_threshold < 1 {
            tracing::warn!("Reorder threshold must be at least one packet");
            self.reorder_threshold = default.reorder_threshold;
        }
        if self.feedback_timeout <= TimeDelta::zero() {
            tracing::warn!("Feedback timeout must be positive");
            self.feedback_timeout = default.feedback_timeout;
        }
        if self.max_streams == 0 {
            tracing::warn!("At least one stream must be allowed");
            self.max_streams = default.max_streams;
        }
    }
}

/// Tuning for the receiver side feedback generator.
#[derive(Debug, Clone)]
pub struct ScreamRxConfig {
    // Max time between two reports while packets keep arriving.
    pub feedback_interval: TimeDelta,

    // A report is due early once this many packets arrived.
    pub feedback_packet_threshold: usize,

    // A report is due early once this many bytes arrived.
    pub feedback_bytes_threshold: DataSize,

    // Number of sequence numbers covered by each report, ending at the highest received.
    pub report_window: u16,

    // Upper bound of concurrently tracked streams.
    pub max_streams: usize,
}

impl Default for ScreamRxConfig {
    fn default() -> Self {
        Self {
            feedback_interval: TimeDelta::from_millis(20),
            feedback_packet_threshold: 16,
            feedback_bytes_threshold: DataSize::from_bytes(12_000),
            report_window: 64,
            max_streams: 16,
        }
    }
}

impl ScreamRxConfig {
    // RFC 8888 reports up to 16384 packets per SSRC.
    pub const MAX_REPORT_WINDOW: u16 = 16384;

    pub fn validate(&mut self) {
        let default = Self::default();

        if self.feedback_interval <= TimeDelta::zero() {
            tracing::warn!("Feedback interval must be positive");
            self.feedback_interval = default.feedback_interval;
        }
        if self.feedback_packet_threshold == 0 {
            tracing::warn!("Feedback packet threshold must be at least one packet");
            self.feedback_packet_threshold = default.feedback_packet_threshold;
        }
        if self.report_window == 0 || self.report_window > Self::MAX_REPORT_WINDOW {
            tracing::warn!(
                "Report window must be between 1 and {} packets",
                Self::MAX_REPORT_WINDOW
            );
            self.report_window = default.report_window;
        }
        if self.max_streams == 0 {
            tracing::warn!("At least one stream must be allowed");
            self.max_streams = default.max_streams;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = ScreamTxConfig::default();
        config.validate();
        assert_eq!(config.min_cwnd, DataSize::from_bytes(3000));
        assert_eq!(config.initial_cwnd, DataSize::from_bytes(10_000));

        let mut config = ScreamRxConfig::default();
        config.validate();
        assert_eq!(config.report_window, 64);
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let mut config = ScreamTxConfig {
            loss_beta: 1.5,
            ecn_beta: f64::NAN,
            initial_cwnd: DataSize::from_bytes(100),
            max_streams: 0,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.loss_beta, 0.7);
        assert_eq!(config.ecn_beta, 0.8);
        assert_eq!(config.initial_cwnd, DataSize::from_bytes(10_000));
        assert_eq!(config.max_streams, 16);

        let mut config = ScreamRxConfig {
            report_window: 0,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.report_window, 64);
    }
}
