use std::sync::Arc;

use crate::{
    api::units::{DataRate, DataSize, TimeDelta, Timestamp},
    config::ScreamTxConfig,
    rtp_queue::RtpQueue,
};

use super::{pacing::IntervalBudget, window::CongestionSignal};

/// Bytes per interval, turned into a rate once the interval has passed.
#[derive(Debug, Default)]
struct RateCounter {
    window_start: Option<Timestamp>,
    bytes: i64,
    rate: DataRate,
}

impl RateCounter {
    const INTERVAL: TimeDelta = TimeDelta::from_millis(500);

    fn update(&mut self, now: Timestamp, size: DataSize) {
        let start = *self.window_start.get_or_insert(now);
        self.bytes += size.bytes();

        let elapsed = now - start;
        if elapsed >= Self::INTERVAL {
            self.rate = DataSize::from_bytes(self.bytes) / elapsed;
            self.bytes = 0;
            self.window_start = Some(now);
        }
    }
}

/// One registered media stream and its share of the window.
#[derive(Debug)]
pub struct Stream {
    ssrc: u32,
    priority: f64,
    min_bitrate: DataRate,
    max_bitrate: DataRate,
    queue: Arc<RtpQueue>,

    target_bitrate: f64,
    pacer: IntervalBudget,
    last_update: Option<Timestamp>,

    transmit_rate: RateCounter,
    packets_transmitted: u64,
    bytes_transmitted: DataSize,

    media_rate: RateCounter,
    current_frame: DataSize,
    last_frame_time: Option<Timestamp>,
    frames: u64,
    oversize_frames: u64,
    queue_delay_reductions: u64,
}

impl Stream {
    // Sender side queueing cuts the target by this fraction per feedback.
    const QUEUE_DELAY_BACKOFF: f64 = 0.9;
    // A frame is oversize when it is this many times the target allows for its interval.
    const OVERSIZE_FRAME_FACTOR: f64 = 2.0;

    pub fn new(
        config: &ScreamTxConfig,
        queue: Arc<RtpQueue>,
        ssrc: u32,
        priority: f64,
        min_bitrate: DataRate,
        max_bitrate: DataRate,
        start_bitrate: DataRate,
    ) -> Self {
        let priority = if priority.is_finite() && priority > 0.0 {
            priority
        } else {
            tracing::warn!(ssrc, "Priority {} is not positive, using 1.0", priority);
            1.0
        };
        let max_bitrate = if max_bitrate < min_bitrate {
            tracing::warn!(ssrc, "Max bitrate {:?} below min bitrate {:?}", max_bitrate, min_bitrate);
            min_bitrate
        } else {
            max_bitrate
        };
        let start_bitrate = start_bitrate.clamped(min_bitrate, max_bitrate);

        let mut this = Self {
            ssrc,
            priority,
            min_bitrate,
            max_bitrate,
            queue,
            target_bitrate: start_bitrate.bps_float(),
            pacer: IntervalBudget::new(DataRate::zero(), config.pacing_window),
            last_update: None,
            transmit_rate: RateCounter::default(),
            packets_transmitted: 0,
            bytes_transmitted: DataSize::zero(),
            media_rate: RateCounter::default(),
            current_frame: DataSize::zero(),
            last_frame_time: None,
            frames: 0,
            oversize_frames: 0,
            queue_delay_reductions: 0,
        };
        this.pacer.set_target_rate(this.pacing_rate(config));
        this
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn min_bitrate(&self) -> DataRate {
        self.min_bitrate
    }

    pub fn max_bitrate(&self) -> DataRate {
        self.max_bitrate
    }

    pub fn queue(&self) -> &Arc<RtpQueue> {
        &self.queue
    }

    pub fn target_bitrate(&self) -> DataRate {
        DataRate::from_bits_per_sec_float(self.target_bitrate.round())
    }

    pub fn transmit_rate(&self) -> DataRate {
        self.transmit_rate.rate
    }

    pub fn media_rate(&self) -> DataRate {
        self.media_rate.rate
    }

    pub fn packets_transmitted(&self) -> u64 {
        self.packets_transmitted
    }

    pub fn bytes_transmitted(&self) -> DataSize {
        self.bytes_transmitted
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn oversize_frames(&self) -> u64 {
        self.oversize_frames
    }

    pub fn queue_delay_reductions(&self) -> u64 {
        self.queue_delay_reductions
    }

    /// Time until the pacer allows the next packet, zero if it does now.
    pub fn time_until_transmit(&self, now: Timestamp) -> TimeDelta {
        self.pacer.time_until_available(now)
    }

    pub fn on_transmit(&mut self, now: Timestamp, size: DataSize) {
        self.pacer.use_budget(now, size);
        self.transmit_rate.update(now, size);
        self.packets_transmitted += 1;
        self.bytes_transmitted += size;
    }

    /// Accounts encoder output. A frame ends with the marker packet.
    pub fn on_media_frame(&mut self, now: Timestamp, size: DataSize, is_marker: bool) {
        self.media_rate.update(now, size);
        self.current_frame += size;
        if !is_marker {
            return;
        }

        self.frames += 1;
        if let Some(last) = self.last_frame_time {
            let interval = now - last;
            if interval > TimeDelta::zero() {
                let budget = self.target_bitrate().bytes_per_sec_float() * interval.seconds_float();
                if self.current_frame.bytes_float() > Self::OVERSIZE_FRAME_FACTOR * budget {
                    self.oversize_frames += 1;
                    tracing::debug!(
                        ssrc = self.ssrc,
                        "Frame of {:?} exceeds the {:.0} bytes the target allows",
                        self.current_frame,
                        budget
                    );
                }
            }
        }
        self.last_frame_time = Some(now);
        self.current_frame = DataSize::zero();
    }

    /// Moves the target bitrate towards the allocated share of the window.
    pub fn update_target(
        &mut self,
        config: &ScreamTxConfig,
        now: Timestamp,
        allocation: DataRate,
        signal: CongestionSignal,
        beta: f64,
    ) {
        let dt = self
            .last_update
            .map_or(TimeDelta::zero(), |last| (now - last).max(TimeDelta::zero()));
        let allocation = allocation.bps_float();

        match signal {
            CongestionSignal::Reduction => {
                self.target_bitrate = (self.target_bitrate * beta).min(allocation);
            }
            CongestionSignal::Delay => {
                self.target_bitrate = self.target_bitrate.min(allocation);
            }
            CongestionSignal::Coalesced => {}
            CongestionSignal::None if self.has_frame_backlog() => {
                tracing::trace!(
                    ssrc = self.ssrc,
                    "Earlier frame still queued, holding target at {:.0} bps",
                    self.target_bitrate
                );
            }
            CongestionSignal::None => {
                if allocation > self.target_bitrate {
                    let step = config.ramp_up_speed.bps_float() * dt.seconds_float();
                    self.target_bitrate = allocation.min(self.target_bitrate + step);
                }
            }
        }

        let queue_delay = self.queue.delay(now);
        if queue_delay > config.max_rtp_queue_delay {
            self.queue_delay_reductions += 1;
            self.target_bitrate *= Self::QUEUE_DELAY_BACKOFF;
            tracing::debug!(
                ssrc = self.ssrc,
                "RTP queue delay {:?} above limit, target reduced to {:.0} bps",
                queue_delay,
                self.target_bitrate
            );
        }

        let (min, max) = (self.min_bitrate.bps_float(), self.max_bitrate.bps_float());
        if !self.target_bitrate.is_finite() {
            self.target_bitrate = min;
        }
        self.target_bitrate = self.target_bitrate.clamp(min, max);
        self.pacer.set_target_rate(self.pacing_rate(config));
        self.last_update = Some(now);
    }

    // Packets of an earlier frame are still queued behind the last complete one.
    fn has_frame_backlog(&self) -> bool {
        let last_frame = self.queue.size_of_last_frame();
        !last_frame.is_zero() && self.queue.bytes_in_queue() > last_frame
    }

    fn pacing_rate(&self, config: &ScreamTxConfig) -> DataRate {
        let rate = DataRate::from_bits_per_sec_float((self.target_bitrate * config.pacing_headroom).round());
        rate.max(config.min_pacing_rate)
    }
}

/// Shares `capacity` across streams in proportion to their priority, honoring
/// each stream's `[min, max]` range. Each entry is `(priority, min, max)`.
///
/// When the capacity does not cover the minimums every stream gets its minimum.
pub fn water_fill(capacity: DataRate, limits: &[(f64, DataRate, DataRate)]) -> Vec<DataRate> {
    let mut allocation: Vec<f64> = limits.iter().map(|(_, min, _)| min.bps_float()).collect();
    let capacity = if capacity.is_finite() {
        capacity.bps_float()
    } else {
        limits.iter().map(|(_, _, max)| max.bps_float()).sum()
    };

    let mut remaining = capacity - allocation.iter().sum::<f64>();
    let mut active: Vec<usize> = (0..limits.len())
        .filter(|&i| allocation[i] < limits[i].2.bps_float())
        .collect();

    while remaining > 1.0 && !active.is_empty() {
        let total_priority: f64 = active.iter().map(|&i| limits[i].0).sum();
        let mut given = 0.0;
        let mut saturated = Vec::new();

        for &i in &active {
            let headroom = limits[i].2.bps_float() - allocation[i];
            let share = remaining * limits[i].0 / total_priority;
            if share >= headroom {
                allocation[i] += headroom;
                given += headroom;
                saturated.push(i);
            } else {
                allocation[i] += share;
                given += share;
            }
        }

        remaining -= given;
        if saturated.is_empty() {
            break;
        }
        active.retain(|i| !saturated.contains(i));
    }

    allocation
        .into_iter()
        .map(|bps| DataRate::from_bits_per_sec_float(bps.round()))
        .collect()
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;
    use crate::rtp_queue::RtpQueueItem;

    fn kbps(value: i64) -> DataRate {
        DataRate::from_kilobits_per_sec(value)
    }

    fn stream(queue: Arc<RtpQueue>) -> Stream {
        Stream::new(
            &ScreamTxConfig::default(),
            queue,
            1,
            1.0,
            kbps(100),
            kbps(2000),
            kbps(500),
        )
    }

    #[test]
    fn water_fill_by_priority() {
        let allocation = water_fill(
            kbps(3000),
            &[(1.0, kbps(100), kbps(10_000)), (0.5, kbps(100), kbps(10_000))],
        );
        assert_relative_eq!(allocation[0].kbps_float(), 100.0 + 2800.0 * 2.0 / 3.0, epsilon = 0.01);
        assert_relative_eq!(allocation[1].kbps_float(), 100.0 + 2800.0 / 3.0, epsilon = 0.01);
    }

    #[test]
    fn water_fill_redistributes_capped_share() {
        let allocation = water_fill(
            kbps(3000),
            &[(1.0, kbps(100), kbps(500)), (1.0, kbps(100), kbps(10_000))],
        );
        assert_eq!(allocation[0], kbps(500));
        assert_eq!(allocation[1], kbps(2500));
    }

    #[test]
    fn water_fill_below_minimums() {
        let allocation = water_fill(
            kbps(100),
            &[(1.0, kbps(100), kbps(500)), (2.0, kbps(64), kbps(128))],
        );
        assert_eq!(allocation, vec![kbps(100), kbps(64)]);
    }

    #[test]
    fn water_fill_unbounded_capacity_gives_max() {
        let allocation = water_fill(
            DataRate::infinity(),
            &[(1.0, kbps(100), kbps(500)), (2.0, kbps(64), kbps(128))],
        );
        assert_eq!(allocation, vec![kbps(500), kbps(128)]);
    }

    #[test]
    fn registration_values_are_sanitized() {
        let stream = Stream::new(
            &ScreamTxConfig::default(),
            Arc::new(RtpQueue::new()),
            1,
            f64::NAN,
            kbps(300),
            kbps(200),
            kbps(1000),
        );
        assert_eq!(stream.priority(), 1.0);
        assert_eq!(stream.max_bitrate(), kbps(300));
        assert_eq!(stream.target_bitrate(), kbps(300));
    }

    #[test]
    fn ramps_up_at_limited_speed() {
        let config = ScreamTxConfig::default();
        let mut stream = stream(Arc::new(RtpQueue::new()));
        stream.update_target(&config, Timestamp::from_millis(0), kbps(1500), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(500));

        // 200 kbps per second over 500 ms.
        stream.update_target(&config, Timestamp::from_millis(500), kbps(1500), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(600));

        // Never beyond the allocation.
        stream.update_target(&config, Timestamp::from_millis(5500), kbps(900), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(900));
    }

    #[test]
    fn does_not_decrease_without_congestion() {
        let config = ScreamTxConfig::default();
        let mut stream = stream(Arc::new(RtpQueue::new()));
        stream.update_target(&config, Timestamp::from_millis(0), kbps(200), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(500));
        stream.update_target(&config, Timestamp::from_millis(10), kbps(200), CongestionSignal::Coalesced, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(500));
    }

    #[test]
    fn congestion_reduces_target_within_bounds() {
        let config = ScreamTxConfig::default();
        let mut stream = stream(Arc::new(RtpQueue::new()));
        stream.update_target(&config, Timestamp::from_millis(0), kbps(1500), CongestionSignal::Reduction, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(350));

        stream.update_target(&config, Timestamp::from_millis(10), kbps(250), CongestionSignal::Delay, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(250));

        for i in 0..20 {
            stream.update_target(&config, Timestamp::from_millis(20 + i), kbps(0), CongestionSignal::Reduction, 0.7);
        }
        assert_eq!(stream.target_bitrate(), kbps(100));
    }

    #[test]
    fn rtp_queue_delay_reduces_target() {
        let config = ScreamTxConfig::default();
        let queue = Arc::new(RtpQueue::new());
        queue.enqueue(RtpQueueItem::with_size(
            0,
            DataSize::from_bytes(1000),
            Timestamp::from_millis(0),
            true,
        ));
        let mut stream = stream(queue);
        stream.update_target(&config, Timestamp::from_millis(300), kbps(500), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(450));
        assert_eq!(stream.queue_delay_reductions(), 1);
    }

    #[test]
    fn queued_frame_backlog_holds_ramp_up() {
        let config = ScreamTxConfig::default();
        let queue = Arc::new(RtpQueue::new());
        let mut stream = stream(queue.clone());
        let frame = |seq: u16, at_ms: i64| {
            RtpQueueItem::with_size(seq, DataSize::from_bytes(1500), Timestamp::from_millis(at_ms), true)
        };

        stream.update_target(&config, Timestamp::from_millis(0), kbps(1500), CongestionSignal::None, 0.7);
        queue.enqueue(frame(0, 0));
        queue.enqueue(frame(1, 33));
        stream.update_target(&config, Timestamp::from_millis(50), kbps(1500), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(500));

        // Once only the latest frame is queued the ramp resumes.
        queue.dequeue_next().unwrap();
        stream.update_target(&config, Timestamp::from_millis(100), kbps(1500), CongestionSignal::None, 0.7);
        assert_eq!(stream.target_bitrate(), kbps(510));
    }

    #[test]
    fn pacing_follows_target() {
        let mut stream = stream(Arc::new(RtpQueue::new()));
        let now = Timestamp::from_millis(0);
        assert_eq!(stream.time_until_transmit(now), TimeDelta::zero());

        // 750 kbps pacing over 20 ms is 1875 bytes.
        stream.on_transmit(now, DataSize::from_bytes(1200));
        assert_eq!(stream.time_until_transmit(now), TimeDelta::zero());
        stream.on_transmit(now, DataSize::from_bytes(1200));
        assert!(stream.time_until_transmit(now) > TimeDelta::zero());
        assert_eq!(stream.packets_transmitted(), 2);
        assert_eq!(stream.bytes_transmitted(), DataSize::from_bytes(2400));
    }

    #[test]
    fn detects_oversize_frames() {
        let mut stream = stream(Arc::new(RtpQueue::new()));
        stream.on_media_frame(Timestamp::from_millis(0), DataSize::from_bytes(2000), true);

        // 500 kbps over 33 ms allows about 2 kB per frame.
        stream.on_media_frame(Timestamp::from_millis(33), DataSize::from_bytes(1000), false);
        stream.on_media_frame(Timestamp::from_millis(33), DataSize::from_bytes(1000), true);
        assert_eq!(stream.oversize_frames(), 0);

        stream.on_media_frame(Timestamp::from_millis(66), DataSize::from_bytes(9000), true);
        assert_eq!(stream.oversize_frames(), 1);
        assert_eq!(stream.frames(), 3);
    }

    #[test]
    fn media_rate_is_measured() {
        let mut stream = stream(Arc::new(RtpQueue::new()));
        for i in 0..=30 {
            stream.on_media_frame(Timestamp::from_millis(i * 20), DataSize::from_bytes(1250), true);
        }
        // 26 frames of 1250 bytes up to and including the one at 500 ms.
        assert_eq!(stream.media_rate(), DataRate::from_bytes_per_sec(65_000));
    }
}
