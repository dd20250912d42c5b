mod in_flight;
mod pacing;
mod statistics;
mod stream;
mod window;

use std::{collections::BTreeMap, sync::Arc};

pub use in_flight::InFlightTracker;
pub use pacing::IntervalBudget;
pub use statistics::{Statistics, StreamStatistics};
pub use stream::water_fill;
pub use window::{CongestionSignal, WindowState};

use self::{stream::Stream, window::CongestionWindow};
use crate::{
    api::units::{DataRate, DataSize, TimeDelta, Timestamp},
    config::ScreamTxConfig,
    feedback::FeedbackReport,
    rtcp::{self, PictureLossIndication, RtcpPacket},
    rtp_queue::RtpQueue,
    Error, Result,
};

/// Sender side of the congestion controller.
///
/// One congestion window is shared by every registered stream. Feedback moves
/// the window, and the window is split across streams by priority to produce
/// each stream's target bitrate. Transmission is gated by the window and by a
/// per-stream pacer.
#[derive(Debug)]
pub struct ScreamTx {
    config: ScreamTxConfig,
    window: CongestionWindow,
    in_flight: InFlightTracker,
    streams: BTreeMap<u32, Stream>,
    malformed_reports: u64,
}

impl ScreamTx {
    pub fn new(mut config: ScreamTxConfig) -> Self {
        config.validate();
        Self {
            window: CongestionWindow::new(&config),
            in_flight: InFlightTracker::new(config.reorder_threshold),
            streams: BTreeMap::new(),
            malformed_reports: 0,
            config,
        }
    }

    pub fn config(&self) -> &ScreamTxConfig {
        &self.config
    }

    /// Adds a stream fed from `queue`. The start bitrate is clamped to `[min, max]`.
    pub fn register_stream(
        &mut self,
        queue: Arc<RtpQueue>,
        ssrc: u32,
        priority: f64,
        min_bitrate: DataRate,
        max_bitrate: DataRate,
        start_bitrate: DataRate,
    ) -> Result<()> {
        if self.streams.contains_key(&ssrc) {
            return Err(Error::DuplicateRegistration(ssrc));
        }
        if self.streams.len() >= self.config.max_streams {
            return Err(Error::RegistryFull {
                capacity: self.config.max_streams,
            });
        }

        let stream = Stream::new(
            &self.config,
            queue,
            ssrc,
            priority,
            min_bitrate,
            max_bitrate,
            start_bitrate,
        );
        tracing::info!(
            ssrc,
            priority = stream.priority(),
            "Registered stream, target {:?} within [{:?}, {:?}]",
            stream.target_bitrate(),
            stream.min_bitrate(),
            stream.max_bitrate()
        );
        self.streams.insert(ssrc, stream);
        Ok(())
    }

    /// Removes a stream and releases its bytes in flight. Returns the queue
    /// that was registered with it.
    pub fn deregister_stream(&mut self, ssrc: u32) -> Result<Arc<RtpQueue>> {
        let stream = self.streams.remove(&ssrc).ok_or(Error::UnknownStream(ssrc))?;
        let released = self.in_flight.remove_stream(ssrc);
        tracing::info!(ssrc, "Deregistered stream, released {:?} in flight", released);
        Ok(stream.queue().clone())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Accounts a frame handed to the stream's queue by the encoder.
    pub fn new_media_frame(
        &mut self,
        now: Timestamp,
        ssrc: u32,
        size: DataSize,
        is_marker: bool,
    ) -> Result<()> {
        self.stream_mut(ssrc)?.on_media_frame(now, size, is_marker);
        Ok(())
    }

    /// How long to wait before the next packet of `ssrc` may be sent, zero
    /// meaning now. Has no side effects, so it may be polled.
    pub fn is_ok_to_transmit(&self, now: Timestamp, ssrc: u32) -> Result<TimeDelta> {
        let stream = self.stream(ssrc)?;
        let size = stream.queue().size_of_next_item().ok_or(Error::QueueEmpty)?;
        let bytes_in_flight = self.in_flight.bytes_in_flight();

        // The window is reset on the next transmission.
        if self.window.is_feedback_timed_out(now, bytes_in_flight) {
            return Ok(TimeDelta::zero());
        }
        if !self.window.can_transmit(bytes_in_flight, size) {
            return Ok(self.window.retry_hint());
        }
        Ok(stream.time_until_transmit(now))
    }

    /// Records a packet that was just sent. Returns the time until the stream's
    /// pacer allows the next one.
    pub fn add_transmitted(
        &mut self,
        now: Timestamp,
        ssrc: u32,
        size: DataSize,
        sequence_number: u16,
        is_marker: bool,
    ) -> Result<TimeDelta> {
        let stream = self
            .streams
            .get_mut(&ssrc)
            .ok_or(Error::UnknownStream(ssrc))?;

        if self
            .window
            .check_feedback_timeout(now, self.in_flight.bytes_in_flight())
        {
            let forgotten = self.in_flight.clear();
            tracing::debug!("Forgot {} packets in flight after feedback timeout", forgotten);
        }

        let sent = self
            .in_flight
            .add(ssrc, now, size, sequence_number, is_marker);
        self.window.on_transmit(now, size, sent.data_in_flight);
        stream.on_transmit(now, size);

        Ok(stream.time_until_transmit(now))
    }

    /// Applies a feedback report to the window and recomputes every target bitrate.
    ///
    /// A report that fails validation is counted and dropped without touching
    /// any state.
    pub fn incoming_feedback(&mut self, now: Timestamp, report: &FeedbackReport) -> Result<()> {
        if let Err(err) = report.validate() {
            self.malformed_reports += 1;
            tracing::warn!(sender_ssrc = report.sender_ssrc, "Discarding feedback: {}", err);
            return Err(err);
        }

        let feedback = self.in_flight.on_feedback(now, report, self.window.srtt());
        if feedback.is_empty() {
            tracing::trace!("Feedback carried nothing new");
            return Ok(());
        }

        let signal = self.window.on_feedback(&feedback, self.max_rate());
        let beta = if feedback.has_loss() {
            self.config.loss_beta
        } else {
            self.config.ecn_beta
        };

        let limits: Vec<_> = self
            .streams
            .values()
            .map(|stream| (stream.priority(), stream.min_bitrate(), stream.max_bitrate()))
            .collect();
        let allocation = water_fill(self.window.allowed_rate(), &limits);
        for (stream, share) in self.streams.values_mut().zip(allocation) {
            stream.update_target(&self.config, now, share, signal, beta);
        }

        tracing::trace!(
            ?signal,
            state = %self.window.state(),
            "cwnd {:?}, in flight {:?}, queue delay {:?}",
            self.window.cwnd(),
            feedback.data_in_flight,
            self.window.queue_delay()
        );
        Ok(())
    }

    /// Parses a compound RTCP buffer, applies every congestion control report in
    /// it and returns the picture loss indications it carried.
    pub fn incoming_feedback_buf(
        &mut self,
        now: Timestamp,
        buf: &[u8],
    ) -> Result<Vec<PictureLossIndication>> {
        let packets = match rtcp::unmarshal_compound(buf) {
            Ok(packets) => packets,
            Err(err) => {
                self.malformed_reports += 1;
                tracing::warn!("Discarding RTCP datagram of {} bytes: {}", buf.len(), err);
                return Err(Error::MalformedFeedback(err.to_string()));
            }
        };

        let mut indications = Vec::new();
        for packet in packets {
            match packet {
                RtcpPacket::CongestionControlFeedback(report) => {
                    self.incoming_feedback(now, &report)?;
                }
                RtcpPacket::PictureLossIndication(pli) => indications.push(pli),
                RtcpPacket::Unsupported { packet_type, count } => {
                    tracing::trace!(packet_type, count, "Skipping RTCP packet");
                }
            }
        }
        Ok(indications)
    }

    /// Most recent target bitrate of a stream. While feedback has timed out the
    /// minimum bitrate is reported.
    pub fn target_bitrate(&self, now: Timestamp, ssrc: u32) -> Result<DataRate> {
        let stream = self.stream(ssrc)?;
        if self
            .window
            .is_feedback_timed_out(now, self.in_flight.bytes_in_flight())
        {
            return Ok(stream.min_bitrate());
        }
        Ok(stream.target_bitrate())
    }

    pub fn statistics(&self, now: Timestamp) -> Statistics {
        let streams = self
            .streams
            .values()
            .map(|stream| {
                let queue = stream.queue();
                StreamStatistics {
                    ssrc: stream.ssrc(),
                    priority: stream.priority(),
                    target_bitrate: stream.target_bitrate(),
                    min_bitrate: stream.min_bitrate(),
                    max_bitrate: stream.max_bitrate(),
                    transmit_rate: stream.transmit_rate(),
                    media_rate: stream.media_rate(),
                    bytes_in_flight: self.in_flight.bytes_in_flight_for(stream.ssrc()),
                    bytes_in_queue: queue.bytes_in_queue(),
                    packets_in_queue: queue.size_of_queue(),
                    rtp_queue_delay: queue.delay(now),
                    packets_transmitted: stream.packets_transmitted(),
                    bytes_transmitted: stream.bytes_transmitted(),
                    frames: stream.frames(),
                    oversize_frames: stream.oversize_frames(),
                    queue_delay_reductions: stream.queue_delay_reductions(),
                }
            })
            .collect();

        Statistics {
            time: now,
            state: self.window.state(),
            cwnd: self.window.cwnd(),
            bytes_in_flight: self.in_flight.bytes_in_flight(),
            allowed_rate: self.window.allowed_rate(),
            queue_delay: self.window.queue_delay(),
            srtt: self.window.srtt(),
            loss_rate: self.window.loss_rate(),
            loss_events: self.window.loss_events(),
            ecn_events: self.window.ecn_events(),
            window_reductions: self.window.window_reductions(),
            coalesced_events: self.window.coalesced_events(),
            malformed_reports: self.malformed_reports,
            ignored_feedback: self.in_flight.ignored_reports(),
            streams,
        }
    }

    pub fn cwnd(&self) -> DataSize {
        self.window.cwnd()
    }

    pub fn bytes_in_flight(&self) -> DataSize {
        self.in_flight.bytes_in_flight()
    }

    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.packets_in_flight()
    }

    pub fn state(&self) -> WindowState {
        self.window.state()
    }

    pub fn srtt(&self) -> TimeDelta {
        self.window.srtt()
    }

    fn stream(&self, ssrc: u32) -> Result<&Stream> {
        self.streams.get(&ssrc).ok_or(Error::UnknownStream(ssrc))
    }

    fn stream_mut(&mut self, ssrc: u32) -> Result<&mut Stream> {
        self.streams.get_mut(&ssrc).ok_or(Error::UnknownStream(ssrc))
    }

    // Sum of the maximum bitrates, the most the window could ever be asked to carry.
    fn max_rate(&self) -> DataRate {
        self.streams
            .values()
            .fold(DataRate::zero(), |acc, stream| acc + stream.max_bitrate())
    }
}
