use std::collections::BTreeMap;

use crate::{
    api::{
        transport::EcnMarking,
        units::{DataSize, SequenceUnwrapper, Timestamp},
    },
    config::ScreamRxConfig,
    feedback::{ntp_short, FeedbackReport, PacketReport, StreamReport},
    Error, Result,
};

/// What the receiver needs to know about one arriving RTP packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtpArrival {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub size: DataSize,
    pub ecn: EcnMarking,
    pub is_marker: bool,
    pub rtp_timestamp: u32,
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    time: Timestamp,
    ecn: EcnMarking,
}

#[derive(Debug, Default)]
struct ReceiveStream {
    unwrapper: SequenceUnwrapper,
    highest: Option<i64>,
    arrivals: BTreeMap<i64, Arrival>,

    new_since_report: bool,
    packets_since_report: usize,
    bytes_since_report: DataSize,
    last_report: Option<Timestamp>,

    packets_received: u64,
    duplicates: u64,
    ce_marks: u64,
    frames: u64,
    last_rtp_timestamp: Option<u32>,
}

impl ReceiveStream {
    fn is_feedback_due(&self, now: Timestamp, config: &ScreamRxConfig) -> bool {
        if !self.new_since_report {
            return false;
        }
        self.packets_since_report >= config.feedback_packet_threshold
            || self.bytes_since_report >= config.feedback_bytes_threshold
            || self
                .last_report
                .map_or(true, |last| now - last >= config.feedback_interval)
    }

    fn report(&mut self, now: Timestamp, report_timestamp: u32, window: u16) -> Option<StreamReport> {
        let highest = self.highest?;
        let lowest = *self.arrivals.keys().next()?;
        let begin = (highest - window as i64 + 1).max(lowest);

        let reports = (begin..=highest)
            .map(|sequence_number| match self.arrivals.get(&sequence_number) {
                Some(arrival) => {
                    PacketReport::received(arrival.ecn, ntp_short(arrival.time), report_timestamp)
                }
                None => PacketReport::lost(),
            })
            .collect();

        self.new_since_report = false;
        self.packets_since_report = 0;
        self.bytes_since_report = DataSize::zero();
        self.last_report = Some(now);

        Some(StreamReport {
            media_ssrc: 0,
            begin_seq: begin as u16,
            reports,
        })
    }
}

/// Receiver side of the congestion controller.
///
/// Tracks arrivals per SSRC and turns them into RFC 8888 feedback reports for
/// the sender.
#[derive(Debug)]
pub struct ScreamRx {
    sender_ssrc: u32,
    config: ScreamRxConfig,
    streams: BTreeMap<u32, ReceiveStream>,
}

impl ScreamRx {
    /// `sender_ssrc` identifies this receiver in the reports it generates.
    pub fn new(sender_ssrc: u32, mut config: ScreamRxConfig) -> Self {
        config.validate();
        Self {
            sender_ssrc,
            config,
            streams: BTreeMap::new(),
        }
    }

    pub fn receive(&mut self, now: Timestamp, packet: &RtpArrival) -> Result<()> {
        if !self.streams.contains_key(&packet.ssrc) {
            if self.streams.len() >= self.config.max_streams {
                tracing::warn!(ssrc = packet.ssrc, "Too many streams, dropping arrival");
                return Err(Error::RegistryFull {
                    capacity: self.config.max_streams,
                });
            }
            tracing::info!(ssrc = packet.ssrc, "New incoming stream");
        }
        let stream = self.streams.entry(packet.ssrc).or_default();

        let sequence_number = stream.unwrapper.peek(packet.sequence_number);
        let highest = stream.highest.unwrap_or(sequence_number);
        let window = self.config.report_window as i64;

        if sequence_number <= highest - window {
            tracing::trace!(
                ssrc = packet.ssrc,
                sequence_number = packet.sequence_number,
                "Arrival too old to report"
            );
            return Ok(());
        }
        if stream.arrivals.contains_key(&sequence_number) {
            stream.duplicates += 1;
            return Ok(());
        }

        if sequence_number >= highest {
            stream.unwrapper.unwrap(packet.sequence_number);
            stream.highest = Some(sequence_number);
        }
        stream.arrivals.insert(
            sequence_number,
            Arrival {
                time: now,
                ecn: packet.ecn,
            },
        );
        let oldest_kept = stream.highest.unwrap_or(sequence_number) - window;
        stream.arrivals = stream.arrivals.split_off(&(oldest_kept + 1));

        stream.new_since_report = true;
        stream.packets_since_report += 1;
        stream.bytes_since_report += packet.size;
        stream.packets_received += 1;
        if packet.ecn.is_congestion_experienced() {
            stream.ce_marks += 1;
        }
        if packet.is_marker {
            stream.frames += 1;
        }
        if stream.highest == Some(sequence_number) {
            stream.last_rtp_timestamp = Some(packet.rtp_timestamp);
        }

        Ok(())
    }

    /// Whether any stream has collected enough new arrivals, or waited long
    /// enough, to justify a report.
    pub fn is_feedback_due(&self, now: Timestamp) -> bool {
        self.streams
            .values()
            .any(|stream| stream.is_feedback_due(now, &self.config))
    }

    /// Builds a report for one stream and clears its "new since last report" marker.
    pub fn get_feedback(&mut self, now: Timestamp, ssrc: u32) -> Result<FeedbackReport> {
        let report_timestamp = ntp_short(now);
        let window = self.config.report_window;

        let stream = self
            .streams
            .get_mut(&ssrc)
            .ok_or(Error::UnknownStream(ssrc))?;
        if !stream.new_since_report {
            return Err(Error::NothingToReport);
        }

        let mut block = stream
            .report(now, report_timestamp, window)
            .ok_or(Error::NothingToReport)?;
        block.media_ssrc = ssrc;

        Ok(FeedbackReport {
            sender_ssrc: self.sender_ssrc,
            report_timestamp,
            streams: vec![block],
        })
    }

    /// Builds one report covering every stream with new arrivals.
    pub fn get_feedback_all(&mut self, now: Timestamp) -> Result<FeedbackReport> {
        let report_timestamp = ntp_short(now);
        let window = self.config.report_window;

        let streams: Vec<StreamReport> = self
            .streams
            .iter_mut()
            .filter(|(_, stream)| stream.new_since_report)
            .filter_map(|(ssrc, stream)| {
                let mut block = stream.report(now, report_timestamp, window)?;
                block.media_ssrc = *ssrc;
                Some(block)
            })
            .collect();

        if streams.is_empty() {
            return Err(Error::NothingToReport);
        }

        Ok(FeedbackReport {
            sender_ssrc: self.sender_ssrc,
            report_timestamp,
            streams,
        })
    }

    pub fn packets_received(&self, ssrc: u32) -> Result<u64> {
        self.stream(ssrc).map(|stream| stream.packets_received)
    }

    pub fn duplicates(&self, ssrc: u32) -> Result<u64> {
        self.stream(ssrc).map(|stream| stream.duplicates)
    }

    pub fn ce_marks(&self, ssrc: u32) -> Result<u64> {
        self.stream(ssrc).map(|stream| stream.ce_marks)
    }

    pub fn frames(&self, ssrc: u32) -> Result<u64> {
        self.stream(ssrc).map(|stream| stream.frames)
    }

    /// RTP timestamp of the most recent arrival that advanced the stream.
    pub fn last_rtp_timestamp(&self, ssrc: u32) -> Result<Option<u32>> {
        self.stream(ssrc).map(|stream| stream.last_rtp_timestamp)
    }

    /// Stops tracking a stream.
    pub fn remove_stream(&mut self, ssrc: u32) -> Result<()> {
        self.streams
            .remove(&ssrc)
            .map(|_| ())
            .ok_or(Error::UnknownStream(ssrc))
    }

    fn stream(&self, ssrc: u32) -> Result<&ReceiveStream> {
        self.streams.get(&ssrc).ok_or(Error::UnknownStream(ssrc))
    }
}
