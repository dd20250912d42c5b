use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
};

use crate::{
    api::{
        transport::{PacketResult, SentPacket, TransportPacketsFeedback},
        units::{unwrap_near, DataSize, TimeDelta, Timestamp},
    },
    feedback::{ntp_short, ntp_short_delta, FeedbackReport, StreamReport},
};

#[derive(Debug, Clone, Copy)]
struct TrackedPacket {
    sent: SentPacket,
    // Report timestamp of the first report that left this packet unacknowledged
    // behind acknowledged ones.
    suspect_since: Option<u32>,
}

#[derive(Debug, Default)]
struct StreamHistory {
    packets: BTreeMap<i64, TrackedPacket>,
    highest_sent: Option<i64>,
    highest_acked: Option<i64>,
}

impl StreamHistory {
    fn extend(&self, sequence_number: u16) -> i64 {
        match self.highest_sent {
            Some(highest) => unwrap_near(highest, sequence_number),
            None => sequence_number as i64,
        }
    }
}

/// Packets sent but not yet acknowledged or declared lost, per stream.
///
/// A gap only becomes a loss once a second report with a different report
/// timestamp still leaves it unacknowledged, or once it stays unacknowledged
/// for longer than the loss timeout while later packets are acknowledged.
#[derive(Debug)]
pub struct InFlightTracker {
    reorder_threshold: i64,
    streams: HashMap<u32, StreamHistory>,
    bytes_in_flight: i64,
    ignored_reports: u64,
}

impl InFlightTracker {
    const MIN_LOSS_TIMEOUT: TimeDelta = TimeDelta::from_millis(100);

    pub fn new(reorder_threshold: i64) -> Self {
        Self {
            reorder_threshold,
            streams: HashMap::new(),
            bytes_in_flight: 0,
            ignored_reports: 0,
        }
    }

    pub fn bytes_in_flight(&self) -> DataSize {
        DataSize::from_bytes(self.bytes_in_flight)
    }

    pub fn bytes_in_flight_for(&self, ssrc: u32) -> DataSize {
        let bytes = self.streams.get(&ssrc).map_or(0, |stream| {
            stream
                .packets
                .values()
                .map(|packet| packet.sent.size.bytes())
                .sum()
        });
        DataSize::from_bytes(bytes)
    }

    pub fn packets_in_flight(&self) -> usize {
        self.streams.values().map(|stream| stream.packets.len()).sum()
    }

    /// Per-packet feedback that did not match any packet in flight.
    pub fn ignored_reports(&self) -> u64 {
        self.ignored_reports
    }

    /// Records a transmitted packet and returns it with its extended sequence number.
    pub fn add(
        &mut self,
        ssrc: u32,
        send_time: Timestamp,
        size: DataSize,
        sequence_number: u16,
        is_marker: bool,
    ) -> SentPacket {
        let stream = self.streams.entry(ssrc).or_default();
        let extended = stream.extend(sequence_number);
        stream.highest_sent = Some(stream.highest_sent.map_or(extended, |h| h.max(extended)));

        if let Some(previous) = stream.packets.remove(&extended) {
            tracing::debug!(ssrc, sequence_number, "Packet recorded twice, replacing");
            self.bytes_in_flight -= previous.sent.size.bytes();
        }
        self.bytes_in_flight += size.bytes();

        let sent = SentPacket {
            ssrc,
            send_time,
            size,
            sequence_number: extended,
            is_marker,
            data_in_flight: DataSize::from_bytes(self.bytes_in_flight),
        };
        stream.packets.insert(
            extended,
            TrackedPacket {
                sent,
                suspect_since: None,
            },
        );
        sent
    }

    /// Forgets everything sent on a stream.
    pub fn remove_stream(&mut self, ssrc: u32) -> DataSize {
        let released: i64 = self.streams.remove(&ssrc).map_or(0, |stream| {
            stream
                .packets
                .values()
                .map(|packet| packet.sent.size.bytes())
                .sum()
        });
        self.bytes_in_flight -= released;
        DataSize::from_bytes(released)
    }

    /// Forgets every packet in flight, keeping the sequence number state.
    pub fn clear(&mut self) -> usize {
        let mut forgotten = 0;
        for stream in self.streams.values_mut() {
            forgotten += stream.packets.len();
            stream.packets.clear();
        }
        self.bytes_in_flight = 0;
        forgotten
    }

    /// Resolves a report against the packets in flight.
    ///
    /// Sequence numbers that were never sent, or that were already resolved by
    /// an earlier report, are ignored. Delivering the same report twice is a no-op
    /// for the second delivery. A block that covers no sent sequence number leaves
    /// its stream untouched, including the loss timeout.
    pub fn on_feedback(
        &mut self,
        now: Timestamp,
        report: &FeedbackReport,
        srtt: TimeDelta,
    ) -> TransportPacketsFeedback {
        let mut packet_feedbacks = Vec::new();
        let loss_timeout = (srtt * 2).max(Self::MIN_LOSS_TIMEOUT);

        for block in &report.streams {
            let Some(stream) = self.streams.get_mut(&block.media_ssrc) else {
                tracing::trace!(ssrc = block.media_ssrc, "Feedback for unknown stream");
                self.ignored_reports += block.reports.len() as u64;
                continue;
            };

            let Some(covered) = Self::covered_range(stream, block) else {
                tracing::trace!(
                    ssrc = block.media_ssrc,
                    begin_seq = block.begin_seq,
                    "Feedback for sequence numbers never sent"
                );
                self.ignored_reports += block.reports.len() as u64;
                continue;
            };

            let (results, ignored) = Self::apply_block(
                stream,
                block,
                covered,
                report.report_timestamp,
                self.reorder_threshold,
            );
            self.ignored_reports += ignored;
            packet_feedbacks.extend(results);
            packet_feedbacks.extend(Self::expire(stream, now, loss_timeout));
        }

        for result in &packet_feedbacks {
            self.bytes_in_flight -= result.sent_packet.size.bytes();
        }

        TransportPacketsFeedback {
            feedback_time: now,
            data_in_flight: DataSize::from_bytes(self.bytes_in_flight),
            packet_feedbacks,
        }
    }

    // Extended sequence numbers a block reports on, clipped to what was sent.
    fn covered_range(stream: &StreamHistory, block: &StreamReport) -> Option<Range<i64>> {
        let highest_sent = stream.highest_sent?;
        let begin = unwrap_near(highest_sent, block.begin_seq);
        let end = (begin + block.reports.len() as i64).min(highest_sent + 1);
        (begin < end).then_some(begin..end)
    }

    fn apply_block(
        stream: &mut StreamHistory,
        block: &StreamReport,
        covered: Range<i64>,
        report_timestamp: u32,
        reorder_threshold: i64,
    ) -> (Vec<PacketResult>, u64) {
        let mut results = Vec::new();
        let mut ignored = 0;

        for (offset, report) in block.reports.iter().enumerate() {
            let sequence_number = covered.start + offset as i64;
            let Some(packet) = stream.packets.get_mut(&sequence_number) else {
                ignored += 1;
                continue;
            };

            if !report.received {
                packet.suspect_since.get_or_insert(report_timestamp);
                continue;
            }

            let one_way_delay = report.arrival_time(report_timestamp).map(|arrival| {
                ntp_short_delta(arrival.wrapping_sub(ntp_short(packet.sent.send_time)) as i32)
            });
            results.push(PacketResult::received(packet.sent, one_way_delay, report.ecn));
            stream.packets.remove(&sequence_number);
            stream.highest_acked = Some(
                stream
                    .highest_acked
                    .map_or(sequence_number, |h| h.max(sequence_number)),
            );
        }

        if let Some(highest_acked) = stream.highest_acked {
            let limit = highest_acked - reorder_threshold;
            for (_, packet) in stream.packets.range_mut(..=limit) {
                packet.suspect_since.get_or_insert(report_timestamp);
            }
        }

        // Anything flagged by an earlier report, and still unacknowledged by one
        // that reaches past it, is lost.
        let confirmed: Vec<i64> = stream
            .packets
            .range(..covered.end)
            .filter(|(_, packet)| {
                packet
                    .suspect_since
                    .map_or(false, |since| since != report_timestamp)
            })
            .map(|(sequence_number, _)| *sequence_number)
            .collect();
        for sequence_number in confirmed {
            if let Some(packet) = stream.packets.remove(&sequence_number) {
                results.push(PacketResult::lost(packet.sent));
            }
        }

        (results, ignored)
    }

    fn expire(stream: &mut StreamHistory, now: Timestamp, loss_timeout: TimeDelta) -> Vec<PacketResult> {
        let Some(highest_acked) = stream.highest_acked else {
            return Vec::new();
        };

        let expired: Vec<i64> = stream
            .packets
            .range(..highest_acked)
            .filter(|(_, packet)| now - packet.sent.send_time > loss_timeout)
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        expired
            .into_iter()
            .filter_map(|sequence_number| stream.packets.remove(&sequence_number))
            .map(|packet| PacketResult::lost(packet.sent))
            .collect()
    }
}
