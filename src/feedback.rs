//! RFC 8888 congestion control feedback.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P| FMT=11  |   PT = 205    |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 SSRC of RTCP packet sender                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   SSRC of 1st RTP Stream                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          begin_seq            |          num_reports          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |R|ECN|  Arrival time offset    | ...                           .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! .                                                               .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   SSRC of nth RTP Stream                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! .                                                               .
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Report Timestamp (32 bits)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    api::{
        transport::EcnMarking,
        units::{TimeDelta, Timestamp},
    },
    rtcp::{Header, FORMAT_CCFB, TYPE_TRANSPORT_FEEDBACK},
    Error, Result,
};

/// Converts a local timestamp to the middle 32 bits of an NTP timestamp
/// (16.16 fixed point seconds). Wraps every 65536 seconds.
pub fn ntp_short(time: Timestamp) -> u32 {
    ((time.us() as i128 * 65_536) / 1_000_000) as u32
}

/// Converts a signed difference of two short NTP timestamps to a TimeDelta.
pub fn ntp_short_delta(delta: i32) -> TimeDelta {
    TimeDelta::from_micros((delta as i64 * 1_000_000) >> 16)
}

/// Arrival time offsets are in 1/1024 seconds, one unit is 64 short NTP units.
const ATO_TO_NTP_SHORT: u32 = 64;

/// Feedback about a single RTP sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketReport {
    pub received: bool,
    pub ecn: EcnMarking,
    // Report timestamp minus arrival time, in 1/1024 seconds.
    pub arrival_time_offset: u16,
}

impl PacketReport {
    pub const MAX_ATO: u16 = 0x1FFF;
    /// The offset exceeded the encodable range.
    pub const ATO_OVERRANGE: u16 = 0x1FFE;
    /// The arrival time is unknown or after the report timestamp.
    pub const ATO_UNAVAILABLE: u16 = 0x1FFF;

    pub const fn lost() -> Self {
        Self {
            received: false,
            ecn: EcnMarking::NotEct,
            arrival_time_offset: 0,
        }
    }

    /// Builds the report for a packet that arrived at `arrival` (short NTP) with
    /// the report stamped at `report_timestamp`.
    pub fn received(ecn: EcnMarking, arrival: u32, report_timestamp: u32) -> Self {
        let offset = report_timestamp.wrapping_sub(arrival);
        // Arrival after the report timestamp shows up as a huge wrapped offset.
        let arrival_time_offset = if offset > u32::MAX / 2 {
            Self::ATO_UNAVAILABLE
        } else {
            let ato = (offset + ATO_TO_NTP_SHORT / 2) / ATO_TO_NTP_SHORT;
            ato.min(Self::ATO_OVERRANGE as u32) as u16
        };

        Self {
            received: true,
            ecn,
            arrival_time_offset,
        }
    }

    /// Arrival time in short NTP units, if it can be recovered.
    pub fn arrival_time(&self, report_timestamp: u32) -> Option<u32> {
        if !self.received || self.arrival_time_offset >= Self::ATO_OVERRANGE {
            return None;
        }
        Some(report_timestamp.wrapping_sub(self.arrival_time_offset as u32 * ATO_TO_NTP_SHORT))
    }

    fn marshal(&self) -> u16 {
        if !self.received {
            return 0;
        }
        0x8000 | ((self.ecn.bits() as u16) << 13) | (self.arrival_time_offset & Self::MAX_ATO)
    }

    fn unmarshal(raw: u16) -> Self {
        Self {
            received: raw & 0x8000 != 0,
            ecn: EcnMarking::from_bits((raw >> 13) as u8),
            arrival_time_offset: raw & Self::MAX_ATO,
        }
    }
}

/// The per-SSRC block of a feedback report, covering `begin_seq` onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub media_ssrc: u32,
    pub begin_seq: u16,
    pub reports: Vec<PacketReport>,
}

impl StreamReport {
    pub const MAX_REPORTS: usize = 16384;

    pub fn end_seq(&self) -> Option<u16> {
        if self.reports.is_empty() {
            return None;
        }
        Some(self.begin_seq.wrapping_add(self.reports.len() as u16 - 1))
    }

    /// Highest sequence number reported as received.
    pub fn highest_acked(&self) -> Option<u16> {
        self.iter()
            .filter(|(_, report)| report.received)
            .map(|(seq, _)| seq)
            .last()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &PacketReport)> + '_ {
        self.reports
            .iter()
            .enumerate()
            .map(|(i, report)| (self.begin_seq.wrapping_add(i as u16), report))
    }

    pub fn received_count(&self) -> usize {
        self.reports.iter().filter(|report| report.received).count()
    }

    fn marshal_size(&self) -> usize {
        8 + (self.reports.len() + self.reports.len() % 2) * 2
    }
}

/// Congestion control feedback generated by [ScreamRx](crate::ScreamRx) and
/// consumed by [ScreamTx](crate::ScreamTx).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReport {
    // SSRC of the receiver generating the report.
    pub sender_ssrc: u32,
    // Short NTP time at which the report was generated, on the receiver clock.
    pub report_timestamp: u32,
    pub streams: Vec<StreamReport>,
}

impl FeedbackReport {
    /// Largest packet the 16-bit RTCP length field can describe.
    pub const MAX_SIZE: usize = (u16::MAX as usize + 1) * 4;

    pub fn stream(&self, media_ssrc: u32) -> Option<&StreamReport> {
        self.streams
            .iter()
            .find(|stream| stream.media_ssrc == media_ssrc)
    }

    /// Checks that the report is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.media_ssrc) {
                return Err(Error::MalformedFeedback(format!(
                    "duplicate block for ssrc {}",
                    stream.media_ssrc
                )));
            }
            if stream.reports.is_empty() || stream.reports.len() > StreamReport::MAX_REPORTS {
                return Err(Error::MalformedFeedback(format!(
                    "ssrc {} reports {} packets",
                    stream.media_ssrc,
                    stream.reports.len()
                )));
            }
            for (seq, report) in stream.iter() {
                if report.arrival_time_offset > PacketReport::MAX_ATO {
                    return Err(Error::MalformedFeedback(format!(
                        "ssrc {} seq {} arrival offset out of range",
                        stream.media_ssrc, seq
                    )));
                }
                if !report.received
                    && (report.arrival_time_offset != 0 || report.ecn != EcnMarking::NotEct)
                {
                    return Err(Error::MalformedFeedback(format!(
                        "ssrc {} seq {} is lost but carries arrival info",
                        stream.media_ssrc, seq
                    )));
                }
            }
        }

        let size = self.marshal_size();
        if size > Self::MAX_SIZE {
            return Err(Error::MalformedFeedback(format!(
                "{} bytes over {} stream blocks exceeds the RTCP length field",
                size,
                self.streams.len()
            )));
        }
        Ok(())
    }

    pub fn marshal_size(&self) -> usize {
        Header::LENGTH
            + 4
            + self
                .streams
                .iter()
                .map(StreamReport::marshal_size)
                .sum::<usize>()
            + 4
    }

    pub fn marshal(&self) -> Result<Bytes> {
        self.validate()?;

        let size = self.marshal_size();
        let mut buf = BytesMut::with_capacity(size);
        Header {
            padding: false,
            count: FORMAT_CCFB,
            packet_type: TYPE_TRANSPORT_FEEDBACK,
            length: (size / 4 - 1) as u16,
        }
        .marshal_to(&mut buf);

        buf.put_u32(self.sender_ssrc);
        for stream in &self.streams {
            buf.put_u32(stream.media_ssrc);
            buf.put_u16(stream.begin_seq);
            buf.put_u16(stream.reports.len() as u16);
            for report in &stream.reports {
                buf.put_u16(report.marshal());
            }
            if stream.reports.len() % 2 == 1 {
                buf.put_u16(0);
            }
        }
        buf.put_u32(self.report_timestamp);

        Ok(buf.freeze())
    }

    /// Parses a single congestion control feedback packet, header included.
    pub fn unmarshal<B: Buf>(raw: &mut B) -> Result<Self> {
        let header = Header::unmarshal(raw)?;
        if header.packet_type != TYPE_TRANSPORT_FEEDBACK || header.count != FORMAT_CCFB {
            return Err(Error::InvalidHeader);
        }

        let body_size = header.packet_size() - Header::LENGTH;
        if raw.remaining() < body_size {
            return Err(Error::PacketTooShort(raw.remaining()));
        }
        let mut body = raw.copy_to_bytes(body_size);
        if header.padding {
            let padding = *body.last().ok_or(Error::InvalidHeader)? as usize;
            if padding == 0 || padding > body.len() {
                return Err(Error::InvalidHeader);
            }
            body.truncate(body.len() - padding);
        }
        Self::unmarshal_body(&mut body)
    }

    /// Parses the packet body that follows the RTCP header, padding removed.
    pub(crate) fn unmarshal_body<B: Buf>(body: &mut B) -> Result<Self> {
        // Sender SSRC plus report timestamp.
        if body.remaining() < 8 {
            return Err(Error::PacketTooShort(body.remaining()));
        }

        let sender_ssrc = body.get_u32();
        let mut streams = Vec::new();

        while body.remaining() > 4 {
            if body.remaining() < 12 {
                return Err(Error::MalformedFeedback(format!(
                    "{} trailing bytes do not form a stream block",
                    body.remaining()
                )));
            }

            let media_ssrc = body.get_u32();
            let begin_seq = body.get_u16();
            let num_reports = body.get_u16() as usize;

            let metric_bytes = (num_reports + num_reports % 2) * 2;
            if body.remaining() < metric_bytes + 4 {
                return Err(Error::MalformedFeedback(format!(
                    "ssrc {} claims {} reports beyond the packet end",
                    media_ssrc, num_reports
                )));
            }

            let reports = (0..num_reports)
                .map(|_| PacketReport::unmarshal(body.get_u16()))
                .collect();
            if num_reports % 2 == 1 {
                body.advance(2);
            }

            streams.push(StreamReport {
                media_ssrc,
                begin_seq,
                reports,
            });
        }

        if body.remaining() != 4 {
            return Err(Error::MalformedFeedback(
                "missing report timestamp".to_string(),
            ));
        }
        let report_timestamp = body.get_u32();

        let report = Self {
            sender_ssrc,
            report_timestamp,
            streams,
        };
        report.validate()?;
        Ok(report)
    }
}
