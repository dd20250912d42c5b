use crate::api::units::{DataSize, TimeDelta, Timestamp};

use super::EcnMarking;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentPacket {
    pub ssrc: u32,
    pub send_time: Timestamp,
    /// Size of the RTP packet.
    pub size: DataSize,
    /// RTP sequence number extended to 64 bits so it never wraps.
    pub sequence_number: i64,
    pub is_marker: bool,
    /// Data in flight including this packet, at the time it was sent.
    pub data_in_flight: DataSize,
}

impl Default for SentPacket {
    fn default() -> Self {
        Self {
            ssrc: 0,
            send_time: Timestamp::plus_infinity(),
            size: DataSize::zero(),
            sequence_number: 0,
            is_marker: false,
            data_in_flight: DataSize::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketResult {
    pub sent_packet: SentPacket,
    pub received: bool,
    /// Receiver arrival time minus sender send time. Includes the clock offset
    /// between the two hosts, so only differences between samples are meaningful.
    /// None when the packet was lost or the receiver could not time it.
    pub one_way_delay: Option<TimeDelta>,
    pub ecn: EcnMarking,
}

impl PacketResult {
    pub fn received(sent_packet: SentPacket, one_way_delay: Option<TimeDelta>, ecn: EcnMarking) -> Self {
        Self {
            sent_packet,
            received: true,
            one_way_delay,
            ecn,
        }
    }

    pub fn lost(sent_packet: SentPacket) -> Self {
        Self {
            sent_packet,
            received: false,
            one_way_delay: None,
            ecn: EcnMarking::NotEct,
        }
    }

    pub const fn is_received(&self) -> bool {
        self.received
    }
}

/// Outcome of one feedback report, resolved against the packets in flight.
#[derive(Debug, Clone, Default)]
pub struct TransportPacketsFeedback {
    pub feedback_time: Timestamp,
    // Data still in flight once this feedback is applied.
    pub data_in_flight: DataSize,
    pub packet_feedbacks: Vec<PacketResult>,
}

impl TransportPacketsFeedback {
    pub fn received_with_send_info(&self) -> impl Iterator<Item = &PacketResult> {
        self.packet_feedbacks.iter().filter(|fb| fb.is_received())
    }

    pub fn lost_with_send_info(&self) -> impl Iterator<Item = &PacketResult> {
        self.packet_feedbacks.iter().filter(|fb| !fb.is_received())
    }

    pub fn is_empty(&self) -> bool {
        self.packet_feedbacks.is_empty()
    }

    pub fn acked_size(&self) -> DataSize {
        self.received_with_send_info()
            .map(|fb| fb.sent_packet.size)
            .fold(DataSize::zero(), |acc, size| acc + size)
    }

    pub fn has_loss(&self) -> bool {
        self.lost_with_send_info().next().is_some()
    }

    pub fn has_congestion_experienced(&self) -> bool {
        self.received_with_send_info()
            .any(|fb| fb.ecn.is_congestion_experienced())
    }

    /// The smallest one-way delay among newly acknowledged packets.
    pub fn min_one_way_delay(&self) -> Option<TimeDelta> {
        self.received_with_send_info()
            .filter_map(|fb| fb.one_way_delay)
            .min()
    }

    /// The acknowledged packet that was sent last.
    pub fn last_sent_received(&self) -> Option<&PacketResult> {
        self.received_with_send_info()
            .max_by_key(|fb| fb.sent_packet.send_time)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sent(sequence_number: i64, send_ms: i64, size: i64) -> SentPacket {
        SentPacket {
            ssrc: 1,
            send_time: Timestamp::from_millis(send_ms),
            size: DataSize::from_bytes(size),
            sequence_number,
            ..Default::default()
        }
    }

    #[test]
    fn splits_received_and_lost() {
        let feedback = TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(100),
            data_in_flight: DataSize::zero(),
            packet_feedbacks: vec![
                PacketResult::received(
                    sent(1, 10, 1000),
                    Some(TimeDelta::from_millis(30)),
                    EcnMarking::Ect0,
                ),
                PacketResult::lost(sent(2, 11, 1000)),
                PacketResult::received(
                    sent(3, 12, 500),
                    Some(TimeDelta::from_millis(25)),
                    EcnMarking::Ce,
                ),
                PacketResult::received(sent(4, 13, 200), None, EcnMarking::NotEct),
            ],
        };

        assert_eq!(feedback.received_with_send_info().count(), 3);
        assert_eq!(feedback.lost_with_send_info().count(), 1);
        assert_eq!(feedback.acked_size(), DataSize::from_bytes(1700));
        assert!(feedback.has_loss());
        assert!(feedback.has_congestion_experienced());
        assert_eq!(feedback.min_one_way_delay(), Some(TimeDelta::from_millis(25)));
        assert_eq!(
            feedback.last_sent_received().map(|fb| fb.sent_packet.sequence_number),
            Some(4)
        );
    }

    #[test]
    fn empty_feedback() {
        let feedback = TransportPacketsFeedback::default();
        assert!(feedback.is_empty());
        assert!(!feedback.has_loss());
        assert_eq!(feedback.min_one_way_delay(), None);
        assert!(feedback.last_sent_received().is_none());
    }
}
