use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{feedback::FeedbackReport, Error, Result};

pub const RTCP_VERSION: u8 = 2;

// RTPFB, RFC 4585
pub const TYPE_TRANSPORT_FEEDBACK: u8 = 205;
// PSFB, RFC 4585
pub const TYPE_PAYLOAD_SPECIFIC_FEEDBACK: u8 = 206;

// RFC 8888 congestion control feedback
pub const FORMAT_CCFB: u8 = 11;
// RFC 4585 picture loss indication
pub const FORMAT_PLI: u8 = 1;

/// The common RTCP header.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|   FMT   |      PT       |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,
    pub count: u8,
    pub packet_type: u8,
    // Packet length in 32-bit words minus one.
    pub length: u16,
}

impl Header {
    pub const LENGTH: usize = 4;

    /// Total packet length in bytes, header included.
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    pub fn marshal_to<B: BufMut>(&self, buf: &mut B) {
        let mut first = (RTCP_VERSION << 6) | (self.count & 0x1F);
        if self.padding {
            first |= 0x20;
        }
        buf.put_u8(first);
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
    }

    pub fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::LENGTH {
            return Err(Error::PacketTooShort(buf.remaining()));
        }

        let first = buf.get_u8();
        if first >> 6 != RTCP_VERSION {
            return Err(Error::InvalidHeader);
        }

        Ok(Self {
            padding: first & 0x20 != 0,
            count: first & 0x1F,
            packet_type: buf.get_u8(),
            length: buf.get_u16(),
        })
    }
}

/// Request from the receiver for a fresh key frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PictureLossIndication {
    const LENGTH: usize = Header::LENGTH + 8;

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LENGTH);
        Header {
            padding: false,
            count: FORMAT_PLI,
            packet_type: TYPE_PAYLOAD_SPECIFIC_FEEDBACK,
            length: (Self::LENGTH / 4 - 1) as u16,
        }
        .marshal_to(&mut buf);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.freeze()
    }

    fn unmarshal_body<B: Buf>(body: &mut B) -> Result<Self> {
        if body.remaining() < 8 {
            return Err(Error::PacketTooShort(body.remaining()));
        }
        Ok(Self {
            sender_ssrc: body.get_u32(),
            media_ssrc: body.get_u32(),
        })
    }
}

/// RTCP packets the congestion controller cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    CongestionControlFeedback(FeedbackReport),
    PictureLossIndication(PictureLossIndication),
    Unsupported { packet_type: u8, count: u8 },
}

/// Splits a compound RTCP datagram into its packets.
///
/// Packets of other types are returned as [RtcpPacket::Unsupported] so the
/// caller can tell an uninteresting datagram from a broken one.
pub fn unmarshal_compound(raw: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut rest = raw;

    while !rest.is_empty() {
        let header = Header::unmarshal(&mut &rest[..])?;
        let size = header.packet_size();
        if size > rest.len() {
            return Err(Error::PacketTooShort(rest.len()));
        }

        let (packet, tail) = rest.split_at(size);
        rest = tail;

        let mut body = &packet[Header::LENGTH..];
        if header.padding {
            let padding = *body.last().ok_or(Error::InvalidHeader)? as usize;
            if padding == 0 || padding > body.len() {
                return Err(Error::InvalidHeader);
            }
            body = &body[..body.len() - padding];
        }

        let parsed = match (header.packet_type, header.count) {
            (TYPE_TRANSPORT_FEEDBACK, FORMAT_CCFB) => {
                RtcpPacket::CongestionControlFeedback(FeedbackReport::unmarshal_body(&mut body)?)
            }
            (TYPE_PAYLOAD_SPECIFIC_FEEDBACK, FORMAT_PLI) => {
                RtcpPacket::PictureLossIndication(PictureLossIndication::unmarshal_body(&mut body)?)
            }
            (packet_type, count) => RtcpPacket::Unsupported { packet_type, count },
        };
        packets.push(parsed);
    }

    Ok(packets)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip_bits() {
        let header = Header {
            padding: true,
            count: FORMAT_CCFB,
            packet_type: TYPE_TRANSPORT_FEEDBACK,
            length: 7,
        };
        let mut buf = BytesMut::new();
        header.marshal_to(&mut buf);
        assert_eq!(&buf[..], &[0xAB, 205, 0, 7]);
        assert_eq!(header.packet_size(), 32);

        let parsed = Header::unmarshal(&mut &buf[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = [0x40u8, 205, 0, 0];
        assert_eq!(Header::unmarshal(&mut &raw[..]), Err(Error::InvalidHeader));
    }

    #[test]
    fn rejects_truncated_packet() {
        // Claims three words but carries only the header.
        let raw = [0x81u8, 206, 0, 2];
        assert_eq!(unmarshal_compound(&raw), Err(Error::PacketTooShort(4)));
    }

    #[test]
    fn picture_loss_indication_wire_format() {
        let pli = PictureLossIndication {
            sender_ssrc: 0x01020304,
            media_ssrc: 0x0A0B0C0D,
        };
        let raw = pli.marshal();
        assert_eq!(
            &raw[..],
            &[0x81, 206, 0, 2, 1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(
            unmarshal_compound(&raw).unwrap(),
            vec![RtcpPacket::PictureLossIndication(pli)]
        );
    }

    #[test]
    fn compound_skips_unsupported_packets() {
        // Receiver report with no report blocks, followed by a PLI.
        let mut raw = vec![0x80u8, 201, 0, 1, 0, 0, 0, 9];
        raw.extend_from_slice(
            &PictureLossIndication {
                sender_ssrc: 9,
                media_ssrc: 5,
            }
            .marshal(),
        );

        let packets = unmarshal_compound(&raw).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0],
            RtcpPacket::Unsupported {
                packet_type: 201,
                count: 0
            }
        );
        assert!(matches!(
            packets[1],
            RtcpPacket::PictureLossIndication(PictureLossIndication { media_ssrc: 5, .. })
        ));
    }
}
