// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP packets as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! Parsing is zero-copy over a received buffer; building covers the two
//! packet types a receiver sends: Receiver Reports and Source Descriptions.

use bytes::{BufMut, Bytes, BytesMut};

use crate::NtpTimestamp;

pub const SENDER_REPORT: u8 = 200;
pub const RECEIVER_REPORT: u8 = 201;
pub const SOURCE_DESCRIPTION: u8 = 202;

const COMMON_HEADER_LEN: usize = 4;
const REPORT_BLOCK_LEN: usize = 24;

/// Validates a compound packet as in [RFC 3550 appendix
/// A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2), updated
/// by [RFC 5506](https://datatracker.ietf.org/doc/html/rfc5506):
///
/// *   There is at least one RTCP packet within the compound packet.
/// *   All packets are RTCP version 2.
/// *   Non-final packets have no padding.
/// *   The packets' lengths add up to the compound packet's length.
pub fn validate_compound(raw: &[u8]) -> Result<(), String> {
    let (mut pkt, mut rest) = PacketRef::parse(raw)?;
    while !rest.is_empty() {
        if pkt.has_padding() {
            return Err("padding on non-final packet within RTCP compound packet".to_owned());
        }
        (pkt, rest) = PacketRef::parse(rest)?;
    }
    Ok(())
}

/// Iterates through the packets of a compound packet, stopping at the first
/// malformed one. Call [`validate_compound`] first to reject those up front.
pub fn packets(raw: &[u8]) -> impl Iterator<Item = PacketRef<'_>> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match PacketRef::parse(rest) {
            Ok((pkt, r)) => {
                rest = r;
                Some(pkt)
            }
            Err(_) => {
                rest = &[];
                None
            }
        }
    })
}

/// A payload type-specific accessor for a packet.
#[non_exhaustive]
pub enum TypedPacketRef<'a> {
    SenderReport(SenderReportRef<'a>),
    ReceiverReport(ReceiverReportRef<'a>),
}

/// A sender report, as defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
///
/// ```text
///         0                   1                   2                   3
///         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// header |V=2|P|    RC   |   PT=SR=200   |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         SSRC of sender                        |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// sender |              NTP timestamp, most significant word             |
/// info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |             NTP timestamp, least significant word             |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         RTP timestamp                         |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                     sender's packet count                     |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                      sender's octet count                     |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// report |                 SSRC_1 (SSRC of first source)                 |
/// block  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   1    :                               ...                             :
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
pub struct SenderReportRef<'a>(PacketRef<'a>);

impl<'a> SenderReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        const SENDER_INFO_LEN: usize = 20;
        let expected_len =
            8 + SENDER_INFO_LEN + usize::from(pkt.count()) * REPORT_BLOCK_LEN;
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP SR has invalid count={} with unpadded_byte_len={}",
                pkt.count(),
                pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        self.0.be_u32(4)
    }

    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        NtpTimestamp((u64::from(self.0.be_u32(8)) << 32) | u64::from(self.0.be_u32(12)))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.0.be_u32(16)
    }

    pub fn packet_count(&self) -> u32 {
        self.0.be_u32(20)
    }

    pub fn octet_count(&self) -> u32 {
        self.0.be_u32(24)
    }
}

impl<'a> std::ops::Deref for SenderReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A receiver report, as defined in
/// [RFC 3550 section 6.4.2](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.2).
///
/// ```text
///         0                   1                   2                   3
///         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// header |V=2|P|    RC   |   PT=RR=201   |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                     SSRC of packet sender                     |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// report |                 SSRC_1 (SSRC of first source)                 |
/// block  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   1    | fraction lost |       cumulative number of packets lost       |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |           extended highest sequence number received           |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                      interarrival jitter                      |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         last SR (LSR)                         |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                   delay since last SR (DLSR)                  |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
pub struct ReceiverReportRef<'a>(PacketRef<'a>);

impl<'a> ReceiverReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        let expected_len = 8 + usize::from(pkt.count()) * REPORT_BLOCK_LEN;
        if pkt.payload_end < expected_len {
            return Err(format!(
                "RTCP RR has invalid count={} with unpadded_byte_len={}",
                pkt.count(),
                pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    pub fn ssrc(&self) -> u32 {
        self.0.be_u32(4)
    }

    pub fn report_blocks(&self) -> impl Iterator<Item = ReportBlock> + '_ {
        (0..usize::from(self.0.count())).map(move |i| {
            let off = 8 + i * REPORT_BLOCK_LEN;
            let lost = self.0.be_u32(off + 4);
            ReportBlock {
                ssrc: self.0.be_u32(off),
                fraction_lost: (lost >> 24) as u8,
                // Sign-extend the 24-bit field.
                cumulative_lost: ((lost << 8) as i32) >> 8,
                extended_highest_seq: self.0.be_u32(off + 8),
                jitter: self.0.be_u32(off + 12),
                last_sr: self.0.be_u32(off + 16),
                delay_since_last_sr: self.0.be_u32(off + 20),
            }
        })
    }
}

impl<'a> std::ops::Deref for ReceiverReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A generic packet, not parsed as any particular payload type.
///
/// This only interprets the leading four bytes:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|         |   PT          |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    buf: &'a [u8],
    payload_end: usize,
}

impl<'a> PacketRef<'a> {
    /// Splits one packet off the front of `buf`, checking only the version,
    /// padding, and length.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(format!(
                "RTCP packets must be at least {} bytes; have only {}",
                COMMON_HEADER_LEN,
                buf.len()
            ));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {ver}"));
        }

        // "The length of this RTCP packet in 32-bit words minus one,
        // including the header and any padding."
        let raw_len = u16::from_be_bytes([buf[2], buf[3]]);
        let len = (usize::from(raw_len) + 1) * 4;
        if buf.len() < len {
            return Err(format!(
                "RTCP packet header has length {} bytes; have only {}",
                len,
                buf.len()
            ));
        }
        let (this, rest) = buf.split_at(len);
        let mut payload_end = len;
        if (this[0] & 0b0010_0000) != 0 {
            let padding_bytes = usize::from(this[len - 1]);
            if raw_len == 0 {
                return Err("RTCP packet has invalid combination of padding and len=0".to_owned());
            } else if padding_bytes == 0 || padding_bytes > len - COMMON_HEADER_LEN {
                return Err(format!(
                    "RTCP packet of len {len} states invalid {padding_bytes} padding bytes"
                ));
            }
            payload_end -= padding_bytes;
        }
        Ok((
            PacketRef {
                buf: this,
                payload_end,
            },
            rest,
        ))
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }

    /// Parses to a `TypedPacketRef` if the payload type is supported.
    pub fn as_typed(self) -> Result<Option<TypedPacketRef<'a>>, String> {
        match self.payload_type() {
            SENDER_REPORT => Ok(Some(TypedPacketRef::SenderReport(
                SenderReportRef::validate(self)?,
            ))),
            RECEIVER_REPORT => Ok(Some(TypedPacketRef::ReceiverReport(
                ReceiverReportRef::validate(self)?,
            ))),
            _ => Ok(None),
        }
    }

    /// Parses as a sender report, if the type matches.
    pub fn as_sender_report(self) -> Result<Option<SenderReportRef<'a>>, String> {
        if self.payload_type() == SENDER_REPORT {
            return Ok(Some(SenderReportRef::validate(self)?));
        }
        Ok(None)
    }

    #[inline]
    pub fn has_padding(&self) -> bool {
        (self.buf[0] & 0b0010_0000) != 0
    }

    /// Returns the low 5 bits of the first octet, which is typically a count
    /// or subtype.
    #[inline]
    pub fn count(&self) -> u8 {
        self.buf[0] & 0b0001_1111
    }

    /// Returns the full raw data, including headers.
    #[inline]
    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }

    /// Reads a big-endian `u32` at `off`, which the type-specific validation
    /// has already proven in bounds.
    fn be_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }
}

/// One reception report block within a Receiver (or Sender) Report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,

    /// 24-bit signed count; duplicates can make it negative.
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,

    /// In units of 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

fn put_header(buf: &mut BytesMut, count: u8, payload_type: u8, len: usize) {
    debug_assert!(len % 4 == 0 && len >= 4);
    buf.put_u8((2 << 6) | (count & 0b0001_1111));
    buf.put_u8(payload_type);
    buf.put_u16(((len / 4) - 1) as u16);
}

/// Appends a Receiver Report from `reporter_ssrc` with at most one report block.
pub fn put_receiver_report(buf: &mut BytesMut, reporter_ssrc: u32, block: Option<&ReportBlock>) {
    let count = u8::from(block.is_some());
    put_header(
        buf,
        count,
        RECEIVER_REPORT,
        8 + usize::from(count) * REPORT_BLOCK_LEN,
    );
    buf.put_u32(reporter_ssrc);
    if let Some(b) = block {
        buf.put_u32(b.ssrc);
        let lost = b.cumulative_lost.clamp(-0x80_0000, 0x7f_ffff) as u32 & 0x00ff_ffff;
        buf.put_u32((u32::from(b.fraction_lost) << 24) | lost);
        buf.put_u32(b.extended_highest_seq);
        buf.put_u32(b.jitter);
        buf.put_u32(b.last_sr);
        buf.put_u32(b.delay_since_last_sr);
    }
}

/// Appends a Source Description with a single chunk carrying a CNAME item.
pub fn put_sdes_cname(buf: &mut BytesMut, ssrc: u32, cname: &str) {
    const CNAME: u8 = 1;
    let cname = &cname.as_bytes()[..cname.len().min(255)];

    // ssrc, type, length, text, then at least one null octet padded to 32 bits.
    let chunk_len = (4 + 2 + cname.len() + 1 + 3) & !3;
    put_header(buf, 1, SOURCE_DESCRIPTION, COMMON_HEADER_LEN + chunk_len);
    buf.put_u32(ssrc);
    buf.put_u8(CNAME);
    buf.put_u8(cname.len() as u8);
    buf.put_slice(cname);
    buf.put_bytes(0, chunk_len - 6 - cname.len());
}

/// Builds the compound packet a receiver sends periodically: a Receiver
/// Report followed by a CNAME Source Description.
pub fn receiver_report_compound(
    reporter_ssrc: u32,
    block: Option<&ReportBlock>,
    cname: &str,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + cname.len());
    put_receiver_report(&mut buf, reporter_ssrc, block);
    put_sdes_cname(&mut buf, reporter_ssrc, cname);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dahua() {
        // Sender report and source description from a Dahua camera.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d\
                    \x81\xca\x00\x04\x66\x42\x6a\xe1\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        validate_compound(buf).unwrap();
        let mut it = packets(buf);
        let sr = it.next().unwrap().as_sender_report().unwrap().unwrap();
        assert_eq!(sr.ssrc(), 0x66426ae1);
        assert_eq!(sr.ntp_timestamp(), NtpTimestamp(0xe4362f99cccccccc));
        assert_eq!(sr.rtp_timestamp(), 0x852ef807);
        assert_eq!(sr.packet_count(), 0x002a4333);
        assert_eq!(it.next().unwrap().payload_type(), SOURCE_DESCRIPTION);
        assert!(it.next().is_none());
    }

    #[test]
    fn padding() {
        let buf = b"\xa7\x00\x00\x02asdf\x00\x00\x00\x04rest";
        let (pkt, rest) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.count(), 7);
        assert_eq!(&pkt.buf[4..pkt.payload_end], b"asdf");
        assert_eq!(b"rest", rest);

        // ...but not on a non-final packet of a compound.
        let mut compound = buf[..12].to_vec();
        compound.extend_from_slice(b"\x80\xc9\x00\x01\x00\x00\x00\x01");
        validate_compound(&compound).unwrap_err();
    }

    #[test]
    fn receiver_report_with_cname() {
        let block = ReportBlock {
            ssrc: 0x1234_5678,
            fraction_lost: 64,
            cumulative_lost: -3,
            extended_highest_seq: 0x0001_0005,
            jitter: 17,
            last_sr: 0xaabb_ccdd,
            delay_since_last_sr: 65536,
        };
        let raw = receiver_report_compound(0x1234_5679, Some(&block), "player");
        validate_compound(&raw).unwrap();
        let mut it = packets(&raw);
        let rr = match it.next().unwrap().as_typed().unwrap() {
            Some(TypedPacketRef::ReceiverReport(rr)) => rr,
            _ => panic!("expected receiver report"),
        };
        assert_eq!(rr.ssrc(), 0x1234_5679);
        assert_eq!(rr.report_blocks().collect::<Vec<_>>(), vec![block]);
        let sdes = it.next().unwrap();
        assert_eq!(sdes.payload_type(), SOURCE_DESCRIPTION);
        assert_eq!(sdes.count(), 1);
        assert_eq!(&sdes.raw()[8..16], b"\x01\x06player");
        assert_eq!(sdes.raw().len() % 4, 0);
        assert!(it.next().is_none());
    }
}
