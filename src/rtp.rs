// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packets as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::ops::Range;

use bytes::{Buf, Bytes};

use crate::{NtpTimestamp, PacketContext, Timestamp};

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// A validated RTP packet, without any session-specific interpretation.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub(crate) struct RawPacket(pub Bytes);

#[derive(Debug)]
#[doc(hidden)]
pub struct RawPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range.
    pub fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        match Self::payload_range(&data) {
            Ok(range) => Ok((Self(data), range)),
            Err(reason) => Err(RawPacketError { reason, data }),
        }
    }

    fn payload_range(data: &[u8]) -> Result<Range<u16>, &'static str> {
        // Interleaved data and UDP datagrams both cap packets at 64 KiB.
        let len = u16::try_from(data.len()).map_err(|_| "too long")?;
        if len < MIN_HEADER_LEN {
            return Err("too short");
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err("must be version 2");
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_end = MIN_HEADER_LEN + 4 * u16::from(data[0] & 0b0000_1111);
        let start = if has_extension {
            let ext = usize::from(csrc_end);
            if data.len() < ext + 4 {
                return Err("extension is after end of packet");
            }
            // The extension length counts 32-bit words after the 4-byte extension header.
            let words = u16::from_be_bytes([data[ext + 2], data[ext + 3]]);
            words
                .checked_mul(4)
                .and_then(|b| b.checked_add(csrc_end + 4))
                .ok_or("extension extends beyond maximum packet size")?
        } else {
            csrc_end
        };
        if len < start {
            return Err("payload start is after end of packet");
        }
        let end = if has_padding {
            let padding = u16::from(data[data.len() - 1]);
            if len == start {
                return Err("missing padding");
            } else if padding == 0 {
                return Err("invalid padding length 0");
            }
            match len.checked_sub(padding) {
                Some(e) if e >= start => e,
                _ => return Err("bad padding"),
            }
        } else {
            len
        };
        Ok(start..end)
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

/// Builds a minimal RTP packet. Testing API; exposed for benchmarks.
#[doc(hidden)]
pub struct RawPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl RawPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(self, payload: P) -> Result<Bytes, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        u16::try_from(data.len()).map_err(|_| "payload too long")?;
        Ok(data)
    }
}

/// An RTP packet received on one of the session's tracks.
pub struct ReceivedPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) track: usize,
    pub(crate) timestamp: Timestamp,
    pub(crate) ntp_timestamp: Option<NtpTimestamp>,
    pub(crate) raw: RawPacket,
    pub(crate) payload_range: Range<u16>,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("ctx", &self.ctx)
            .field("track", &self.track)
            .field("timestamp", &self.timestamp)
            .field("ntp_timestamp", &self.ntp_timestamp)
            .field("ssrc", &self.raw.ssrc())
            .field("sequence_number", &self.raw.sequence_number())
            .field("mark", &self.raw.mark())
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

impl ReceivedPacket {
    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    /// Index of the track within the session, in `SETUP` order.
    #[inline]
    pub fn track(&self) -> usize {
        self.track
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the sender's wall clock time for this packet, estimated from
    /// the most recent RTCP Sender Report on the track, if any.
    #[inline]
    pub fn ntp_timestamp(&self) -> Option<NtpTimestamp> {
        self.ntp_timestamp
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.raw.mark()
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.raw.payload_type()
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.raw.ssrc()
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.raw.sequence_number()
    }

    /// Returns the raw bytes, including the RTP headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw.0[..]
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw.0[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    /// Consumes the packet, returning the payload without copying.
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw.0;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_validate() {
        let data = RawPacketBuilder {
            sequence_number: 0x1234,
            timestamp: 141_000,
            payload_type: 96,
            ssrc: 0xdcc4a0d8,
            mark: true,
        }
        .build(*b"foo")
        .unwrap();
        let (pkt, range) = RawPacket::new(data).unwrap();
        assert_eq!(range, 12..15);
        assert!(pkt.mark());
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.timestamp(), 141_000);
        assert_eq!(pkt.ssrc(), 0xdcc4a0d8);
    }

    #[test]
    fn extension_and_padding() {
        // X bit, one extension word, then "ab" and two bytes of padding.
        let data = Bytes::from_static(
            b"\xb0\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\
              \xbe\xde\x00\x01\x11\x22\x33\x44ab\x00\x02",
        );
        let (pkt, range) = RawPacket::new(data).unwrap();
        assert_eq!(range, 20..22);
        assert_eq!(&pkt.0[20..22], b"ab");
    }

    #[test]
    fn rejects_malformed() {
        for (data, reason) in [
            (&b"\x80\x60\x00\x01"[..], "too short"),
            (&b"\x40\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03"[..], "must be version 2"),
            (
                &b"\xa0\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\x00"[..],
                "invalid padding length 0",
            ),
            (
                &b"\x90\x60\x00\x01\x00\x00\x00\x02\x00\x00\x00\x03\xbe\xde"[..],
                "extension is after end of packet",
            ),
        ] {
            let e = RawPacket::new(Bytes::copy_from_slice(data)).err().unwrap();
            assert_eq!(e.reason, reason);
        }
    }
}
