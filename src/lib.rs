// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side RTSP session engine.
//!
//! The pieces, leaves first:
//!
//! *   [`splitter`]: protocol-agnostic incremental header+body framing.
//! *   [`rtp`] and [`rtcp`]: validated views of wire packets.
//! *   [`client`]: the signaling state machine, per-track RTCP statistics,
//!     UDP/interleaved transport handling, and the tokio-driven [`client::Player`].

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use log::trace;
use rand::Rng;
use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::num::NonZeroU32;
use std::ops::Range;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;
mod hex;

pub mod client;
pub mod rtcp;
pub mod rtp;
pub mod splitter;
mod tokio;

#[cfg(test)]
mod testutil;

pub use error::{Error, ErrorKind};
use error::ErrorInt;

/// A received RTSP message.
#[derive(Debug)]
struct ReceivedMessage {
    ctx: RtspMessageContext,
    msg: rtsp_types::Message<bytes::Bytes>,
}

/// An RTP timestamp extended to 64 bits and paired with its clock rate and
/// the track's starting point, so it can be expressed as seconds of normal
/// play time (NPT).
///
/// Timestamps that differ from the previous one by more than `i32::MAX` are
/// treated as backward jumps; see [`client::Timeline`].
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: u32,
}

impl Timestamp {
    /// Creates a new timestamp unless `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start)).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Returns elapsed time since the track's start in clock rate units.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    /// Returns elapsed time since the track's start in seconds.
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        (self.elapsed() as f64) / (self.clock_rate.get() as f64)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), npt {:.03}",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time in Network Time Protocol format: 32.32 fixed-point
/// seconds since 1900-01-01T00:00:00Z, as carried in RTCP Sender Reports.
///
/// Servers are free to send nonsense here; nothing checks it.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Returns the middle 32 bits, as used in the LSR field of reception reports.
    #[inline]
    pub fn middle_32(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Returns this timestamp offset by a (possibly negative) number of seconds.
    pub fn offset_secs(self, secs: f64) -> Self {
        let delta = (secs * 4_294_967_296.0).round() as i64;
        NtpTimestamp(self.0.wrapping_add_signed(delta))
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let date_time: chrono::DateTime<chrono::Local> = (*self).into();
        write!(f, "{}", date_time.format("%FT%T%.3f%:z"))
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl<TZ> TryFrom<chrono::DateTime<TZ>> for NtpTimestamp
where
    TZ: chrono::TimeZone,
{
    type Error = std::num::TryFromIntError;

    fn try_from(orig: chrono::DateTime<TZ>) -> Result<Self, Self::Error> {
        let since_unix = orig.with_timezone(&chrono::Utc) - chrono::DateTime::UNIX_EPOCH;
        let secs = u32::try_from(since_unix.num_seconds() + (UNIX_EPOCH.0 >> 32) as i64)?;
        let nanos = (since_unix - chrono::Duration::seconds(since_unix.num_seconds()))
            .num_nanoseconds()
            .unwrap_or(0);
        let frac = (nanos as f64 / 1e9 * f64::from(u32::MAX)).round() as u32;
        Ok(NtpTimestamp((u64::from(secs) << 32) + u64::from(frac)))
    }
}

impl<TZ> From<NtpTimestamp> for chrono::DateTime<TZ>
where
    TZ: chrono::TimeZone,
    chrono::DateTime<TZ>: From<chrono::DateTime<chrono::Utc>>,
{
    fn from(orig: NtpTimestamp) -> Self {
        let since_unix = orig.0.wrapping_sub(UNIX_EPOCH.0);
        let secs = (since_unix >> 32) as u32;
        let frac = (since_unix & 0xFFFF_FFFF) as u32;
        let nanos = (f64::from(frac) / f64::from(u32::MAX) * 1e9).round() as i64;
        let date_time = chrono::DateTime::UNIX_EPOCH
            + chrono::Duration::seconds(secs.into())
            + chrono::Duration::nanoseconds(nanos);
        date_time.into()
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the message was framed. This may lag the packet capture if
    /// the application is overloaded.
    received_wall: WallTime,
    received: std::time::Instant,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    pub fn received(&self) -> std::time::Instant {
        self.received
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Context for an RTP or RTCP packet, received either via RTSP interleaved data or UDP.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext(PacketContextInner);

impl PacketContext {
    #[doc(hidden)]
    pub fn dummy() -> PacketContext {
        Self(PacketContextInner::Dummy)
    }

    pub(crate) fn tcp(msg_ctx: RtspMessageContext) -> Self {
        Self(PacketContextInner::Tcp { msg_ctx })
    }

    pub(crate) fn udp(peer_addr: SocketAddr) -> Self {
        Self(PacketContextInner::Udp {
            peer_addr,
            received_wall: WallTime::now(),
        })
    }
}

#[derive(Copy, Clone, Debug)]
enum PacketContextInner {
    Tcp {
        msg_ctx: RtspMessageContext,
    },
    Udp {
        peer_addr: SocketAddr,
        received_wall: WallTime,
    },
    Dummy,
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            PacketContextInner::Udp {
                peer_addr,
                received_wall,
            } => write!(f, "{}@{}", peer_addr, received_wall),
            PacketContextInner::Tcp { msg_ctx } => Display::fmt(&msg_ctx, f),
            PacketContextInner::Dummy => write!(f, "dummy"),
        }
    }
}

/// A pair of local UDP sockets used for RTP and RTCP transmission.
///
/// The RTP port is always even, and the RTCP port is always the following (odd) integer.
struct UdpPair {
    rtp_port: u16,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
}

impl UdpPair {
    fn for_ip(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        const ALLOWED_RTP_RANGE: Range<u16> = 5000..65000; // same as ffmpeg's defaults.
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(ALLOWED_RTP_RANGE) & !0b1;
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("Try {}/{}: RTP addr {} in use", i, MAX_TRIES, rtp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("Try {}/{}: RTCP addr {} in use", i, MAX_TRIES, rtcp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            return Ok(Self {
                rtp_port,
                rtp_socket,
                rtcp_socket,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "Unable to find even/odd pair in {}:{}..{} after {} tries",
                ip_addr, ALLOWED_RTP_RANGE.start, ALLOWED_RTP_RANGE.end, MAX_TRIES
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const ORIG_STR: &str = "2024-02-17T21:14:34.013+01:00";

    #[test]
    fn ntp_display_roundtrip() {
        let orig: chrono::DateTime<chrono::Utc> = ORIG_STR.parse().unwrap();
        let ntp: NtpTimestamp = orig.try_into().unwrap();
        let parsed: chrono::DateTime<chrono::Utc> = format!("{ntp}").parse().unwrap();
        assert_eq!(orig, parsed);
        let back: chrono::DateTime<chrono::Utc> = ntp.into();
        assert_eq!(orig, back);
    }

    #[test]
    fn ntp_offset_and_middle() {
        let t = NtpTimestamp(0x0001_2345_6789_0000);
        assert_eq!(t.middle_32(), 0x2345_6789);
        assert_eq!(t.offset_secs(1.0), NtpTimestamp(0x0001_2346_6789_0000));
        assert_eq!(t.offset_secs(-0.5), NtpTimestamp(0x0001_2344_e789_0000));
    }

    #[test]
    fn timestamp_elapsed() {
        let t = Timestamp::new(90_000 * 3 + 100, NonZeroU32::new(90_000).unwrap(), 100).unwrap();
        assert_eq!(t.elapsed(), 270_000);
        assert_eq!(t.elapsed_secs(), 3.0);
        assert!(Timestamp::new(i64::MIN, NonZeroU32::new(1).unwrap(), 1).is_none());
    }

    #[test]
    fn local_udp_pair() {
        let pair = UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
        drop(pair.rtp_socket);
    }
}
