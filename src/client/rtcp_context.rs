// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track reception statistics, following
//! [RFC 3550 appendix A](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A).

use std::num::NonZeroU32;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, trace};

use crate::rtcp::{self, PacketRef, ReportBlock};
use crate::NtpTimestamp;

const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;
const RTP_SEQ_MOD: u32 = 1 << 16;

/// The most recent Sender Report on a track.
#[derive(Copy, Clone, Debug)]
struct LastSenderReport {
    rtp_timestamp: u32,
    ntp_timestamp: NtpTimestamp,
    received: Instant,
}

/// Sequence, loss, and jitter state for the source on one track, plus the
/// RTP↔NTP mapping from its Sender Reports.
///
/// Cleared rather than recreated when a session is torn down.
#[derive(Debug)]
pub(crate) struct RtcpContext {
    clock_rate: NonZeroU32,

    /// `None` until the first RTP packet.
    seq: Option<SeqState>,

    /// Transit time of the previous packet in clock rate units, for jitter.
    transit: Option<f64>,
    jitter: f64,

    /// Arrival clock origin; any fixed instant works since only transit
    /// differences matter.
    epoch: Option<Instant>,

    bytes: u64,
    expected_prior: u64,
    received_prior: u64,
    last_sr: Option<LastSenderReport>,
}

#[derive(Copy, Clone, Debug)]
struct SeqState {
    max_seq: u16,

    /// Shifted count of sequence number cycles.
    cycles: u32,
    base_seq: u32,

    /// Last "bad" sequence number plus one; two in a row resynchronize.
    bad_seq: u32,
    received: u64,
}

impl SeqState {
    fn new(seq: u16) -> Self {
        SeqState {
            max_seq: seq,
            cycles: 0,
            base_seq: u32::from(seq),
            bad_seq: RTP_SEQ_MOD + 1,
            received: 0,
        }
    }

    /// Updates for a newly received sequence number, returning false if the
    /// packet should not be counted.
    fn update(&mut self, seq: u16) -> bool {
        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
            }
            self.max_seq = seq;
        } else if u32::from(udelta) <= RTP_SEQ_MOD - u32::from(MAX_MISORDER) {
            if u32::from(seq) == self.bad_seq {
                // Two sequential packets after a large jump: the source
                // restarted without telling us.
                debug!("resynchronizing at seq {seq}");
                *self = SeqState::new(seq);
            } else {
                self.bad_seq = (u32::from(seq) + 1) & (RTP_SEQ_MOD - 1);
                return false;
            }
        }
        // else duplicate or reordered.
        self.received += 1;
        true
    }

    fn extended_max(&self) -> u64 {
        u64::from(self.cycles) + u64::from(self.max_seq)
    }
}

impl RtcpContext {
    pub(crate) fn new(clock_rate: NonZeroU32) -> Self {
        RtcpContext {
            clock_rate,
            seq: None,
            transit: None,
            jitter: 0.0,
            epoch: None,
            bytes: 0,
            expected_prior: 0,
            received_prior: 0,
            last_sr: None,
        }
    }

    /// Accounts for an RTP packet of `len` bytes arriving at `now`.
    pub(crate) fn on_rtp(&mut self, seq: u16, rtp_timestamp: u32, len: usize, now: Instant) {
        let counted = match &mut self.seq {
            None => {
                let mut s = SeqState::new(seq);
                s.received = 1;
                self.seq = Some(s);
                true
            }
            Some(s) => s.update(seq),
        };
        if !counted {
            trace!("not counting seq {seq} pending resync");
            return;
        }
        self.bytes += len as u64;

        // Interarrival jitter, A.8.
        let epoch = *self.epoch.get_or_insert(now);
        let arrival = now.duration_since(epoch).as_secs_f64() * f64::from(self.clock_rate.get());
        let transit = arrival - f64::from(rtp_timestamp);
        if let Some(prev) = self.transit {
            let d = (transit - prev).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    /// Accounts for one record of a received compound RTCP packet.
    pub(crate) fn on_rtcp(&mut self, pkt: &PacketRef<'_>, now: Instant) -> Result<(), String> {
        let Some(sr) = pkt.as_sender_report()? else {
            trace!("ignoring RTCP payload type {}", pkt.payload_type());
            return Ok(());
        };
        self.last_sr = Some(LastSenderReport {
            rtp_timestamp: sr.rtp_timestamp(),
            ntp_timestamp: sr.ntp_timestamp(),
            received: now,
        });
        Ok(())
    }

    /// Returns the number of packets expected from the sequence numbers seen.
    pub(crate) fn expected(&self) -> u64 {
        self.seq
            .map(|s| s.extended_max() + 1 - u64::from(s.base_seq))
            .unwrap_or(0)
    }

    /// Returns the number of packets received and counted.
    pub(crate) fn received(&self) -> u64 {
        self.seq.map(|s| s.received).unwrap_or(0)
    }

    /// Returns the number of packets lost; duplicates never make this negative.
    pub(crate) fn lost(&self) -> u64 {
        self.expected().saturating_sub(self.received())
    }

    /// Returns the jitter estimate in clock rate units.
    pub(crate) fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Estimates the sender's wall clock time for `rtp_timestamp` from the
    /// most recent Sender Report.
    pub(crate) fn ntp_for(&self, rtp_timestamp: u32) -> Option<NtpTimestamp> {
        let sr = self.last_sr?;
        let delta = rtp_timestamp.wrapping_sub(sr.rtp_timestamp) as i32;
        Some(
            sr.ntp_timestamp
                .offset_secs(f64::from(delta) / f64::from(self.clock_rate.get())),
        )
    }

    /// Builds a Receiver Report about `ssrc` from `reporter_ssrc`, followed by
    /// a CNAME Source Description, and starts a new reporting interval.
    pub(crate) fn create_report(
        &mut self,
        reporter_ssrc: u32,
        ssrc: u32,
        cname: &str,
        now: Instant,
    ) -> Bytes {
        let expected = self.expected();
        let received = self.received();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };
        let (last_sr, delay_since_last_sr) = match self.last_sr {
            None => (0, 0),
            Some(sr) => (
                sr.ntp_timestamp.middle_32(),
                (now.saturating_duration_since(sr.received).as_secs_f64() * 65536.0) as u32,
            ),
        };
        let block = ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: i32::try_from(expected as i64 - received as i64).unwrap_or(i32::MAX),
            extended_highest_seq: self.seq.map(|s| s.extended_max() as u32).unwrap_or(0),
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        };
        rtcp::receiver_report_compound(reporter_ssrc, Some(&block), cname)
    }

    pub(crate) fn clear(&mut self) {
        *self = RtcpContext::new(self.clock_rate);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ctx() -> RtcpContext {
        RtcpContext::new(NonZeroU32::new(90_000).unwrap())
    }

    #[test]
    fn loss_and_wrap() {
        let mut c = ctx();
        let now = Instant::now();
        assert_eq!(c.expected(), 0);
        for seq in [65_533u16, 65_534, 65_535, 1, 2] {
            c.on_rtp(seq, 0, 100, now);
        }
        // 0 is missing.
        assert_eq!(c.expected(), 6);
        assert_eq!(c.received(), 5);
        assert_eq!(c.lost(), 1);

        // A duplicate is counted as received, but loss doesn't go negative.
        c.on_rtp(2, 0, 100, now);
        c.on_rtp(0, 0, 100, now);
        assert_eq!(c.lost(), 0);
    }

    #[test]
    fn resync_after_jump() {
        let mut c = ctx();
        let now = Instant::now();
        c.on_rtp(10, 0, 100, now);
        c.on_rtp(20_000, 0, 100, now);
        assert_eq!(c.received(), 1);
        c.on_rtp(20_001, 0, 100, now);
        assert_eq!(c.expected(), 1);
        assert_eq!(c.received(), 1);
        c.on_rtp(20_002, 0, 100, now);
        assert_eq!(c.expected(), 2);
    }

    #[test]
    fn jitter_from_uneven_arrival() {
        let mut c = ctx();
        let t0 = Instant::now();
        c.on_rtp(1, 0, 100, t0);
        c.on_rtp(2, 3_000, 100, t0 + Duration::from_millis(33));
        assert!(c.jitter() > 0.0);
        let before = c.jitter();
        c.on_rtp(3, 6_000, 100, t0 + Duration::from_millis(100));
        assert!(c.jitter() > before);
    }

    #[test]
    fn sender_report_mapping_and_report() {
        let mut c = ctx();
        let t0 = Instant::now();
        let sr = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                   \xe4\x36\x2f\x99\x80\x00\x00\x00\
                   \x00\x01\x5f\x90\x00\x00\x00\x01\
                   \x00\x00\x00\x64";
        let (pkt, _) = PacketRef::parse(sr).unwrap();
        c.on_rtcp(&pkt, t0).unwrap();
        let ntp = c.ntp_for(90_000 + 180_000).unwrap();
        assert_eq!(ntp, NtpTimestamp(0xe436_2f9b_8000_0000));

        for seq in [1u16, 2, 4] {
            c.on_rtp(seq, 90_000, 100, t0);
        }
        let raw = c.create_report(0x6642_6ae2, 0x6642_6ae1, "player", t0 + Duration::from_secs(1));
        let pkt = crate::rtcp::packets(&raw).next().unwrap();
        let rr = match pkt.as_typed().unwrap() {
            Some(crate::rtcp::TypedPacketRef::ReceiverReport(rr)) => rr,
            _ => panic!("expected receiver report"),
        };
        assert_eq!(rr.ssrc(), 0x6642_6ae2);
        let block = rr.report_blocks().next().unwrap();
        assert_eq!(block.ssrc, 0x6642_6ae1);
        assert_eq!(block.cumulative_lost, 1);
        assert_eq!(block.fraction_lost, 64);
        assert_eq!(block.extended_highest_seq, 4);
        assert_eq!(block.last_sr, 0x2f99_8000);
        assert_eq!(block.delay_since_last_sr, 65536);

        // The next interval starts fresh.
        let raw = c.create_report(1, 2, "player", t0);
        let pkt = crate::rtcp::packets(&raw).next().unwrap();
        let Some(crate::rtcp::TypedPacketRef::ReceiverReport(rr)) = pkt.as_typed().unwrap() else {
            panic!("expected receiver report");
        };
        assert_eq!(rr.report_blocks().next().unwrap().fraction_lost, 0);

        c.clear();
        assert_eq!(c.expected(), 0);
        assert!(c.ntp_for(0).is_none());
    }
}
