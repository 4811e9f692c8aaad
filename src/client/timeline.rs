// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;

use crate::Timestamp;

/// Creates [`Timestamp`]s (which don't wrap and can be converted to NPT aka
/// normal play time) from 32-bit (wrapping) RTP timestamps.
///
/// The first timestamp placed on the timeline becomes its start. Unstable,
/// exposed for benchmarks.
#[doc(hidden)]
#[derive(Debug)]
pub struct Timeline {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: Option<u32>,

    /// The furthest elapsed point reached, in clock rate units.
    high_water: i64,
}

impl Timeline {
    /// Creates a new timeline, erroring on a zero clock rate.
    pub fn new(clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Timeline {
            timestamp: 0,
            clock_rate,
            start: None,
            high_water: 0,
        })
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Advances to the given (wrapping) RTP timestamp.
    ///
    /// Differences of more than `i32::MAX` from the previous timestamp are
    /// taken as backward jumps.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = match self.start {
            Some(start) => start,
            None => {
                self.start = Some(rtp_timestamp);
                self.timestamp = i64::from(rtp_timestamp);
                rtp_timestamp
            }
        };
        let delta = (rtp_timestamp as i32).wrapping_sub(self.timestamp as i32);
        let timestamp = self
            .timestamp
            .checked_add(i64::from(delta))
            .ok_or_else(|| format!("timestamp {} + delta {} won't fit in i64!", self.timestamp, delta))?;
        let ts = Timestamp::new(timestamp, self.clock_rate, start).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} - start {} underflows i64!",
                self.timestamp, delta, start
            )
        })?;
        self.timestamp = timestamp;
        self.high_water = self.high_water.max(ts.elapsed());
        Ok(ts)
    }

    /// Returns the furthest point reached since the start, in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.high_water as f64 / f64::from(self.clock_rate.get())
    }

    /// Forgets the start so the next timestamp begins a new timeline.
    pub fn reset(&mut self) {
        self.start = None;
        self.timestamp = 0;
        self.high_water = 0;
    }
}
