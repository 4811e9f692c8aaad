// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracks RTSP interleaved channel->track assignments.

use std::num::NonZeroU8;

use log::warn;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelType {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChannelMapping {
    pub(crate) track_i: usize,
    pub(crate) channel_type: ChannelType,
}

/// Mapping of the 256 possible RTSP interleaved channels to track indices and
/// RTP/RTCP.
///
/// Even channels carry RTP and their odd successors carry RTCP for the same
/// track. [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12)
/// says `interleaved=n` also assigns `n+1`; a server insisting on an odd `n`
/// isn't supported.
#[derive(Default)]
pub(crate) struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMappings {
    /// Returns `preferred` if it's even and free, else the next unassigned even
    /// channel id, else `None`.
    pub(crate) fn propose(&self, preferred: u8) -> Option<u8> {
        if (preferred & 1) == 0 && !self.is_assigned(preferred) {
            return Some(preferred);
        }
        self.next_unassigned()
    }

    fn is_assigned(&self, channel_id: u8) -> bool {
        matches!(self.0.get(usize::from(channel_id >> 1)), Some(Some(_)))
    }

    /// Returns the next unassigned even channel id, or `None` if all assigned.
    pub(crate) fn next_unassigned(&self) -> Option<u8> {
        if let Some(i) = self.0.iter().position(Option::is_none) {
            return Some((i as u8) << 1);
        }
        if self.0.len() < 128 {
            return Some((self.0.len() as u8) << 1);
        }
        None
    }

    /// Assigns an even channel id (to RTP) and its odd successor (to RTCP) or errors.
    pub(crate) fn assign(&mut self, channel_id: u8, track_i: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("Can't assign odd channel id {channel_id}"));
        }
        if track_i >= 255 {
            return Err(format!(
                "Can't assign channel to track {track_i} because it's >= 255"
            ));
        }
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        let c = &mut self.0[i];
        if let Some(c) = c {
            return Err(format!(
                "Channel id {} is already assigned to track {}; won't reassign to track {}",
                channel_id,
                c.get() - 1,
                track_i
            ));
        }
        *c = NonZeroU8::new((track_i + 1) as u8);
        Ok(())
    }

    /// Looks up a channel id's mapping.
    pub(crate) fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let c = (*self.0.get(usize::from(channel_id >> 1))?)?;
        Some(ChannelMapping {
            track_i: usize::from(c.get() - 1),
            channel_type: match (channel_id & 1) != 0 {
                false => ChannelType::Rtp,
                true => ChannelType::Rtcp,
            },
        })
    }

    /// Looks up a channel id's mapping, routing unknown channels to track 0
    /// when the session has only one track. Some servers ignore the
    /// negotiated channels.
    pub(crate) fn lookup_or_single(
        &self,
        channel_id: u8,
        track_count: usize,
    ) -> Option<ChannelMapping> {
        if let Some(m) = self.lookup(channel_id) {
            return Some(m);
        }
        if track_count == 1 {
            return Some(ChannelMapping {
                track_i: 0,
                channel_type: match (channel_id & 1) != 0 {
                    false => ChannelType::Rtp,
                    true => ChannelType::Rtcp,
                },
            });
        }
        warn!("no track with interleaved channel {channel_id}");
        None
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelMapping, ChannelMappings, ChannelType};

    #[test]
    fn channel_mappings() {
        let mut mappings = ChannelMappings::default();
        assert_eq!(mappings.next_unassigned().unwrap(), 0);
        assert_eq!(mappings.lookup(0), None);
        mappings.assign(0, 42).unwrap();
        mappings.assign(0, 43).unwrap_err();
        mappings.assign(1, 43).unwrap_err();
        assert_eq!(
            mappings.lookup(1),
            Some(ChannelMapping {
                track_i: 42,
                channel_type: ChannelType::Rtcp,
            })
        );
        assert_eq!(mappings.propose(0), Some(2));
        assert_eq!(mappings.propose(6), Some(6));
        mappings.assign(9, 26).unwrap_err();
        mappings.assign(8, 26).unwrap();
        assert_eq!(mappings.next_unassigned().unwrap(), 2);
    }

    #[test]
    fn third_track_channels() {
        let mut mappings = ChannelMappings::default();
        mappings.assign(0, 0).unwrap();
        mappings.assign(2, 1).unwrap();
        mappings.assign(4, 2).unwrap();
        assert_eq!(
            mappings.lookup(4),
            Some(ChannelMapping {
                track_i: 2,
                channel_type: ChannelType::Rtp,
            })
        );
        assert_eq!(
            mappings.lookup(5),
            Some(ChannelMapping {
                track_i: 2,
                channel_type: ChannelType::Rtcp,
            })
        );
    }

    #[test]
    fn single_track_fallback() {
        let mut mappings = ChannelMappings::default();
        mappings.assign(2, 0).unwrap();
        assert_eq!(mappings.lookup_or_single(0, 1).unwrap().track_i, 0);
        assert_eq!(
            mappings.lookup_or_single(7, 1).unwrap().channel_type,
            ChannelType::Rtcp
        );
        assert_eq!(mappings.lookup_or_single(0, 2), None);
    }
}
