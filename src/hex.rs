// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for log and error messages.

use pretty_hex::{HexConfig, PrettyHex};

/// `Debug`-formats at most `max_bytes` of `inner` as a hex dump, noting how
/// much was left out.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.inner[..self.inner.len().min(self.max_bytes)];
        let cfg = HexConfig {
            title: false,
            ..Default::default()
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        writeln!(f, "{:#?}", shown.hex_conf(cfg))?;
        match self.inner.len() - shown.len() {
            0 => Ok(()),
            omitted => write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let s = format!("{:?}", LimitedHex::new(&[0xab; 100], 16));
        assert!(s.starts_with("Length: 100 (0x64) bytes"), "{s}");
        assert!(s.ends_with("...84 (0x54) bytes not shown..."), "{s}");
        let s = format!("{:?}", LimitedHex::new(b"ab", 16));
        assert!(!s.contains("not shown"), "{s}");
    }
}
