// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental header+body framing of a byte stream.
//!
//! [`Splitter`] accepts arbitrarily-sized chunks as they arrive from the
//! network and hands complete headers and bodies to a [`SplitHandler`]. It
//! knows nothing about the protocol: the handler decides where a header ends
//! and how much body follows it.

use bytes::{Buf, BytesMut};

/// Default limit on bytes buffered while waiting for a complete header or body.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 4 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// What follows a header, as decided by [`SplitHandler::on_header`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyLen {
    /// No body; the next bytes start another header.
    None,

    /// Exactly this many bytes of body follow. `Fixed(0)` is the same as `None`.
    Fixed(usize),

    /// Everything from here on is body, delivered as it arrives. This persists
    /// until [`Splitter::reset`].
    Streaming,
}

/// Protocol-specific callbacks for a [`Splitter`].
pub trait SplitHandler {
    /// Returns the length of the header at the start of `data`, including its
    /// terminator, or `None` if no complete header is available yet.
    ///
    /// The default looks for `\r\n\r\n`.
    fn search_tail(&mut self, data: &[u8]) -> Option<usize> {
        find_header_end(data)
    }

    fn on_header(&mut self, header: &[u8]) -> Result<BodyLen, String>;

    fn on_body(&mut self, body: &[u8]) -> Result<(), String>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SplitterError {
    /// Too much was buffered without completing a message. All state has been
    /// discarded.
    #[error("{buffered} bytes buffered without a complete message (limit {limit}); discarded")]
    Overflow { buffered: usize, limit: usize },

    /// The handler rejected the input. All state has been discarded.
    #[error("{0}")]
    Handler(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Expect {
    Header,
    Body(usize),
    Streaming,
}

/// Turns a byte stream into header+body messages under bounded memory.
#[derive(Debug)]
pub struct Splitter {
    /// Unconsumed bytes: a partial header or a partial fixed-length body.
    remain: BytesMut,
    expect: Expect,
    max_cache_size: usize,
}

impl Default for Splitter {
    fn default() -> Self {
        Self {
            remain: BytesMut::new(),
            expect: Expect::Header,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl Splitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the buffering limit; `0` selects [`DEFAULT_MAX_CACHE_SIZE`].
    pub fn set_max_cache_size(&mut self, max_cache_size: usize) {
        self.max_cache_size = match max_cache_size {
            0 => DEFAULT_MAX_CACHE_SIZE,
            n => n,
        };
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    /// Returns the number of bytes held over from previous calls.
    pub fn remaining(&self) -> usize {
        self.remain.len()
    }

    /// Discards buffered bytes and any pending body length.
    pub fn reset(&mut self) {
        self.remain.clear();
        self.expect = Expect::Header;
    }

    /// Feeds `data`, invoking `handler` for every header and body it completes.
    ///
    /// Message boundaries need not line up with calls: partial headers and
    /// bodies are held until a later call completes them.
    pub fn input<H: SplitHandler + ?Sized>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<(), SplitterError> {
        if self.remain.len() > self.max_cache_size {
            let buffered = self.remain.len();
            self.reset();
            return Err(SplitterError::Overflow {
                buffered,
                limit: self.max_cache_size,
            });
        }
        self.remain.extend_from_slice(data);
        match self.split(handler) {
            Ok(consumed) => {
                self.remain.advance(consumed);
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(SplitterError::Handler(e))
            }
        }
    }

    /// Runs the handler over `self.remain`, returning the number of bytes consumed.
    fn split<H: SplitHandler + ?Sized>(&mut self, handler: &mut H) -> Result<usize, String> {
        let buf = &self.remain[..];
        let mut pos = 0;
        loop {
            let rest = &buf[pos..];
            match self.expect {
                Expect::Header => {
                    if rest.is_empty() {
                        break;
                    }
                    let end = match handler.search_tail(rest) {
                        None | Some(0) => break,
                        Some(end) if end > rest.len() => {
                            return Err(format!(
                                "header end {} is beyond the {} bytes available",
                                end,
                                rest.len()
                            ));
                        }
                        Some(end) => end,
                    };
                    pos += end;
                    self.expect = match handler.on_header(&rest[..end])? {
                        BodyLen::None | BodyLen::Fixed(0) => Expect::Header,
                        BodyLen::Fixed(n) => Expect::Body(n),
                        BodyLen::Streaming => Expect::Streaming,
                    };
                }
                Expect::Body(n) => {
                    if rest.len() < n {
                        break;
                    }
                    handler.on_body(&rest[..n])?;
                    pos += n;
                    self.expect = Expect::Header;
                }
                Expect::Streaming => {
                    if !rest.is_empty() {
                        handler.on_body(rest)?;
                        pos = buf.len();
                    }
                    break;
                }
            }
        }
        Ok(pos)
    }
}

/// Returns the index just past the first `\r\n\r\n` in `data`, if any.
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|p| p + HEADER_TERMINATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Item {
        Header(Vec<u8>),
        Body(Vec<u8>),
    }

    /// Parses `Content-Length`; a `Stream: 1` header switches to streaming.
    #[derive(Default)]
    struct Recorder(Vec<Item>);

    impl SplitHandler for Recorder {
        fn on_header(&mut self, header: &[u8]) -> Result<BodyLen, String> {
            self.0.push(Item::Header(header.to_vec()));
            let text = std::str::from_utf8(header).map_err(|e| e.to_string())?;
            for line in text.split("\r\n") {
                if line == "Stream: 1" {
                    return Ok(BodyLen::Streaming);
                }
                if let Some(v) = line.strip_prefix("Content-Length: ") {
                    let n = v.parse().map_err(|_| format!("bad length {v:?}"))?;
                    return Ok(BodyLen::Fixed(n));
                }
            }
            Ok(BodyLen::None)
        }

        fn on_body(&mut self, body: &[u8]) -> Result<(), String> {
            self.0.push(Item::Body(body.to_vec()));
            Ok(())
        }
    }

    const STREAM: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n\
                            RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nhello\
                            RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 3\r\n\r\nabc\
                            RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n";

    fn run(chunk: usize) -> Vec<Item> {
        let mut s = Splitter::new();
        let mut r = Recorder::default();
        for c in STREAM.chunks(chunk) {
            s.input(c, &mut r).unwrap();
        }
        assert_eq!(s.remaining(), 0);
        r.0
    }

    #[test]
    fn chunking_invariance() {
        let whole = run(STREAM.len());
        assert_eq!(whole.len(), 6);
        assert_eq!(whole[2], Item::Body(b"hello".to_vec()));
        assert_eq!(whole[4], Item::Body(b"abc".to_vec()));
        for chunk in 1..STREAM.len() {
            assert_eq!(run(chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn terminator_straddles_calls() {
        let mut s = Splitter::new();
        let mut r = Recorder::default();
        s.input(b"OPTIONS * RTSP/1.0\r\n", &mut r).unwrap();
        assert!(r.0.is_empty());
        s.input(b"\r", &mut r).unwrap();
        assert!(r.0.is_empty());
        s.input(b"\n", &mut r).unwrap();
        assert_eq!(r.0, vec![Item::Header(b"OPTIONS * RTSP/1.0\r\n\r\n".to_vec())]);
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn partial_body_held() {
        let mut s = Splitter::new();
        let mut r = Recorder::default();
        s.input(b"X\r\nContent-Length: 4\r\n\r\nab", &mut r).unwrap();
        assert_eq!(r.0.len(), 1);
        assert_eq!(s.remaining(), 2);
        s.input(b"cdnext", &mut r).unwrap();
        assert_eq!(r.0[1], Item::Body(b"abcd".to_vec()));
        assert_eq!(s.remaining(), 4);
    }

    #[test]
    fn overflow_then_fresh_start() {
        let mut s = Splitter::new();
        s.set_max_cache_size(16);
        let mut r = Recorder::default();
        s.input(&[b'x'; 17], &mut r).unwrap();
        assert_eq!(
            s.input(b"y", &mut r),
            Err(SplitterError::Overflow {
                buffered: 17,
                limit: 16
            })
        );
        assert_eq!(s.remaining(), 0);
        s.input(b"ok\r\n\r\n", &mut r).unwrap();
        assert_eq!(r.0, vec![Item::Header(b"ok\r\n\r\n".to_vec())]);
    }

    #[test]
    fn zero_selects_default_limit() {
        let mut s = Splitter::new();
        s.set_max_cache_size(10);
        assert_eq!(s.max_cache_size(), 10);
        s.set_max_cache_size(0);
        assert_eq!(s.max_cache_size(), DEFAULT_MAX_CACHE_SIZE);
    }

    #[test]
    fn streaming_persists() {
        let mut s = Splitter::new();
        let mut r = Recorder::default();
        s.input(b"GET\r\nStream: 1\r\n\r\nabc", &mut r).unwrap();
        s.input(b"\r\n\r\ndef", &mut r).unwrap();
        assert_eq!(
            r.0,
            vec![
                Item::Header(b"GET\r\nStream: 1\r\n\r\n".to_vec()),
                Item::Body(b"abc".to_vec()),
                Item::Body(b"\r\n\r\ndef".to_vec()),
            ]
        );
        s.reset();
        s.input(b"A\r\n\r\n", &mut r).unwrap();
        assert_eq!(r.0[3], Item::Header(b"A\r\n\r\n".to_vec()));
    }

    #[test]
    fn no_progress_stops() {
        struct Stuck(usize);
        impl SplitHandler for Stuck {
            fn search_tail(&mut self, _data: &[u8]) -> Option<usize> {
                self.0 += 1;
                Some(0)
            }
            fn on_header(&mut self, _header: &[u8]) -> Result<BodyLen, String> {
                unreachable!()
            }
            fn on_body(&mut self, _body: &[u8]) -> Result<(), String> {
                unreachable!()
            }
        }
        let mut s = Splitter::new();
        let mut h = Stuck(0);
        s.input(b"abc", &mut h).unwrap();
        assert_eq!(h.0, 1);
        assert_eq!(s.remaining(), 3);
    }

    #[test]
    fn handler_error_discards() {
        let mut s = Splitter::new();
        let mut r = Recorder::default();
        let e = s
            .input(b"X\r\nContent-Length: zz\r\n\r\nrest", &mut r)
            .unwrap_err();
        assert!(matches!(e, SplitterError::Handler(_)));
        assert_eq!(s.remaining(), 0);
    }
}
