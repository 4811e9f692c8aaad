// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`].
//!
//! Framing is done by the [`Splitter`], so a message may arrive in any number
//! of reads and a read may hold any number of messages.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rtsp_types::{Data, Message};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use url::Host;

use crate::splitter::{BodyLen, SplitHandler, Splitter, SplitterError};
use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// A RTSP connection which implements `Stream`, `Sink`, and `Unpin`.
pub(crate) struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    /// Connects to `host:port`, limiting any single buffered message to
    /// `max_message_size` bytes (0 for the default).
    pub(crate) async fn connect(
        host: Host<String>,
        port: u16,
        max_message_size: usize,
    ) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h.as_str(), port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream, max_message_size)
    }

    pub(crate) fn from_stream(
        stream: TcpStream,
        max_message_size: usize,
    ) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self(Framed::new(
            stream,
            Codec::new(
                ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                },
                max_message_size,
            ),
        )))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    /// Returns the context of the end of the stream: just past anything
    /// buffered toward an incomplete message.
    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        let codec = self.0.codec();
        let buffered = codec.splitter.remaining() + self.0.read_buffer().len();
        RtspMessageContext {
            pos: codec.framer.pos + buffered as u64,
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::ParseError { .. } | CodecError::Overflow { .. } => {
                ErrorInt::Internal(format!("decode error while writing: {e:?}").into())
            }
        }
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            let msg_ctx = |pos| RtspMessageContext {
                pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            };
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: msg_ctx(pos),
                    description,
                },
                CodecError::Overflow {
                    buffered,
                    limit,
                    pos,
                } => ErrorInt::BufferOverflow {
                    conn_ctx: *self.ctx(),
                    msg_ctx: msg_ctx(pos),
                    buffered,
                    limit,
                },
            })
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// Encodes and decodes RTSP messages.
struct Codec {
    ctx: ConnectionContext,
    splitter: Splitter,
    framer: RtspFramer,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError {
        description: String,
        pos: u64,
    },
    Overflow {
        buffered: usize,
        limit: usize,
        pos: u64,
    },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn new(ctx: ConnectionContext, max_message_size: usize) -> Self {
        let mut splitter = Splitter::new();
        splitter.set_max_cache_size(max_message_size);
        Codec {
            ctx,
            splitter,
            framer: RtspFramer::default(),
        }
    }
}

/// Where the framer is within the current message.
#[derive(Debug, Default)]
enum Partial {
    /// Between messages.
    #[default]
    Idle,

    /// Read `$`, a channel id, and a length; awaiting the payload.
    Data { channel_id: u8 },

    /// Read a request or response header block; awaiting its body.
    Text { header: Vec<u8> },
}

/// Turns the splitter's header and body callbacks into [`ReceivedMessage`]s.
///
/// Interleaved data has a four-byte "header" (`$`, channel id, big-endian
/// length) and a body of that length. Text messages end their header with a
/// blank line and carry a body iff they have a `Content-Length`.
#[derive(Debug, Default)]
struct RtspFramer {
    /// Bytes consumed through the end of the last header or body.
    pos: u64,

    /// Start of the message in progress.
    msg_start: u64,
    partial: Partial,
    ready: VecDeque<ReceivedMessage>,
}

impl RtspFramer {
    fn push(&mut self, msg: Message<Bytes>) {
        self.ready.push_back(ReceivedMessage {
            ctx: RtspMessageContext {
                pos: self.msg_start,
                received_wall: WallTime::now(),
                received: Instant::now(),
            },
            msg,
        });
    }

    /// Parses a complete request or response.
    ///
    /// A text message without an RTSP protocol tag in its first line is
    /// logged and dropped; one with the tag must parse.
    fn push_text(&mut self, raw: &[u8]) -> Result<(), String> {
        if !has_rtsp_tag(raw) {
            log::warn!(
                "ignoring non-RTSP message at pos {}:\n{:#?}",
                self.msg_start,
                crate::hex::LimitedHex::new(raw, 128),
            );
            return Ok(());
        }
        let (msg, len) = match Message::parse(raw) {
            Ok(m) => m,
            Err(rtsp_types::ParseError::Error) | Err(rtsp_types::ParseError::Incomplete(_)) => {
                return Err(format!(
                    "Invalid RTSP message; buffered:\n{:#?}",
                    crate::hex::LimitedHex::new(raw, 128),
                ));
            }
        };
        if len != raw.len() {
            return Err(format!(
                "RTSP message is {len} bytes; framed {} bytes",
                raw.len()
            ));
        }
        let msg = match msg {
            Message::Request(r) => Message::Request(r.map_body(Bytes::copy_from_slice)),
            Message::Response(r) => Message::Response(r.map_body(Bytes::copy_from_slice)),
            Message::Data(_) => return Err("unexpected interleaved data in text message".to_owned()),
        };
        self.push(msg);
        Ok(())
    }
}

/// Returns true if the first line is a response status line (`RTSP/1.0 200 OK`)
/// or a request line (`OPTIONS * RTSP/1.0`).
fn has_rtsp_tag(raw: &[u8]) -> bool {
    let line = match raw.windows(2).position(|w| w == b"\r\n") {
        Some(end) => &raw[..end],
        None => raw,
    };
    line.starts_with(b"RTSP/")
        || line
            .rsplit(|&b| b == b' ')
            .next()
            .is_some_and(|version| version.starts_with(b"RTSP/"))
}

/// Returns the `Content-Length` of a header block, if any.
fn content_length(header: &[u8]) -> Result<Option<usize>, String> {
    let header = std::str::from_utf8(header)
        .map_err(|_| format!("non-UTF-8 header:\n{:#?}", crate::hex::LimitedHex::new(header, 128)))?;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse()
                .map(Some)
                .map_err(|_| format!("bad Content-Length {value:?}"));
        }
    }
    Ok(None)
}

impl SplitHandler for RtspFramer {
    fn search_tail(&mut self, data: &[u8]) -> Option<usize> {
        match data {
            // Stray line endings between messages.
            [b'\r', b'\n', ..] => Some(2),
            [b'$', _, _, _, ..] => Some(4),
            [b'$', ..] => None,
            _ => crate::splitter::find_header_end(data),
        }
    }

    fn on_header(&mut self, header: &[u8]) -> Result<BodyLen, String> {
        self.msg_start = self.pos;
        self.pos += header.len() as u64;
        match header {
            b"\r\n" => Ok(BodyLen::None),
            [b'$', channel_id, hi, lo] => {
                let len = usize::from(u16::from_be_bytes([*hi, *lo]));
                if len == 0 {
                    self.push(Message::Data(Data::new(*channel_id, Bytes::new())));
                    return Ok(BodyLen::None);
                }
                self.partial = Partial::Data {
                    channel_id: *channel_id,
                };
                Ok(BodyLen::Fixed(len))
            }
            _ => match content_length(header)? {
                None | Some(0) => {
                    self.push_text(header)?;
                    Ok(BodyLen::None)
                }
                Some(len) => {
                    self.partial = Partial::Text {
                        header: header.to_vec(),
                    };
                    Ok(BodyLen::Fixed(len))
                }
            },
        }
    }

    fn on_body(&mut self, body: &[u8]) -> Result<(), String> {
        self.pos += body.len() as u64;
        match std::mem::take(&mut self.partial) {
            Partial::Idle => Err(format!("{} byte body without a header", body.len())),
            Partial::Data { channel_id } => {
                self.push(Message::Data(Data::new(
                    channel_id,
                    Bytes::copy_from_slice(body),
                )));
                Ok(())
            }
            Partial::Text { mut header } => {
                header.extend_from_slice(body);
                self.push_text(&header)
            }
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let input = src.split();
            let pos = self.framer.pos;
            self.splitter
                .input(&input, &mut self.framer)
                .map_err(|e| match e {
                    SplitterError::Overflow { buffered, limit } => CodecError::Overflow {
                        buffered,
                        limit,
                        pos,
                    },
                    SplitterError::Handler(description) => CodecError::ParseError {
                        description,
                        pos: self.framer.msg_start,
                    },
                })?;
        }
        Ok(self.framer.ready.pop_front())
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: rtsp_types::Message<Bytes>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        item.write(&mut dst.writer()).map_err(|e| {
            CodecError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })
    }
}

/// tokio-specific version of [`crate::UdpPair`].
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: std::net::IpAddr) -> Result<Self, std::io::Error> {
        let inner = crate::UdpPair::for_ip(ip_addr)?;
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn codec(max_message_size: usize) -> Codec {
        Codec::new(ConnectionContext::dummy(), max_message_size)
    }

    /// Feeds `input` in `chunk`-sized pieces, collecting every decoded message.
    fn decode_all(codec: &mut Codec, input: &[u8], chunk: usize) -> Vec<ReceivedMessage> {
        let mut out = Vec::new();
        for c in input.chunks(chunk) {
            let mut buf = BytesMut::from(c);
            while let Some(m) = codec.decode(&mut buf).unwrap() {
                out.push(m);
            }
            assert!(buf.is_empty());
        }
        out
    }

    #[test]
    fn crlf_data() {
        let mut codec = codec(0);
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let m = codec.decode(&mut buf).unwrap().unwrap();
        match m.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"asdf");
            }
            o => panic!("unexpected {o:?}"),
        }
        assert_eq!(m.ctx.pos(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.splitter.remaining(), 4);
    }

    const MIXED: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 4\r\nContent-Length: 5\r\n\r\nhello\
                           $\x02\x00\x03abc\
                           RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n\
                           $\x03\x00\x00";

    #[test]
    fn mixed_any_chunking() {
        for chunk in [1, 3, 7, MIXED.len()] {
            let mut msgs = decode_all(&mut codec(0), MIXED, chunk);
            assert_eq!(msgs.len(), 4, "chunk size {chunk}");
            match &msgs[0].msg {
                Message::Response(r) => assert_eq!(&r.body()[..], b"hello"),
                o => panic!("unexpected {o:?}"),
            }
            assert_eq!(msgs[0].ctx.pos(), 0);
            match &msgs[1].msg {
                Message::Data(d) => assert_eq!(d.channel_id(), 2),
                o => panic!("unexpected {o:?}"),
            }
            assert_eq!(msgs[1].ctx.pos(), 52);
            assert!(matches!(&msgs[2].msg, Message::Response(_)));
            assert_eq!(msgs[2].ctx.pos(), 59);
            match msgs.pop().map(|m| m.msg) {
                Some(Message::Data(d)) => {
                    assert_eq!(d.channel_id(), 3);
                    assert!(d.into_body().is_empty());
                }
                o => panic!("unexpected {o:?}"),
            }
        }
    }

    #[test]
    fn overflow() {
        let mut codec = codec(16);
        let mut buf = BytesMut::from(&b"RTSP/1.0 200 OK\r\nCSeq"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let mut buf = BytesMut::from(&b": 1\r\n\r\n"[..]);
        match codec.decode(&mut buf) {
            Err(CodecError::Overflow {
                buffered: 21,
                limit: 16,
                pos: 0,
            }) => {}
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn untagged_message_skipped() {
        const INPUT: &[u8] = b"HTTP/1.1 200 OK\r\nCSeq: 1\r\nContent-Length: 2\r\n\r\nhi\
                               RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n";
        for chunk in [1, 5, INPUT.len()] {
            let msgs = decode_all(&mut codec(0), INPUT, chunk);
            assert_eq!(msgs.len(), 1, "chunk size {chunk}");
            assert!(matches!(&msgs[0].msg, Message::Response(_)));
            assert_eq!(msgs[0].ctx.pos(), 49);
        }
    }

    #[test]
    fn malformed_rtsp() {
        let mut codec = codec(0);
        let mut buf = BytesMut::from(&b"\r\nRTSP/1.0 abc\r\n\r\n"[..]);
        match codec.decode(&mut buf) {
            Err(CodecError::ParseError { pos: 2, .. }) => {}
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn rtsp_tag() {
        assert!(has_rtsp_tag(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"));
        assert!(has_rtsp_tag(b"GET_PARAMETER rtsp://h/s RTSP/1.0\r\n\r\n"));
        assert!(!has_rtsp_tag(b"HTTP/1.1 200 OK\r\n\r\n"));
        assert!(!has_rtsp_tag(b"not rtsp at all\r\n\r\n"));
    }
}
