// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc, time::Duration};

use crate::{ConnectionContext, PacketContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: network-facing errors
/// carry enough context to find the offending message in a packet capture.
/// [`Error::kind`] gives a coarse classification for programmatic use.
///
/// Cloning is cheap; the same error may be both reported to the application
/// and used as the reason for tearing a session down.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed input: URL, header value, session description, missing
    /// required header.
    Parse,

    /// Unexpected status code or exhausted authentication.
    Protocol,

    /// A buffering limit was exceeded.
    ResourceExhausted,

    /// Handshake or media timeout.
    Timeout,

    /// Connect, read, or write failure.
    Network,

    /// The session was torn down locally.
    Shutdown,

    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInt::InvalidArgument(_)
            | ErrorInt::RtspFramingError { .. }
            | ErrorInt::RtspResponseParseError { .. } => ErrorKind::Parse,
            ErrorInt::RtspResponseError { .. }
            | ErrorInt::PacketError { .. }
            | ErrorInt::FailedPrecondition(_) => ErrorKind::Protocol,
            ErrorInt::BufferOverflow { .. } => ErrorKind::ResourceExhausted,
            ErrorInt::HandshakeTimeout(_) | ErrorInt::MediaTimeout(_) => ErrorKind::Timeout,
            ErrorInt::ConnectError(_)
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::ConnectionClosed { .. }
            | ErrorInt::UdpRecvError { .. }
            | ErrorInt::UdpSetupError { .. }
            | ErrorInt::WriteError { .. } => ErrorKind::Network,
            ErrorInt::Shutdown(_) => ErrorKind::Shutdown,
            ErrorInt::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    /// A successful response which lacks something required or can't be parsed.
    #[error("[{conn_ctx}, {msg_ctx}] Unusable response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseParseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {buffered} bytes buffered without a complete \
             message; limit is {limit}")]
    BufferOverflow {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        buffered: usize,
        limit: usize,
    },

    #[error("[{conn_ctx}, {pkt_ctx} track {track}]: {description}")]
    PacketError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        track: usize,
        description: String,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}, {msg_ctx}] RTSP peer closed the connection")]
    ConnectionClosed {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
    },

    #[error("[{conn_ctx}, {pkt_ctx}] Error receiving UDP packet: {source}")]
    UdpRecvError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Unable to set up UDP sockets for track {track}: {source}")]
    UdpSetupError {
        conn_ctx: ConnectionContext,
        track: usize,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("No PLAY result within {0:?} of starting")]
    HandshakeTimeout(Duration),

    #[error("No media received for {0:?}")]
    MediaTimeout(Duration),

    #[error("Shut down: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}
