// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP session state machine, without I/O.
//!
//! [`Session`] is fed connection events, received messages, datagrams, and
//! timer expirations, each with the current time. It answers with
//! [`Output`]s for the driver to carry out. There's at most one outstanding
//! request; RTSP is strictly request/response from the client's side.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, HeaderName, Message, Method, Response};
use url::{Host, Url};

use super::auth::{self, Challenge};
use super::channel_mapping::ChannelType;
use super::parse::{self, TrackDescriptor};
use super::rtcp_context::RtcpContext;
use super::transport::{Datagram, TransportManager};
use super::url::{MediaProtocol, RtspUrl};
use super::{
    BeatType, Credentials, MediaType, PlayerEvent, PlayerOptions, Playback, SenderReport,
    Timeline, Transport,
};
use crate::rtp::{RawPacket, ReceivedPacket};
use crate::{
    ConnectionContext, Error, ErrorInt, ErrorKind, PacketContext, ReceivedMessage,
    RtspMessageContext,
};

/// Something the driver must do on the session's behalf.
#[derive(Debug)]
pub(crate) enum Output {
    /// Drop any existing connection and open a new one.
    Connect { host: Host<String>, port: u16 },
    Send(Message<Bytes>),
    Close,
    Event(PlayerEvent),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    AwaitingOptions,
    AwaitingDescribe,
    AwaitingSetup(usize),
    AwaitingPlay,
    Playing,
    Paused,
    Closed,
    Error,
}

/// What a `PLAY`/`PAUSE` request is for.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Intent {
    Play(f64),
    Pause,
    Seek(f64),
    Speed(f32),
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Step {
    Options,
    Describe,

    /// `SETUP` of a track, with the interleaved channel proposed.
    Setup {
        track: usize,
        channel: Option<u8>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum PendingKind {
    Handshake(Step),
    Control(Intent),
    KeepAlive,
}

/// The single outstanding request. Everything needed to re-send it after a
/// `401` and to interpret its response.
#[derive(Debug)]
struct Pending {
    cseq: u32,
    method: Method,
    uri: Url,
    extra_headers: Vec<(HeaderName, String)>,
    kind: PendingKind,
}

struct Track {
    desc: TrackDescriptor,
    transport: Transport,

    /// Negotiated in `SETUP`; packets from other sources are dropped.
    ssrc: Option<u32>,
    interleaved: Option<u8>,
    rtcp: RtcpContext,
    timeline: Timeline,
    last_beat: Instant,

    /// Whether the last keepalive on this track was RTCP.
    sent_rtcp: bool,
}

pub(crate) struct Session {
    options: PlayerOptions,
    phase: Phase,
    url: Option<Url>,
    challenge: Option<Challenge>,
    session_id: Option<String>,
    next_cseq: u32,
    pending: Option<Pending>,
    supported: HashSet<String>,
    control: Option<Url>,
    tracks: Vec<Track>,
    transport: TransportManager,
    conn_ctx: Option<ConnectionContext>,

    handshake_deadline: Option<Instant>,
    media_check: Option<Instant>,
    last_rtp: Instant,
    benchmark: bool,

    /// Normal play time at which the current `PLAY` started.
    seek_base: f64,
    outbox: VecDeque<Output>,
}

impl Session {
    pub(crate) fn new(options: PlayerOptions) -> Self {
        let transport = TransportManager::new(options.bind_ip);
        Session {
            options,
            phase: Phase::Idle,
            url: None,
            challenge: None,
            session_id: None,
            next_cseq: 1,
            pending: None,
            supported: HashSet::new(),
            control: None,
            tracks: Vec::new(),
            transport,
            conn_ctx: None,
            handshake_deadline: None,
            media_check: None,
            last_rtp: Instant::now(),
            benchmark: false,
            seek_base: 0.0,
            outbox: VecDeque::new(),
        }
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.options.max_message_size
    }

    pub(crate) fn poll_output(&mut self) -> Option<Output> {
        self.outbox.pop_front()
    }

    /// Returns when [`Self::on_timer`] should next be called.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.handshake_deadline.or(self.media_check)
    }

    /// The handshake ends with the first play result; its timer is the marker.
    fn handshake_done(&self) -> bool {
        self.handshake_deadline.is_none()
    }

    fn emit(&mut self, event: PlayerEvent) {
        self.outbox.push_back(Output::Event(event));
    }

    fn conn_ctx(&self) -> ConnectionContext {
        self.conn_ctx.unwrap_or_else(ConnectionContext::dummy)
    }

    /// Starts playing `url`, replacing any current session.
    ///
    /// An unusable URL is reported without disturbing the current session.
    pub(crate) fn play(&mut self, url: &str, now: Instant) {
        match playable_url(url) {
            Ok(parsed) => self.start(parsed, now),
            Err(description) => self.emit(PlayerEvent::PlayResult(Err(wrap!(
                ErrorInt::InvalidArgument(description)
            )))),
        }
    }

    /// Replaces any current session with a new attempt on `parsed`.
    fn start(&mut self, parsed: RtspUrl, now: Instant) {
        self.teardown(now);
        if parsed.username.is_some() || parsed.password.is_some() {
            let creds = self.options.creds.get_or_insert_with(Credentials::default);
            if let Some(u) = parsed.username {
                creds.username = u;
            }
            if let Some(p) = parsed.password {
                creds.password = p;
                creds.password_is_md5 = false;
            }
        }
        debug!(
            "playing {} via {:?}, user {:?}",
            parsed.url,
            self.options.transport,
            self.options.creds.as_ref().map(|c| c.username.as_str()),
        );
        self.url = Some(parsed.url);
        self.handshake_deadline = Some(now + self.options.handshake_timeout);
        self.phase = Phase::Connecting;
        self.outbox.push_back(Output::Connect {
            host: parsed.host,
            port: parsed.port,
        });
    }

    pub(crate) fn on_connected(&mut self, conn_ctx: ConnectionContext, _now: Instant) {
        if self.phase != Phase::Connecting {
            debug!("ignoring connection {conn_ctx} in phase {:?}", self.phase);
            return;
        }
        debug!("connected: {conn_ctx}");
        self.conn_ctx = Some(conn_ctx);
        self.send_options();
    }

    pub(crate) fn on_connect_failed(&mut self, e: std::io::Error, now: Instant) {
        if self.phase != Phase::Connecting {
            debug!("ignoring connect failure in phase {:?}: {e}", self.phase);
            return;
        }
        let done = self.handshake_done();
        self.on_play_result(Err(wrap!(ErrorInt::ConnectError(e))), done, now);
    }

    /// Handles a failure of the RTSP connection: read, write, or framing.
    ///
    /// After a local teardown, whatever the closing connection reports is
    /// part of that shutdown.
    pub(crate) fn on_connection_error(&mut self, e: Error, now: Instant) {
        let e = match self.phase {
            Phase::Idle | Phase::Error => {
                debug!("ignoring connection error in phase {:?}: {e}", self.phase);
                return;
            }
            Phase::Closed => wrap!(ErrorInt::Shutdown(format!("after teardown: {e}"))),
            _ => e,
        };
        let done = self.handshake_done();
        self.on_play_result(Err(e), done, now);
    }

    pub(crate) fn on_udp_error(&mut self, track: usize, source: std::io::Error, now: Instant) {
        let e = wrap!(ErrorInt::UdpRecvError {
            conn_ctx: self.conn_ctx(),
            pkt_ctx: PacketContext::dummy(),
            source,
        });
        debug!("track {track}: {e}");
        self.on_connection_error(e, now);
    }

    /// Sends a best-effort `TEARDOWN` and closes the connection, then forgets
    /// everything about the session.
    pub(crate) fn teardown(&mut self, _now: Instant) {
        let connected = !matches!(
            self.phase,
            Phase::Idle | Phase::Connecting | Phase::Closed | Phase::Error
        );
        if connected {
            if let Some(control) = self.control.clone() {
                let (_, req) = self.build_request(Method::Teardown, &control, &[]);
                self.outbox.push_back(Output::Send(Message::Request(req)));
            }
        }
        if self.phase != Phase::Idle {
            debug!("teardown in phase {:?}", self.phase);
            self.outbox.push_back(Output::Close);
            self.phase = Phase::Closed;
        }
        self.challenge = None;
        self.session_id = None;
        self.next_cseq = 1;
        self.pending = None;
        self.supported.clear();
        self.control = None;
        self.tracks.clear();
        self.transport.reset();
        self.conn_ctx = None;
        self.handshake_deadline = None;
        self.media_check = None;
        self.benchmark = false;
        self.seek_base = 0.0;
    }

    /// Reports the outcome of a handshake or control request.
    ///
    /// Before the handshake is done, this is the play result; afterward, a
    /// shutdown or resume. Failures tear the session down. Shutdown errors
    /// are the session's own doing and never reported.
    fn on_play_result(&mut self, result: Result<Playback, Error>, handshake_done: bool, now: Instant) {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Shutdown {
                debug!("not reporting {e}");
                return;
            }
        }
        let failed = result.is_err();
        match &result {
            Ok(p) => info!("playing from {:.2}s", p.position_secs),
            Err(e) => warn!("{e}"),
        }
        if !handshake_done {
            self.handshake_deadline = None;
            self.benchmark = self.options.benchmark;
            self.emit(PlayerEvent::PlayResult(result));
        } else {
            match result {
                Ok(p) => self.emit(PlayerEvent::Resume(p)),
                Err(e) => self.emit(PlayerEvent::Shutdown(e)),
            }
        }
        if failed {
            self.teardown(now);
            self.phase = Phase::Error;
        } else {
            self.last_rtp = now;
            self.media_check = Some(now + self.options.media_timeout / 2);
        }
    }

    pub(crate) fn on_timer(&mut self, now: Instant) {
        if let Some(d) = self.handshake_deadline {
            if now >= d {
                let e = wrap!(ErrorInt::HandshakeTimeout(self.options.handshake_timeout));
                self.on_play_result(Err(e), false, now);
                return;
            }
        }
        if let Some(d) = self.media_check {
            if now < d {
                return;
            }
            let timeout = self.options.media_timeout;
            if now.saturating_duration_since(self.last_rtp) > timeout {
                self.media_check = None;
                self.on_play_result(Err(wrap!(ErrorInt::MediaTimeout(timeout))), true, now);
            } else {
                self.media_check = Some(now + timeout / 2);
            }
        }
    }

    fn authorization(&self, method: &Method, uri: &Url) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        let creds = self.options.creds.as_ref().filter(|c| !c.username.is_empty())?;
        auth::authorization(method.into(), uri.as_str(), creds, challenge)
    }

    fn build_request(
        &mut self,
        method: Method,
        uri: &Url,
        extra_headers: &[(HeaderName, String)],
    ) -> (u32, rtsp_types::Request<Bytes>) {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        let mut req = rtsp_types::Request::builder(method.clone(), rtsp_types::Version::V1_0)
            .request_uri(uri.clone())
            .header(headers::CSEQ, cseq.to_string())
            .header(headers::USER_AGENT, self.options.user_agent.clone());
        if let Some(id) = &self.session_id {
            req = req.header(headers::SESSION, id.clone());
        }
        if let Some(a) = self.authorization(&method, uri) {
            req = req.header(headers::AUTHORIZATION, a);
        }
        for (name, value) in extra_headers {
            req = req.header(name.clone(), value.clone());
        }
        trace!("{} {} CSeq={cseq}", <&str>::from(&method), uri);
        (cseq, req.build(Bytes::new()))
    }

    fn send_request(
        &mut self,
        method: Method,
        uri: Url,
        extra_headers: Vec<(HeaderName, String)>,
        kind: PendingKind,
    ) {
        let (cseq, req) = self.build_request(method.clone(), &uri, &extra_headers);
        self.pending = Some(Pending {
            cseq,
            method,
            uri,
            extra_headers,
            kind,
        });
        self.outbox.push_back(Output::Send(Message::Request(req)));
    }

    fn play_url(&self) -> Url {
        match &self.url {
            Some(u) => u.clone(),
            None => unreachable!("url is set before connecting"),
        }
    }

    fn send_options(&mut self) {
        self.phase = Phase::AwaitingOptions;
        let url = self.play_url();
        self.send_request(
            Method::Options,
            url,
            Vec::new(),
            PendingKind::Handshake(Step::Options),
        );
    }

    fn send_describe(&mut self) {
        self.phase = Phase::AwaitingDescribe;
        let url = self.play_url();
        self.send_request(
            Method::Describe,
            url,
            vec![(headers::ACCEPT, "application/sdp".to_owned())],
            PendingKind::Handshake(Step::Describe),
        );
    }

    fn send_setup(&mut self, i: usize) -> Result<(), Error> {
        self.phase = Phase::AwaitingSetup(i);
        let track = &self.tracks[i];
        let url = track.desc.control.clone();
        let (transport, channel) = match self.options.transport {
            Transport::Tcp => {
                let ch = self
                    .transport
                    .propose_channel(track.desc.media.interleaved_base())
                    .ok_or_else(|| {
                        wrap!(ErrorInt::FailedPrecondition(
                            "no free interleaved channel".to_owned()
                        ))
                    })?;
                (
                    format!("RTP/AVP/TCP;unicast;interleaved={}-{};mode=play", ch, ch + 1),
                    Some(ch),
                )
            }
            Transport::Multicast => ("RTP/AVP;multicast;mode=play".to_owned(), None),
            Transport::Udp => {
                let port = self.transport.open_unicast(i).map_err(|source| {
                    wrap!(ErrorInt::UdpSetupError {
                        conn_ctx: self.conn_ctx(),
                        track: i,
                        source,
                    })
                })?;
                (
                    format!("RTP/AVP;unicast;client_port={}-{};mode=play", port, port + 1),
                    None,
                )
            }
        };
        self.send_request(
            Method::Setup,
            url,
            vec![(headers::TRANSPORT, transport)],
            PendingKind::Handshake(Step::Setup { track: i, channel }),
        );
        Ok(())
    }

    fn send_control(&mut self, intent: Intent) {
        let Some(control) = self.control.clone() else {
            warn!("no control url for {intent:?}");
            return;
        };
        let (method, extra) = match intent {
            Intent::Pause => (Method::Pause, Vec::new()),
            Intent::Play(pos) | Intent::Seek(pos) => (
                Method::Play,
                vec![(headers::RANGE, format!("npt={pos:.2}-"))],
            ),
            Intent::Speed(speed) => (Method::Play, vec![(headers::SCALE, speed.to_string())]),
        };
        self.send_request(method, control, extra, PendingKind::Control(intent));
    }

    fn send_keepalive(&mut self) {
        if self.pending.is_some() {
            debug!("skipping keepalive; request outstanding");
            return;
        }
        let (method, uri) = match (&self.control, self.supported.contains("GET_PARAMETER")) {
            (Some(c), true) => (Method::GetParameter, c.clone()),
            _ => (Method::Options, self.play_url()),
        };
        debug!("keepalive {}", <&str>::from(&method));
        self.send_request(method, uri, Vec::new(), PendingKind::KeepAlive);
    }

    /// Returns true if a user request may be sent now. A keepalive in flight
    /// is superseded; its response will be ignored.
    fn ready_for_user_request(&self, what: &str) -> bool {
        if !matches!(self.phase, Phase::Playing | Phase::Paused) {
            warn!("ignoring {what} in phase {:?}", self.phase);
            return false;
        }
        match &self.pending {
            None
            | Some(Pending {
                kind: PendingKind::KeepAlive,
                ..
            }) => true,
            Some(p) => {
                warn!("ignoring {what}; {} CSeq={} outstanding", <&str>::from(&p.method), p.cseq);
                false
            }
        }
    }

    /// Pauses, or resumes from the current progress.
    pub(crate) fn pause(&mut self, pause: bool, _now: Instant) {
        if !self.ready_for_user_request("pause") {
            return;
        }
        if pause {
            self.send_control(Intent::Pause);
        } else {
            let pos = self.progress_secs();
            self.send_control(Intent::Seek(pos));
        }
    }

    pub(crate) fn seek(&mut self, position_secs: f64, _now: Instant) {
        if self.ready_for_user_request("seek") {
            self.send_control(Intent::Seek(position_secs.max(0.0)));
        }
    }

    pub(crate) fn set_speed(&mut self, speed: f32, _now: Instant) {
        if self.ready_for_user_request("speed change") {
            self.send_control(Intent::Speed(speed));
        }
    }

    pub(crate) fn handle_message(&mut self, msg: ReceivedMessage, now: Instant) {
        match msg.msg {
            Message::Response(r) => self.handle_response(msg.ctx, r, now),
            Message::Data(d) => {
                let channel = d.channel_id();
                self.handle_interleaved(channel, d.into_body(), msg.ctx, now);
            }
            Message::Request(r) => {
                warn!(
                    "ignoring {} request from server at {}",
                    <&str>::from(r.method()),
                    msg.ctx
                );
            }
        }
    }

    fn handle_response(&mut self, ctx: RtspMessageContext, resp: Response<Bytes>, now: Instant) {
        let cseq = parse::get_cseq(&resp);
        let pending = match self.pending.take() {
            Some(p) if Some(p.cseq) == cseq => p,
            Some(p) if cseq.is_none() => {
                debug!(
                    "{} response without CSeq; taking it as the reply to {} CSeq={}",
                    resp.status(),
                    <&str>::from(&p.method),
                    p.cseq
                );
                p
            }
            other => {
                debug!(
                    "ignoring {} response with CSeq {cseq:?}; expecting {:?}",
                    resp.status(),
                    other.as_ref().map(|p| p.cseq)
                );
                self.pending = other;
                return;
            }
        };
        let result = match pending.kind {
            PendingKind::KeepAlive => {
                trace!("keepalive response: {}", resp.status());
                Ok(())
            }
            PendingKind::Control(intent) => {
                self.handle_control_response(ctx, &pending, intent, &resp, now)
            }
            PendingKind::Handshake(step) => self.handle_handshake_response(ctx, pending, step, resp, now),
        };
        if let Err(e) = result {
            let done = self.handshake_done();
            self.on_play_result(Err(e), done, now);
        }
    }

    fn response_error(
        &self,
        ctx: RtspMessageContext,
        pending: &Pending,
        resp: &Response<Bytes>,
        description: String,
    ) -> Error {
        wrap!(ErrorInt::RtspResponseError {
            conn_ctx: self.conn_ctx(),
            msg_ctx: ctx,
            method: pending.method.clone(),
            cseq: pending.cseq,
            status: resp.status(),
            description,
        })
    }

    fn parse_error(&self, ctx: RtspMessageContext, pending: &Pending, description: String) -> Error {
        wrap!(ErrorInt::RtspResponseParseError {
            conn_ctx: self.conn_ctx(),
            msg_ctx: ctx,
            method: pending.method.clone(),
            cseq: pending.cseq,
            description,
        })
    }

    fn handle_handshake_response(
        &mut self,
        ctx: RtspMessageContext,
        pending: Pending,
        step: Step,
        resp: Response<Bytes>,
        now: Instant,
    ) -> Result<(), Error> {
        match u16::from(resp.status()) {
            200 => {}
            401 => return self.handle_unauthorized(ctx, pending, &resp),
            301 | 302 => {
                let location = parse::header(&resp, &headers::LOCATION)
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| self.parse_error(ctx, &pending, "redirect without Location".to_owned()))?
                    .to_owned();
                let parsed = playable_url(&location).map_err(|description| {
                    self.parse_error(ctx, &pending, format!("bad redirect: {description}"))
                })?;
                info!("redirected to {location}");
                self.start(parsed, now);
                return Ok(());
            }
            _ => return Err(self.response_error(ctx, &pending, &resp, "unexpected status".to_owned())),
        }
        match step {
            Step::Options => {
                self.supported = parse::header(&resp, &headers::PUBLIC)
                    .map(parse::parse_public)
                    .unwrap_or_default();
                trace!("server supports {:?}", &self.supported);
                self.send_describe();
                Ok(())
            }
            Step::Describe => self.handle_describe(ctx, &pending, &resp, now),
            Step::Setup { track, channel } => {
                self.handle_setup(ctx, &pending, track, channel, &resp)
            }
        }
    }

    /// Captures the challenge from a first `401` and re-sends the request with
    /// credentials; a second `401` is fatal.
    fn handle_unauthorized(
        &mut self,
        ctx: RtspMessageContext,
        pending: Pending,
        resp: &Response<Bytes>,
    ) -> Result<(), Error> {
        if let Some(c) = &self.challenge {
            return Err(self.response_error(
                ctx,
                &pending,
                resp,
                format!("authentication failed for realm {:?}", c.realm()),
            ));
        }
        let challenge = parse::header(resp, &headers::WWW_AUTHENTICATE)
            .and_then(auth::parse_challenge)
            .ok_or_else(|| {
                self.response_error(
                    ctx,
                    &pending,
                    resp,
                    "missing or unsupported WWW-Authenticate".to_owned(),
                )
            })?;
        if self.options.creds.as_ref().map_or(true, |c| c.username.is_empty()) {
            return Err(self.response_error(
                ctx,
                &pending,
                resp,
                "authentication required; no credentials supplied".to_owned(),
            ));
        }
        debug!("retrying {} with {challenge:?}", <&str>::from(&pending.method));
        self.challenge = Some(challenge);
        self.send_request(pending.method, pending.uri, pending.extra_headers, pending.kind);
        Ok(())
    }

    fn handle_describe(
        &mut self,
        ctx: RtspMessageContext,
        pending: &Pending,
        resp: &Response<Bytes>,
        now: Instant,
    ) -> Result<(), Error> {
        let desc = parse::parse_describe(&pending.uri, resp, self.options.play_track)
            .map_err(|d| self.parse_error(ctx, pending, d))?;
        if let Some(check) = &self.options.description_check {
            if !check(&desc.sdp) {
                return Err(self.parse_error(ctx, pending, "session description rejected".to_owned()));
            }
        }
        let mut tracks = Vec::with_capacity(desc.tracks.len());
        for (i, t) in desc.tracks.into_iter().enumerate() {
            debug!(
                "track {i}: {:?} {}/{} (payload type {}) at {}",
                t.media, t.encoding_name, t.clock_rate, t.payload_type, t.control
            );
            let timeline = Timeline::new(t.clock_rate).map_err(|d| self.parse_error(ctx, pending, d))?;
            tracks.push(Track {
                transport: self.options.transport,
                ssrc: None,
                interleaved: None,
                rtcp: RtcpContext::new(timeline.clock_rate()),
                timeline,
                last_beat: now,
                sent_rtcp: false,
                desc: t,
            });
        }
        debug!(
            "{} track(s) under {}; control {}",
            tracks.len(),
            desc.content_base,
            desc.control
        );
        self.tracks = tracks;
        self.control = Some(desc.control);
        self.send_setup(0)
    }

    fn handle_setup(
        &mut self,
        ctx: RtspMessageContext,
        pending: &Pending,
        i: usize,
        proposed_channel: Option<u8>,
        resp: &Response<Bytes>,
    ) -> Result<(), Error> {
        if i == 0 {
            match parse::header(resp, &headers::SESSION) {
                Some(s) => self.session_id = Some(parse::session_id(s).to_owned()),
                None => debug!("SETUP response has no Session header"),
            }
        }
        let transport = parse::header(resp, &headers::TRANSPORT)
            .ok_or_else(|| self.parse_error(ctx, pending, "missing Transport header".to_owned()))?;
        let info = parse::parse_transport(transport).map_err(|d| self.parse_error(ctx, pending, d))?;
        let mode = info.mode.unwrap_or(Transport::Udp);
        if mode != self.options.transport {
            info!("track {i}: server chose {mode:?} over {:?}", self.options.transport);
        }
        let peer_ip: IpAddr = info.source.unwrap_or_else(|| self.conn_ctx().peer_addr().ip());
        let conn_ctx = self.conn_ctx();
        let setup_error = |source| {
            wrap!(ErrorInt::UdpSetupError {
                conn_ctx,
                track: i,
                source,
            })
        };
        let mut interleaved = None;
        match mode {
            Transport::Tcp => {
                let ch = info
                    .interleaved
                    .map(|(rtp, _)| rtp)
                    .or(proposed_channel)
                    .ok_or_else(|| self.parse_error(ctx, pending, "no interleaved channels".to_owned()))?;
                self.transport
                    .assign_interleaved(i, ch)
                    .map_err(|d| self.parse_error(ctx, pending, d))?;
                interleaved = Some(ch);
            }
            Transport::Udp => {
                let ports = info
                    .server_port
                    .ok_or_else(|| self.parse_error(ctx, pending, "no server_port".to_owned()))?;
                self.transport
                    .connect_unicast(i, peer_ip, ports)
                    .map_err(setup_error)?;
            }
            Transport::Multicast => {
                let ports = info
                    .port
                    .ok_or_else(|| self.parse_error(ctx, pending, "no multicast port".to_owned()))?;
                let group = info.destination.ok_or_else(|| {
                    self.parse_error(ctx, pending, "no multicast destination".to_owned())
                })?;
                self.transport
                    .open_multicast(i, group, ports, peer_ip)
                    .map_err(setup_error)?;
            }
        }
        let track = &mut self.tracks[i];
        track.transport = mode;
        track.ssrc = info.ssrc;
        track.interleaved = interleaved;
        trace!("track {i}: {mode:?}, ssrc {:08x?}, interleaved {interleaved:?}", info.ssrc);

        if i + 1 < self.tracks.len() {
            return self.send_setup(i + 1);
        }
        self.phase = Phase::AwaitingPlay;
        match self.options.speed {
            Some(s) => self.send_control(Intent::Speed(s)),
            None => self.send_control(Intent::Play(0.0)),
        }
        Ok(())
    }

    fn handle_control_response(
        &mut self,
        ctx: RtspMessageContext,
        pending: &Pending,
        intent: Intent,
        resp: &Response<Bytes>,
        now: Instant,
    ) -> Result<(), Error> {
        if u16::from(resp.status()) != 200 {
            match intent {
                Intent::Pause => warn!("pause failed: {}", resp.status()),
                Intent::Seek(_) => warn!("seek failed: {}", resp.status()),
                Intent::Play(_) | Intent::Speed(_) => {
                    let e = self.response_error(ctx, pending, resp, "play failed".to_owned());
                    let done = self.handshake_done();
                    self.on_play_result(Err(e), done, now);
                }
            }
            return Ok(());
        }
        let requested = match intent {
            Intent::Pause => {
                debug!("paused");
                self.media_check = None;
                self.phase = Phase::Paused;
                return Ok(());
            }
            Intent::Play(pos) | Intent::Seek(pos) => pos,
            Intent::Speed(_) => self.progress_secs(),
        };
        let position_secs = match parse::header(resp, &headers::RANGE) {
            Some(r) => parse::npt_start(r).map_err(|d| self.parse_error(ctx, pending, d))?,
            None => requested,
        };
        for t in &mut self.tracks {
            t.timeline.reset();
            if matches!(intent, Intent::Seek(_)) {
                t.rtcp.clear();
            }
        }
        self.seek_base = position_secs;
        self.phase = Phase::Playing;
        let done = self.handshake_done();
        self.on_play_result(Ok(Playback { position_secs }), done, now);
        Ok(())
    }

    fn handle_interleaved(
        &mut self,
        channel: u8,
        data: Bytes,
        msg_ctx: RtspMessageContext,
        now: Instant,
    ) {
        if self.benchmark && self.handshake_done() {
            self.last_rtp = now;
            return;
        }
        let Some(m) = self.transport.demux_interleaved(channel, self.tracks.len()) else {
            return;
        };
        if m.track_i >= self.tracks.len() {
            warn!("interleaved channel {channel} maps to unknown track {}", m.track_i);
            return;
        }
        let pkt_ctx = PacketContext::tcp(msg_ctx);
        match m.channel_type {
            ChannelType::Rtp => self.handle_rtp(m.track_i, data, pkt_ctx, now),
            ChannelType::Rtcp => self.handle_rtcp(m.track_i, &data, pkt_ctx, now),
        }
    }

    pub(crate) fn poll_datagram(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Datagram, (usize, std::io::Error)>> {
        self.transport.poll_recv(cx)
    }

    pub(crate) fn handle_datagram(&mut self, d: Datagram, now: Instant) {
        if !self.transport.accept(d.track, d.kind, d.from) {
            return;
        }
        if self.benchmark && self.handshake_done() {
            self.last_rtp = now;
            return;
        }
        if d.track >= self.tracks.len() {
            warn!("datagram for unknown track {}", d.track);
            return;
        }
        let pkt_ctx = PacketContext::udp(d.from);
        match d.kind {
            ChannelType::Rtp => self.handle_rtp(d.track, d.data, pkt_ctx, now),
            ChannelType::Rtcp => self.handle_rtcp(d.track, &d.data, pkt_ctx, now),
        }
    }

    fn handle_rtp(&mut self, i: usize, data: Bytes, pkt_ctx: PacketContext, now: Instant) {
        let len = data.len();
        let (raw, payload_range) = match RawPacket::new(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "[{pkt_ctx}] track {i}: dropping bad RTP packet: {}\n{:#?}",
                    e.reason,
                    crate::hex::LimitedHex::new(&e.data, 64)
                );
                return;
            }
        };
        let track = &mut self.tracks[i];
        if matches!(track.ssrc, Some(s) if s != raw.ssrc()) {
            warn!(
                "[{pkt_ctx}] track {i}: dropping RTP with ssrc {:08x}; expected {:08x?}",
                raw.ssrc(),
                track.ssrc
            );
            return;
        }
        track.rtcp.on_rtp(raw.sequence_number(), raw.timestamp(), len, now);
        self.maybe_keepalive(i, raw.ssrc(), now);

        let track = &mut self.tracks[i];
        let timestamp = match track.timeline.advance_to(raw.timestamp()) {
            Ok(ts) => ts,
            Err(description) => {
                let e = wrap!(ErrorInt::PacketError {
                    conn_ctx: self.conn_ctx(),
                    pkt_ctx,
                    track: i,
                    description,
                });
                warn!("dropping packet: {e}");
                return;
            }
        };
        let ntp_timestamp = track.rtcp.ntp_for(raw.timestamp());
        self.last_rtp = now;
        self.emit(PlayerEvent::Packet(ReceivedPacket {
            ctx: pkt_ctx,
            track: i,
            timestamp,
            ntp_timestamp,
            raw,
            payload_range,
        }));
    }

    fn handle_rtcp(&mut self, i: usize, data: &[u8], pkt_ctx: PacketContext, now: Instant) {
        if let Err(e) = crate::rtcp::validate_compound(data) {
            warn!(
                "[{pkt_ctx}] track {i}: dropping bad RTCP: {e}\n{:#?}",
                crate::hex::LimitedHex::new(data, 64)
            );
            return;
        }
        for pkt in crate::rtcp::packets(data) {
            if let Err(e) = self.tracks[i].rtcp.on_rtcp(&pkt, now) {
                warn!("[{pkt_ctx}] track {i}: {e}");
                continue;
            }
            if let Ok(Some(sr)) = pkt.as_sender_report() {
                trace!("[{pkt_ctx}] track {i}: sender report {:?}", sr.ntp_timestamp());
                self.emit(PlayerEvent::SenderReport(SenderReport {
                    track: i,
                    ssrc: sr.ssrc(),
                    ntp_timestamp: sr.ntp_timestamp(),
                    rtp_timestamp: sr.rtp_timestamp(),
                }));
            }
        }
    }

    /// Sends a keepalive on track `i`'s behalf if its interval has elapsed.
    /// Driven by packet arrival rather than a timer.
    fn maybe_keepalive(&mut self, i: usize, ssrc: u32, now: Instant) {
        let beat = self.options.keepalive;
        let track = &mut self.tracks[i];
        if now.saturating_duration_since(track.last_beat) < self.options.keepalive_interval {
            return;
        }
        track.last_beat = now;
        track.sent_rtcp = match beat {
            BeatType::Signaling => false,
            BeatType::Rtcp => true,
            BeatType::Both => !track.sent_rtcp,
        };
        if !track.sent_rtcp {
            if i == 0 {
                self.send_keepalive();
            }
            return;
        }
        let report = track
            .rtcp
            .create_report(ssrc.wrapping_add(1), ssrc, &self.options.user_agent, now);
        trace!(
            "track {i}: sending receiver report; jitter {:.1}",
            track.rtcp.jitter()
        );
        match (track.transport, track.interleaved) {
            (Transport::Tcp, Some(ch)) => {
                let data = rtsp_types::Data::new(ch + 1, report);
                self.outbox.push_back(Output::Send(Message::Data(data)));
            }
            (Transport::Tcp, None) => warn!("track {i}: no interleaved channel for RTCP"),
            _ => {
                if let Err(e) = self.transport.send_rtcp(i, &report) {
                    warn!("track {i}: unable to send RTCP: {e}");
                }
            }
        }
    }

    /// Resolves a media type to a track: the first of that type, or the only
    /// track if there's just one.
    fn track_index_by_type(&self, media: MediaType) -> Option<usize> {
        if let Some(i) = self.tracks.iter().position(|t| t.desc.media == media) {
            return Some(i);
        }
        (self.tracks.len() == 1).then_some(0)
    }

    pub(crate) fn packet_loss_rate(&self, media: Option<MediaType>) -> f32 {
        let (lost, expected) = match media.and_then(|m| self.track_index_by_type(m)) {
            Some(i) => (self.tracks[i].rtcp.lost(), self.tracks[i].rtcp.expected()),
            None => self.tracks.iter().fold((0, 0), |(l, e), t| {
                (l + t.rtcp.lost(), e + t.rtcp.expected())
            }),
        };
        if expected == 0 {
            return 0.0;
        }
        (lost as f64 / expected as f64) as f32
    }

    /// Returns the normal play time reached: where the current `PLAY` started
    /// plus the furthest any track has advanced since.
    pub(crate) fn progress_secs(&self) -> f64 {
        self.seek_base
            + self
                .tracks
                .iter()
                .map(|t| t.timeline.elapsed_secs())
                .fold(0.0, f64::max)
    }
}

/// Parses `url`, which must name an RTSP stream.
fn playable_url(url: &str) -> Result<RtspUrl, String> {
    match MediaProtocol::from_url(url) {
        Some(MediaProtocol::Rtsp) => RtspUrl::parse(url),
        Some(p) => Err(format!("{p:?} urls aren't supported")),
        None => Err(format!("illegal rtsp url {url:?}")),
    }
}
