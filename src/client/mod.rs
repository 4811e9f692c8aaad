// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: a tokio-driven [`Player`] around a sans-IO session state machine.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::rtp::ReceivedPacket;
use crate::{Error, ErrorInt, NtpTimestamp};

use self::session::{Output, Session};

mod auth;
mod channel_mapping;
mod parse;
mod rtcp_context;
mod session;
mod timeline;
mod transport;
mod url;

pub use self::timeline::Timeline;
pub use self::url::MediaProtocol;

/// Credentials for `Digest` or `Basic` authentication.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,

    /// The plaintext password, or if `password_is_md5`, the hex MD5 of
    /// `username:realm:password`. The latter only works with `Digest`.
    pub password: String,
    pub password_is_md5: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"(redacted)")
            .field("password_is_md5", &self.password_is_md5)
            .finish()
    }
}

/// The lower transport proposed in `SETUP`. The server's answer may differ;
/// it wins.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    /// RTP/RTCP interleaved on the RTSP connection.
    #[default]
    Tcp,

    /// A unicast RTP/RTCP socket pair per track.
    Udp,

    /// A multicast group per track.
    Multicast,
}

impl std::str::FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            "multicast" => Transport::Multicast,
            _ => bail!(ErrorInt::InvalidArgument(format!(
                "bad Transport {s:?}; expected tcp, udp, or multicast"
            ))),
        })
    }
}

/// How the session is kept alive while playing.
///
/// Some servers want RTCP receiver reports, others want RTSP requests; by
/// default each track alternates between the two.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BeatType {
    #[default]
    Both,
    Rtcp,

    /// `GET_PARAMETER` if the server advertises it, else `OPTIONS`. Sent only
    /// on behalf of the first track.
    Signaling,
}

/// The media type of an SDP `m=` section.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

impl MediaType {
    /// The interleaved RTP channel to propose for a track of this type.
    fn interleaved_base(self) -> u8 {
        match self {
            MediaType::Video => 0,
            MediaType::Audio => 2,
            MediaType::Application => 6,
        }
    }
}

/// Options which must be known before `play`.
#[derive(Clone)]
pub struct PlayerOptions {
    transport: Transport,
    handshake_timeout: Duration,
    media_timeout: Duration,
    keepalive: BeatType,
    keepalive_interval: Duration,
    speed: Option<f32>,
    creds: Option<Credentials>,
    benchmark: bool,
    play_track: Option<MediaType>,
    bind_ip: Option<IpAddr>,
    user_agent: String,
    description_check: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    max_message_size: usize,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            handshake_timeout: Duration::from_secs(10),
            media_timeout: Duration::from_secs(5),
            keepalive: BeatType::default(),
            keepalive_interval: Duration::from_secs(5),
            speed: None,
            creds: None,
            benchmark: false,
            play_track: None,
            bind_ip: None,
            user_agent: concat!("rtsp-player/", env!("CARGO_PKG_VERSION")).to_owned(),
            description_check: None,
            max_message_size: 0,
        }
    }
}

impl std::fmt::Debug for PlayerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerOptions")
            .field("transport", &self.transport)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("media_timeout", &self.media_timeout)
            .field("keepalive", &self.keepalive)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("speed", &self.speed)
            .field("creds", &self.creds)
            .field("benchmark", &self.benchmark)
            .field("play_track", &self.play_track)
            .field("bind_ip", &self.bind_ip)
            .field("user_agent", &self.user_agent)
            .field("description_check", &self.description_check.is_some())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl PlayerOptions {
    pub fn transport(self, transport: Transport) -> Self {
        Self { transport, ..self }
    }

    /// Limits the time from `play` to its [`PlayerEvent::PlayResult`].
    pub fn handshake_timeout(self, handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            ..self
        }
    }

    /// Limits the silence between RTP packets once playing.
    pub fn media_timeout(self, media_timeout: Duration) -> Self {
        Self {
            media_timeout,
            ..self
        }
    }

    pub fn keepalive(self, keepalive: BeatType) -> Self {
        Self { keepalive, ..self }
    }

    /// Sets the per-track keepalive interval. Keepalives are only checked as
    /// RTP packets arrive.
    pub fn keepalive_interval(self, keepalive_interval: Duration) -> Self {
        Self {
            keepalive_interval,
            ..self
        }
    }

    /// Requests a playback speed via the `Scale` header instead of a plain `PLAY`.
    pub fn speed(self, speed: Option<f32>) -> Self {
        Self { speed, ..self }
    }

    /// Sets credentials. Credentials in the URL take precedence.
    pub fn creds(self, creds: Option<Credentials>) -> Self {
        Self { creds, ..self }
    }

    /// Once playing, skips RTP parsing entirely; only media liveness is tracked.
    pub fn benchmark(self, benchmark: bool) -> Self {
        Self { benchmark, ..self }
    }

    /// Plays only the first track of the given type, rather than all audio and
    /// video tracks.
    pub fn play_track(self, play_track: Option<MediaType>) -> Self {
        Self { play_track, ..self }
    }

    /// Sets the local address for UDP sockets and the multicast interface.
    pub fn bind_ip(self, bind_ip: Option<IpAddr>) -> Self {
        Self { bind_ip, ..self }
    }

    /// Sets the `User-Agent` header, also used as the RTCP CNAME.
    pub fn user_agent(self, user_agent: String) -> Self {
        Self { user_agent, ..self }
    }

    /// Installs a check on the SDP; returning false fails the play attempt.
    pub fn description_check<F>(self, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            description_check: Some(Arc::new(check)),
            ..self
        }
    }

    /// Limits bytes buffered toward one RTSP message; `0` means 4 MiB.
    pub fn max_message_size(self, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..self
        }
    }
}

/// Where playback (re)started.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Playback {
    /// Normal play time in seconds, from the `Range` response header or the
    /// requested position.
    pub position_secs: f64,
}

/// A received RTCP sender report.
#[derive(Copy, Clone, Debug)]
pub struct SenderReport {
    pub track: usize,
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
}

#[derive(Debug)]
pub enum PlayerEvent {
    /// The outcome of `play`: exactly one per attempt.
    PlayResult(Result<Playback, Error>),

    /// A later `PLAY` (resume, seek, speed change) succeeded.
    Resume(Playback),

    /// The session failed after a successful `PlayResult`.
    Shutdown(Error),
    Packet(ReceivedPacket),
    SenderReport(SenderReport),
}

#[derive(Debug)]
enum Command {
    Play(String),
    Pause(bool),
    Seek(f64),
    Speed(f32),
    Teardown,
    PacketLossRate(Option<MediaType>, oneshot::Sender<f32>),
    Progress(oneshot::Sender<f64>),
}

/// An RTSP player. Must be created within a tokio runtime.
///
/// Commands are queued to a spawned task which owns the connection, sockets,
/// and session state; results arrive via the [`futures::Stream`] impl.
/// Dropping the player tears the session down in the background.
pub struct Player {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<PlayerEvent>,
}

impl Player {
    pub fn new(options: PlayerOptions) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(drive(Session::new(options), commands_rx, events_tx));
        Player { commands, events }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("player task has exited");
        }
    }

    /// Starts playing `url`, first tearing down any existing session.
    pub fn play(&self, url: &str) {
        self.send(Command::Play(url.to_owned()));
    }

    /// Pauses, or resumes from the current progress.
    pub fn pause(&self, pause: bool) {
        self.send(Command::Pause(pause));
    }

    pub fn seek(&self, position_secs: f64) {
        self.send(Command::Seek(position_secs));
    }

    pub fn set_speed(&self, speed: f32) {
        self.send(Command::Speed(speed));
    }

    pub fn teardown(&self) {
        self.send(Command::Teardown);
    }

    /// Returns lost/expected packets for the track of the given type, or all
    /// tracks if it can't be resolved. `0.0` before any packets.
    pub async fn packet_loss_rate(&self, media: Option<MediaType>) -> f32 {
        let (tx, rx) = oneshot::channel();
        self.send(Command::PacketLossRate(media, tx));
        rx.await.unwrap_or(0.0)
    }

    /// Returns the normal play time in seconds reached so far.
    pub async fn progress_secs(&self) -> f64 {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Progress(tx));
        rx.await.unwrap_or(0.0)
    }

    /// Returns a handle which doesn't keep the session alive.
    pub fn downgrade(&self) -> PlayerRef {
        PlayerRef(self.commands.downgrade())
    }
}

impl futures::Stream for Player {
    type Item = PlayerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PlayerEvent>> {
        self.events.poll_recv(cx)
    }
}

/// A non-owning handle to a [`Player`], usable from any thread. Commands sent
/// after the player is gone are silently discarded.
#[derive(Clone)]
pub struct PlayerRef(mpsc::WeakUnboundedSender<Command>);

impl PlayerRef {
    fn send(&self, command: Command) {
        match self.0.upgrade() {
            Some(tx) => {
                let _ = tx.send(command);
            }
            None => trace!("discarding {command:?} for vanished player"),
        }
    }

    pub fn teardown(&self) {
        self.send(Command::Teardown);
    }

    pub fn pause(&self, pause: bool) {
        self.send(Command::Pause(pause));
    }

    pub fn seek(&self, position_secs: f64) {
        self.send(Command::Seek(position_secs));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d.into()).await,
        None => futures::future::pending().await,
    }
}

async fn next_message(
    conn: &mut Option<crate::tokio::Connection>,
) -> Option<Result<crate::ReceivedMessage, Error>> {
    match conn {
        Some(c) => c.next().await,
        None => futures::future::pending().await,
    }
}

type ConnectFuture =
    Pin<Box<dyn std::future::Future<Output = std::io::Result<crate::tokio::Connection>> + Send>>;

async fn connecting(f: &mut Option<ConnectFuture>) -> std::io::Result<crate::tokio::Connection> {
    match f {
        Some(f) => f.await,
        None => futures::future::pending().await,
    }
}

/// Runs a session: carries out its outputs and feeds it commands, messages,
/// datagrams, and timer expirations until the [`Player`] is dropped.
async fn drive(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PlayerEvent>,
) {
    let mut conn: Option<crate::tokio::Connection> = None;
    let mut connect: Option<ConnectFuture> = None;
    let max_message_size = session.max_message_size();
    loop {
        while let Some(output) = session.poll_output() {
            match output {
                Output::Connect { host, port } => {
                    conn = None;
                    connect = Some(Box::pin(crate::tokio::Connection::connect(
                        host,
                        port,
                        max_message_size,
                    )));
                }
                Output::Send(msg) => {
                    let Some(c) = conn.as_mut() else {
                        debug!("no connection; dropping outbound message");
                        continue;
                    };
                    if let Err(e) = c.send(msg).await {
                        conn = None;
                        session.on_connection_error(wrap!(e), Instant::now());
                    }
                }
                Output::Close => {
                    conn = None;
                    connect = None;
                }
                Output::Event(e) => {
                    let _ = events.send(e);
                }
            }
        }

        let deadline = session.next_deadline();
        tokio::select! {
            cmd = commands.recv() => {
                let now = Instant::now();
                match cmd {
                    None => {
                        session.teardown(now);
                        while let Some(output) = session.poll_output() {
                            if let (Output::Send(msg), Some(c)) = (output, conn.as_mut()) {
                                if let Err(e) = c.send(msg).await {
                                    session.on_connection_error(wrap!(e), now);
                                }
                            }
                        }
                        debug!("player dropped; task exiting");
                        return;
                    }
                    Some(Command::Play(url)) => session.play(&url, now),
                    Some(Command::Pause(p)) => session.pause(p, now),
                    Some(Command::Seek(s)) => session.seek(s, now),
                    Some(Command::Speed(s)) => session.set_speed(s, now),
                    Some(Command::Teardown) => session.teardown(now),
                    Some(Command::PacketLossRate(m, tx)) => {
                        let _ = tx.send(session.packet_loss_rate(m));
                    }
                    Some(Command::Progress(tx)) => {
                        let _ = tx.send(session.progress_secs());
                    }
                }
            }
            r = connecting(&mut connect) => {
                connect = None;
                match r {
                    Ok(c) => {
                        let ctx = *c.ctx();
                        conn = Some(c);
                        session.on_connected(ctx, Instant::now());
                    }
                    Err(e) => session.on_connect_failed(e, Instant::now()),
                }
            }
            msg = next_message(&mut conn) => {
                let now = Instant::now();
                match msg {
                    Some(Ok(msg)) => session.handle_message(msg, now),
                    Some(Err(e)) => {
                        conn = None;
                        session.on_connection_error(e, now);
                    }
                    None => {
                        if let Some(c) = conn.take() {
                            let e = wrap!(ErrorInt::ConnectionClosed {
                                conn_ctx: *c.ctx(),
                                msg_ctx: c.eof_ctx(),
                            });
                            session.on_connection_error(e, now);
                        }
                    }
                }
            }
            d = futures::future::poll_fn(|cx| session.poll_datagram(cx)) => {
                let now = Instant::now();
                match d {
                    Ok(d) => session.handle_datagram(d, now),
                    Err((track, source)) => {
                        warn!("UDP receive on track {track} failed: {source}");
                        session.on_udp_error(track, source, now);
                    }
                }
            }
            _ = sleep_until(deadline) => session.on_timer(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::rtp::RawPacketBuilder;
    use crate::testutil::init_logging;

    const SDP: &str = "v=0\r\n\
                       o=- 1 1 IN IP4 127.0.0.1\r\n\
                       s=Mock\r\n\
                       t=0 0\r\n\
                       a=control:*\r\n\
                       m=video 0 RTP/AVP 96\r\n\
                       a=rtpmap:96 H264/90000\r\n\
                       a=control:trackID=1\r\n";

    /// Reads one bodiless request, returning its method and `CSeq`.
    async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<(String, String)> {
        loop {
            if let Some(end) = crate::splitter::find_header_end(buf) {
                let text = String::from_utf8(buf.drain(..end).collect()).unwrap();
                let method = text.split(' ').next().unwrap().to_owned();
                let cseq = text
                    .lines()
                    .find_map(|l| l.strip_prefix("CSeq: "))
                    .unwrap()
                    .to_owned();
                return Some((method, cseq));
            }
            let mut chunk = [0u8; 1024];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Serves one connection; returns the methods requested, in order.
    async fn mock_server(listener: TcpListener) -> Vec<String> {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut methods = Vec::new();
        while let Some((method, cseq)) = read_request(&mut stream, &mut buf).await {
            let (headers, body) = match method.as_str() {
                "OPTIONS" => ("Public: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN\r\n".to_owned(), ""),
                "DESCRIBE" => ("Content-Type: application/sdp\r\n".to_owned(), SDP),
                "SETUP" => (
                    "Session: 1234;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n"
                        .to_owned(),
                    "",
                ),
                "PLAY" => ("Session: 1234\r\nRange: npt=0.000-\r\n".to_owned(), ""),
                _ => ("Session: 1234\r\n".to_owned(), ""),
            };
            let resp = format!(
                "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{headers}Content-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let done = method == "TEARDOWN";
            let play = method == "PLAY";
            methods.push(method);

            // The player may hang up right after TEARDOWN.
            if stream.write_all(resp.as_bytes()).await.is_err() || done {
                break;
            }
            if play {
                for seq in 0..3u16 {
                    let pkt = RawPacketBuilder {
                        sequence_number: seq,
                        timestamp: u32::from(seq) * 3000,
                        payload_type: 96,
                        ssrc: 0x4cacc3d1,
                        mark: true,
                    }
                    .build(*b"frame")
                    .unwrap();
                    let mut framed = vec![b'$', 0];
                    framed.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
                    framed.extend_from_slice(&pkt);
                    stream.write_all(&framed).await.unwrap();
                }
            }
        }
        methods
    }

    #[tokio::test]
    async fn play_over_tcp() {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(mock_server(listener));

        let mut player = Player::new(PlayerOptions::default());
        player.play(&format!("rtsp://{addr}/stream"));
        match player.next().await {
            Some(PlayerEvent::PlayResult(Ok(p))) => assert_eq!(p.position_secs, 0.0),
            o => panic!("unexpected {o:?}"),
        }
        for seq in 0..3u16 {
            match player.next().await {
                Some(PlayerEvent::Packet(p)) => {
                    assert_eq!(p.sequence_number(), seq);
                    assert_eq!(p.payload(), b"frame");
                }
                o => panic!("unexpected {o:?}"),
            }
        }
        assert_eq!(player.packet_loss_rate(Some(MediaType::Video)).await, 0.0);
        let progress = player.progress_secs().await;
        assert!((progress - 6000.0 / 90000.0).abs() < 1e-9, "{progress}");

        player.teardown();
        let methods = server.await.unwrap();
        assert_eq!(
            methods,
            ["OPTIONS", "DESCRIBE", "SETUP", "PLAY", "TEARDOWN"]
        );
    }

    #[tokio::test]
    async fn connect_refused() {
        let addr: SocketAddr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let mut player = Player::new(PlayerOptions::default());
        player.play(&format!("rtsp://{addr}/"));
        match player.next().await {
            Some(PlayerEvent::PlayResult(Err(e))) => assert_eq!(e.kind(), crate::ErrorKind::Network),
            o => panic!("unexpected {o:?}"),
        }
    }

    #[tokio::test]
    async fn weak_ref_outlived() {
        let player = Player::new(PlayerOptions::default());
        let weak = player.downgrade();
        weak.pause(true);
        drop(player);
        tokio::task::yield_now().await;
        weak.teardown();
        weak.seek(1.0);
    }

    #[test]
    fn transport_from_str() {
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        "carrier-pigeon".parse::<Transport>().unwrap_err();
    }

    #[test]
    fn credentials_debug_redacts() {
        let c = Credentials {
            username: "admin".to_owned(),
            password: "hunter2".to_owned(),
            password_is_md5: false,
        };
        let s = format!("{c:?}");
        assert!(s.contains("admin"));
        assert!(!s.contains("hunter2"));
    }
}
