// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track data plane: UDP socket topology and first-line demultiplexing of
//! RTP/RTCP, whether it arrives on datagram sockets or interleaved on the
//! RTSP connection.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use super::channel_mapping::{ChannelMapping, ChannelMappings, ChannelType};

/// Sent once toward the server's RTP port to open NAT/firewall return paths.
const PUNCH: &[u8] = b"\xce\xfa\xed\xfe";

/// A datagram received on one of a track's sockets.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub(crate) track: usize,
    pub(crate) kind: ChannelType,
    pub(crate) from: SocketAddr,
    pub(crate) data: Bytes,
}

struct TrackSockets {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    local_rtp_port: u16,

    /// The only address datagrams are accepted from; unset until `SETUP`
    /// completes.
    peer_ip: Option<IpAddr>,
    rtcp_peer: Option<SocketAddr>,
}

/// Owns the sockets implied by the negotiated transport of each track.
pub(crate) struct TransportManager {
    channels: ChannelMappings,
    tracks: Vec<Option<TrackSockets>>,

    /// Local address for UDP sockets, and the multicast interface.
    bind_ip: Option<IpAddr>,

    /// Where the next [`Self::poll_recv`] starts, so no socket starves.
    next_poll: usize,
    buf: Box<[u8]>,
}

impl TransportManager {
    pub(crate) fn new(bind_ip: Option<IpAddr>) -> Self {
        TransportManager {
            channels: ChannelMappings::default(),
            tracks: Vec::new(),
            bind_ip,
            next_poll: 0,
            buf: vec![0; 65_536].into_boxed_slice(),
        }
    }

    fn slot(&mut self, track: usize) -> &mut Option<TrackSockets> {
        if track >= self.tracks.len() {
            self.tracks.resize_with(track + 1, || None);
        }
        &mut self.tracks[track]
    }

    /// Proposes an interleaved channel pair for `track`, preferring `preferred`.
    pub(crate) fn propose_channel(&self, preferred: u8) -> Option<u8> {
        self.channels.propose(preferred)
    }

    pub(crate) fn assign_interleaved(&mut self, track: usize, rtp_channel: u8) -> Result<(), String> {
        self.channels.assign(rtp_channel, track)
    }

    /// Maps an interleaved frame's channel to a track: even channels are RTP
    /// for `channel / 2`, odd ones RTCP for the same.
    pub(crate) fn demux_interleaved(
        &self,
        channel: u8,
        track_count: usize,
    ) -> Option<ChannelMapping> {
        self.channels.lookup_or_single(channel, track_count)
    }

    /// Binds a unicast RTP/RTCP pair for `track` unless one exists, returning
    /// the local RTP port. The RTCP port is the next one up.
    pub(crate) fn open_unicast(&mut self, track: usize) -> io::Result<u16> {
        let ip = self.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let slot = self.slot(track);
        if let Some(s) = slot {
            return Ok(s.local_rtp_port);
        }
        let pair = crate::tokio::UdpPair::for_ip(ip)?;
        debug!("track {track}: bound RTP/RTCP on {ip}:{}-{}", pair.rtp_port, pair.rtp_port + 1);
        *slot = Some(TrackSockets {
            rtp: pair.rtp_socket,
            rtcp: pair.rtcp_socket,
            local_rtp_port: pair.rtp_port,
            peer_ip: None,
            rtcp_peer: None,
        });
        Ok(pair.rtp_port)
    }

    /// Points `track`'s unicast sockets at the server and punches the return path.
    pub(crate) fn connect_unicast(
        &mut self,
        track: usize,
        peer_ip: IpAddr,
        server_port: (u16, u16),
    ) -> io::Result<()> {
        self.open_unicast(track)?;
        let Some(s) = self.slot(track) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no sockets"));
        };
        s.peer_ip = Some(peer_ip);
        s.rtcp_peer = Some(SocketAddr::new(peer_ip, server_port.1));
        let to = SocketAddr::new(peer_ip, server_port.0);
        match send_now(&s.rtp, PUNCH, to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("track {track}: NAT punch to {to} not sent; socket buffer full");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Joins `group` on `port.0` for RTP, preferring a source-filtered join
    /// on `peer_ip`, and opens an ephemeral RTCP socket aimed at `peer_ip:port.1`.
    pub(crate) fn open_multicast(
        &mut self,
        track: usize,
        group: IpAddr,
        port: (u16, u16),
        peer_ip: IpAddr,
    ) -> io::Result<()> {
        let domain = match group {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let rtp = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        rtp.set_reuse_address(true)?;
        let wildcard = match group {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        rtp.bind(&SocketAddr::new(wildcard, port.0).into())?;
        match (group, peer_ip) {
            (IpAddr::V4(g), IpAddr::V4(source)) => {
                let iface = match self.bind_ip {
                    Some(IpAddr::V4(i)) => i,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                if let Err(e) = rtp.join_ssm_v4(&source, &g, &iface) {
                    debug!("track {track}: source-filtered join of {g} failed ({e}); joining unfiltered");
                    rtp.join_multicast_v4(&g, &iface)?;
                }
            }
            (IpAddr::V4(g), IpAddr::V6(_)) => {
                rtp.join_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED)?;
            }
            (IpAddr::V6(g), _) => rtp.join_multicast_v6(&g, 0)?,
        }
        rtp.set_nonblocking(true)?;
        let rtp = UdpSocket::from_std(rtp.into())?;

        let rtcp = std::net::UdpSocket::bind(SocketAddr::new(wildcard, 0))?;
        rtcp.set_nonblocking(true)?;
        let rtcp = UdpSocket::from_std(rtcp)?;
        debug!("track {track}: joined {group} port {}; RTCP to {peer_ip}:{}", port.0, port.1);
        *self.slot(track) = Some(TrackSockets {
            rtp,
            rtcp,
            local_rtp_port: port.0,
            peer_ip: Some(peer_ip),
            rtcp_peer: Some(SocketAddr::new(peer_ip, port.1)),
        });
        Ok(())
    }

    /// Returns true if a datagram from `from` may be processed for `track`.
    /// Anything else is logged and should be dropped.
    pub(crate) fn accept(&self, track: usize, kind: ChannelType, from: SocketAddr) -> bool {
        let expected = self
            .tracks
            .get(track)
            .and_then(Option::as_ref)
            .and_then(|s| s.peer_ip);
        if expected == Some(from.ip()) {
            return true;
        }
        match expected {
            Some(e) => warn!("track {track}: dropping {kind:?} from {from}; expected {e}"),
            None => warn!("track {track}: dropping {kind:?} from {from}; no peer yet"),
        }
        false
    }

    /// Sends an RTCP packet on `track`'s UDP socket.
    pub(crate) fn send_rtcp(&self, track: usize, data: &[u8]) -> io::Result<()> {
        let s = self
            .tracks
            .get(track)
            .and_then(Option::as_ref)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no RTCP socket"))?;
        let peer = s
            .rtcp_peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no RTCP peer"))?;
        match send_now(&s.rtcp, data, peer) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("track {track}: dropped RTCP; socket not writable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Polls every socket for a datagram, round-robin.
    pub(crate) fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Datagram, (usize, io::Error)>> {
        let n = self.tracks.len() * 2;
        for i in 0..n {
            let idx = (self.next_poll + i) % n;
            let track = idx / 2;
            let Some(s) = &self.tracks[track] else {
                continue;
            };
            let (sock, kind) = match idx % 2 {
                0 => (&s.rtp, ChannelType::Rtp),
                _ => (&s.rtcp, ChannelType::Rtcp),
            };
            let mut buf = ReadBuf::new(&mut self.buf);
            match sock.poll_recv_from(cx, &mut buf) {
                Poll::Pending => continue,
                Poll::Ready(Err(e)) => return Poll::Ready(Err((track, e))),
                Poll::Ready(Ok(from)) => {
                    self.next_poll = (idx + 1) % n;
                    return Poll::Ready(Ok(Datagram {
                        track,
                        kind,
                        from,
                        data: Bytes::copy_from_slice(buf.filled()),
                    }));
                }
            }
        }
        Poll::Pending
    }

    /// Closes all sockets and forgets all channel assignments.
    pub(crate) fn reset(&mut self) {
        self.tracks.clear();
        self.channels.clear();
        self.next_poll = 0;
    }

    /// Returns true if any track has UDP sockets open.
    #[cfg(test)]
    pub(crate) fn has_sockets(&self) -> bool {
        self.tracks.iter().any(Option::is_some)
    }

    /// Returns `(local RTP port, RTCP peer)` for `track`'s sockets.
    #[cfg(test)]
    pub(crate) fn endpoints(&self, track: usize) -> Option<(u16, Option<SocketAddr>)> {
        self.tracks
            .get(track)
            .and_then(Option::as_ref)
            .map(|s| (s.local_rtp_port, s.rtcp_peer))
    }
}

/// Sends one datagram on the non-blocking fd directly.
///
/// tokio's `try_send_to` reports `WouldBlock` until the reactor has seen the
/// socket become writable, which hasn't happened yet for a freshly bound socket.
fn send_now(sock: &UdpSocket, data: &[u8], to: SocketAddr) -> io::Result<()> {
    socket2::SockRef::from(sock).send_to(data, &to.into())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn unicast_punch_and_receive() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let server_rtp = UdpSocket::bind((localhost, 0)).await.unwrap();
        let server_rtcp = UdpSocket::bind((localhost, 0)).await.unwrap();
        let server_ports = (
            server_rtp.local_addr().unwrap().port(),
            server_rtcp.local_addr().unwrap().port(),
        );

        let mut tm = TransportManager::new(Some(localhost));
        let port = tm.open_unicast(0).unwrap();
        assert_eq!(port % 2, 0);
        assert_eq!(tm.open_unicast(0).unwrap(), port);
        tm.connect_unicast(0, localhost, server_ports).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), server_rtp.recv_from(&mut buf))
            .await
            .expect("NAT punch")
            .unwrap();
        assert_eq!(&buf[..len], PUNCH);
        assert_eq!(from.port(), port);

        server_rtcp
            .send_to(b"rtcp", (localhost, port + 1))
            .await
            .unwrap();
        let d = futures::future::poll_fn(|cx| tm.poll_recv(cx)).await.unwrap();
        assert_eq!(d.track, 0);
        assert_eq!(d.kind, ChannelType::Rtcp);
        assert_eq!(&d.data[..], b"rtcp");
        assert!(tm.accept(0, d.kind, d.from));

        tm.send_rtcp(0, b"report").unwrap();
        let (len, _) = server_rtcp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"report");

        tm.reset();
        assert!(!tm.has_sockets());
    }

    #[tokio::test]
    async fn rejects_other_senders() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut tm = TransportManager::new(Some(localhost));
        tm.open_unicast(1).unwrap();
        let from: SocketAddr = "127.0.0.1:6970".parse().unwrap();
        assert!(!tm.accept(1, ChannelType::Rtp, from));
        tm.connect_unicast(1, localhost, (6970, 6971)).unwrap();
        assert!(tm.accept(1, ChannelType::Rtp, from));
        assert!(!tm.accept(1, ChannelType::Rtp, "10.1.2.3:6970".parse().unwrap()));
        assert!(!tm.accept(0, ChannelType::Rtp, from));
    }

    #[test]
    fn interleaved_demux() {
        let mut tm = TransportManager::new(None);
        for track in 0..3 {
            let ch = tm.propose_channel(0).unwrap();
            tm.assign_interleaved(track, ch).unwrap();
        }
        let m = tm.demux_interleaved(4, 3).unwrap();
        assert_eq!((m.track_i, m.channel_type), (2, ChannelType::Rtp));
        let m = tm.demux_interleaved(5, 3).unwrap();
        assert_eq!((m.track_i, m.channel_type), (2, ChannelType::Rtcp));
        assert!(tm.demux_interleaved(6, 3).is_none());
    }
}
