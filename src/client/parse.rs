// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and session descriptions.

use std::collections::HashSet;
use std::net::IpAddr;

use bytes::Bytes;
use log::debug;
use sdp_types::Media;
use url::Url;

use super::{MediaType, Transport};

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1),
/// as `(payload type, encoding, media, clock rate)`.
/// The registry is officially closed, so this list should never change.
#[rustfmt::skip]
static STATIC_PAYLOAD_TYPES: [(u8, &str, &str, u32); 24] = [
    (0, "pcmu", "audio", 8_000),
    (3, "gsm", "audio", 8_000),
    (4, "g723", "audio", 8_000),
    (5, "dvi4", "audio", 8_000),
    (6, "dvi4", "audio", 16_000),
    (7, "lpc", "audio", 8_000),
    (8, "pcma", "audio", 8_000),
    (9, "g722", "audio", 8_000),
    (10, "l16", "audio", 44_100),
    (11, "l16", "audio", 44_100),
    (12, "qcelp", "audio", 8_000),
    (13, "cn", "audio", 8_000),
    (14, "mpa", "audio", 90_000),
    (15, "g728", "audio", 8_000),
    (16, "dvi4", "audio", 11_025),
    (17, "dvi4", "audio", 22_050),
    (18, "g729", "audio", 8_000),
    (25, "celb", "video", 90_000),
    (26, "jpeg", "video", 90_000),
    (28, "nv", "video", 90_000),
    (31, "h261", "video", 90_000),
    (32, "mpv", "video", 90_000),
    // The RTP parameters registry says type AV (audio and video).
    // The MIME registration says the media type is "video".
    // https://datatracker.ietf.org/doc/html/rfc3555#section-4.2.9
    (33, "mp2t", "video", 90_000),
    (34, "h263", "video", 90_000),
];

fn static_payload_type(pt: u8) -> Option<(&'static str, &'static str, u32)> {
    STATIC_PAYLOAD_TYPES
        .iter()
        .find(|&&(p, ..)| p == pt)
        .map(|&(_, encoding, media, rate)| (encoding, media, rate))
}

/// One usable `m=` section of a session description.
#[derive(Clone, Debug)]
pub(crate) struct TrackDescriptor {
    pub(crate) media: MediaType,

    /// Lowercase encoding name, eg `h264`.
    pub(crate) encoding_name: String,
    pub(crate) payload_type: u8,
    pub(crate) clock_rate: u32,
    pub(crate) control: Url,
}

/// A parsed `DESCRIBE` response.
#[derive(Debug)]
pub(crate) struct Description {
    /// The base for relative control URLs, without a trailing slash.
    pub(crate) content_base: Url,

    /// The aggregate control URL, used for `PLAY`, `PAUSE`, and friends.
    pub(crate) control: Url,
    pub(crate) tracks: Vec<TrackDescriptor>,
    pub(crate) sdp: String,
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    let base = base_url.as_str();
    let sep = if base.ends_with('/') { "" } else { "/" };
    Url::parse(&format!("{base}{sep}{control}"))
        .map_err(|e| format!("unable to join base url {base} with control url {control:?}: {e}"))
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str().trim(), 10).ok())
}

/// Returns a header's value as a `&str`, if present.
pub(crate) fn header<'a>(
    response: &'a rtsp_types::Response<Bytes>,
    name: &rtsp_types::HeaderName,
) -> Option<&'a str> {
    response.header(name).map(|v| v.as_str())
}

/// Parses one `m=` section. Errors describe why the track is unusable.
fn parse_media(base_url: &Url, media_description: &Media) -> Result<TrackDescriptor, String> {
    let media = match media_description.media.as_str() {
        "video" => MediaType::Video,
        "audio" => MediaType::Audio,
        "application" => MediaType::Application,
        o => return Err(format!("unsupported media type {o:?}")),
    };

    // https://tools.ietf.org/html/rfc8866#section-5.14 says "If the <proto>
    // sub-field is "RTP/AVP" or "RTP/SAVP" the <fmt> sub-fields contain RTP
    // payload type numbers." Other variants such as "TCP/RTP/AVP" exist, so
    // look for an "RTP" component.
    let proto = &media_description.proto;
    if !proto.starts_with("RTP/") && !proto.contains("/RTP/") {
        return Err(format!("expected RTP-based proto, got {proto:?}"));
    }

    // The first listed format is the default; use it.
    let pt_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| "no RTP payload type".to_string())?;
    let payload_type = u8::from_str_radix(pt_str, 10)
        .ok()
        .filter(|pt| pt & 0x80 == 0)
        .ok_or_else(|| format!("invalid RTP payload type {pt_str:?}"))?;

    let mut rtpmap = None;
    let mut control = None;
    for a in &media_description.attributes {
        let v = a.value.as_deref();
        match (a.attribute.as_str(), v) {
            ("rtpmap", Some(v)) => {
                // rtpmap-value = payload-type SP encoding-name "/" clock-rate [ "/" channels ]
                let (pt, v) = v
                    .split_once(' ')
                    .ok_or_else(|| format!("invalid rtpmap attribute {v:?}"))?;
                if pt == pt_str {
                    rtpmap = Some(v.trim());
                }
            }
            ("control", Some(c)) => control = Some(join_control(base_url, c)?),
            _ => {}
        }
    }

    let (encoding_name, clock_rate) = match rtpmap {
        Some(rtpmap) => {
            let mut parts = rtpmap.split('/');
            let encoding = parts.next().unwrap_or_default();
            let rate = parts
                .next()
                .and_then(|r| u32::from_str_radix(r, 10).ok())
                .ok_or_else(|| format!("bad clock rate in rtpmap {rtpmap:?}"))?;
            (encoding.to_ascii_lowercase(), rate)
        }
        None => {
            let (encoding, pt_media, rate) = static_payload_type(payload_type).ok_or_else(|| {
                format!("expected rtpmap or assigned static payload type (got {payload_type})")
            })?;
            if pt_media != media_description.media {
                return Err(format!(
                    "SDP media type {} must match RTP payload type {payload_type}'s {pt_media}",
                    media_description.media
                ));
            }
            (encoding.to_owned(), rate)
        }
    };
    if clock_rate == 0 {
        return Err("clock rate 0".to_owned());
    }

    Ok(TrackDescriptor {
        media,
        encoding_name,
        payload_type,
        clock_rate,
        control: control.unwrap_or_else(|| base_url.clone()),
    })
}

/// Parses a successful `DESCRIBE` response.
///
/// With `play_track`, selects the first track of that type; otherwise all
/// audio and video tracks. Fails if nothing usable remains.
pub(crate) fn parse_describe(
    play_url: &Url,
    response: &rtsp_types::Response<Bytes>,
    play_track: Option<MediaType>,
) -> Result<Description, String> {
    if let Some(t) = header(response, &rtsp_types::headers::CONTENT_TYPE) {
        if !t.starts_with("application/sdp") {
            return Err(format!("DESCRIBE response has content type {t:?}, not application/sdp"));
        }
    }

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let content_base = match header(response, &rtsp_types::headers::CONTENT_BASE) {
        Some(b) if !b.trim().is_empty() => b.trim(),
        _ => play_url.as_str(),
    };
    let content_base = content_base.strip_suffix('/').unwrap_or(content_base);
    let content_base =
        Url::parse(content_base).map_err(|e| format!("bad Content-Base {content_base:?}: {e}"))?;

    let body = &response.body()[..];
    let session = sdp_types::Session::parse(body).map_err(|e| {
        format!(
            "Unable to parse SDP: {}\n\n{:#?}",
            e,
            crate::hex::LimitedHex::new(body, 256)
        )
    })?;

    let control = match session
        .attributes
        .iter()
        .find(|a| a.attribute == "control")
        .and_then(|a| a.value.as_deref())
    {
        Some(c) => join_control(&content_base, c)?,
        None => content_base.clone(),
    };

    let mut tracks = Vec::new();
    for (i, m) in session.medias.iter().enumerate() {
        match parse_media(&content_base, m) {
            Ok(t) => tracks.push(t),
            Err(e) => debug!("skipping media {i} ({}): {e}", m.media),
        }
    }
    match play_track {
        Some(wanted) => {
            tracks = tracks.into_iter().filter(|t| t.media == wanted).take(1).collect();
        }
        None => tracks.retain(|t| matches!(t.media, MediaType::Video | MediaType::Audio)),
    }
    if tracks.is_empty() {
        return Err("no usable track in session description".to_owned());
    }
    Ok(Description {
        content_base,
        control,
        tracks,
        sdp: String::from_utf8_lossy(body).into_owned(),
    })
}

/// The server's choices from a `SETUP` response's `Transport` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportInfo {
    pub(crate) mode: Option<Transport>,
    pub(crate) ssrc: Option<u32>,
    pub(crate) interleaved: Option<(u8, u8)>,
    pub(crate) server_port: Option<(u16, u16)>,

    /// Multicast port pair.
    pub(crate) port: Option<(u16, u16)>,
    pub(crate) destination: Option<IpAddr>,
    pub(crate) source: Option<IpAddr>,
}

/// Parses `a-b`, or a lone `a` meaning `a-(a+1)`.
fn parse_pair<T: TryFrom<u32>>(v: &str) -> Option<(T, T)> {
    let (a, b) = match v.split_once('-') {
        Some((a, b)) => (a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?),
        None => {
            let a = v.trim().parse::<u32>().ok()?;
            (a, a.checked_add(1)?)
        }
    };
    Some((T::try_from(a).ok()?, T::try_from(b).ok()?))
}

/// Parses a `Transport` header value.
///
/// The mode is matched loosely: anything mentioning `TCP` or `interleaved` is
/// TCP, then anything mentioning `multicast`, else unicast UDP.
pub(crate) fn parse_transport(transport: &str) -> Result<TransportInfo, String> {
    let mode = if transport.contains("TCP") || transport.contains("interleaved") {
        Transport::Tcp
    } else if transport.contains("multicast") {
        Transport::Multicast
    } else {
        Transport::Udp
    };
    let mut info = TransportInfo {
        mode: Some(mode),
        ..Default::default()
    };
    for part in transport.split(';') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let bad = || format!("bad {key} in Transport {transport:?}");
        match key {
            "ssrc" => {
                info.ssrc = Some(u32::from_str_radix(value.trim(), 16).map_err(|_| bad())?);
            }
            "interleaved" => info.interleaved = Some(parse_pair(value).ok_or_else(bad)?),
            "server_port" => info.server_port = Some(parse_pair(value).ok_or_else(bad)?),
            "port" => info.port = Some(parse_pair(value).ok_or_else(bad)?),
            "destination" => info.destination = Some(value.trim().parse().map_err(|_| bad())?),
            "source" => info.source = Some(value.trim().parse().map_err(|_| bad())?),
            _ => {}
        }
    }
    Ok(info)
}

/// Returns the session id from a `Session` header: everything before the
/// first `;`.
pub(crate) fn session_id(session: &str) -> &str {
    session.split(';').next().unwrap_or_default().trim()
}

/// Returns the start of a `Range: npt=<start>-` header in seconds. `now`
/// means the beginning.
pub(crate) fn npt_start(range: &str) -> Result<f64, String> {
    let start = range
        .split(';')
        .find_map(|p| p.trim().strip_prefix("npt="))
        .and_then(|r| r.split('-').next())
        .ok_or_else(|| format!("Range {range:?} has no npt start"))?
        .trim();
    if start == "now" {
        return Ok(0.0);
    }
    start
        .parse()
        .map_err(|_| format!("bad npt start {start:?} in Range {range:?}"))
}

/// Splits a `Public` header into its method names.
pub(crate) fn parse_public(public: &str) -> HashSet<String> {
    public
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .collect()
}
