// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;

/// Sends `log` output to stderr for `cargo test -- --nocapture`, filtered by
/// `RUST_LOG` (default `info`).
pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

/// Builds a received response message from a formatted string.
pub(crate) fn received(raw: String) -> crate::ReceivedMessage {
    let (msg, len) = rtsp_types::Message::parse(raw.as_bytes()).unwrap();
    assert_eq!(len, raw.len(), "trailing bytes in {raw:?}");
    let msg = match msg {
        rtsp_types::Message::Response(r) => {
            rtsp_types::Message::Response(r.map_body(Bytes::copy_from_slice))
        }
        _ => panic!("unexpected message type"),
    };
    crate::ReceivedMessage {
        ctx: crate::RtspMessageContext::dummy(),
        msg,
    }
}
