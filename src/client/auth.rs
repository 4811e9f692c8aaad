// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP authentication: `WWW-Authenticate` challenges and `Authorization`
//! responses, as in [RFC 2617](https://datatracker.ietf.org/doc/html/rfc2617)
//! minus `qop`.

use base64::Engine as _;
use md5::{Digest as _, Md5};

use super::Credentials;

/// A challenge captured from a `401 Unauthorized` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Challenge {
    Digest {
        realm: String,
        nonce: String,
        stale: Option<String>,
    },
    Basic {
        realm: String,
    },
}

impl Challenge {
    pub(crate) fn realm(&self) -> &str {
        match self {
            Challenge::Digest { realm, .. } | Challenge::Basic { realm } => realm,
        }
    }
}

/// Returns the value of `key="..."` at the start of `s`, and what follows it.
fn quoted<'a>(s: &'a str, key: &str) -> Option<(&'a str, &'a str)> {
    let s = s.trim_start().strip_prefix(key)?.strip_prefix("=\"")?;
    let end = s.find('"')?;
    Some((&s[..end], &s[end + 1..]))
}

/// Parses a `WWW-Authenticate` header value.
///
/// Accepted forms, tried in order:
///
/// *   `Digest realm="…", nonce="…", stale=…`
/// *   `Digest realm="…", nonce="…"`
/// *   `Basic realm="…"`
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    if let Some(rest) = header.strip_prefix("Digest ") {
        let (realm, rest) = quoted(rest, "realm")?;
        let rest = rest.trim_start().strip_prefix(',')?;
        let (nonce, rest) = quoted(rest, "nonce")?;
        let stale = rest
            .trim_start()
            .strip_prefix(',')
            .and_then(|r| r.trim_start().strip_prefix("stale="))
            .map(|v| {
                v.chars()
                    .take_while(char::is_ascii_alphabetic)
                    .collect::<String>()
            })
            .filter(|v| !v.is_empty());
        return Some(Challenge::Digest {
            realm: realm.to_owned(),
            nonce: nonce.to_owned(),
            stale,
        });
    }
    let (realm, _) = quoted(header.strip_prefix("Basic ")?, "realm")?;
    Some(Challenge::Basic {
        realm: realm.to_owned(),
    })
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Computes the digest `response` field: `MD5(HA1:nonce:MD5(method:uri))`,
/// where `HA1` is the password itself if it's already hashed.
pub(crate) fn digest_response(
    method: &str,
    uri: &str,
    realm: &str,
    nonce: &str,
    creds: &Credentials,
) -> String {
    let ha1 = if creds.password_is_md5 {
        creds.password.clone()
    } else {
        md5_hex(&format!("{}:{}:{}", creds.username, realm, creds.password))
    };
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Returns an `Authorization` header value for a request, or `None` if the
/// challenge can't be answered with these credentials: Basic needs the
/// plaintext password.
pub(crate) fn authorization(
    method: &str,
    uri: &str,
    creds: &Credentials,
    challenge: &Challenge,
) -> Option<String> {
    match challenge {
        Challenge::Digest { realm, nonce, .. } => {
            let response = digest_response(method, uri, realm, nonce, creds);
            Some(format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                creds.username, realm, nonce, uri, response
            ))
        }
        Challenge::Basic { .. } if creds.password_is_md5 => None,
        Challenge::Basic { .. } => Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password))
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(password: &str, password_is_md5: bool) -> Credentials {
        Credentials {
            username: "admin".to_owned(),
            password: password.to_owned(),
            password_is_md5,
        }
    }

    #[test]
    fn md5_vectors() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn challenges() {
        assert_eq!(
            parse_challenge(r#"Digest realm="IP Camera", nonce="abc123", stale=FALSE"#),
            Some(Challenge::Digest {
                realm: "IP Camera".to_owned(),
                nonce: "abc123".to_owned(),
                stale: Some("FALSE".to_owned()),
            })
        );
        assert_eq!(
            parse_challenge(r#"Digest realm="r", nonce="n""#),
            Some(Challenge::Digest {
                realm: "r".to_owned(),
                nonce: "n".to_owned(),
                stale: None,
            })
        );
        assert_eq!(
            parse_challenge(r#"Basic realm="cam""#),
            Some(Challenge::Basic {
                realm: "cam".to_owned()
            })
        );
        assert_eq!(parse_challenge("Bearer"), None);
        assert_eq!(parse_challenge(r#"Digest nonce="n""#), None);
    }

    #[test]
    fn digest() {
        let c = creds("12345", false);
        let expected = md5_hex(&format!(
            "{}:{}:{}",
            md5_hex("admin:IP Camera:12345"),
            "8a1f3fe0",
            md5_hex("DESCRIBE:rtsp://192.168.1.2/stream")
        ));
        let got = digest_response("DESCRIBE", "rtsp://192.168.1.2/stream", "IP Camera", "8a1f3fe0", &c);
        assert_eq!(got, expected);
        assert_eq!(got.len(), 32);

        // A pre-hashed password stands in for HA1.
        let ha1 = md5_hex("admin:IP Camera:12345");
        let hashed = creds(&ha1, true);
        assert_eq!(
            digest_response("DESCRIBE", "rtsp://192.168.1.2/stream", "IP Camera", "8a1f3fe0", &hashed),
            got
        );

        let challenge = Challenge::Digest {
            realm: "IP Camera".to_owned(),
            nonce: "8a1f3fe0".to_owned(),
            stale: None,
        };
        assert_eq!(
            authorization("DESCRIBE", "rtsp://192.168.1.2/stream", &c, &challenge).unwrap(),
            format!(
                "Digest username=\"admin\", realm=\"IP Camera\", nonce=\"8a1f3fe0\", \
                 uri=\"rtsp://192.168.1.2/stream\", response=\"{got}\""
            )
        );
    }

    #[test]
    fn basic() {
        let c = Credentials {
            username: "Aladdin".to_owned(),
            password: "open sesame".to_owned(),
            password_is_md5: false,
        };
        let challenge = Challenge::Basic {
            realm: "cam".to_owned(),
        };
        assert_eq!(
            authorization("OPTIONS", "rtsp://h/", &c, &challenge).unwrap(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
        assert_eq!(
            authorization("OPTIONS", "rtsp://h/", &creds("x", true), &challenge),
            None
        );
    }
}
