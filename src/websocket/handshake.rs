//! WebSocket Opening Handshake
//!
//! Classifies a connection's first bytes, parses the upgrade request and
//! derives the `Sec-WebSocket-Accept` key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use super::error::{ProtocolError, ProtocolResult};

/// GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Cookie carrying the security token issued with the dashboard page
pub const TOKEN_COOKIE: &str = "sews_token";

/// Check whether the initial bytes carry an `Upgrade: websocket` header
pub fn is_upgrade_request(initial: &[u8]) -> bool {
    let text = String::from_utf8_lossy(initial);
    let found = header_lines(&text).any(|(name, value)| {
        name.eq_ignore_ascii_case("upgrade")
            && value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    });
    found
}

/// Derive the accept key: `base64(SHA1(key + GUID))`
pub fn derive_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response for a derived accept key
pub fn switching_protocols_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key
    )
}

/// A parsed WebSocket upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target, e.g. `/ws`
    pub path: String,
    /// Trimmed `Sec-WebSocket-Key`
    pub key: String,
    /// Security token from the `sews_token` cookie, if any
    pub token: Option<String>,
}

impl HandshakeRequest {
    /// Parse an upgrade request from the connection's initial bytes
    pub fn parse(initial: &[u8]) -> ProtocolResult<Self> {
        let text = String::from_utf8_lossy(initial);
        let request_line = text
            .lines()
            .next()
            .ok_or_else(|| ProtocolError::MalformedHandshake("empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) => (m, p, v),
            _ => {
                return Err(ProtocolError::MalformedHandshake(format!(
                    "bad request line: {}",
                    request_line
                )))
            }
        };

        if !version.starts_with("HTTP/") {
            return Err(ProtocolError::MalformedHandshake(format!(
                "bad protocol version: {}",
                version
            )));
        }
        if method != "GET" {
            return Err(ProtocolError::MalformedHandshake(format!(
                "upgrade requires GET, got {}",
                method
            )));
        }

        let mut key = None;
        let mut token = None;
        for (name, value) in header_lines(&text) {
            if name.eq_ignore_ascii_case("sec-websocket-key") {
                key = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("cookie") {
                token = token.or_else(|| cookie_value(value, TOKEN_COOKIE));
            }
        }

        let key = key.ok_or(ProtocolError::MissingKey)?;
        if key.is_empty() {
            return Err(ProtocolError::MissingKey);
        }
        match STANDARD.decode(&key) {
            Ok(nonce) if nonce.len() == 16 => {}
            _ => return Err(ProtocolError::InvalidKey(key)),
        }

        Ok(Self {
            path: path.to_string(),
            key,
            token,
        })
    }

    /// Accept key for this request
    pub fn accept_key(&self) -> String {
        derive_accept_key(&self.key)
    }
}

/// Iterate `(name, trimmed value)` pairs of the header block
fn header_lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split("\r\n")
        .flat_map(|line| line.split('\n'))
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim(), value.trim()))
        })
}

fn cookie_value(header: &str, wanted: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == wanted).then(|| value.trim().to_string())
    })
}
