//! HTTP upgrade handshake
//!
//! Parses the client's upgrade request out of the raw receive buffer and
//! builds the 101 Switching Protocols response. Only the two headers the
//! protocol depends on are inspected: `Sec-WebSocket-Key` (required) and
//! `Sec-WebSocket-Version` (must be 13 when present).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key per RFC 6455 §4.2.2.
const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Terminator of the HTTP header block.
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("upgrade request is missing the Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unsupported Sec-WebSocket-Version {0:?}, only 13 is spoken")]
    UnsupportedVersion(String),
}

/// Finds the end of the HTTP header block in raw bytes.
///
/// Returns the byte length of the block including the terminator, which
/// is the amount to compact off the connection buffer. Byte length, not
/// character length: the header may sit in front of binary frame data.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

/// Performs the server side of the upgrade: validates the request header
/// text and produces the full 101 response to write back.
pub fn upgrade_response(request: &str) -> Result<String, HandshakeError> {
    let mut key = None;
    for line in request.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("sec-websocket-version") && value != "13" {
            return Err(HandshakeError::UnsupportedVersion(value.to_string()));
        }
    }

    let key = key.ok_or(HandshakeError::MissingKey)?;
    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    ))
}

/// base64(SHA-1(key + GUID)), the proof-of-handshake token.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(headers: &str) -> String {
        format!("GET /socket HTTP/1.1\r\nHost: 10.0.0.2:8082\r\n{}\r\n", headers)
    }

    #[test]
    fn test_accept_key_matches_rfc_example() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_response_contains_required_headers() {
        let request = request_with(
            "Upgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n",
        );
        let response = upgrade_response(&request).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let request = request_with("SEC-WEBSOCKET-KEY: dGhlIHNhbXBsZSBub25jZQ==\r\n");
        assert!(upgrade_response(&request).is_ok());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let request = request_with("Upgrade: websocket\r\n");
        assert_eq!(upgrade_response(&request), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let request = request_with(
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n",
        );
        assert_eq!(
            upgrade_response(&request),
            Err(HandshakeError::UnsupportedVersion("8".to_string()))
        );
    }

    #[test]
    fn test_absent_version_header_is_accepted() {
        let request = request_with("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n");
        assert!(upgrade_response(&request).is_ok());
    }

    #[test]
    fn test_find_header_end_measures_bytes() {
        let mut raw = b"GET / HTTP/1.1\r\nSec-WebSocket-Key: k\r\n\r\n".to_vec();
        let header_len = raw.len();
        raw.extend_from_slice(&[0x81, 0x00]); // a frame right behind the header
        assert_eq!(find_header_end(&raw), Some(header_len));
        assert_eq!(find_header_end(&raw[..header_len - 1]), None);
    }
}
