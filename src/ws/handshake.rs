// ABOUTME: Client and server sides of the RFC6455 opening handshake over the HTTP collaborator
// ABOUTME: Server accept key derivation uses SHA-1 plus the GUID from RFC6455 section 1.3

use crate::http::{HttpError, HttpRequest, HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("missing or malformed Sec-WebSocket-Key header")]
    MissingKey,
    #[error("request is not a websocket upgrade")]
    NotAnUpgrade,
    #[error("unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),
    #[error("server responded without completing the upgrade: {0}")]
    RejectedByServer(u16),
    #[error("Sec-WebSocket-Accept did not match the expected value")]
    AcceptMismatch,
    #[error("no acceptable subprotocol in common")]
    NoCommonSubprotocol,
}

/// Tracks where a connection is in the opening handshake. Transitions
/// strictly forward; there is no path back to `AwaitingHandshake` once a
/// side has sent or accepted an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHandshake,
    Upgraded,
    Closed,
}

fn accept_key_for(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    BASE64.encode(digest)
}

fn random_client_key() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

/// Builds the client's opening GET request. `subprotocols` is sent as a
/// comma-separated `Sec-WebSocket-Protocol` list when non-empty.
pub struct ClientHandshake {
    key: String,
}

impl ClientHandshake {
    pub fn new() -> Self {
        ClientHandshake {
            key: random_client_key(),
        }
    }

    pub fn build_request(&self, host: &str, path: &str, subprotocols: &[&str]) -> HttpRequest {
        let mut req = HttpRequest::new("GET", path);
        req.header("Host", host)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", &self.key)
            .header("Sec-WebSocket-Version", "13");
        if !subprotocols.is_empty() {
            req.header("Sec-WebSocket-Protocol", &subprotocols.join(", "));
        }
        req
    }

    /// Validates a server's `101 Switching Protocols` response against
    /// the key this handshake sent. On success returns the negotiated
    /// subprotocol, if the server selected one.
    pub fn accept_response(&self, response: &HttpResponse) -> Result<Option<String>, HandshakeError> {
        if response.code != 101 {
            return Err(HandshakeError::RejectedByServer(response.code));
        }
        let accept = response
            .headers
            .get("Sec-WebSocket-Accept")
            .ok_or(HandshakeError::MissingKey)?;
        if accept != accept_key_for(&self.key) {
            return Err(HandshakeError::AcceptMismatch);
        }
        Ok(response
            .headers
            .get("Sec-WebSocket-Protocol")
            .map(|s| s.to_string()))
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        ClientHandshake::new()
    }
}

/// Validates an incoming upgrade request and builds the `101` response.
/// `supported_subprotocols` is consulted in the order the client sent
/// them; the first mutual entry wins.
pub fn accept_request(
    request: &HttpRequest,
    supported_subprotocols: &[&str],
) -> Result<(HttpResponse, Option<String>), HandshakeError> {
    if request.method != "GET" {
        return Err(HandshakeError::NotAnUpgrade);
    }
    if !request.headers.has_token("connection", "upgrade") || !request.headers.has_token("upgrade", "websocket") {
        return Err(HandshakeError::NotAnUpgrade);
    }
    let version = request
        .headers
        .get("Sec-WebSocket-Version")
        .ok_or(HandshakeError::NotAnUpgrade)?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }
    let client_key = request
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingKey)?;

    let negotiated = if supported_subprotocols.is_empty() {
        None
    } else {
        let requested = request.headers.get("Sec-WebSocket-Protocol").unwrap_or("");
        let requested: Vec<&str> = requested.split(',').map(|s| s.trim()).collect();
        let chosen = requested
            .iter()
            .find(|candidate| supported_subprotocols.contains(candidate))
            .copied();
        match chosen {
            Some(p) => Some(p.to_string()),
            None if requested.iter().all(|s| s.is_empty()) => None,
            None => return Err(HandshakeError::NoCommonSubprotocol),
        }
    };

    let mut response = HttpResponse::new(101, "Switching Protocols");
    response
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", &accept_key_for(client_key));
    if let Some(ref protocol) = negotiated {
        response.header("Sec-WebSocket-Protocol", protocol);
    }

    Ok((response, negotiated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 section 1.3 worked example.
        assert_eq!(
            accept_key_for("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn full_handshake_round_trip() {
        let client = ClientHandshake::new();
        let req = client.build_request("example.com", "/chat", &["chat.v1"]);

        let (response, negotiated) = accept_request(&req, &["chat.v1", "chat.v2"]).unwrap();
        assert_eq!(negotiated, Some("chat.v1".to_string()));

        let accepted = client.accept_response(&response).unwrap();
        assert_eq!(accepted, Some("chat.v1".to_string()));
    }

    #[test]
    fn rejects_non_upgrade_request() {
        let mut req = HttpRequest::new("GET", "/chat");
        req.header("Host", "example.com");
        let err = accept_request(&req, &[]).unwrap_err();
        assert!(matches!(err, HandshakeError::NotAnUpgrade));
    }

    #[test]
    fn rejects_incompatible_subprotocol() {
        let client = ClientHandshake::new();
        let req = client.build_request("example.com", "/chat", &["unsupported-protocol"]);
        let err = accept_request(&req, &["chat.v1"]).unwrap_err();
        assert!(matches!(err, HandshakeError::NoCommonSubprotocol));
    }

    #[test]
    fn tampered_accept_key_is_rejected() {
        let client = ClientHandshake::new();
        let mut response = HttpResponse::new(101, "Switching Protocols");
        response
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", "not-the-right-value");
        let err = client.accept_response(&response).unwrap_err();
        assert!(matches!(err, HandshakeError::AcceptMismatch));
    }
}
