//! RFC 6455 section 4 upgrade handshake.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::digest;

use nexio_core::EndpointId;
use nexio_http::{HttpRequest, HttpResponse};

/// The GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Client nonce: base64 over 16 random bytes (the endpoint identifier).
#[must_use]
pub fn make_key(id: &EndpointId) -> String {
    BASE64.encode(id.as_bytes())
}

/// `Sec-WebSocket-Accept` value: base64(SHA1(key ++ GUID)).
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + WS_GUID.len());
    input.push_str(key);
    input.push_str(WS_GUID);
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64.encode(hash.as_ref())
}

/// Build the client upgrade request for `target` on `host`.
#[must_use]
pub fn make_upgrade_request(
    host: &str,
    target: &str,
    key: &str,
    origin: Option<&str>,
    protocol: Option<&str>,
) -> HttpRequest {
    let mut request = HttpRequest::new();
    request
        .set_begin("GET", target)
        .set_header("Host", host)
        .set_header("Upgrade", "websocket")
        .set_header("Connection", "Upgrade")
        .set_header("Sec-WebSocket-Key", key)
        .set_header("Sec-WebSocket-Version", "13");
    if let Some(origin) = origin {
        request.set_header("Origin", origin);
    }
    if let Some(protocol) = protocol {
        request.set_header("Sec-WebSocket-Protocol", protocol);
    }
    request.set_body(b"");
    request
}

/// Validate the server's 101 response against the client `key`.
pub fn validate_upgrade_response(
    response: &HttpResponse,
    key: &str,
) -> std::result::Result<(), String> {
    if response.status() != 101 {
        return Err(format!(
            "invalid WebSocket upgrade response status: {}",
            response.status()
        ));
    }

    let mut connection = false;
    let mut upgrade = false;
    let mut accept = false;

    for index in 0..response.headers() {
        let Some((header, value)) = response.header(index) else {
            continue;
        };
        if header.eq_ignore_ascii_case("Connection") {
            if !value.eq_ignore_ascii_case("Upgrade") {
                return Err("'Connection' header value must be 'Upgrade'".into());
            }
            connection = true;
        } else if header.eq_ignore_ascii_case("Upgrade") {
            if !value.eq_ignore_ascii_case("websocket") {
                return Err("'Upgrade' header value must be 'websocket'".into());
            }
            upgrade = true;
        } else if header.eq_ignore_ascii_case("Sec-WebSocket-Accept") {
            if value != accept_key(key) {
                return Err("'Sec-WebSocket-Accept' value validation failed".into());
            }
            accept = true;
        }
    }

    if connection && upgrade && accept {
        Ok(())
    } else {
        Err("invalid WebSocket upgrade response".into())
    }
}

/// Outcome of examining the first HTTP request on a server session.
pub enum ServerUpgrade {
    /// No WebSocket handshake header at all: fall through to plain HTTP.
    NotWebSocket,
    /// A malformed handshake; send the carried 400 response and drop.
    Invalid(HttpResponse),
    /// A valid handshake; send the carried 101 response and switch to
    /// framing.
    Accepted(HttpResponse),
}

/// Validate a client upgrade request and prepare the response.
#[must_use]
pub fn perform_server_upgrade(request: &HttpRequest) -> ServerUpgrade {
    let mut connection = false;
    let mut upgrade = false;
    let mut ws_key = false;
    let mut ws_version = false;
    let mut accept = String::new();
    let mut error: Option<String> = None;

    for index in 0..request.headers() {
        let Some((header, value)) = request.header(index) else {
            continue;
        };
        if header.eq_ignore_ascii_case("Connection") {
            if !value.eq_ignore_ascii_case("Upgrade")
                && !value.eq_ignore_ascii_case("keep-alive, Upgrade")
            {
                error = Some("'Connection' header value must be 'Upgrade'".into());
                break;
            }
            connection = true;
        } else if header.eq_ignore_ascii_case("Upgrade") {
            if !value.eq_ignore_ascii_case("websocket") {
                error = Some("'Upgrade' header value must be 'websocket'".into());
                break;
            }
            upgrade = true;
        } else if header.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            if value.is_empty() {
                error = Some("'Sec-WebSocket-Key' header value must be non-empty".into());
                break;
            }
            accept = accept_key(value);
            ws_key = true;
        } else if header.eq_ignore_ascii_case("Sec-WebSocket-Version") {
            if value != "13" {
                error = Some("'Sec-WebSocket-Version' header value must be '13'".into());
                break;
            }
            ws_version = true;
        }
    }

    // No handshake header at all: this is a plain HTTP request.
    if error.is_none() && !connection && !upgrade && !ws_key && !ws_version {
        return ServerUpgrade::NotWebSocket;
    }

    let valid =
        error.is_none() && connection && upgrade && ws_key && ws_version && request.method() == "GET";
    if !valid {
        let reason = error.unwrap_or_else(|| "invalid WebSocket upgrade request".into());
        let mut response = HttpResponse::new();
        response.make_error_response_with_status(&reason, 400);
        return ServerUpgrade::Invalid(response);
    }

    let mut response = HttpResponse::new();
    response
        .set_begin(101)
        .set_header("Connection", "Upgrade")
        .set_header("Upgrade", "websocket")
        .set_header("Sec-WebSocket-Accept", &accept)
        .set_body(b"");
    ServerUpgrade::Accepted(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_roundtrip() {
        let id = EndpointId::generate();
        let key = make_key(&id);
        let request = make_upgrade_request("localhost", "/chat", &key, None, None);

        let ServerUpgrade::Accepted(response) = perform_server_upgrade(&request) else {
            panic!("expected an accepted upgrade");
        };
        assert_eq!(response.status(), 101);
        assert!(validate_upgrade_response(&response, &key).is_ok());
    }

    #[test]
    fn test_plain_http_falls_through() {
        let mut request = HttpRequest::new();
        request.make_get_request("/index.html");
        assert!(matches!(
            perform_server_upgrade(&request),
            ServerUpgrade::NotWebSocket
        ));
    }

    #[test]
    fn test_partial_handshake_is_invalid() {
        let mut request = HttpRequest::new();
        request
            .set_begin("GET", "/chat")
            .set_header("Upgrade", "websocket")
            .set_header("Connection", "Upgrade")
            .set_body(b"");
        let ServerUpgrade::Invalid(response) = perform_server_upgrade(&request) else {
            panic!("expected an invalid upgrade");
        };
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn test_wrong_accept_rejected() {
        let id = EndpointId::generate();
        let key = make_key(&id);
        let mut response = HttpResponse::new();
        response
            .set_begin(101)
            .set_header("Connection", "Upgrade")
            .set_header("Upgrade", "websocket")
            .set_header("Sec-WebSocket-Accept", "bogus")
            .set_body(b"");
        assert!(validate_upgrade_response(&response, &key).is_err());
    }

    #[test]
    fn test_non_get_rejected() {
        let id = EndpointId::generate();
        let key = make_key(&id);
        let mut request = HttpRequest::new();
        request
            .set_begin("POST", "/chat")
            .set_header("Host", "localhost")
            .set_header("Upgrade", "websocket")
            .set_header("Connection", "Upgrade")
            .set_header("Sec-WebSocket-Key", &key)
            .set_header("Sec-WebSocket-Version", "13")
            .set_body(b"");
        assert!(matches!(
            perform_server_upgrade(&request),
            ServerUpgrade::Invalid(_)
        ));
    }
}
