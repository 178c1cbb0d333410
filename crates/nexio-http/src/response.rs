//! HTTP response: a single byte cache with range views over it.

use std::fmt;
use std::ops::Range;

/// Reason phrase for a status code.
pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// HTTP response message with an incremental parser.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    cache: Vec<u8>,
    /// Scan position of the header-terminator search.
    cache_size: usize,
    status: u16,
    status_phrase: Range<usize>,
    protocol: Range<usize>,
    headers: Vec<(Range<usize>, Range<usize>)>,
    body_index: usize,
    body_size: usize,
    body_length: usize,
    body_length_provided: bool,
    header_done: bool,
    error: bool,
}

impl HttpResponse {
    /// Create an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The status reason phrase.
    pub fn status_phrase(&self) -> &str {
        self.slice(&self.status_phrase)
    }

    /// The protocol version.
    pub fn protocol(&self) -> &str {
        self.slice(&self.protocol)
    }

    /// Number of headers.
    pub fn headers(&self) -> usize {
        self.headers.len()
    }

    /// The i-th header as `(key, value)`.
    pub fn header(&self, index: usize) -> Option<(&str, &str)> {
        self.headers
            .get(index)
            .map(|(key, value)| (self.slice(key), self.slice(value)))
    }

    /// The first header value for `name`, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| self.slice(key).eq_ignore_ascii_case(name))
            .map(|(_, value)| self.slice(value))
    }

    /// The response body.
    pub fn body(&self) -> &[u8] {
        let size = if self.body_length_provided {
            self.body_size.min(self.body_length)
        } else {
            self.body_size
        };
        let end = (self.body_index + size).min(self.cache.len());
        &self.cache[self.body_index.min(end)..end]
    }

    /// Bytes accumulated past the end of the declared body (pipelined
    /// data, e.g. WebSocket frames right after a 101 upgrade).
    pub fn body_excess(&self) -> &[u8] {
        if !self.body_length_provided {
            return &[];
        }
        let end = (self.body_index + self.body_length).min(self.cache.len());
        &self.cache[end.min(self.cache.len())..]
    }

    /// The response body as a UTF-8 string (lossy).
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    /// The full on-wire representation.
    pub fn cache(&self) -> &[u8] {
        &self.cache
    }

    /// Whether nothing has been parsed or built.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Whether the parser hit malformed input.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Whether the header terminator has not been seen yet.
    pub fn is_pending_header(&self) -> bool {
        !self.error && !self.header_done
    }

    /// Whether the body is still incomplete. A response without a declared
    /// `Content-Length` stays pending until the peer closes the connection
    /// (connection-terminated body).
    pub fn is_pending_body(&self) -> bool {
        if self.error || !self.header_done {
            return false;
        }
        if self.body_length_provided {
            self.body_size < self.body_length
        } else {
            true
        }
    }

    /// Whether a complete response has been parsed.
    pub fn is_ready(&self) -> bool {
        !self.error && self.header_done && !self.is_pending_body()
    }

    /// Accept the accumulated bytes as the whole body. Called when the
    /// remote closed while the length was unknown.
    pub fn finalize_body(&mut self) {
        if self.header_done && !self.body_length_provided {
            self.body_length = self.body_size;
            self.body_length_provided = true;
        }
    }

    fn slice(&self, range: &Range<usize>) -> &str {
        std::str::from_utf8(&self.cache[range.clone()]).unwrap_or_default()
    }

    // --- builders -------------------------------------------------------

    /// Reset to an empty response.
    pub fn clear(&mut self) -> &mut Self {
        *self = Self::default();
        self
    }

    /// Start a status line with protocol `HTTP/1.1`. A status of 0 means
    /// 200.
    pub fn set_begin(&mut self, status: u16) -> &mut Self {
        self.set_begin_with_protocol(status, "HTTP/1.1")
    }

    /// Start a status line with an explicit protocol version.
    pub fn set_begin_with_protocol(&mut self, status: u16, protocol: &str) -> &mut Self {
        let status = if status == 0 { 200 } else { status };
        self.clear();

        let mut index = 0;
        self.cache.extend_from_slice(protocol.as_bytes());
        self.protocol = index..self.cache.len();

        self.cache.extend_from_slice(b" ");
        self.cache.extend_from_slice(status.to_string().as_bytes());
        self.status = status;

        let phrase = reason_phrase(status);
        self.cache.extend_from_slice(b" ");
        index = self.cache.len();
        self.cache.extend_from_slice(phrase.as_bytes());
        self.status_phrase = index..self.cache.len();

        self.cache.extend_from_slice(b"\r\n");
        self
    }

    /// Append a header.
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        let mut index = self.cache.len();
        self.cache.extend_from_slice(key.as_bytes());
        let key_range = index..self.cache.len();

        self.cache.extend_from_slice(b": ");
        index = self.cache.len();
        self.cache.extend_from_slice(value.as_bytes());
        let value_range = index..self.cache.len();

        self.cache.extend_from_slice(b"\r\n");
        self.headers.push((key_range, value_range));
        self
    }

    /// Append a `Set-Cookie` header.
    pub fn set_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        self.set_header("Set-Cookie", &format!("{name}={value}"))
    }

    /// Terminate the header block and append the body. A `Content-Length`
    /// header is always written (0 for an empty body).
    pub fn set_body(&mut self, body: &[u8]) -> &mut Self {
        self.set_header("Content-Length", &body.len().to_string());
        self.cache.extend_from_slice(b"\r\n");
        self.body_index = self.cache.len();
        self.cache.extend_from_slice(body);
        self.body_size = body.len();
        self.body_length = body.len();
        self.body_length_provided = true;
        self.header_done = true;
        self
    }

    /// Terminate the header block declaring a body of `length` bytes to be
    /// sent separately.
    pub fn set_body_length(&mut self, length: usize) -> &mut Self {
        self.set_header("Content-Length", &length.to_string());
        self.cache.extend_from_slice(b"\r\n");
        self.body_index = self.cache.len();
        self.body_size = 0;
        self.body_length = length;
        self.body_length_provided = true;
        self.header_done = true;
        self
    }

    /// Build an empty OK response. A status of 0 means 200.
    pub fn make_ok_response(&mut self, status: u16) -> &mut Self {
        self.set_begin(status).set_body(b"")
    }

    /// Build an error response with status 500.
    pub fn make_error_response(&mut self, content: &str) -> &mut Self {
        self.make_error_response_with_status(content, 500)
    }

    /// Build an error response with an explicit status.
    pub fn make_error_response_with_status(&mut self, content: &str, status: u16) -> &mut Self {
        self.set_begin(if status == 0 { 500 } else { status })
            .set_header("Content-Type", "text/plain; charset=UTF-8")
            .set_body(content.as_bytes())
    }

    /// Build a HEAD response.
    pub fn make_head_response(&mut self) -> &mut Self {
        self.set_begin(200).set_body(b"")
    }

    /// Build a GET response carrying `content` as `text/plain`.
    pub fn make_get_response(&mut self, content: &[u8]) -> &mut Self {
        self.make_get_response_with_type(content, "text/plain; charset=UTF-8")
    }

    /// Build a GET response with an explicit content type.
    pub fn make_get_response_with_type(
        &mut self,
        content: &[u8],
        content_type: &str,
    ) -> &mut Self {
        self.set_begin(200);
        if !content_type.is_empty() {
            self.set_header("Content-Type", content_type);
        }
        self.set_body(content)
    }

    /// Build an OPTIONS response advertising the supported methods.
    pub fn make_options_response(&mut self, allow: &str) -> &mut Self {
        self.set_begin(200)
            .set_header("Allow", allow)
            .set_body(b"")
    }

    /// Build a TRACE response echoing the original request bytes.
    pub fn make_trace_response(&mut self, request_cache: &[u8]) -> &mut Self {
        self.set_begin(200)
            .set_header("Content-Type", "message/http")
            .set_body(request_cache)
    }

    // --- incremental parser ---------------------------------------------

    /// Feed bytes to the header scanner. Returns `true` once the CRLFCRLF
    /// terminator was seen and the header parsed; check
    /// [`is_error`](Self::is_error) afterwards.
    pub fn receive_header(&mut self, data: &[u8]) -> bool {
        self.cache.extend_from_slice(data);

        while self.cache_size + 3 < self.cache.len() {
            if &self.cache[self.cache_size..self.cache_size + 4] == b"\r\n\r\n" {
                let header_end = self.cache_size + 4;
                if !self.parse_header(header_end) {
                    self.error = true;
                }
                return true;
            }
            self.cache_size += 1;
        }
        false
    }

    /// Feed bytes to the body accumulator. Returns `true` once the declared
    /// body length was reached; a response without a declared length keeps
    /// accumulating until [`finalize_body`](Self::finalize_body).
    pub fn receive_body(&mut self, data: &[u8]) -> bool {
        if self.error || !self.header_done {
            return false;
        }
        self.cache.extend_from_slice(data);
        self.body_size = self.cache.len() - self.body_index;

        // Bytes past the declared length stay in the cache and are exposed
        // through `body_excess`.
        self.body_length_provided && self.body_size >= self.body_length
    }

    fn parse_header(&mut self, header_end: usize) -> bool {
        let Ok(header) = std::str::from_utf8(&self.cache[..header_end]) else {
            return false;
        };

        let mut offset = 0;
        let mut lines = header.split("\r\n");

        // Status line: PROTOCOL SP STATUS SP PHRASE
        let Some(line) = lines.next() else {
            return false;
        };
        {
            let Some(space) = line.find(' ') else {
                return false;
            };
            let protocol = &line[..space];
            let rest = &line[space + 1..];
            let status_text = rest.split(' ').next().unwrap_or_default();
            let Ok(status) = status_text.parse::<u16>() else {
                return false;
            };
            self.protocol = offset..offset + protocol.len();
            self.status = status;
            let phrase_start = offset + space + 1 + status_text.len();
            let phrase_start = (phrase_start + 1).min(offset + line.len());
            self.status_phrase = phrase_start..offset + line.len();
        }
        offset += line.len() + 2;

        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.find(':') else {
                return false;
            };
            let key = &line[..colon];
            if key.is_empty() {
                return false;
            }
            let value_raw = &line[colon + 1..];
            let trimmed = value_raw.trim_matches([' ', '\t']);
            let value_start = offset
                + colon
                + 1
                + (value_raw.len() - value_raw.trim_start_matches([' ', '\t']).len());

            if key.eq_ignore_ascii_case("Content-Length") {
                match trimmed.parse::<usize>() {
                    Ok(length) => {
                        self.body_length = length;
                        self.body_length_provided = true;
                    }
                    Err(_) => return false,
                }
            }

            self.headers
                .push((offset..offset + colon, value_start..value_start + trimmed.len()));
            offset += line.len() + 2;
        }

        self.body_index = header_end;
        self.body_size = self.cache.len() - header_end;
        self.header_done = true;
        true
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.protocol(),
            self.status,
            self.status_phrase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ok_response() {
        let mut response = HttpResponse::new();
        response.make_ok_response(0);
        // A builder status of 0 means 200.
        assert_eq!(response.status(), 200);
        assert_eq!(response.status_phrase(), "OK");
        assert_eq!(response.header_value("Content-Length"), Some("0"));
    }

    #[test]
    fn test_roundtrip_error_response() {
        let mut built = HttpResponse::new();
        built.make_error_response("boom");

        let mut parsed = HttpResponse::new();
        assert!(parsed.receive_header(built.cache()));
        assert!(parsed.is_ready());
        assert_eq!(parsed.status(), 500);
        assert_eq!(parsed.status_phrase(), "Internal Server Error");
        assert_eq!(parsed.body(), b"boom");
    }

    #[test]
    fn test_trace_response_echoes_request() {
        let mut request = crate::HttpRequest::new();
        request.make_trace_request("/probe");
        let mut response = HttpResponse::new();
        response.make_trace_response(request.cache());
        assert_eq!(response.body(), request.cache());
        assert_eq!(response.header_value("Content-Type"), Some("message/http"));
    }

    #[test]
    fn test_connection_terminated_body() {
        let wire = b"HTTP/1.1 200 OK\r\n\r\npartial";
        let mut parsed = HttpResponse::new();
        assert!(parsed.receive_header(&wire[..]));
        assert!(parsed.is_pending_body());
        assert!(!parsed.receive_body(b" bytes"));
        // The peer closes: the accumulated bytes become the body.
        parsed.finalize_body();
        assert!(parsed.is_ready());
        assert_eq!(parsed.body(), b"partial bytes");
    }

    #[test]
    fn test_body_excess_preserved() {
        let mut built = HttpResponse::new();
        built.make_ok_response(101);
        let mut wire = built.cache().to_vec();
        wire.extend_from_slice(b"\x81\x04test");

        let mut parsed = HttpResponse::new();
        assert!(parsed.receive_header(&wire));
        assert!(parsed.is_ready());
        assert!(parsed.body().is_empty());
        // Pipelined bytes after the declared body stay reachable.
        assert_eq!(parsed.body_excess(), b"\x81\x04test");
    }

    #[test]
    fn test_incremental_status_line() {
        let mut built = HttpResponse::new();
        built.make_get_response(b"test");
        let wire = built.cache().to_vec();

        let mut parsed = HttpResponse::new();
        let mut header_done = false;
        let mut ready = false;
        for chunk in wire.chunks(3) {
            if !header_done {
                header_done = parsed.receive_header(chunk);
            } else if parsed.receive_body(chunk) {
                ready = true;
                break;
            }
        }
        assert!(header_done);
        assert!(ready || parsed.is_ready());
        assert_eq!(parsed.status(), 200);
        assert_eq!(parsed.body(), b"test");
    }
}
