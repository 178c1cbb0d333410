//! HTTP request: a single byte cache with range views over it.
//!
//! The request owns the full on-wire representation being built or parsed;
//! method/url/protocol/headers/body are byte ranges into that cache, so no
//! copies are made after parsing.

use std::fmt;
use std::ops::Range;

/// HTTP request message with an incremental parser.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    cache: Vec<u8>,
    /// Scan position of the header-terminator search.
    cache_size: usize,
    method: Range<usize>,
    url: Range<usize>,
    protocol: Range<usize>,
    headers: Vec<(Range<usize>, Range<usize>)>,
    cookies: Vec<(Range<usize>, Range<usize>)>,
    body_index: usize,
    body_size: usize,
    body_length: usize,
    body_length_provided: bool,
    header_done: bool,
    error: bool,
}

impl HttpRequest {
    /// Create an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The HTTP method.
    pub fn method(&self) -> &str {
        self.slice(&self.method)
    }

    /// The request URL.
    pub fn url(&self) -> &str {
        self.slice(&self.url)
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

    /// Number of cookies.
    pub fn cookies(&self) -> usize {
        self.cookies.len()
    }

    /// The i-th cookie as `(name, value)`.
    pub fn cookie(&self, index: usize) -> Option<(&str, &str)> {
        self.cookies
            .get(index)
            .map(|(name, value)| (self.slice(name), self.slice(value)))
    }

    /// The cookie value for `name`.
    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| self.slice(key).eq_ignore_ascii_case(name))
            .map(|(_, value)| self.slice(value))
    }

    /// The request body.
    pub fn body(&self) -> &[u8] {
        let end = (self.body_index + self.body_size).min(self.cache.len());
        &self.cache[self.body_index.min(end)..end]
    }

    /// The request body as a UTF-8 string (lossy).
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    /// The declared body length.
    pub fn body_length(&self) -> usize {
        self.body_length
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

    /// Whether the body is still incomplete.
    pub fn is_pending_body(&self) -> bool {
        !self.error && self.header_done && self.body_size < self.body_length
    }

    /// Whether a complete request has been parsed.
    pub fn is_ready(&self) -> bool {
        !self.error && self.header_done && self.body_size >= self.body_length
    }

    fn slice(&self, range: &Range<usize>) -> &str {
        std::str::from_utf8(&self.cache[range.clone()]).unwrap_or_default()
    }

    // --- builders -------------------------------------------------------

    /// Reset to an empty request.
    pub fn clear(&mut self) -> &mut Self {
        *self = Self::default();
        self
    }

    /// Start a request line with protocol `HTTP/1.1`.
    pub fn set_begin(&mut self, method: &str, url: &str) -> &mut Self {
        self.set_begin_with_protocol(method, url, "HTTP/1.1")
    }

    /// Start a request line with an explicit protocol version.
    pub fn set_begin_with_protocol(
        &mut self,
        method: &str,
        url: &str,
        protocol: &str,
    ) -> &mut Self {
        self.clear();

        let mut index = 0;
        self.cache.extend_from_slice(method.as_bytes());
        self.method = index..self.cache.len();

        self.cache.extend_from_slice(b" ");
        index = self.cache.len();
        self.cache.extend_from_slice(url.as_bytes());
        self.url = index..self.cache.len();

        self.cache.extend_from_slice(b" ");
        index = self.cache.len();
        self.cache.extend_from_slice(protocol.as_bytes());
        self.protocol = index..self.cache.len();

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

    /// Append a `Cookie` header.
    pub fn set_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        let mut index = self.cache.len();
        self.cache.extend_from_slice(b"Cookie: ");
        let key_range = index..index + 6;
        index = self.cache.len();
        self.cache.extend_from_slice(name.as_bytes());
        let name_range = index..self.cache.len();
        self.cache.extend_from_slice(b"=");
        index = self.cache.len();
        self.cache.extend_from_slice(value.as_bytes());
        let value_range = index..self.cache.len();
        self.cache.extend_from_slice(b"\r\n");
        self.headers.push((key_range, name_range.start..value_range.end));
        self.cookies.push((name_range, value_range));
        self
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

    /// Build a HEAD request.
    pub fn make_head_request(&mut self, url: &str) -> &mut Self {
        self.set_begin("HEAD", url).set_body(b"")
    }

    /// Build a GET request.
    pub fn make_get_request(&mut self, url: &str) -> &mut Self {
        self.set_begin("GET", url).set_body(b"")
    }

    /// Build a POST request.
    pub fn make_post_request(&mut self, url: &str, content: &[u8]) -> &mut Self {
        self.set_begin("POST", url).set_body(content)
    }

    /// Build a PUT request.
    pub fn make_put_request(&mut self, url: &str, content: &[u8]) -> &mut Self {
        self.set_begin("PUT", url).set_body(content)
    }

    /// Build a DELETE request.
    pub fn make_delete_request(&mut self, url: &str) -> &mut Self {
        self.set_begin("DELETE", url).set_body(b"")
    }

    /// Build an OPTIONS request.
    pub fn make_options_request(&mut self, url: &str) -> &mut Self {
        self.set_begin("OPTIONS", url).set_body(b"")
    }

    /// Build a TRACE request.
    pub fn make_trace_request(&mut self, url: &str) -> &mut Self {
        self.set_begin("TRACE", url).set_body(b"")
    }

    // --- incremental parser ---------------------------------------------

    /// Feed bytes to the header scanner. Returns `true` once the CRLFCRLF
    /// terminator was seen and the header parsed; check
    /// [`is_error`](Self::is_error) afterwards.
    pub fn receive_header(&mut self, data: &[u8]) -> bool {
        self.cache.extend_from_slice(data);

        // Scan for the CRLFCRLF terminator from where the last call left.
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
    /// body length was reached.
    pub fn receive_body(&mut self, data: &[u8]) -> bool {
        if self.error || !self.header_done {
            return false;
        }
        self.cache.extend_from_slice(data);
        self.body_size = self.cache.len() - self.body_index;

        if self.body_size >= self.body_length {
            // Extra pipelined bytes past the declared length are dropped.
            self.cache.truncate(self.body_index + self.body_length);
            self.body_size = self.body_length;
            return true;
        }
        false
    }

    fn parse_header(&mut self, header_end: usize) -> bool {
        let Ok(header) = std::str::from_utf8(&self.cache[..header_end]) else {
            return false;
        };

        let mut offset = 0;
        let mut lines = header.split("\r\n");

        // Request line: METHOD SP URL SP PROTOCOL
        let Some(line) = lines.next() else {
            return false;
        };
        {
            let mut parts = line.split(' ');
            let (Some(method), Some(url), Some(protocol)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return false;
            };
            if method.is_empty() || url.is_empty() || parts.next().is_some() {
                return false;
            }
            self.method = offset..offset + method.len();
            let url_start = offset + method.len() + 1;
            self.url = url_start..url_start + url.len();
            let protocol_start = url_start + url.len() + 1;
            self.protocol = protocol_start..protocol_start + protocol.len();
        }
        offset += line.len() + 2;

        // Header lines: KEY ":" OWS VALUE
        let mut cookie_headers = Vec::new();
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
            let key_range = offset..offset + colon;
            let value_range = value_start..value_start + trimmed.len();

            if key.eq_ignore_ascii_case("Content-Length") {
                match trimmed.parse::<usize>() {
                    Ok(length) => {
                        self.body_length = length;
                        self.body_length_provided = true;
                    }
                    Err(_) => return false,
                }
            } else if key.eq_ignore_ascii_case("Cookie") {
                cookie_headers.push(value_range.clone());
            }

            self.headers.push((key_range, value_range));
            offset += line.len() + 2;
        }
        for range in cookie_headers {
            self.parse_cookies(&range);
        }

        self.body_index = header_end;
        self.body_size = self.cache.len() - header_end;
        self.header_done = true;
        true
    }

    /// Split a `Cookie` header value into `name=value` pairs.
    fn parse_cookies(&mut self, value: &Range<usize>) {
        let Ok(raw) = std::str::from_utf8(&self.cache[value.clone()]) else {
            return;
        };
        let mut position = value.start;
        for pair in raw.split(';') {
            let pair_start = position;
            position += pair.len() + 1;
            let trimmed = pair.trim_matches(' ');
            let lead = pair.len() - pair.trim_start_matches(' ').len();
            let Some(eq) = trimmed.find('=') else {
                continue;
            };
            let name_start = pair_start + lead;
            self.cookies.push((
                name_start..name_start + eq,
                name_start + eq + 1..name_start + trimmed.len(),
            ));
        }
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method(), self.url(), self.protocol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_get_request() {
        let mut request = HttpRequest::new();
        request.make_get_request("/index.html");
        assert_eq!(request.method(), "GET");
        assert_eq!(request.url(), "/index.html");
        assert_eq!(request.protocol(), "HTTP/1.1");
        assert_eq!(request.header_value("Content-Length"), Some("0"));
        assert!(request.cache().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn test_roundtrip_post() {
        let mut built = HttpRequest::new();
        built
            .set_begin("POST", "/submit")
            .set_header("Host", "example.com")
            .set_cookie("session", "abc123")
            .set_body(b"payload");

        let mut parsed = HttpRequest::new();
        assert!(parsed.receive_header(built.cache()));
        assert!(!parsed.is_error());
        assert!(parsed.is_ready());
        assert_eq!(parsed.method(), "POST");
        assert_eq!(parsed.url(), "/submit");
        assert_eq!(parsed.header_value("host"), Some("example.com"));
        assert_eq!(parsed.cookie_value("session"), Some("abc123"));
        assert_eq!(parsed.body(), b"payload");
    }

    #[test]
    fn test_incremental_parse() {
        let mut built = HttpRequest::new();
        built.make_post_request("/k", b"old");
        let wire = built.cache().to_vec();

        let mut parsed = HttpRequest::new();
        // Byte-at-a-time delivery must converge to the same message.
        let mut done = false;
        for chunk in wire.chunks(1) {
            if !done {
                done = parsed.receive_header(chunk);
            } else if parsed.receive_body(chunk) {
                break;
            }
        }
        assert!(parsed.is_ready());
        assert_eq!(parsed.body(), b"old");
    }

    #[test]
    fn test_header_whitespace_and_case() {
        let wire = b"GET / HTTP/1.1\r\nX-Trim:   spaced value \r\nContent-Length: 0\r\n\r\n";
        let mut parsed = HttpRequest::new();
        assert!(parsed.receive_header(wire));
        assert!(!parsed.is_error());
        // Edges trimmed, interior whitespace intact, lookup case-insensitive.
        assert_eq!(parsed.header_value("x-trim"), Some("spaced value"));
    }

    #[test]
    fn test_malformed_request_line() {
        let mut parsed = HttpRequest::new();
        assert!(parsed.receive_header(b"BROKEN\r\n\r\n"));
        assert!(parsed.is_error());
    }

    #[test]
    fn test_bad_content_length() {
        let mut parsed = HttpRequest::new();
        assert!(parsed.receive_header(b"GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n"));
        assert!(parsed.is_error());
    }
}
