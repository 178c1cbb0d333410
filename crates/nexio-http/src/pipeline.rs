//! Incremental parse steps shared by the HTTP(S) session and client
//! adapters.
//!
//! The transport handlers feed raw chunks in while holding the per-endpoint
//! message lock, collect the resulting steps, and dispatch user callbacks
//! after the lock is released.

use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// What a chunk of request bytes produced.
pub(crate) enum RequestStep {
    /// The header block completed (the body may still be pending).
    Header(HttpRequest),
    /// The whole request completed; the parser has been reset.
    Complete(HttpRequest),
    /// The parser hit malformed input; the parser has been reset.
    Error(HttpRequest),
}

/// Feed one chunk of request bytes.
pub(crate) fn advance_request(request: &mut HttpRequest, buffer: &[u8]) -> Vec<RequestStep> {
    let mut steps = Vec::new();

    if request.is_pending_header() {
        if request.receive_header(buffer) && !request.is_error() {
            steps.push(RequestStep::Header(request.clone()));
        }
    } else {
        request.receive_body(buffer);
    }

    if request.is_error() {
        steps.push(RequestStep::Error(std::mem::take(request)));
    } else if request.is_ready() {
        steps.push(RequestStep::Complete(std::mem::take(request)));
    }
    steps
}

/// The remote closed mid-request: a request with its header parsed is
/// delivered with the bytes accumulated so far.
pub(crate) fn finish_request(request: &mut HttpRequest) -> Option<HttpRequest> {
    if request.is_pending_body() {
        return Some(std::mem::take(request));
    }
    None
}

/// What a chunk of response bytes produced.
pub(crate) enum ResponseStep {
    /// The header block completed (the body may still be pending).
    Header(HttpResponse),
    /// The whole response completed; the parser has been reset.
    Complete(HttpResponse),
    /// The parser hit malformed input; the parser has been reset.
    Error(HttpResponse),
}

/// Feed one chunk of response bytes.
pub(crate) fn advance_response(response: &mut HttpResponse, buffer: &[u8]) -> Vec<ResponseStep> {
    let mut steps = Vec::new();

    if response.is_pending_header() {
        if response.receive_header(buffer) && !response.is_error() {
            steps.push(ResponseStep::Header(response.clone()));
        }
    } else {
        response.receive_body(buffer);
    }

    if response.is_error() {
        steps.push(ResponseStep::Error(std::mem::take(response)));
    } else if response.is_ready() {
        steps.push(ResponseStep::Complete(std::mem::take(response)));
    }
    steps
}

/// The remote closed: a response with an undeclared length takes the
/// accumulated bytes as its body (connection-terminated body).
pub(crate) fn finish_response(response: &mut HttpResponse) -> Option<HttpResponse> {
    if response.is_pending_body() {
        response.finalize_body();
        return Some(std::mem::take(response));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_steps_in_one_chunk() {
        let mut built = HttpRequest::new();
        built.make_post_request("/k", b"body");

        let mut parser = HttpRequest::new();
        let steps = advance_request(&mut parser, built.cache());
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], RequestStep::Header(_)));
        match &steps[1] {
            RequestStep::Complete(request) => assert_eq!(request.body(), b"body"),
            _ => panic!("expected completion"),
        }
        // The parser reset for the next pipelined request.
        assert!(parser.is_empty());
    }

    #[test]
    fn test_response_error_step() {
        let mut parser = HttpResponse::new();
        let steps = advance_response(&mut parser, b"garbage without structure\r\n\r\n");
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0], ResponseStep::Error(_)));
    }

    #[test]
    fn test_connection_terminated_response() {
        let mut parser = HttpResponse::new();
        let steps = advance_response(&mut parser, b"HTTP/1.1 200 OK\r\n\r\nhalf");
        assert!(steps.is_empty());
        let finished = finish_response(&mut parser).unwrap();
        assert_eq!(finished.body(), b"half");
    }
}
