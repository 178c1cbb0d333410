//! End-to-end HTTP scenarios: CRUD against a key/value server, file-cache
//! hits, TRACE echo and unknown-method errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nexio_core::{EndpointOptions, Service};
use nexio_http::{
    HttpClientEx, HttpRequest, HttpResponse, HttpServer, HttpServerHandler, HttpSession,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// A key/value store speaking the CRUD mapping from the HTTP methods.
#[derive(Default)]
struct KvServer {
    storage: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl HttpServerHandler for KvServer {
    async fn on_received_request(&self, session: &HttpSession, request: &HttpRequest) {
        let key = request.url().to_string();
        let mut response = HttpResponse::new();
        match request.method() {
            "HEAD" => {
                response.make_head_response();
            }
            "GET" => match self.storage.lock().get(&key) {
                Some(value) => {
                    response.make_get_response(value.as_bytes());
                }
                None => {
                    response.make_error_response("required key was not found");
                }
            },
            "POST" | "PUT" => {
                let value = request.body_string();
                self.storage.lock().insert(key, value);
                response.make_ok_response(200);
            }
            "DELETE" => match self.storage.lock().remove(&key) {
                Some(value) => {
                    response.make_get_response(value.as_bytes());
                }
                None => {
                    response.make_error_response("deleted key was not found");
                }
            },
            "OPTIONS" => {
                response.make_options_response("HEAD,GET,POST,PUT,DELETE,OPTIONS,TRACE");
            }
            "TRACE" => {
                response.make_trace_response(request.cache());
            }
            _ => {
                response.make_error_response("unsupported HTTP method");
            }
        }
        session.send_response_async(&response);
    }
}

fn start_kv_server(service: &Service) -> HttpServer {
    let server = HttpServer::new(service, "127.0.0.1:0".parse().unwrap());
    server.set_options(EndpointOptions::new().reuse_address(true).no_delay(true));
    server.set_handler(Arc::new(KvServer::default()));
    server.start().unwrap();
    server
}

#[test]
fn http_crud() {
    let service = Service::new();
    assert!(service.start());

    let server = start_kv_server(&service);
    let address = server.bound_address().unwrap();
    let client = HttpClientEx::new(&service, address);

    // GET of a missing key reports an error status.
    let response = service
        .block_on(client.send_get("/k", TIMEOUT).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 500);

    // POST stores the initial value.
    let response = client
        .fetch(HttpRequest::new().make_post_request("/k", b"old"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .fetch(HttpRequest::new().make_get_request("/k"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "old");

    // PUT replaces it.
    let response = client
        .fetch(HttpRequest::new().make_put_request("/k", b"new"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .fetch(HttpRequest::new().make_get_request("/k"), TIMEOUT)
        .unwrap();
    assert_eq!(response.body_string(), "new");

    // DELETE returns the last value.
    let response = client
        .fetch(HttpRequest::new().make_delete_request("/k"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "new");

    // And the key is gone again.
    let response = client
        .fetch(HttpRequest::new().make_get_request("/k"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 500);

    let _ = client.client().disconnect();
    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn http_trace_and_options() {
    let service = Service::new();
    assert!(service.start());

    let server = start_kv_server(&service);
    let address = server.bound_address().unwrap();
    let client = HttpClientEx::new(&service, address);

    let mut trace = HttpRequest::new();
    trace.make_trace_request("/anything");
    let response = client.fetch(&trace, TIMEOUT).unwrap();
    assert_eq!(response.status(), 200);
    // TRACE responses echo the original request bytes into the body.
    assert_eq!(response.body(), trace.cache());

    let response = client
        .fetch(HttpRequest::new().make_options_request("/"), TIMEOUT)
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(
        response
            .header_value("Allow")
            .is_some_and(|allow| allow.contains("DELETE"))
    );

    let _ = client.client().disconnect();
    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn http_file_cache_serves_get() {
    let service = Service::new();
    assert!(service.start());

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();

    let server = start_kv_server(&service);
    server
        .cache_path("/static", dir.path(), Some(Duration::from_secs(60)))
        .unwrap();
    let address = server.bound_address().unwrap();

    let client = HttpClientEx::new(&service, address);
    let response = client
        .fetch(
            HttpRequest::new().make_get_request("/static/hello.txt?version=1"),
            TIMEOUT,
        )
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"hello world");
    assert_eq!(response.header_value("Cache-Control"), Some("max-age=60"));

    let _ = client.client().disconnect();
    assert!(server.stop());
    assert!(service.stop());
}

#[test]
fn http_request_timeout_rejects() {
    let service = Service::new();
    assert!(service.start());

    // A server that accepts but never answers.
    struct SilentServer;
    #[async_trait]
    impl HttpServerHandler for SilentServer {
        async fn on_received_request(&self, _session: &HttpSession, _request: &HttpRequest) {}
    }

    let server = HttpServer::new(&service, "127.0.0.1:0".parse().unwrap());
    server.set_handler(Arc::new(SilentServer));
    server.start().unwrap();
    let address = server.bound_address().unwrap();

    let client = HttpClientEx::new(&service, address);
    let result = client.fetch(
        HttpRequest::new().make_get_request("/hang"),
        Duration::from_millis(200),
    );
    assert!(result.is_err());

    assert!(server.stop());
    assert!(service.stop());
}
