//! Per-request context shared by the routing core, filters, handlers and
//! the access log.

use chrono::{DateTime, Local};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Body, Request, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The mutable state of one request while it moves through
/// routing, filters, handler, error pages and logging.
pub struct RequestCtx {
    pub request: Request<Body>,
    pub response: Response<Body>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Request ordinal on its connection, starting at 1.
    pub conn_request_num: u64,
    pub request_id: u64,
    /// Original request URI captured before any rewrite, when the access
    /// log format requires it.
    pub original_request_uri: Option<String>,
    /// Authenticated user name set by the basicAuth filter.
    pub username: Option<String>,
    /// Reason phrase from the route table; hyper does not put custom
    /// phrases on the wire, so generated error bodies surface it instead.
    pub status_reason: Option<Vec<u8>>,
    started: DateTime<Local>,
    started_instant: Instant,
}

impl RequestCtx {
    pub fn new(
        request: Request<Body>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        conn_request_num: u64,
    ) -> Self {
        Self {
            request,
            response: Response::new(Body::empty()),
            remote_addr,
            local_addr,
            conn_request_num,
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            original_request_uri: None,
            username: None,
            status_reason: None,
            started: Local::now(),
            started_instant: Instant::now(),
        }
    }

    pub fn method_bytes(&self) -> &[u8] {
        self.request.method().as_str().as_bytes()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    pub fn query(&self) -> &str {
        self.request.uri().query().unwrap_or("")
    }

    /// The request URI as it appears on the request line (path + query).
    pub fn request_uri(&self) -> String {
        self.request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// The Host header value without an optional `:port` suffix.
    pub fn host(&self) -> &str {
        let host = self
            .request
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        host.rsplit_once(':').map_or(host, |(name, port)| {
            if port.bytes().all(|b| b.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
    }

    /// Replaces the request URI in place, keeping the old one when the
    /// replacement does not parse.
    pub fn set_request_uri(&mut self, uri: &[u8]) {
        if let Ok(new_uri) = Uri::try_from(uri) {
            *self.request.uri_mut() = new_uri;
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    pub fn set_status(&mut self, status: u16) {
        if let Ok(code) = StatusCode::from_u16(status) {
            *self.response.status_mut() = code;
        }
    }

    /// Resets the response to a bare status with an empty body.
    pub fn reset_response(&mut self) {
        self.response = Response::new(Body::empty());
        self.status_reason = None;
    }

    /// Writes a plain-text error response, replacing any body produced so
    /// far.
    pub fn error(&mut self, status: u16, message: &str) {
        self.reset_response();
        self.set_status(status);
        self.response
            .headers_mut()
            .insert(CONTENT_TYPE, "text/plain; charset=utf-8".parse().expect("static header value"));
        self.set_body(message.as_bytes().to_vec());
    }

    /// Finalizes the response as a redirect to `uri`.
    pub fn redirect(&mut self, uri: &[u8], status: u16) {
        let status = if crate::util::is_http_status_redirect(status) {
            status
        } else {
            302
        };
        self.reset_response();
        self.set_status(status);
        if let Ok(value) = hyper::header::HeaderValue::from_bytes(uri) {
            self.response.headers_mut().insert(LOCATION, value);
        }
        self.set_body(Vec::new());
    }

    /// Sets the response body and its Content-Length.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.response
            .headers_mut()
            .insert(CONTENT_LENGTH, hyper::header::HeaderValue::from(body.len()));
        *self.response.body_mut() = Body::from(body);
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_instant.elapsed()
    }

    pub fn protocol(&self) -> &'static str {
        match self.request.version() {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }

    /// Whether the connection may be kept alive after this response.
    pub fn keep_alive(&self) -> bool {
        let closing = self
            .response
            .headers()
            .get(hyper::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        !closing
    }

    fn content_length(headers: &hyper::HeaderMap) -> u64 {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn response_content_length(&self) -> u64 {
        Self::content_length(self.response.headers())
    }

    /// Bytes received, including the request line and headers.
    pub fn request_bytes(&self) -> u64 {
        let mut n = self.method_bytes().len() + self.request_uri().len() + self.protocol().len() + 4;
        for (name, value) in self.request.headers() {
            n += name.as_str().len() + value.as_bytes().len() + 4;
        }
        n as u64 + 2 + Self::content_length(self.request.headers())
    }

    /// Bytes sent, including the status line and headers.
    pub fn response_bytes(&self) -> u64 {
        let status = self.response.status();
        let mut n = self.protocol().len()
            + 4
            + 3
            + status.canonical_reason().map_or(0, str::len)
            + 2;
        for (name, value) in self.response.headers() {
            n += name.as_str().len() + value.as_bytes().len() + 4;
        }
        n as u64 + 2 + self.response_content_length()
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(method: &str, uri: &str) -> RequestCtx {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    RequestCtx::new(
        request,
        "127.0.0.1:50000".parse().unwrap(),
        "127.0.0.1:8080".parse().unwrap(),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accessors() {
        let ctx = test_ctx("GET", "/view?id=1");
        assert_eq!(ctx.method_bytes(), b"GET");
        assert_eq!(ctx.path(), "/view");
        assert_eq!(ctx.query(), "id=1");
        assert_eq!(ctx.request_uri(), "/view?id=1");
        assert_eq!(ctx.protocol(), "HTTP/1.1");
    }

    #[test]
    fn test_host_strips_port() {
        let mut ctx = test_ctx("GET", "/");
        ctx.request
            .headers_mut()
            .insert(hyper::header::HOST, "example.com:8443".parse().unwrap());
        assert_eq!(ctx.host(), "example.com");

        ctx.request
            .headers_mut()
            .insert(hyper::header::HOST, "example.com".parse().unwrap());
        assert_eq!(ctx.host(), "example.com");
    }

    #[test]
    fn test_set_request_uri() {
        let mut ctx = test_ctx("GET", "/view/1");
        ctx.set_request_uri(b"/view?id=1");
        assert_eq!(ctx.path(), "/view");
        assert_eq!(ctx.query(), "id=1");

        // Unparseable replacements keep the current URI.
        ctx.set_request_uri(b"\xff\xfe");
        assert_eq!(ctx.path(), "/view");
    }

    #[test]
    fn test_redirect() {
        let mut ctx = test_ctx("GET", "/redirect-external");
        ctx.redirect(b"http://example.com/", 302);
        assert_eq!(ctx.status(), 302);
        assert_eq!(
            ctx.response.headers().get(LOCATION).unwrap(),
            "http://example.com/"
        );

        // A non-redirect status falls back to 302.
        ctx.redirect(b"/elsewhere", 200);
        assert_eq!(ctx.status(), 302);
    }

    #[test]
    fn test_error_resets_body() {
        let mut ctx = test_ctx("GET", "/");
        ctx.set_body(b"partial".to_vec());
        ctx.error(401, "Unauthorized");
        assert_eq!(ctx.status(), 401);
        assert_eq!(ctx.response_content_length(), 12);
    }

    #[test]
    fn test_byte_accounting_includes_headers() {
        let mut ctx = test_ctx("GET", "/");
        ctx.request
            .headers_mut()
            .insert(hyper::header::HOST, "example.com".parse().unwrap());
        ctx.set_body(b"hello".to_vec());
        assert!(ctx.request_bytes() > 0);
        assert!(ctx.response_bytes() > ctx.response_content_length());
        assert_eq!(ctx.response_content_length(), 5);
    }

    #[test]
    fn test_keep_alive() {
        let mut ctx = test_ctx("GET", "/");
        assert!(ctx.keep_alive());
        ctx.response
            .headers_mut()
            .insert(hyper::header::CONNECTION, "close".parse().unwrap());
        assert!(!ctx.keep_alive());
    }
}
