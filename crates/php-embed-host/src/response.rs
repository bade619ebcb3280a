//! HTTP response sink.
//!
//! [`HttpResponse`] records what a script sends: status, headers and body.
//! It implements the runtime's header protocol:
//! - replace: set the header, dropping earlier values
//! - append: add another value
//! - delete: remove every value
//!
//! Header operations are ignored once the response has started, that is
//! after the status line was sent or the first body byte was written.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use parking_lot::Mutex;
use tracing::debug;

use php_embed_core::{HeaderOp, ResponseWriter};

#[derive(Debug, Clone)]
struct ResponseState {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    started: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            started: false,
        }
    }
}

/// Response written by a script. Clones share the same response, so a host
/// keeps one clone and attaches another to the context.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse(Arc<Mutex<ResponseState>>);

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status code; 200 unless the script set another before the response
    /// started.
    pub fn status(&self) -> u16 {
        self.0.lock().status
    }

    pub fn headers(&self) -> HeaderMap {
        self.0.lock().headers.clone()
    }

    /// Every value recorded for a header, in order.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.0
            .lock()
            .headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect()
    }

    pub fn body(&self) -> Vec<u8> {
        self.0.lock().body.clone()
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().body).into_owned()
    }

    pub fn is_started(&self) -> bool {
        self.0.lock().started
    }

    /// Convert into an [`http::Response`].
    pub fn into_http_response(self) -> Response<Bytes> {
        let state = match Arc::try_unwrap(self.0) {
            Ok(state) => state.into_inner(),
            Err(shared) => shared.lock().clone(),
        };

        let mut response = Response::new(Bytes::from(state.body));
        *response.status_mut() = StatusCode::from_u16(state.status).unwrap_or(StatusCode::OK);
        *response.headers_mut() = state.headers;
        response
    }
}

/// Split a `Name: value` line at the first colon, trimming both parts.
fn split_header(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (line.trim(), ""),
    }
}

impl ResponseWriter for HttpResponse {
    fn apply_header(&mut self, op: HeaderOp, line: &str) {
        let mut state = self.0.lock();
        if state.started {
            debug!(line, "Header ignored, response already started");
            return;
        }

        let (name, value) = split_header(line);
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(line, "Invalid header name");
            return;
        };

        match op {
            HeaderOp::Replace | HeaderOp::Append if value.is_empty() => {}
            HeaderOp::Replace | HeaderOp::Append => {
                let Ok(value) = HeaderValue::from_str(value) else {
                    debug!(line, "Invalid header value");
                    return;
                };
                if op == HeaderOp::Replace {
                    state.headers.insert(header, value);
                } else {
                    state.headers.append(header, value);
                }
            }
            HeaderOp::Delete => {
                state.headers.remove(header);
            }
        }
    }

    fn send_headers(&mut self, status: Option<u16>) {
        let mut state = self.0.lock();
        if state.started {
            return;
        }
        if let Some(status) = status {
            state.status = status;
        }
        state.started = true;
    }

    fn write_body(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.0.lock();
        state.started = true;
        state.body.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_header() {
        assert_eq!(split_header("X-Testing: Hello"), ("X-Testing", "Hello"));
        assert_eq!(split_header("Location: http://a:80/"), ("Location", "http://a:80/"));
        assert_eq!(split_header("X-Testing"), ("X-Testing", ""));
    }

    #[test]
    fn test_header_protocol() {
        let response = HttpResponse::new();
        let mut writer = response.clone();

        writer.apply_header(HeaderOp::Replace, "X-Testing: Hello");
        assert_eq!(response.header_values("X-Testing"), vec!["Hello"]);

        writer.apply_header(HeaderOp::Append, "X-Testing: World");
        assert_eq!(response.header_values("X-Testing"), vec!["Hello", "World"]);

        writer.apply_header(HeaderOp::Delete, "X-Testing");
        assert!(response.header_values("X-Testing").is_empty());

        writer.apply_header(HeaderOp::Append, "X-Testing: Done");
        assert_eq!(response.header_values("X-Testing"), vec!["Done"]);
    }

    #[test]
    fn test_empty_values_ignored() {
        let response = HttpResponse::new();
        let mut writer = response.clone();

        writer.apply_header(HeaderOp::Replace, "X-Empty:");
        writer.apply_header(HeaderOp::Append, "X-Empty");
        writer.apply_header(HeaderOp::Delete, "");

        assert!(response.headers().is_empty());
    }

    #[test]
    fn test_headers_ignored_after_start() {
        let response = HttpResponse::new();
        let mut writer = response.clone();

        writer.send_headers(Some(404));
        writer.apply_header(HeaderOp::Replace, "X-Late: yes");
        writer.send_headers(Some(500));

        assert!(response.is_started());
        assert_eq!(response.status(), 404);
        assert!(response.header_values("X-Late").is_empty());
    }

    #[test]
    fn test_default_status_and_body() {
        let response = HttpResponse::new();
        let mut writer = response.clone();

        writer.send_headers(None);
        writer.write_body(b"Hello").unwrap();
        writer.write_body(b" World").unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.body_string(), "Hello World");
    }

    #[test]
    fn test_into_http_response() {
        let response = HttpResponse::new();
        let mut writer = response.clone();
        writer.apply_header(HeaderOp::Replace, "Content-Type: text/plain");
        writer.send_headers(Some(201));
        writer.write_body(b"created").unwrap();
        drop(writer);

        let response = response.into_http_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.body().as_ref(), b"created");
    }
}
