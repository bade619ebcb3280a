//! Inbound HTTP request adapter.
//!
//! [`HttpRequest`] turns an [`http::Request`] into the superglobal server
//! values a script sees as `$_SERVER`, and serves the request body to the
//! runtime when it builds `$_POST`.

use std::path::Path;

use bytes::Bytes;
use http::Request;
use http::header::{CONTENT_LENGTH, HOST};

use php_embed_core::{HostMap, HostValue, InboundRequest, MapKey};

/// An inbound request attached to an execution context.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    request: Request<Bytes>,
    remote_addr: Option<String>,
}

impl HttpRequest {
    pub fn new(request: Request<Bytes>) -> Self {
        Self {
            request,
            remote_addr: None,
        }
    }

    /// Set the peer address, as `host:port`.
    #[must_use]
    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = Some(remote_addr.into());
        self
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }
}

impl From<Request<Bytes>> for HttpRequest {
    fn from(request: Request<Bytes>) -> Self {
        Self::new(request)
    }
}

fn put(values: &mut HostMap, key: &str, value: impl Into<HostValue>) {
    values.insert(MapKey::from(key), value.into());
}

impl InboundRequest for HttpRequest {
    /// Every header except `Host` and `Content-Length` becomes an `HTTP_*`
    /// value. A header sent more than once is joined with `", "` in the order
    /// received.
    fn server_values(&self, document_root: &str, script_filename: &str) -> HostMap {
        let uri = self.request.uri();
        let headers = self.request.headers();
        let mut values = HostMap::new();

        let request_uri = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string);
        put(&mut values, "REQUEST_URI", request_uri);
        put(&mut values, "QUERY_STRING", uri.query().unwrap_or_default());
        put(&mut values, "REQUEST_METHOD", self.request.method().as_str());
        put(&mut values, "DOCUMENT_ROOT", document_root);
        put(&mut values, "SCRIPT_FILENAME", script_filename);

        let script = script_name(document_root, script_filename);
        put(&mut values, "SCRIPT_NAME", script.clone());
        put(&mut values, "PHP_SELF", script);

        let (remote_addr, remote_port) =
            split_host_port(self.remote_addr.as_deref().unwrap_or_default());
        put(&mut values, "REMOTE_ADDR", remote_addr);
        put(&mut values, "REMOTE_PORT", remote_port);

        let host = headers
            .get(HOST)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .or_else(|| uri.authority().map(ToString::to_string))
            .unwrap_or_default();
        let (server_name, server_port) = split_host_port(&host);
        put(&mut values, "SERVER_NAME", server_name);
        put(&mut values, "SERVER_PORT", server_port);
        put(&mut values, "HTTP_HOST", host);

        for name in headers.keys() {
            if *name == HOST || *name == CONTENT_LENGTH {
                continue;
            }
            let joined = headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            put(&mut values, &header_key(name.as_str()), joined);
        }

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0);
        put(&mut values, "HTTP_CONTENT_LENGTH", content_length);

        values
    }

    fn body(&self) -> &[u8] {
        self.request.body()
    }
}

/// `HTTP_` key for a header name: `x-forwarded-for` becomes
/// `HTTP_X_FORWARDED_FOR`.
pub fn header_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 5);
    key.push_str("HTTP_");
    key.extend(name.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// Split `host:port` on the last colon. Bracketed IPv6 hosts lose their
/// brackets; a missing port gives an empty string.
pub fn split_host_port(addr: &str) -> (String, String) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or_default();
            return (host.to_string(), port.to_string());
        }
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (addr.to_string(), String::new()),
    }
}

/// Path of the script relative to the document root, with a leading slash.
/// Empty when the script is not under the root.
pub fn script_name(document_root: &str, script_filename: &str) -> String {
    if document_root.is_empty() || script_filename.is_empty() {
        return String::new();
    }

    match Path::new(script_filename).strip_prefix(document_root) {
        Ok(relative) => {
            let parts: Vec<_> = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect();
            format!("/{}", parts.join("/"))
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(values: &HostMap, key: &str) -> HostValue {
        values.get(&MapKey::from(key)).cloned().unwrap_or_default()
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("1.2.3.4:5555"),
            ("1.2.3.4".to_string(), "5555".to_string())
        );
        assert_eq!(
            split_host_port("example.com"),
            ("example.com".to_string(), String::new())
        );
        assert_eq!(
            split_host_port("[::1]:8080"),
            ("::1".to_string(), "8080".to_string())
        );
        assert_eq!(split_host_port(""), (String::new(), String::new()));
    }

    #[test]
    fn test_script_name() {
        assert_eq!(script_name("/docroot", "/docroot/index.php"), "/index.php");
        assert_eq!(script_name("/docroot/", "/docroot/app/run.php"), "/app/run.php");
        assert_eq!(script_name("/docroot", "/elsewhere/index.php"), "");
        assert_eq!(script_name("", "/docroot/index.php"), "");
    }

    #[test]
    fn test_header_key() {
        assert_eq!(header_key("content-type"), "HTTP_CONTENT_TYPE");
        assert_eq!(header_key("x-forwarded-for"), "HTTP_X_FORWARDED_FOR");
    }

    #[test]
    fn test_server_values() {
        let request = Request::builder()
            .method("POST")
            .uri("/hello/world?foo=bar&baz=1")
            .header("Host", "example.com:8080")
            .header("X-Custom", "first")
            .header("X-Custom", "second")
            .header("Content-Length", "19")
            .body(Bytes::from_static(b"form_arg=form_value"))
            .unwrap();
        let request = HttpRequest::new(request).with_remote_addr("1.2.3.4:5555");

        let values = request.server_values("/docroot", "/docroot/index.php");

        assert_eq!(get(&values, "REQUEST_URI"), HostValue::from("/hello/world?foo=bar&baz=1"));
        assert_eq!(get(&values, "QUERY_STRING"), HostValue::from("foo=bar&baz=1"));
        assert_eq!(get(&values, "REQUEST_METHOD"), HostValue::from("POST"));
        assert_eq!(get(&values, "DOCUMENT_ROOT"), HostValue::from("/docroot"));
        assert_eq!(get(&values, "SCRIPT_FILENAME"), HostValue::from("/docroot/index.php"));
        assert_eq!(get(&values, "SCRIPT_NAME"), HostValue::from("/index.php"));
        assert_eq!(get(&values, "PHP_SELF"), HostValue::from("/index.php"));
        assert_eq!(get(&values, "REMOTE_ADDR"), HostValue::from("1.2.3.4"));
        assert_eq!(get(&values, "REMOTE_PORT"), HostValue::from("5555"));
        assert_eq!(get(&values, "HTTP_HOST"), HostValue::from("example.com:8080"));
        assert_eq!(get(&values, "SERVER_NAME"), HostValue::from("example.com"));
        assert_eq!(get(&values, "SERVER_PORT"), HostValue::from("8080"));
        assert_eq!(get(&values, "HTTP_X_CUSTOM"), HostValue::from("first, second"));
        assert_eq!(get(&values, "HTTP_CONTENT_LENGTH"), HostValue::Int(19));
        assert_eq!(request.body(), b"form_arg=form_value");
    }

    #[test]
    fn test_content_length_not_numeric() {
        let request = Request::builder()
            .uri("/")
            .header("Content-Length", "nineteen")
            .body(Bytes::new())
            .unwrap();

        let values = HttpRequest::new(request).server_values("", "");

        assert_eq!(get(&values, "HTTP_CONTENT_LENGTH"), HostValue::Int(0));
        assert_eq!(get(&values, "REMOTE_ADDR"), HostValue::from(""));
        assert_eq!(get(&values, "SCRIPT_NAME"), HostValue::from(""));
    }
}
