// ABOUTME: Minimal HTTP/1.1 request and response types used by the WebSocket handshake
// ABOUTME: Parsing covers the request/status line plus headers only; no body, no chunked transfer-encoding

use std::fmt;

/// Raised when a byte slice isn't a well-formed HTTP/1.1 request or
/// status line plus headers, or when more bytes are needed to finish
/// parsing a header block that was only partially received.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed http message: {0}")]
    Malformed(String),
    #[error("need more bytes to finish parsing headers")]
    Incomplete,
    #[error("too many headers ({0}), limit is {1}")]
    TooManyHeaders(usize, usize),
}

const MAX_HEADERS: usize = 64;

/// Case-insensitive header bag. Order of insertion is preserved for
/// `iter()`, and repeated header names keep every value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { entries: Vec::new() }
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// True if `name`'s value, split on commas and trimmed, contains
    /// `token` case-insensitively. Used for `Connection: upgrade` and
    /// `Upgrade: websocket` checks where other tokens may be present.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).iter().any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed HTTP request line plus headers. Carries no body; the
/// WebSocket handshake never sends one.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: (u8, u8),
    pub headers: Headers,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            version: (1, 1),
            headers: Headers::new(),
        }
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push(name, value);
        self
    }

    /// Parses a complete request line and header block. `buf` may
    /// contain trailing bytes (the start of a body or a subsequent
    /// message); only the consumed prefix is significant to the caller,
    /// who must track the blank-line terminator itself via `httparse`'s
    /// return value if that matters for framing.
    pub fn parse(buf: &[u8]) -> Result<HttpRequest, HttpError> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut header_storage);
        let status = req
            .parse(buf)
            .map_err(|e| HttpError::Malformed(e.to_string()))?;
        if status.is_partial() {
            return Err(HttpError::Incomplete);
        }
        let method = req
            .method
            .ok_or_else(|| HttpError::Malformed("missing method".into()))?
            .to_string();
        let path = req
            .path
            .ok_or_else(|| HttpError::Malformed("missing path".into()))?
            .to_string();
        let version = match req.version {
            Some(1) => (1, 1),
            Some(0) => (1, 0),
            _ => return Err(HttpError::Malformed("unsupported http version".into())),
        };
        let mut headers = Headers::new();
        for h in req.headers.iter() {
            if h.name.is_empty() {
                break;
            }
            let value = std::str::from_utf8(h.value)
                .map_err(|_| HttpError::Malformed("non-utf8 header value".into()))?;
            headers.push(h.name, value);
        }
        Ok(HttpRequest {
            method,
            path,
            version,
            headers,
        })
    }

    /// Serializes back to wire bytes, CRLF terminated, for the client
    /// side of the handshake.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} HTTP/{}.{}\r\n",
            self.method, self.path, self.version.0, self.version.1
        );
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A parsed HTTP status line plus headers, or one under construction
/// for the server side of the handshake.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: (u8, u8),
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
}

impl HttpResponse {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        HttpResponse {
            version: (1, 1),
            code,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push(name, value);
        self
    }

    pub fn parse(buf: &[u8]) -> Result<HttpResponse, HttpError> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut header_storage);
        let status = resp
            .parse(buf)
            .map_err(|e| HttpError::Malformed(e.to_string()))?;
        if status.is_partial() {
            return Err(HttpError::Incomplete);
        }
        let code = resp
            .code
            .ok_or_else(|| HttpError::Malformed("missing status code".into()))?;
        let reason = resp.reason.unwrap_or("").to_string();
        let version = match resp.version {
            Some(1) => (1, 1),
            Some(0) => (1, 0),
            _ => return Err(HttpError::Malformed("unsupported http version".into())),
        };
        let mut headers = Headers::new();
        for h in resp.headers.iter() {
            if h.name.is_empty() {
                break;
            }
            let value = std::str::from_utf8(h.value)
                .map_err(|_| HttpError::Malformed("non-utf8 header value".into()))?;
            headers.push(h.name, value);
        }
        Ok(HttpResponse {
            version,
            code,
            reason,
            headers,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/{}.{} {} {}\r\n",
            self.version.0, self.version.1, self.code, self.reason
        );
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} HTTP/{}.{}", self.method, self.path, self.version.0, self.version.1)
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{} {} {}", self.version.0, self.version.1, self.code, self.reason)
    }
}
