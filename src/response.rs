//! Response object, status table, and the wire serializer.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::config::ServerConfig;
use crate::request::Request;

/// HTTP status codes used by the server.
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    pub const URI_TOO_LONG: u16 = 414;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const BAD_GATEWAY: u16 = 502;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
    pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Statuses after which the connection closes regardless of the client's
/// stated preference.
pub fn must_close(code: u16) -> bool {
    matches!(code, 400 | 408 | 411 | 413 | 414 | 431 | 500 | 501 | 505)
}

/// RFC 1123 formatted date for the `Date` header.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime: DateTime<Utc> = self.0.into();
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub http_version: &'static str,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub chunked: bool,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: status::OK,
            http_version: "1.1",
            headers: BTreeMap::new(),
            body: Vec::new(),
            chunked: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Response::new();
    }

    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// Replace any previous value for `name`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// Add a header, joining repeated names with `,`.
    pub fn append_header(&mut self, name: &str, value: &str) {
        match self.headers.get_mut(name) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                self.headers.insert(name.to_string(), value.to_string());
            }
        }
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) {
        self.set_header("Content-Type", content_type);
        self.set_header("Content-Length", &body.len().to_string());
        self.body = body;
    }
}

/// Inject the mandatory headers, decide the connection mode, and fill in an
/// error page when a status >= 400 has no body yet.
///
/// `must_close` statuses also flip the request meta so the dispatcher drops
/// the connection after the send completes.
pub fn finalize(req: &mut Request, res: &mut Response, server: &ServerConfig) {
    res.set_header("Date", &HttpDate(SystemTime::now()).to_string());
    res.set_header(
        "Server",
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
    );

    if must_close(res.status) {
        req.meta.connection_close = true;
    }
    if req.meta.connection_close {
        res.set_header("Connection", "close");
    } else {
        res.set_header("Connection", "keep-alive");
    }

    if res.status >= 400 && res.body.is_empty() {
        if !configured_error_page(res, server) {
            let page = default_error_page(res.status);
            res.set_body(page.into_bytes(), "text/html");
        }
    }

    // Responses without a body still need framing for keep-alive.
    if !res.headers.contains_key("Content-Length")
        && !matches!(res.status, 100..=199 | 204 | 304)
    {
        res.set_header("Content-Length", &res.body.len().to_string());
    }
}

fn configured_error_page(res: &mut Response, server: &ServerConfig) -> bool {
    let page = match server.error_pages.get(&res.status) {
        Some(page) => page,
        None => return false,
    };
    let path = server.root.join(page.trim_start_matches('/'));
    match std::fs::read(&path) {
        Ok(content) => {
            res.set_body(content, "text/html");
            true
        }
        Err(_) => false,
    }
}

fn default_error_page(code: u16) -> String {
    let reason = reason_phrase(code);
    format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        <hr>\n\
        Generated by {}/{}\n\
        </body></html>\n",
        code,
        reason,
        reason,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
}

/// Turn the response into wire bytes: status line, headers, blank line, body.
pub fn serialize(res: &Response) -> Vec<u8> {
    let mut wire = Vec::with_capacity(res.body.len() + 256);
    wire.extend_from_slice(
        format!("HTTP/{} {} {}\r\n", res.http_version, res.status, res.reason()).as_bytes(),
    );
    for (name, value) in &res.headers {
        wire.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    if !res.chunked {
        wire.extend_from_slice(&res.body);
    }
    wire
}
