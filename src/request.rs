//! Typed request plus the incremental, resumable HTTP/1.1 parser.
//!
//! The connection appends raw bytes to its receive buffer and calls
//! [`parse`]; the parser consumes what it can with a cursor and discards the
//! consumed prefix. Malformed input never unwinds: the parser records a
//! status on the request and drives the state to `Complete`, and the router
//! turns that status into the response.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::response::status;

/// Longest accepted request target, excluding the query string.
pub const MAX_TARGET_LEN: usize = 2048;
/// Longest accepted header line.
pub const MAX_HEADER_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Invalid,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Invalid => "INVALID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
}

/// The single route classification the router assigns to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    StaticPage,
    Cgi,
    AutoIndex,
    Upload,
    Delete,
    Redirect,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub content_length: usize,
    pub chunked: bool,
    pub connection_close: bool,
    pub expect_continue: bool,
    pub redirect: bool,
    pub host: String,
}

impl RequestMeta {
    fn new() -> Self {
        Self {
            content_length: 0,
            chunked: false,
            connection_close: false,
            expect_continue: false,
            redirect: false,
            host: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    Separator,
    /// CRLF after the zero-size chunk; consuming it completes the body.
    Trailer,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Request target with the query string stripped.
    pub path: String,
    pub query: String,
    pub http_major: u8,
    pub http_minor: u8,
    /// Keys lowercased, values trimmed, duplicates joined by `,`.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// `status::OK` until the parser finds a reason to refuse the request.
    pub parse_status: u16,
    pub state: ParseState,
    pub verdict: Verdict,
    pub resolved_path: PathBuf,
    pub meta: RequestMeta,

    // Parser carry between invocations.
    line: Vec<u8>,
    chunk_phase: ChunkPhase,
    chunk_buf: Vec<u8>,
    chunk_size: usize,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Invalid,
            path: String::new(),
            query: String::new(),
            http_major: 0,
            http_minor: 0,
            headers: HashMap::new(),
            body: Vec::new(),
            parse_status: status::OK,
            state: ParseState::RequestLine,
            verdict: Verdict::Error,
            resolved_path: PathBuf::new(),
            meta: RequestMeta::new(),
            line: Vec::new(),
            chunk_phase: ChunkPhase::Size,
            chunk_buf: Vec::new(),
            chunk_size: 0,
        }
    }

    /// Return to the initial state; the surrounding connection is untouched.
    pub fn reset(&mut self) {
        *self = Request::new();
    }

    /// Case-insensitive header lookup (keys are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn fail(&mut self, status: u16) {
        self.parse_status = status;
        self.state = ParseState::Complete;
    }

    fn add_header(&mut self, key: String, value: String) {
        match self.headers.get_mut(&key) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(&value);
            }
            None => {
                self.headers.insert(key, value);
            }
        }
    }
}

/// Feed buffered bytes through the parser, consuming what it accepts.
pub fn parse(buf: &mut Vec<u8>, req: &mut Request, server: &ServerConfig) {
    if req.state == ParseState::Complete {
        return;
    }

    let mut i = 0;
    while i < buf.len() && req.state != ParseState::Complete {
        if req.state < ParseState::Body {
            let byte = buf[i];
            if byte == b'\r' {
                if i + 1 >= buf.len() {
                    break; // LF not here yet; resume on the next read
                }
                if buf[i + 1] != b'\n' {
                    req.fail(status::BAD_REQUEST);
                    break;
                }
                let line = std::mem::take(&mut req.line);
                match req.state {
                    ParseState::RequestLine => {
                        if line.is_empty() {
                            req.fail(status::BAD_REQUEST);
                            break;
                        }
                        parse_request_line(&line, req, server);
                        if req.parse_status != status::OK {
                            req.state = ParseState::Complete;
                            break;
                        }
                        req.state = ParseState::Headers;
                    }
                    ParseState::Headers => {
                        if line.is_empty() {
                            // Blank line: headers done, body phase starts.
                            if req.meta.content_length > 0 || req.meta.chunked {
                                req.state = ParseState::Body;
                            } else {
                                req.state = ParseState::Complete;
                            }
                        } else {
                            parse_header_line(&line, req, server.client_max_body_size);
                        }
                    }
                    _ => unreachable!(),
                }
                i += 2;
            } else {
                req.line.push(byte);
                i += 1;
            }
        } else if req.meta.chunked {
            parse_chunked_byte(buf[i], req, server.client_max_body_size);
            i += 1;
        } else {
            let want = req.meta.content_length - req.body.len();
            let take = want.min(buf.len() - i);
            req.body.extend_from_slice(&buf[i..i + take]);
            i += take;
            if req.body.len() >= req.meta.content_length {
                req.state = ParseState::Complete;
            }
        }
    }

    if i > 0 {
        buf.drain(..i);
    }

    // Downstream CGI needs a fixed CONTENT_LENGTH, so a decoded chunked body
    // is re-normalized to an ordinary one.
    if req.meta.chunked && req.state == ParseState::Complete {
        req.meta.chunked = false;
        req.meta.content_length = req.body.len();
        req.headers.remove("transfer-encoding");
        req.headers
            .insert("content-length".to_string(), req.body.len().to_string());
    }
}

fn parse_request_line(line: &[u8], req: &mut Request, server: &ServerConfig) {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(_) => {
            req.fail(status::BAD_REQUEST);
            return;
        }
    };
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != 3 {
        req.fail(status::BAD_REQUEST);
        return;
    }

    // Target: the query string is stored separately.
    let target = tokens[1];
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    if path.len() > MAX_TARGET_LEN {
        req.fail(status::URI_TOO_LONG);
        return;
    }
    req.path = path.to_string();
    req.query = query.to_string();

    req.method = match tokens[0] {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "DELETE" => Method::Delete,
        _ => {
            req.parse_status = status::METHOD_NOT_ALLOWED;
            Method::Invalid
        }
    };
    if req.method != Method::Invalid && !server.match_location(&req.path).allows(req.method) {
        req.parse_status = status::METHOD_NOT_ALLOWED;
    }

    let version = tokens[2];
    match version.strip_prefix("HTTP/").map(|v| v.split_once('.')) {
        Some(Some((major, minor))) if !major.is_empty() && !minor.is_empty() => {
            if major != "1" || minor != "1" {
                req.parse_status = status::HTTP_VERSION_NOT_SUPPORTED;
                return;
            }
            req.http_major = 1;
            req.http_minor = 1;
        }
        _ => {
            req.parse_status = status::BAD_REQUEST;
        }
    }
}

fn parse_header_line(line: &[u8], req: &mut Request, max_body_size: usize) {
    if line.len() > MAX_HEADER_LINE {
        req.fail(status::PAYLOAD_TOO_LARGE);
        return;
    }
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(_) => {
            req.fail(status::BAD_REQUEST);
            return;
        }
    };
    let (name, value) = match line.split_once(':') {
        Some((name, value)) => (name, value),
        None => {
            req.fail(status::BAD_REQUEST);
            return;
        }
    };
    let key = name.trim().to_ascii_lowercase();
    let value = value.trim().to_string();

    match key.as_str() {
        "host" => req.meta.host = value.clone(),
        "content-length" => match value.parse::<usize>() {
            Ok(length) => {
                if max_body_size > 0 && length > max_body_size {
                    req.fail(status::PAYLOAD_TOO_LARGE);
                    return;
                }
                req.meta.content_length = length;
            }
            Err(_) => {
                req.fail(status::BAD_REQUEST);
                return;
            }
        },
        "transfer-encoding" => {
            let coding = value.to_ascii_lowercase();
            if coding.contains("chunked") {
                req.meta.chunked = true;
            } else if coding != "identity" {
                req.fail(status::BAD_REQUEST);
                return;
            }
        }
        "connection" => {
            if value.eq_ignore_ascii_case("close") {
                req.meta.connection_close = true;
            }
        }
        "expect" => {
            if value.eq_ignore_ascii_case("100-continue") {
                req.meta.expect_continue = true;
            } else {
                req.fail(status::BAD_REQUEST);
                return;
            }
        }
        _ => {}
    }

    req.add_header(key, value);
}

fn parse_chunked_byte(byte: u8, req: &mut Request, max_body_size: usize) {
    if max_body_size > 0 && req.body.len() + req.chunk_buf.len() > max_body_size {
        req.fail(status::PAYLOAD_TOO_LARGE);
        return;
    }

    match req.chunk_phase {
        ChunkPhase::Size => {
            req.line.push(byte);
            if req.line.ends_with(b"\r\n") {
                let digits = &req.line[..req.line.len() - 2];
                let size = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| usize::from_str_radix(s.trim(), 16).ok());
                req.line.clear();
                match size {
                    None => req.fail(status::BAD_REQUEST),
                    Some(0) => {
                        req.chunk_phase = ChunkPhase::Trailer;
                    }
                    Some(size) => {
                        if max_body_size > 0 && req.body.len() + size > max_body_size {
                            req.fail(status::PAYLOAD_TOO_LARGE);
                            return;
                        }
                        req.chunk_size = size;
                        req.chunk_phase = ChunkPhase::Data;
                    }
                }
            }
        }
        ChunkPhase::Data => {
            req.chunk_buf.push(byte);
            if req.chunk_buf.len() == req.chunk_size {
                let chunk = std::mem::take(&mut req.chunk_buf);
                req.body.extend_from_slice(&chunk);
                req.chunk_phase = ChunkPhase::Separator;
            }
        }
        ChunkPhase::Separator | ChunkPhase::Trailer => {
            req.line.push(byte);
            if req.line.ends_with(b"\r\n") {
                if req.line.len() != 2 {
                    req.fail(status::BAD_REQUEST);
                    return;
                }
                req.line.clear();
                if req.chunk_phase == ChunkPhase::Trailer {
                    req.state = ParseState::Complete;
                } else {
                    req.chunk_phase = ChunkPhase::Size;
                }
            } else if req.line.len() > 2 {
                req.fail(status::BAD_REQUEST);
            }
        }
    }
}
