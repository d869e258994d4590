//! Synchronous request handlers: static files, directory listings, uploads,
//! and DELETE. Handlers populate the response and never touch the socket.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;

use crate::request::Request;
use crate::response::{status, Response};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

static MIME_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (mimetype, extensions) in &[
        ("application/javascript", "js"),
        ("application/json", "json"),
        ("application/ogg", "ogg"),
        ("application/pdf", "pdf"),
        ("application/wasm", "wasm"),
        ("application/xml", "xsl xml"),
        ("application/zip", "zip"),
        ("audio/mpeg", "mp2 mp3 mpga"),
        ("image/gif", "gif"),
        ("image/jpeg", "jpeg jpe jpg"),
        ("image/png", "png"),
        ("image/svg+xml", "svg"),
        ("text/css", "css"),
        ("text/html", "html htm"),
        ("text/plain", "txt asc"),
        ("video/mp4", "mp4"),
        ("video/mpeg", "mpeg mpe mpg"),
        ("video/quicktime", "qt mov"),
    ] {
        for extension in extensions.split(' ') {
            map.insert(extension, *mimetype);
        }
    }
    map
});

/// Content type for a filesystem path, by extension.
pub fn content_type(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| MIME_TYPES.get(ext.as_str()).copied())
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Read the resolved file into the response body.
pub fn serve_static(req: &Request, res: &mut Response) {
    match fs::read(&req.resolved_path) {
        Ok(content) => {
            let mime = content_type(&req.resolved_path);
            res.set_body(content, mime);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            res.status = status::NOT_FOUND;
        }
        Err(_) => {
            res.status = status::INTERNAL_SERVER_ERROR;
        }
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

struct FileSize(u64);

impl fmt::Display for FileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1024 {
            write!(f, "{} B", self.0)
        } else if self.0 < 1024 * 1024 {
            write!(f, "{} KB", self.0 / 1024)
        } else {
            write!(f, "{} MB", self.0 / (1024 * 1024))
        }
    }
}

struct ModTime(SystemTime);

impl fmt::Display for ModTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime: DateTime<Local> = self.0.into();
        write!(f, "{}", datetime.format("%d-%b-%Y %H:%M"))
    }
}

/// Table rows for a directory listing.
struct Listing<'a> {
    entries: &'a [fs::DirEntry],
    uri: &'a str,
}

impl<'a> fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let slash = if metadata.is_dir() { "/" } else { "" };
            write!(
                f,
                "<tr><td><a href=\"{}{}{}\">{}{}</a></td>",
                UrlEncoded(self.uri),
                UrlEncoded(&name),
                slash,
                HtmlEscaped(&name),
                slash,
            )?;
            match metadata.modified() {
                Ok(modified) => write!(f, "<td class=\"date\">{}</td>", ModTime(modified))?,
                Err(_) => write!(f, "<td class=\"date\">-</td>")?,
            }
            if metadata.is_dir() {
                write!(f, "<td class=\"size\">-</td></tr>\n")?;
            } else {
                write!(f, "<td class=\"size\">{}</td></tr>\n", FileSize(metadata.len()))?;
            }
        }
        Ok(())
    }
}

/// Render the resolved directory as an HTML table.
pub fn serve_autoindex(req: &Request, res: &mut Response) {
    let mut uri = req.path.clone();
    if !uri.ends_with('/') {
        uri.push('/');
    }

    let mut entries: Vec<fs::DirEntry> = match fs::read_dir(&req.resolved_path) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).collect(),
        Err(_) => {
            res.status = status::INTERNAL_SERVER_ERROR;
            return;
        }
    };
    entries.sort_by_key(|entry| entry.file_name());

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Index of {path}</title>\n\
        <style>\n\
        body {{ font-family: monospace; font-size: 13px; padding: 20px; }}\n\
        table {{ border-collapse: collapse; }}\n\
        td, th {{ padding: 4px 16px; text-align: left; }}\n\
        .size {{ text-align: right; }}\n\
        </style>\n</head>\n<body>\n<h1>Index of {path}</h1>\n<table>\n\
        <thead><tr><th>Name</th><th>Last Modified</th><th>Size</th></tr></thead>\n\
        <tbody>\n\
        <tr><td><a href=\"../\">../</a></td><td></td><td></td></tr>\n\
        {listing}\
        </tbody>\n</table>\n<hr>\n<address>{server}/{version}</address>\n</body>\n</html>\n",
        path = HtmlEscaped(&uri),
        listing = Listing {
            entries: &entries,
            uri: &uri
        },
        server = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
    );
    res.status = status::OK;
    res.set_body(html.into_bytes(), "text/html");
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}

/// Extract the boundary parameter from a multipart Content-Type value.
fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let pos = find(b"boundary=", lower.as_bytes())?;
    let mut value = content_type[pos + "boundary=".len()..].trim();
    if let Some(semicolon) = value.find(';') {
        value = value[..semicolon].trim();
    }
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Filename from a part's Content-Disposition, with quotes and any leading
/// path components dropped.
fn part_filename(headers: &[u8]) -> Option<String> {
    let headers = String::from_utf8_lossy(headers);
    for line in headers.split("\r\n") {
        if !line.to_ascii_lowercase().starts_with("content-disposition:") {
            continue;
        }
        let pos = line.to_ascii_lowercase().find("filename=")?;
        let mut value = line[pos + "filename=".len()..].trim();
        if let Some(rest) = value.strip_prefix('"') {
            value = rest.split('"').next().unwrap_or(rest);
        } else if let Some(semicolon) = value.find(';') {
            value = value[..semicolon].trim();
        }
        let basename = value
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(value);
        if basename.is_empty() {
            return None;
        }
        return Some(basename.to_string());
    }
    None
}

/// Split a multipart body into its parts' raw bytes.
fn multipart_parts<'a>(body: &'a [u8], boundary: &str) -> Option<Vec<&'a [u8]>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    if !body.starts_with(&delimiter) {
        return None;
    }
    let mut parts = Vec::new();
    let mut pos = delimiter.len();
    if body[pos..].starts_with(b"\r\n") {
        pos += 2;
    }
    loop {
        let mut separator = b"\r\n".to_vec();
        separator.extend_from_slice(&delimiter);
        let next = match find(&separator, &body[pos..]) {
            Some(offset) => pos + offset,
            None => break,
        };
        parts.push(&body[pos..next]);
        pos = next + separator.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }
    }
    Some(parts)
}

/// Store every file part of a multipart/form-data body under `upload_base`.
///
/// The handler answers 201 with a small confirmation page; a missing or
/// non-multipart Content-Type and an unparseable body are the client's
/// fault (400).
pub fn handle_upload(req: &Request, res: &mut Response, upload_base: &Path) {
    let content_type = match req.header("content-type") {
        Some(value) => value.to_string(),
        None => {
            res.status = status::BAD_REQUEST;
            return;
        }
    };
    if !content_type.to_ascii_lowercase().contains("multipart/form-data") {
        res.status = status::BAD_REQUEST;
        return;
    }
    let boundary = match extract_boundary(&content_type) {
        Some(boundary) => boundary,
        None => {
            res.status = status::BAD_REQUEST;
            return;
        }
    };
    let parts = match multipart_parts(&req.body, &boundary) {
        Some(parts) => parts,
        None => {
            res.status = status::BAD_REQUEST;
            return;
        }
    };

    let mut saved = 0;
    for part in parts {
        let header_end = match find(b"\r\n\r\n", part) {
            Some(header_end) => header_end,
            None => {
                res.status = status::BAD_REQUEST;
                return;
            }
        };
        let filename = match part_filename(&part[..header_end]) {
            Some(filename) => filename,
            None => continue, // plain form field
        };
        let data = &part[header_end + 4..];
        if fs::write(upload_base.join(&filename), data).is_err() {
            res.status = status::INTERNAL_SERVER_ERROR;
            return;
        }
        saved += 1;
    }

    res.status = status::CREATED;
    let page = format!(
        "<html><body><h1>Upload successful</h1><p>{} file(s) stored.</p></body></html>\n",
        saved
    );
    res.set_body(page.into_bytes(), "text/html; charset=utf-8");
}

/// Remove the resolved path. 204 on success, 404 when absent, 403 when the
/// filesystem refuses.
pub fn handle_delete(req: &Request, res: &mut Response) {
    match fs::remove_file(&req.resolved_path) {
        Ok(()) => {
            res.status = status::NO_CONTENT;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            res.status = status::NOT_FOUND;
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            res.status = status::FORBIDDEN;
        }
        Err(_) => {
            res.status = status::INTERNAL_SERVER_ERROR;
        }
    }
}
