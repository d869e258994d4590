//! Route resolution: one verdict per parsed request.

use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

use crate::config::{LocationConfig, ServerConfig};
use crate::request::{Method, Request, Verdict};
use crate::response::{status, Response};

/// Decide the route verdict, the resolved filesystem path, and (for refused
/// requests) the response status.
pub fn resolve(req: &mut Request, res: &mut Response, server: &ServerConfig) {
    // Parser-level refusals are terminal.
    if req.parse_status != status::OK {
        req.verdict = Verdict::Error;
        res.status = req.parse_status;
        return;
    }

    let location = server.match_location(&req.path);

    if has_parent_traversal(&req.path) {
        req.verdict = Verdict::Error;
        res.status = status::FORBIDDEN;
        return;
    }

    req.resolved_path = resolve_path(&req.path, location, server);

    if let Some((code, target)) = &location.redirect {
        req.meta.redirect = true;
        res.status = *code;
        res.set_header("Location", target);
        req.verdict = Verdict::Redirect;
        return;
    }

    if check_cgi(req, res, location) {
        req.verdict = Verdict::Cgi;
        return;
    }
    if res.status != status::OK {
        req.verdict = Verdict::Error;
        return;
    }

    if check_upload(req, res, location, server) {
        req.verdict = Verdict::Upload;
        return;
    }
    if res.status != status::OK {
        req.verdict = Verdict::Error;
        return;
    }

    if check_autoindex(req, location, server) {
        req.verdict = Verdict::AutoIndex;
        return;
    }

    if let Some(file) = find_static_file(req, location, server) {
        match req.method {
            Method::Get => {
                req.resolved_path = file;
                req.verdict = Verdict::StaticPage;
            }
            Method::Delete => {
                req.resolved_path = file;
                req.verdict = Verdict::Delete;
            }
            _ => {
                req.verdict = Verdict::Error;
                res.status = status::METHOD_NOT_ALLOWED;
            }
        }
        return;
    }
    if res.status != status::OK {
        req.verdict = Verdict::Error;
        return;
    }

    if req.method == Method::Delete {
        // Let the delete handler report what it finds.
        req.verdict = Verdict::Delete;
        return;
    }

    req.verdict = Verdict::Error;
    res.status = status::NOT_FOUND;
}

/// Parent-directory escapes anywhere in the target are refused outright.
fn has_parent_traversal(path: &str) -> bool {
    path.contains("/../") || path.starts_with("../") || path.ends_with("/..") || path == ".."
}

/// Pick the root (CGI base, location root, then server root), strip the
/// location prefix when the location brought its own root, and append the
/// index file for directories.
fn resolve_path(uri: &str, location: &LocationConfig, server: &ServerConfig) -> PathBuf {
    let (root, strip_prefix) = if let Some(cgi_root) = &location.cgi_root {
        (cgi_root.as_path(), true)
    } else if let Some(root) = &location.root {
        (root.as_path(), true)
    } else {
        (server.root.as_path(), false)
    };

    let mut tail = uri;
    if strip_prefix {
        let prefix = location.path.trim_end_matches('/');
        if !prefix.is_empty() && tail.starts_with(prefix) {
            tail = &tail[prefix.len()..];
        }
    }
    let tail = tail.trim_start_matches('/');

    let mut resolved = if tail.is_empty() {
        root.to_path_buf()
    } else {
        root.join(tail)
    };

    if resolved.is_dir() {
        if let Some(index) = &location.index {
            resolved = resolved.join(index);
        }
    }
    resolved
}

/// CGI requires a configured extension, residence under the CGI base
/// directory, a regular file, and execute permission. A matching file that
/// is not executable is refused with 403.
fn check_cgi(req: &mut Request, res: &mut Response, location: &LocationConfig) -> bool {
    if location.cgi_interpreters.is_empty() {
        return false;
    }
    let ext = match file_extension(&req.resolved_path) {
        Some(ext) => ext,
        None => return false,
    };
    if !location.cgi_interpreters.contains_key(&ext) {
        return false;
    }
    let cgi_root = match &location.cgi_root {
        Some(cgi_root) => cgi_root,
        None => return false,
    };
    if !req.resolved_path.starts_with(cgi_root) {
        return false;
    }
    if !req.resolved_path.is_file() {
        return false;
    }
    if access(&req.resolved_path, AccessFlags::X_OK).is_err() {
        res.status = status::FORBIDDEN;
        return false;
    }
    true
}

/// Extension including the leading dot, matching the config map's keys.
fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
}

/// Uploads need POST or PUT, the location flag, and a writable directory.
fn check_upload(
    req: &mut Request,
    res: &mut Response,
    location: &LocationConfig,
    server: &ServerConfig,
) -> bool {
    if !matches!(req.method, Method::Post | Method::Put) {
        return false;
    }
    if !location.upload_enabled {
        return false;
    }
    let upload_dir = match &location.upload_dir {
        Some(dir) => dir,
        None => return false,
    };
    let base = upload_base(upload_dir, server);
    if !base.is_dir() {
        res.status = status::INTERNAL_SERVER_ERROR;
        return false;
    }
    if access(&base, AccessFlags::W_OK).is_err() {
        res.status = status::FORBIDDEN;
        return false;
    }
    true
}

/// Relative upload directories hang off the server root.
pub fn upload_base(upload_dir: &str, server: &ServerConfig) -> PathBuf {
    if upload_dir.starts_with('/') {
        PathBuf::from(upload_dir)
    } else {
        server.root.join(upload_dir)
    }
}

/// Autoindex applies to directories with the effective flag on and no
/// present index file.
fn check_autoindex(req: &Request, location: &LocationConfig, server: &ServerConfig) -> bool {
    let enabled = location.autoindex.unwrap_or(server.autoindex);
    if !enabled {
        return false;
    }
    if !req.resolved_path.is_dir() {
        return false;
    }
    if let Some(index) = location.index.as_ref().or(server.index.as_ref()) {
        if req.resolved_path.join(index).is_file() {
            return false;
        }
    }
    true
}

/// A regular readable file at the resolved path (or under it via the index
/// file). Readability failures surface as 403.
fn find_static_file(
    req: &mut Request,
    location: &LocationConfig,
    server: &ServerConfig,
) -> Option<PathBuf> {
    let mut path = req.resolved_path.clone();
    if path.is_dir() {
        let index = location.index.as_ref().or(server.index.as_ref())?;
        path = path.join(index);
    }
    if !path.is_file() {
        return None;
    }
    if access(&path, AccessFlags::R_OK).is_err() {
        return None;
    }
    Some(path)
}
