//! Asynchronous CGI/1.1 execution: fork/exec, non-blocking output drainage,
//! wall-clock deadline, and mapping of process outcomes onto HTTP responses.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, execve, fork, pipe, write, ForkResult, Pid};

use crate::request::Request;
use crate::response::{status, Response};
use crate::signals::CgiRegistry;

/// End-to-end wall-clock budget from fork to output EOF.
pub const CGI_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 4096;

/// One forked CGI child: its pid, its stdout pipe, its deadline, and the
/// client it belongs to. Owned by exactly one connection.
#[derive(Debug)]
pub struct CgiHandle {
    pub pid: Pid,
    out_fd: RawFd,
    pub started: Instant,
    pub deadline: Instant,
    pub client_fd: RawFd,
    pub output: Vec<u8>,
}

impl CgiHandle {
    pub fn out_fd(&self) -> RawFd {
        self.out_fd
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

impl Drop for CgiHandle {
    fn drop(&mut self) {
        if self.out_fd >= 0 {
            close(self.out_fd).ok();
            self.out_fd = -1;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Drain {
    /// The pipe would block; more output may come later.
    Again,
    /// The child closed its stdout; the response can be assembled.
    Eof,
    /// The pipe failed.
    Failed,
}

/// Fork the script and hand its stdout to the event loop. The request body
/// is written to the child's stdin up front; the pipe buffer absorbs bodies
/// bounded by the configured limit.
pub fn start_async(
    req: &Request,
    client_fd: RawFd,
    registry: &mut CgiRegistry,
) -> nix::Result<CgiHandle> {
    let script = &req.resolved_path;
    let (stdin_read, stdin_write) = pipe()?;
    let (stdout_read, stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            return Err(e);
        }
    };

    let script_c = cstring_from_path(script);
    let env_c = build_env(req);
    let envp: Vec<&std::ffi::CStr> = env_c.iter().map(CString::as_c_str).collect();
    let argv = [script_c.as_c_str()];

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Only exec or die from here; this address space is borrowed.
            let setup = dup2(stdin_read, libc::STDIN_FILENO)
                .and_then(|_| dup2(stdout_write, libc::STDOUT_FILENO));
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            if setup.is_err() {
                unsafe { libc::_exit(127) };
            }
            if let Some(dir) = script.parent() {
                if chdir(dir).is_err() {
                    unsafe { libc::_exit(127) };
                }
            }
            execve(&script_c, &argv, &envp).ok();
            unsafe { libc::_exit(127) };
        }
        Ok(ForkResult::Parent { child }) => {
            close(stdin_read).ok();
            close(stdout_write).ok();

            // The loop only ever reads this end, so it must not block.
            fcntl(stdout_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).ok();

            if !req.body.is_empty() {
                write_all(stdin_write, &req.body);
            }
            close(stdin_write).ok();

            let started = Instant::now();
            registry.register(child, started);
            Ok(CgiHandle {
                pid: child,
                out_fd: stdout_read,
                started,
                deadline: started + CGI_TIMEOUT,
                client_fd,
                output: Vec::new(),
            })
        }
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            Err(e)
        }
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(0) => break,
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            // EPIPE when the child exits without reading; nothing to do.
            Err(_) => break,
        }
    }
}

fn cstring_from_path(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap_or_default()
}

fn env_entry(key: &str, value: &str) -> CString {
    CString::new(format!("{}={}", key, value)).unwrap_or_default()
}

/// CGI/1.1 environment for the child, request headers mirrored as `HTTP_*`.
fn build_env(req: &Request) -> Vec<CString> {
    let mut env = Vec::new();
    env.push(env_entry("REQUEST_METHOD", req.method.as_str()));
    env.push(env_entry("QUERY_STRING", &req.query));

    if let Some(content_type) = req.header("content-type") {
        env.push(env_entry("CONTENT_TYPE", content_type));
    }
    if let Some(content_length) = req.header("content-length") {
        env.push(env_entry("CONTENT_LENGTH", content_length));
    }

    let resolved = req.resolved_path.to_string_lossy();
    let script_name = script_basename(&resolved);
    env.push(env_entry("SCRIPT_FILENAME", &resolved));
    env.push(env_entry("SCRIPT_NAME", script_name));
    env.push(env_entry("PATH_INFO", path_info(&req.path, script_name)));
    env.push(env_entry("PATH_TRANSLATED", &resolved));

    env.push(env_entry("SERVER_PROTOCOL", "HTTP/1.1"));
    env.push(env_entry("GATEWAY_INTERFACE", "CGI/1.1"));
    env.push(env_entry(
        "SERVER_SOFTWARE",
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
    ));
    env.push(env_entry("REDIRECT_STATUS", "200"));

    let host = &req.meta.host;
    if host.is_empty() {
        env.push(env_entry("SERVER_NAME", "localhost"));
        env.push(env_entry("SERVER_PORT", "80"));
    } else {
        match host.split_once(':') {
            Some((name, port)) => {
                env.push(env_entry("SERVER_NAME", name));
                env.push(env_entry("SERVER_PORT", port));
            }
            None => {
                env.push(env_entry("SERVER_NAME", host));
                env.push(env_entry("SERVER_PORT", "80"));
            }
        }
    }

    for (name, value) in &req.headers {
        let key: String = name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        env.push(env_entry(&format!("HTTP_{}", key), value));
    }
    env
}

fn script_basename(resolved: &str) -> &str {
    resolved.rsplit('/').next().unwrap_or(resolved)
}

/// URI remainder after the script's basename first occurs. Ambiguous when
/// the basename repeats as a path segment, like the source it mirrors.
fn path_info<'a>(uri: &'a str, script_name: &str) -> &'a str {
    if script_name.is_empty() {
        return "";
    }
    match uri.find(script_name) {
        Some(pos) => &uri[pos + script_name.len()..],
        None => "",
    }
}

/// Pull whatever the child has written; stop on would-block, EOF, or error.
pub fn drain(handle: &mut CgiHandle) -> Drain {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match nix::unistd::read(handle.out_fd, &mut buf) {
            Ok(0) => return Drain::Eof,
            Ok(n) => handle.output.extend_from_slice(&buf[..n]),
            Err(Errno::EAGAIN) => return Drain::Again,
            Err(Errno::EINTR) => continue,
            Err(_) => return Drain::Failed,
        }
    }
}

/// Reap the child without blocking. A child that closed its stdout but
/// keeps running has nothing left to say; it is killed rather than leaked.
pub fn reap(pid: Pid) {
    if let Ok(WaitStatus::StillAlive) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        kill_and_reap(pid);
    }
}

/// SIGKILL and reap; used by the deadline sweep and shutdown, where the
/// child is guaranteed to die promptly.
pub fn kill_and_reap(pid: Pid) {
    kill(pid, Signal::SIGKILL).ok();
    waitpid(pid, None).ok();
}

/// Build the HTTP response from the child's collected output.
///
/// The output splits at the first blank line; without one the script is
/// broken and the client gets 502. A `Status:` pseudo-header overrides the
/// response status.
pub fn assemble_response(output: &[u8], res: &mut Response) {
    let separator = match find(b"\r\n\r\n", output) {
        Some(separator) => separator,
        None => {
            res.status = status::BAD_GATEWAY;
            return;
        }
    };
    let head = &output[..separator];
    let body = &output[separator + 4..];

    for line in String::from_utf8_lossy(head).split("\r\n") {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => continue,
        };
        if name.eq_ignore_ascii_case("status") {
            let code: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(code) = code.parse::<u16>() {
                res.status = code;
            }
            continue;
        }
        res.append_header(name, value);
    }

    res.body = body.to_vec();
    res.set_header("Content-Length", &body.len().to_string());
}

fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}
