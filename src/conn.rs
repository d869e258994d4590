//! Per-client connection: socket ownership, buffers, the state machine, and
//! the dispatch from route verdict to handler.

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};

use crate::cgi::{self, CgiHandle};
use crate::config::ServerConfig;
use crate::handlers;
use crate::log::Logger;
use crate::request::{ParseState, Request, Verdict};
use crate::response::{self, status, Response};
use crate::router;
use crate::signals::CgiRegistry;

const RECV_CHUNK: usize = 4096;

/// Exactly one of these at any time; the event loop derives its poll
/// interest from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for (more of) a request. Doubles as the idle keep-alive state.
    Receiving,
    /// A CGI child is running; the response arrives via its pipe.
    WaitingCgi,
    /// Draining the outgoing buffer.
    Sending,
    /// Terminal; the loop removes the connection and the socket closes.
    Closed,
}

/// What a receive step did, so the loop can update its bookkeeping.
#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    Idle,
    /// A CGI child was spawned; its stdout pipe must join the poll set.
    CgiStarted(RawFd),
}

pub struct Connection {
    socket: TcpStream,
    pub peer: IpAddr,
    /// Index of the matched virtual server in the config.
    pub server: usize,
    pub state: ConnState,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    sent: usize,
    pub keep_alive: bool,
    pub request: Request,
    pub response: Response,
    pub cgi: Option<CgiHandle>,
    /// The queued bytes are an interim 100 Continue, not a final response.
    interim_100: bool,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: IpAddr, server: usize) -> Self {
        Self {
            socket,
            peer,
            server,
            state: ConnState::Receiving,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            sent: 0,
            keep_alive: true,
            request: Request::new(),
            response: Response::new(),
            cgi: None,
            interim_100: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Read once and run the parser over whatever has arrived.
    pub fn recv_step(
        &mut self,
        config: &ServerConfig,
        registry: &mut CgiRegistry,
        logger: &mut Logger,
    ) -> Advance {
        let mut buf = [0u8; RECV_CHUNK];
        let received = match socket::recv(self.fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                // Peer closed.
                self.state = ConnState::Closed;
                return Advance::Idle;
            }
            Ok(n) => n,
            Err(Errno::EAGAIN) => return Advance::Idle,
            Err(e) => {
                logger.error(&format!("recv failed on fd {}: {}", self.fd(), e));
                self.state = ConnState::Closed;
                return Advance::Idle;
            }
        };
        self.inbuf.extend_from_slice(&buf[..received]);
        self.advance(config, registry, logger)
    }

    /// Parse buffered input and, on a complete request, dispatch it.
    pub fn advance(
        &mut self,
        config: &ServerConfig,
        registry: &mut CgiRegistry,
        logger: &mut Logger,
    ) -> Advance {
        crate::request::parse(&mut self.inbuf, &mut self.request, config);

        if self.request.state == ParseState::Complete {
            return self.dispatch(config, registry, logger);
        }
        if self.request.meta.expect_continue {
            self.request.meta.expect_continue = false;
            self.outbuf = b"HTTP/1.1 100 Continue\r\n\r\n".to_vec();
            self.sent = 0;
            self.interim_100 = true;
            self.state = ConnState::Sending;
        }
        Advance::Idle
    }

    /// Route the request and run exactly one handler. CGI hands control back
    /// to the event loop; everything else queues a response right here.
    fn dispatch(
        &mut self,
        config: &ServerConfig,
        registry: &mut CgiRegistry,
        logger: &mut Logger,
    ) -> Advance {
        router::resolve(&mut self.request, &mut self.response, config);
        logger.debug(&format!(
            "{} {} {} -> {:?}",
            self.peer,
            self.request.method.as_str(),
            self.request.path,
            self.request.verdict,
        ));

        match self.request.verdict {
            Verdict::Cgi => match cgi::start_async(&self.request, self.fd(), registry) {
                Ok(handle) => {
                    let pipe = handle.out_fd();
                    self.cgi = Some(handle);
                    self.state = ConnState::WaitingCgi;
                    return Advance::CgiStarted(pipe);
                }
                Err(e) => {
                    logger.error(&format!("CGI spawn failed: {}", e));
                    self.response.status = status::INTERNAL_SERVER_ERROR;
                }
            },
            Verdict::StaticPage => handlers::serve_static(&self.request, &mut self.response),
            Verdict::AutoIndex => handlers::serve_autoindex(&self.request, &mut self.response),
            Verdict::Upload => {
                let location = config.match_location(&self.request.path);
                match &location.upload_dir {
                    Some(dir) => {
                        let base = router::upload_base(dir, config);
                        handlers::handle_upload(&self.request, &mut self.response, &base);
                    }
                    None => self.response.status = status::INTERNAL_SERVER_ERROR,
                }
            }
            Verdict::Delete => handlers::handle_delete(&self.request, &mut self.response),
            // Redirect and Error responses are completed by the serializer.
            Verdict::Redirect | Verdict::Error => {}
        }

        self.queue_response(config);
        Advance::Idle
    }

    /// Finalize, serialize, and arm the send side; then reset for the next
    /// keep-alive cycle.
    pub fn queue_response(&mut self, config: &ServerConfig) {
        response::finalize(&mut self.request, &mut self.response, config);
        self.keep_alive = !self.request.meta.connection_close;
        self.outbuf = response::serialize(&self.response);
        self.sent = 0;
        self.request.reset();
        self.response.reset();
        self.state = ConnState::Sending;
    }

    /// Send `outbuf[sent..]`; this is the only place the cursor advances.
    pub fn send_step(
        &mut self,
        config: &ServerConfig,
        registry: &mut CgiRegistry,
        logger: &mut Logger,
    ) -> Advance {
        let remaining = &self.outbuf[self.sent..];
        if remaining.is_empty() {
            self.state = ConnState::Receiving;
            return Advance::Idle;
        }
        match socket::send(self.fd(), remaining, MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL)) {
            Ok(0) => {
                // A zero-byte send on a non-blocking socket: the peer is gone.
                self.state = ConnState::Closed;
            }
            Ok(n) => {
                self.sent += n;
                if self.sent == self.outbuf.len() {
                    self.outbuf.clear();
                    self.sent = 0;
                    if self.interim_100 {
                        self.interim_100 = false;
                        self.state = ConnState::Receiving;
                        // The body may already be buffered; keep parsing.
                        return self.advance(config, registry, logger);
                    }
                    if self.keep_alive {
                        self.state = ConnState::Receiving;
                        // Pipelined bytes are served without another poll round.
                        if !self.inbuf.is_empty() {
                            return self.advance(config, registry, logger);
                        }
                    } else {
                        self.state = ConnState::Closed;
                    }
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(e) => {
                logger.debug(&format!("send failed on fd {}: {}", self.fd(), e));
                self.state = ConnState::Closed;
            }
        }
        Advance::Idle
    }

    /// Best-effort 503 used during graceful shutdown; ignores every failure.
    pub fn send_unavailable(&mut self) {
        let mut res = Response::new();
        res.status = status::SERVICE_UNAVAILABLE;
        res.set_header("Connection", "close");
        let page = format!(
            "<html><body><h1>{}</h1></body></html>\n",
            response::reason_phrase(status::SERVICE_UNAVAILABLE)
        );
        res.set_body(page.into_bytes(), "text/html");
        let wire = response::serialize(&res);
        socket::send(self.fd(), &wire, MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL)).ok();
    }
}

pub fn placeholder_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
