//! Listener sockets and the single-threaded poll event loop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, InetAddr, SockAddr, SockFlag, SockType};
use nix::unistd::close;

use crate::cgi;
use crate::config::Config;
use crate::conn::{Advance, ConnState, Connection};
use crate::log::Logger;
use crate::response::status;
use crate::signals::{self, CgiRegistry};

/// Sweep promptly while a CGI is running, otherwise take it easy.
const POLL_TIMEOUT_CGI_MS: libc::c_int = 100;
const POLL_TIMEOUT_IDLE_MS: libc::c_int = 1000;

/// One bound, non-blocking accept socket per configured virtual server.
#[derive(Debug)]
pub struct Listener {
    fd: RawFd,
    pub server: usize,
}

impl Listener {
    fn bind(host: &str, port: u16, server: usize) -> Result<Self> {
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("invalid listen address `{}'", host))?;
        let addr = SocketAddr::new(ip, port);

        let fd = socket::socket(
            socket::AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            socket::SockProtocol::Tcp,
        )
        .context("failed to create listening socket")?;

        let listener = Self { fd, server };
        socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")?;
        socket::bind(fd, &SockAddr::Inet(InetAddr::from_std(&addr)))
            .with_context(|| format!("failed to bind {}", addr))?;
        socket::listen(fd, libc::SOMAXCONN as usize)
            .with_context(|| format!("failed to listen on {}", addr))?;
        fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("failed to make listener non-blocking")?;
        Ok(listener)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.fd >= 0 {
            close(self.fd).ok();
            self.fd = -1;
        }
    }
}

enum FdKind {
    Listener(usize),
    Client(RawFd),
    CgiPipe(RawFd),
}

pub struct HttpServer {
    config: Config,
    logger: Logger,
    listeners: Vec<Listener>,
    clients: HashMap<RawFd, Connection>,
    /// CGI stdout pipe fd to owning client fd.
    cgi_pipes: HashMap<RawFd, RawFd>,
    registry: CgiRegistry,
}

impl HttpServer {
    pub fn bind(config: Config, mut logger: Logger) -> Result<Self> {
        let mut listeners = Vec::new();
        for (index, server) in config.servers.iter().enumerate() {
            let listener = Listener::bind(&server.host, server.port, index)?;
            logger.info(&format!("listening on http://{}:{}/", server.host, server.port));
            listeners.push(listener);
        }
        Ok(Self {
            config,
            logger,
            listeners,
            clients: HashMap::new(),
            cgi_pipes: HashMap::new(),
            registry: CgiRegistry::new(),
        })
    }

    /// Drive the loop until a shutdown signal arrives.
    pub fn run(&mut self) -> Result<()> {
        while signals::is_running() {
            self.tick()?;
        }
        self.shutdown();
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        let mut kinds: Vec<FdKind> = Vec::new();
        let mut pollfds: Vec<PollFd> = Vec::new();

        for (index, listener) in self.listeners.iter().enumerate() {
            kinds.push(FdKind::Listener(index));
            pollfds.push(PollFd::new(listener.fd(), PollFlags::POLLIN));
        }
        for (&fd, conn) in &self.clients {
            let interest = match conn.state {
                ConnState::Receiving => PollFlags::POLLIN,
                ConnState::Sending => PollFlags::POLLOUT,
                // The response arrives via the CGI pipe.
                ConnState::WaitingCgi => continue,
                ConnState::Closed => continue,
            };
            kinds.push(FdKind::Client(fd));
            pollfds.push(PollFd::new(fd, interest));
        }
        for &pipe_fd in self.cgi_pipes.keys() {
            kinds.push(FdKind::CgiPipe(pipe_fd));
            pollfds.push(PollFd::new(pipe_fd, PollFlags::POLLIN));
        }

        let timeout = if self.registry.is_empty() {
            POLL_TIMEOUT_IDLE_MS
        } else {
            POLL_TIMEOUT_CGI_MS
        };

        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            // Interrupted by a signal; the sweep and the shutdown check
            // below still run.
            Err(Errno::EINTR) => {}
            Err(e) => bail!("poll failed: {}", e),
        }

        self.sweep_cgi_deadlines();

        if !signals::is_running() {
            return Ok(());
        }

        // Reverse order: removals triggered by an entry never disturb the
        // entries still to be visited.
        for index in (0..pollfds.len()).rev() {
            let revents = pollfds[index].revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                continue;
            }
            match kinds[index] {
                FdKind::Listener(listener) => {
                    if revents.intersects(PollFlags::POLLIN) {
                        self.accept_all(listener);
                    }
                }
                FdKind::CgiPipe(pipe_fd) => self.handle_cgi_event(pipe_fd, revents),
                FdKind::Client(fd) => self.handle_client_event(fd, revents),
            }
        }
        Ok(())
    }

    /// Drain the kernel's accept queue for one listener.
    fn accept_all(&mut self, listener: usize) {
        let (listener_fd, server) = {
            let listener = &self.listeners[listener];
            (listener.fd(), listener.server)
        };
        loop {
            let fd = match socket::accept(listener_fd) {
                Ok(fd) => fd,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    // Out of descriptors: stop accepting for now, keep serving.
                    if e.as_errno() == Some(Errno::EMFILE) || e.as_errno() == Some(Errno::ENFILE) {
                        self.logger.error(&format!("accept failed: {}", e));
                        break;
                    }
                    self.logger.warning(&format!("accept failed: {}", e));
                    continue;
                }
            };

            let peer = match socket::getpeername(fd) {
                Ok(SockAddr::Inet(addr)) => addr.to_std().ip(),
                _ => crate::conn::placeholder_addr(),
            };

            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            if stream.set_nonblocking(true).is_err() {
                self.logger.warning("failed to make client socket non-blocking");
                continue; // stream drop closes the fd
            }

            self.logger
                .debug(&format!("accepted {} on fd {}", peer, stream.as_raw_fd()));
            self.clients
                .insert(stream.as_raw_fd(), Connection::new(stream, peer, server));
        }
    }

    fn handle_client_event(&mut self, fd: RawFd, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            self.drop_client(fd);
            return;
        }

        let conn = match self.clients.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        let server = &self.config.servers[conn.server];

        let advance = if revents.intersects(PollFlags::POLLIN) {
            conn.recv_step(server, &mut self.registry, &mut self.logger)
        } else if revents.intersects(PollFlags::POLLOUT) {
            conn.send_step(server, &mut self.registry, &mut self.logger)
        } else {
            Advance::Idle
        };

        if let Advance::CgiStarted(pipe_fd) = advance {
            self.cgi_pipes.insert(pipe_fd, fd);
        }
        if self.clients.get(&fd).map(|conn| conn.state) == Some(ConnState::Closed) {
            self.drop_client(fd);
        }
    }

    fn handle_cgi_event(&mut self, pipe_fd: RawFd, revents: PollFlags) {
        let client_fd = match self.cgi_pipes.get(&pipe_fd) {
            Some(&client_fd) => client_fd,
            None => return,
        };

        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            self.fail_cgi(client_fd, pipe_fd);
            return;
        }

        let conn = match self.clients.get_mut(&client_fd) {
            Some(conn) => conn,
            None => {
                // Owner vanished; nothing is waiting for this pipe anymore.
                self.cgi_pipes.remove(&pipe_fd);
                return;
            }
        };
        let handle = match conn.cgi.as_mut() {
            Some(handle) => handle,
            None => {
                self.cgi_pipes.remove(&pipe_fd);
                return;
            }
        };

        match cgi::drain(handle) {
            cgi::Drain::Again => {}
            cgi::Drain::Eof => {
                if let Some(handle) = conn.cgi.take() {
                    self.cgi_pipes.remove(&pipe_fd);
                    self.registry.unregister(handle.pid);
                    cgi::reap(handle.pid);

                    cgi::assemble_response(&handle.output, &mut conn.response);
                    let server = &self.config.servers[conn.server];
                    conn.queue_response(server);
                    self.logger.debug(&format!(
                        "CGI pid {} finished for fd {} after {:?}",
                        handle.pid,
                        handle.client_fd,
                        handle.started.elapsed()
                    ));
                }
            }
            cgi::Drain::Failed => self.fail_cgi(client_fd, pipe_fd),
        }
    }

    /// A broken CGI pipe turns into a 502 for its client.
    fn fail_cgi(&mut self, client_fd: RawFd, pipe_fd: RawFd) {
        self.cgi_pipes.remove(&pipe_fd);
        let conn = match self.clients.get_mut(&client_fd) {
            Some(conn) => conn,
            None => return,
        };
        if let Some(handle) = conn.cgi.take() {
            self.registry.unregister(handle.pid);
            cgi::kill_and_reap(handle.pid);
            self.logger
                .warning(&format!("CGI pid {} pipe failed (502)", handle.pid));
        }
        conn.response.status = status::BAD_GATEWAY;
        let server = &self.config.servers[conn.server];
        conn.queue_response(server);
    }

    /// Kill every CGI past its wall-clock deadline and answer 504.
    fn sweep_cgi_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .clients
            .iter()
            .filter(|(_, conn)| conn.cgi.as_ref().map_or(false, |h| h.expired(now)))
            .map(|(&fd, _)| fd)
            .collect();

        for client_fd in expired {
            let conn = match self.clients.get_mut(&client_fd) {
                Some(conn) => conn,
                None => continue,
            };
            if let Some(handle) = conn.cgi.take() {
                self.cgi_pipes.remove(&handle.out_fd());
                self.registry.unregister(handle.pid);
                cgi::kill_and_reap(handle.pid);
                self.logger.warning(&format!(
                    "CGI pid {} exceeded {}s, killed (504)",
                    handle.pid,
                    cgi::CGI_TIMEOUT.as_secs()
                ));
            }
            conn.response.status = status::GATEWAY_TIMEOUT;
            // The stream to a killed CGI is not worth keeping.
            conn.request.meta.connection_close = true;
            let server = &self.config.servers[conn.server];
            conn.queue_response(server);
        }
    }

    fn drop_client(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.clients.remove(&fd) {
            if let Some(handle) = conn.cgi.take() {
                self.cgi_pipes.remove(&handle.out_fd());
                self.registry.unregister(handle.pid);
                cgi::kill_and_reap(handle.pid);
            }
            self.logger.debug(&format!("closed fd {}", fd));
            // conn drop closes the socket.
        }
    }

    /// Stop accepting, tell every client 503, and reap what's left.
    fn shutdown(&mut self) {
        self.logger.info("graceful shutdown");
        self.listeners.clear();

        for (fd, mut conn) in std::mem::take(&mut self.clients) {
            if let Some(handle) = conn.cgi.take() {
                self.registry.unregister(handle.pid);
                cgi::kill_and_reap(handle.pid);
            }
            conn.send_unavailable();
            socket::shutdown(fd, socket::Shutdown::Both).ok();
        }
        self.cgi_pipes.clear();

        for pid in self.registry.pids() {
            cgi::kill_and_reap(pid);
            self.registry.unregister(pid);
        }
    }
}
