use std::{
    io, mem,
    net::SocketAddr,
    os::fd::FromRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener};
use silo_codec::Dictionary;
use tracing::{Level, debug, info, span};

use crate::{
    config::Config,
    error::ServerError,
    sessions::SessionRegistry,
    worker::{Inbox, Worker},
};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Cooperative shutdown token: raised by a shutdown request, a signal, or a
/// fatal acceptor error, and observed by every readiness loop at its
/// suspension point. Loops finish their current event batch, then exit.
pub struct StopFlag {
    flag: AtomicBool,
    acceptor: Waker,
}

impl StopFlag {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.acceptor.wake();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Immutable context shared by the acceptor and every worker.
pub(crate) struct Shared {
    pub config: Config,
    pub dict: Dictionary,
    pub sessions: SessionRegistry,
    pub stop: Arc<StopFlag>,
}

/// Owns the listening socket and the worker pool.
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the configured address with `SO_REUSEADDR | SO_REUSEPORT` and
    /// the maximum backlog. `SIGPIPE` is suppressed process-wide here so a
    /// peer closing mid-write surfaces as an error, not a signal.
    pub fn bind(config: Config, dict: Dictionary) -> Result<Self, ServerError> {
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let poll = Poll::new().map_err(ServerError::Poll)?;
        let acceptor = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?;

        let addr = config.addr();
        let mut listener = bind_reuse(addr).map_err(|err| ServerError::Bind { addr, err })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        let shared = Arc::new(Shared {
            config,
            dict,
            sessions: SessionRegistry::new(),
            stop: Arc::new(StopFlag { flag: AtomicBool::new(false), acceptor }),
        });

        Ok(Self { listener, poll, shared })
    }

    /// The bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for wiring signals (or anything else) to server shutdown.
    pub fn stop_flag(&self) -> Arc<StopFlag> {
        Arc::clone(&self.shared.stop)
    }

    /// Spawns the worker pool and accepts connections round-robin until the
    /// stop flag is raised. Returns only after every worker has been joined;
    /// dropping `self` then closes the listening socket.
    pub fn run(mut self) -> Result<(), ServerError> {
        let n_workers = num_cpus::get().saturating_sub(1).max(1);
        let mut inboxes = Vec::with_capacity(n_workers);
        let mut threads = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let (worker, inbox) =
                Worker::new(Arc::clone(&self.shared)).map_err(ServerError::Poll)?;
            inboxes.push(inbox);
            let thread = thread::Builder::new()
                .name(format!("silo-worker-{i}"))
                .spawn(move || {
                    let _span = span!(Level::INFO, "worker", id = i).entered();
                    worker.run();
                })
                .map_err(ServerError::Spawn)?;
            threads.push(thread);
        }

        info!(addr = %self.shared.config.addr(), workers = n_workers, "serving");

        let result = self.accept_loop(&inboxes, n_workers);

        // cancel the workers: raise the flag, nudge each loop, reap
        self.shared.stop.trigger();
        for inbox in &inboxes {
            inbox.wake();
        }
        for thread in threads {
            let _ = thread.join();
        }
        info!("server stopped");
        result
    }

    fn accept_loop(&mut self, inboxes: &[Arc<Inbox>], n_workers: usize) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(64);
        let mut next_worker = 0;
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Accept(err));
            }

            for event in events.iter() {
                if event.token() != LISTENER_TOKEN {
                    continue;
                }
                loop {
                    match self.listener.accept() {
                        Ok((sock, peer)) => {
                            debug!(?peer, worker = next_worker, "client connected");
                            inboxes[next_worker].push(sock);
                            next_worker = (next_worker + 1) % n_workers;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => return Err(ServerError::Accept(err)),
                    }
                }
            }

            if self.shared.stop.is_set() {
                return Ok(());
            }
        }
    }
}

/// Raw socket/setsockopt/bind/listen sequence: the reuse options have to be
/// in place before bind, and mio's own `bind` only covers `SO_REUSEADDR`.
fn bind_reuse(addr: SocketAddr) -> io::Result<TcpListener> {
    let SocketAddr::V4(v4) = addr else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "ipv4 addresses only"));
    };
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
            || libc::listen(fd, libc::SOMAXCONN) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}
