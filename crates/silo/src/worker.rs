use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use mio::{Events, Interest, Poll, Token, Waker, event::Event, net::TcpStream};
use silo_proto::{Drive, RequestFrame, RequestKind, ResponseKind};
use tracing::{debug, error, info};

use crate::{
    conn::{ConnPool, Connection, Stage},
    handlers::{self, HandlerCtx},
    server::Shared,
};

/// Token reserved for the worker's waker; connection slots count up from 0.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_INIT: usize = 1024;

/// Hand-off point from the acceptor into one worker.
pub(crate) struct Inbox {
    queue: Mutex<Vec<TcpStream>>,
    waker: Waker,
    n_connections: AtomicUsize,
}

impl Inbox {
    /// Queues an accepted socket and nudges the worker out of its poll.
    pub fn push(&self, sock: TcpStream) {
        self.queue.lock().unwrap().push(sock);
        self.wake();
    }

    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            error!(?err, "worker wake");
        }
    }

    pub fn connections(&self) -> usize {
        self.n_connections.load(Ordering::Relaxed)
    }
}

/// What to do with a connection after its frame was driven.
enum Next {
    Keep,
    Terminate,
    Dispatch,
    Finish,
}

/// One reactor: a readiness loop over the connections this worker owns.
pub(crate) struct Worker {
    poll: Poll,
    events_capacity: usize,
    pool: ConnPool,
    inbox: Arc<Inbox>,
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(shared: Arc<Shared>) -> io::Result<(Self, Arc<Inbox>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(Vec::new()),
            waker,
            n_connections: AtomicUsize::new(0),
        });
        let worker = Self {
            poll,
            events_capacity: EVENTS_INIT,
            pool: ConnPool::new(),
            inbox: Arc::clone(&inbox),
            shared,
        };
        Ok((worker, inbox))
    }

    /// Readiness loop. Exits when the stop flag is raised (finishing the
    /// current event batch first) or on a reactor-level failure; either way
    /// the pool is dropped, closing every connection.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.events_capacity);
        'reactor: loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "worker poll failed");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue; // inbox drained below
                }
                if let Err(err) = self.handle_event(event.token().0, event) {
                    // losing the readiness set is not survivable
                    error!(?err, "reactor re-registration failed");
                    break 'reactor;
                }
            }

            self.adopt_new();

            if self.shared.stop.is_set() {
                break;
            }

            // grow the events buffer before the pool outpaces it
            if self.inbox.connections() >= self.events_capacity {
                self.events_capacity *= 2;
                events = Events::with_capacity(self.events_capacity);
            }
        }
        info!(connections = self.pool.len(), "worker exited");
    }

    fn handle_event(&mut self, index: usize, event: &Event) -> io::Result<()> {
        let next = {
            let Some(conn) = self.pool.get_mut(index) else { return Ok(()) };
            let Connection { sock, stage } = conn;
            match stage {
                Stage::Reading(frame) if event.is_readable() => match frame.drive(sock) {
                    Drive::Progress => Next::Keep,
                    Drive::Complete => Next::Dispatch,
                    Drive::Disconnected => Next::Terminate,
                },
                Stage::Writing(frame, _) if event.is_writable() => match frame.drive(sock) {
                    Drive::Progress => Next::Keep,
                    Drive::Complete => Next::Finish,
                    Drive::Disconnected => Next::Terminate,
                },
                _ => Next::Keep,
            }
        };
        match next {
            Next::Keep => Ok(()),
            Next::Terminate => {
                self.terminate(index);
                Ok(())
            }
            Next::Dispatch => self.dispatch(index),
            Next::Finish => self.finish_response(index),
        }
    }

    /// A complete request: route it to a handler and flip the connection to
    /// writing. Shutdown never gets a response; it stops the server and the
    /// requesting connection is dropped.
    fn dispatch(&mut self, index: usize) -> io::Result<()> {
        let Some(conn) = self.pool.get_mut(index) else { return Ok(()) };
        let stage = std::mem::replace(&mut conn.stage, Stage::Reading(RequestFrame::new()));
        let Stage::Reading(frame) = stage else { return Ok(()) };

        let header = frame.header();
        if header.kind == Some(RequestKind::Shutdown) {
            info!("shutdown requested");
            self.shared.stop.trigger();
            self.terminate(index);
            return Ok(());
        }

        let ctx = HandlerCtx {
            dir: &self.shared.config.dir,
            dict: &self.shared.dict,
            sessions: &self.shared.sessions,
        };
        let (response, session) = handlers::dispatch(&ctx, header, frame.payload());
        conn.stage = Stage::Writing(response, session);
        self.poll.registry().reregister(&mut conn.sock, Token(index), Interest::WRITABLE)
    }

    /// Variant-aware completion: errors close the connection, retrievals
    /// refill until their session drains, everything else recycles the
    /// connection for its next request.
    fn finish_response(&mut self, index: usize) -> io::Result<()> {
        let Some(conn) = self.pool.get_mut(index) else { return Ok(()) };
        let Connection { sock, stage } = conn;
        let Stage::Writing(frame, session) = stage else { return Ok(()) };

        match frame.kind() {
            ResponseKind::Error => {
                self.terminate(index);
                Ok(())
            }
            ResponseKind::RetFile => {
                let Some(handle) = session else {
                    self.terminate(index);
                    return Ok(());
                };
                if handle.drained() {
                    return self.recycle(index);
                }
                match handlers::fill_chunk(&self.shared.dict, handle, frame.compressed()) {
                    Ok(buf) => {
                        frame.refill(buf);
                        // re-arm: the edge only fires again after a fresh
                        // registration or a full socket buffer
                        self.poll.registry().reregister(sock, Token(index), Interest::WRITABLE)
                    }
                    Err(err) => {
                        debug!(?err, "chunk refill failed");
                        self.terminate(index);
                        Ok(())
                    }
                }
            }
            _ => self.recycle(index),
        }
    }

    /// Back to reading: fresh request frame, read interest re-armed.
    fn recycle(&mut self, index: usize) -> io::Result<()> {
        let Some(conn) = self.pool.get_mut(index) else { return Ok(()) };
        conn.stage = Stage::Reading(RequestFrame::new());
        self.poll.registry().reregister(&mut conn.sock, Token(index), Interest::READABLE)
    }

    /// Closes the connection and recycles its slot; the socket and any
    /// session claim are released on drop.
    fn terminate(&mut self, index: usize) {
        if let Some(mut conn) = self.pool.remove(index) {
            if let Err(err) = self.poll.registry().deregister(&mut conn.sock) {
                debug!(?err, "deregister");
            }
            self.inbox.n_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Registers every socket the acceptor queued since the last pass.
    fn adopt_new(&mut self) {
        let pending = std::mem::take(&mut *self.inbox.queue.lock().unwrap());
        for sock in pending {
            let index = self.pool.insert(sock);
            let conn = self.pool.get_mut(index).expect("slot just filled");
            if let Err(err) =
                self.poll.registry().register(&mut conn.sock, Token(index), Interest::READABLE)
            {
                debug!(?err, "register new connection");
                self.pool.remove(index);
                continue;
            }
            self.inbox.n_connections.fetch_add(1, Ordering::Relaxed);
        }
    }
}
