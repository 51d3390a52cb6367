//! Server orchestration: listener, reactor loop, and dispatch.
//!
//! One thread runs the reactor loop and owns the connection table and the
//! idle-timer heap outright. Workers never see either; a finished worker
//! step talks back through the epoll interest list alone, re-arming the
//! one-shot registration with the mask it wants next. Tokens carry a
//! generation counter alongside the table slot so a stale readiness event
//! for a recycled slot identifies itself and is dropped.

use std::cell::RefCell;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::runtime::conn::{Connection, StepContext, StepOutcome};
use crate::runtime::pool::ThreadPool;
use crate::runtime::reactor::{EventSet, Events, Reactor};
use crate::runtime::timer::TimerHeap;

/// Readiness events fetched per reactor iteration.
const EVENT_BATCH: usize = 1024;

/// Token reserved for the listening socket.
const LISTENER_TOKEN: u64 = u64::MAX;

/// Sent to a connection accepted over the client ceiling, then closed.
const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-length: 12\r\n\r\nServer busy!";

struct TableEntry {
    generation: u32,
    conn: Arc<Connection>,
}

/// Slot indices stay below 2^32 (the table is bounded by the client
/// ceiling), so a token packs exactly.
fn pack_token(generation: u32, slot: usize) -> u64 {
    ((generation as u64) << 32) | slot as u64
}

fn unpack_token(token: u64) -> (u32, usize) {
    ((token >> 32) as u32, (token & u32::MAX as u64) as usize)
}

/// Map the trigger-mode switch to (listener, connection) edge flags.
fn trig_flags(mode: u8) -> (bool, bool) {
    match mode {
        0 => (false, false),
        1 => (false, true),
        2 => (true, false),
        _ => (true, true),
    }
}

/// Stops a running server from another thread, for tests that need the
/// reactor loop to come back.
#[cfg(test)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    port: u16,
}

#[cfg(test)]
impl ShutdownHandle {
    /// Clear the running flag, then poke the listener with a throwaway
    /// connection so a blocked wait wakes up and observes it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        TcpStream::connect(("127.0.0.1", self.port)).ok();
    }
}

/// Server instance. Not `Send`: the connection table is reactor-thread
/// property and the type enforces it.
pub struct Server {
    listener: TcpListener,
    reactor: Arc<Reactor>,
    pool: ThreadPool,
    table: Rc<RefCell<Slab<TableEntry>>>,
    timer: TimerHeap,
    live: Arc<AtomicUsize>,
    ctx: Arc<StepContext>,
    running: Arc<AtomicBool>,
    timeout: Duration,
    max_clients: usize,
    listener_edge: bool,
    conn_edge: bool,
    conn_base: EventSet,
    next_generation: u32,
}

impl Server {
    /// Bind the listener, start the worker pool, and register the listener
    /// with the reactor. `run` does the rest.
    pub fn bind(config: &Config, credentials: Arc<dyn CredentialStore>) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = create_listener(addr, config.linger, config.backlog)?;
        let reactor = Arc::new(Reactor::new()?);
        let pool = ThreadPool::new(config.workers)?;

        let (listener_edge, conn_edge) = trig_flags(config.trig_mode);
        let listen_mask = EventSet::IN
            | EventSet::RDHUP
            | if listener_edge { EventSet::EDGE } else { EventSet::empty() };
        let conn_base = EventSet::ONESHOT
            | EventSet::RDHUP
            | if conn_edge { EventSet::EDGE } else { EventSet::empty() };
        reactor.add_interest(listener.as_raw_fd(), LISTENER_TOKEN, listen_mask)?;

        info!(
            port = listener.local_addr()?.port(),
            workers = config.workers,
            trig_mode = config.trig_mode,
            timeout_ms = config.timeout_ms,
            doc_root = %config.root.display(),
            "Server listening"
        );

        Ok(Self {
            listener,
            reactor,
            pool,
            table: Rc::new(RefCell::new(Slab::new())),
            timer: TimerHeap::new(),
            live: Arc::new(AtomicUsize::new(0)),
            ctx: Arc::new(StepContext {
                doc_root: config.root.clone(),
                credentials,
            }),
            running: Arc::new(AtomicBool::new(true)),
            timeout: Duration::from_millis(config.timeout_ms),
            max_clients: config.max_clients,
            listener_edge,
            conn_edge,
            conn_base,
            next_generation: 0,
        })
    }

    /// Address actually bound, for tests that bind port 0.
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stop handle for testing.
    #[cfg(test)]
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            running: Arc::clone(&self.running),
            port: self.listener.local_addr()?.port(),
        })
    }

    /// The reactor loop: sleep until the earliest idle deadline or the next
    /// readiness batch, expire idle connections, dispatch the rest.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_BATCH);
        while self.running.load(Ordering::Acquire) {
            let timeout = if self.timeout.is_zero() {
                None
            } else {
                self.timer.next_deadline()
            };
            self.reactor.wait(&mut events, timeout)?;
            if events.is_empty() {
                continue;
            }
            trace!(count = events.len(), "Readiness batch");
            for event in events.iter() {
                if event.token == LISTENER_TOKEN {
                    self.accept_clients();
                } else {
                    self.dispatch(event.token, event.events);
                }
            }
        }
        info!("Server stopped");
        Ok(())
    }

    /// Accept until would-block under edge-trigger, once per event under
    /// level-trigger. Connections over the ceiling get the busy response.
    fn accept_clients(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            };
            if self.live.load(Ordering::Acquire) >= self.max_clients {
                refuse_busy(stream, peer);
                return;
            }
            self.admit(stream, peer);
            if !self.listener_edge {
                return;
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "Failed to set client nonblocking");
            return;
        }
        let conn = Arc::new(Connection::new(stream.into(), peer));
        let raw = conn.fd();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let slot = self.table.borrow_mut().insert(TableEntry {
            generation,
            conn: Arc::clone(&conn),
        });
        let token = pack_token(generation, slot);

        if let Err(e) = self.reactor.add_interest(raw, token, EventSet::IN | self.conn_base) {
            warn!(fd = raw, peer = %peer, error = %e, "Failed to register client");
            self.table.borrow_mut().try_remove(slot);
            return;
        }

        if !self.timeout.is_zero() {
            let table = Rc::clone(&self.table);
            let reactor = Arc::clone(&self.reactor);
            let live = Arc::clone(&self.live);
            self.timer.add(slot, self.timeout, move || {
                evict_idle(&table, &reactor, &live, slot, generation);
            });
        }

        let live_now = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(fd = raw, peer = %peer, live = live_now, "Client admitted");
    }

    /// Route one readiness event. The timer resets on any activity; hang-up
    /// conditions close on the spot; input and output hand off to workers.
    fn dispatch(&mut self, token: u64, ready: EventSet) {
        let (generation, slot) = unpack_token(token);
        let conn = {
            let table = self.table.borrow();
            match table.get(slot) {
                Some(entry) if entry.generation == generation => Arc::clone(&entry.conn),
                _ => {
                    trace!(slot, generation, "Stale readiness event ignored");
                    return;
                }
            }
        };

        if conn.is_closed() {
            // A worker finished with this connection and re-armed input as
            // its wake signal; only the bookkeeping is left.
            self.finalize(slot, generation);
            return;
        }

        if !self.timeout.is_zero() {
            self.timer.adjust(slot, self.timeout);
        }

        if ready.intersects(EventSet::RDHUP | EventSet::HUP | EventSet::ERR) {
            debug!(fd = conn.fd(), peer = %conn.peer(), "Peer hung up");
            conn.begin_close();
            self.finalize(slot, generation);
        } else if ready.contains(EventSet::IN) {
            self.submit_read(conn, token);
        } else if ready.contains(EventSet::OUT) {
            self.submit_write(conn, token);
        } else {
            warn!(fd = conn.fd(), mask = ready.bits(), "Unexpected readiness mask");
        }
    }

    fn finalize(&mut self, slot: usize, generation: u32) {
        self.timer.remove(slot);
        release_conn(&self.table, &self.reactor, &self.live, slot, generation);
    }

    fn submit_read(&self, conn: Arc<Connection>, token: u64) {
        let ctx = Arc::clone(&self.ctx);
        let reactor = Arc::clone(&self.reactor);
        let edge = self.conn_edge;
        let base = self.conn_base;
        self.pool
            .submit(move || run_read_step(&conn, &ctx, &reactor, token, edge, base));
    }

    fn submit_write(&self, conn: Arc<Connection>, token: u64) {
        let ctx = Arc::clone(&self.ctx);
        let reactor = Arc::clone(&self.reactor);
        let edge = self.conn_edge;
        let base = self.conn_base;
        self.pool
            .submit(move || run_write_step(&conn, &ctx, &reactor, token, edge, base));
    }
}

/// Worker step for input readiness: drain the socket, run the protocol
/// step, re-arm with whatever it asks for next.
fn run_read_step(
    conn: &Connection,
    ctx: &StepContext,
    reactor: &Reactor,
    token: u64,
    edge: bool,
    base: EventSet,
) {
    if conn.is_closed() {
        return;
    }
    let outcome = match conn.fill_read_buffer(edge) {
        Ok(0) => StepOutcome::Close,
        Ok(_) => conn.process(ctx),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => conn.process(ctx),
        Err(e) => {
            debug!(fd = conn.fd(), error = %e, "Read failed");
            StepOutcome::Close
        }
    };
    settle(conn, reactor, token, base, outcome);
}

/// Worker step for output readiness.
fn run_write_step(
    conn: &Connection,
    ctx: &StepContext,
    reactor: &Reactor,
    token: u64,
    edge: bool,
    base: EventSet,
) {
    if conn.is_closed() {
        return;
    }
    let outcome = conn.handle_write(ctx, edge);
    settle(conn, reactor, token, base, outcome);
}

fn settle(conn: &Connection, reactor: &Reactor, token: u64, base: EventSet, outcome: StepOutcome) {
    let mask = match outcome {
        StepOutcome::AwaitInput => EventSet::IN | base,
        StepOutcome::AwaitOutput => EventSet::OUT | base,
        StepOutcome::Close => {
            signal_close(conn, reactor, token, base);
            return;
        }
    };
    if let Err(e) = reactor.modify_interest(conn.fd(), token, mask) {
        // Already deregistered, or the descriptor went away under us; the
        // idle timer sweeps up whatever is left.
        debug!(fd = conn.fd(), error = %e, "Re-arm failed");
    }
}

/// Worker-side close: mark it, shut the socket down so the peer sees the
/// close now, and leave input armed so the reactor wakes once more and
/// drops its bookkeeping on its own thread.
fn signal_close(conn: &Connection, reactor: &Reactor, token: u64, base: EventSet) {
    if conn.begin_close() {
        conn.shutdown();
        debug!(
            fd = conn.fd(),
            peer = %conn.peer(),
            unsent = conn.pending_write_bytes(),
            "Connection closing"
        );
    }
    if let Err(e) = reactor.modify_interest(conn.fd(), token, EventSet::IN | base) {
        trace!(fd = conn.fd(), error = %e, "Close wake re-arm skipped");
    }
}

/// Idle deadline passed without a readiness event: close and release.
/// Fires on the reactor thread, inside the timer tick.
fn evict_idle(
    table: &RefCell<Slab<TableEntry>>,
    reactor: &Reactor,
    live: &AtomicUsize,
    slot: usize,
    generation: u32,
) {
    if let Some(conn) = release_conn(table, reactor, live, slot, generation) {
        if conn.begin_close() {
            conn.shutdown();
        }
        debug!(fd = conn.fd(), peer = %conn.peer(), "Idle connection evicted");
    }
}

/// Drop the reactor's bookkeeping for a slot: table entry, epoll interest,
/// live count. Generation-guarded, so a second call for the same token is
/// a no-op and a recycled slot is never touched by mistake.
fn release_conn(
    table: &RefCell<Slab<TableEntry>>,
    reactor: &Reactor,
    live: &AtomicUsize,
    slot: usize,
    generation: u32,
) -> Option<Arc<Connection>> {
    let conn = {
        let mut table = table.borrow_mut();
        match table.get(slot) {
            Some(entry) if entry.generation == generation => {
                table.try_remove(slot).map(|entry| entry.conn)
            }
            _ => None,
        }
    }?;
    if let Err(e) = reactor.remove_interest(conn.fd()) {
        debug!(fd = conn.fd(), error = %e, "Deregistration failed");
    }
    let remaining = live.fetch_sub(1, Ordering::AcqRel) - 1;
    debug!(fd = conn.fd(), live = remaining, "Connection released");
    Some(conn)
}

fn refuse_busy(mut stream: TcpStream, peer: SocketAddr) {
    warn!(peer = %peer, "Client ceiling reached, refusing connection");
    stream.write_all(BUSY_RESPONSE).ok();
}

/// Create the listening socket: SO_REUSEADDR, optional lingering close,
/// nonblocking, with the configured accept backlog.
fn create_listener(addr: SocketAddr, linger: bool, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
