//! Per-connection state and the worker-side I/O steps.
//!
//! A `Connection` owns its descriptor, its two buffers and the protocol
//! state for the request in flight. The one-shot dispatch protocol
//! guarantees at most one worker touches a connection between readiness
//! events; the internal mutex documents that exclusivity and is never
//! contended.
//!
//! Closing is split in two: `begin_close` is the exactly-once marker any
//! thread may invoke, while table and timer cleanup stay with the reactor
//! thread. The descriptor itself closes when the last `Arc<Connection>`
//! drops, so a worker still inside a syscall can never race a descriptor
//! reuse.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::auth::CredentialStore;
use crate::http::{ParseOutcome, Request, Response};
use crate::runtime::buffer::Buffer;

/// Keep flushing under level-trigger while more than this many bytes are
/// still pending; below it, let the next output-ready event drive.
const WRITE_BURST_LIMIT: usize = 10240;

/// What the connection wants from the reactor after a worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Await more request bytes: arm for input.
    AwaitInput,
    /// Response bytes are pending: arm for output.
    AwaitOutput,
    /// Done with this connection (error, peer gone, or no keep-alive).
    Close,
}

/// Collaborators the protocol step receives explicitly.
pub struct StepContext {
    pub doc_root: PathBuf,
    pub credentials: Arc<dyn CredentialStore>,
}

/// One accepted client socket.
pub struct Connection {
    fd: OwnedFd,
    peer: SocketAddr,
    closed: AtomicBool,
    io: Mutex<ConnIo>,
}

struct ConnIo {
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Option<Response>,
    /// Mapped payload bytes already accepted by the kernel.
    payload_sent: usize,
    /// Connection-level keep-alive decision for the response in flight.
    keep_alive: bool,
}

impl Connection {
    pub fn new(fd: OwnedFd, peer: SocketAddr) -> Self {
        Self {
            fd,
            peer,
            closed: AtomicBool::new(false),
            io: Mutex::new(ConnIo {
                read_buf: Buffer::new(),
                write_buf: Buffer::new(),
                request: Request::new(),
                response: None,
                payload_sent: 0,
                keep_alive: false,
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection closed. The first caller wins and gets `true`;
    /// everyone after that is a no-op.
    pub fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Shut both directions down so the peer sees the close immediately,
    /// without releasing the descriptor number yet.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
    }

    /// Drain the socket into the read buffer: one read under level-trigger,
    /// until would-block under edge-trigger.
    ///
    /// `Ok(0)` means the peer closed with nothing new buffered. A would-block
    /// with nothing read comes back as the error itself so the caller can
    /// tell a quiet socket from a dead one.
    pub fn fill_read_buffer(&self, edge_triggered: bool) -> io::Result<usize> {
        let mut io = self.io_state()?;
        let mut total = 0usize;
        loop {
            match io.read_buf.read_from(self.fd.as_raw_fd()) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Run the protocol step over whatever is buffered.
    pub fn process(&self, ctx: &StepContext) -> StepOutcome {
        match self.io.lock() {
            Ok(mut io) => io.step(ctx, self.fd.as_raw_fd()),
            Err(_) => StepOutcome::Close,
        }
    }

    /// Flush pending response bytes. Loops until done under edge-trigger
    /// (and under level-trigger while a large burst remains), stopping at
    /// would-block. Completion hands off to the keep-alive decision.
    pub fn handle_write(&self, ctx: &StepContext, edge_triggered: bool) -> StepOutcome {
        let mut io = match self.io.lock() {
            Ok(io) => io,
            Err(_) => return StepOutcome::Close,
        };
        loop {
            match io.flush(self.fd.as_raw_fd()) {
                Ok(n) => {
                    if io.to_write_bytes() == 0 {
                        return io.finish_response(ctx, self.fd.as_raw_fd());
                    }
                    if n == 0 {
                        return StepOutcome::Close;
                    }
                    if !(edge_triggered || io.to_write_bytes() > WRITE_BURST_LIMIT) {
                        return StepOutcome::AwaitOutput;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return StepOutcome::AwaitOutput;
                }
                Err(e) => {
                    debug!(fd = self.fd.as_raw_fd(), error = %e, "Write failed");
                    return StepOutcome::Close;
                }
            }
        }
    }

    /// Bytes still owed to the peer.
    pub fn pending_write_bytes(&self) -> usize {
        self.io
            .lock()
            .map(|io| io.to_write_bytes())
            .unwrap_or(0)
    }

    fn io_state(&self) -> io::Result<MutexGuard<'_, ConnIo>> {
        self.io
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection state poisoned"))
    }
}

impl ConnIo {
    fn step(&mut self, ctx: &StepContext, fd: RawFd) -> StepOutcome {
        match self.request.parse(&mut self.read_buf) {
            ParseOutcome::Incomplete => StepOutcome::AwaitInput,
            ParseOutcome::Invalid => {
                debug!(fd, "Malformed request line, responding 400");
                // The connection closes after the 400; whatever else the
                // peer sent is garbage now.
                self.read_buf.retrieve_all();
                self.begin_response(ctx, String::new(), false, Some(400));
                StepOutcome::AwaitOutput
            }
            ParseOutcome::Complete => {
                self.request.resolve_route(ctx.credentials.as_ref());
                let keep_alive = self.request.is_keep_alive();
                let path = self.request.path().to_string();
                trace!(fd, method = self.request.method(), path = %path, "Request parsed");
                self.begin_response(ctx, path, keep_alive, None);
                StepOutcome::AwaitOutput
            }
        }
    }

    fn begin_response(&mut self, ctx: &StepContext, path: String, keep_alive: bool, status: Option<u16>) {
        let mut response = Response::new(&ctx.doc_root, &path, keep_alive, status);
        response.compose(&mut self.write_buf);
        debug!(code = response.code(), path = %path, "Response composed");
        self.response = Some(response);
        self.payload_sent = 0;
        self.keep_alive = keep_alive;
        self.request.reset();
    }

    /// One vectored write of [header bytes, mapped payload at offset], or a
    /// plain write when no file backs the response.
    fn flush(&mut self, fd: RawFd) -> io::Result<usize> {
        let payload = match &self.response {
            Some(response) => response.payload(),
            None => &[],
        };
        if payload.is_empty() {
            return self.write_buf.write_to(fd);
        }
        let head_len = self.write_buf.readable_bytes();
        let rest = &payload[self.payload_sent..];
        let iov = [
            libc::iovec {
                iov_base: self.write_buf.peek().as_ptr() as *mut libc::c_void,
                iov_len: head_len,
            },
            libc::iovec {
                iov_base: rest.as_ptr() as *mut libc::c_void,
                iov_len: rest.len(),
            },
        ];
        let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        let head_share = n.min(head_len);
        self.write_buf.retrieve(head_share);
        self.payload_sent += n - head_share;
        Ok(n)
    }

    fn to_write_bytes(&self) -> usize {
        let payload_len = self
            .response
            .as_ref()
            .map(|response| response.payload().len())
            .unwrap_or(0);
        self.write_buf.readable_bytes() + payload_len - self.payload_sent
    }

    /// The response is fully on the wire: unmap it, then either close or
    /// run the step again for bytes a pipelining client already sent.
    fn finish_response(&mut self, ctx: &StepContext, fd: RawFd) -> StepOutcome {
        self.response = None;
        self.payload_sent = 0;
        if !self.keep_alive {
            return StepOutcome::Close;
        }
        trace!(fd, "Response complete, connection kept alive");
        self.step(ctx, fd)
    }
}
