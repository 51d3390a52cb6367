//! Thin wrapper over Linux epoll.
//!
//! The reactor owns the epoll descriptor and exposes interest registration
//! plus the blocking wait call, nothing more; classification of delivered
//! events is the caller's business. Registrations carry an opaque `u64`
//! token that comes back with each event.
//!
//! Accepted connections are registered with `EventSet::ONESHOT`: after one
//! event is delivered the descriptor goes silent until explicitly re-armed
//! with `modify_interest`. That silence is the engine's per-connection
//! mutual exclusion.

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Readiness bits, a newtype over the raw epoll mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const IN: EventSet = EventSet(libc::EPOLLIN as u32);
    pub const OUT: EventSet = EventSet(libc::EPOLLOUT as u32);
    pub const RDHUP: EventSet = EventSet(libc::EPOLLRDHUP as u32);
    pub const HUP: EventSet = EventSet(libc::EPOLLHUP as u32);
    pub const ERR: EventSet = EventSet(libc::EPOLLERR as u32);
    pub const ONESHOT: EventSet = EventSet(libc::EPOLLONESHOT as u32);
    pub const EDGE: EventSet = EventSet(libc::EPOLLET as u32);

    pub const fn empty() -> EventSet {
        EventSet(0)
    }

    /// All of `other`'s bits are set.
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one of `other`'s bits is set.
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

/// One delivered readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub events: EventSet,
}

/// Reusable batch storage for `Reactor::wait`.
pub struct Events {
    raw: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw.iter().map(|ev| Event {
            token: ev.u64,
            events: EventSet(ev.events),
        })
    }
}

/// Owns the epoll descriptor; closed on drop.
pub struct Reactor {
    epfd: OwnedFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Register `fd` with the given interest mask and token.
    pub fn add_interest(&self, fd: RawFd, token: u64, mask: EventSet) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some((token, mask)))
    }

    /// Replace `fd`'s interest mask and token. This is the one-shot re-arm.
    pub fn modify_interest(&self, fd: RawFd, token: u64, mask: EventSet) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some((token, mask)))
    }

    /// Drop `fd` from the interest set. A descriptor that is already gone
    /// (closed, or removed by an earlier call) is not an error.
    pub fn remove_interest(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, None) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            other => other,
        }
    }

    /// Block until readiness or timeout (`None` blocks indefinitely).
    /// Interruption by a signal yields an empty batch, not an error.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.raw.clear();
        let timeout_ms = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.raw.as_mut_ptr(),
                events.raw.capacity() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        unsafe { events.raw.set_len(n as usize) };
        Ok(n as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, data: Option<(u64, EventSet)>) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ev_ptr = match data {
            Some((token, mask)) => {
                ev.events = mask.bits();
                ev.u64 = token;
                &mut ev as *mut libc::epoll_event
            }
            None => std::ptr::null_mut(),
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ev_ptr) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
