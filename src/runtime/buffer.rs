//! Growable byte buffer with independent read and write cursors.
//!
//! The buffer owns one contiguous region logically split into three spans:
//! prependable (bytes already consumed), readable (`[read_idx, write_idx)`),
//! and writable (`[write_idx, capacity)`). Consuming advances the read cursor
//! instead of shifting data; the dead prefix is reclaimed by compaction the
//! next time space is needed, so steady-state request traffic never
//! reallocates.
//!
//! ## Descriptor I/O
//!
//! `read_from` drains a socket with one scatter read into the writable tail
//! plus a stack scratch block, so a single syscall is paid whether or not the
//! buffer currently has room. `write_to` pushes the readable span with one
//! plain write and reflects short writes back to the caller; neither call
//! retries internally.

use std::io;
use std::os::unix::io::RawFd;

/// Second leg of the scatter read. Sized so a full socket receive buffer
/// lands in one syscall even when the primary region is nearly full.
const SCRATCH_LEN: usize = 65536;

/// Initial capacity of a fresh buffer.
const INITIAL_SIZE: usize = 1024;

/// Byte buffer with prependable / readable / writable spans.
///
/// Invariant: `0 <= read_idx <= write_idx <= store.len()` after every
/// operation.
#[derive(Debug)]
pub struct Buffer {
    /// Backing store. Its length is the buffer capacity; bytes beyond
    /// `write_idx` are scratch space, always initialized.
    store: Vec<u8>,
    /// Start of the readable span.
    read_idx: usize,
    /// Start of the writable span.
    write_idx: usize,
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with a specific initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: vec![0u8; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Number of bytes that can be written without growing or compacting.
    pub fn writable_bytes(&self) -> usize {
        self.store.len() - self.write_idx
    }

    /// Number of already-consumed bytes in front of the readable span.
    pub fn prependable_bytes(&self) -> usize {
        self.read_idx
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.store[self.read_idx..self.write_idx]
    }

    /// Consume `n` readable bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable byte count.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "retrieve past readable span");
        self.read_idx += n;
    }

    /// Consume everything and zero the store so stale data cannot leak into
    /// a later request on a reused connection.
    pub fn retrieve_all(&mut self) {
        self.store.fill(0);
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Consume everything, returning the readable span as a string
    /// (lossy for non-UTF-8 bytes).
    #[allow(dead_code)]
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Copy `data` in after the readable span, growing or compacting first
    /// if the writable span is too small.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.store[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Reclaim space for a pending write of `len` bytes. Compacts the
    /// readable span to offset 0 when the dead prefix is large enough,
    /// otherwise grows the store to exactly fit. The store never shrinks.
    fn make_space(&mut self, len: usize) {
        if self.prependable_bytes() + self.writable_bytes() < len {
            self.store.resize(self.write_idx + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.store.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        }
    }

    /// Read from `fd` with a single vectored read into the writable tail and
    /// a stack scratch block. Bytes that overflowed into the scratch block
    /// are appended afterwards, growing the buffer as needed.
    ///
    /// Returns the byte count from the kernel; `Ok(0)` means end of stream
    /// and is the caller's to classify.
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.store[self.write_idx..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.store.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable span to `fd` once, advancing the read cursor by
    /// however many bytes the kernel accepted. A short write is reflected in
    /// the return value, not retried.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.store[self.read_idx..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_idx += n as usize;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_fd(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(n as usize, data.len());
    }

    fn assert_invariant(buf: &Buffer) {
        assert!(buf.read_idx <= buf.write_idx);
        assert!(buf.write_idx <= buf.store.len());
    }

    #[test]
    fn test_cursor_invariant_through_mixed_ops() {
        let mut buf = Buffer::with_capacity(16);
        assert_invariant(&buf);

        buf.append(b"hello world");
        assert_invariant(&buf);
        assert_eq!(buf.readable_bytes(), 11);

        buf.retrieve(6);
        assert_invariant(&buf);
        assert_eq!(buf.prependable_bytes(), 6);
        assert_eq!(buf.peek(), b"world");

        // Forces compaction: 5 readable + 5 writable + 6 prependable.
        buf.append(&[b'x'; 10]);
        assert_invariant(&buf);
        assert_eq!(buf.readable_bytes(), 15);

        // Forces growth.
        buf.append(&[b'y'; 100]);
        assert_invariant(&buf);
        assert_eq!(buf.readable_bytes(), 115);
    }

    #[test]
    fn test_round_trip_through_string() {
        let mut buf = Buffer::new();
        buf.append(b"one two three");

        let s = buf.retrieve_all_to_string();
        assert_eq!(s, "one two three");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0);

        buf.append(s.as_bytes());
        assert_eq!(buf.peek(), b"one two three");
    }

    #[test]
    fn test_compaction_preserves_readable_span() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[b'a'; 24]);
        buf.retrieve(20);
        assert_eq!(buf.peek(), &[b'a'; 4]);

        // 8 writable, 20 prependable: this append must compact, not grow.
        let before = buf.store.len();
        buf.append(&[b'b'; 20]);
        assert_eq!(buf.store.len(), before);
        assert_eq!(buf.read_idx, 0);

        let mut expected = vec![b'a'; 4];
        expected.extend_from_slice(&[b'b'; 20]);
        assert_eq!(buf.peek(), &expected[..]);
    }

    #[test]
    fn test_growth_is_exact() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(&[b'z'; 50]);
        assert_eq!(buf.store.len(), 50);
        assert_eq!(buf.readable_bytes(), 50);
    }

    #[test]
    #[should_panic(expected = "retrieve past readable span")]
    fn test_retrieve_past_readable_panics() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn test_read_from_descriptor() {
        let (rfd, wfd) = pipe_pair();
        write_fd(wfd, b"ping over a pipe");

        let mut buf = Buffer::new();
        let n = buf.read_from(rfd).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf.peek(), b"ping over a pipe");

        close_fd(rfd);
        close_fd(wfd);
    }

    #[test]
    fn test_read_from_overflows_into_scratch() {
        let (rfd, wfd) = pipe_pair();
        let payload: Vec<u8> = (0..200u8).collect();
        write_fd(wfd, &payload);

        // 8 bytes of primary room; the rest must arrive via the scratch leg.
        let mut buf = Buffer::with_capacity(8);
        let n = buf.read_from(rfd).unwrap();
        assert_eq!(n, 200);
        assert_eq!(buf.peek(), &payload[..]);

        close_fd(rfd);
        close_fd(wfd);
    }

    #[test]
    fn test_write_to_descriptor_advances_cursor() {
        let (rfd, wfd) = pipe_pair();

        let mut buf = Buffer::new();
        buf.append(b"response bytes");
        let n = buf.write_to(wfd).unwrap();
        assert_eq!(n, 14);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 32];
        let got = unsafe { libc::read(rfd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(&out[..got as usize], b"response bytes");

        close_fd(rfd);
        close_fd(wfd);
    }
}
