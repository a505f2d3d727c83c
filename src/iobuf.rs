//! Growable byte buffer with a queue of attached file descriptors.
//!
//! An [`IoBuf`] accumulates outbound message bytes (or collects inbound ones)
//! and carries up to [`FD_CAPACITY`] file descriptors alongside them, so a
//! whole message plus its descriptors can cross a unix socket in one
//! `sendmsg`/`recvmsg`. Descriptors are consumed in FIFO order with
//! [`IoBuf::take_fd`]; whatever is still queued when the buffer is dropped is
//! closed.
//!
//! Fixed-width values are appended in native byte order. That is a
//! memory-transfer convenience for same-host peers, not a portable wire
//! format.

use std::{
    collections::VecDeque,
    mem,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
};

use rustix::io::{retry_on_intr, Errno};

use crate::util;

/// Maximum number of descriptors that may be queued in one buffer.
pub const FD_CAPACITY: usize = 31;

// Transfer unit for the drain loops; a read shorter than this means the
// descriptor had no more data ready.
const CHUNK: usize = 1024;

#[derive(Debug)]
pub struct IoBuf {
    data: Vec<u8>,
    initial_capacity: usize,
    fds: VecDeque<OwnedFd>,
}

impl IoBuf {
    /// Creates an empty buffer with the given initial byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            initial_capacity: capacity,
            fds: VecDeque::new(),
        }
    }

    /// The count of data bytes in this buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The data bytes. Binary data; any strings stored in the buffer are only
    /// terminated if the caller put a terminator there.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The count of queued descriptors.
    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    /// Appends `bytes`, growing the storage if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn append_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn append_f32(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    /// Prepends `bytes`, shifting the current contents right.
    ///
    /// Costs O(len); not meant for building messages front-to-back.
    pub fn prepend(&mut self, bytes: &[u8]) {
        self.data.splice(0..0, bytes.iter().copied());
    }

    /// Drops the first `nbytes` from the buffer.
    pub fn pop(&mut self, nbytes: usize) {
        assert!(nbytes <= self.data.len());
        self.data.drain(..nbytes);
    }

    /// Removes and returns the data bytes. The buffer is left in the same
    /// state as a freshly created one with its original capacity.
    pub fn take_data(&mut self) -> Vec<u8> {
        mem::replace(&mut self.data, Vec::with_capacity(self.initial_capacity))
    }

    /// Returns the oldest queued descriptor, which now belongs to the caller,
    /// or `None` once the queue is empty.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Duplicates `fd` and queues the duplicate.
    ///
    /// Fails with `ENOMEM` when all [`FD_CAPACITY`] slots are occupied; the
    /// buffer is unchanged and no duplicate is made in that case.
    pub fn append_fd(&mut self, fd: BorrowedFd) -> rustix::io::Result<()> {
        if self.fds.len() >= FD_CAPACITY {
            return Err(Errno::NOMEM);
        }
        self.fds.push_back(rustix::io::dup(fd)?);
        Ok(())
    }

    /// Appends all currently available data from `fd`, which should be
    /// non-blocking or this call will block.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end-of-stream with
    /// nothing read at all. A would-block before anything was read surfaces
    /// as `Err(Errno::WOULDBLOCK)`.
    pub fn append_from_fd(&mut self, fd: BorrowedFd) -> rustix::io::Result<usize> {
        let mut chunk = [0u8; CHUNK];
        let mut nread = 0;
        loop {
            match retry_on_intr(|| rustix::io::read(fd, &mut chunk)) {
                Ok(0) => return Ok(nread),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    nread += count;
                    if count < CHUNK {
                        return Ok(nread);
                    }
                }
                #[allow(unreachable_patterns)] // `WOULDBLOCK` and `AGAIN` typically equal
                Err(Errno::WOULDBLOCK | Errno::AGAIN) if nread > 0 => return Ok(nread),
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`IoBuf::append_from_fd`], for a socket: descriptors passed with
    /// the message land in this buffer's queue and can be retrieved in order
    /// with [`IoBuf::take_fd`].
    ///
    /// Descriptors beyond [`FD_CAPACITY`] are closed.
    pub fn recv_from_fd(&mut self, fd: BorrowedFd) -> rustix::io::Result<usize> {
        let mut chunk = [0u8; CHUNK];
        let mut nread = 0;
        loop {
            match util::recv_with_fds(fd, &mut chunk, &mut self.fds) {
                Ok(0) => break,
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    nread += count;
                    if self.fds.len() > FD_CAPACITY {
                        log::warn!(
                            "dropping {} descriptors beyond queue capacity",
                            self.fds.len() - FD_CAPACITY
                        );
                        self.fds.truncate(FD_CAPACITY);
                    }
                    if count < CHUNK {
                        break;
                    }
                }
                #[allow(unreachable_patterns)]
                Err(Errno::WOULDBLOCK | Errno::AGAIN) if nread > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(nread)
    }

    /// Transmits the buffer's bytes plus every queued descriptor as one
    /// socket message. Returns the number of bytes sent.
    ///
    /// The descriptor queue is left untouched; the kernel duplicates the
    /// descriptors into the message, the sender keeps its own.
    pub fn send(&self, fd: BorrowedFd) -> rustix::io::Result<usize> {
        let fds: Vec<BorrowedFd> = self.fds.iter().map(AsFd::as_fd).collect();
        util::send_with_fds(fd, &self.data, &fds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::MemfdFlags;
    use std::os::unix::net::UnixStream;

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn memfd_with(content: &[u8]) -> OwnedFd {
        let fd = rustix::fs::memfd_create("eibridge-test", MemfdFlags::CLOEXEC).unwrap();
        let written = rustix::io::write(&fd, content).unwrap();
        assert_eq!(written, content.len());
        fd
    }

    fn read_all(fd: BorrowedFd) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let n = rustix::io::pread(fd, &mut buf, 0).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn new_buffer_is_empty() {
        let buf = IoBuf::new(10);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.num_fds(), 0);
    }

    #[test]
    fn append_and_prepend() {
        let mut buf = IoBuf::new(10);

        buf.append(b"foo");
        assert_eq!(buf.data(), b"foo");

        buf.prepend(b"bar");
        assert_eq!(buf.data(), b"barfoo");

        // Force growth past the initial capacity; contents survive.
        buf.append(b"data forcing resize");
        buf.prepend(b"second resize");
        assert_eq!(buf.data(), b"second resizebarfoodata forcing resize");
        assert_eq!(buf.len(), 38);
    }

    #[test]
    fn prepend_into_empty_buffer() {
        let mut buf = IoBuf::new(10);
        buf.prepend(b"foo");
        assert_eq!(buf.data(), b"foo");
    }

    #[test]
    fn append_values() {
        let mut buf = IoBuf::new(10);

        buf.append_u32(u32::MAX);
        assert_eq!(buf.data(), &[0xff, 0xff, 0xff, 0xff]);

        buf.take_data();
        buf.append_u64(0xabab_abab_abab_abab);
        assert_eq!(buf.data(), &[0xab; 8]);

        buf.take_data();
        buf.append_f32(1.5);
        assert_eq!(buf.data(), 1.5f32.to_ne_bytes());
    }

    #[test]
    fn pop_drops_prefix() {
        let mut buf = IoBuf::new(10);
        buf.append(b"foobar");
        buf.pop(3);
        assert_eq!(buf.data(), b"bar");
        buf.pop(3);
        assert!(buf.is_empty());
    }

    #[test]
    fn take_data_resets() {
        let mut buf = IoBuf::new(16);
        buf.append(b"payload");
        let data = buf.take_data();
        assert_eq!(data, b"payload");
        assert_eq!(buf.len(), 0);
        buf.append(b"next");
        assert_eq!(buf.data(), b"next");
    }

    #[test]
    fn take_fd_is_fifo() {
        let mut buf = IoBuf::new(10);
        let fds: Vec<OwnedFd> = (0..3u8).map(|i| memfd_with(&[i])).collect();
        for fd in &fds {
            buf.append_fd(fd.as_fd()).unwrap();
        }

        for i in 0..3u8 {
            let taken = buf.take_fd().unwrap();
            assert_eq!(read_all(taken.as_fd()), vec![i]);
        }

        // Exhausted queue keeps answering None, it is not an error.
        assert!(buf.take_fd().is_none());
        assert!(buf.take_fd().is_none());
    }

    #[test]
    fn append_fd_exhaustion() {
        let fd = memfd_with(b"x");
        let mut buf = IoBuf::new(20);
        buf.append(b"bytes");

        for _ in 0..FD_CAPACITY {
            buf.append_fd(fd.as_fd()).unwrap();
        }
        assert_eq!(buf.append_fd(fd.as_fd()), Err(Errno::NOMEM));

        // The failed append left the buffer untouched.
        assert_eq!(buf.num_fds(), FD_CAPACITY);
        assert_eq!(buf.data(), b"bytes");
    }

    #[test]
    fn append_from_fd_drains_available() {
        let (wr, rd) = nonblocking_pair();
        let mut buf = IoBuf::new(10);

        let written = rustix::io::write(&wr, b"foob").unwrap();
        assert_eq!(written, 4);
        assert_eq!(buf.append_from_fd(rd.as_fd()), Ok(4));
        assert_eq!(buf.data(), b"foob");

        // Nothing waiting.
        assert_eq!(buf.append_from_fd(rd.as_fd()), Err(Errno::WOULDBLOCK));

        // Exactly one transfer unit.
        let large = [0xaa_u8; 2048];
        assert_eq!(rustix::io::write(&wr, &large[..1024]), Ok(1024));
        assert_eq!(buf.append_from_fd(rd.as_fd()), Ok(1024));

        // One byte more than the transfer unit.
        assert_eq!(rustix::io::write(&wr, &large[..1025]), Ok(1025));
        assert_eq!(buf.append_from_fd(rd.as_fd()), Ok(1025));

        // Peer hangup with nothing buffered reads as end-of-stream.
        drop(wr);
        assert_eq!(buf.append_from_fd(rd.as_fd()), Ok(0));
    }

    #[test]
    fn send_and_recv_with_fds() {
        let (left, right) = nonblocking_pair();

        let payload = b"some data\n";
        let memfds: Vec<OwnedFd> = (0..4u8)
            .map(|i| memfd_with(format!("foo {i}\n").as_bytes()))
            .collect();

        let mut sender = IoBuf::new(20);
        sender.append(payload);
        for fd in &memfds {
            sender.append_fd(fd.as_fd()).unwrap();
        }
        assert_eq!(sender.send(left.as_fd()), Ok(payload.len()));
        // Sending does not consume the sender's own descriptors.
        assert_eq!(sender.num_fds(), 4);

        let mut receiver = IoBuf::new(64);
        assert_eq!(receiver.recv_from_fd(right.as_fd()), Ok(payload.len()));
        assert_eq!(receiver.data(), payload);

        // Each received descriptor is an independently usable handle.
        for i in 0..4u8 {
            let fd = receiver.take_fd().unwrap();
            assert_eq!(read_all(fd.as_fd()), format!("foo {i}\n").into_bytes());
        }
        assert!(receiver.take_fd().is_none());
    }
}
