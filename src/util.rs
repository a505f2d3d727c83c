//! Syscall wrappers shared by the buffer and reactor layers.
//!
//! Everything that can fail with `EINTR` is retried here so callers only see
//! real outcomes.

use rustix::{
    fs::FlockOperation,
    io::{retry_on_intr, IoSlice, IoSliceMut},
    net,
};
use std::{
    collections::VecDeque,
    fs, io, ops,
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsFd, BorrowedFd, OwnedFd},
    },
    path::{Path, PathBuf},
};

// Upper bound on descriptors accepted in one recvmsg.
pub(crate) const MAX_FDS: usize = 32;

/// Sends `buf` plus `fds` as one socket message (`SCM_RIGHTS`).
pub(crate) fn send_with_fds(
    socket: impl AsFd,
    buf: &[u8],
    fds: &[BorrowedFd],
) -> rustix::io::Result<usize> {
    if fds.is_empty() {
        return retry_on_intr(|| net::send(&socket, buf, net::SendFlags::NOSIGNAL));
    }
    let mut cmsg_space = vec![0; rustix::cmsg_space!(ScmRights(fds.len()))];
    let mut cmsg_buffer = net::SendAncillaryBuffer::new(&mut cmsg_space);
    cmsg_buffer.push(net::SendAncillaryMessage::ScmRights(fds));
    retry_on_intr(|| {
        net::sendmsg(
            &socket,
            &[IoSlice::new(buf)],
            &mut cmsg_buffer,
            net::SendFlags::NOSIGNAL,
        )
    })
}

/// Receives bytes into `buf`; any descriptors passed alongside are appended
/// to `fds` with CLOEXEC set.
pub(crate) fn recv_with_fds(
    socket: impl AsFd,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> rustix::io::Result<usize> {
    let mut cmsg_space = vec![0; rustix::cmsg_space!(ScmRights(MAX_FDS))];
    let mut cmsg_buffer = net::RecvAncillaryBuffer::new(&mut cmsg_space);
    let response = retry_on_intr(|| {
        net::recvmsg(
            &socket,
            &mut [IoSliceMut::new(buf)],
            &mut cmsg_buffer,
            net::RecvFlags::CMSG_CLOEXEC,
        )
    })?;
    if response.bytes != 0 {
        fds.extend(
            cmsg_buffer
                .drain()
                .filter_map(|msg| match msg {
                    net::RecvAncillaryMessage::ScmRights(fds) => Some(fds),
                    _ => None,
                })
                .flatten(),
        );
    }
    Ok(response.bytes)
}

/// Waits for `fd` to become readable, or until the timeout (milliseconds,
/// `-1` for no timeout) expires. Returns whether the descriptor is ready.
pub(crate) fn poll_readable(fd: impl AsFd, timeout: i32) -> io::Result<bool> {
    let mut fds = [rustix::event::PollFd::new(&fd, rustix::event::PollFlags::IN)];
    let n = retry_on_intr(|| rustix::event::poll(&mut fds, timeout))?;
    Ok(n > 0)
}

#[derive(Debug)]
pub(crate) struct UnlinkOnDrop<T> {
    inner: T,
    path: PathBuf,
}

impl<T> UnlinkOnDrop<T> {
    pub fn new(inner: T, path: PathBuf) -> Self {
        Self { inner, path }
    }

    pub fn path(this: &Self) -> &Path {
        &this.path
    }
}

impl<T> Drop for UnlinkOnDrop<T> {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl<T> ops::Deref for UnlinkOnDrop<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> ops::DerefMut for UnlinkOnDrop<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

// Same locking scheme libeis uses next to its sockets.
#[derive(Debug)]
pub(crate) struct LockFile(#[allow(dead_code)] UnlinkOnDrop<fs::File>);

impl LockFile {
    /// Returns `Ok(None)` when the lock is held by someone else.
    pub fn new(path: PathBuf) -> io::Result<Option<Self>> {
        let inner = fs::File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .mode(0o660)
            .open(&path)?;
        let inner = UnlinkOnDrop::new(inner, path);
        let locked =
            rustix::fs::flock(&inner.inner, FlockOperation::NonBlockingLockExclusive).is_ok();
        Ok(Some(inner).filter(|_| locked).map(Self))
    }
}
