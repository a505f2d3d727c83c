//! EIS-style demo transport: a unix socket listener and per-client
//! connections speaking the 16-byte framing header.
//!
//! This is deliberately thin. It carries whole framed messages and their
//! descriptors over an [`IoBuf`] so the reactor has a realistic workload; it
//! implements no interface or device model.

use std::{
    cell::RefCell,
    env, fmt, fs, io,
    os::unix::{
        io::{AsFd, BorrowedFd, OwnedFd},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{util, IoBuf};

/// Message framing header. `length` counts the header itself.
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub object_id: u64,
    pub length: u32,
    pub opcode: u32,
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn parse(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            object_id: u64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
            length: u32::from_ne_bytes(bytes[8..12].try_into().unwrap()),
            opcode: u32::from_ne_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    fn write_to(&self, buf: &mut IoBuf) {
        buf.append_u64(self.object_id);
        buf.append_u32(self.length);
        buf.append_u32(self.opcode);
    }
}

/// Error parsing a framed message.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Message header declares a length shorter than the header itself.
    HeaderLength(u32),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::HeaderLength(len) => write!(f, "header length {len} < {}", Header::SIZE),
        }
    }
}

impl std::error::Error for ParseError {}

/// Error returned from [`Listener::bind_auto`]
#[derive(Debug)]
pub enum BindError {
    /// The environment variable `XDG_RUNTIME_DIR` is not set
    RuntimeDirNotSet,
    /// IO error
    Io(io::Error),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuntimeDirNotSet => write!(
                f,
                "environment variable XDG_RUNTIME_DIR is not set or invalid"
            ),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for BindError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RuntimeDirNotSet => None,
            Self::Io(err) => Some(err),
        }
    }
}

/// One framed message, header fields plus payload bytes.
///
/// Descriptors attached to a message stay in the connection's receive queue;
/// fetch them with [`Connection::take_fd`] in the order they were sent.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub object_id: u64,
    pub opcode: u32,
    pub payload: Vec<u8>,
}

/// Listener on a unix socket; the socket file is removed on drop.
#[derive(Debug)]
pub struct Listener {
    listener: util::UnlinkOnDrop<UnixListener>,
    _lock: Option<util::LockFile>,
}

impl Listener {
    /// Listens on a specific path.
    pub fn bind(path: &Path) -> io::Result<Self> {
        Self::bind_inner(PathBuf::from(path), None)
    }

    /// Listens on the first free `eis-<n>` socket in `XDG_RUNTIME_DIR`,
    /// claiming the matching lock file.
    pub fn bind_auto() -> Result<Self, BindError> {
        let xdg_dir = if let Some(var) = env::var_os("XDG_RUNTIME_DIR") {
            PathBuf::from(var)
        } else {
            return Err(BindError::RuntimeDirNotSet);
        };
        for i in 0.. {
            let lock_path = xdg_dir.join(format!("eis-{i}.lock"));
            let Some(lock_file) = util::LockFile::new(lock_path)? else {
                // Already locked, continue to next number
                continue;
            };
            let sock_path = xdg_dir.join(format!("eis-{i}"));
            if sock_path.try_exists()? {
                fs::remove_file(&sock_path)?;
            }
            return Ok(Self::bind_inner(sock_path, Some(lock_file))?);
        }
        // Should never be reached
        Err(BindError::RuntimeDirNotSet)
    }

    fn bind_inner(path: PathBuf, lock: Option<util::LockFile>) -> io::Result<Self> {
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let listener = util::UnlinkOnDrop::new(listener, path);
        Ok(Self {
            listener,
            _lock: lock,
        })
    }

    /// Get the path to the listener socket
    #[must_use]
    pub fn path(&self) -> &Path {
        util::UnlinkOnDrop::path(&self.listener)
    }

    /// Accepts a connection from a client. Returns `Ok(None)` if no incoming
    /// connection is ready (would block).
    pub fn accept(&self) -> io::Result<Option<Connection>> {
        match self.listener.accept() {
            Ok((socket, _)) => Ok(Some(Connection::new(socket)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Duplicates the listening descriptor, e.g. for registering the listener
    /// with a reactor while keeping it usable here.
    pub fn dup_fd(&self) -> rustix::io::Result<OwnedFd> {
        rustix::io::dup(&*self.listener)
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// A connection, seen from the server side.
#[derive(Debug)]
pub struct Connection {
    socket: Rc<OwnedFd>,
    read: RefCell<IoBuf>,
}

impl Connection {
    /// Creates a `Connection` from a `UnixStream`, switching it to
    /// non-blocking mode.
    pub fn new(socket: UnixStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Rc::new(socket.into()),
            read: RefCell::new(IoBuf::new(1024)),
        })
    }

    /// The connection's socket descriptor, shareable with a reactor
    /// [`Source`](crate::Source).
    pub fn socket_fd(&self) -> Rc<OwnedFd> {
        self.socket.clone()
    }

    /// Reads any pending data on the socket into the internal buffer.
    ///
    /// Returns the byte count; `Ok(0)` means the peer hung up.
    pub fn read(&self) -> rustix::io::Result<usize> {
        self.read.borrow_mut().recv_from_fd(self.socket.as_fd())
    }

    /// Returns a complete buffered message, if one is readily available.
    ///
    /// After a `ParseError` the stream offset is unrecoverable and the
    /// connection should be dropped.
    pub fn pending_message(&self) -> Option<Result<Message, ParseError>> {
        let mut read = self.read.borrow_mut();
        if read.len() < Header::SIZE {
            return None;
        }
        let header = Header::parse(read.data()[..Header::SIZE].try_into().unwrap());
        if (header.length as usize) < Header::SIZE {
            return Some(Err(ParseError::HeaderLength(header.length)));
        }
        if read.len() < header.length as usize {
            return None;
        }
        read.pop(Header::SIZE);
        let mut payload = read.take_data();
        let rest = payload.split_off(header.length as usize - Header::SIZE);
        // Put back whatever follows this message.
        read.append(&rest);
        Some(Ok(Message {
            object_id: header.object_id,
            opcode: header.opcode,
            payload,
        }))
    }

    /// The oldest received descriptor not yet claimed.
    pub fn take_fd(&self) -> Option<OwnedFd> {
        self.read.borrow_mut().take_fd()
    }

    /// Sends one framed message with `fds` attached.
    pub fn send(
        &self,
        object_id: u64,
        opcode: u32,
        payload: &[u8],
        fds: &[BorrowedFd],
    ) -> rustix::io::Result<usize> {
        let mut buf = IoBuf::new(Header::SIZE + payload.len());
        Header {
            object_id,
            length: (Header::SIZE + payload.len()) as u32,
            opcode,
        }
        .write_to(&mut buf);
        buf.append(payload);
        for fd in fds {
            buf.append_fd(*fd)?;
        }
        buf.send(self.socket.as_fd())
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}
