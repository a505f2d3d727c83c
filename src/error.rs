use crate::server::{BindError, ParseError};
use std::{fmt, io};

/// An error coming from the `eibridge` crate
#[derive(Debug)]
pub enum Error {
    /// Framing parse error.
    Parse(ParseError),
    /// Listener socket setup error.
    Bind(BindError),
    /// I/O error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "parse error: {err}"),
            Self::Bind(err) => write!(f, "bind error: {err}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<BindError> for Error {
    fn from(err: BindError) -> Self {
        Self::Bind(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        Self::Io(err.into())
    }
}

impl std::error::Error for Error {}
