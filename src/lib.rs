//! Single-threaded epoll reactor and fd-passing IO buffer for emulated-input
//! bridges.
//!
//! The building blocks are a [`Sink`] (one epoll instance) dispatching
//! [`Source`] callbacks, and an [`IoBuf`] that carries message bytes together
//! with a queue of file descriptors across a unix socket. The
//! [`server`] module is a thin EIS-style transport built on top of them; see
//! `demos/eis-demo-server.rs` for a complete event loop.
//!
//! Sinks, sources and their callbacks all live on one thread; the only
//! blocking call is [`Sink::poll`].

#![forbid(unsafe_code)]

mod error;
pub mod iobuf;
pub mod list;
pub mod reactor;
pub mod server;
mod util;

pub use error::Error;
pub use iobuf::IoBuf;
pub use reactor::{CloseBehavior, Sink, Source};
