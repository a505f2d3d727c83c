//! Single-threaded epoll reactor.
//!
//! A [`Sink`] owns an epoll instance and a set of registered [`Source`]s.
//! [`Sink::dispatch`] collects ready events without blocking and invokes each
//! source's callback; [`Sink::poll`] is the one place that waits. Callbacks may
//! remove any source, including the one being dispatched: removal only moves
//! the source to a pending list, and the pending list is drained after the
//! dispatch pass, so no source is released while events are still being
//! delivered.
//!
//! Everything here is `!Send`. A sink and its sources belong to one thread.

use std::{
    cell::{Cell, RefCell},
    fmt,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    rc::{Rc, Weak},
};

use rustix::event::epoll;
use rustix::io::retry_on_intr;

use crate::{list::Link, list::List, util};

/// What happens to a source's descriptor handle when the source leaves the
/// reactor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Release the handle when the source is removed from its sink.
    #[default]
    OnRemove,
    /// Keep the handle until the source itself is dropped.
    OnDestroy,
    /// Keep the handle; the caller reclaims it with [`Source::take_fd`].
    Never,
}

type DispatchFn = dyn FnMut(&Rc<Source>);

/// One registered file descriptor and its dispatch callback.
///
/// Created inactive; [`Sink::add_source`] activates it. The callback runs
/// whenever the descriptor is ready for reading, or also for writing after
/// [`Source::enable_write`].
pub struct Source {
    fd: RefCell<Option<Rc<OwnedFd>>>,
    dispatch: RefCell<Box<DispatchFn>>,
    close_behavior: Cell<CloseBehavior>,
    sink: RefCell<Weak<SinkInner>>,
    link: RefCell<Option<Link<Rc<Source>>>>,
    token: Cell<u64>,
    active: Cell<bool>,
    write_enabled: Cell<bool>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("fd", &self.fd.borrow().as_deref())
            .field("active", &self.active.get())
            .field("write_enabled", &self.write_enabled.get())
            .finish()
    }
}

impl Source {
    /// Creates an inactive source watching `fd`, with the default
    /// [`CloseBehavior::OnRemove`].
    ///
    /// The descriptor may be shared: passing an `Rc<OwnedFd>` clone lets a
    /// composite owner keep using the descriptor the source watches.
    pub fn new(
        fd: impl Into<Rc<OwnedFd>>,
        dispatch: impl FnMut(&Rc<Source>) + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            fd: RefCell::new(Some(fd.into())),
            dispatch: RefCell::new(Box::new(dispatch)),
            close_behavior: Cell::new(CloseBehavior::default()),
            sink: RefCell::new(Weak::new()),
            link: RefCell::new(None),
            token: Cell::new(0),
            active: Cell::new(false),
            write_enabled: Cell::new(false),
        })
    }

    pub fn set_close_behavior(&self, behavior: CloseBehavior) {
        self.close_behavior.set(behavior);
    }

    /// Whether the source is currently registered with a sink.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// The watched descriptor, if the source still holds one.
    pub fn fd(&self) -> Option<Rc<OwnedFd>> {
        self.fd.borrow().clone()
    }

    /// Reclaims the descriptor from an inactive source.
    ///
    /// Returns `None` if the handle is gone or the descriptor is still shared
    /// with another owner. Calling this on an active source is a usage error.
    pub fn take_fd(&self) -> Option<OwnedFd> {
        assert!(
            !self.active.get(),
            "cannot reclaim the descriptor of a registered source"
        );
        let fd = self.fd.borrow_mut().take()?;
        match Rc::try_unwrap(fd) {
            Ok(fd) => Some(fd),
            Err(shared) => {
                *self.fd.borrow_mut() = Some(shared);
                None
            }
        }
    }

    /// Adds or drops write-readiness interest. The source must be active.
    ///
    /// On failure the registration keeps its previous interest set.
    pub fn enable_write(self: &Rc<Self>, enable: bool) -> rustix::io::Result<()> {
        assert!(self.active.get(), "source is not registered with a sink");
        let sink = self.sink.borrow().upgrade();
        let sink = sink.expect("active source outlived its sink");
        let fd = self.fd.borrow();
        let fd = fd.as_ref().expect("active source has no descriptor");
        epoll::modify(
            &sink.epoll,
            fd.as_fd(),
            epoll::EventData::new_u64(self.token.get()),
            interest(enable),
        )?;
        self.write_enabled.set(enable);
        Ok(())
    }

    /// Deregisters the source from its sink. Idempotent.
    ///
    /// Safe to call from inside a dispatch callback, including the source's
    /// own: the source is only released after the current dispatch pass.
    pub fn remove(&self) {
        if !self.active.get() {
            return;
        }
        let Some(sink) = self.sink.borrow().upgrade() else {
            return;
        };
        if let Some(fd) = self.fd.borrow().as_deref() {
            if let Err(err) = epoll::delete(&sink.epoll, fd) {
                log::debug!("failed to deregister source: {err}");
            }
        }
        if self.close_behavior.get() == CloseBehavior::OnRemove {
            *self.fd.borrow_mut() = None;
        }
        self.active.set(false);
        *self.sink.borrow_mut() = Weak::new();
        if let Some(link) = self.link.borrow_mut().take() {
            if let Some(source) = sink.active.borrow_mut().remove(&link) {
                sink.pending.borrow_mut().push_back(source);
            }
        }
    }
}

fn interest(write: bool) -> epoll::EventFlags {
    if write {
        epoll::EventFlags::IN | epoll::EventFlags::OUT
    } else {
        epoll::EventFlags::IN
    }
}

struct SinkInner {
    epoll: OwnedFd,
    active: RefCell<List<Rc<Source>>>,
    pending: RefCell<List<Rc<Source>>>,
    next_token: Cell<u64>,
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        // Force-remove whatever is still registered, applying close policies.
        // The sources' weak back-references cannot be upgraded at this point,
        // so this works on the fields directly.
        loop {
            let source = self.active.borrow_mut().pop_front();
            let Some(source) = source else { break };
            if let Some(fd) = source.fd.borrow().as_deref() {
                let _ = epoll::delete(&self.epoll, fd);
            }
            if source.close_behavior.get() == CloseBehavior::OnRemove {
                *source.fd.borrow_mut() = None;
            }
            source.active.set(false);
            *source.sink.borrow_mut() = Weak::new();
            *source.link.borrow_mut() = None;
        }
        while self.pending.borrow_mut().pop_front().is_some() {}
    }
}

/// Cheap clonable handle to a reactor instance.
///
/// Teardown runs when the last handle drops: every still-active source is
/// deregistered and the epoll descriptor is closed.
#[derive(Clone)]
pub struct Sink(Rc<SinkInner>);

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("epoll", &self.0.epoll)
            .field("sources", &self.0.active.borrow().len())
            .finish()
    }
}

impl AsFd for Sink {
    /// The epoll descriptor, readable whenever a dispatch would deliver
    /// events. Lets a sink nest inside a larger event loop.
    fn as_fd(&self) -> BorrowedFd {
        self.0.epoll.as_fd()
    }
}

impl Sink {
    pub fn new() -> rustix::io::Result<Self> {
        Ok(Self(Rc::new(SinkInner {
            epoll: epoll::create(epoll::CreateFlags::CLOEXEC)?,
            active: RefCell::new(List::new()),
            pending: RefCell::new(List::new()),
            next_token: Cell::new(0),
        })))
    }

    /// Registers `source` for read readiness (and write readiness, if the
    /// source has write interest enabled).
    ///
    /// On failure no reference to the source is retained. Registering an
    /// already-active source is a usage error.
    pub fn add_source(&self, source: &Rc<Source>) -> rustix::io::Result<()> {
        assert!(
            !source.active.get(),
            "source is already registered with a sink"
        );
        let token = self.0.next_token.get();
        {
            let fd = source.fd.borrow();
            let fd = fd.as_ref().expect("source has no descriptor");
            epoll::add(
                &self.0.epoll,
                fd.as_fd(),
                epoll::EventData::new_u64(token),
                interest(source.write_enabled.get()),
            )?;
        }
        self.0.next_token.set(token + 1);
        source.token.set(token);
        source.active.set(true);
        *source.sink.borrow_mut() = Rc::downgrade(&self.0);
        let link = self.0.active.borrow_mut().push_back(source.clone());
        *source.link.borrow_mut() = Some(link);
        Ok(())
    }

    /// Collects ready events without blocking and runs their callbacks, then
    /// releases every source removed during the pass. Returns the number of
    /// callbacks invoked.
    ///
    /// A source removed earlier in the same pass no longer resolves and its
    /// remaining events are skipped.
    pub fn dispatch(&self) -> rustix::io::Result<usize> {
        let mut events = epoll::EventVec::with_capacity(32);
        retry_on_intr(|| epoll::wait(&self.0.epoll, &mut events, 0))?;
        let mut dispatched = 0;
        for event in events.iter() {
            let token = event.data.u64();
            let source = self
                .0
                .active
                .borrow()
                .iter()
                .find(|source| source.token.get() == token);
            let Some(source) = source else { continue };
            if source.fd.borrow().is_none() {
                continue;
            }
            (source.dispatch.borrow_mut())(&source);
            dispatched += 1;
        }
        loop {
            let removed = self.0.pending.borrow_mut().pop_front();
            if removed.is_none() {
                break;
            }
        }
        Ok(dispatched)
    }

    /// Blocks until a dispatch would deliver events, or the timeout
    /// (milliseconds, `-1` for no timeout) expires. Returns whether events
    /// are pending.
    ///
    /// This is the reactor's only blocking call; waiting is otherwise the
    /// caller's job.
    pub fn poll(&self, timeout: i32) -> std::io::Result<bool> {
        util::poll_readable(&self.0.epoll, timeout)
    }
}
