//! Listening socket (component F): accepts inbound connections and hands
//! each one to the application as a pending descriptor to either accept or
//! reject.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::{trace, warn};

use crate::connection::{ConnHandlers, Connection};
use crate::error;
use crate::reactor::{Interest, Reactor};
use crate::socket;

const DEFAULT_BACKLOG: i32 = 128;

type IncomingHandler = Box<dyn FnMut(&ListeningSocket, SocketAddr)>;

struct ListenerState {
    fd: RawFd,
    pending: RawFd,
    reactor: Rc<Reactor>,
    backlog: i32,
    on_incoming: Option<IncomingHandler>,
    /// Recreate the listening descriptor if `accept` reports would-block
    /// right after a readable event fires for it. Off by default; one
    /// mobile platform has been observed to leave a listening socket
    /// wedged in that state, but the workaround is not safe to assume in
    /// general, so it's opt-in.
    relisten_on_stale_accept: bool,
}

impl Drop for ListenerState {
    fn drop(&mut self) {
        if self.pending >= 0 {
            socket::close_raw(self.pending);
        }
        if self.fd >= 0 {
            let _ = self.reactor.unregister(self.fd);
            socket::close_raw(self.fd);
        }
    }
}

/// A socket accepting inbound TCP connections.
#[derive(Clone)]
pub struct ListeningSocket {
    inner: Rc<RefCell<ListenerState>>,
}

impl fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("ListeningSocket")
            .field("fd", &state.fd)
            .field("pending", &state.pending)
            .finish()
    }
}

impl ListeningSocket {
    /// Resolve `local` (or, if absent, both wildcard address families) and
    /// create a non-blocking stream socket with `SO_REUSEADDR` and
    /// zero-linger set for the first candidate that succeeds. Does not
    /// bind or listen yet.
    pub fn create<A: ToSocketAddrs>(
        local: Option<A>,
        reactor: Rc<Reactor>,
        on_incoming: impl FnMut(&ListeningSocket, SocketAddr) + 'static,
    ) -> io::Result<ListeningSocket> {
        let candidates = match local {
            Some(addr) => crate::resolve::candidates(addr)?,
            None => crate::resolve::wildcard_candidates(0),
        };

        let mut last_err = None;
        for addr in &candidates {
            match socket::new_nonblocking_stream(addr) {
                Ok(fd) => match socket::set_reuseaddr(fd).and_then(|()| socket::set_linger0(fd)) {
                    Ok(()) => {
                        return Ok(ListeningSocket {
                            inner: Rc::new(RefCell::new(ListenerState {
                                fd,
                                pending: -1,
                                reactor,
                                backlog: DEFAULT_BACKLOG,
                                on_incoming: Some(Box::new(on_incoming)),
                                relisten_on_stale_accept: false,
                            })),
                        })
                    }
                    Err(e) => {
                        socket::close_raw(fd);
                        last_err = Some(e);
                    }
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(error::address_not_available))
    }

    /// Opt in to recreating the listening descriptor when `accept` reports
    /// would-block immediately after a readable event, working around the
    /// platform quirk described on [`ListenerState::relisten_on_stale_accept`].
    pub fn set_relisten_on_stale_accept(&self, enabled: bool) {
        self.inner.borrow_mut().relisten_on_stale_accept = enabled;
    }

    /// Bind the listening descriptor. Tries every candidate local address
    /// in turn; the first successful `bind(2)` wins.
    pub fn bind<A: ToSocketAddrs>(&self, local: A) -> io::Result<()> {
        let candidates = crate::resolve::candidates(local)?;
        let fd = self.require_fd()?;
        let mut last_err = None;
        for addr in &candidates {
            match socket::bind_raw(fd, addr) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(error::address_not_available))
    }

    /// `listen(2)` with `backlog`, then register readable interest so
    /// inbound connections drive [`ListeningSocket::handle_incoming`].
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let fd = self.require_fd()?;
        socket::listen_raw(fd, backlog)?;
        self.inner.borrow_mut().backlog = backlog;
        self.arm(fd);
        Ok(())
    }

    fn arm(&self, fd: RawFd) {
        let weak: Weak<RefCell<ListenerState>> = Rc::downgrade(&self.inner);
        let reactor = self.inner.borrow().reactor.clone();
        let _ = reactor.register(fd, Interest::READABLE, move |_readiness| {
            if let Some(inner) = weak.upgrade() {
                ListeningSocket::handle_incoming(&inner);
            }
        });
    }

    fn require_fd(&self) -> io::Result<RawFd> {
        let fd = self.inner.borrow().fd;
        if fd < 0 {
            Err(error::bad_descriptor())
        } else {
            Ok(fd)
        }
    }

    pub fn local_address(&self) -> io::Result<SocketAddr> {
        socket::getsockname(self.require_fd()?)
    }

    /// Cancel the poller registration and close the descriptor (and any
    /// not-yet-accepted pending connection).
    pub fn destroy(&self) {
        let mut state = self.inner.borrow_mut();
        if state.pending >= 0 {
            socket::close_raw(state.pending);
            state.pending = -1;
        }
        if state.fd >= 0 {
            let _ = state.reactor.unregister(state.fd);
            socket::close_raw(state.fd);
            state.fd = -1;
        }
    }

    fn handle_incoming(inner: &Rc<RefCell<ListenerState>>) {
        let fd = inner.borrow().fd;
        if fd < 0 {
            return;
        }
        match socket::accept_raw(fd) {
            Ok((new_fd, peer)) => {
                if let Err(e) = socket::set_nonblocking(new_fd) {
                    warn!("dropping inbound connection, couldn't set non-blocking: {}", e);
                    socket::close_raw(new_fd);
                    return;
                }
                if let Err(e) = socket::set_linger0(new_fd) {
                    warn!("dropping inbound connection, couldn't set zero-linger: {}", e);
                    socket::close_raw(new_fd);
                    return;
                }

                {
                    let mut state = inner.borrow_mut();
                    if state.pending >= 0 {
                        // Application never accepted or rejected the
                        // previous one; drop it rather than leak it.
                        socket::close_raw(state.pending);
                    }
                    state.pending = new_fd;
                }

                let mut cb = inner.borrow_mut().on_incoming.take();
                if let Some(ref mut cb) = cb {
                    let listener = ListeningSocket { inner: inner.clone() };
                    cb(&listener, peer);
                }
                let mut state = inner.borrow_mut();
                if state.on_incoming.is_none() {
                    state.on_incoming = cb;
                }
            }
            Err(e) if error::is_would_block(&e) => {
                if inner.borrow().relisten_on_stale_accept {
                    relisten(inner);
                }
            }
            Err(e) => {
                trace!("accept failed on fd={}: {}", fd, e);
            }
        }
    }

    /// Promote the pending connection reported by the last `on_incoming`
    /// call into a [`Connection`] and arm its interest immediately, since
    /// an accepted socket is already a live TCP connection. Non-blocking
    /// mode and zero-linger were already applied to it in `handle_incoming`,
    /// before `on_incoming` ever ran.
    pub fn accept(&self, reactor: Rc<Reactor>, handlers: ConnHandlers) -> io::Result<Connection> {
        let fd = {
            let mut state = self.inner.borrow_mut();
            if state.pending < 0 {
                return Err(error::invalid_argument("no pending connection to accept"));
            }
            let fd = state.pending;
            state.pending = -1;
            fd
        };
        Ok(Connection::from_accepted(fd, reactor, handlers))
    }

    /// Reject the pending connection reported by the last `on_incoming`
    /// call, closing it without ever handing out a `Connection`.
    pub fn reject(&self) {
        let mut state = self.inner.borrow_mut();
        if state.pending >= 0 {
            socket::close_raw(state.pending);
            state.pending = -1;
        }
    }
}

/// Recreate the listening descriptor at the same local address after
/// `accept` reported would-block right after a readable event — the
/// `RelistenOnStaleAccept` workaround.
fn relisten(inner: &Rc<RefCell<ListenerState>>) {
    let (old_fd, backlog, reactor) = {
        let state = inner.borrow();
        (state.fd, state.backlog, state.reactor.clone())
    };
    let local = match socket::getsockname(old_fd) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("relisten: couldn't read local address of fd={}: {}", old_fd, e);
            return;
        }
    };

    let result = socket::new_nonblocking_stream(&local).and_then(|new_fd| {
        match socket::set_reuseaddr(new_fd)
            .and_then(|()| socket::set_linger0(new_fd))
            .and_then(|()| socket::bind_raw(new_fd, &local))
            .and_then(|()| socket::listen_raw(new_fd, backlog))
        {
            Ok(()) => Ok(new_fd),
            Err(e) => {
                socket::close_raw(new_fd);
                Err(e)
            }
        }
    });

    match result {
        Ok(new_fd) => {
            let _ = reactor.unregister(old_fd);
            socket::close_raw(old_fd);
            inner.borrow_mut().fd = new_fd;
            let listener = ListeningSocket { inner: inner.clone() };
            listener.arm(new_fd);
            warn!("relisten: recreated stale listening socket on {}", local);
        }
        Err(e) => {
            warn!("relisten: failed to recreate listening socket on {}: {}", local, e);
        }
    }
}
