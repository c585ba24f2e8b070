//! Connection (component E): the state machine that owns one TCP
//! descriptor from allocation through establishment, I/O, and close.
//!
//! A `Connection` is a cheap handle (`Rc<RefCell<ConnectionState>>`) around
//! the descriptor, its send queue, its helper chain, and the application's
//! four callbacks. The reactor holds only a *weak* reference to this state
//! (via the dispatch closure registered for the descriptor) so that the
//! application remains the sole strong owner, exactly as in the library
//! this one is grounded on, where the poller holds a bare, non-owning
//! pointer. Dropping the last `Connection` handle tears the descriptor down
//! through `Drop`; `destroy` does the same thing eagerly, for callers that
//! want teardown to happen before their last handle actually goes out of
//! scope (e.g. a helper closure still holding a clone).

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use log::{trace, warn};

use crate::error;
use crate::helper::{self, HandlerOutcome, HelperCell, HelperHandle, HelperHandlers};
use crate::reactor::{Interest, Readiness, Reactor};
use crate::sendqueue::SendQueue;
use crate::socket;

const DEFAULT_RECV_CHUNK: usize = 8192;

type EstablishedHandler = Box<dyn FnMut(&Connection)>;
type RecvHandler = Box<dyn FnMut(&Connection, BytesMut)>;
type ClosedHandler = Box<dyn FnMut(&Connection, Option<io::Error>)>;
type DrainHandler = Box<dyn FnMut(&Connection)>;

/// The three callbacks supplied at construction time. `on_drained` is set
/// later, via [`Connection::set_drain_handler`], since it is commonly
/// attached and detached over a connection's lifetime rather than fixed at
/// creation.
#[derive(Default)]
pub struct ConnHandlers {
    on_established: Option<EstablishedHandler>,
    on_recv: Option<RecvHandler>,
    on_closed: Option<ClosedHandler>,
}

impl ConnHandlers {
    pub fn new() -> ConnHandlers {
        ConnHandlers::default()
    }

    pub fn on_established<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Connection) + 'static,
    {
        self.on_established = Some(Box::new(f));
        self
    }

    pub fn on_recv<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Connection, BytesMut) + 'static,
    {
        self.on_recv = Some(Box::new(f));
        self
    }

    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Connection, Option<io::Error>) + 'static,
    {
        self.on_closed = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ConnHandlers {
    /// Closures aren't `Debug`; report which callbacks are set instead of
    /// their contents.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandlers")
            .field("on_established", &self.on_established.is_some())
            .field("on_recv", &self.on_recv.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

struct ConnectionState {
    fd: RawFd,
    reactor: Rc<Reactor>,
    active: bool,
    connected: bool,
    closed: bool,
    rxsz: usize,
    sendq: SendQueue,
    helpers: Vec<HelperCell>,
    on_established: Option<EstablishedHandler>,
    on_recv: Option<RecvHandler>,
    on_closed: Option<ClosedHandler>,
    on_drained: Option<DrainHandler>,
}

impl Drop for ConnectionState {
    /// The destructor half of the spec's alloc/destroy pair: cancel the
    /// poller registration and close the descriptor. Does *not* invoke
    /// `on_closed` — that only fires from an explicit `close`, matching a
    /// connection freed outright without ever going through the error sink.
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = self.reactor.unregister(self.fd);
            socket::close_raw(self.fd);
            self.fd = -1;
        }
    }
}

/// A live TCP connection: an accepted socket or one under construction via
/// [`Connection::allocate`]/[`Connection::connect`].
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnectionState>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Connection")
            .field("fd", &state.fd)
            .field("active", &state.active)
            .field("connected", &state.connected)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Connection {
    /// Resolve `peer` and create a non-blocking, zero-linger stream socket
    /// for the first candidate address that succeeds. Does not connect or
    /// register with the reactor yet — see [`Connection::connect`].
    pub fn allocate<A: ToSocketAddrs>(
        peer: A,
        reactor: Rc<Reactor>,
        handlers: ConnHandlers,
    ) -> io::Result<Connection> {
        let candidates = crate::resolve::candidates(peer)?;
        let mut last_err = None;
        for addr in &candidates {
            match socket::new_nonblocking_stream(addr) {
                Ok(fd) => match socket::set_linger0(fd) {
                    Ok(()) => return Ok(Connection::from_fd(fd, reactor, handlers, false)),
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

    fn from_fd(fd: RawFd, reactor: Rc<Reactor>, handlers: ConnHandlers, active: bool) -> Connection {
        Connection {
            inner: Rc::new(RefCell::new(ConnectionState {
                fd,
                reactor,
                active,
                connected: false,
                closed: false,
                rxsz: DEFAULT_RECV_CHUNK,
                sendq: SendQueue::default(),
                helpers: Vec::new(),
                on_established: handlers.on_established,
                on_recv: handlers.on_recv,
                on_closed: handlers.on_closed,
                on_drained: None,
            })),
        }
    }

    /// Used by [`crate::listener::ListeningSocket::accept`]: the descriptor
    /// is already a live TCP connection, so interest is armed immediately
    /// rather than waiting for a `connect` call.
    pub(crate) fn from_accepted(fd: RawFd, reactor: Rc<Reactor>, handlers: ConnHandlers) -> Connection {
        let conn = Connection::from_fd(fd, reactor, handlers, false);
        conn.arm_initial_interest();
        conn
    }

    /// Bind the connection's own descriptor to a local address before
    /// connecting. Tries every candidate in turn; the first successful
    /// `bind(2)` wins.
    pub fn bind_local<A: ToSocketAddrs>(&self, local: A) -> io::Result<()> {
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

    /// Begin connecting to `peer`. Marks the connection active, attempts
    /// `connect(2)` against each resolved candidate in turn (retrying on
    /// `EINTR`), and arms readable+writable+exception interest on success.
    /// Completion — or refusal — arrives later as a writable event.
    pub fn connect<A: ToSocketAddrs>(&self, peer: A) -> io::Result<()> {
        let candidates = crate::resolve::candidates(peer)?;
        self.inner.borrow_mut().active = true;
        let fd = self.require_fd()?;

        let mut last_err = None;
        for addr in &candidates {
            loop {
                match socket::connect_once(fd, addr) {
                    Ok(()) => {
                        self.arm_initial_interest();
                        return Ok(());
                    }
                    Err(e) if error::is_interrupted(&e) => continue,
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(error::address_not_available))
    }

    fn arm_initial_interest(&self) {
        self.rearm(Interest::READABLE | Interest::WRITABLE | Interest::EXCEPTION);
    }

    fn rearm(&self, interest: Interest) {
        let fd = self.inner.borrow().fd;
        if fd < 0 {
            return;
        }
        let weak: Weak<RefCell<ConnectionState>> = Rc::downgrade(&self.inner);
        let reactor = self.inner.borrow().reactor.clone();
        let _ = reactor.register(fd, interest, move |readiness| {
            if let Some(inner) = weak.upgrade() {
                Connection::handle_event(&inner, readiness);
            }
        });
    }

    /// Spec §3's lifecycle rule ("once closed, the descriptor is −1 and
    /// subsequent operations fail with bad descriptor") is honored even
    /// though §4.6 defers the actual `close(2)` to destruction: once
    /// `close_internal` has fired, public operations treat the connection
    /// as gone regardless of whether the raw fd has been released yet.
    fn require_fd(&self) -> io::Result<RawFd> {
        let state = self.inner.borrow();
        if state.closed || state.fd < 0 {
            Err(error::bad_descriptor())
        } else {
            Ok(state.fd)
        }
    }

    pub fn local_address(&self) -> io::Result<SocketAddr> {
        socket::getsockname(self.require_fd()?)
    }

    pub fn peer_address(&self) -> io::Result<SocketAddr> {
        socket::getpeername(self.require_fd()?)
    }

    pub fn descriptor(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn set_recv_chunk_size(&self, size: usize) {
        self.inner.borrow_mut().rxsz = size.max(1);
    }

    /// Attach (or replace) the one-shot callback fired the next time the
    /// send queue drains to empty. The handler is cleared the instant it
    /// fires — call `set_drain_handler` again (from inside the callback
    /// itself, if a standing subscription is wanted) to be notified of a
    /// later drain. Setting one while the queue is already empty re-arms
    /// writable interest so the notification still arrives promptly,
    /// rather than waiting for the next unrelated write event.
    pub fn set_drain_handler<F>(&self, f: F)
    where
        F: FnMut(&Connection) + 'static,
    {
        let (fd, was_empty, connected) = {
            let mut state = self.inner.borrow_mut();
            state.on_drained = Some(Box::new(f));
            (state.fd, state.sendq.is_empty(), state.connected)
        };
        if fd >= 0 && was_empty && connected {
            self.rearm(Interest::READABLE | Interest::WRITABLE | Interest::EXCEPTION);
        }
    }

    /// Register a new helper at the tail of the chain.
    pub fn register_helper(&self, handlers: HelperHandlers) -> HelperHandle {
        let slot = helper::HelperSlot {
            establish: handlers.establish,
            send: handlers.send,
            recv: handlers.recv,
        };
        let cell = helper::new_cell(slot);
        let mut state = self.inner.borrow_mut();
        state.helpers.retain(|c| c.borrow().is_some());
        state.helpers.push(cell.clone());
        HelperHandle { cell }
    }

    /// Tear the connection down immediately: cancel the poller
    /// registration, close the descriptor, and drop the send queue and
    /// helper chain. Idempotent. Does not invoke `on_closed`; pair this
    /// with an explicit close if the application wants that callback to
    /// fire first.
    pub fn destroy(&self) {
        let mut state = self.inner.borrow_mut();
        if state.fd >= 0 {
            let _ = state.reactor.unregister(state.fd);
            socket::close_raw(state.fd);
            state.fd = -1;
        }
        state.helpers.clear();
        state.sendq = SendQueue::default();
    }

    /// Send `buf` through the reverse helper chain (tail to head) and, if
    /// no helper consumes it, either write it immediately or enqueue the
    /// remainder for later draining. A helper returning an error is handed
    /// straight back to the caller — the connection stays open.
    pub fn send<B: Into<BytesMut>>(&self, buf: B) -> io::Result<()> {
        let mut buf: BytesMut = buf.into();
        if buf.is_empty() {
            return Err(error::invalid_argument("empty send buffer"));
        }

        let fd = self.require_fd()?;
        let helpers = self.inner.borrow().helpers.clone();
        for cell in helpers.iter().rev() {
            if let Some(mut handler) = take_send(cell) {
                let outcome = handler(&mut buf);
                restore_send(cell, handler);
                match outcome {
                    HandlerOutcome::Handled => return Ok(()),
                    HandlerOutcome::Error(e) => return Err(e),
                    HandlerOutcome::NotHandled => {}
                }
            }
        }

        if buf.is_empty() {
            return Ok(());
        }
        let bytes = buf.freeze();

        let queue_was_nonempty = !self.inner.borrow().sendq.is_empty();
        if queue_was_nonempty {
            self.inner.borrow_mut().sendq.push(bytes);
            return Ok(());
        }

        match socket::send_once(fd, &bytes) {
            Ok(n) if n >= bytes.len() => Ok(()),
            Ok(n) => {
                self.enqueue_remaining(bytes.slice(n..));
                Ok(())
            }
            Err(e) if error::is_would_block(&e) => {
                self.enqueue_remaining(bytes);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue_remaining(&self, remaining: Bytes) {
        self.inner.borrow_mut().sendq.push(remaining);
        self.rearm(Interest::READABLE | Interest::WRITABLE | Interest::EXCEPTION);
    }

    /// The §4.3 event dispatch entry point: one `SO_ERROR` check up front,
    /// then writable-edge handling (establish walk or queue drain) followed
    /// by readable-edge handling (recv walk), mirroring the single
    /// callback invocation the underlying library delivers per descriptor
    /// event.
    fn handle_event(inner: &Rc<RefCell<ConnectionState>>, readiness: Readiness) {
        let fd = inner.borrow().fd;
        if fd < 0 {
            return;
        }
        match socket::so_error(fd) {
            Ok(0) => {}
            Ok(errno) => {
                close_internal(inner, Some(io::Error::from_raw_os_error(errno)));
                return;
            }
            Err(e) => {
                close_internal(inner, Some(e));
                return;
            }
        }

        // Mirrors the grounding source's `if (flags & FD_WRITE) { ...; return; }`
        // block: whether this event carries writable readiness, not whether
        // the connection is already `connected`, decides whether the read
        // path below ever runs in *this* call. A not-yet-connected writable
        // edge is handled entirely by `handle_establish_edge` and returns
        // unconditionally — even if the event also carried readable — so a
        // helper that just flipped `connected` never reads in the same call
        // establishment completed in. A writable edge while already
        // connected drains the queue and then falls through to the read
        // path below. An event with no writable readiness at all skips
        // straight to the read path regardless of `connected`, which is how
        // a helper holding establishment open (returning `Handled` from its
        // `establish` handler) still gets to see inbound bytes and flip the
        // mid-stream latch.
        if readiness.writable {
            if inner.borrow().connected {
                Connection::handle_writable_drain(inner);
                if inner.borrow().closed {
                    return;
                }
            } else {
                Connection::handle_establish_edge(inner);
                return;
            }
        }
        if readiness.readable {
            Connection::handle_readable(inner);
        }
    }

    /// Writable edge while not yet connected: re-arm to readable-only
    /// first (matching the source this is grounded on, which narrows
    /// interest before walking helpers regardless of the walk's outcome),
    /// then walk establish handlers head to tail. A helper returning
    /// `Handled` here defers establishment entirely — typically to a later
    /// mid-stream latch (see `handle_readable`) — without marking the
    /// connection connected.
    fn handle_establish_edge(inner: &Rc<RefCell<ConnectionState>>) {
        let conn = Connection { inner: inner.clone() };
        conn.rearm(Interest::READABLE);

        let active = inner.borrow().active;
        let helpers = inner.borrow().helpers.clone();
        for cell in &helpers {
            if let Some(mut handler) = take_establish(cell) {
                let outcome = handler(active);
                restore_establish(cell, handler);
                match outcome {
                    HandlerOutcome::Handled => return,
                    HandlerOutcome::Error(e) => {
                        close_internal(inner, Some(e));
                        return;
                    }
                    HandlerOutcome::NotHandled => {}
                }
            }
        }

        fire_established(inner);
    }

    /// Writable edge while connected: drain one step of the send queue,
    /// then pare interest back to readable-only once the queue is empty
    /// and no drain handler is subscribed (otherwise writable interest
    /// stays armed, either because more is queued or because the
    /// application wants to be told the instant it drains).
    fn handle_writable_drain(inner: &Rc<RefCell<ConnectionState>>) {
        let fd = inner.borrow().fd;

        let has_entry = !inner.borrow().sendq.is_empty();
        if has_entry {
            let result = {
                let mut state = inner.borrow_mut();
                let entry = state.sendq.front_mut().expect("checked non-empty above");
                socket::send_once(fd, entry.remaining())
            };
            match result {
                Ok(n) => {
                    let mut state = inner.borrow_mut();
                    if let Some(entry) = state.sendq.front_mut() {
                        entry.advance(n);
                        if entry.is_drained() {
                            state.sendq.pop_front();
                        }
                    }
                }
                Err(e) if error::is_would_block(&e) => {}
                Err(e) => {
                    close_internal(inner, Some(e));
                    return;
                }
            }
        } else {
            // One-shot: `on_drained` is taken and never restored here, so
            // it fires exactly once per queue-empties transition. If the
            // application wants to be notified again next time, it calls
            // `set_drain_handler` again — from inside the callback itself
            // if it wants a standing subscription.
            let mut cb = inner.borrow_mut().on_drained.take();
            if let Some(ref mut cb) = cb {
                let conn = Connection { inner: inner.clone() };
                cb(&conn);
            }
        }

        let (empty, has_drain) = {
            let state = inner.borrow();
            (state.sendq.is_empty(), state.on_drained.is_some())
        };
        let conn = Connection { inner: inner.clone() };
        if empty && !has_drain {
            conn.rearm(Interest::READABLE);
        } else {
            conn.rearm(Interest::READABLE | Interest::WRITABLE | Interest::EXCEPTION);
        }
    }

    /// Readable edge: one `recv`, then a forward walk over the chain. This
    /// runs whenever data arrives, independent of whether the connection
    /// has reached `connected` yet — a helper stack that keeps returning
    /// `Handled` from the establish walk (holding a handshake open) relies
    /// on recv processing continuing regardless, promoting the connection
    /// via the latch below once its handshake finishes.
    fn handle_readable(inner: &Rc<RefCell<ConnectionState>>) {
        let (fd, rxsz) = {
            let state = inner.borrow();
            (state.fd, state.rxsz)
        };

        let mut buf = BytesMut::with_capacity(rxsz);
        buf.resize(rxsz, 0);
        let n = match socket::recv_once(fd, &mut buf) {
            Ok(0) => {
                close_internal(inner, error::peer_closed());
                return;
            }
            Ok(n) => n,
            Err(e) if error::is_would_block(&e) => {
                trace!("spurious readable event on fd={}", fd);
                return;
            }
            Err(e) => {
                close_internal(inner, Some(e));
                return;
            }
        };
        buf.truncate(n);

        let active = inner.borrow().active;
        let helpers = inner.borrow().helpers.clone();
        let mut latched = false;
        for cell in &helpers {
            let outcome = if !latched {
                take_recv(cell).map(|mut handler| {
                    let mut latch = false;
                    let outcome = handler(&mut buf, &mut latch);
                    restore_recv(cell, handler);
                    if latch {
                        latched = true;
                    }
                    outcome
                })
            } else {
                take_establish(cell).map(|mut handler| {
                    let outcome = handler(active);
                    restore_establish(cell, handler);
                    outcome
                })
            };
            match outcome {
                Some(HandlerOutcome::Handled) => return,
                Some(HandlerOutcome::Error(e)) => {
                    close_internal(inner, Some(e));
                    return;
                }
                Some(HandlerOutcome::NotHandled) | None => {}
            }
        }

        if latched {
            fire_established(inner);
        } else {
            let mut cb = inner.borrow_mut().on_recv.take();
            if let Some(ref mut cb) = cb {
                let conn = Connection { inner: inner.clone() };
                cb(&conn, buf);
            }
            let mut state = inner.borrow_mut();
            if state.on_recv.is_none() {
                state.on_recv = cb;
            }
        }
    }
}

/// Fire `on_established` (if not already connected) and mark the
/// connection connected. Shared by the plain writable-edge establish walk
/// and the mid-stream recv latch, so `connected` transitions false→true
/// exactly once regardless of which path got there.
fn fire_established(inner: &Rc<RefCell<ConnectionState>>) {
    if inner.borrow().connected {
        return;
    }
    let mut cb = inner.borrow_mut().on_established.take();
    if let Some(ref mut cb) = cb {
        let conn = Connection { inner: inner.clone() };
        cb(&conn);
    }
    let mut state = inner.borrow_mut();
    state.connected = true;
    if state.on_established.is_none() {
        state.on_established = cb;
    }
}

/// Cancel the poller registration and invoke `on_closed` exactly once.
/// Does not close the descriptor — callers (and tests) may still want to
/// inspect it after close; the descriptor is released when the connection
/// itself is destroyed or dropped.
fn close_internal(inner: &Rc<RefCell<ConnectionState>>, err: Option<io::Error>) {
    let (reactor, fd, mut on_closed) = {
        let mut state = inner.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        (state.reactor.clone(), state.fd, state.on_closed.take())
    };
    if fd >= 0 {
        let _ = reactor.unregister(fd);
    }
    if let Some(ref mut cb) = on_closed {
        let conn = Connection { inner: inner.clone() };
        cb(&conn, err);
    } else if let Some(e) = err {
        warn!("connection fd={} closed with no handler: {}", fd, e);
    }
}

fn take_establish(cell: &HelperCell) -> Option<Box<dyn FnMut(bool) -> HandlerOutcome>> {
    cell.borrow_mut().as_mut().and_then(|slot| slot.establish.take())
}

fn restore_establish(cell: &HelperCell, f: Box<dyn FnMut(bool) -> HandlerOutcome>) {
    if let Some(slot) = cell.borrow_mut().as_mut() {
        slot.establish = Some(f);
    }
}

fn take_send(cell: &HelperCell) -> Option<Box<dyn FnMut(&mut BytesMut) -> HandlerOutcome>> {
    cell.borrow_mut().as_mut().and_then(|slot| slot.send.take())
}

fn restore_send(cell: &HelperCell, f: Box<dyn FnMut(&mut BytesMut) -> HandlerOutcome>) {
    if let Some(slot) = cell.borrow_mut().as_mut() {
        slot.send = Some(f);
    }
}

fn take_recv(cell: &HelperCell) -> Option<Box<dyn FnMut(&mut BytesMut, &mut bool) -> HandlerOutcome>> {
    cell.borrow_mut().as_mut().and_then(|slot| slot.recv.take())
}

fn restore_recv(cell: &HelperCell, f: Box<dyn FnMut(&mut BytesMut, &mut bool) -> HandlerOutcome>) {
    if let Some(slot) = cell.borrow_mut().as_mut() {
        slot.recv = Some(f);
    }
}
