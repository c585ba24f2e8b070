//! Helper chain (component D): the ordered, pluggable pipeline of
//! interceptors a connection carries. A helper can transform, consume, or
//! short-circuit bytes flowing in either direction, and can observe or
//! override connection establishment.
//!
//! Each registered helper gets its own destructible cell
//! (`Rc<RefCell<Option<HelperSlot>>>`). `Connection` keeps the chain as a
//! `Vec` of clones of these cells in stable insertion order; destroying a
//! helper sets its cell to `None` rather than removing it from the `Vec`
//! mid-walk, so in-flight iteration over a chain snapshot never has to
//! account for a shifted index. Emptied slots are compacted out the next
//! time a helper is registered.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use bytes::BytesMut;

/// What a single helper handler did with the event it was given.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// This helper didn't act; the walk continues to the next helper (or,
    /// if none remain, falls through to the connection's own callback).
    NotHandled,
    /// This helper consumed the event; the walk stops here.
    Handled,
    /// This helper failed. For `send` this is returned to the caller
    /// without closing the connection; for `establish`/`recv` it closes
    /// the connection (see connection.rs).
    Error(io::Error),
}

type EstablishHandler = Box<dyn FnMut(bool) -> HandlerOutcome>;
type SendHandler = Box<dyn FnMut(&mut BytesMut) -> HandlerOutcome>;
/// `latch` starts `false`; the handler may set it `true` to promote the
/// stream to established from this point in the chain onward (see
/// `Connection`'s readable-edge walk).
type RecvHandler = Box<dyn FnMut(&mut BytesMut, &mut bool) -> HandlerOutcome>;

/// One entry in the chain. Any subset of the three handlers may be
/// provided; an absent handler behaves as the spec's default — not
/// handled, no error — without needing to materialize a no-op closure.
pub(crate) struct HelperSlot {
    pub(crate) establish: Option<EstablishHandler>,
    pub(crate) send: Option<SendHandler>,
    pub(crate) recv: Option<RecvHandler>,
}

/// A registration handle returned by [`crate::Connection::register_helper`].
/// Dropping or explicitly destroying it removes the helper from its
/// connection's chain. Safe to destroy at any time except from inside a
/// handler belonging to the same entry.
pub(crate) type HelperCell = Rc<RefCell<Option<HelperSlot>>>;

pub(crate) fn new_cell(slot: HelperSlot) -> HelperCell {
    Rc::new(RefCell::new(Some(slot)))
}

/// Handle returned to callers registering a helper.
pub struct HelperHandle {
    pub(crate) cell: HelperCell,
}

impl HelperHandle {
    /// Remove this helper from its connection's chain. A no-op if already
    /// destroyed.
    pub fn destroy(&self) {
        self.cell.borrow_mut().take();
    }
}

impl fmt::Debug for HelperHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperHandle")
            .field("registered", &self.cell.borrow().is_some())
            .finish()
    }
}

/// Builder for the three optional handlers passed to
/// [`crate::Connection::register_helper`].
#[derive(Default)]
pub struct HelperHandlers {
    pub(crate) establish: Option<EstablishHandler>,
    pub(crate) send: Option<SendHandler>,
    pub(crate) recv: Option<RecvHandler>,
}

impl HelperHandlers {
    pub fn new() -> HelperHandlers {
        HelperHandlers::default()
    }

    pub fn on_establish<F>(mut self, f: F) -> Self
    where
        F: FnMut(bool) -> HandlerOutcome + 'static,
    {
        self.establish = Some(Box::new(f));
        self
    }

    pub fn on_send<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut BytesMut) -> HandlerOutcome + 'static,
    {
        self.send = Some(Box::new(f));
        self
    }

    pub fn on_recv<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut BytesMut, &mut bool) -> HandlerOutcome + 'static,
    {
        self.recv = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for HelperHandlers {
    /// Closures aren't `Debug`; report which handlers are set instead of
    /// their contents.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperHandlers")
            .field("establish", &self.establish.is_some())
            .field("send", &self.send.is_some())
            .field("recv", &self.recv.is_some())
            .finish()
    }
}
