//! The poller adapter (component A): register/reregister/unregister
//! interest in readable/writable/exception events for a descriptor, and
//! deliver a single combined callback per event.
//!
//! This is the concrete stand-in for the `fd_listen`/`fd_close` pair
//! spec.md calls out as an external collaborator. It carries no connection
//! or protocol state; `Connection` and `ListeningSocket` are the only
//! callers.

mod epoll;

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) use self::epoll::Selector;

/// The subset of {readable, writable, exception} a registration is
/// interested in.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub(crate) struct Interest {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) exception: bool,
}

impl Interest {
    pub(crate) const READABLE: Interest = Interest {
        readable: true,
        writable: false,
        exception: false,
    };
    pub(crate) const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
        exception: false,
    };
    pub(crate) const EXCEPTION: Interest = Interest {
        readable: false,
        writable: false,
        exception: true,
    };
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            readable: self.readable || rhs.readable,
            writable: self.writable || rhs.writable,
            exception: self.exception || rhs.exception,
        }
    }
}

/// The bitmask of events that fired, delivered to a registration's
/// callback.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) exception: bool,
}

/// A single-threaded, callback-dispatching event loop backed by the OS
/// selector (`epoll` on Linux).
///
/// Registration is internal: applications don't register raw descriptors
/// themselves, only [`crate::Connection`] and [`crate::ListeningSocket`]
/// do, on their own behalf. The public surface is just enough to own and
/// drive the loop.
pub struct Reactor {
    selector: Selector,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.selector.epfd())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Selector::new().map(|selector| Reactor { selector })
    }

    /// Register (or, if `fd` is already registered, atomically replace the
    /// mask and callback for) interest in `interest` on `fd`. The callback
    /// receives the readiness bitmask that fired.
    pub(crate) fn register<F>(&self, fd: RawFd, interest: Interest, callback: F) -> io::Result<()>
    where
        F: FnMut(Readiness) + 'static,
    {
        self.selector.set(fd, interest, Box::new(callback))
    }

    /// Idempotent: unregistering a descriptor that was never registered, or
    /// was already unregistered, is not an error.
    pub(crate) fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.selector.remove(fd);
        Ok(())
    }

    /// Run one iteration of the event loop: block for up to `timeout`
    /// (`None` blocks indefinitely), then dispatch every descriptor that
    /// became ready to its callback. Returns the number of descriptors
    /// dispatched.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        self.selector.turn(timeout)
    }
}
