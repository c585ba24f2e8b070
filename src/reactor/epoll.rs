use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use std::{io, mem};

use log::{error, trace};

use crate::reactor::{Interest, Readiness};

/// Registrations are kept behind their own `Rc<RefCell<_>>` so a callback
/// can be pulled out, invoked without an active borrow of the whole map (a
/// helper calling back into `Connection::send` from its own handler must
/// not trip a double borrow), and put back afterwards.
struct Registration {
    interest: Interest,
    callback: Box<dyn FnMut(Readiness)>,
}

const EVENTS_CAP: usize = 128;

pub(crate) struct Selector {
    epfd: RawFd,
    registrations: RefCell<HashMap<RawFd, Rc<RefCell<Registration>>>>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Selector {
                epfd,
                registrations: RefCell::new(HashMap::new()),
            })
        }
    }

    pub(crate) fn epfd(&self) -> RawFd {
        self.epfd
    }

    pub(crate) fn set(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: Box<dyn FnMut(Readiness)>,
    ) -> io::Result<()> {
        let op = if self.registrations.borrow().contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let mut event = to_epoll_event(fd, interest);
        epoll_ctl(self.epfd, op, fd, &mut event)?;

        self.registrations.borrow_mut().insert(
            fd,
            Rc::new(RefCell::new(Registration { interest, callback })),
        );
        trace!("registered fd={} interest={:?}", fd, interest);
        Ok(())
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        if self
            .registrations
            .borrow_mut()
            .remove(&fd)
            .is_some()
        {
            // EBADF/ENOENT here just mean the descriptor is already gone
            // (closed out from under us); unregister is documented
            // idempotent so we don't propagate the error.
            let _ = epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            trace!("unregistered fd={}", fd);
        }
    }

    pub(crate) fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut ep_events: [libc::epoll_event; EVENTS_CAP] =
            unsafe { mem::zeroed() };
        let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                ep_events.as_mut_ptr(),
                EVENTS_CAP as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // Collect (fd, readiness) first: dispatching below may register,
        // reregister, or unregister descriptors, which must not disturb
        // this batch.
        let fired: Vec<(RawFd, Readiness)> = ep_events[..n as usize]
            .iter()
            .map(|e| (e.u64 as RawFd, to_readiness(e.events)))
            .collect();

        let mut dispatched = 0;
        for (fd, readiness) in fired {
            let slot = self.registrations.borrow().get(&fd).cloned();
            let slot = match slot {
                Some(slot) => slot,
                // Already unregistered earlier in this same batch.
                None => continue,
            };
            let mut callback = match slot.try_borrow_mut() {
                Ok(c) => c,
                // Re-entrant epoll_wait for the same descriptor inside one
                // turn shouldn't happen; be defensive rather than panic.
                Err(_) => continue,
            };
            (callback.callback)(readiness);
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

fn to_epoll_event(fd: RawFd, interest: Interest) -> libc::epoll_event {
    let mut events = 0u32;
    if interest.readable {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.writable {
        events |= libc::EPOLLOUT as u32;
    }
    if interest.exception {
        events |= (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
    }
    // EPOLLERR and EPOLLHUP are always reported regardless of interest, but
    // being explicit keeps the mapping to `Readiness` obvious.
    events |= (libc::EPOLLERR | libc::EPOLLHUP) as u32;

    libc::epoll_event {
        events,
        u64: fd as u64,
    }
}

fn to_readiness(events: u32) -> Readiness {
    Readiness {
        readable: events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
        writable: events & libc::EPOLLOUT as u32 != 0,
        exception: events
            & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32
            != 0,
    }
}

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add((duration.subsec_nanos() as u64 / NANOS_PER_MILLI) + 1);
    std::cmp::min(millis, libc::c_int::max_value() as u64) as libc::c_int
}

fn epoll_ctl(
    epfd: RawFd,
    op: libc::c_int,
    fd: RawFd,
    event: *mut libc::epoll_event,
) -> io::Result<()> {
    if unsafe { libc::epoll_ctl(epfd, op, fd, event) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            let err = io::Error::last_os_error();
            error!("error closing epoll instance: {}", err);
        }
    }
}
