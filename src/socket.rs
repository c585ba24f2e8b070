//! Raw non-blocking socket primitives.
//!
//! This is the engine's "external collaborator" layer: socket creation,
//! non-blocking mode, `SO_REUSEADDR`/zero-`SO_LINGER`, and the `SO_ERROR`
//! query the state machine consults on every I/O event. Nothing here knows
//! about connections, helpers, or send queues.

use std::io;
use std::mem::{size_of, size_of_val};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use crate::error;

/// Create a non-blocking `SOCK_STREAM` socket for the address family of
/// `addr`. The descriptor is otherwise unconfigured.
pub(crate) fn new_nonblocking_stream(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(error::os_error());
    }

    if let Err(err) = set_nonblocking(fd) {
        close_raw(fd);
        return Err(err);
    }

    Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(error::os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(error::os_error());
    }
    Ok(())
}

/// Enable `SO_REUSEADDR`, used by both listening sockets and bound
/// connections before binding.
pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)
}

/// Set `SO_LINGER` with `l_onoff=1, l_linger=0`: a `close` on this
/// descriptor sends RST instead of going through the usual FIN/lingering
/// teardown. Applied to every connection descriptor, active or passive.
pub(crate) fn set_linger0(fd: RawFd) -> io::Result<()> {
    let l = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let err = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &l as *const _ as *const libc::c_void,
            size_of_val(&l) as libc::socklen_t,
        )
    };
    if err == -1 {
        Err(error::os_error())
    } else {
        Ok(())
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let err = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &enable as *const _ as *const libc::c_void,
            size_of_val(&enable) as libc::socklen_t,
        )
    };
    if err == -1 {
        Err(error::os_error())
    } else {
        Ok(())
    }
}

/// Query and clear `SO_ERROR`. Every I/O event handler calls this first,
/// per spec.
pub(crate) fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut errno: libc::c_int = 0;
    let mut len = size_of_val(&errno) as libc::socklen_t;
    let err = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if err == -1 {
        Err(error::os_error())
    } else {
        Ok(errno)
    }
}

/// Cast a `std::net::SocketAddr` to the `(*const sockaddr, socklen_t)` pair
/// the raw syscalls want. Safe because `SocketAddrV4`/`SocketAddrV6` share
/// layout with `sockaddr_in`/`sockaddr_in6` on every unix target, same as
/// the standard library's own internal helper.
fn raw_addr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (
            a as *const SocketAddrV4 as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ),
        SocketAddr::V6(a) => (
            a as *const SocketAddrV6 as *const libc::sockaddr,
            size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        ),
    }
}

pub(crate) fn bind_raw(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (sa, len) = raw_addr(addr);
    if unsafe { libc::bind(fd, sa, len) } == -1 {
        Err(error::os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn listen_raw(fd: RawFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } == -1 {
        Err(error::os_error())
    } else {
        Ok(())
    }
}

/// One non-blocking connect attempt. `EINPROGRESS`/`EALREADY` (and the
/// Windows `WSAEWOULDBLOCK` equivalent on this platform, would-block) are
/// folded into success: completion arrives via a writable event. `EINTR`
/// is left to the caller to retry, matching the spec's "interrupted
/// retries" rule.
pub(crate) fn connect_once(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (sa, len) = raw_addr(addr);
    if unsafe { libc::connect(fd, sa, len) } == -1 {
        let err = io::Error::last_os_error();
        if error::is_would_block(&err) || error::is_connect_in_progress(&err) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

pub(crate) fn close_raw(fd: RawFd) {
    if fd >= 0 {
        let _ = unsafe { libc::close(fd) };
    }
}

/// One non-blocking `accept`. Returns the new descriptor and the peer's
/// address; the new descriptor is left exactly as the kernel gave it
/// (blocking, no options set) — callers finish configuring it.
pub(crate) fn accept_raw(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let new_fd = unsafe {
        libc::accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if new_fd == -1 {
        return Err(error::os_error());
    }
    match storage_to_addr(&storage) {
        Ok(addr) => Ok((new_fd, addr)),
        Err(err) => {
            close_raw(new_fd);
            Err(err)
        }
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sa: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => Err(error::invalid_argument("unsupported address family")),
    }
}

pub(crate) fn getsockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) }
        == -1
    {
        return Err(error::os_error());
    }
    storage_to_addr(&storage)
}

pub(crate) fn getpeername(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) }
        == -1
    {
        return Err(error::os_error());
    }
    storage_to_addr(&storage)
}

/// One non-blocking `send`, with the platform's no-signal flag applied so a
/// broken pipe doesn't raise `SIGPIPE` at the call site.
pub(crate) fn send_once(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    const FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    const FLAGS: libc::c_int = 0;

    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            FLAGS,
        )
    };
    if n < 0 {
        Err(error::os_error())
    } else {
        Ok(n as usize)
    }
}

/// One non-blocking `recv`.
pub(crate) fn recv_once(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        Err(error::os_error())
    } else {
        Ok(n as usize)
    }
}
