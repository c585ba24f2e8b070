//! Error taxonomy used throughout the engine.
//!
//! The engine does not define its own error enum; like the C library it is
//! grounded on, every fallible operation returns [`std::io::Result`]. What
//! differs across call sites is *which* [`io::ErrorKind`] (and, for OS
//! failures, which raw errno) comes back. The free functions here are the
//! single place that picks those kinds, so call sites stay self-documenting
//! instead of constructing `io::Error` ad hoc.

use std::io;

/// The buffer, argument, or connection handle given to an operation was not
/// usable (empty send buffer, connection never allocated, null peer address).
pub fn invalid_argument(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// The operation was attempted on a connection or socket whose descriptor is
/// already `-1` (closed or never assigned).
pub fn bad_descriptor() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "bad descriptor")
}

/// Address resolution produced no usable candidates, or every candidate
/// failed to bind/connect for a non-OS reason.
pub fn address_not_available() -> io::Error {
    io::Error::new(io::ErrorKind::AddrNotAvailable, "address not available")
}

/// Wrap the last OS error (`errno`/`GetLastError`) observed on a failing
/// candidate.
pub fn os_error() -> io::Error {
    io::Error::last_os_error()
}

/// `true` for the handful of errno values that mean "try the operation
/// again later", i.e. the non-blocking would-block family plus `EINTR` where
/// the caller chooses to retry rather than propagate.
pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// `true` for `EINPROGRESS`/`EALREADY`, the two errnos `connect(2)` returns
/// on a non-blocking socket to mean "completion will arrive via a writable
/// event", which the engine treats as success.
pub fn is_connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY)
    )
}

/// `true` for `EINTR`, which `connect(2)` alone is specified to retry.
pub fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Peer-closed is represented as `Ok(())` with an error code of zero passed
/// to `on_closed`, distinct from an OS error. This helper builds that
/// zero-value for call sites that need to pass "no error" through the same
/// `Option<io::Error>` shape used for real failures.
pub fn peer_closed() -> Option<io::Error> {
    None
}
