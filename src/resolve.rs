//! Address resolver front-end (component G).
//!
//! Turns a bind hint or peer address into the ordered sequence of candidate
//! `SocketAddr`s the connect/bind/listen loops try in turn. This wraps
//! [`std::net::ToSocketAddrs`], which already implements exactly the
//! contract spec.md describes for the external resolver: given a numeric
//! host and port (or a hostname), yield zero or more candidate addresses in
//! order.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error;

/// Resolve `addr` into an ordered, materialized list of candidates. An
/// empty result (a resolver that yields nothing) is turned into
/// [`error::address_not_available`], matching spec.md's "resolution
/// produced no candidates" failure mode.
pub(crate) fn candidates<A: ToSocketAddrs>(addr: A) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        Err(error::address_not_available())
    } else {
        Ok(addrs)
    }
}

/// Candidates for an absent local bind hint ("any"): the wildcard address
/// for both address families, so a listener not pinned to a family can
/// still be created on whichever family the kernel supports first.
pub(crate) fn wildcard_candidates(port: u16) -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port),
        SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port),
    ]
}
