//! A non-blocking TCP connection engine with a pluggable helper chain, for
//! embedding in event-driven I/O frameworks.
//!
//! # Goals
//!
//! * A single-threaded, cooperative, event-driven engine: no background
//!   threads, no implicit blocking.
//! * A descriptor-exclusive [`Connection`]/[`ListeningSocket`] pair, with
//!   the TCP state machine (connect, establish, send backpressure, close)
//!   handled once so callers don't reimplement it per protocol.
//! * A [helper chain](helper) that lets protocol layers — TLS, a framing
//!   codec, a debug tap — intercept or transform bytes in either direction
//!   without the engine knowing their type.
//!
//! # Usage
//!
//! Everything in this crate runs against one [`Reactor`], a thin
//! `epoll`-backed event loop. A typical program creates a `Reactor`,
//! builds a [`ListeningSocket`] or [`Connection`] against it, and drives
//! progress by calling [`Reactor::turn`] in a loop.
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use wharf::{ConnHandlers, Connection, Reactor};
//!
//! # fn main() -> std::io::Result<()> {
//! let reactor = Rc::new(Reactor::new()?);
//!
//! let handlers = ConnHandlers::new()
//!     .on_established(|conn| println!("connected: {:?}", conn.peer_address()))
//!     .on_recv(|_conn, buf| println!("received {} bytes", buf.len()))
//!     .on_closed(|_conn, err| println!("closed: {:?}", err));
//!
//! let conn = Connection::allocate("example.com:80", reactor.clone(), handlers)?;
//! conn.connect("example.com:80")?;
//!
//! loop {
//!     reactor.turn(Some(Duration::from_millis(100)))?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Undefined behaviour
//!
//! [`Reactor`], [`Connection`] and [`ListeningSocket`] are `Rc`-backed and
//! implement neither [`Sync`] nor [`Send`]; sharing them across threads
//! will not compile, and running more than one `Reactor` against the same
//! descriptor at once is unsupported.

#![warn(
    bare_trait_objects,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod connection;
mod error;
mod helper;
mod listener;
mod reactor;
mod resolve;
mod sendqueue;
mod socket;

pub use crate::connection::{ConnHandlers, Connection};
pub use crate::error::{address_not_available, bad_descriptor, invalid_argument};
pub use crate::helper::{HandlerOutcome, HelperHandle, HelperHandlers};
pub use crate::listener::ListeningSocket;
pub use crate::reactor::Reactor;

/// Buffer type used throughout the crate: [`bytes::BytesMut`] for buffers a
/// helper or the engine still mutates (recv chunks, outgoing sends before
/// framing), [`bytes::Bytes`] once a buffer is frozen into the send queue.
pub use bytes::{Bytes, BytesMut};
