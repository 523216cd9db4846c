//! Connection management and name-based routing for the procbus bus.
//!
//! Modules register under a logical name; calls are addressed by name, not
//! by connection. The [`RouteTable`] maps each name to either a pool of
//! directly-registered connections (load-balanced round-robin) or a relay
//! connection that advertised the name as reachable. The [`Bus`] dispatches
//! every decoded inbound frame: registrations mutate the table, application
//! frames are forwarded to whichever connection currently serves the target
//! name, and unknown targets get a synthesized error response instead of a
//! hang.
//!
//! The core never touches a socket: a [`Connection`] talks to its transport
//! through two injected capabilities, "write these bytes now" and "schedule
//! a writability callback". The [`stream`] module supplies that glue for
//! blocking Unix sockets.

pub mod announce;
pub mod connection;
pub mod dispatch;
pub mod error;
#[cfg(unix)]
pub mod stream;
pub mod table;

pub use announce::{MethodSet, RouteAck, RouteAnnouncement, METHODS_ADVERTISE, METHODS_QUERY};
pub use connection::{Connection, Identity, TransportSend, TransportWake};
pub use dispatch::{Bus, BusConfig};
pub use error::{BusError, Result};
#[cfg(unix)]
pub use stream::{attach_stream, connect, ConnectionHandle};
pub use table::RouteTable;

/// Recover the guard from a poisoned mutex.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
