//! A graceful-restart daemon substrate.
//!
//! Embed this crate in a long-running network service to bind TCP
//! listeners declared by command-line flags, drain in-flight connections
//! on request, and hand listening sockets to a freshly exec'd successor
//! process without dropping an accepted connection or rejecting an
//! incoming SYN.
//!
//! The pieces, leaf first:
//! - [`log`]: a leveled log sink with file fan-out and stack-dump-on-fatal.
//! - [`listener`]: [`listener::TrackedListener`], a `TcpListener` wrapper
//!   that counts live connections and can be stopped out from under a
//!   blocked `accept`.
//! - [`flag`]: [`flag::ListenerFlag`] and [`flag::FlagRegistry`], the
//!   bind-or-adopt command-line grammar.
//! - [`lifecycle`]: [`lifecycle::Lifecycle`], `Shutdown`/`Restart`.
//! - [`signal`]: [`signal::SignalController`], the signal-driven loop that
//!   drives the process through one of those two operations.

pub mod error;
pub mod flag;
pub mod lifecycle;
pub mod listener;
pub mod log;
pub mod signal;

pub use error::{GracefulError, Result};
pub use flag::{Family, FlagRegistry, ListenerFlag, PlainFlag};
pub use lifecycle::{Lifecycle, DEFAULT_LAME_DUCK};
pub use listener::{TrackedConnection, TrackedListener};
pub use log::{init_tracing, Level, Sink};
pub use signal::SignalController;
