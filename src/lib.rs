//! Sluice: a reactor-based network runtime.
//!
//! One event loop per thread multiplexes non-blocking socket I/O, timers,
//! and tasks posted from other threads. TCP listeners and connections sit
//! on top and carry user-defined byte-stream protocols through a
//! message-framing callback; the runtime itself never interprets bytes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{EventLoop, TcpConnection};
//!
//! let event_loop = EventLoop::new();
//! event_loop.listen(
//!     "127.0.0.1",
//!     7379,
//!     Arc::new(|conn: &Arc<TcpConnection>| {
//!         conn.set_message_callback(Arc::new(|conn: &Arc<TcpConnection>, data: &[u8]| {
//!             conn.send(data);
//!             data.len() as isize
//!         }));
//!     }),
//! );
//! event_loop.run();
//! ```

pub mod error;
pub mod event;
pub mod event_loop;
pub mod net;
mod notifier;
mod reactor;

pub use error::{Error, Result};
pub use event::{EventObject, Events, ObjectId};
pub use event_loop::{EventLoop, TaskHandle};
pub use net::config::TcpOptions;
pub use net::connection::TcpConnection;
pub use net::listener::TcpListener;
pub use net::{
    ConnFailCallback, DisconnectCallback, LoopSelector, MessageCallback, NewConnCallback,
};
pub use reactor::TimerId;
