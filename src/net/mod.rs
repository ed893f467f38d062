//! Callback-driven TCP on top of the event loop.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       User code                            │
//! │   on_new_conn / on_message / on_disconnect / on_fail       │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ callbacks                 │ listen/connect/send
//!                │                           ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  TcpListener ──accept──▶ TcpConnection (buffered stream)   │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ register / modify / timers
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │            EventLoop ──▶ Reactor ──▶ OS readiness          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The runtime never interprets bytes. A connection feeds every received
//! batch to the user's message callback, which returns how many bytes it
//! consumed; framing is entirely the caller's concern.

pub mod config;
pub mod connection;
pub mod listener;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use connection::TcpConnection;

/// Invoked once a connection reaches the connected state, from `accept` or
/// `connect` alike.
pub type NewConnCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Invoked with every received batch; returns bytes consumed, 0 to wait for
/// more data, or a negative value to fail the connection.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &[u8]) -> isize + Send + Sync>;

/// Invoked exactly once when a connection that reached the connected state
/// goes away, whether by peer reset, framing failure, or active close.
pub type DisconnectCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Invoked exactly once when an outbound connection never reached the
/// connected state.
pub type ConnFailCallback = Arc<dyn Fn(&EventLoop, &str, u16) + Send + Sync>;

/// Chooses the loop that should own a newly accepted connection.
pub type LoopSelector = Arc<dyn Fn() -> EventLoop + Send + Sync>;

pub(crate) fn make_sockaddr(ip: &str, port: u16) -> Option<SocketAddr> {
    ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_sockaddr() {
        let addr = make_sockaddr("127.0.0.1", 7379).unwrap();
        assert_eq!(addr.port(), 7379);
        assert!(addr.ip().is_loopback());
        assert!(make_sockaddr("not-an-ip", 80).is_none());
    }
}
