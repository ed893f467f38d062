//! Buffered TCP connection driven by the reactor.
//!
//! A connection is an event object whose read handler accumulates bytes and
//! feeds them to the user's message callback, and whose write handler
//! flushes the output buffer. All state mutation happens on the owning
//! loop's thread; off-thread callers close through `active_close`.

use std::any::Any;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::event::{EventObject, Events, ObjectId};
use crate::event_loop::EventLoop;
use crate::net::config::TcpOptions;
use crate::net::{
    make_sockaddr, ConnFailCallback, DisconnectCallback, MessageCallback, NewConnCallback,
};
use crate::reactor::TimerId;

/// Idle supervision granularity; the actual precision of idle timeouts.
const IDLE_CHECK_PERIOD: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    None,
    Connecting,
    Connected,
    /// Unrecoverable, but was connected before.
    Disconnected,
    /// Unrecoverable and never connected.
    Failed,
}

struct Inner {
    state: State,
    stream: Option<TcpStream>,
    /// Interest currently installed with the reactor.
    watching: Events,
    input: BytesMut,
    output: BytesMut,
    scratch: Box<[u8]>,
    peer_addr: Option<SocketAddr>,
    on_new_conn: Option<NewConnCallback>,
    on_message: Option<MessageCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_fail: Option<ConnFailCallback>,
    idle_timer: TimerId,
    idle_timeout: Duration,
    last_active: Instant,
    context: Option<Arc<dyn Any + Send + Sync>>,
}

enum SendOutcome {
    Watch(Events),
    Broken,
}

pub struct TcpConnection {
    event_loop: EventLoop,
    me: Weak<TcpConnection>,
    id: ObjectId,
    inner: Mutex<Inner>,
}

impl TcpConnection {
    pub fn new(event_loop: &EventLoop) -> Arc<TcpConnection> {
        Self::with_options(event_loop, &TcpOptions::default())
    }

    pub fn with_options(event_loop: &EventLoop, options: &TcpOptions) -> Arc<TcpConnection> {
        Arc::new_cyclic(|me| TcpConnection {
            event_loop: event_loop.clone(),
            me: me.clone(),
            id: ObjectId::new(),
            inner: Mutex::new(Inner {
                state: State::None,
                stream: None,
                watching: Events::NONE,
                input: BytesMut::new(),
                output: BytesMut::new(),
                scratch: vec![0u8; options.read_buffer_size].into_boxed_slice(),
                peer_addr: None,
                on_new_conn: None,
                on_message: None,
                on_disconnect: None,
                on_fail: None,
                idle_timer: -1,
                idle_timeout: Duration::ZERO,
                last_active: Instant::now(),
                context: None,
            }),
        })
    }

    pub fn set_new_conn_callback(&self, cb: NewConnCallback) {
        self.inner.lock().unwrap().on_new_conn = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.lock().unwrap().on_message = Some(cb);
    }

    pub fn set_on_disconnect(&self, cb: DisconnectCallback) {
        self.inner.lock().unwrap().on_disconnect = Some(cb);
    }

    pub fn set_fail_callback(&self, cb: ConnFailCallback) {
        self.inner.lock().unwrap().on_fail = Some(cb);
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().peer_addr
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().state == State::Connected
    }

    /// Adopt an already-connected descriptor from the accept path and run
    /// the connected transition.
    pub(crate) fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        assert!(self.event_loop.in_this_loop());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stream = Some(stream);
            inner.peer_addr = Some(peer);
        }
        self.handle_connect();
    }

    /// Start a non-blocking connect to `ip:port`. The outcome arrives
    /// through the new-connection or fail callback.
    pub fn connect(self: &Arc<Self>, ip: &str, port: u16) -> bool {
        assert!(
            self.event_loop.in_this_loop(),
            "connect must run on the loop thread"
        );

        let Some(addr) = make_sockaddr(ip, port) else {
            error!("connect with invalid address {ip}:{port}");
            return false;
        };
        if self.inner.lock().unwrap().state != State::None {
            error!("repeat connect tcp socket to {ip}:{port}");
            return false;
        }

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to start connect to {ip}:{port}: {e}");
                return false;
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.stream = Some(stream);
            inner.peer_addr = Some(addr);
            inner.watching = Events::WRITE;
        }
        // Writability reports the connect outcome.
        if !self
            .event_loop
            .register(self.clone() as Arc<dyn EventObject>, Events::WRITE)
        {
            error!("failed to add connection to loop, peer {ip}:{port}");
            self.inner.lock().unwrap().stream = None;
            return false;
        }
        self.inner.lock().unwrap().state = State::Connecting;

        info!(
            "in loop {}, trying to connect to {ip}:{port}",
            self.event_loop.name()
        );
        true
    }

    /// Queue `data` for delivery. Fire-and-forget: the reactor drains the
    /// output buffer as the socket accepts it. Returns false when the
    /// connection is not in the connected state.
    pub fn send(&self, data: &[u8]) -> bool {
        self.send_vectored(&[IoSlice::new(data)])
    }

    /// Vectored variant of [`TcpConnection::send`] with the same contract.
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> bool {
        assert!(
            self.event_loop.in_this_loop(),
            "send must run on the loop thread"
        );

        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connected {
                error!("send tcp data in wrong state {:?}", inner.state);
                return false;
            }
            if bufs.iter().all(|b| b.is_empty()) {
                return true;
            }
            for buf in bufs {
                inner.output.extend_from_slice(buf);
            }
            match flush_output(&mut inner) {
                Ok(()) => {
                    if inner.output.is_empty() {
                        SendOutcome::Watch(Events::READ)
                    } else {
                        SendOutcome::Watch(Events::READ | Events::WRITE)
                    }
                }
                Err(e) => {
                    debug!("flush on send failed: {e}");
                    SendOutcome::Broken
                }
            }
        };

        match outcome {
            SendOutcome::Watch(events) => self.update_interest(events),
            SendOutcome::Broken => {
                if let Some(me) = self.me.upgrade() {
                    me.handle_disconnect();
                }
            }
        }
        // The bytes were accepted either way; failures surface through the
        // disconnect callback.
        true
    }

    /// Close from any thread. With `sync` the call blocks until the
    /// disconnect transition completed on the loop thread.
    pub fn active_close(&self, sync: bool) {
        // Weak so a queued close never prolongs the connection's life.
        let weak = self.me.clone();
        let destroy = move || {
            if let Some(conn) = weak.upgrade() {
                if conn.connected() {
                    conn.handle_disconnect();
                }
            }
        };

        if self.event_loop.in_this_loop() {
            destroy();
        } else {
            let handle = self.event_loop.execute(destroy);
            if sync {
                let _ = handle.wait();
            }
        }
    }

    /// Close the connection once no traffic arrived for `timeout`.
    /// Precision is the 100 ms supervision period; re-setting the timeout
    /// replaces the previous supervisor.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }

        let old = {
            let mut inner = self.inner.lock().unwrap();
            inner.idle_timeout = timeout;
            inner.last_active = Instant::now();
            let old = inner.idle_timer;
            inner.idle_timer = -1;
            old
        };
        if old != -1 {
            self.event_loop.cancel(old);
        }

        let weak = self.me.clone();
        let id = self
            .event_loop
            .schedule_repeatedly(IDLE_CHECK_PERIOD, move || {
                let Some(conn) = weak.upgrade() else {
                    return; // connection already gone
                };
                if conn.idle_expired() {
                    conn.active_close(false);
                }
            });
        self.inner.lock().unwrap().idle_timer = id;
    }

    pub fn set_nodelay(&self, enable: bool) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.stream.as_ref() {
            Some(stream) => stream.set_nodelay(enable).is_ok(),
            None => false,
        }
    }

    /// Attach an opaque user value; the runtime never inspects it.
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().unwrap().context = Some(ctx);
    }

    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let ctx = self.inner.lock().unwrap().context.clone()?;
        ctx.downcast::<T>().ok()
    }

    fn idle_expired(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.state != State::Connected {
            return false;
        }
        let elapsed = inner.last_active.elapsed();
        if elapsed >= inner.idle_timeout {
            warn!(
                "connection to {:?} idle for {:?}, limit {:?}",
                inner.peer_addr, elapsed, inner.idle_timeout
            );
            true
        } else {
            false
        }
    }

    fn update_interest(&self, events: Events) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.watching == events {
                false
            } else {
                inner.watching = events;
                true
            }
        };
        if changed {
            self.event_loop.modify(self, events);
        }
    }

    fn handle_connect(self: &Arc<Self>) {
        assert!(self.event_loop.in_this_loop());

        let (peer, on_new_conn) = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(matches!(inner.state, State::None | State::Connecting));
            inner.state = State::Connected;
            inner.watching = Events::READ;
            inner.last_active = Instant::now();
            (inner.peer_addr, inner.on_new_conn.clone())
        };
        info!("connected with {:?}", peer);

        if self.unique_id() == -1 {
            // Accept path: first registration.
            if !self
                .event_loop
                .register(self.clone() as Arc<dyn EventObject>, Events::READ)
            {
                error!("failed to add accepted connection to loop, peer {:?}", peer);
                self.inner.lock().unwrap().state = State::Disconnected;
                return;
            }
        } else {
            // Connect path: swap the connect watch for readability.
            self.event_loop.modify(&**self, Events::READ);
        }

        if let Some(cb) = on_new_conn {
            cb(self);
        }
    }

    fn handle_connect_failed(self: &Arc<Self>) {
        assert!(self.event_loop.in_this_loop());

        let (peer, on_fail) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connecting {
                return;
            }
            inner.state = State::Failed;
            (inner.peer_addr, inner.on_fail.clone())
        };
        error!("failed to connect to {:?}", peer);

        if let (Some(cb), Some(peer)) = (on_fail, peer) {
            cb(&self.event_loop, &peer.ip().to_string(), peer.port());
        }
        // The descriptor stays open until the reactor released its watch.
        self.event_loop.unregister(&**self);
        self.inner.lock().unwrap().stream = None;
    }

    pub(crate) fn handle_disconnect(self: &Arc<Self>) {
        assert!(self.event_loop.in_this_loop());

        let (idle_timer, on_disconnect) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connected {
                return;
            }
            inner.state = State::Disconnected;
            let timer = inner.idle_timer;
            inner.idle_timer = -1;
            (timer, inner.on_disconnect.clone())
        };

        if idle_timer != -1 {
            self.event_loop.cancel(idle_timer);
        }
        if let Some(cb) = on_disconnect {
            cb(self);
        }
        self.event_loop.unregister(&**self);
        // Dropping the stream closes the descriptor.
        self.inner.lock().unwrap().stream = None;
    }
}

fn flush_output(inner: &mut Inner) -> io::Result<()> {
    let Inner { stream, output, .. } = inner;
    let Some(stream) = stream.as_mut() else {
        return Ok(());
    };
    while !output.is_empty() {
        match stream.write(output) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => output.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl EventObject for TcpConnection {
    fn fd(&self) -> RawFd {
        match self.inner.lock().unwrap().stream.as_ref() {
            Some(stream) => stream.as_raw_fd(),
            None => -1,
        }
    }

    fn unique_id(&self) -> i32 {
        self.id.get()
    }

    fn set_unique_id(&self, id: i32) {
        self.id.set(id);
    }

    fn handle_read(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };

        let mut eof = false;
        let (taken, on_message) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connected {
                return true; // stale readiness after a transition
            }
            {
                let Inner {
                    stream,
                    scratch,
                    input,
                    ..
                } = &mut *inner;
                let Some(stream) = stream.as_mut() else {
                    return true;
                };
                loop {
                    match stream.read(scratch) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => input.extend_from_slice(&scratch[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("read failed: {e}");
                            return false;
                        }
                    }
                }
            }
            if inner.idle_timer != -1 {
                inner.last_active = Instant::now();
            }
            if inner.input.is_empty() || inner.on_message.is_none() {
                (BytesMut::new(), None)
            } else {
                (std::mem::take(&mut inner.input), inner.on_message.clone())
            }
        };

        // The consume loop runs with the connection unlocked so the
        // callback can send, close, or re-enter the loop.
        let mut fatal = false;
        if let Some(on_message) = on_message {
            let mut data = taken;
            let mut total = 0usize;
            while total < data.len() {
                let consumed = on_message(&me, &data[total..]);
                if consumed > 0 {
                    total += (consumed as usize).min(data.len() - total);
                } else {
                    fatal = consumed < 0;
                    break;
                }
                if !me.connected() {
                    break; // the callback closed the connection
                }
            }
            data.advance(total);
            let mut inner = self.inner.lock().unwrap();
            inner.input = data;
        }

        if fatal || eof {
            me.handle_disconnect();
        }
        true
    }

    fn handle_write(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };

        enum Outcome {
            ConnectOk,
            ConnectFail,
            Watch(Events),
            Broken,
            Nothing,
        }

        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Connecting => match inner.stream.as_ref() {
                    Some(stream) => match stream.take_error() {
                        Ok(Some(_)) | Err(_) => Outcome::ConnectFail,
                        Ok(None) => match stream.peer_addr() {
                            Ok(_) => Outcome::ConnectOk,
                            Err(ref e)
                                if e.kind() == io::ErrorKind::NotConnected
                                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                            {
                                Outcome::Nothing // still in progress
                            }
                            Err(_) => Outcome::ConnectFail,
                        },
                    },
                    None => Outcome::Nothing,
                },
                State::Connected => match flush_output(&mut inner) {
                    Ok(()) => {
                        if inner.output.is_empty() {
                            Outcome::Watch(Events::READ)
                        } else {
                            Outcome::Watch(Events::READ | Events::WRITE)
                        }
                    }
                    Err(e) => {
                        debug!("flush failed: {e}");
                        Outcome::Broken
                    }
                },
                _ => Outcome::Nothing,
            }
        };

        match outcome {
            Outcome::ConnectOk => {
                me.handle_connect();
                true
            }
            Outcome::ConnectFail => {
                me.handle_connect_failed();
                true
            }
            Outcome::Watch(events) => {
                me.update_interest(events);
                true
            }
            Outcome::Broken => false,
            Outcome::Nothing => true,
        }
    }

    fn handle_error(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let state = me.inner.lock().unwrap().state;
        match state {
            State::Connecting => me.handle_connect_failed(),
            State::Connected => me.handle_disconnect(),
            _ => {}
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if inner.idle_timer != -1 {
            self.event_loop.cancel(inner.idle_timer);
        }
        if let Some(stream) = inner.stream.take() {
            info!("close tcp fd {}", stream.as_raw_fd());
        }
    }
}
