//! Bound server socket accepting connections and routing them to a loop.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventObject, Events, ObjectId};
use crate::event_loop::EventLoop;
use crate::net::config::TcpOptions;
use crate::net::connection::TcpConnection;
use crate::net::{make_sockaddr, LoopSelector, NewConnCallback};

struct Inner {
    listener: Option<mio::net::TcpListener>,
    on_new_conn: Option<NewConnCallback>,
    selector: Option<LoopSelector>,
    options: TcpOptions,
}

pub struct TcpListener {
    event_loop: EventLoop,
    me: Weak<TcpListener>,
    id: ObjectId,
    inner: Mutex<Inner>,
}

impl TcpListener {
    pub fn new(event_loop: &EventLoop) -> Arc<TcpListener> {
        Arc::new_cyclic(|me| TcpListener {
            event_loop: event_loop.clone(),
            me: me.clone(),
            id: ObjectId::new(),
            inner: Mutex::new(Inner {
                listener: None,
                on_new_conn: None,
                selector: None,
                options: TcpOptions::default(),
            }),
        })
    }

    pub fn set_new_conn_callback(&self, cb: NewConnCallback) {
        self.inner.lock().unwrap().on_new_conn = Some(cb);
    }

    /// Install a hook choosing the loop that owns each accepted connection;
    /// without one, connections stay on the listener's loop.
    pub fn set_loop_selector(&self, selector: LoopSelector) {
        self.inner.lock().unwrap().selector = Some(selector);
    }

    pub fn set_options(&self, options: TcpOptions) {
        self.inner.lock().unwrap().options = options;
    }

    /// Bind to `ip:port` and start accepting. Must run on the loop thread.
    pub fn bind(self: &Arc<Self>, ip: &str, port: u16) -> Result<()> {
        assert!(
            self.event_loop.in_this_loop(),
            "bind must run on the loop thread"
        );

        let Some(addr) = make_sockaddr(ip, port) else {
            return Err(Error::InvalidAddress(format!("{ip}:{port}")));
        };
        let backlog = {
            let inner = self.inner.lock().unwrap();
            if inner.listener.is_some() {
                error!("repeat bind tcp socket to port {port}");
                return Err(Error::AlreadyBound);
            }
            inner.options.backlog
        };

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_cloexec(true)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        let listener = mio::net::TcpListener::from_std(socket.into());

        self.inner.lock().unwrap().listener = Some(listener);
        if !self
            .event_loop
            .register(self.clone() as Arc<dyn EventObject>, Events::READ)
        {
            error!("failed to add tcp listener to loop, port {port}");
            self.inner.lock().unwrap().listener = None;
            return Err(Error::WrongState("failed to add tcp listener to loop"));
        }

        info!("tcp listen on {ip}:{port}");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    fn select_loop(&self) -> EventLoop {
        let selector = self.inner.lock().unwrap().selector.clone();
        match selector {
            Some(selector) => selector(),
            None => self.event_loop.clone(),
        }
    }
}

fn apply_socket_options(stream: &TcpStream, options: &TcpOptions) {
    if let Err(e) = stream.set_nodelay(options.nodelay) {
        debug!("set TCP_NODELAY failed: {e}");
    }
    if let Some(interval) = options.keep_alive {
        let sock = socket2::SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(interval);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            debug!("set SO_KEEPALIVE failed: {e}");
        }
    }
}

impl EventObject for TcpListener {
    fn fd(&self) -> RawFd {
        match self.inner.lock().unwrap().listener.as_ref() {
            Some(listener) => listener.as_raw_fd(),
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

        loop {
            let accepted = {
                let inner = self.inner.lock().unwrap();
                let Some(listener) = inner.listener.as_ref() else {
                    return true;
                };
                listener.accept()
            };

            match accepted {
                Ok((stream, peer)) => {
                    let (cb, options) = {
                        let inner = self.inner.lock().unwrap();
                        (inner.on_new_conn.clone(), inner.options.clone())
                    };
                    let Some(cb) = cb else {
                        warn!("close new conn fd {} from {peer}", stream.as_raw_fd());
                        continue;
                    };
                    info!("new conn fd {} from {peer}", stream.as_raw_fd());

                    // Hand the descriptor to the owning loop; the closure
                    // builds and registers the connection over there.
                    let target = me.select_loop();
                    let conn_loop = target.clone();
                    target.execute(move || {
                        let conn = TcpConnection::with_options(&conn_loop, &options);
                        conn.set_new_conn_callback(cb);
                        apply_socket_options(&stream, &options);
                        conn.on_accept(stream, peer);
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => match e.raw_os_error() {
                    // Transient accept glitches: keep accepting.
                    Some(libc::EINTR | libc::ECONNABORTED | libc::EPROTO) => continue,
                    // Resource exhaustion: skip the rest of this readiness
                    // event, keep the listener alive.
                    Some(libc::EMFILE | libc::ENFILE) => {
                        error!("accept: not enough file descriptors: {e}");
                        break;
                    }
                    Some(libc::ENOBUFS | libc::ENOMEM) => {
                        error!("accept: not enough memory, socket buffer limits: {e}");
                        break;
                    }
                    _ => {
                        error!("BUG: accept failed: {e}");
                        debug_assert!(false, "unexpected accept errno");
                        break;
                    }
                },
            }
        }
        true
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if let Some(listener) = inner.listener.take() {
            info!("close tcp listener fd {}", listener.as_raw_fd());
        }
    }
}
