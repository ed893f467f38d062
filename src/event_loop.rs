//! Thread-affine event loop.
//!
//! Each OS thread hosts at most one loop. The loop owns a reactor, a
//! registry of live event objects, a mutex-guarded task inbox, and a
//! self-pipe notifier so other threads can wake it. Every mutation of the
//! registry, the reactor, or a connection happens on the loop's own thread;
//! cross-thread callers go through [`EventLoop::execute`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::event::{EventObject, Events};
use crate::net::connection::TcpConnection;
use crate::net::listener::TcpListener;
use crate::net::{ConnFailCallback, NewConnCallback};
use crate::notifier::{Notifier, NotifyReceiver};
use crate::reactor::{Reactor, TimerCallback, TimerId};

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

static OBJECT_ID_GENERATOR: AtomicI32 = AtomicI32::new(0);
static TIMER_ID_GENERATOR: AtomicI64 = AtomicI64::new(0);

type Task = Box<dyn FnOnce() + Send>;

/// Future side of a posted task.
///
/// `wait` blocks until the closure ran on the target loop and returns its
/// value, or `None` if the loop shut down and discarded the task.
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    fn fulfilled(value: T) -> TaskHandle<T> {
        let (sender, receiver) = mpsc::channel();
        let _ = sender.send(value);
        TaskHandle { receiver }
    }

    fn pending() -> (mpsc::Sender<T>, TaskHandle<T>) {
        let (sender, receiver) = mpsc::channel();
        (sender, TaskHandle { receiver })
    }

    pub fn wait(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_wait(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Timer ids handed out before their arming task reached the loop thread.
///
/// An off-thread `schedule_*` returns its id synchronously; a cancel racing
/// the arming task leaves a tombstone the arming task honors.
#[derive(Default)]
struct PendingTimers {
    arming: HashSet<TimerId>,
    tombstones: HashSet<TimerId>,
}

struct Core {
    reactor: Reactor,
    objects: HashMap<i32, Arc<dyn EventObject>>,
    notify_rx: Arc<NotifyReceiver>,
}

struct Shared {
    name: Mutex<String>,
    running: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    notifier: Mutex<Notifier>,
    pending: Mutex<PendingTimers>,
    core: Mutex<Core>,
}

/// Cloneable handle to a per-thread event loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// Panics if this thread already has one: a thread hosts at most one
    /// event loop for its whole lifetime.
    pub fn new() -> EventLoop {
        let (notifier, notify_rx) = Notifier::new().expect("create notifier pipe");
        let reactor = Reactor::new().expect("create reactor");

        let event_loop = EventLoop {
            shared: Arc::new(Shared {
                name: Mutex::new(String::new()),
                running: AtomicBool::new(true),
                tasks: Mutex::new(Vec::new()),
                notifier: Mutex::new(notifier),
                pending: Mutex::new(PendingTimers::default()),
                core: Mutex::new(Core {
                    reactor,
                    objects: HashMap::new(),
                    notify_rx: Arc::new(notify_rx),
                }),
            }),
        };

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "there must be only one EventLoop per thread"
            );
            *current = Some(event_loop.clone());
        });

        event_loop
    }

    /// The loop owned by the calling thread, if any.
    pub fn current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| current.borrow().clone())
    }

    /// Whether the calling thread is this loop's home thread.
    pub fn in_this_loop(&self) -> bool {
        CURRENT_LOOP.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|l| Arc::ptr_eq(&l.shared, &self.shared))
        })
    }

    pub fn set_name(&self, name: &str) {
        *self.shared.name.lock().unwrap() = name.to_string();
    }

    pub fn name(&self) -> String {
        self.shared.name.lock().unwrap().clone()
    }

    /// Drive the loop on the calling thread until [`EventLoop::stop`].
    ///
    /// Each iteration drains the task inbox (under a try-lock so a slow
    /// submitter never stalls the loop), then polls the reactor. On exit
    /// every object is unregistered and pending tasks are discarded.
    pub fn run(&self) {
        assert!(
            self.in_this_loop(),
            "EventLoop::run must be called on the loop's home thread"
        );

        #[cfg(target_os = "linux")]
        {
            let name = self.name();
            if !name.is_empty() {
                if let Ok(cname) = std::ffi::CString::new(name) {
                    unsafe {
                        libc::prctl(libc::PR_SET_NAME, cname.as_ptr());
                    }
                }
            }
        }

        let notify_rx = self.shared.core.lock().unwrap().notify_rx.clone();
        self.register(notify_rx, Events::READ);

        while self.shared.running.load(Ordering::Acquire) {
            if let Ok(mut guard) = self.shared.tasks.try_lock() {
                let tasks = std::mem::take(&mut *guard);
                drop(guard);
                for task in tasks {
                    task();
                }
            }

            if !self.poll_once() {
                error!("reactor poll failed");
            }
        }

        // Teardown: drop the registry and pending work outside the state
        // lock, since object destructors may call back into the loop.
        let (objects, cleared) = {
            let mut core = self.shared.core.lock().unwrap();
            let objects: Vec<_> = core.objects.drain().map(|(_, obj)| obj).collect();
            let cleared = core.reactor.clear();
            (objects, cleared)
        };
        let discarded = std::mem::take(&mut *self.shared.tasks.lock().unwrap());
        drop(discarded);
        drop(cleared);
        drop(objects);
    }

    /// Stop the loop from any thread. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notifier.lock().unwrap().notify();
    }

    fn poll_once(&self) -> bool {
        let ready = {
            let mut core = self.shared.core.lock().unwrap();
            match core.reactor.poll() {
                Ok(ready) => ready,
                Err(e) => {
                    drop(core);
                    error!("demultiplexer error: {e}");
                    return false;
                }
            }
        };

        // Handlers run with the state lock released so they can re-enter
        // register/modify/unregister/execute. Read is dispatched before
        // write; a false return routes through handle_error and ends
        // delivery for the object.
        for r in ready {
            let id = r.obj.unique_id();
            if r.readable && self.object_alive(id) && !r.obj.handle_read() {
                self.fail_object(&r.obj);
                continue;
            }
            if r.writable && self.object_alive(id) && !r.obj.handle_write() {
                self.fail_object(&r.obj);
            }
        }

        let due = {
            let mut core = self.shared.core.lock().unwrap();
            core.reactor.due_timers()
        };
        for timer in due {
            (timer.callback)();
            self.shared
                .core
                .lock()
                .unwrap()
                .reactor
                .finish_timer(timer.id);
        }

        true
    }

    fn object_alive(&self, id: i32) -> bool {
        self.shared.core.lock().unwrap().objects.contains_key(&id)
    }

    fn fail_object(&self, obj: &Arc<dyn EventObject>) {
        obj.handle_error();
        // The handler normally unregisters the object itself; sweep up if
        // it did not so no further events are delivered.
        let id = obj.unique_id();
        if id >= 0 && self.object_alive(id) {
            self.unregister(obj.as_ref());
        }
    }

    /// Run `f` on the loop thread.
    ///
    /// Called on the loop's own thread, `f` runs synchronously and the
    /// returned handle is already fulfilled. Otherwise `f` is appended to
    /// the task inbox and the loop is woken; tasks from one submitting
    /// thread run in submission order.
    pub fn execute<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.in_this_loop() {
            return TaskHandle::fulfilled(f());
        }

        let (sender, handle) = TaskHandle::pending();
        let task: Task = Box::new(move || {
            let _ = sender.send(f());
        });
        {
            self.shared.tasks.lock().unwrap().push(task);
        }
        self.shared.notifier.lock().unwrap().notify();
        handle
    }

    /// Run `f` once after `delay`. Thread-safe; the id is returned
    /// synchronously even off-thread.
    pub fn schedule_later<F>(&self, delay: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(delay, Arc::new(f), false)
    }

    /// Run `f` every `period` until cancelled. Thread-safe.
    pub fn schedule_repeatedly<F>(&self, period: Duration, f: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(period, Arc::new(f), true)
    }

    fn schedule(&self, period: Duration, callback: TimerCallback, repeat: bool) -> TimerId {
        let id = self.alloc_timer_id();

        if self.in_this_loop() {
            let mut core = self.shared.core.lock().unwrap();
            if repeat {
                core.reactor.schedule_repeatedly(id, period, callback);
            } else {
                core.reactor.schedule_later(id, period, callback);
            }
            return id;
        }

        self.shared.pending.lock().unwrap().arming.insert(id);
        let target = self.clone();
        self.execute(move || {
            let armed = {
                let mut pending = target.shared.pending.lock().unwrap();
                pending.arming.remove(&id);
                !pending.tombstones.remove(&id)
            };
            if armed {
                let mut core = target.shared.core.lock().unwrap();
                if repeat {
                    core.reactor.schedule_repeatedly(id, period, callback);
                } else {
                    core.reactor.schedule_later(id, period, callback);
                }
            }
        });
        id
    }

    fn alloc_timer_id(&self) -> TimerId {
        loop {
            let id = TIMER_ID_GENERATOR
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id < 0 {
                TIMER_ID_GENERATOR.store(0, Ordering::Relaxed);
                continue;
            }
            if self.shared.pending.lock().unwrap().arming.contains(&id) {
                continue;
            }
            if self.in_this_loop() && self.shared.core.lock().unwrap().reactor.has_timer(id) {
                continue;
            }
            return id;
        }
    }

    /// Cancel timer `id` from any thread. The handle resolves to true if
    /// the fire was prevented: either a live timer was removed or the id
    /// was still waiting to be armed.
    pub fn cancel(&self, id: TimerId) -> TaskHandle<bool> {
        if self.in_this_loop() {
            TaskHandle::fulfilled(self.cancel_in_loop(id))
        } else {
            let target = self.clone();
            self.execute(move || target.cancel_in_loop(id))
        }
    }

    fn cancel_in_loop(&self, id: TimerId) -> bool {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.arming.contains(&id) {
                // First cancel wins; the arming task becomes a no-op.
                return pending.tombstones.insert(id);
            }
        }
        let ok = self.shared.core.lock().unwrap().reactor.cancel(id);
        debug!("cancel timer {id} {}", if ok { "succ" } else { "fail" });
        ok
    }

    /// Track `obj` with the reactor under a freshly allocated unique id.
    /// Must run on the loop thread. Returns false if the OS registration
    /// failed.
    pub fn register(&self, obj: Arc<dyn EventObject>, events: Events) -> bool {
        assert!(
            self.in_this_loop(),
            "EventLoop::register must run on the loop thread"
        );
        assert_eq!(obj.unique_id(), -1, "object is already registered");

        let mut core = self.shared.core.lock().unwrap();

        let id = loop {
            let id = OBJECT_ID_GENERATOR
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id < 0 {
                OBJECT_ID_GENERATOR.store(0, Ordering::Relaxed);
                continue;
            }
            if !core.objects.contains_key(&id) {
                break id;
            }
        };

        obj.set_unique_id(id);
        match core.reactor.register(obj.clone(), events) {
            Ok(()) => {
                core.objects.insert(id, obj);
                true
            }
            Err(e) => {
                drop(core);
                error!("register object failed: {e}");
                obj.set_unique_id(-1);
                false
            }
        }
    }

    /// Reconcile the OS watches for an already registered object. Must run
    /// on the loop thread.
    pub fn modify(&self, obj: &dyn EventObject, events: Events) -> bool {
        assert!(
            self.in_this_loop(),
            "EventLoop::modify must run on the loop thread"
        );
        let id = obj.unique_id();
        assert!(id >= 0, "object is not registered");

        match self.shared.core.lock().unwrap().reactor.modify(id, events) {
            Ok(()) => true,
            Err(e) => {
                error!("modify object {id} failed: {e}");
                false
            }
        }
    }

    /// Drop `obj` from the registry and the reactor. Must run on the loop
    /// thread; a no-op if the object is not present.
    pub fn unregister(&self, obj: &dyn EventObject) {
        assert!(
            self.in_this_loop(),
            "EventLoop::unregister must run on the loop thread"
        );
        let id = obj.unique_id();
        assert!(id >= 0, "object was never registered");

        let removed = {
            let mut core = self.shared.core.lock().unwrap();
            core.reactor.unregister(id);
            core.objects.remove(&id)
        };
        // Dropped outside the lock: this may be the last strong reference
        // and the destructor can call back into the loop.
        drop(removed);
    }

    /// Bind a TCP listener on `ip:port` and keep it alive in the registry.
    /// Must run on the loop thread.
    pub fn listen(&self, ip: &str, port: u16, on_new_conn: NewConnCallback) -> bool {
        let listener = TcpListener::new(self);
        listener.set_new_conn_callback(on_new_conn);
        match listener.bind(ip, port) {
            Ok(()) => true,
            Err(e) => {
                error!("failed to listen on {ip}:{port}: {e}");
                false
            }
        }
    }

    /// Start an outbound TCP connection. Must run on the loop thread.
    /// Returns `None` if the connect could not even be initiated; later
    /// failures arrive through `on_fail`.
    pub fn connect(
        &self,
        ip: &str,
        port: u16,
        on_new_conn: NewConnCallback,
        on_fail: ConnFailCallback,
    ) -> Option<Arc<TcpConnection>> {
        let conn = TcpConnection::new(self);
        conn.set_new_conn_callback(on_new_conn);
        conn.set_fail_callback(on_fail);
        if conn.connect(ip, port) {
            Some(conn)
        } else {
            None
        }
    }

    /// Unit-test hook: unregister everything, drop queued tasks, and
    /// rebuild the reactor and notifier.
    pub fn reset(&self) {
        assert!(
            self.in_this_loop(),
            "EventLoop::reset must run on the loop thread"
        );

        let (notifier, notify_rx) = Notifier::new().expect("create notifier pipe");
        let reactor = Reactor::new().expect("create reactor");

        let (objects, cleared) = {
            let mut core = self.shared.core.lock().unwrap();
            let objects: Vec<_> = core.objects.drain().map(|(_, obj)| obj).collect();
            let cleared = core.reactor.clear();
            core.reactor = reactor;
            core.notify_rx = Arc::new(notify_rx);
            (objects, cleared)
        };
        *self.shared.notifier.lock().unwrap() = notifier;
        self.shared.tasks.lock().unwrap().clear();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.arming.clear();
            pending.tombstones.clear();
        }
        drop(cleared);
        drop(objects);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
