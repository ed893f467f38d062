//! Readiness demultiplexer plus timer engine.
//!
//! The reactor owns the OS poll handle and two id-keyed tables: one
//! registration record per tracked event object and one record per armed
//! timer. It knows nothing about TCP; the event loop drives it and
//! dispatches whatever it reports as ready, with the loop state unlocked so
//! handlers can re-enter loop operations.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::{Error, Result};
use crate::event::{EventObject, Events};

pub type TimerId = i64;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

const EVENTS_CAPACITY: usize = 1024;

/// The poll never blocks longer than this, so state changes that bypass the
/// notifier (e.g. a timer armed between iterations) are picked up promptly.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(10);

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

struct Registration {
    obj: Arc<dyn EventObject>,
    events: Events,
    /// Whether an OS-level watch is currently installed. A record with
    /// `Events::NONE` is tracked but watches nothing.
    installed: bool,
}

struct Timer {
    callback: TimerCallback,
    repeat: bool,
    period: Duration,
    next_fire: Instant,
    /// Stamped into every heap entry; a mismatch marks the entry stale.
    generation: u64,
}

/// One object the poll reported ready, intersected with its interest mask.
pub(crate) struct IoReady {
    pub obj: Arc<dyn EventObject>,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct DueTimer {
    pub id: TimerId,
    pub callback: TimerCallback,
}

pub(crate) struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    objects: HashMap<i32, Registration>,
    timers: HashMap<TimerId, Timer>,
    timer_queue: BinaryHeap<Reverse<(Instant, TimerId, u64)>>,
    generation: u64,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(EVENTS_CAPACITY),
            objects: HashMap::new(),
            timers: HashMap::new(),
            timer_queue: BinaryHeap::new(),
            generation: 0,
        })
    }

    fn interest_for(events: Events) -> Option<Interest> {
        match (events.contains(Events::READ), events.contains(Events::WRITE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Track `obj` and install watches for `events`. A zero mask installs no
    /// OS watch; the object manages its own readiness or is timer-driven.
    pub fn register(&mut self, obj: Arc<dyn EventObject>, events: Events) -> Result<()> {
        let id = obj.unique_id();
        debug_assert!(id >= 0);
        if self.objects.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }

        let mut installed = false;
        if let Some(interest) = Self::interest_for(events) {
            let fd = obj.fd();
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(id as usize), interest)?;
            installed = true;
        }

        self.objects.insert(
            id,
            Registration {
                obj,
                events,
                installed,
            },
        );
        Ok(())
    }

    /// Bring the OS watches for `id` into agreement with `events`,
    /// installing or releasing as needed. Idempotent.
    pub fn modify(&mut self, id: i32, events: Events) -> Result<()> {
        let reg = self.objects.get_mut(&id).ok_or(Error::NotRegistered(id))?;
        if reg.events == events {
            return Ok(());
        }

        let fd = reg.obj.fd();
        match (Self::interest_for(events), reg.installed) {
            (Some(interest), true) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(id as usize), interest)?;
            }
            (Some(interest), false) => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(id as usize), interest)?;
                reg.installed = true;
            }
            (None, true) => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                reg.installed = false;
            }
            (None, false) => {}
        }
        reg.events = events;
        Ok(())
    }

    /// Release all watches for `id` and drop its record. No-op if absent.
    pub fn unregister(&mut self, id: i32) {
        if let Some(reg) = self.objects.remove(&id) {
            if reg.installed {
                let fd = reg.obj.fd();
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
    }

    pub fn is_registered(&self, id: i32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Release every watch and drop all records and timers. The returned
    /// objects are handed back so the caller can drop them outside its own
    /// state lock.
    pub fn clear(&mut self) -> Vec<Arc<dyn EventObject>> {
        let ids: Vec<i32> = self.objects.keys().copied().collect();
        let mut objects = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(reg) = self.objects.remove(&id) {
                if reg.installed {
                    let fd = reg.obj.fd();
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
                objects.push(reg.obj);
            }
        }
        self.timers.clear();
        self.timer_queue.clear();
        objects
    }

    fn next_timeout(&self) -> Duration {
        // A stale heap head only causes an early wake, never a late one.
        match self.timer_queue.peek() {
            Some(Reverse((deadline, _, _))) => deadline
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_TIMEOUT),
            None => MAX_POLL_TIMEOUT,
        }
    }

    /// One non-blocking-ish iteration of the demultiplexer: waits at most
    /// 10 ms (less when a timer is due) and reports the ready set.
    pub fn poll(&mut self) -> Result<Vec<IoReady>> {
        let timeout = self.next_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e.into());
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let id = event.token().0 as i32;
            let Some(reg) = self.objects.get(&id) else {
                continue;
            };
            // An error condition is surfaced through whichever handler the
            // object subscribed; its read/write path observes the failure.
            let broken = event.is_error();
            let readable = reg.events.contains(Events::READ)
                && (event.is_readable() || event.is_read_closed() || broken);
            let writable = reg.events.contains(Events::WRITE)
                && (event.is_writable() || event.is_write_closed() || broken);
            if readable || writable {
                ready.push(IoReady {
                    obj: reg.obj.clone(),
                    readable,
                    writable,
                });
            }
        }
        Ok(ready)
    }

    /// Arm a one-shot timer. The caller owns id allocation.
    pub fn schedule_later(&mut self, id: TimerId, delay: Duration, callback: TimerCallback) {
        self.schedule(id, delay, callback, false);
    }

    /// Arm a periodic timer re-fired at fixed phase.
    pub fn schedule_repeatedly(&mut self, id: TimerId, period: Duration, callback: TimerCallback) {
        self.schedule(id, period, callback, true);
    }

    fn schedule(&mut self, id: TimerId, period: Duration, callback: TimerCallback, repeat: bool) {
        let period = period.max(MIN_TIMER_PERIOD);
        let next_fire = Instant::now() + period;
        self.generation += 1;
        self.timers.insert(
            id,
            Timer {
                callback,
                repeat,
                period,
                next_fire,
                generation: self.generation,
            },
        );
        self.timer_queue
            .push(Reverse((next_fire, id, self.generation)));
    }

    /// Remove timer `id` before its next fire. Returns whether a live timer
    /// existed; a callback already in flight still completes.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Pop every timer whose deadline has passed. The caller invokes each
    /// callback with the loop state unlocked, then reports back through
    /// [`Reactor::finish_timer`].
    pub fn due_timers(&mut self) -> Vec<DueTimer> {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id, generation))) = self.timer_queue.peek() {
            if deadline > now {
                break;
            }
            self.timer_queue.pop();
            let Some(timer) = self.timers.get(&id) else {
                continue; // cancelled
            };
            if timer.generation != generation {
                continue; // stale entry from an earlier arming
            }
            due.push(DueTimer {
                id,
                callback: timer.callback.clone(),
            });
        }
        due
    }

    /// Called after a due timer's callback returned: auto-cancel one-shots,
    /// re-arm periodics at fixed phase. A fire missed because the loop was
    /// busy runs at most once; the phase is not advanced to catch up.
    pub fn finish_timer(&mut self, id: TimerId) {
        let now = Instant::now();
        let Some(timer) = self.timers.get_mut(&id) else {
            return; // cancelled from inside its own callback
        };
        if !timer.repeat {
            self.timers.remove(&id);
            return;
        }
        timer.next_fire += timer.period;
        if timer.next_fire <= now {
            timer.next_fire = now + timer.period;
        }
        self.generation += 1;
        timer.generation = self.generation;
        self.timer_queue
            .push(Reverse((timer.next_fire, id, self.generation)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ObjectId;
    use std::io::Write;
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSource {
        stream: UnixStream,
        id: ObjectId,
        reads: AtomicUsize,
    }

    impl TestSource {
        fn pair() -> (Arc<TestSource>, UnixStream) {
            let (a, b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            let src = Arc::new(TestSource {
                stream: a,
                id: ObjectId::new(),
                reads: AtomicUsize::new(0),
            });
            (src, b)
        }
    }

    impl EventObject for TestSource {
        fn fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn unique_id(&self) -> i32 {
            self.id.get()
        }

        fn set_unique_id(&self, id: i32) {
            self.id.set(id);
        }

        fn handle_read(&self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn drive_timers(reactor: &mut Reactor) -> usize {
        let due = reactor.due_timers();
        let fired = due.len();
        for t in due {
            (t.callback)();
            reactor.finish_timer(t.id);
        }
        fired
    }

    #[test]
    fn test_register_zero_mask_installs_no_watch() {
        let mut reactor = Reactor::new().unwrap();
        let (src, mut peer) = TestSource::pair();
        src.set_unique_id(1);

        reactor.register(src.clone(), Events::NONE).unwrap();
        assert!(reactor.is_registered(1));
        assert!(!reactor.objects[&1].installed);

        // A mask-0 object never shows up in the ready set.
        peer.write_all(b"x").unwrap();
        let ready = reactor.poll().unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_double_register_fails() {
        let mut reactor = Reactor::new().unwrap();
        let (src, _peer) = TestSource::pair();
        src.set_unique_id(3);

        reactor.register(src.clone(), Events::READ).unwrap();
        assert!(matches!(
            reactor.register(src, Events::READ),
            Err(Error::AlreadyRegistered(3))
        ));
    }

    #[test]
    fn test_modify_converges_watches() {
        let mut reactor = Reactor::new().unwrap();
        let (src, mut peer) = TestSource::pair();
        src.set_unique_id(5);

        reactor.register(src.clone(), Events::NONE).unwrap();
        reactor.modify(5, Events::READ).unwrap();
        assert!(reactor.objects[&5].installed);

        peer.write_all(b"x").unwrap();
        let ready = reactor.poll().unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
        assert!(!ready[0].writable);

        // Releasing all watches keeps the record but uninstalls the fd.
        reactor.modify(5, Events::NONE).unwrap();
        assert!(reactor.is_registered(5));
        assert!(!reactor.objects[&5].installed);

        // Modify to the current mask is a no-op.
        reactor.modify(5, Events::NONE).unwrap();
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut reactor = Reactor::new().unwrap();
        reactor.unregister(42);
    }

    #[test]
    fn test_poll_returns_within_wakeup_bound() {
        let mut reactor = Reactor::new().unwrap();
        let start = Instant::now();
        let ready = reactor.poll().unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_one_shot_fires_once_then_autocancels() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_later(
            1,
            Duration::from_millis(5),
            Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_millis(500);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            reactor.poll().unwrap();
            drive_timers(&mut reactor);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The record is gone after the fire.
        assert!(!reactor.cancel(1));
    }

    #[test]
    fn test_cancel_before_fire() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_later(
            2,
            Duration::from_millis(20),
            Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(reactor.cancel(2));
        assert!(!reactor.cancel(2));

        let deadline = Instant::now() + Duration::from_millis(60);
        while Instant::now() < deadline {
            reactor.poll().unwrap();
            drive_timers(&mut reactor);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_periodic_rearms_until_cancelled() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_repeatedly(
            3,
            Duration::from_millis(5),
            Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_millis(1000);
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            reactor.poll().unwrap();
            drive_timers(&mut reactor);
        }
        assert!(fired.load(Ordering::SeqCst) >= 3);

        assert!(reactor.cancel(3));
        let count = fired.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(30);
        while Instant::now() < deadline {
            reactor.poll().unwrap();
            drive_timers(&mut reactor);
        }
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }

    #[test]
    fn test_zero_period_is_clamped() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_later(
            4,
            Duration::ZERO,
            Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(reactor.timers[&4].period >= Duration::from_millis(1));

        let deadline = Instant::now() + Duration::from_millis(500);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            reactor.poll().unwrap();
            drive_timers(&mut reactor);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_dispatches_to_handler() {
        let mut reactor = Reactor::new().unwrap();
        let (src, mut peer) = TestSource::pair();
        src.set_unique_id(9);
        reactor.register(src.clone(), Events::READ).unwrap();

        peer.write_all(b"ping").unwrap();
        let deadline = Instant::now() + Duration::from_millis(500);
        while src.reads.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            for r in reactor.poll().unwrap() {
                if r.readable {
                    r.obj.handle_read();
                }
            }
        }
        assert!(src.reads.load(Ordering::SeqCst) >= 1);
    }
}
