//! Cross-thread submission and timer laws.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use sluice::EventLoop;

static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

fn spawn_loop(name: &'static str) -> (EventLoop, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        event_loop.set_name(name);
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn cross_thread_execute_runs_in_submission_order() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-fifo");

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..1000usize {
        let order = order.clone();
        handles.push(event_loop.execute(move || {
            order.lock().unwrap().push(i);
            42
        }));
    }

    for h in &handles {
        assert_eq!(h.wait(), Some(42));
    }
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 1000);
    assert!(order.windows(2).all(|w| w[0] < w[1]));

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn off_thread_execute_returns_value() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-value");

    let result = event_loop.execute(|| 6 * 7).wait();
    assert_eq!(result, Some(42));

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn cancel_before_delay_elapses_prevents_fire() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-cancel");

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let id = event_loop.schedule_later(Duration::from_millis(200), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(event_loop.cancel(id).wait(), Some(true));
    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // A second cancel finds nothing.
    assert_eq!(event_loop.cancel(id).wait(), Some(false));

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn cancel_races_the_arming_task() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-race");

    // Schedule and cancel back-to-back from off-thread, before the loop
    // necessarily drained its inbox. The cancel must win either way.
    for _ in 0..100 {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = event_loop.schedule_later(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(event_loop.cancel(id).wait(), Some(true));
        thread::sleep(Duration::from_millis(2));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn cancel_before_arming_leaves_tombstone() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-tombstone");

    // Occupy the loop thread so the arming task stays queued, then cancel
    // the id from inside the loop before the arming task ran.
    let (id_tx, id_rx) = mpsc::channel();
    let target = event_loop.clone();
    let cancel_result = event_loop.execute(move || {
        let id = id_rx.recv().unwrap();
        // In-loop cancel: the timer is still pending-arm.
        target.cancel(id).wait().unwrap()
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let id = event_loop.schedule_later(Duration::from_millis(30), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    id_tx.send(id).unwrap();

    assert_eq!(cancel_result.wait(), Some(true));
    thread::sleep(Duration::from_millis(100));
    // The arming task honored the tombstone: nothing was armed, no fire.
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(event_loop.cancel(id).wait(), Some(false));

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn repeating_timer_fires_until_cancelled() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-repeat");

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let id = event_loop.schedule_repeatedly(Duration::from_millis(20), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(fired.load(Ordering::SeqCst) >= 3);

    assert_eq!(event_loop.cancel(id).wait(), Some(true));
    let after_cancel = fired.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    // At most one in-flight fire may have straddled the cancel.
    assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn one_shot_fires_once() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-oneshot");

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    event_loop.schedule_later(Duration::from_millis(20), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    event_loop.stop();
    handle.join().unwrap();
}

#[test]
fn stop_wakes_a_sleeping_loop() {
    init_logging();
    let (event_loop, handle) = spawn_loop("tasks-stop");

    let start = Instant::now();
    event_loop.stop();
    handle.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}
