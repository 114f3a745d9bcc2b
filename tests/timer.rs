use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use muxio::EventLoop;

mod util;

use util::init;

fn run_loop_thread() -> (muxio::LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create loop");
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), thread)
}

#[test]
fn run_after_fires_once() {
    init();

    let (handle, thread) = run_loop_thread();
    let (fired_tx, fired_rx) = mpsc::channel();
    let start = Instant::now();

    handle.queue_in_loop(move || {
        let event_loop = EventLoop::current().unwrap();
        event_loop.run_after(Duration::from_millis(50), move || {
            fired_tx.send(()).unwrap();
        });
    });

    fired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("timer never fired");
    assert!(start.elapsed() >= Duration::from_millis(50));
    // One-shot: no second expiration.
    assert!(fired_rx.recv_timeout(Duration::from_millis(200)).is_err());

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn run_every_repeats_until_cancelled_from_its_own_callback() {
    init();

    let (handle, thread) = run_loop_thread();
    let count = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    let timer_count = Arc::clone(&count);
    handle.queue_in_loop(move || {
        let event_loop = EventLoop::current().unwrap();
        let id_slot = Rc::new(Cell::new(None));
        let slot = Rc::clone(&id_slot);
        let id = event_loop.run_every(Duration::from_millis(25), move || {
            let fired = timer_count.fetch_add(1, Ordering::SeqCst) + 1;
            if fired == 3 {
                let event_loop = EventLoop::current().unwrap();
                event_loop.cancel(slot.get().unwrap());
                done_tx.send(()).unwrap();
            }
        });
        id_slot.set(Some(id));
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("repeating timer never reached three firings");
    // Give a cancelled-too-late fourth firing a chance to show up.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(count.load(Ordering::SeqCst), 3);

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn cancel_before_expiration_suppresses_the_callback() {
    init();

    let (handle, thread) = run_loop_thread();
    let fired = Arc::new(AtomicBool::new(false));

    let timer_fired = Arc::clone(&fired);
    handle.queue_in_loop(move || {
        let event_loop = EventLoop::current().unwrap();
        let id = event_loop.run_after(Duration::from_millis(100), move || {
            timer_fired.store(true, Ordering::SeqCst);
        });
        event_loop.cancel(id);
    });

    thread::sleep(Duration::from_millis(300));
    assert!(!fired.load(Ordering::SeqCst));

    handle.quit();
    thread.join().unwrap();
}
