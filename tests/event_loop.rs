use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{Channel, EventLoop};

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
fn quit_from_another_thread_is_prompt() {
    init();

    let (handle, thread) = run_loop_thread();
    // Let the loop park itself in epoll_wait.
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    handle.quit();
    thread.join().unwrap();
    // Far below the ten second poll ceiling: the wakeup eventfd must have
    // forced the iteration.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn queued_tasks_run_in_fifo_order() {
    init();

    let (handle, thread) = run_loop_thread();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..10 {
        let order = Arc::clone(&order);
        handle.queue_in_loop(move || order.lock().unwrap().push(i));
    }
    handle.queue_in_loop(move || done_tx.send(()).unwrap());
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("tasks never drained");
    handle.quit();
    thread.join().unwrap();

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn run_in_loop_is_inline_on_the_loop_thread() {
    init();

    let (handle, thread) = run_loop_thread();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    let task_order = Arc::clone(&order);
    let task_handle = handle.clone();
    handle.queue_in_loop(move || {
        task_order.lock().unwrap().push("before");
        let inline_order = Arc::clone(&task_order);
        // Already on the loop thread, so this must run synchronously.
        task_handle.run_in_loop(move || inline_order.lock().unwrap().push("inline"));
        task_order.lock().unwrap().push("after");
        done_tx.send(()).unwrap();
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("task never ran");
    handle.quit();
    thread.join().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["before", "inline", "after"]);
}

#[test]
fn task_queued_during_drain_runs_promptly() {
    init();

    let (handle, thread) = run_loop_thread();
    let (done_tx, done_rx) = mpsc::channel();

    let requeue_handle = handle.clone();
    handle.queue_in_loop(move || {
        let started = Instant::now();
        let inner_tx = done_tx.clone();
        // Queued from inside the drain phase: must run on the next
        // iteration, not after the poll timeout expires.
        requeue_handle.queue_in_loop(move || {
            inner_tx.send(started.elapsed()).unwrap();
        });
    });

    let latency = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("follow-up task never ran");
    assert!(latency < Duration::from_secs(1), "took {:?}", latency);

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn second_loop_on_one_thread_panics() {
    init();

    thread::spawn(|| {
        let _event_loop = EventLoop::new().unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = EventLoop::new();
        }));
        assert!(result.is_err());
    })
    .join()
    .unwrap();
}

#[test]
fn disabled_channel_stays_in_the_map_until_removed() {
    init();

    thread::spawn(|| {
        let event_loop = EventLoop::new().unwrap();
        // Any pollable fd will do.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let channel = Channel::new(&event_loop, socket.as_raw_fd());

        channel.enable_reading();
        assert!(event_loop.has_channel(&channel));

        // Tombstoned: gone from the kernel set, still known to the loop.
        channel.disable_all();
        assert!(event_loop.has_channel(&channel));

        channel.remove();
        assert!(!event_loop.has_channel(&channel));
    })
    .join()
    .unwrap();
}

#[test]
fn loop_context_round_trips() {
    init();

    thread::spawn(|| {
        let event_loop = EventLoop::new().unwrap();
        event_loop.set_context(Box::new(41u32));
        let context = event_loop.take_context().unwrap();
        assert_eq!(*context.downcast::<u32>().unwrap(), 41);
        assert!(event_loop.take_context().is_none());
    })
    .join()
    .unwrap();
}
