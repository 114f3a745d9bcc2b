use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::debug;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timer::{TimerId, TimerQueue};
use crate::timestamp::Timestamp;
use crate::waker::Waker;

/// Work marshalled onto a loop's thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Ceiling on a single `epoll_wait`, so a loop with nothing to do still
/// drains pending tasks periodically.
const POLL_TIME_MS: libc::c_int = 10_000;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// The half of an [`EventLoop`] that other threads are allowed to touch.
struct LoopShared {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    handling_events: AtomicBool,
    calling_pending: AtomicBool,
    pending: Mutex<Vec<Task>>,
    waker: Waker,
}

/// A `Send + Sync` handle to an [`EventLoop`], valid for queueing work and
/// requesting shutdown from any thread.
///
/// The handle does not keep the loop running: once the owning thread drops
/// its `EventLoop`, queued tasks are silently discarded.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Returns true when called on the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Panics unless called on the loop's own thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop owned by thread {:?} touched from thread {:?}",
            self.shared.thread_id,
            thread::current().id()
        );
    }

    /// Runs `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the loop's next pending-task drain.
    ///
    /// The loop is woken when the caller is off-thread, and also when the
    /// loop is currently draining pending tasks — a task queued by another
    /// task must run on the next iteration, not after a full poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.shared.waker.wake();
        }
    }

    /// Asks the loop to exit `run` after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.waker.wake();
        }
    }
}

/// One thread's reactor: polls for readiness, dispatches channel callbacks,
/// then executes work queued from other threads.
///
/// Exactly one `EventLoop` may exist per thread; constructing a second one
/// panics. The loop itself is single-threaded and must be driven by the
/// thread that created it; hand a [`LoopHandle`] to everything else.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: RefCell<Poller>,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    poll_return_time: Cell<Timestamp>,
    timers: RefCell<TimerQueue>,
    wakeup_channel: RefCell<Option<Rc<Channel>>>,
    timer_channel: RefCell<Option<Rc<Channel>>>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl EventLoop {
    /// Creates the loop for the current thread and registers it in the
    /// per-thread slot.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live `EventLoop`.
    pub fn new() -> io::Result<Rc<EventLoop>> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        let timers = TimerQueue::new()?;
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            handling_events: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            waker,
        });
        let event_loop = Rc::new(EventLoop {
            shared,
            poller: RefCell::new(poller),
            active_channels: RefCell::new(Vec::new()),
            poll_return_time: Cell::new(Timestamp::invalid()),
            timers: RefCell::new(timers),
            wakeup_channel: RefCell::new(None),
            timer_channel: RefCell::new(None),
            context: RefCell::new(None),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.upgrade().is_some() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
            *current = Rc::downgrade(&event_loop);
        });
        debug!(
            "EventLoop created on thread {:?}",
            event_loop.shared.thread_id
        );

        let wakeup_channel = Channel::new(&event_loop, event_loop.shared.waker.as_raw_fd());
        let weak = Rc::downgrade(&event_loop);
        wakeup_channel.set_read_callback(move |_at| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.shared.waker.drain();
            }
        });
        wakeup_channel.enable_reading();
        *event_loop.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        let timer_channel = Channel::new(&event_loop, event_loop.timers.borrow().as_raw_fd());
        let weak = Rc::downgrade(&event_loop);
        timer_channel.set_read_callback(move |_at| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_timer_expiry();
            }
        });
        timer_channel.enable_reading();
        *event_loop.timer_channel.borrow_mut() = Some(timer_channel);

        Ok(event_loop)
    }

    /// The loop registered for the current thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the reactor until [`quit`] is observed.
    ///
    /// Each iteration polls for readiness (ten second ceiling), dispatches
    /// the fired channels, then drains the pending-task queue once. A quit
    /// requested before `run` makes it return immediately; quit is sticky.
    ///
    /// # Panics
    ///
    /// Panics when called off-thread or while already running.
    ///
    /// [`quit`]: LoopHandle::quit
    pub fn run(&self) {
        assert!(
            !self.shared.looping.load(Ordering::Acquire),
            "EventLoop::run called while already running"
        );
        self.assert_in_loop_thread();
        self.shared.looping.store(true, Ordering::Release);
        debug!("EventLoop on thread {:?} start looping", self.shared.thread_id);

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = self.active_channels.take();
            active.clear();
            let now = self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active);
            self.poll_return_time.set(now);

            self.shared.handling_events.store(true, Ordering::Release);
            for channel in &active {
                channel.handle_event(now);
            }
            self.shared.handling_events.store(false, Ordering::Release);
            self.active_channels.replace(active);

            self.drain_pending_tasks();
        }

        debug!("EventLoop on thread {:?} stop looping", self.shared.thread_id);
        self.shared.looping.store(false, Ordering::Release);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    /// Returns true when called on the thread that constructed this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Panics unless called on the loop's own thread.
    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    /// The wall-clock time at which the last `epoll_wait` returned.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    /// Returns true while the loop is dispatching channel events.
    pub fn handling_events(&self) -> bool {
        self.shared.handling_events.load(Ordering::Acquire)
    }

    /// Pushes `channel`'s interest set into the poller.
    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_owner_of(channel);
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Erases `channel` from the poller.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_owner_of(channel);
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    /// Returns true while `channel` is known to the poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_owner_of(channel);
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub(crate) fn channel_for(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.poller.borrow().channel(fd)
    }

    /// Schedules `callback` to run on this loop's thread at `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl Fn() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().add(when, None, Rc::new(callback))
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + 'static) -> TimerId {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Schedules `callback` to run every `interval`, first after one
    /// interval.
    pub fn run_every(&self, interval: Duration, callback: impl Fn() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timers
            .borrow_mut()
            .add(Timestamp::now() + interval, Some(interval), Rc::new(callback))
    }

    /// Cancels a scheduled timer. Cancelling from inside the timer's own
    /// callback is honoured; cancelling an already fired one-shot timer is a
    /// no-op.
    pub fn cancel(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().cancel(id);
    }

    /// Stores an opaque per-loop value.
    pub fn set_context(&self, context: Box<dyn Any>) {
        *self.context.borrow_mut() = Some(context);
    }

    /// Removes and returns the per-loop value.
    pub fn take_context(&self) -> Option<Box<dyn Any>> {
        self.context.borrow_mut().take()
    }

    fn assert_owner_of(&self, channel: &Channel) {
        let owned = channel
            .owner_loop()
            .map_or(false, |owner| std::ptr::eq(Rc::as_ptr(&owner), self));
        assert!(
            owned,
            "channel fd={} belongs to another loop",
            channel.fd()
        );
    }

    fn handle_timer_expiry(&self) {
        let now = Timestamp::now();
        let due = self.timers.borrow_mut().begin_expired(now);
        // The queue is unborrowed here so callbacks may add or cancel
        // timers.
        for timer in &due {
            (timer.callback)();
        }
        self.timers.borrow_mut().finish_expired(due, now);
    }

    fn drain_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The loop-internal channels cannot reach the loop through their
        // weak back-reference at this point, so tear them down against the
        // poller directly.
        let wakeup = self.wakeup_channel.borrow_mut().take();
        let timer = self.timer_channel.borrow_mut().take();
        let mut poller = self.poller.borrow_mut();
        for channel in [wakeup, timer].into_iter().flatten() {
            channel.disable_all();
            poller.update_channel(&channel);
            poller.remove_channel(&channel);
        }
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            // A loop that failed the duplicate check above never owned the
            // slot; only the registered loop may clear it.
            if std::ptr::eq(Weak::as_ptr(&*current), self as *const EventLoop) {
                *current = Weak::new();
            }
        });
        debug!("EventLoop on thread {:?} destroyed", self.shared.thread_id);
    }
}
