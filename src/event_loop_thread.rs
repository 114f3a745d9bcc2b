use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback run on a freshly started loop thread, before the loop enters
/// [`run`].
///
/// [`run`]: EventLoop::run
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Owns one worker thread running its own [`EventLoop`].
///
/// The worker constructs the loop on its own stack, publishes a handle
/// through a mutex/condvar latch, and runs until quit. Dropping the
/// `EventLoopThread` quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    latch: Arc<(Mutex<Option<LoopHandle>>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates a not-yet-started loop thread.
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            latch: Arc::new((Mutex::new(None), Condvar::new())),
            thread: None,
        }
    }

    /// Spawns the worker and blocks until its loop is reachable.
    pub fn start_loop(&mut self) -> io::Result<LoopHandle> {
        assert!(self.thread.is_none(), "loop thread already started");
        let latch = Arc::clone(&self.latch);
        let init = self.init.take();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new().expect("failed to set up worker loop");
                if let Some(init) = &init {
                    init(&event_loop.handle());
                }
                {
                    let (slot, latch_signal) = &*latch;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    latch_signal.notify_one();
                }
                event_loop.run();
                let (slot, _) = &*latch;
                *slot.lock().unwrap() = None;
            })?;
        self.thread = Some(thread);

        let (slot, latch_signal) = &*self.latch;
        let mut published = slot.lock().unwrap();
        while published.is_none() {
            published = latch_signal.wait(published).unwrap();
        }
        Ok(published.clone().unwrap())
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let handle = self.latch.0.lock().unwrap().clone();
            if let Some(handle) = handle {
                handle.quit();
            }
            let _ = thread.join();
        }
    }
}
