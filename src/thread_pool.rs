use std::io;

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

/// A fixed set of worker loops fed round-robin from the base loop.
///
/// With zero workers the base loop serves everything itself; the server
/// then accepts and handles connections single-threaded.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    /// Creates an empty pool dispatching from `base`.
    pub fn new(base: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the number of worker loops to spawn; zero reuses the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawns the workers, invoking `init` on each worker thread. With zero
    /// workers `init` runs once for the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started, "thread pool already started");
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            let handle = thread.start_loop()?;
            self.threads.push(thread);
            self.loops.push(handle);
        }
        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base);
            }
        }
        Ok(())
    }

    /// The loop that should own the next connection.
    ///
    /// Round-robins through the workers; must be called on the base loop's
    /// thread, which is what keeps the cursor unsynchronized.
    pub fn next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        handle
    }

    /// Every loop connections may be dispatched to.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    /// Returns true once [`start`] has run.
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn started(&self) -> bool {
        self.started
    }

    /// The pool's base name for worker threads.
    pub fn name(&self) -> &str {
        &self.name
    }
}
