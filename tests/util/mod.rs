// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Once;
use std::thread;

use muxio::{EventLoop, LoopHandle, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A server running on its own base-loop thread, torn down on drop.
pub struct ServerHarness {
    pub handle: LoopHandle,
    pub addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHarness {
    /// Spawns a loop thread, builds a server bound to an ephemeral port on
    /// it, applies `configure`, starts it and runs the loop.
    pub fn start<F>(threads: usize, configure: F) -> ServerHarness
    where
        F: FnOnce(&TcpServer) + Send + 'static,
    {
        init();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let event_loop = EventLoop::new().expect("unable to create base loop");
            let server = TcpServer::new(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "test-server",
                false,
            )
            .expect("unable to bind server");
            server.set_thread_num(threads);
            configure(&server);
            server.start().expect("unable to start server");
            ready_tx
                .send((event_loop.handle(), server.local_addr()))
                .unwrap();
            event_loop.run();
        });
        let (handle, addr) = ready_rx.recv().expect("server thread died during setup");
        ServerHarness {
            handle,
            addr,
            thread: Some(thread),
        }
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread panicked");
        }
    }
}
