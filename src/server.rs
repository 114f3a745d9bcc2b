use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::event_loop_thread::ThreadInitCallback;
use crate::sys;
use crate::thread_pool::EventLoopThreadPool;
use crate::timestamp::Timestamp;

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
    thread_init: Option<ThreadInitCallback>,
}

/// The parts of the server reachable from worker threads and connection
/// callbacks.
struct ServerInner {
    base: LoopHandle,
    name: String,
    ip_port: String,
    next_conn_id: AtomicUsize,
    pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    callbacks: Mutex<ServerCallbacks>,
}

/// A multi-reactor TCP server.
///
/// The constructing thread's loop (the *base loop*) accepts connections;
/// each accepted connection is handed round-robin to one of
/// [`set_thread_num`] worker loops and stays confined to it for its entire
/// life. Configure the callbacks before [`start`]; they are copied into
/// every connection at accept time.
///
/// The server itself lives on the base loop's thread. Construct it there and
/// call [`start`] there; the connection callbacks run on whichever worker
/// owns the connection.
///
/// [`set_thread_num`]: TcpServer::set_thread_num
/// [`start`]: TcpServer::start
pub struct TcpServer {
    inner: Arc<ServerInner>,
    acceptor: Rc<Acceptor>,
    started: AtomicUsize,
}

impl TcpServer {
    /// Binds `listen_addr` on `event_loop`, which becomes the base loop.
    /// `reuse_port` opts into `SO_REUSEPORT` on the listening socket.
    pub fn new(
        event_loop: &Rc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let local_addr = acceptor.local_addr();
        let inner = Arc::new(ServerInner {
            base: event_loop.handle(),
            ip_port: local_addr.to_string(),
            next_conn_id: AtomicUsize::new(1),
            pool: Mutex::new(EventLoopThreadPool::new(event_loop.handle(), name.clone())),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(ServerCallbacks::default()),
            name,
        });

        let accept_inner = Arc::clone(&inner);
        acceptor.set_new_connection_callback(move |socket, peer_addr| {
            ServerInner::new_connection(&accept_inner, socket, peer_addr);
        });

        Ok(TcpServer {
            inner,
            acceptor,
            started: AtomicUsize::new(0),
        })
    }

    /// The server's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The listening address as `"ip:port"`.
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The bound listening address, with a kernel-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Sets how many worker loops handle connections; zero means the base
    /// loop handles everything.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Callback run on each worker loop thread as it starts (and on the
    /// base loop when the worker count is zero).
    pub fn set_thread_init_callback(
        &self,
        callback: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().thread_init = Some(Arc::new(callback));
    }

    /// Callback fired on connection establishment and teardown.
    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(callback));
    }

    /// Callback fired when bytes were appended to a connection's input
    /// queue.
    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().message = Some(Arc::new(callback));
    }

    /// Callback fired whenever a connection's output queue drains to empty.
    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    /// Callback fired the first time a connection buffers more than
    /// `threshold` bytes of output.
    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        threshold: usize,
    ) {
        self.inner.callbacks.lock().unwrap().high_water_mark =
            Some((Arc::new(callback), threshold));
    }

    /// Starts the worker pool and the listener. Idempotent; must run on the
    /// base loop's thread.
    pub fn start(&self) -> io::Result<()> {
        if self.started.fetch_add(1, Ordering::SeqCst) != 0 {
            return Ok(());
        }
        self.inner.base.assert_in_loop_thread();
        let thread_init = self.inner.callbacks.lock().unwrap().thread_init.clone();
        self.inner.pool.lock().unwrap().start(thread_init)?;
        info!(
            "server {} listening on {}",
            self.inner.name, self.inner.ip_port
        );
        self.acceptor.listen()
    }
}

impl ServerInner {
    /// Runs on the base loop for every accepted socket.
    fn new_connection(inner: &Arc<ServerInner>, socket: OwnedFd, peer_addr: SocketAddr) {
        inner.base.assert_in_loop_thread();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
        debug!("connection {} accepted from {}", name, peer_addr);

        let local_addr = sys::local_addr(socket.as_raw_fd()).unwrap_or_else(|err| {
            error!("getsockname for {}: {}", name, err);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });
        let worker = inner.pool.lock().unwrap().next_loop();
        let connection = TcpConnection::new(worker.clone(), name.clone(), socket, local_addr, peer_addr);

        {
            let callbacks = inner.callbacks.lock().unwrap();
            if let Some(callback) = &callbacks.connection {
                connection.set_connection_callback(callback.clone());
            }
            if let Some(callback) = &callbacks.message {
                connection.set_message_callback(callback.clone());
            }
            if let Some(callback) = &callbacks.write_complete {
                connection.set_write_complete_callback(callback.clone());
            }
            if let Some((callback, threshold)) = &callbacks.high_water_mark {
                connection.set_high_water_mark_callback(callback.clone(), *threshold);
            }
        }
        // Weak on purpose: connections must never keep the server (and with
        // it the worker pool) alive, or the pool could be dropped on a
        // worker thread and join itself.
        let close_inner = Arc::downgrade(inner);
        connection.set_close_callback(Arc::new(move |connection| {
            if let Some(inner) = close_inner.upgrade() {
                ServerInner::remove_connection(&inner, connection);
            }
        }));

        inner
            .connections
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&connection));
        worker.run_in_loop(move || connection.connect_established());
    }

    /// May run on any worker; hops to the base loop to touch the map.
    fn remove_connection(inner: &Arc<ServerInner>, connection: &TcpConnectionPtr) {
        let inner_clone = Arc::clone(inner);
        let connection = Arc::clone(connection);
        inner.base.run_in_loop(move || {
            ServerInner::remove_connection_in_loop(&inner_clone, &connection);
        });
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, connection: &TcpConnectionPtr) {
        inner.base.assert_in_loop_thread();
        debug!("server {} removing connection {}", inner.name, connection.name());
        inner.connections.lock().unwrap().remove(connection.name());
        let worker = connection.handle().clone();
        // The clone moved into the task keeps the connection alive through
        // its final dispatch on the worker.
        let connection = Arc::clone(connection);
        worker.queue_in_loop(move || connection.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> = {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            let worker = connection.handle().clone();
            worker.queue_in_loop(move || connection.connect_destroyed());
        }
    }
}
