use std::any::Any;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, trace};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys;
use crate::timestamp::Timestamp;

/// Shared handle to a [`TcpConnection`].
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on connection establishment and teardown; discriminate with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked after bytes were appended to the connection's input queue.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Invoked whenever the output queue has just drained to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked with the buffered length the first time the output queue crosses
/// the high-water mark upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Invoked when the connection reached `Disconnected`; the server uses this
/// to drop its strong reference.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// State confined to the owning loop's thread. The mutex makes the
/// containing `Arc` shareable; it is only ever locked from that one thread,
/// and never across a user callback.
struct Inner {
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    callbacks: Callbacks,
    context: Option<Box<dyn Any + Send>>,
}

/// One accepted TCP connection and its buffered I/O.
///
/// Every mutation runs on the owning worker loop; [`send`] and [`shutdown`]
/// may be called from any thread and marshal themselves over. The
/// connection is shared between the server (which holds it in its
/// connections map) and whatever the user's callbacks retain; the channel's
/// tie keeps callbacks from outliving it.
///
/// Lifecycle: `Connecting` at construction, `Connected` once
/// [`connect_established`] ran on the loop, `Disconnecting` while a graceful
/// [`shutdown`] drains the output queue, `Disconnected` after the peer
/// closed or the drain finished.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
/// [`connect_established`]: TcpConnection::connect_established
pub struct TcpConnection {
    handle: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: OwnedFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    inner: Mutex<Inner>,
}

impl TcpConnection {
    /// Wraps an accepted socket; the server calls this on the base loop and
    /// marshals [`connect_established`] to the owning worker afterwards.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub fn new(
        handle: LoopHandle,
        name: String,
        socket: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        debug!("connection {} created on fd={}", name, socket.as_raw_fd());
        if let Err(err) = sys::set_keep_alive(socket.as_raw_fd(), true) {
            error!("connection {} SO_KEEPALIVE: {}", name, err);
        }
        Arc::new(TcpConnection {
            handle,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            local_addr,
            peer_addr,
            inner: Mutex::new(Inner {
                input: Buffer::new(),
                output: Buffer::new(),
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
                callbacks: Callbacks::default(),
                context: None,
            }),
        })
    }

    /// The connection's unique name, assigned by the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local address of the accepted socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle to the loop that owns this connection.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Returns true while the connection is established.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Bytes currently buffered for sending.
    pub fn output_queue_len(&self) -> usize {
        self.inner.lock().unwrap().output.readable_len()
    }

    /// Toggles `TCP_NODELAY` on the socket.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = sys::set_tcp_no_delay(self.socket.as_raw_fd(), on) {
            error!("connection {} TCP_NODELAY: {}", self.name, err);
        }
    }

    /// Stores an opaque per-connection value, e.g. protocol parser state.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        self.inner.lock().unwrap().context = Some(context);
    }

    /// Removes and returns the per-connection value.
    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.lock().unwrap().context.take()
    }

    /// Installs the establishment/teardown callback.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.inner.lock().unwrap().callbacks.connection = Some(callback);
    }

    /// Installs the inbound-data callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.inner.lock().unwrap().callbacks.message = Some(callback);
    }

    /// Installs the output-queue-drained callback.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.inner.lock().unwrap().callbacks.write_complete = Some(callback);
    }

    /// Installs the backpressure callback, fired once per upward crossing of
    /// `mark` buffered bytes.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks.high_water_mark = Some(callback);
        inner.high_water_mark = mark;
    }

    /// Installs the callback fired on `Disconnected`; the server uses this
    /// slot to unregister the connection.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        self.inner.lock().unwrap().callbacks.close = Some(callback);
    }

    /// Sends `data`, writing directly when possible and buffering the rest.
    ///
    /// Callable from any thread; off-thread callers pay one copy of `data`
    /// into the marshalled task. Bytes from consecutive `send` calls on one
    /// thread arrive in call order.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let connection = Arc::clone(self);
            let data = data.to_vec();
            self.handle.run_in_loop(move || connection.send_in_loop(&data));
        }
    }

    /// Starts a graceful shutdown: the write side closes once the output
    /// queue has drained. Callable from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        let exchanged = self.state.compare_exchange(
            State::Connected as u8,
            State::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if exchanged.is_ok() {
            let connection = Arc::clone(self);
            self.handle.run_in_loop(move || connection.shutdown_in_loop());
        }
    }

    /// Completes establishment on the owning loop: ties the channel, arms
    /// read interest and fires the connection callback. Server plumbing;
    /// call exactly once.
    pub fn connect_established(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        let event_loop = EventLoop::current().expect("no EventLoop on this thread");
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let channel = Channel::new(&event_loop, self.socket.as_raw_fd());
        let weak = Arc::downgrade(self);
        channel.set_read_callback({
            let weak = weak.clone();
            move |at| {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_read(at);
                }
            }
        });
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_write();
                }
            }
        });
        channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_close();
                }
            }
        });
        channel.set_error_callback(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_error();
            }
        });
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        channel.tie(&tie);
        channel.enable_reading();

        let callback = self.inner.lock().unwrap().callbacks.connection.clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Final teardown on the owning loop: unregisters the channel and fires
    /// the connection callback if the peer close raced establishment.
    /// Server plumbing; the last strong reference usually lives inside the
    /// task that runs this.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            let callback = self.inner.lock().unwrap().callbacks.connection.clone();
            if let Some(callback) = callback {
                callback(self);
            }
        }
        if let Some(channel) = self.channel() {
            if !channel.interest().is_none() {
                channel.disable_all();
            }
            channel.remove();
        }
        // The close slot holds the server alive; clear it so the reference
        // cycle server -> connection -> server ends here.
        self.inner.lock().unwrap().callbacks = Callbacks::default();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The channel registered for this connection's fd, while it exists.
    fn channel(&self) -> Option<Rc<Channel>> {
        EventLoop::current().and_then(|event_loop| event_loop.channel_for(self.socket.as_raw_fd()))
    }

    fn handle_read(self: &Arc<Self>, at: Timestamp) {
        self.handle.assert_in_loop_thread();
        let mut inner = self.inner.lock().unwrap();
        match inner.input.read_from_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(inner);
                self.handle_close();
            }
            Ok(n) => {
                trace!("connection {} read {} bytes", self.name, n);
                let callback = inner.callbacks.message.clone();
                match callback {
                    Some(callback) => {
                        // Lend the input queue to the callback without
                        // holding the lock, so it may call `send` freely.
                        let mut input = mem::take(&mut inner.input);
                        drop(inner);
                        callback(self, &mut input, at);
                        self.inner.lock().unwrap().input = input;
                    }
                    None => inner.input.consume_all(),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(inner);
                error!("connection {} read: {}", self.name, err);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        let Some(channel) = self.channel() else { return };
        if !channel.is_writing() {
            error!("connection {} is down, no more writing", self.name);
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.output.write_to_fd(self.socket.as_raw_fd()) {
            Ok(n) => {
                inner.output.consume(n);
                if inner.output.readable_len() == 0 {
                    channel.disable_writing();
                    let callback = inner.callbacks.write_complete.clone();
                    drop(inner);
                    if let Some(callback) = callback {
                        let connection = Arc::clone(self);
                        self.handle
                            .queue_in_loop(move || callback(&connection));
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("connection {} write: {}", self.name, err),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        debug!("connection {} closing, state={:?}", self.name, self.state());
        self.set_state(State::Disconnected);
        if let Some(channel) = self.channel() {
            channel.disable_all();
        }
        let (connection_cb, close_cb) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.callbacks.connection.clone(),
                inner.callbacks.close.clone(),
            )
        };
        if let Some(callback) = connection_cb {
            callback(self);
        }
        if let Some(callback) = close_cb {
            callback(self);
        }
    }

    fn handle_error(&self) {
        let err = sys::socket_error(self.socket.as_raw_fd());
        error!(
            "connection {} SO_ERROR={} ({})",
            self.name,
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            error!("connection {} disconnected, giving up writing", self.name);
            return;
        }
        let Some(channel) = self.channel() else { return };

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut inner = self.inner.lock().unwrap();

        // Nothing queued and write interest off: try the direct write first.
        if !channel.is_writing() && inner.output.readable_len() == 0 {
            match sys::write(self.socket.as_raw_fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let callback = inner.callbacks.write_complete.clone();
                        if let Some(callback) = callback {
                            let connection = Arc::clone(self);
                            self.handle
                                .queue_in_loop(move || callback(&connection));
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("connection {} write: {}", self.name, err);
                    if err.raw_os_error() == Some(libc::EPIPE)
                        || err.raw_os_error() == Some(libc::ECONNRESET)
                    {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = inner.output.readable_len();
            let mark = inner.high_water_mark;
            if old_len + remaining >= mark && old_len < mark && mark > 0 {
                let callback = inner.callbacks.high_water_mark.clone();
                if let Some(callback) = callback {
                    let connection = Arc::clone(self);
                    let queued = old_len + remaining;
                    self.handle
                        .queue_in_loop(move || callback(&connection, queued));
                }
            }
            inner.output.append(&data[nwrote..]);
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        let still_writing = self.channel().map_or(false, |channel| channel.is_writing());
        if !still_writing {
            if let Err(err) = sys::shutdown_write(self.socket.as_raw_fd()) {
                error!("connection {} shutdown: {}", self.name, err);
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "connection {} dropped, fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}
