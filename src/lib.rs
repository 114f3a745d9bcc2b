//! A multi-reactor TCP server library for Linux.
//!
//! `muxio` is built on the "one loop per thread" design: every thread runs at
//! most one [`EventLoop`], a reactor that blocks in `epoll_wait`, dispatches
//! readiness to per-fd [`Channel`]s and then executes work queued from other
//! threads. A [`TcpServer`] accepts on the constructing thread's loop and
//! hands each connection round-robin to a pool of worker loops; a
//! [`TcpConnection`] and all of its callbacks stay confined to that one
//! worker for the connection's entire life, so per-connection state needs no
//! locking.
//!
//! Message boundaries are the application's business: the message callback
//! receives the connection's input [`Buffer`] and consumes however much it
//! can parse, leaving the rest for the next readable event.
//!
//! # Example
//!
//! An echo server that closes each connection after answering:
//!
//! ```no_run
//! use muxio::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let server = TcpServer::new(&event_loop, "127.0.0.1:6000".parse().unwrap(), "echo", false)?;
//!     server.set_message_callback(|conn, input, _at| {
//!         let bytes = input.consume_all_as_bytes();
//!         conn.send(&bytes);
//!         conn.shutdown();
//!     });
//!     server.set_thread_num(4);
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! Only Linux is supported; the implementation leans on `epoll`, `eventfd`
//! and `timerfd`.

#![warn(missing_docs)]

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod event_loop_thread;
mod interest;
mod poller;
mod server;
mod sys;
mod thread_pool;
mod timer;
mod timestamp;
mod waker;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback,
};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use interest::Interest;
pub use server::TcpServer;
pub use thread_pool::EventLoopThreadPool;
pub use timer::TimerId;
pub use timestamp::Timestamp;
