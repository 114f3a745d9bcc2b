use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys;

/// Invoked on the base loop with each freshly accepted socket and its peer
/// address.
pub type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr)>;

/// The listening reactor on the base loop.
///
/// Owns the listening socket and its channel; every readable event accepts
/// one connection and hands it to the new-connection callback. A spare
/// descriptor on `/dev/null` is kept in reserve so that hitting the process
/// fd limit can be recovered in place: release the spare, accept the pending
/// connection, close it, re-open the spare. Without that dance the listening
/// socket would stay readable forever while `accept` keeps failing.
pub struct Acceptor {
    socket: OwnedFd,
    channel: Rc<Channel>,
    local_addr: SocketAddr,
    idle_fd: RefCell<Option<OwnedFd>>,
    listening: Cell<bool>,
    on_new_connection: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates a bound (not yet listening) acceptor on `event_loop`.
    pub fn new(
        event_loop: &Rc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Rc<Acceptor>> {
        let socket = sys::new_tcp_socket(&listen_addr)?;
        sys::set_reuse_addr(socket.as_raw_fd(), true)?;
        if reuse_port {
            sys::set_reuse_port(socket.as_raw_fd(), true)?;
        }
        sys::bind(socket.as_raw_fd(), listen_addr)?;
        let local_addr = sys::local_addr(socket.as_raw_fd())?;
        let idle_fd = sys::open_idle_fd()?;
        let channel = Channel::new(event_loop, socket.as_raw_fd());

        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            local_addr,
            idle_fd: RefCell::new(Some(idle_fd)),
            listening: Cell::new(false),
            on_new_connection: RefCell::new(None),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_at| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    /// Installs the callback receiving accepted sockets.
    pub fn set_new_connection_callback(&self, callback: impl Fn(OwnedFd, SocketAddr) + 'static) {
        *self.on_new_connection.borrow_mut() = Some(Box::new(callback));
    }

    /// The bound listening address, with the kernel-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true once [`listen`] has run.
    ///
    /// [`listen`]: Acceptor::listen
    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// Starts listening and arms read interest on the base loop.
    pub fn listen(&self) -> io::Result<()> {
        self.listening.set(true);
        sys::listen(self.socket.as_raw_fd())?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        match sys::accept(self.socket.as_raw_fd()) {
            Ok((connection, peer_addr)) => {
                let callback = self.on_new_connection.borrow();
                match callback.as_ref() {
                    Some(callback) => callback(connection, peer_addr),
                    // Nobody wants it; closing is the only sane answer.
                    None => drop(connection),
                }
            }
            Err(err) => {
                error!("accept on {}: {}", self.local_addr, err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    self.recover_from_emfile();
                }
            }
        }
    }

    fn recover_from_emfile(&self) {
        warn!(
            "fd table exhausted accepting on {}, draining via the reserve fd",
            self.local_addr
        );
        let mut idle = self.idle_fd.borrow_mut();
        drop(idle.take());
        if let Ok((connection, _peer_addr)) = sys::accept(self.socket.as_raw_fd()) {
            drop(connection);
        }
        match sys::open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => error!("re-opening the reserve fd: {}", err),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
