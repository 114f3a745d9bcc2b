use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Weak as ArcWeak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::interest::Interest;
use crate::poller::ChannelState;
use crate::timestamp::Timestamp;

pub(crate) type ReadCallback = Rc<dyn Fn(Timestamp)>;
pub(crate) type EventCallback = Rc<dyn Fn()>;

/// Binds one file descriptor's interest bits and callbacks to its owning
/// loop.
///
/// A `Channel` never owns the descriptor; the object that created it does
/// (the connection its socket, the acceptor its listening socket, the loop
/// its wakeup eventfd). Every method must be called on the owning loop's
/// thread. Interest mutators push the new mask into the poller immediately;
/// after [`disable_all`] a channel must be [`remove`]d before it is dropped.
///
/// The optional *tie* is a weak reference to a shared owner. While a tie is
/// installed, events are dispatched only if the weak reference can be
/// upgraded, so callbacks never run against an owner that was destroyed
/// earlier in the same poll iteration.
///
/// [`disable_all`]: Channel::disable_all
/// [`remove`]: Channel::remove
pub struct Channel {
    me: Weak<Channel>,
    owner: Weak<EventLoop>,
    fd: RawFd,
    interest: Cell<Interest>,
    revents: Cell<u32>,
    state: Cell<ChannelState>,
    tied: Cell<bool>,
    tie: RefCell<Option<ArcWeak<dyn Any + Send + Sync>>>,
    handling: Cell<bool>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    /// Creates a channel for `fd` owned by `event_loop`.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|me| Channel {
            me: me.clone(),
            owner: Rc::downgrade(event_loop),
            fd,
            interest: Cell::new(Interest::NONE),
            revents: Cell::new(0),
            state: Cell::new(ChannelState::New),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            handling: Cell::new(false),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    /// The monitored file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The currently registered interest set.
    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    /// The loop this channel belongs to, while it is still alive.
    pub fn owner_loop(&self) -> Option<Rc<EventLoop>> {
        self.owner.upgrade()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.set(state);
    }

    pub(crate) fn self_rc(&self) -> Rc<Channel> {
        self.me.upgrade().expect("channel invoked after teardown")
    }

    /// Installs the readable-readiness callback.
    pub fn set_read_callback(&self, callback: impl Fn(Timestamp) + 'static) {
        *self.read_cb.borrow_mut() = Some(Rc::new(callback));
    }

    /// Installs the writable-readiness callback.
    pub fn set_write_callback(&self, callback: impl Fn() + 'static) {
        *self.write_cb.borrow_mut() = Some(Rc::new(callback));
    }

    /// Installs the peer-close callback.
    pub fn set_close_callback(&self, callback: impl Fn() + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(callback));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, callback: impl Fn() + 'static) {
        *self.error_cb.borrow_mut() = Some(Rc::new(callback));
    }

    /// Gates event dispatch on `owner` staying alive.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(Arc::downgrade(owner));
        self.tied.set(true);
    }

    /// Starts monitoring readable readiness.
    pub fn enable_reading(&self) {
        self.interest.set(self.interest.get().add(Interest::READ));
        self.update();
    }

    /// Stops monitoring readable readiness.
    pub fn disable_reading(&self) {
        self.interest.set(self.interest.get().remove(Interest::READ));
        self.update();
    }

    /// Starts monitoring writable readiness.
    pub fn enable_writing(&self) {
        self.interest.set(self.interest.get().add(Interest::WRITE));
        self.update();
    }

    /// Stops monitoring writable readiness.
    pub fn disable_writing(&self) {
        self.interest.set(self.interest.get().remove(Interest::WRITE));
        self.update();
    }

    /// Clears the whole interest set, leaving the channel tombstoned in the
    /// poller's map.
    pub fn disable_all(&self) {
        self.interest.set(Interest::NONE);
        self.update();
    }

    /// Returns true while writable readiness is monitored.
    pub fn is_writing(&self) -> bool {
        self.interest.get().is_writable()
    }

    /// Returns true while readable readiness is monitored.
    pub fn is_reading(&self) -> bool {
        self.interest.get().is_readable()
    }

    /// Drops the channel from the poller's map entirely.
    ///
    /// The interest set must already be empty.
    pub fn remove(&self) {
        assert!(
            self.interest.get().is_none(),
            "channel fd={} removed while still registered for events",
            self.fd
        );
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(&self) {
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Dispatches the readiness recorded by the poller for this iteration.
    pub(crate) fn handle_event(&self, at: Timestamp) {
        if self.tied.get() {
            let guard = self.tie.borrow().as_ref().and_then(ArcWeak::upgrade);
            match guard {
                // The guard keeps the owner alive for the whole dispatch.
                Some(_owner) => self.handle_event_with_guard(at),
                // The owner died earlier in this iteration.
                None => {}
            }
        } else {
            self.handle_event_with_guard(at);
        }
    }

    fn handle_event_with_guard(&self, at: Timestamp) {
        let revents = self.revents.get() as libc::c_int;
        trace!("channel fd={} dispatching revents {:#x}", self.fd, revents);
        self.handling.set(true);
        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            let callback = self.close_cb.borrow().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        if revents & libc::EPOLLERR != 0 {
            let callback = self.error_cb.borrow().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0 {
            let callback = self.read_cb.borrow().clone();
            if let Some(callback) = callback {
                callback(at);
            }
        }
        if revents & libc::EPOLLOUT != 0 {
            let callback = self.write_cb.borrow().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        self.handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.handling.get(), "channel dropped mid-dispatch");
    }
}
