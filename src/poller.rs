use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

/// A channel's membership in the poller.
///
/// `Deleted` channels stay in the fd map but are absent from the kernel
/// epoll set, so re-arming them needs no fresh insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    New,
    Added,
    Deleted,
}

const INITIAL_EVENT_CAPACITY: usize = 16;

/// Wraps the kernel epoll set for one loop.
///
/// Owns the epoll descriptor and the fd → channel map. Kernel events carry
/// the fd; dispatch resolves it through the map, so an event raced against
/// channel removal falls out harmlessly.
pub(crate) struct Poller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Poller {
            ep,
            events: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
            channels: HashMap::new(),
        })
    }

    /// Blocks in `epoll_wait`, appending each fired channel to `active`
    /// after recording its readiness. Returns the wall-clock time at which
    /// the wait returned.
    pub(crate) fn poll(&mut self, timeout_ms: libc::c_int, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        trace!("polling {} channels", self.channels.len());
        self.events.clear();
        let result = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Timestamp::now();
        match result {
            Ok(fired) => {
                let fired = fired as usize;
                // `epoll_wait` filled exactly `fired` entries.
                unsafe { self.events.set_len(fired) };
                if fired > 0 {
                    trace!("{} events fired", fired);
                    for event in &self.events {
                        let fd = event.u64 as RawFd;
                        if let Some(channel) = self.channels.get(&fd) {
                            channel.set_revents(event.events);
                            active.push(Rc::clone(channel));
                        }
                    }
                    // Equality, not >=: the kernel never reports more events
                    // than the capacity it was handed.
                    if fired == self.events.capacity() {
                        let grow = self.events.capacity();
                        self.events.reserve_exact(grow);
                    }
                } else {
                    debug!("epoll_wait timed out");
                }
            }
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => error!("epoll_wait: {}", err),
        }
        now
    }

    pub(crate) fn update_channel(&mut self, channel: &Channel) {
        let state = channel.state();
        trace!(
            "update channel fd={} interest={:?} state={:?}",
            channel.fd(),
            channel.interest(),
            state
        );
        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    self.channels.insert(channel.fd(), channel.self_rc());
                } else {
                    debug_assert!(self.channels.contains_key(&channel.fd()));
                }
                channel.set_state(ChannelState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelState::Added => {
                if channel.interest().is_none() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let state = channel.state();
        trace!("remove channel fd={}", channel.fd());
        debug_assert!(state == ChannelState::Added || state == ChannelState::Deleted);
        self.channels.remove(&channel.fd());
        if state == ChannelState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(ChannelState::New);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|entry| ptr::eq(Rc::as_ptr(entry), channel))
    }

    pub(crate) fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.get(&fd).cloned()
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.interest().as_epoll(),
            u64: channel.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, channel.fd(), &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd={}: {}", channel.fd(), err);
            } else {
                panic!("epoll_ctl op={} fd={}: {}", op, channel.fd(), err);
            }
        }
    }
}
