use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use log::error;

use crate::sys::syscall;
use crate::timestamp::Timestamp;

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Never arm the timerfd with less than this, and never with zero (a zero
/// `it_value` disarms it).
const MIN_DELAY: Duration = Duration::from_micros(100);

pub(crate) struct Timer {
    pub(crate) callback: Rc<dyn Fn()>,
    interval: Option<Duration>,
    sequence: u64,
}

/// Per-loop timer queue multiplexed over a single `timerfd`.
///
/// Timers are ordered by `(expiration, sequence)` so two timers due at the
/// same instant fire in creation order. The timerfd is re-armed from the
/// earliest pending expiration whenever the front of the queue changes.
///
/// Expired callbacks run on the loop thread with the queue unborrowed, so a
/// callback may freely schedule new timers or cancel others — including
/// itself, which suppresses the re-arm of a repeating timer.
pub(crate) struct TimerQueue {
    fd: OwnedFd,
    timers: BTreeMap<(Timestamp, u64), Timer>,
    expirations: HashMap<u64, Timestamp>,
    next_sequence: u64,
    calling_expired: bool,
    cancelled_while_calling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        Ok(TimerQueue {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            timers: BTreeMap::new(),
            expirations: HashMap::new(),
            next_sequence: 1,
            calling_expired: false,
            cancelled_while_calling: HashSet::new(),
        })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn add(
        &mut self,
        when: Timestamp,
        interval: Option<Duration>,
        callback: Rc<dyn Fn()>,
    ) -> TimerId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let earliest_changed = self
            .timers
            .first_key_value()
            .map_or(true, |((first, _), _)| when < *first);
        self.timers.insert(
            (when, sequence),
            Timer {
                callback,
                interval,
                sequence,
            },
        );
        self.expirations.insert(sequence, when);
        if earliest_changed {
            self.rearm();
        }
        TimerId(sequence)
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.expirations.remove(&id.0) {
            self.timers.remove(&(when, id.0));
        } else if self.calling_expired {
            // The timer is firing right now; remember not to restock it.
            self.cancelled_while_calling.insert(id.0);
        }
    }

    /// Drains the timerfd counter and pops every timer due at `now`.
    pub(crate) fn begin_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        self.read_event();
        self.calling_expired = true;
        self.cancelled_while_calling.clear();
        let mut due = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (_, timer) = entry.remove_entry();
            self.expirations.remove(&timer.sequence);
            due.push(timer);
        }
        due
    }

    /// Re-inserts still-wanted repeating timers and re-arms the timerfd.
    pub(crate) fn finish_expired(&mut self, due: Vec<Timer>, now: Timestamp) {
        self.calling_expired = false;
        for timer in due {
            if let Some(interval) = timer.interval {
                if !self.cancelled_while_calling.contains(&timer.sequence) {
                    let next = now + interval;
                    self.expirations.insert(timer.sequence, next);
                    self.timers.insert((next, timer.sequence), timer);
                }
            }
        }
        self.cancelled_while_calling.clear();
        self.rearm();
    }

    fn read_event(&self) {
        let mut buf = [0u8; 8];
        if let Err(err) = syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("timerfd read: {}", err);
            }
        }
    }

    fn rearm(&self) {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        if let Some(((when, _), _)) = self.timers.first_key_value() {
            let delay = when.duration_since(Timestamp::now()).max(MIN_DELAY);
            spec.it_value.tv_sec = delay.as_secs() as libc::time_t;
            spec.it_value.tv_nsec = delay.subsec_nanos() as libc::c_long;
        }
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            ptr::null_mut(),
        )) {
            error!("timerfd_settime: {}", err);
        }
    }
}
