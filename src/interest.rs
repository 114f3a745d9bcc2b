use std::fmt;
use std::ops;

/// Readiness interests a [`Channel`] registers with its loop's poller.
///
/// `READ` covers normal and priority data (`EPOLLIN | EPOLLPRI`), `WRITE` is
/// `EPOLLOUT`. The empty set is a legal value: a channel whose interest has
/// been cleared stays known to the poller but is removed from the kernel
/// epoll set.
///
/// [`Channel`]: crate::Channel
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// No readiness monitored.
    pub const NONE: Interest = Interest(0);

    /// Readable readiness, including priority data.
    pub const READ: Interest = Interest(libc::EPOLLIN as u32 | libc::EPOLLPRI as u32);

    /// Writable readiness.
    pub const WRITE: Interest = Interest(libc::EPOLLOUT as u32);

    /// Returns the union of `self` and `other`.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Returns `self` with every bit of `other` cleared.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Returns true if the set includes readable readiness.
    pub const fn is_readable(self) -> bool {
        self.0 & Interest::READ.0 != 0
    }

    /// Returns true if the set includes writable readiness.
    pub const fn is_writable(self) -> bool {
        self.0 & Interest::WRITE.0 != 0
    }

    /// Returns true if no readiness is monitored.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn as_epoll(self) -> u32 {
        self.0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(fmt, "NONE");
        }
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READ")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read_only = both.remove(Interest::WRITE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        assert!(read_only.remove(Interest::READ).is_none());
    }

    #[test]
    fn debug_rendering() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(format!("{:?}", Interest::READ), "READ");
        assert_eq!(format!("{:?}", Interest::READ | Interest::WRITE), "READ | WRITE");
    }
}
