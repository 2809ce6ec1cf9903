//! Readiness and interest event sets.

bitflags::bitflags! {
    /// A set of readiness event kinds.
    ///
    /// `EventSet` is used in two places: as the *interest* set of a
    /// [`Channel`], describing which kinds of events the channel wants to be
    /// told about, and as the *ready* set stamped on the channel when the
    /// kernel reports the descriptor as ready.
    ///
    /// The bit values mirror the kernel's readiness bits, so translating
    /// between the two is a cast, not a mapping.
    ///
    /// [`Channel`]: crate::Channel
    ///
    /// # Examples
    ///
    /// ```
    /// use rhea::EventSet;
    ///
    /// let ready = EventSet::READABLE | EventSet::WRITABLE;
    ///
    /// assert!(ready.contains(EventSet::READABLE));
    /// assert!(!ready.contains(EventSet::ERROR));
    /// ```
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct EventSet: u32 {
        /// Readable readiness.
        const READABLE     = libc::EPOLLIN as u32;
        /// Priority (out-of-band) readable readiness.
        const PRIORITY     = libc::EPOLLPRI as u32;
        /// Writable readiness.
        const WRITABLE     = libc::EPOLLOUT as u32;
        /// Error readiness. Always reported, never part of an interest set.
        const ERROR        = libc::EPOLLERR as u32;
        /// Hang-up readiness. Always reported, never part of an interest set.
        const HANG_UP      = libc::EPOLLHUP as u32;
        /// The peer closed its end of the connection.
        const PEER_HANG_UP = libc::EPOLLRDHUP as u32;
    }
}

impl EventSet {
    /// The interest bits set by [`Channel::enable_reading`].
    ///
    /// [`Channel::enable_reading`]: crate::Channel::enable_reading
    pub const READ_INTEREST: EventSet = EventSet::READABLE.union(EventSet::PRIORITY);

    /// The interest bits set by [`Channel::enable_writing`].
    ///
    /// [`Channel::enable_writing`]: crate::Channel::enable_writing
    pub const WRITE_INTEREST: EventSet = EventSet::WRITABLE;

    /// Whether any readable-like bit is set, including a peer hang-up, which
    /// must be observed through a read returning zero.
    pub fn is_readable(self) -> bool {
        self.intersects(EventSet::READ_INTEREST.union(EventSet::PEER_HANG_UP))
    }

    /// Whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.contains(EventSet::WRITABLE)
    }

    /// Whether the error bit is set.
    pub fn is_error(self) -> bool {
        self.contains(EventSet::ERROR)
    }

    /// Whether this set signals a hang-up with nothing left to read.
    pub fn is_pure_hang_up(self) -> bool {
        self.contains(EventSet::HANG_UP) && !self.contains(EventSet::READABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::EventSet;

    #[test]
    fn matches_kernel_bits() {
        assert_eq!(EventSet::READABLE.bits(), libc::EPOLLIN as u32);
        assert_eq!(EventSet::PRIORITY.bits(), libc::EPOLLPRI as u32);
        assert_eq!(EventSet::WRITABLE.bits(), libc::EPOLLOUT as u32);
        assert_eq!(EventSet::ERROR.bits(), libc::EPOLLERR as u32);
        assert_eq!(EventSet::HANG_UP.bits(), libc::EPOLLHUP as u32);
        assert_eq!(EventSet::PEER_HANG_UP.bits(), libc::EPOLLRDHUP as u32);
    }

    #[test]
    fn readable_like() {
        assert!(EventSet::READABLE.is_readable());
        assert!(EventSet::PRIORITY.is_readable());
        assert!(EventSet::PEER_HANG_UP.is_readable());
        assert!(!EventSet::WRITABLE.is_readable());
        assert!(EventSet::WRITABLE.is_writable());
    }

    #[test]
    fn pure_hang_up() {
        assert!(EventSet::HANG_UP.is_pure_hang_up());
        assert!((EventSet::HANG_UP | EventSet::WRITABLE).is_pure_hang_up());
        // Readable data must be drained before the hang-up is acted on.
        assert!(!(EventSet::HANG_UP | EventSet::READABLE).is_pure_hang_up());
        assert!(!EventSet::READABLE.is_pure_hang_up());
    }
}
