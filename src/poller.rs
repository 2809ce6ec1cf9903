//! The poller: readiness dispatch and channel registration over the kernel
//! multiplexer.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::{error, trace};

use crate::channel::{Channel, ChannelState};
use crate::event::EventSet;
use crate::sys::Selector;
use crate::time::Timestamp;

/// Initial number of kernel event records per wait; doubled whenever a wait
/// fills the buffer completely.
const INITIAL_EVENTS_CAPACITY: usize = 16;

const EMPTY_EVENT: libc::epoll_event = libc::epoll_event { events: 0, u64: 0 };

/// The registration operation sent to the kernel.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Op {
    Add,
    Modify,
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Add => "ADD",
            Op::Modify => "MOD",
            Op::Delete => "DEL",
        })
    }
}

/// Maps file descriptors to channels and reconciles channel interest with
/// the kernel multiplexer.
///
/// Owned by an [`EventLoop`] and only ever touched from its thread; the loop
/// asserts affinity before forwarding calls here.
///
/// The kernel's opaque user data slot carries the registered file
/// descriptor; dispatch resolves it through the channel map, so a record for
/// a channel removed earlier in the same batch is recognized as stale and
/// skipped.
///
/// [`EventLoop`]: crate::EventLoop
pub(crate) struct Poller {
    selector: Selector,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("selector", &self.selector)
            .field("events_capacity", &self.events.len())
            .field("channels", &self.channels)
            .finish()
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: Selector::new()?,
            events: vec![EMPTY_EVENT; INITIAL_EVENTS_CAPACITY],
            channels: HashMap::new(),
        })
    }

    /// Waits for readiness for up to `timeout_ms`, appending every ready
    /// channel to `active` in kernel report order, and returns the poll
    /// return time.
    ///
    /// A signal interrupting the wait counts as zero events; other wait
    /// failures are logged and likewise produce zero events.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        trace!("polling: {} channels registered", self.channels.len());
        let result = self.selector.wait(&mut self.events, timeout_ms);
        let now = Timestamp::now();

        match result {
            Ok(0) => trace!("poll: nothing happened"),
            Ok(n) => {
                trace!("poll: {} events happened", n);
                self.collect_active(n, active);
                if n == self.events.len() {
                    // Saturated; give the next wait room to report more.
                    self.events.resize(n * 2, EMPTY_EVENT);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poller wait failed: {}", err),
        }
        now
    }

    /// Reconciles the channel's interest set with the kernel registration.
    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        let state = channel.state();
        trace!("update channel: fd={}, interest={:?}, state={:?}", fd, channel.interest(), state);

        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    let prev = self.channels.insert(fd, channel.clone());
                    assert!(prev.is_none(), "fd {} is already bound to another channel", fd);
                } else {
                    debug_assert!(self.has_channel(channel));
                }
                channel.set_state(ChannelState::Added);
                self.update(Op::Add, channel);
            }
            ChannelState::Added => {
                if channel.is_none_event() {
                    self.update(Op::Delete, channel);
                    // The map keeps the entry: re-enabling events later only
                    // needs a re-registration, not a re-insert.
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.update(Op::Modify, channel);
                }
            }
        }
    }

    /// Erases the channel from the map and, if it is still registered with
    /// the kernel, deregisters it.
    pub(crate) fn remove_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!("remove channel: fd={}", fd);
        debug_assert!(self.has_channel(channel));
        debug_assert!(channel.is_none_event());

        let _ = self.channels.remove(&fd);
        if channel.state() == ChannelState::Added {
            self.update(Op::Delete, channel);
        }
        channel.set_state(ChannelState::New);
    }

    /// Whether this exact channel is known to the poller.
    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |known| Rc::ptr_eq(known, channel))
    }

    #[cfg(test)]
    pub(crate) fn events_capacity(&self) -> usize {
        self.events.len()
    }

    fn collect_active(&self, n_events: usize, active: &mut Vec<Rc<Channel>>) {
        for event in &self.events[..n_events] {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_ready(EventSet::from_bits_truncate(event.events));
                    active.push(channel.clone());
                }
                None => trace!("poll: stale event for fd={}", fd),
            }
        }
    }

    fn update(&self, op: Op, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!("epoll op={} fd={} interest={:?}", op, fd, channel.interest());

        let result = match op {
            Op::Add => self.selector.add(fd, channel.interest().bits(), fd as u64),
            Op::Modify => self.selector.modify(fd, channel.interest().bits(), fd as u64),
            Op::Delete => self.selector.delete(fd),
        };
        if let Err(err) = result {
            if op == Op::Delete {
                // The descriptor may already be gone; dispatch keeps going.
                error!("epoll op={} fd={} failed: {}", op, fd, err);
            } else {
                error!("epoll op={} fd={} failed: {}", op, fd, err);
                panic!("failed to register fd {} with the poller: {}", fd, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::{Rc, Weak};

    use crate::channel::{Channel, ChannelState};
    use crate::event::EventSet;
    use crate::sys::Awakener;

    use super::Poller;

    // Interest changes normally flow through the owning loop; driving the
    // poller directly keeps these tests to one component.
    fn unowned_channel(fd: i32) -> Rc<Channel> {
        Channel::with_weak_owner(Weak::new(), fd)
    }

    #[test]
    fn registration_state_machine() {
        let mut poller = Poller::new().unwrap();
        let awakener = Awakener::new().unwrap();
        let channel = unowned_channel(awakener.as_raw_fd());
        assert_eq!(channel.state(), ChannelState::New);
        assert!(!poller.has_channel(&channel));

        // Enable: New -> Added, map gains the entry.
        channel.set_interest(EventSet::READ_INTEREST);
        poller.update_channel(&channel);
        assert_eq!(channel.state(), ChannelState::Added);
        assert!(poller.has_channel(&channel));

        // Disable everything: Added -> Deleted, map keeps the entry.
        channel.set_interest(EventSet::empty());
        poller.update_channel(&channel);
        assert_eq!(channel.state(), ChannelState::Deleted);
        assert!(poller.has_channel(&channel));

        // Re-enable: Deleted -> Added without a second map insert.
        channel.set_interest(EventSet::READ_INTEREST);
        poller.update_channel(&channel);
        assert_eq!(channel.state(), ChannelState::Added);

        // Remove: back to New, map entry gone.
        channel.set_interest(EventSet::empty());
        poller.update_channel(&channel);
        poller.remove_channel(&channel);
        assert_eq!(channel.state(), ChannelState::New);
        assert!(!poller.has_channel(&channel));

        // And a removed channel can be registered from scratch.
        channel.set_interest(EventSet::READ_INTEREST);
        poller.update_channel(&channel);
        assert_eq!(channel.state(), ChannelState::Added);
        assert!(poller.has_channel(&channel));
    }

    #[test]
    fn poll_stamps_ready_and_grows_buffer() {
        const CHANNELS: usize = 20;

        let mut poller = Poller::new().unwrap();
        let initial_capacity = poller.events_capacity();
        assert!(CHANNELS > initial_capacity);

        let mut awakeners = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..CHANNELS {
            let awakener = Awakener::new().unwrap();
            let channel = unowned_channel(awakener.as_raw_fd());
            channel.set_interest(EventSet::READ_INTEREST);
            poller.update_channel(&channel);
            awakener.wake().unwrap();
            awakeners.push(awakener);
            channels.push(channel);
        }

        // First wait fills the whole buffer and triggers the doubling.
        let mut active = Vec::new();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), initial_capacity);
        assert!(poller.events_capacity() >= 2 * initial_capacity);

        // Level-triggered: the next wait reports all of them in one batch.
        active.clear();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), CHANNELS);
        for channel in &active {
            assert!(channel.ready().contains(EventSet::READABLE));
        }

        for channel in &channels {
            channel.set_interest(EventSet::empty());
            poller.update_channel(channel);
            poller.remove_channel(channel);
        }
    }

    #[test]
    fn stale_events_are_skipped() {
        let mut poller = Poller::new().unwrap();
        let awakener = Awakener::new().unwrap();
        let channel = unowned_channel(awakener.as_raw_fd());
        channel.set_interest(EventSet::READ_INTEREST);
        poller.update_channel(&channel);
        awakener.wake().unwrap();

        // Remove after the descriptor became ready but before the wait: the
        // kernel record no longer resolves to a channel.
        channel.set_interest(EventSet::empty());
        poller.update_channel(&channel);
        poller.remove_channel(&channel);

        let mut active = Vec::new();
        poller.poll(10, &mut active);
        assert!(active.is_empty());
    }
}
