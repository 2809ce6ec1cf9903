//! The channel: a descriptor bound to event callbacks.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::{trace, warn};

use crate::event::EventSet;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// Registration state of a channel with its loop's poller.
///
/// `Deleted` means the file descriptor is no longer registered with the
/// kernel but the poller's map still knows the channel, so re-enabling
/// events takes a single registration call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ChannelState {
    New,
    Added,
    Deleted,
}

/// Binds a file descriptor to a set of event callbacks.
///
/// A channel is owned by some higher-level construct (an acceptor, a
/// connection, the loop's own wake-up machinery) and is pinned to the thread
/// of its [`EventLoop`]. It never owns the descriptor itself; the owner must
/// keep the descriptor open while the channel is registered and call
/// [`remove`] before closing it.
///
/// Enabling an event registers the channel with the loop's poller; when the
/// kernel reports readiness the matching callbacks run on the loop thread.
///
/// [`remove`]: Channel::remove
///
/// # Examples
///
/// ```
/// # fn main() -> std::io::Result<()> {
/// use rhea::{Channel, EventLoop};
///
/// let event_loop = EventLoop::new()?;
///
/// // An eventfd stands in for any readable descriptor.
/// let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
/// assert!(fd != -1);
///
/// let channel = Channel::new(&event_loop, fd);
/// let handle = event_loop.handle();
/// channel.set_read_callback(move |_now| {
///     println!("descriptor became readable");
///     handle.quit();
/// });
/// channel.enable_reading();
///
/// // Make the descriptor readable, then run until the callback quits.
/// let n = unsafe { libc::write(fd, 1u64.to_ne_bytes().as_ptr().cast(), 8) };
/// assert_eq!(n, 8);
/// event_loop.run_loop();
///
/// channel.disable_all();
/// channel.remove();
/// unsafe { libc::close(fd) };
/// # Ok(())
/// # }
/// ```
pub struct Channel {
    fd: RawFd,
    interest: Cell<EventSet>,
    ready: Cell<EventSet>,
    state: Cell<ChannelState>,
    in_loop: Cell<bool>,
    dispatching: Cell<bool>,
    log_hang_up: Cell<bool>,
    tied: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any>>>,
    read_callback: RefCell<Option<Box<dyn FnMut(Timestamp)>>>,
    write_callback: RefCell<Option<Box<dyn FnMut()>>>,
    close_callback: RefCell<Option<Box<dyn FnMut()>>>,
    error_callback: RefCell<Option<Box<dyn FnMut()>>>,
    owner: Weak<EventLoop>,
    weak_self: Weak<Channel>,
}

impl Channel {
    /// Creates a channel for `fd`, owned by `event_loop`.
    ///
    /// The channel starts without interests and without callbacks; nothing is
    /// registered with the kernel until an event is enabled.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Channel::with_weak_owner(Rc::downgrade(event_loop), fd)
    }

    /// Creates a channel from a not-yet-upgradable loop reference. This is
    /// how the loop builds its own wake-up and timer channels while it is
    /// still under construction.
    pub(crate) fn with_weak_owner(owner: Weak<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|weak_self| Channel {
            fd,
            interest: Cell::new(EventSet::empty()),
            ready: Cell::new(EventSet::empty()),
            state: Cell::new(ChannelState::New),
            in_loop: Cell::new(false),
            dispatching: Cell::new(false),
            log_hang_up: Cell::new(true),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
            owner,
            weak_self: weak_self.clone(),
        })
    }

    /// Returns the file descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the events the channel is currently interested in.
    pub fn interest(&self) -> EventSet {
        self.interest.get()
    }

    /// Returns the ready events stamped by the last poll that reported this
    /// channel.
    pub fn ready(&self) -> EventSet {
        self.ready.get()
    }

    /// Whether the channel is interested in no events at all.
    pub fn is_none_event(&self) -> bool {
        self.interest.get().is_empty()
    }

    /// Whether reading is enabled.
    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(EventSet::READABLE)
    }

    /// Whether writing is enabled.
    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(EventSet::WRITABLE)
    }

    /// Whether the channel is currently registered with its loop.
    pub fn is_in_loop(&self) -> bool {
        self.in_loop.get()
    }

    /// Whether one of this channel's callbacks is executing right now.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.get()
    }

    /// Returns the owning event loop, or `None` once the loop was dropped.
    pub fn owner_loop(&self) -> Option<Rc<EventLoop>> {
        self.owner.upgrade()
    }

    /// Installs the callback for readable events. Overwrites any previous
    /// read callback. The callback receives the poll return time.
    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: FnMut(Timestamp) + 'static,
    {
        *self.read_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Installs the callback for writable events. Overwrites silently.
    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.write_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Installs the callback for hang-up events. Overwrites silently.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Installs the callback for error events. Overwrites silently.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        *self.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Ties the channel's dispatch to the lifetime of `owner`.
    ///
    /// Before every dispatch the weak handle is upgraded; if the owner was
    /// dropped in the meantime all callbacks for that cycle are skipped. The
    /// upgraded handle is held for the duration of the dispatch, so the owner
    /// cannot disappear halfway through a callback either.
    pub fn tie<T: 'static>(&self, owner: &Rc<T>) {
        let owner: Rc<dyn Any> = owner.clone();
        let weak: Weak<dyn Any> = Rc::downgrade(&owner);
        *self.tie.borrow_mut() = Some(weak);
        self.tied.set(true);
    }

    /// Start watching for readable events.
    pub fn enable_reading(&self) {
        self.interest.set(self.interest.get() | EventSet::READ_INTEREST);
        self.update();
    }

    /// Stop watching for readable events.
    pub fn disable_reading(&self) {
        self.interest.set(self.interest.get() - EventSet::READ_INTEREST);
        self.update();
    }

    /// Start watching for writable events.
    pub fn enable_writing(&self) {
        self.interest.set(self.interest.get() | EventSet::WRITE_INTEREST);
        self.update();
    }

    /// Stop watching for writable events.
    pub fn disable_writing(&self) {
        self.interest.set(self.interest.get() - EventSet::WRITE_INTEREST);
        self.update();
    }

    /// Stop watching for any event.
    pub fn disable_all(&self) {
        self.interest.set(EventSet::empty());
        self.update();
    }

    /// Whether a hang-up without readable data is logged at warn level.
    /// Defaults to `true`; the loop's internal channels turn it off.
    pub fn set_log_hang_up(&self, log: bool) {
        self.log_hang_up.set(log);
    }

    /// Drops the channel from its loop's poller.
    ///
    /// The channel must be disabled first and must not be executing one of
    /// its own callbacks.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event());
        self.in_loop.set(false);
        if let Some(event_loop) = self.owner.upgrade() {
            // The self reference is set before the channel is handed out.
            let this = self.weak_self.upgrade().unwrap();
            event_loop.remove_channel(&this);
        }
    }

    /// Ask the owning loop to reconcile our interest set with the kernel.
    fn update(&self) {
        self.in_loop.set(true);
        match self.owner.upgrade() {
            Some(event_loop) => {
                let this = self.weak_self.upgrade().unwrap();
                event_loop.update_channel(&this);
            }
            None => warn!("channel fd={} updated after its event loop was dropped", self.fd),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.set(state);
    }

    pub(crate) fn set_ready(&self, ready: EventSet) {
        self.ready.set(ready);
    }

    #[cfg(test)]
    pub(crate) fn set_interest(&self, interest: EventSet) {
        self.interest.set(interest);
    }

    /// Runs the callbacks matching the stamped ready set.
    ///
    /// The order is fixed: a hang-up with nothing left to read runs the close
    /// callback first, errors run before reads so transport failures surface
    /// early, and reads run before writes.
    pub(crate) fn run_callbacks(&self, now: Timestamp) {
        if self.tied.get() {
            let guard = self.tie.borrow().as_ref().and_then(Weak::upgrade);
            match guard {
                Some(_owner) => self.run_callbacks_guarded(now),
                None => trace!("channel fd={}: tied owner is gone, skipping callbacks", self.fd),
            }
        } else {
            self.run_callbacks_guarded(now);
        }
    }

    fn run_callbacks_guarded(&self, now: Timestamp) {
        self.dispatching.set(true);
        let ready = self.ready.get();
        trace!("channel fd={}: handling {:?}", self.fd, ready);

        if ready.is_pure_hang_up() {
            if self.log_hang_up.get() {
                warn!("channel fd={}: hang up", self.fd);
            }
            invoke(&self.close_callback);
        }
        if ready.is_error() {
            invoke(&self.error_callback);
        }
        if ready.is_readable() {
            invoke_read(&self.read_callback, now);
        }
        if ready.is_writable() {
            invoke(&self.write_callback);
        }
        self.dispatching.set(false);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest.get())
            .field("ready", &self.ready.get())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

// Callbacks are taken out of their slot for the duration of the call so they
// may freely re-enter the channel, including installing a replacement; a
// replacement installed mid-call wins over restoring the taken closure.
fn invoke(slot: &RefCell<Option<Box<dyn FnMut()>>>) {
    let taken = slot.borrow_mut().take();
    if let Some(mut callback) = taken {
        callback();
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

fn invoke_read(slot: &RefCell<Option<Box<dyn FnMut(Timestamp)>>>, now: Timestamp) {
    let taken = slot.borrow_mut().take();
    if let Some(mut callback) = taken {
        callback(now);
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}
