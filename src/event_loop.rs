//! The event loop: per-thread readiness dispatch.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::{Awakener, TimerFd};
use crate::time::Timestamp;
use crate::timer::{TimerId, TimerQueue};

/// How long a single poll may block while the loop is idle. Wake-ups, timer
/// ticks and readiness all end the wait early.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A task marshalled onto an event loop's thread. It receives the owning
/// loop, which is how cross-thread callers reach loop-local state.
type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    /// At most one event loop exists per thread; this slot is how callbacks
    /// and marshalled tasks find it without carrying an owning reference.
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = RefCell::new(None);
}

/// The cross-thread-safe part of an event loop, shared between the loop and
/// all of its [`LoopHandle`]s.
pub(crate) struct Shared {
    thread: ThreadId,
    quit: AtomicBool,
    running_extra_tasks: AtomicBool,
    extra_tasks: Mutex<Vec<Task>>,
    awakener: Awakener,
    next_timer_seq: AtomicU64,
}

impl Shared {
    fn in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn queue_task(&self, task: Task) {
        self.extra_tasks.lock().unwrap().push(task);
    }

    fn next_timer_id(&self, when: Timestamp) -> TimerId {
        TimerId::new(when, self.next_timer_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn wakeup(&self) {
        if let Err(err) = self.awakener.wake() {
            error!("failed to wake up event loop: {}", err);
        }
    }
}

/// A single-threaded, callback-driven event loop.
///
/// An `EventLoop` is bound to the thread that creates it and multiplexes
/// three sources of work on that thread:
///
///  * readiness events for registered [`Channel`]s,
///  * [timers], driven by a kernel timer descriptor,
///  * [extra tasks], closures submitted from any thread and run at the end
///    of the iteration in which they are picked up.
///
/// Every iteration of [`run_loop`] blocks on the kernel multiplexer (at most
/// 10 seconds), dispatches the callbacks of every ready channel in the order
/// the kernel reported them, and then drains the extra task queue. Other
/// threads interact with the loop exclusively through a [`LoopHandle`],
/// whose submissions write to a wake-up descriptor to end the blocking wait
/// early.
///
/// Creating a second `EventLoop` on a thread that already has a live one
/// panics.
///
/// [timers]: EventLoop::run_at
/// [extra tasks]: EventLoop::add_extra_task
/// [`run_loop`]: EventLoop::run_loop
///
/// # Examples
///
/// ```
/// # fn main() -> std::io::Result<()> {
/// use rhea::EventLoop;
///
/// let event_loop = EventLoop::new()?;
///
/// // Stop the loop once the timer fires.
/// let handle = event_loop.handle();
/// event_loop.run_after(0.01, move || handle.quit());
///
/// event_loop.run_loop();
/// assert!(event_loop.loop_count() >= 1);
/// # Ok(())
/// # }
/// ```
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    timers: TimerQueue,
    wakeup_channel: Rc<Channel>,
    looping: Cell<bool>,
    running_callbacks: Cell<bool>,
    loop_count: Cell<u64>,
    poll_return_time: Cell<Timestamp>,
}

impl EventLoop {
    /// Creates an event loop bound to the current thread.
    ///
    /// This allocates the kernel resources the loop lives on (the
    /// multiplexer handle, the wake-up descriptor and the timer descriptor)
    /// and installs the loop in this thread's current-loop slot.
    ///
    /// The first loop of the process also ignores `SIGPIPE` process-wide: a
    /// peer closing its socket must surface as a write error, not kill the
    /// process.
    ///
    /// # Panics
    ///
    /// Panics if another `EventLoop` already lives on this thread.
    pub fn new() -> io::Result<Rc<EventLoop>> {
        ignore_sigpipe();

        CURRENT_LOOP.with(|current| {
            if current.borrow().as_ref().and_then(Weak::upgrade).is_some() {
                panic!("another EventLoop already exists on thread {:?}", thread::current().id());
            }
        });

        let poller = Poller::new()?;
        let awakener = Awakener::new()?;
        let timer_fd = TimerFd::new()?;
        let wakeup_fd = awakener.as_raw_fd();
        let timer_fd_raw = timer_fd.as_raw_fd();

        let shared = Arc::new(Shared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            running_extra_tasks: AtomicBool::new(false),
            extra_tasks: Mutex::new(Vec::new()),
            awakener,
            next_timer_seq: AtomicU64::new(0),
        });

        let event_loop = Rc::new_cyclic(|weak| EventLoop {
            shared,
            poller: RefCell::new(poller),
            timers: TimerQueue::new(timer_fd, Channel::with_weak_owner(weak.clone(), timer_fd_raw)),
            wakeup_channel: Channel::with_weak_owner(weak.clone(), wakeup_fd),
            looping: Cell::new(false),
            running_callbacks: Cell::new(false),
            loop_count: Cell::new(0),
            poll_return_time: Cell::new(Timestamp::now()),
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(Rc::downgrade(&event_loop));
        });

        let shared = event_loop.shared.clone();
        event_loop.wakeup_channel.set_log_hang_up(false);
        event_loop.wakeup_channel.set_read_callback(move |_now| {
            match shared.awakener.drain() {
                Ok(writes) => trace!("event loop woken up: {} writes", writes),
                Err(err) => error!("failed to drain wake-up descriptor: {}", err),
            }
        });
        event_loop.wakeup_channel.enable_reading();
        event_loop.timers.install(&event_loop);

        debug!("EventLoop created on thread {:?}", event_loop.shared.thread);
        Ok(event_loop)
    }

    /// Returns the event loop living on the current thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Returns a cheap, cloneable handle usable from any thread.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the loop until [`quit`] is requested.
    ///
    /// Each iteration waits on the multiplexer, runs the callbacks of every
    /// ready channel in kernel report order, then drains the extra task
    /// queue. A quit request lets the current iteration finish; no new
    /// iteration begins after it is observed. The request is sticky: a quit
    /// that lands before the loop starts makes it return without polling,
    /// so a worker shutting down cannot miss it.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run_loop(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run_loop called from a callback");
        self.looping.set(true);
        debug!("EventLoop start looping");

        let mut active = Vec::new();
        while !self.shared.quit.load(Ordering::SeqCst) {
            active.clear();
            let return_time = self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return_time.set(return_time);
            self.loop_count.set(self.loop_count.get() + 1);

            self.running_callbacks.set(true);
            for channel in &active {
                channel.run_callbacks(return_time);
            }
            self.running_callbacks.set(false);

            self.run_extra_tasks();
        }

        debug!("EventLoop stop looping");
        self.looping.set(false);
    }

    /// Requests the loop to stop after the current iteration.
    ///
    /// From a foreign thread use [`LoopHandle::quit`], which also interrupts
    /// a blocked wait.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
    }

    /// Runs `task` immediately. The cross-thread counterpart,
    /// [`LoopHandle::run`], runs it here only when called on this thread and
    /// enqueues it otherwise.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop),
    {
        task(self);
    }

    /// Enqueues `task` to run at the end of the current (or next) iteration,
    /// after all channel callbacks.
    ///
    /// Tasks enqueued while the loop is draining the task queue are not run
    /// in the same drain; a wake-up guarantees they are picked up by the
    /// next iteration instead of sitting behind a blocked wait.
    pub fn add_extra_task<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.queue_task(Box::new(task));
        if self.shared.running_extra_tasks.load(Ordering::Relaxed) {
            self.shared.wakeup();
        }
    }

    /// Forces the next (or current) multiplexer wait to return by writing to
    /// the wake-up descriptor.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Schedules `callback` to run once at `when`. A time already in the
    /// past fires on the next iteration.
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + 'static,
    {
        let id = self.shared.next_timer_id(when);
        self.timers.insert(id, 0.0, false, Box::new(callback));
        id
    }

    /// Schedules `callback` to run once, `delay_secs` seconds from now.
    pub fn run_after<F>(&self, delay_secs: f64, callback: F) -> TimerId
    where
        F: FnMut() + 'static,
    {
        self.run_at(Timestamp::now().add_seconds(delay_secs), callback)
    }

    /// Schedules `callback` to run every `interval_secs` seconds, starting
    /// one interval from now, until cancelled.
    pub fn run_every<F>(&self, interval_secs: f64, callback: F) -> TimerId
    where
        F: FnMut() + 'static,
    {
        let id = self.shared.next_timer_id(Timestamp::now().add_seconds(interval_secs));
        self.timers.insert(id, interval_secs, true, Box::new(callback));
        id
    }

    /// Cancels a pending timer. Unknown handles are a no-op; a timer that is
    /// currently running can no longer be un-run, but a repeating one will
    /// not be re-armed.
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Registers or re-registers `channel` with the poller. Called by the
    /// channel's `enable_*`/`disable_*` methods.
    pub fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Drops `channel` from the poller. Called by [`Channel::remove`].
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    /// Whether exactly this channel is registered with the poller.
    pub fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// Whether the calling thread is the loop's thread. Always true for
    /// safe callers: the loop cannot be sent to, nor shared with, another
    /// thread.
    pub fn in_loop_thread(&self) -> bool {
        self.shared.in_loop_thread()
    }

    /// Panics when called from a thread other than the loop's.
    pub fn assert_in_loop_thread(&self) {
        if !self.in_loop_thread() {
            error!(
                "EventLoop owned by thread {:?} used from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
            panic!("EventLoop used from the wrong thread");
        }
    }

    /// Whether the loop is currently dispatching channel callbacks.
    pub fn is_running_callbacks(&self) -> bool {
        self.running_callbacks.get()
    }

    /// The time the most recent poll returned.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    /// Number of completed poll iterations.
    pub fn loop_count(&self) -> u64 {
        self.loop_count.get()
    }

    /// Number of extra tasks waiting to be drained.
    pub fn queued_task_count(&self) -> usize {
        self.shared.extra_tasks.lock().unwrap().len()
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timers
    }

    /// Swap the queue empty under the lock, then run the tasks with the lock
    /// released: this bounds how long producers block and lets tasks enqueue
    /// further tasks without deadlocking.
    fn run_extra_tasks(&self) {
        self.shared.running_extra_tasks.store(true, Ordering::Relaxed);

        let tasks = std::mem::take(&mut *self.shared.extra_tasks.lock().unwrap());
        for task in tasks {
            task(self);
        }

        self.shared.running_extra_tasks.store(false, Ordering::Relaxed);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread)
            .field("looping", &self.looping.get())
            .field("loop_count", &self.loop_count.get())
            .finish_non_exhaustive()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("EventLoop of thread {:?} dropped", self.shared.thread);
        // Only clear the slot if it still points at us; a panicking
        // constructor must not wipe another loop's registration.
        let _ = CURRENT_LOOP.try_with(|current| {
            let mut current = current.borrow_mut();
            if let Some(weak) = current.as_ref() {
                if std::ptr::eq(weak.as_ptr(), self) {
                    *current = None;
                }
            }
        });
    }
}

/// A cheap, cloneable, `Send + Sync` handle to an [`EventLoop`].
///
/// The handle is how foreign threads talk to a loop: submissions go through
/// the loop's mutex-guarded task queue and, when needed, a write to the
/// wake-up descriptor that ends a blocked multiplexer wait. Handles remain
/// valid after the loop is gone; submissions then go nowhere.
///
/// Two handles compare equal when they refer to the same loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Whether the calling thread is the loop's thread.
    pub fn in_loop_thread(&self) -> bool {
        self.shared.in_loop_thread()
    }

    /// Runs `task` on the loop's thread: immediately when already there,
    /// otherwise as an [extra task].
    ///
    /// [extra task]: LoopHandle::add_extra_task
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.in_loop_thread() {
            if let Some(event_loop) = EventLoop::current() {
                if Arc::ptr_eq(&event_loop.shared, &self.shared) {
                    task(&event_loop);
                    return;
                }
            }
        }
        self.add_extra_task(task);
    }

    /// Enqueues `task` for the end of the loop's current (or next)
    /// iteration, after all channel callbacks. Tasks are run in submission
    /// order per producing thread.
    pub fn add_extra_task<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.queue_task(Box::new(task));
        // A foreign producer must interrupt a blocked wait; so must a task
        // enqueued from within the drain, which would otherwise sit in the
        // queue until something else wakes the loop.
        if !self.in_loop_thread() || self.shared.running_extra_tasks.load(Ordering::Relaxed) {
            self.shared.wakeup();
        }
    }

    /// Requests the loop to stop after its current iteration, interrupting a
    /// blocked wait when called from a foreign thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.in_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Forces the loop's next (or current) multiplexer wait to return.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Schedules `callback` on the loop to run once at `when`.
    ///
    /// The returned handle is immediately usable with [`cancel`], even
    /// before the loop picked the timer up.
    ///
    /// [`cancel`]: LoopHandle::cancel
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.shared.next_timer_id(when);
        self.run(move |event_loop| {
            event_loop.timer_queue().insert(id, 0.0, false, Box::new(callback));
        });
        id
    }

    /// Schedules `callback` on the loop to run once, `delay_secs` seconds
    /// from now.
    pub fn run_after<F>(&self, delay_secs: f64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Timestamp::now().add_seconds(delay_secs), callback)
    }

    /// Schedules `callback` on the loop to run every `interval_secs`
    /// seconds until cancelled.
    pub fn run_every<F>(&self, interval_secs: f64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.shared.next_timer_id(Timestamp::now().add_seconds(interval_secs));
        self.run(move |event_loop| {
            event_loop.timer_queue().insert(id, interval_secs, true, Box::new(callback));
        });
        id
    }

    /// Cancels a pending timer on the loop's thread.
    pub fn cancel(&self, id: TimerId) {
        self.run(move |event_loop| event_loop.timer_queue().cancel(id));
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

fn ignore_sigpipe() {
    static IGNORE_SIGPIPE: Once = Once::new();
    IGNORE_SIGPIPE.call_once(|| unsafe {
        let _ = libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
