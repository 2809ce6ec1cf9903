//! Timers and the per-loop timer queue.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::TimerFd;
use crate::time::Timestamp;

/// Handle to a scheduled timer, returned by [`EventLoop::run_at`] and
/// friends and accepted by [`EventLoop::cancel`].
///
/// Two distinct timers scheduled for the same instant are told apart by a
/// process-wide serial, so handles stay unambiguous and totally ordered.
///
/// [`EventLoop::run_at`]: crate::EventLoop::run_at
/// [`EventLoop::cancel`]: crate::EventLoop::cancel
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerId {
    pub(crate) when: Timestamp,
    pub(crate) seq: u64,
}

impl TimerId {
    pub(crate) fn new(when: Timestamp, seq: u64) -> TimerId {
        TimerId { when, seq }
    }
}

struct Timer {
    callback: Box<dyn FnMut()>,
    when: Timestamp,
    interval_secs: f64,
    repeating: bool,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("when", &self.when)
            .field("interval_secs", &self.interval_secs)
            .field("repeating", &self.repeating)
            .finish_non_exhaustive()
    }
}

/// Ordered set of pending timers, backed by one kernel timer descriptor.
///
/// The descriptor's programmed expiration always tracks the earliest pending
/// timer; when it fires, its channel's read callback drains the descriptor
/// and runs every timer that is due. All mutation happens on the owning
/// loop's thread; cross-thread scheduling is marshalled there by
/// [`LoopHandle`].
///
/// [`LoopHandle`]: crate::LoopHandle
#[derive(Debug)]
pub(crate) struct TimerQueue {
    timer_fd: TimerFd,
    channel: Rc<Channel>,
    timers: RefCell<BTreeMap<(Timestamp, u64), Timer>>,
    // seq -> current expiration. A repeating timer's map key moves every
    // period; this keeps cancellation by handle a lookup, not a scan.
    expirations: RefCell<HashMap<u64, Timestamp>>,
    cancelled_during_dispatch: RefCell<Vec<u64>>,
    dispatching: Cell<bool>,
}

impl TimerQueue {
    pub(crate) fn new(timer_fd: TimerFd, channel: Rc<Channel>) -> TimerQueue {
        TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            expirations: RefCell::new(HashMap::new()),
            cancelled_during_dispatch: RefCell::new(Vec::new()),
            dispatching: Cell::new(false),
        }
    }

    /// Wires the timer descriptor's channel into the owning loop. Called
    /// once the loop is fully constructed.
    pub(crate) fn install(&self, event_loop: &Rc<EventLoop>) {
        let weak = Rc::downgrade(event_loop);
        self.channel.set_log_hang_up(false);
        self.channel.set_read_callback(move |_now| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timer_queue().handle_expirations();
            }
        });
        self.channel.enable_reading();
    }

    /// Inserts a timer expiring at `id.when`. Re-arms the descriptor only
    /// when the new timer becomes the queue head.
    pub(crate) fn insert(
        &self,
        id: TimerId,
        interval_secs: f64,
        repeating: bool,
        callback: Box<dyn FnMut()>,
    ) {
        trace!("adding timer: when={}, seq={}", id.when, id.seq);
        let timer = Timer {
            callback,
            when: id.when,
            interval_secs,
            repeating,
        };

        let earliest_changed = {
            let mut timers = self.timers.borrow_mut();
            let earliest = timers.keys().next().map_or(true, |&(head, _)| id.when < head);
            let prev = timers.insert((id.when, id.seq), timer);
            debug_assert!(prev.is_none());
            earliest
        };
        let _ = self.expirations.borrow_mut().insert(id.seq, id.when);

        if earliest_changed {
            self.arm(id.when, false);
        }
    }

    /// Cancels a pending timer. Unknown (already fired or already cancelled)
    /// handles are a no-op, so cancelling twice is harmless.
    ///
    /// A timer currently running its callback cannot be un-run; recording it
    /// here instead suppresses its repeat re-insertion.
    pub(crate) fn cancel(&self, id: TimerId) {
        if self.dispatching.get() {
            trace!("cancelling timer during dispatch: seq={}", id.seq);
            self.cancelled_during_dispatch.borrow_mut().push(id.seq);
            return;
        }

        match self.expirations.borrow_mut().remove(&id.seq) {
            Some(when) => {
                trace!("cancelling timer: when={}, seq={}", when, id.seq);
                let removed = self.timers.borrow_mut().remove(&(when, id.seq));
                debug_assert!(removed.is_some());
                self.sync_timer_fd(false);
            }
            None => trace!("cancelling unknown timer: seq={}", id.seq),
        }
    }

    /// Number of pending timers.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Read callback of the timer descriptor's channel: drains the
    /// descriptor, runs every due timer in expiration order and re-arms.
    fn handle_expirations(&self) {
        let now = Timestamp::now();
        match self.timer_fd.drain() {
            Ok(expirations) => trace!("timer descriptor fired: {} at {}", expirations, now),
            Err(err) => error!("failed to drain timer descriptor: {}", err),
        }

        let expired = self.take_expired(now);

        self.dispatching.set(true);
        let mut expired = expired;
        for ((when, seq), timer) in expired.iter_mut() {
            trace!("running timer: when={}, seq={}", when, seq);
            (timer.callback)();
        }
        self.dispatching.set(false);

        self.reset(expired, now);
    }

    /// Removes and returns every timer due at or before `now`, in key order.
    fn take_expired(&self, now: Timestamp) -> Vec<((Timestamp, u64), Timer)> {
        let expired: Vec<_> = {
            let mut timers = self.timers.borrow_mut();
            let later = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, later).into_iter().collect()
        };

        let mut expirations = self.expirations.borrow_mut();
        for ((_, seq), _) in expired.iter() {
            let _ = expirations.remove(seq);
        }
        expired
    }

    /// Post-dispatch bookkeeping: re-insert repeating timers that were not
    /// cancelled while they ran, drop dispatch-time cancellations that
    /// target still-pending timers, then re-arm the descriptor at the new
    /// head (or disarm it when the queue emptied).
    fn reset(&self, expired: Vec<((Timestamp, u64), Timer)>, now: Timestamp) {
        let cancelled = std::mem::take(&mut *self.cancelled_during_dispatch.borrow_mut());

        for ((_, seq), mut timer) in expired {
            if timer.repeating && !cancelled.contains(&seq) {
                let when = now.add_seconds(timer.interval_secs);
                trace!("restarting repeating timer: when={}, seq={}", when, seq);
                timer.when = when;
                let prev = self.timers.borrow_mut().insert((when, seq), timer);
                debug_assert!(prev.is_none());
                let _ = self.expirations.borrow_mut().insert(seq, when);
            }
        }

        for seq in cancelled {
            if let Some(when) = self.expirations.borrow_mut().remove(&seq) {
                let _ = self.timers.borrow_mut().remove(&(when, seq));
            }
        }

        self.sync_timer_fd(true);
    }

    /// Programs the descriptor to match the queue head.
    fn sync_timer_fd(&self, log_past_due: bool) {
        let head = self.timers.borrow().keys().next().copied();
        match head {
            Some((when, _)) => self.arm(when, log_past_due),
            None => {
                if let Err(err) = self.timer_fd.disarm() {
                    error!("failed to disarm timer descriptor: {}", err);
                }
            }
        }
    }

    fn arm(&self, when: Timestamp, log_past_due: bool) {
        match self.timer_fd.arm_at(when) {
            Ok(true) => {}
            // Already due: the descriptor ticks immediately and the timer
            // runs on the next loop iteration.
            Ok(false) if log_past_due => error!("timer {} was already due when re-armed", when),
            Ok(false) => trace!("timer {} is already due", when),
            Err(err) => error!("failed to arm timer descriptor: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::event_loop::EventLoop;

    fn run_for(event_loop: &Rc<EventLoop>, seconds: f64) {
        let handle = event_loop.handle();
        let _ = event_loop.run_after(seconds, move || handle.quit());
        event_loop.run_loop();
    }

    #[test]
    fn insert_and_cancel_keep_queue_consistent() {
        let event_loop = EventLoop::new().unwrap();
        let queue = event_loop.timer_queue();
        assert_eq!(queue.pending(), 0);

        let first = event_loop.run_after(10.0, || {});
        let second = event_loop.run_after(20.0, || {});
        assert_eq!(queue.pending(), 2);

        event_loop.cancel(first);
        assert_eq!(queue.pending(), 1);
        // Cancelling twice, or an unknown handle, is a no-op.
        event_loop.cancel(first);
        assert_eq!(queue.pending(), 1);

        event_loop.cancel(second);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn self_cancelling_repeating_timer_runs_once() {
        let event_loop = EventLoop::new().unwrap();
        let runs = Rc::new(Cell::new(0));

        let handle = event_loop.handle();
        let counter = runs.clone();
        let id_slot = Rc::new(Cell::new(None));
        let own_id = id_slot.clone();
        let id = event_loop.run_every(0.01, move || {
            counter.set(counter.get() + 1);
            if let Some(id) = own_id.get() {
                handle.cancel(id);
            }
        });
        id_slot.set(Some(id));

        run_for(&event_loop, 0.08);
        assert_eq!(runs.get(), 1);
        // The cancellation emptied the queue during its own dispatch (the
        // quit timer is gone too by now).
        assert_eq!(event_loop.timer_queue().pending(), 0);
    }

    #[test]
    fn repeating_timer_restarts_under_its_original_handle() {
        let event_loop = EventLoop::new().unwrap();
        let runs = Rc::new(Cell::new(0));

        let counter = runs.clone();
        let id = event_loop.run_every(0.01, move || counter.set(counter.get() + 1));

        run_for(&event_loop, 0.05);
        let after_first_run = runs.get();
        assert!(after_first_run >= 2, "expected repeats, got {}", after_first_run);

        // The handle still names the timer after several restarts.
        event_loop.cancel(id);
        assert_eq!(event_loop.timer_queue().pending(), 0);
    }
}
