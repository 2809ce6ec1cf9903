//! A per-thread, callback-driven reactor core.
//!
//! The heart of the library is the [`EventLoop`]: a single-threaded dispatch
//! loop that multiplexes three kinds of work on the thread that created it:
//!
//!  * **Readiness events.** A [`Channel`] binds a file descriptor to up to
//!    four callbacks (read, write, close, error); enabling an event
//!    registers the descriptor with the loop's kernel multiplexer and the
//!    callbacks run when it becomes ready.
//!  * **Timers.** [`run_at`], [`run_after`] and [`run_every`] schedule
//!    closures on the loop's monotonic timer queue, backed by a kernel timer
//!    descriptor; [`cancel`] removes a timer that hasn't fired.
//!  * **Extra tasks.** Closures submitted from any thread through a
//!    [`LoopHandle`] run on the loop thread at the end of an iteration; a
//!    wake-up descriptor interrupts an idle loop so submissions are never
//!    stuck behind a blocked wait.
//!
//! One loop serves one thread. Scaling across cores means running more
//! loops: an [`EventLoopThreadPool`] spawns N worker threads, each with a
//! dedicated loop, and hands them out round-robin or at random.
//!
//! Everything callback-shaped runs on the loop's own thread, so callbacks
//! need no synchronization to touch loop-local state; the loop types are
//! deliberately not `Send`, and the compiler keeps foreign threads confined
//! to the [`LoopHandle`] surface.
//!
//! [`run_at`]: EventLoop::run_at
//! [`run_after`]: EventLoop::run_after
//! [`run_every`]: EventLoop::run_every
//! [`cancel`]: EventLoop::cancel
//!
//! # Examples
//!
//! Run a loop until a cross-thread submission stops it.
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use std::thread;
//!
//! use rhea::EventLoop;
//!
//! let event_loop = EventLoop::new()?;
//!
//! // Any number of handles may leave the thread.
//! let handle = event_loop.handle();
//! let submitter = thread::spawn(move || {
//!     handle.run(|event_loop| {
//!         println!("running on the loop's thread");
//!         event_loop.quit();
//!     });
//! });
//!
//! // Blocks until the submission above asks the loop to quit.
//! event_loop.run_loop();
//! submitter.join().unwrap();
//! # Ok(())
//! # }
//! ```

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences
)]
// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]
// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

mod channel;
mod event;
mod event_loop;
mod poller;
mod pool;
mod sys;
mod time;
mod timer;

pub use crate::channel::Channel;
pub use crate::event::EventSet;
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::pool::{EventLoopThread, EventLoopThreadPool};
pub use crate::time::Timestamp;
pub use crate::timer::TimerId;
