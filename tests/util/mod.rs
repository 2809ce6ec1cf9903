//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused
// functions while other tests are actually using them.
#![allow(dead_code)]

use std::rc::Rc;

use rhea::EventLoop;

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // Logger could already be set, so we ignore the result.
    drop(env_logger::try_init_from_env(env));
}

/// Initialise the test setup (same as `init`) and create an `EventLoop` at
/// the same time.
pub fn init_with_event_loop() -> Rc<EventLoop> {
    init();
    EventLoop::new().expect("unable to create EventLoop")
}

/// Run `event_loop` until `seconds` have passed.
pub fn run_for(event_loop: &EventLoop, seconds: f64) {
    let handle = event_loop.handle();
    let _ = event_loop.run_after(seconds, move || handle.quit());
    event_loop.run_loop();
}

/// A readable-on-demand descriptor: an `eventfd` the test owns.
#[derive(Debug)]
pub struct TestFd {
    fd: libc::c_int,
}

impl TestFd {
    pub fn new() -> TestFd {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd != -1, "unable to create eventfd");
        TestFd { fd }
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// Make the descriptor readable.
    pub fn make_readable(&self) {
        let buf = 1u64.to_ne_bytes();
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        assert_eq!(n, 8, "unable to write to eventfd");
    }
}

impl Drop for TestFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
