//! Platform specific types.
//!
//! The platform must provide the following types:
//!
//! * `Selector`: the readiness multiplexer, used by `Poller`.
//! * `Awakener`: the cross-thread wake-up descriptor, used by `EventLoop`.
//! * `TimerFd`: the monotonic timer descriptor, used by `TimerQueue`.

#[cfg(target_os = "linux")]
mod unix;

#[cfg(target_os = "linux")]
pub(crate) use self::unix::*;

#[cfg(not(target_os = "linux"))]
compile_error!("rhea requires Linux: it is built on epoll, eventfd and timerfd");
