use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use crate::time::{Timestamp, MICROS_PER_SECOND};

/// A timer descriptor to re-arm a past-due target with: far enough ahead
/// that the kernel accepts it, close enough that the tick is immediate.
const PAST_DUE_FLOOR_SECONDS: f64 = 0.000_1;

/// Monotonic timer descriptor backed by `timerfd`.
///
/// The descriptor becomes readable when the programmed instant passes; the
/// read returns the number of expirations since the last read. Only ever
/// armed with a single absolute target, never a kernel-side interval:
/// repeating timers are re-inserted by the timer queue so that cancellation
/// and re-ordering stay in user space.
#[derive(Debug)]
pub struct TimerFd {
    fd: File,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(TimerFd {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Arm the descriptor to become readable at the absolute monotonic time
    /// `when`.
    ///
    /// Returns `true` if `when` was still in the future. A past-due target is
    /// reported as `false` but still armed, floored slightly ahead of now, so
    /// the tick arrives on the next multiplexer wait instead of being lost.
    pub fn arm_at(&self, when: Timestamp) -> io::Result<bool> {
        let now = Timestamp::now();
        let in_future = when > now;
        let target = if in_future {
            when
        } else {
            now.add_seconds(PAST_DUE_FLOOR_SECONDS)
        };

        self.settime(timespec_from(target))?;
        Ok(in_future)
    }

    /// Unschedule the pending expiration, if any.
    pub fn disarm(&self) -> io::Result<()> {
        // An all-zero value disarms the timer.
        self.settime(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        })
    }

    /// Read and reset the expiration counter. Returns the number of
    /// expirations, or 0 if the descriptor wasn't readable.
    pub fn drain(&self) -> io::Result<u64> {
        let mut buf = [0; 8];
        match (&self.fd).read(&mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            // Not readable happens when the expiration raced with a disarm.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("timerfd read returned {} bytes instead of 8", n),
            )),
            Err(err) => Err(err),
        }
    }

    fn settime(&self, it_value: libc::timespec) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value,
        };
        let res = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn timespec_from(ts: Timestamp) -> libc::timespec {
    // A zero it_value would disarm rather than expire.
    let micros = ts.as_micros().max(1);
    libc::timespec {
        tv_sec: (micros / MICROS_PER_SECOND) as libc::time_t,
        tv_nsec: ((micros % MICROS_PER_SECOND) * 1_000) as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use crate::time::Timestamp;

    use super::TimerFd;

    #[test]
    fn arm_in_future() {
        let timer_fd = TimerFd::new().unwrap();
        assert!(timer_fd.arm_at(Timestamp::now().add_seconds(0.01)).unwrap());

        assert_eq!(timer_fd.drain().unwrap(), 0);
        sleep(Duration::from_millis(20));
        assert_eq!(timer_fd.drain().unwrap(), 1);
    }

    #[test]
    fn arm_past_due_still_fires() {
        let timer_fd = TimerFd::new().unwrap();
        assert!(!timer_fd.arm_at(Timestamp::now().add_seconds(-1.0)).unwrap());

        sleep(Duration::from_millis(5));
        assert_eq!(timer_fd.drain().unwrap(), 1);
    }

    #[test]
    fn disarm() {
        let timer_fd = TimerFd::new().unwrap();
        timer_fd.arm_at(Timestamp::now().add_seconds(0.005)).unwrap();
        timer_fd.disarm().unwrap();

        sleep(Duration::from_millis(15));
        assert_eq!(timer_fd.drain().unwrap(), 0);
    }
}
