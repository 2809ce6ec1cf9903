//! Monotonic timestamps.

use std::fmt;
use std::mem::MaybeUninit;
use std::time::Duration;

/// A point on the monotonic clock, in microseconds.
///
/// All reactor time keeping uses the monotonic clock: poll return times,
/// timer expirations and the kernel timer descriptor all measure against the
/// same, never-jumping time base. Microsecond resolution is plenty for a
/// reactor whose smallest tick is a kernel timer.
///
/// `Timestamp` is a plain value: cheap to copy, totally ordered and usable as
/// (part of) an ordered map key.
///
/// # Examples
///
/// ```
/// use rhea::Timestamp;
///
/// let start = Timestamp::now();
/// let deadline = start.add_seconds(1.5);
/// assert!(start < deadline);
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    micros: i64,
}

/// The number of microseconds in one second.
pub(crate) const MICROS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    /// Returns the current monotonic time.
    pub fn now() -> Timestamp {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        // CLOCK_MONOTONIC with a valid pointer cannot fail.
        let ts = unsafe {
            let _ = libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
            ts.assume_init()
        };
        Timestamp {
            micros: (ts.tv_sec as i64) * MICROS_PER_SECOND + (ts.tv_nsec as i64) / 1_000,
        }
    }

    /// Creates a timestamp from raw microseconds on the monotonic clock.
    pub const fn from_micros(micros: i64) -> Timestamp {
        Timestamp { micros }
    }

    /// Returns the raw microsecond value.
    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    /// Returns this timestamp moved `seconds` into the future.
    ///
    /// Negative values move it into the past. The addition saturates instead
    /// of wrapping on overflow.
    pub fn add_seconds(self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROS_PER_SECOND as f64) as i64;
        Timestamp {
            micros: self.micros.saturating_add(delta),
        }
    }

    /// Returns the time elapsed from `earlier` to `self`, or a zero duration
    /// if `earlier` is actually later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        let micros = self.micros.saturating_sub(earlier.micros).max(0);
        Duration::from_micros(micros as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SECOND,
            self.micros % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Timestamp;

    #[test]
    fn now_is_monotonic() {
        let first = Timestamp::now();
        let second = Timestamp::now();
        assert!(first <= second);
    }

    #[test]
    fn add_seconds_round_trip() {
        let ts = Timestamp::from_micros(1_000_000);
        assert_eq!(ts.add_seconds(1.5), Timestamp::from_micros(2_500_000));
        assert_eq!(ts.add_seconds(-0.5), Timestamp::from_micros(500_000));
        assert_eq!(ts.add_seconds(0.0), ts);
    }

    #[test]
    fn ordering() {
        let early = Timestamp::from_micros(10);
        let late = Timestamp::from_micros(20);
        assert!(early < late);
        assert_eq!(late.saturating_duration_since(early), Duration::from_micros(10));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }

    #[test]
    fn display() {
        let ts = Timestamp::from_micros(3_000_042);
        assert_eq!(ts.to_string(), "3.000042");
    }
}
