//! Nanosecond time-keeping on the process-wide monotonic clock.
//!
//! All stack timestamps (rx stamps, cycle starts, deadlines) are `Instant`s:
//! signed nanosecond offsets from an arbitrary process epoch. Signed
//! arithmetic keeps clock-offset math (master minus local may be negative)
//! free of wrapping hazards.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::OnceLock;

/// A point on the local monotonic clock, in nanoseconds since the process
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant {
    nanos: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant { nanos: 0 };

    pub const fn from_nanos(nanos: i64) -> Instant {
        Instant { nanos }
    }

    pub const fn from_micros(micros: i64) -> Instant {
        Instant { nanos: micros * 1000 }
    }

    pub const fn from_millis(millis: i64) -> Instant {
        Instant { nanos: millis * 1_000_000 }
    }

    pub const fn total_nanos(&self) -> i64 {
        self.nanos
    }

    pub const fn total_micros(&self) -> i64 {
        self.nanos / 1000
    }

    /// The current reading of the monotonic clock.
    pub fn now() -> Instant {
        Instant {
            nanos: epoch().elapsed().as_nanos() as i64,
        }
    }
}

/// A span between two instants, in nanoseconds. May be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    nanos: i64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    pub const fn from_nanos(nanos: i64) -> Duration {
        Duration { nanos }
    }

    pub const fn from_micros(micros: i64) -> Duration {
        Duration { nanos: micros * 1000 }
    }

    pub const fn from_millis(millis: i64) -> Duration {
        Duration { nanos: millis * 1_000_000 }
    }

    pub const fn total_nanos(&self) -> i64 {
        self.nanos
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant::from_nanos(self.nanos + rhs.nanos)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.nanos += rhs.nanos;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_nanos(self.nanos - rhs.nanos)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, rhs: Duration) {
        self.nanos -= rhs.nanos;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_nanos(self.nanos - rhs.nanos)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration::from_nanos(self.nanos + rhs.nanos)
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_nanos(self.nanos - rhs.nanos)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

fn epoch() -> &'static std::time::Instant {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    EPOCH.get_or_init(std::time::Instant::now)
}

/// Suspend the calling task until the monotonic clock reaches `deadline`.
/// Returns immediately if the deadline already passed.
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        let delta = (deadline - now).total_nanos();
        std::thread::sleep(std::time::Duration::from_nanos(delta as u64));
    }
}

/// Blocking-call timeout convention used across sockets and control calls:
/// `0` waits forever, positive values are relative nanosecond deadlines,
/// negative values demand immediate completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Relative(Duration),
    NonBlocking,
}

impl Timeout {
    pub const fn from_ns(ns: i64) -> Timeout {
        if ns == 0 {
            Timeout::Infinite
        } else if ns > 0 {
            Timeout::Relative(Duration::from_nanos(ns))
        } else {
            Timeout::NonBlocking
        }
    }
}
