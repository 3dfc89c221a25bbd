use alloc::sync::Arc;

/// Clock domain a deadline is interpreted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Monotonic,
    Realtime,
}

/// The POSIX `timespec` shape as it arrives at the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// Microseconds, clamped at zero for negative inputs.
    pub fn to_usec(&self) -> u64 {
        if self.tv_sec < 0 {
            return 0;
        }
        let sec = (self.tv_sec as u64).saturating_mul(1_000_000);
        let nsec = if self.tv_nsec > 0 {
            self.tv_nsec as u64 / 1_000
        } else {
            0
        };
        sec.saturating_add(nsec)
    }
}

/// Timestamp queries, convertible to microsecond integers.
///
/// A query may itself yield to the scheduler (it is typically a host call),
/// so it must never be issued while the futex queue lock is held.
pub trait ClockSource {
    fn now_usec(&self, clock: ClockId) -> u64;
}

impl<C: ClockSource + ?Sized> ClockSource for &C {
    fn now_usec(&self, clock: ClockId) -> u64 {
        (**self).now_usec(clock)
    }
}

impl<C: ClockSource + ?Sized> ClockSource for Arc<C> {
    fn now_usec(&self, clock: ClockId) -> u64 {
        (**self).now_usec(clock)
    }
}
