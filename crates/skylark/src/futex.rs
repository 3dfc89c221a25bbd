//! POSIX futex operations over the cooperative scheduler.
//!
//! A single ticket lock totally orders every operation on a table, as POSIX
//! requires. A wait holds that lock from the value check until the task is
//! parked; the unlock is executed by the scheduler as part of the same
//! transition that parks the task, so a wake issued by another task can
//! never slip between enqueue and suspend. Wait entries are embedded in
//! task records, so none of the lock-held paths allocate.
//!
//! Timeouts interoperate with the scheduler's periodic tick: [`FutexTable::tick`]
//! expires overdue entries, skipping the scan entirely when the lock is
//! contended. Timeouts are best-effort-prompt, never best-effort-exact.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use log::trace;
use spin::mutex::TicketMutex;

use crate::{
    error::{Errno, OpResult},
    sched::Scheduler,
    task::WakeReason,
    time::{ClockId, ClockSource, Timespec},
};

pub use self::queue::{Deadline, FutexKey};

pub(crate) mod queue;

use self::queue::WaitList;

pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
pub const FUTEX_REQUEUE: u32 = 3;
pub const FUTEX_CMP_REQUEUE: u32 = 4;
pub const FUTEX_WAIT_BITSET: u32 = 9;
pub const FUTEX_WAKE_BITSET: u32 = 10;

/// The default bitset: matches every waiter.
pub const FUTEX_BITSET_MATCH_ANY: u32 = u32::MAX;

bitflags! {
    /// Flag bits carried alongside the operation code.
    pub struct FutexFlags: u32 {
        /// Single address space here, so this is always implied and always
        /// stripped.
        const PRIVATE = 0x80;
        /// Interpret the wait deadline against the realtime clock. Valid
        /// only with the wait variants.
        const CLOCK_REALTIME = 0x100;
    }
}

/// The futex facility: wait queue, sleeper counter and the lock ordering
/// every operation.
///
/// This is an explicit context value rather than a process-wide global so
/// tables can be constructed in isolation; an embedding scheduler typically
/// creates exactly one.
pub struct FutexTable<S, C> {
    queue: TicketMutex<WaitList>,
    /// Mirrors the queue length; readable without the lock so the tick fast
    /// path costs nothing when nobody sleeps.
    sleepers: AtomicUsize,
    sched: S,
    clock: C,
}

impl<S, C> FutexTable<S, C>
where
    S: Scheduler,
    C: ClockSource,
{
    pub fn new(sched: S, clock: C) -> Self {
        Self {
            queue: TicketMutex::new(WaitList::new()),
            sleepers: AtomicUsize::new(0),
            sched,
            clock,
        }
    }

    /// Number of tasks currently sleeping on this table.
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }

    /// Queue length, counted under the lock. Diagnostic; equal to
    /// [`FutexTable::sleepers`] at any point the lock is held.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// The syscall-shaped entry point.
    ///
    /// `timeout` is a relative `Timespec` for `FUTEX_WAIT`, an absolute one
    /// for `FUTEX_WAIT_BITSET`, and carries the re-key limit (by value, not
    /// by pointer) for the requeue operations. Returns 0 or a woken/touched
    /// count on success, a negative error code otherwise.
    ///
    /// # Safety
    /// `uaddr` must point to a live 32-bit cell, as must `uaddr2` for the
    /// requeue operations. For the wait operations `timeout` must be null or
    /// point to a valid [`Timespec`].
    pub unsafe fn futex(
        &self,
        uaddr: *const AtomicU32,
        op: u32,
        val: u32,
        timeout: *const Timespec,
        uaddr2: *const AtomicU32,
        val3: u32,
    ) -> isize {
        match self.dispatch(uaddr, op, val, timeout, uaddr2, val3) {
            Ok(n) => n as isize,
            Err(err) => err.as_return_code(),
        }
    }

    unsafe fn dispatch(
        &self,
        uaddr: *const AtomicU32,
        op: u32,
        val: u32,
        timeout: *const Timespec,
        uaddr2: *const AtomicU32,
        val3: u32,
    ) -> OpResult {
        let flags = FutexFlags::from_bits_truncate(op);
        let cmd = op & !FutexFlags::all().bits();

        if flags.contains(FutexFlags::CLOCK_REALTIME)
            && cmd != FUTEX_WAIT
            && cmd != FUTEX_WAIT_BITSET
        {
            return Err(Errno::NoSys);
        }
        let clock = if flags.contains(FutexFlags::CLOCK_REALTIME) {
            ClockId::Realtime
        } else {
            ClockId::Monotonic
        };

        // Deadlines are now + timeout for FUTEX_WAIT; the bitset variant
        // takes an absolute timeout, so its base stays zero. The clock query
        // can yield to the scheduler and must happen before the queue lock
        // is taken, or every other futex caller would stall behind it.
        let now = if cmd == FUTEX_WAIT && !timeout.is_null() {
            self.clock.now_usec(clock)
        } else {
            0
        };

        match cmd {
            FUTEX_WAIT | FUTEX_WAIT_BITSET => {
                let bitset = bitset_arg(cmd, FUTEX_WAIT_BITSET, val3)?;
                let deadline = unsafe { timeout.as_ref() }.map(|ts| Deadline {
                    at_usec: now.saturating_add(ts.to_usec()),
                    clock,
                });
                self.wait_on(unsafe { &*uaddr }, val, bitset, deadline)
            }
            FUTEX_WAKE | FUTEX_WAKE_BITSET => {
                let bitset = bitset_arg(cmd, FUTEX_WAKE_BITSET, val3)?;
                self.wake(unsafe { &*uaddr }, val as usize, bitset)
            }
            FUTEX_REQUEUE => {
                self.requeue(unsafe { &*uaddr }, unsafe { &*uaddr2 }, val as usize, timeout as usize, None)
            }
            FUTEX_CMP_REQUEUE => self.requeue(
                unsafe { &*uaddr },
                unsafe { &*uaddr2 },
                val as usize,
                timeout as usize,
                Some(val3),
            ),
            _ => Err(Errno::NoSys),
        }
    }

    /// `FUTEX_WAIT` / `FUTEX_WAIT_BITSET`.
    ///
    /// Sleeps until a matching wake, or until `deadline` passes, if the cell
    /// still holds `expected`; fails with `EAGAIN` otherwise, queuing
    /// nothing. The deadline must have been computed from a clock sample
    /// taken before any lock acquisition.
    pub fn wait_on(
        &self,
        uaddr: &AtomicU32,
        expected: u32,
        bitset: u32,
        deadline: Option<Deadline>,
    ) -> OpResult {
        let key = FutexKey::from_addr(uaddr);
        let mut queue = self.queue.lock();

        if uaddr.load(Ordering::Acquire) != expected {
            return Err(Errno::Again);
        }

        let task = self.sched.current();
        trace!("futex.wait({:?}) task {:?}", key, task.id());
        task.set_wake_reason(WakeReason::None);

        let entry = task.wait_entry();
        unsafe {
            // Under the queue lock; nobody else reaches this slot until the
            // entry is linked.
            let e = &mut *entry.as_ptr();
            e.key = key;
            e.bitset = bitset;
            e.deadline = deadline;
            e.task = Some(task.clone());
        }
        queue.push_front(entry);
        self.sleepers.fetch_add(1, Ordering::SeqCst);

        // Hand the unlock to the scheduler so it happens as part of the
        // same transition that parks this task.
        let mut guard = Some(queue);
        self.sched.park_current(&mut || {
            guard.take();
        });

        match task.wake_reason() {
            WakeReason::Expired => Err(Errno::TimedOut),
            WakeReason::None => Ok(0),
        }
    }

    /// `FUTEX_WAKE` / `FUTEX_WAKE_BITSET`: wake up to `num` waiters whose
    /// key matches `uaddr` and whose bitset intersects `bitset`, oldest
    /// first. Returns the count actually woken.
    pub fn wake(&self, uaddr: &AtomicU32, num: usize, bitset: u32) -> OpResult {
        let key = FutexKey::from_addr(uaddr);
        let mut queue = self.queue.lock();

        let mut woken = 0;
        let mut cursor = queue.oldest();
        while let Some(entry) = cursor {
            if woken == num {
                break;
            }
            let (next, matches) = unsafe {
                let e = entry.as_ref();
                (e.newer(), e.key == key && e.bitset & bitset != 0)
            };
            cursor = next;
            if matches {
                let task = unsafe { queue.remove(entry) };
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                task.set_wake_reason(WakeReason::None);
                self.sched.ready_enqueue(task);
                woken += 1;
            }
        }

        trace!("futex.wake({:?}) woke {}", key, woken);
        Ok(woken)
    }

    /// `FUTEX_REQUEUE` / `FUTEX_CMP_REQUEUE`: wake the first `num` waiters
    /// keyed to `uaddr`, then move up to `limit` more onto `uaddr2` without
    /// waking them. Returns woken + re-keyed.
    ///
    /// `cmp`, when given, is checked against the cell before anything is
    /// touched; a mismatch fails with `EAGAIN` and mutates nothing.
    pub fn requeue(
        &self,
        uaddr: &AtomicU32,
        uaddr2: &AtomicU32,
        num: usize,
        limit: usize,
        cmp: Option<u32>,
    ) -> OpResult {
        let key = FutexKey::from_addr(uaddr);
        let dst = FutexKey::from_addr(uaddr2);
        let mut queue = self.queue.lock();

        if let Some(expected) = cmp {
            if uaddr.load(Ordering::Acquire) != expected {
                return Err(Errno::Again);
            }
        }

        let mut touched = 0;
        let mut cursor = queue.oldest();
        while let Some(entry) = cursor {
            if touched == num.saturating_add(limit) {
                break;
            }
            let (next, matches) = unsafe {
                let e = entry.as_ref();
                (e.newer(), e.key == key)
            };
            cursor = next;
            if !matches {
                continue;
            }
            if touched < num {
                let task = unsafe { queue.remove(entry) };
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                task.set_wake_reason(WakeReason::None);
                self.sched.ready_enqueue(task);
            } else {
                // Re-key in place: the waiter stays queued, asleep, and is
                // released by a later wake on the destination.
                unsafe { (*entry.as_ptr()).key = dst };
            }
            touched += 1;
        }

        trace!("futex.requeue({:?} -> {:?}) touched {}", key, dst, touched);
        Ok(touched)
    }

    /// Expire overdue waits. Invoked once per scheduler tick.
    ///
    /// If nobody is sleeping this returns without sampling a clock or
    /// touching the lock. A contended lock skips the scan until the next
    /// tick rather than stalling the tick path; that only delays timeout
    /// delivery, never correctness.
    pub fn tick(&self) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        // Both domains sampled up front, outside the lock.
        let now_mono = self.clock.now_usec(ClockId::Monotonic);
        let now_real = self.clock.now_usec(ClockId::Realtime);

        let mut queue = match self.queue.try_lock() {
            Some(queue) => queue,
            None => return,
        };

        let mut cursor = queue.oldest();
        while let Some(entry) = cursor {
            let (next, deadline) = unsafe {
                let e = entry.as_ref();
                (e.newer(), e.deadline)
            };
            cursor = next;
            let deadline = match deadline {
                Some(deadline) => deadline,
                None => continue,
            };
            let now = match deadline.clock {
                ClockId::Monotonic => now_mono,
                ClockId::Realtime => now_real,
            };
            if deadline.at_usec <= now {
                let task = unsafe { queue.remove(entry) };
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                task.set_wake_reason(WakeReason::Expired);
                trace!("futex.tick expired task {:?}", task.id());
                self.sched.ready_enqueue(task);
            }
        }
    }
}

/// The bitset and non-bitset codes share handlers; this decides which bitset
/// applies and rejects the empty one up front.
fn bitset_arg(cmd: u32, bitset_cmd: u32, val3: u32) -> Result<u32, Errno> {
    if cmd == bitset_cmd {
        if val3 == 0 {
            return Err(Errno::Inval);
        }
        Ok(val3)
    } else {
        Ok(FUTEX_BITSET_MATCH_ANY)
    }
}
