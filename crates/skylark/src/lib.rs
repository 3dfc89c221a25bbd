//! Futex-style synchronization over a cooperative, user-level task scheduler.
//!
//! Guest code expecting Linux futex semantics runs here without kernel
//! threads, so the usual `FUTEX_WAIT`/`FUTEX_WAKE`/`FUTEX_REQUEUE` family is
//! provided by a [`futex::FutexTable`] layered on two collaborators: a
//! [`sched::Scheduler`] bridge that can atomically release a lock and park
//! the calling task, and a [`time::ClockSource`] for deadline bookkeeping.
//! Higher-level primitives (mutexes, condition variables, barriers) are all
//! built on top of this facility.
//!
//! Timeouts are driven by the scheduler's periodic tick rather than by
//! interrupts; see [`futex::FutexTable::tick`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod futex;
pub mod sched;
pub mod task;
pub mod time;

pub use self::{
    error::Errno,
    futex::FutexTable,
    sched::Scheduler,
    task::{TaskHandle, TaskId, WakeReason},
    time::{ClockId, ClockSource, Timespec},
};
