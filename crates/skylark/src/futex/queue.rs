//! The futex wait queue: an intrusive list of wait entries embedded in task
//! records.
//!
//! An entry is linked iff its owning task is suspended awaiting a wake or a
//! timeout. Insertion happens at the head; scans start at the oldest entry
//! so wake order is FIFO by insertion. Nothing here allocates: the queue
//! lock may be held by code the allocator itself would call back into.

use core::ptr::NonNull;

use crate::{task::TaskHandle, time::ClockId};

/// Wake-matching key derived from the waited-on cell's address.
///
/// Full pointer width: a narrower key could alias two distinct addresses
/// onto the same wake set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutexKey(usize);

impl FutexKey {
    pub fn from_addr<T>(addr: *const T) -> Self {
        Self(addr as usize)
    }
}

/// An absolute expiry time in a specific clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at_usec: u64,
    pub clock: ClockId,
}

/// One per currently-sleeping task, embedded in the task record.
pub struct WaitEntry {
    pub(crate) key: FutexKey,
    pub(crate) bitset: u32,
    pub(crate) deadline: Option<Deadline>,
    /// Owning task; `Some` exactly while the entry is linked.
    pub(crate) task: Option<TaskHandle>,
    /// Toward older entries.
    next: Option<NonNull<WaitEntry>>,
    /// Toward newer entries.
    prev: Option<NonNull<WaitEntry>>,
}

impl WaitEntry {
    pub(crate) const fn new() -> Self {
        Self {
            key: FutexKey(0),
            bitset: 0,
            deadline: None,
            task: None,
            next: None,
            prev: None,
        }
    }

    /// The entry inserted right after this one, i.e. the next stop of an
    /// oldest-to-newest scan. Captured before any removal so unlinking the
    /// current entry mid-scan neither skips nor double-visits.
    pub(crate) fn newer(&self) -> Option<NonNull<WaitEntry>> {
        self.prev
    }
}

/// Insertion-ordered collection of live wait entries.
pub(crate) struct WaitList {
    /// Most recent insertion.
    head: Option<NonNull<WaitEntry>>,
    /// Oldest insertion.
    tail: Option<NonNull<WaitEntry>>,
}

// Entries live inside task records and are only reached through this list
// while the owning table's queue lock is held.
unsafe impl Send for WaitList {}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Link `entry` at the head. Its `task` back-reference must already be
    /// set and the entry must not currently be linked anywhere.
    pub fn push_front(&mut self, mut entry: NonNull<WaitEntry>) {
        unsafe {
            let e = entry.as_mut();
            debug_assert!(e.task.is_some());
            debug_assert!(e.next.is_none() && e.prev.is_none());
            e.prev = None;
            e.next = self.head;
            match self.head {
                Some(mut head) => head.as_mut().prev = Some(entry),
                None => self.tail = Some(entry),
            }
            self.head = Some(entry);
        }
    }

    /// Oldest entry; scans start here.
    pub fn oldest(&self) -> Option<NonNull<WaitEntry>> {
        self.tail
    }

    /// Unlink `entry` and hand back its owning task.
    ///
    /// # Safety
    /// `entry` must currently be linked into this list.
    pub unsafe fn remove(&mut self, mut entry: NonNull<WaitEntry>) -> TaskHandle {
        let e = entry.as_mut();
        match e.prev {
            Some(mut newer) => newer.as_mut().next = e.next,
            None => self.head = e.next,
        }
        match e.next {
            Some(mut older) => older.as_mut().prev = e.prev,
            None => self.tail = e.prev,
        }
        e.next = None;
        e.prev = None;
        e.task.take().expect("queued wait entry with no owning task")
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// O(n); the sleeper counter is the cheap view of this.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.tail;
        while let Some(entry) = cursor {
            n += 1;
            cursor = unsafe { entry.as_ref().newer() };
        }
        n
    }
}
