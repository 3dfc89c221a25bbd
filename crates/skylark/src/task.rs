use alloc::sync::Arc;
use core::{
    cell::UnsafeCell,
    fmt,
    num::NonZeroU64,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use crate::futex::queue::WaitEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU64);

fn allocate_id() -> TaskId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let raw = NEXT.fetch_add(1, Ordering::Relaxed);
    TaskId(NonZeroU64::new(raw).expect("task id space exhausted"))
}

/// Why a parked task was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    /// Nothing extraordinary happened; a matching wake arrived.
    None = 0,
    /// The wait deadline expired.
    Expired = 1,
}

/// A task record as the futex facility sees it.
///
/// Each task owns exactly one embedded wait-entry slot and one wake
/// reason. The entry is pre-embedded because allocating while the futex
/// queue lock is held could reenter this same facility through the
/// allocator and self-deadlock.
pub struct Task {
    id: TaskId,
    name: Option<&'static str>,
    wake_reason: AtomicU8,
    entry: UnsafeCell<WaitEntry>,
}

// The embedded wait entry (including its intrusive links) is only touched
// while the owning table's queue lock is held; the wake reason is atomic.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Cheap clonable handle to a [`Task`].
#[derive(Clone)]
pub struct TaskHandle(Arc<Task>);

impl TaskHandle {
    pub fn new() -> Self {
        Self::with_name(None)
    }

    pub fn with_name(name: Option<&'static str>) -> Self {
        Self(Arc::new(Task {
            id: allocate_id(),
            name,
            wake_reason: AtomicU8::new(WakeReason::None as u8),
            entry: UnsafeCell::new(WaitEntry::new()),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name
    }

    /// The reason recorded by whoever made this task runnable last.
    pub fn wake_reason(&self) -> WakeReason {
        match self.0.wake_reason.load(Ordering::Acquire) {
            0 => WakeReason::None,
            _ => WakeReason::Expired,
        }
    }

    pub(crate) fn set_wake_reason(&self, reason: WakeReason) {
        self.0.wake_reason.store(reason as u8, Ordering::Release);
    }

    /// The task's embedded wait-entry slot. Only the futex queue code
    /// dereferences this, under the queue lock.
    pub(crate) fn wait_entry(&self) -> NonNull<WaitEntry> {
        // The UnsafeCell pointer is derived from a live Arc allocation.
        unsafe { NonNull::new_unchecked(self.0.entry.get()) }
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
