use alloc::sync::Arc;

use crate::task::TaskHandle;

/// Bridge to the cooperative scheduler hosting this facility.
///
/// Scheduling is cooperative and single-threaded per core: tasks run until
/// they explicitly yield, and the only suspension point inside the futex
/// paths is [`Scheduler::park_current`].
pub trait Scheduler {
    /// Handle of the task performing the current operation.
    fn current(&self) -> TaskHandle;

    /// Make `task` runnable again. No ordering is promised relative to other
    /// ready tasks beyond eventual scheduling.
    fn ready_enqueue(&self, task: TaskHandle);

    /// Run `release` exactly once, then suspend the calling task.
    ///
    /// The release action and the park must form one transition: no other
    /// task may run between the release action and the caller being fully
    /// parked, or a wake issued in that window could be lost.
    fn park_current(&self, release: &mut dyn FnMut());
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn current(&self) -> TaskHandle {
        (**self).current()
    }

    fn ready_enqueue(&self, task: TaskHandle) {
        (**self).ready_enqueue(task)
    }

    fn park_current(&self, release: &mut dyn FnMut()) {
        (**self).park_current(release)
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn current(&self) -> TaskHandle {
        (**self).current()
    }

    fn ready_enqueue(&self, task: TaskHandle) {
        (**self).ready_enqueue(task)
    }

    fn park_current(&self, release: &mut dyn FnMut()) {
        (**self).park_current(release)
    }
}
