use crate::SpinLockGuard;
use alloc::collections::VecDeque;

/// The scheduler hooks the blocking primitives are built on.
///
/// The scheduler owns task states and the ready queue; this crate only
/// decides *when* a task blocks or becomes ready again.
pub trait Scheduler {
    /// Identity of a schedulable task.
    type Task: Copy + Eq;

    /// The task running on the calling core.
    fn current(&self) -> Self::Task;

    /// Mark `task` blocked and switch away from it.
    ///
    /// `queue` is the wait queue `task` was just appended to. The
    /// implementation must release it only after the task is recorded as
    /// blocked, and must not return until [`wake`](Self::wake) made the task
    /// ready again.
    fn block(&self, task: Self::Task, queue: SpinLockGuard<'_, VecDeque<Self::Task>>);

    /// Move a blocked task to the ready queue.
    fn wake(&self, task: Self::Task);
}
