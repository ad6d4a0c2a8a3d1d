use crate::{Scheduler, SpinLock, SpinLockGuard};
use alloc::collections::VecDeque;

/// A queue of tasks waiting for a condition guarded by some [`SpinLock`].
///
/// This is the one place a kernel thread suspends: [`sleep`](Self::sleep)
/// enqueues the caller and releases the caller's lock without a window in
/// which a wake-up could be lost.
pub struct WaitChannel<Task> {
    name: &'static str,
    queue: SpinLock<VecDeque<Task>>,
}

impl<Task: Copy + Eq> WaitChannel<Task> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: SpinLock::named("wait channel", VecDeque::new()),
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Release `guard`, block the current task and re-acquire the lock once woken.
    pub fn sleep<'a, T, S>(&self, scheduler: &S, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T>
    where
        S: Scheduler<Task = Task>,
    {
        let lock = SpinLockGuard::source(&guard);
        let mut queue = self.queue.lock();
        drop(guard);

        let task = scheduler.current();
        queue.push_back(task);
        scheduler.block(task, queue);

        lock.lock()
    }

    /// Make the longest-waiting task ready, if any. Returns whether one was woken.
    pub fn wakeup_one<S>(&self, scheduler: &S) -> bool
    where
        S: Scheduler<Task = Task>,
    {
        let mut queue = self.queue.lock();
        match queue.pop_front() {
            Some(task) => {
                scheduler.wake(task);
                true
            }
            None => false,
        }
    }

    /// Make every waiting task ready. Returns the number woken.
    pub fn wakeup_all<S>(&self, scheduler: &S) -> usize
    where
        S: Scheduler<Task = Task>,
    {
        let mut queue = self.queue.lock();
        let mut woken = 0;
        while let Some(task) = queue.pop_front() {
            scheduler.wake(task);
            woken += 1;
        }
        woken
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}
