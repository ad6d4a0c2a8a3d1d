use crate::{Scheduler, SpinLock, WaitChannel};

/// A counting semaphore.
///
/// A negative count is the number of tasks sleeping in [`wait`](Self::wait).
pub struct Semaphore<Task> {
    name: &'static str,
    count: SpinLock<i32>,
    channel: WaitChannel<Task>,
}

impl<Task: Copy + Eq> Semaphore<Task> {
    pub const fn new(name: &'static str, value: i32) -> Self {
        Self {
            name,
            count: SpinLock::named("semaphore count", value),
            channel: WaitChannel::new("semaphore channel"),
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn wait<S: Scheduler<Task = Task>>(&self, scheduler: &S) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count < 0 {
            count = self.channel.sleep(scheduler, count);
        }
        drop(count);
    }

    pub fn signal<S: Scheduler<Task = Task>>(&self, scheduler: &S) {
        let mut count = self.count.lock();
        *count += 1;
        if *count <= 0 {
            self.channel.wakeup_one(scheduler);
        }
    }

    pub fn value(&self) -> i32 {
        *self.count.lock()
    }
}
