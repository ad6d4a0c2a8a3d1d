use crate::{Scheduler, SpinLock, WaitChannel};

struct SleepState<Task> {
    locked: bool,
    holder: Option<Task>,
}

/// A lock whose waiters sleep instead of spinning.
///
/// Suitable for long critical sections such as page-file I/O. Only the
/// holder may release it.
pub struct SleepLock<Task> {
    name: &'static str,
    state: SpinLock<SleepState<Task>>,
    channel: WaitChannel<Task>,
}

impl<Task: Copy + Eq> SleepLock<Task> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: SpinLock::named("sleep lock state", SleepState {
                locked: false,
                holder: None,
            }),
            channel: WaitChannel::new("sleep lock channel"),
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn acquire<S: Scheduler<Task = Task>>(&self, scheduler: &S) {
        let mut state = self.state.lock();
        while state.locked {
            state = self.channel.sleep(scheduler, state);
        }
        state.locked = true;
        state.holder = Some(scheduler.current());
    }

    /// Release the lock and wake every waiter; they race to re-acquire it.
    ///
    /// # Panics
    /// If the current task does not hold the lock.
    pub fn release<S: Scheduler<Task = Task>>(&self, scheduler: &S) {
        let mut state = self.state.lock();
        assert!(
            state.locked && state.holder == Some(scheduler.current()),
            "release of sleep lock {} by a task that does not hold it",
            self.name
        );
        state.locked = false;
        state.holder = None;
        if self.channel.queue_len() > 0 {
            self.channel.wakeup_all(scheduler);
        }
    }

    /// Whether the current task holds the lock.
    pub fn holding<S: Scheduler<Task = Task>>(&self, scheduler: &S) -> bool {
        let state = self.state.lock();
        state.locked && state.holder == Some(scheduler.current())
    }
}
