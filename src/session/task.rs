use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Enable flag shared between a loop and whoever stops it.
#[derive(Debug, Clone)]
pub struct LoopFlag(Rc<Cell<bool>>);

impl LoopFlag {
    pub fn enabled() -> Self {
        Self(Rc::new(Cell::new(true)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.get()
    }

    pub fn disable(&self) {
        self.0.set(false);
    }
}

/// A task that runs `work`, hands its result to `publish`, waits `delay`
/// and repeats.
///
/// The flag is checked before each cycle and again once `work` completes:
/// a result that arrives after the flag was cleared is dropped and nothing
/// further is scheduled. `cancel` never interrupts work already in flight.
pub struct RepeatingTask {
    flag: LoopFlag,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Must be called from within a `LocalSet`.
    pub fn spawn<W, Fut, T, P>(name: &'static str, delay: Duration, mut work: W, mut publish: P) -> Self
    where
        W: FnMut() -> Fut + 'static,
        Fut: Future<Output = Option<T>> + 'static,
        P: FnMut(T) + 'static,
        T: 'static,
    {
        let flag = LoopFlag::enabled();
        let loop_flag = flag.clone();
        let handle = tokio::task::spawn_local(async move {
            tracing::debug!("{} loop started", name);
            while loop_flag.is_enabled() {
                let result = work().await;
                if !loop_flag.is_enabled() {
                    tracing::debug!("{} result discarded after cancel", name);
                    break;
                }
                if let Some(value) = result {
                    publish(value);
                }
                tokio::time::sleep(delay).await;
            }
            tracing::debug!("{} loop stopped", name);
        });
        Self { flag, handle }
    }

    pub fn cancel(&self) {
        self.flag.disable();
    }

    pub fn is_running(&self) -> bool {
        self.flag.is_enabled() && !self.handle.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn publishes_until_cancelled() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let seen = Rc::new(RefCell::new(Vec::new()));
                let counter = Rc::new(Cell::new(0u32));

                let c = Rc::clone(&counter);
                let s = Rc::clone(&seen);
                let task = RepeatingTask::spawn(
                    "test",
                    Duration::from_millis(80),
                    move || {
                        let c = Rc::clone(&c);
                        async move {
                            c.set(c.get() + 1);
                            Some(c.get())
                        }
                    },
                    move |v| s.borrow_mut().push(v),
                );

                tokio::time::sleep(Duration::from_millis(250)).await;
                task.cancel();
                let count = seen.borrow().len();
                assert!(count >= 3, "only {} cycles", count);

                tokio::time::sleep(Duration::from_millis(500)).await;
                assert_eq!(seen.borrow().len(), count);
                assert!(task.is_finished());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_result_is_discarded() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let seen = Rc::new(RefCell::new(Vec::<u32>::new()));
                let s = Rc::clone(&seen);
                let task = RepeatingTask::spawn(
                    "slow",
                    Duration::from_millis(10),
                    || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Some(1)
                    },
                    move |v| s.borrow_mut().push(v),
                );

                // Cancel while the first cycle is still working
                tokio::time::sleep(Duration::from_millis(50)).await;
                task.cancel();
                tokio::time::sleep(Duration::from_millis(200)).await;

                assert!(seen.borrow().is_empty());
                assert!(task.is_finished());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycles_keep_the_loop_going() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let calls = Rc::new(Cell::new(0u32));
                let c = Rc::clone(&calls);
                let task = RepeatingTask::spawn(
                    "failing",
                    Duration::from_millis(10),
                    move || {
                        c.set(c.get() + 1);
                        async { None::<()> }
                    },
                    |_| {},
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(calls.get() > 3);
                assert!(task.is_running());
                task.cancel();
            })
            .await;
    }
}
