//! Single-flight asynchronous tasks.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::error;

/// Factory for the future executed by a [`SingletonTask`].
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A task that can be scheduled from multiple threads but runs at most one
/// instance at a time.
///
/// Repeated schedule calls before the task runs coalesce into a single
/// execution. A task rescheduled while it is running is guaranteed exactly
/// one additional execution after the current run completes. A non-zero
/// `max_delay` bounds starvation: once the task has been pending for longer
/// than `max_delay`, further reschedules no longer push it back.
pub struct SingletonTask {
    handle: Handle,
    task: TaskFn,
    state: Arc<Mutex<TaskState>>,
}

struct TaskState {
    should_run: bool,
    running: bool,
    instance: Option<Arc<TaskInstance>>,
}

struct TaskInstance {
    canceled: AtomicBool,
    first_sched: Instant,
    // Updated when the task is rescheduled while running; read back when
    // the current run completes.
    next_sched: Mutex<Instant>,
}

impl TaskInstance {
    fn new(first_sched: Instant, next_sched: Instant) -> Arc<Self> {
        Arc::new(TaskInstance {
            canceled: AtomicBool::new(false),
            first_sched,
            next_sched: Mutex::new(next_sched),
        })
    }
}

impl SingletonTask {
    /// Create a task running `task` on the given runtime. Nothing executes
    /// until [`schedule`](Self::schedule) is called.
    pub fn new(handle: Handle, task: TaskFn) -> Self {
        SingletonTask {
            handle,
            task,
            state: Arc::new(Mutex::new(TaskState {
                should_run: false,
                running: false,
                instance: None,
            })),
        }
    }

    /// Schedule one execution after `delay`. Coalesces with any pending
    /// execution.
    pub fn schedule(&self, delay: Duration) {
        self.schedule_bounded(delay, Duration::ZERO);
    }

    /// Schedule one execution after `delay`, but if the task has already
    /// been pending longer than `max_delay` let it run at its current
    /// deadline instead of pushing it back. A zero `max_delay` disables the
    /// starvation check.
    pub fn schedule_bounded(&self, delay: Duration, max_delay: Duration) {
        let now = Instant::now();
        let next_sched = now + delay;
        let mut first_sched = now;
        let mut need_queue = true;

        let mut state = self.state.lock();
        if state.running || state.should_run {
            if let Some(instance) = state.instance.as_ref() {
                if state.running {
                    // Rearm after the current run completes.
                    *instance.next_sched.lock() = next_sched;
                    need_queue = false;
                } else if max_delay > Duration::ZERO
                    && instance.first_sched + max_delay < next_sched
                {
                    // Starved past the bound; let the pending run fire.
                    need_queue = false;
                } else {
                    instance.canceled.store(true, Ordering::SeqCst);
                    first_sched = instance.first_sched;
                }
            }
        }
        state.should_run = true;

        if need_queue {
            let instance = TaskInstance::new(first_sched, next_sched);
            state.instance = Some(instance.clone());
            drop(state);
            arm(&self.handle, self.state.clone(), self.task.clone(), instance);
        }
    }

    /// Drop any pending execution and suppress the rerun of a task that is
    /// currently executing.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.should_run {
            if let Some(instance) = state.instance.as_ref() {
                instance.canceled.store(true, Ordering::SeqCst);
            }
        }
        state.should_run = false;
    }
}

impl Drop for SingletonTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn arm(
    handle: &Handle,
    state: Arc<Mutex<TaskState>>,
    task: TaskFn,
    instance: Arc<TaskInstance>,
) {
    let spawn_handle = handle.clone();
    handle.spawn(async move {
        let deadline = *instance.next_sched.lock();
        tokio::time::sleep_until(deadline).await;

        {
            let mut st = state.lock();
            if instance.canceled.load(Ordering::SeqCst) || !st.should_run {
                return;
            }
            st.running = true;
            st.should_run = false;
        }

        if AssertUnwindSafe((task)()).catch_unwind().await.is_err() {
            error!(target: "warren::task", "panic while running singleton task");
        }

        let rearm = {
            let mut st = state.lock();
            st.running = false;
            if st.should_run {
                let next = *instance.next_sched.lock();
                let fresh = TaskInstance::new(Instant::now(), next);
                st.instance = Some(fresh.clone());
                Some(fresh)
            } else {
                None
            }
        };
        if let Some(fresh) = rearm {
            arm(&spawn_handle, state, task, fresh);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::time::sleep;

    fn counting_task(counter: Arc<AtomicU64>) -> TaskFn {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn slow_counting_task(counter: Arc<AtomicU64>, work: Duration) -> TaskFn {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                sleep(work).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_when_scheduled() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(Handle::current(), counting_task(count.clone()));
        task.schedule(Duration::ZERO);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_delay() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(Handle::current(), counting_task(count.clone()));
        task.schedule(Duration::from_millis(20));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(0, count.load(Ordering::SeqCst));
        sleep(Duration::from_millis(30)).await;
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(Handle::current(), counting_task(count.clone()));
        task.schedule(Duration::from_millis(20));
        task.cancel();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_run() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(Handle::current(), counting_task(count.clone()));
        task.schedule(Duration::from_millis(20));

        for _ in 0..10 {
            sleep(Duration::from_millis(5)).await;
            assert_eq!(0, count.load(Ordering::SeqCst));
            task.schedule(Duration::from_millis(20));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_bounds_starvation() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(Handle::current(), counting_task(count.clone()));

        // Reschedule faster than the delay; the starvation bound must let
        // the task through anyway.
        for _ in 0..18 {
            task.schedule_bounded(Duration::from_millis(20), Duration::from_millis(40));
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(100)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_during_run_reruns_once() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(
            Handle::current(),
            slow_counting_task(count.clone(), Duration::from_millis(30)),
        );

        task.schedule(Duration::from_millis(10));
        sleep(Duration::from_millis(20)).await;
        // First run is in flight; this requests exactly one more.
        task.schedule(Duration::from_millis(10));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_run_suppresses_rerun() {
        let count = Arc::new(AtomicU64::new(0));
        let task = SingletonTask::new(
            Handle::current(),
            slow_counting_task(count.clone(), Duration::from_millis(30)),
        );

        task.schedule(Duration::ZERO);
        sleep(Duration::from_millis(10)).await;
        task.schedule(Duration::ZERO);
        task.cancel();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(1, count.load(Ordering::SeqCst));
    }
}
