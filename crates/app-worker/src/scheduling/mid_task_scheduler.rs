//! Two-tier mutual-exclusion scheduler.
//!
//! Work is either a *task* (request handling) or a *mid task* (cluster token
//! edits, store sweeps). Any number of jobs of one tier run together, but the
//! two tiers never overlap. A job starts immediately only when the other tier
//! has nothing running and nothing pending, so neither tier can starve the
//! other. When a tier's running count drops to zero, the whole pending queue
//! of the other tier is released at once.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Task,
    MidTask,
}

impl Tier {
    const fn opposite(self) -> Self {
        match self {
            Tier::Task => Tier::MidTask,
            Tier::MidTask => Tier::Task,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Tier::Task => "task",
            Tier::MidTask => "mid_task",
        }
    }
}

#[derive(Default)]
struct State {
    running_tasks: usize,
    running_mid_tasks: usize,
    pending_tasks: VecDeque<BoxFuture<'static, ()>>,
    pending_mid_tasks: VecDeque<BoxFuture<'static, ()>>,
}

impl State {
    fn running(&mut self, tier: Tier) -> &mut usize {
        match tier {
            Tier::Task => &mut self.running_tasks,
            Tier::MidTask => &mut self.running_mid_tasks,
        }
    }

    fn pending(&mut self, tier: Tier) -> &mut VecDeque<BoxFuture<'static, ()>> {
        match tier {
            Tier::Task => &mut self.pending_tasks,
            Tier::MidTask => &mut self.pending_mid_tasks,
        }
    }

    fn is_idle(&mut self, tier: Tier) -> bool {
        *self.running(tier) == 0 && self.pending(tier).is_empty()
    }
}

/// Snapshot of the scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCounts {
    pub running_tasks: usize,
    pub running_mid_tasks: usize,
    pub pending_tasks: usize,
    pub pending_mid_tasks: usize,
}

/// Cloneable handle; clones share one scheduler.
#[derive(Clone, Default)]
pub struct MidTaskScheduler {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MidTaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidTaskScheduler")
            .field("counts", &self.counts())
            .finish()
    }
}

impl MidTaskScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a task.
    pub fn schedule_task<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Tier::Task, job.boxed());
    }

    /// Schedule a mid task.
    pub fn schedule_mid_task<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Tier::MidTask, job.boxed());
    }

    #[must_use]
    pub fn running_tasks_count(&self) -> usize {
        self.lock().running_tasks
    }

    #[must_use]
    pub fn running_mid_tasks_count(&self) -> usize {
        self.lock().running_mid_tasks
    }

    #[must_use]
    pub fn counts(&self) -> SchedulerCounts {
        let state = self.lock();
        SchedulerCounts {
            running_tasks: state.running_tasks,
            running_mid_tasks: state.running_mid_tasks,
            pending_tasks: state.pending_tasks.len(),
            pending_mid_tasks: state.pending_mid_tasks.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, tier: Tier, job: BoxFuture<'static, ()>) {
        let mut state = self.lock();
        if state.is_idle(tier.opposite()) {
            self.start(&mut state, tier, job);
        } else {
            state.pending(tier).push_back(job);
            debug!(
                target: "worker.scheduler",
                tier = tier.as_str(),
                pending = state.pending(tier).len(),
                "Job deferred until the other tier drains"
            );
        }
    }

    // Counters change under the lock, so the two running counts are never
    // observed non-zero together.
    fn start(&self, state: &mut State, tier: Tier, job: BoxFuture<'static, ()>) {
        *state.running(tier) += 1;
        let scheduler = self.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                warn!(target: "worker.scheduler", tier = tier.as_str(), "Scheduled job panicked");
            }
            scheduler.finish(tier);
        });
    }

    fn finish(&self, tier: Tier) {
        let mut state = self.lock();
        let running = state.running(tier);
        *running = running.saturating_sub(1);
        if *running > 0 {
            return;
        }

        let released = std::mem::take(state.pending(tier.opposite()));
        if !released.is_empty() {
            debug!(
                target: "worker.scheduler",
                tier = tier.opposite().as_str(),
                released = released.len(),
                "Releasing pending jobs"
            );
        }
        for job in released {
            self.start(&mut state, tier.opposite(), job);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn tracked_job(
        scheduler: &MidTaskScheduler,
        overlap: &Arc<AtomicBool>,
        done: &Arc<AtomicUsize>,
        millis: u64,
    ) -> impl Future<Output = ()> + Send + 'static {
        let scheduler = scheduler.clone();
        let overlap = Arc::clone(overlap);
        let done = Arc::clone(done);
        async move {
            for _ in 0..3 {
                let counts = scheduler.counts();
                if counts.running_tasks > 0 && counts.running_mid_tasks > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiers_never_overlap() {
        let scheduler = MidTaskScheduler::new();
        let overlap = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));

        // Interleave both tiers with varying durations.
        for i in 0..20_u64 {
            let job = tracked_job(&scheduler, &overlap, &done, 1 + i % 7);
            if i % 3 == 0 {
                scheduler.schedule_mid_task(job);
            } else {
                scheduler.schedule_task(job);
            }
            let counts = scheduler.counts();
            assert!(!(counts.running_tasks > 0 && counts.running_mid_tasks > 0));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(done.load(Ordering::SeqCst), 20);
        let counts = scheduler.counts();
        assert_eq!(counts.running_tasks + counts.running_mid_tasks, 0);
        assert_eq!(counts.pending_tasks + counts.pending_mid_tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_tier_runs_concurrently() {
        let scheduler = MidTaskScheduler::new();

        for _ in 0..3 {
            scheduler.schedule_task(tokio::time::sleep(Duration::from_millis(50)));
        }

        assert_eq!(scheduler.running_tasks_count(), 3);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(scheduler.running_tasks_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_tier_released_in_one_batch() {
        let scheduler = MidTaskScheduler::new();

        scheduler.schedule_task(tokio::time::sleep(Duration::from_millis(50)));
        scheduler.schedule_mid_task(tokio::time::sleep(Duration::from_millis(50)));
        scheduler.schedule_mid_task(tokio::time::sleep(Duration::from_millis(50)));

        let counts = scheduler.counts();
        assert_eq!(counts.running_tasks, 1);
        assert_eq!(counts.pending_mid_tasks, 2);

        tokio::time::sleep(Duration::from_millis(55)).await;

        let counts = scheduler.counts();
        assert_eq!(counts.running_tasks, 0);
        assert_eq!(counts.running_mid_tasks, 2);
        assert_eq!(counts.pending_mid_tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_opposite_tier_blocks_newcomers() {
        let scheduler = MidTaskScheduler::new();

        scheduler.schedule_task(tokio::time::sleep(Duration::from_millis(50)));
        scheduler.schedule_mid_task(tokio::time::sleep(Duration::from_millis(50)));
        // A mid task is waiting, so this task must not jump ahead of it.
        scheduler.schedule_task(tokio::time::sleep(Duration::from_millis(50)));

        let counts = scheduler.counts();
        assert_eq!(counts.running_tasks, 1);
        assert_eq!(counts.pending_tasks, 1);

        tokio::time::sleep(Duration::from_millis(55)).await;
        let counts = scheduler.counts();
        assert_eq!(counts.running_mid_tasks, 1);
        assert_eq!(counts.pending_tasks, 1);

        tokio::time::sleep(Duration::from_millis(55)).await;
        let counts = scheduler.counts();
        assert_eq!(counts.running_tasks, 1);
        assert_eq!(counts.running_mid_tasks, 0);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_slot() {
        let scheduler = MidTaskScheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        #[allow(clippy::panic)]
        scheduler.schedule_task(async { panic!("job failure") });
        scheduler.schedule_mid_task(async move {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("mid task should run after the panicking task")
            .unwrap();
    }
}
