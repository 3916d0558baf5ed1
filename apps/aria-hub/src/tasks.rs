use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Body of a recurring task. Called once per tick; each call yields a fresh future.
pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`TaskAction`].
pub fn action<F, Fut>(f: F) -> TaskAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub interval_secs: f64,
    pub run_immediately: bool,
    #[serde(flatten)]
    pub stats: TaskStats,
}

struct ScheduledTask {
    interval: Duration,
    run_immediately: bool,
    token: CancellationToken,
    handle: JoinHandle<()>,
    stats: Arc<Mutex<TaskStats>>,
}

/// Recurring background tasks keyed by id. Each task owns a child of the
/// scheduler's cancellation token; re-registering an id cancels the old one.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn schedule(
        &self,
        task_id: &str,
        interval: Duration,
        run_immediately: bool,
        action: TaskAction,
    ) {
        let interval = interval.max(Duration::from_millis(1));
        let token = self.root.child_token();
        let stats = Arc::new(Mutex::new(TaskStats::default()));
        let handle = tokio::spawn(run_loop(
            task_id.to_string(),
            interval,
            run_immediately,
            action,
            token.clone(),
            stats.clone(),
        ));
        let replaced = self.tasks.lock().insert(
            task_id.to_string(),
            ScheduledTask {
                interval,
                run_immediately,
                token,
                handle,
                stats,
            },
        );
        if let Some(old) = replaced {
            old.token.cancel();
            info!(task = task_id, "replaced existing schedule");
        } else {
            debug!(task = task_id, interval_secs = interval.as_secs_f64(), "task scheduled");
        }
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.lock().remove(task_id) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.lock().contains_key(task_id)
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let guard = self.tasks.lock();
        let mut items: Vec<TaskInfo> = guard
            .iter()
            .map(|(id, task)| TaskInfo {
                task_id: id.clone(),
                interval_secs: task.interval.as_secs_f64(),
                run_immediately: task.run_immediately,
                stats: task.stats.lock().clone(),
            })
            .collect();
        items.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        items
    }

    /// Stop issuing ticks, wait for in-flight bodies up to `grace`, then abort
    /// whatever is still running.
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        self.root.cancel();
        let drained: Vec<(String, ScheduledTask)> = self.tasks.lock().drain().collect();
        let deadline = tokio::time::Instant::now() + grace;
        for (name, task) in drained {
            let mut handle = task.handle;
            let sleeper = tokio::time::sleep_until(deadline);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                    warn!(task = %name, "task aborted after grace period");
                }
            }
        }
    }
}

async fn run_loop(
    task_id: String,
    period: Duration,
    run_immediately: bool,
    action: TaskAction,
    token: CancellationToken,
    stats: Arc<Mutex<TaskStats>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !run_immediately {
        // first tick of an interval completes immediately
        ticker.tick().await;
    }
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        trace!(task = %task_id, "task tick");
        let result = AssertUnwindSafe(action()).catch_unwind().await;
        metrics::counter!("aria_task_runs_total", "task" => task_id.clone()).increment(1);
        if !matches!(result, Ok(Ok(()))) {
            metrics::counter!("aria_task_failures_total", "task" => task_id.clone()).increment(1);
        }
        let mut s = stats.lock();
        s.runs += 1;
        s.last_run = Some(aria_kernel::now_iso());
        match result {
            Ok(Ok(())) => s.last_error = None,
            Ok(Err(err)) => {
                s.failures += 1;
                s.last_error = Some(err.to_string());
                error!(task = %task_id, error = %err, "scheduled task failed");
            }
            Err(_) => {
                s.failures += 1;
                s.last_error = Some("panicked".into());
                error!(task = %task_id, "scheduled task panicked");
            }
        }
    }
    trace!(task = %task_id, "task loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting(counter: Arc<AtomicU64>) -> TaskAction {
        action(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn run_immediately_fires_before_first_wait() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        scheduler.schedule("now", Duration::from_secs(10), true, counting(hits.clone()));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        scheduler.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_one_interval() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU64::new(0));
        scheduler.schedule("later", Duration::from_secs(10), false, counting(hits.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        scheduler.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_keeps_its_schedule() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        scheduler.schedule(
            "flaky",
            Duration::from_secs(1),
            true,
            action(move || {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    match n {
                        0 => anyhow::bail!("first run fails"),
                        1 => panic!("second run panics"),
                        _ => Ok(()),
                    }
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let info = scheduler.snapshot();
        assert_eq!(info[0].stats.runs, 4);
        assert_eq!(info[0].stats.failures, 2);
        assert!(info[0].stats.last_error.is_none());
        scheduler.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_replaces_old_schedule() {
        let scheduler = Scheduler::new();
        let old = Arc::new(AtomicU64::new(0));
        let new = Arc::new(AtomicU64::new(0));
        scheduler.schedule("job", Duration::from_secs(1), true, counting(old.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let old_before = old.load(Ordering::SeqCst);
        scheduler.schedule("job", Duration::from_secs(1), true, counting(new.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(old.load(Ordering::SeqCst), old_before);
        assert!(new.load(Ordering::SeqCst) >= 5);
        assert_eq!(scheduler.snapshot().len(), 1);
        scheduler.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_body() {
        let scheduler = Scheduler::new();
        let done = Arc::new(AtomicU64::new(0));
        let flag = done.clone();
        scheduler.schedule(
            "slow",
            Duration::from_secs(60),
            true,
            action(move || {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    flag.store(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown_with_grace(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!scheduler.contains("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_after_grace() {
        let scheduler = Scheduler::new();
        let done = Arc::new(AtomicU64::new(0));
        let flag = done.clone();
        scheduler.schedule(
            "stuck",
            Duration::from_secs(60),
            true,
            action(move || {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    flag.store(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown_with_grace(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
