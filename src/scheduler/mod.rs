//! Per-connection priority scheduler
//!
//! Each connection gets five FIFO buckets and a concurrency ceiling.
//! `Critical` work runs inline and bypasses everything. Other work is
//! admitted by a graded policy: the lower the priority, the more free
//! slots it needs, so speculative work is the first to pause when a host
//! gets busy. Task failures are logged and swallowed.

use crate::config::SchedulerSettings;
use crate::error::EngineResult;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lower value runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Idle = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Idle,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Free slots a task of this priority needs before it is admitted
    pub fn required_slots(self) -> usize {
        self.index()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Idle => "idle",
        };
        f.pad(name)
    }
}

/// Whether a task of `priority` may start given the connection's load.
///
/// Thresholds are capped at the ceiling, and at least one free slot is
/// always required, so a ceiling of 0 pauses the connection.
pub fn admits(priority: Priority, ceiling: usize, active: usize) -> bool {
    if priority == Priority::Critical {
        return true;
    }
    let available = ceiling.saturating_sub(active);
    let required = priority.required_slots().min(ceiling).max(1);
    available >= required
}

/// A unit of schedulable work
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>) -> BoxFuture<'static, EngineResult<()>>;
}

impl<F, Fut> Runnable for F
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = EngineResult<()>> + Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, EngineResult<()>> {
        (*self)().boxed()
    }
}

/// Introspectable description of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub connection_id: String,
    pub priority: Priority,
    pub description: String,
    pub created_at: i64,
}

/// A prioritized unit of work bound to one connection
pub struct QueueTask {
    info: TaskInfo,
    work: Box<dyn Runnable>,
}

impl QueueTask {
    pub fn new(
        connection_id: &str,
        description: impl Into<String>,
        priority: Priority,
        work: impl Runnable,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_millis();
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        Self {
            info: TaskInfo {
                id: format!("{}-{}-{}", connection_id, created_at, suffix),
                connection_id: connection_id.to_string(),
                priority,
                description: description.into(),
                created_at,
            },
            work: Box::new(work),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn priority(&self) -> Priority {
        self.info.priority
    }

    pub fn connection_id(&self) -> &str {
        &self.info.connection_id
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Run the work, consuming the task
    pub async fn execute(self) -> EngineResult<()> {
        self.work.run().await
    }
}

impl std::fmt::Debug for QueueTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTask").field("info", &self.info).finish()
    }
}

/// A task that is currently running
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    #[serde(flatten)]
    pub info: TaskInfo,
    pub started_at: i64,
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub total: u64,
    pub by_priority: BTreeMap<Priority, usize>,
}

/// Counters for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connection_id: String,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub total: u64,
    pub ceiling: usize,
    pub cancelled: bool,
    pub by_priority: BTreeMap<Priority, usize>,
}

struct ConnectionQueue {
    buckets: [VecDeque<QueueTask>; 5],
    active: HashSet<String>,
    completed: u64,
    cancelled: bool,
    draining: bool,
    redrain: bool,
    ceiling: usize,
}

impl ConnectionQueue {
    fn new(ceiling: usize) -> Self {
        Self {
            buckets: Default::default(),
            active: HashSet::new(),
            completed: 0,
            cancelled: false,
            draining: false,
            redrain: false,
            ceiling,
        }
    }

    fn queued(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn discard_pending(&mut self) -> usize {
        let dropped = self.queued();
        self.buckets.iter_mut().for_each(VecDeque::clear);
        dropped
    }

    fn by_priority(&self) -> BTreeMap<Priority, usize> {
        Priority::ALL
            .iter()
            .map(|p| (*p, self.buckets[p.index()].len()))
            .collect()
    }

    /// Pop from the highest non-empty bucket that is admissible right now
    fn next_admissible(&mut self) -> Option<QueueTask> {
        let active = self.active.len();
        let ceiling = self.ceiling;
        self.buckets
            .iter_mut()
            .zip(Priority::ALL)
            .find(|(bucket, priority)| !bucket.is_empty() && admits(*priority, ceiling, active))
            .and_then(|(bucket, _)| bucket.pop_front())
    }

    fn status(&self, connection_id: &str) -> ConnectionStatus {
        let active = self.active.len();
        let queued = self.queued();
        ConnectionStatus {
            connection_id: connection_id.to_string(),
            active,
            queued,
            completed: self.completed,
            total: (active + queued) as u64 + self.completed,
            ceiling: self.ceiling,
            cancelled: self.cancelled,
            by_priority: self.by_priority(),
        }
    }
}

struct SchedulerInner {
    default_ceiling: usize,
    ceilings: Mutex<HashMap<String, usize>>,
    queues: Mutex<HashMap<String, ConnectionQueue>>,
    running: DashMap<String, ActiveTask>,
    cancelled: AtomicBool,
}

/// Priority task queue with per-connection admission control.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(settings: &SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                default_ceiling: settings.max_concurrent,
                ceilings: Mutex::new(settings.per_host.clone()),
                queues: Mutex::new(HashMap::new()),
                running: DashMap::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    fn ceiling_for(&self, connection_id: &str) -> usize {
        self.inner
            .ceilings
            .lock()
            .get(connection_id)
            .copied()
            .unwrap_or(self.inner.default_ceiling)
    }

    fn with_queue<T>(&self, connection_id: &str, f: impl FnOnce(&mut ConnectionQueue) -> T) -> T {
        let ceiling = self.ceiling_for(connection_id);
        let mut queues = self.inner.queues.lock();
        let queue = queues
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionQueue::new(ceiling));
        f(queue)
    }

    /// Submit work for a connection.
    ///
    /// `Critical` work runs now and its result is returned. Anything else
    /// is queued and `Ok(())` comes back immediately; once cancelled, a
    /// connection silently drops non-critical submissions.
    pub async fn enqueue<F, Fut>(
        &self,
        connection_id: &str,
        description: &str,
        priority: Priority,
        work: F,
    ) -> EngineResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<()>> + Send + 'static,
    {
        self.submit(QueueTask::new(connection_id, description, priority, work))
            .await
    }

    /// `enqueue` for a prebuilt task
    pub async fn submit(&self, task: QueueTask) -> EngineResult<()> {
        if task.priority() == Priority::Critical {
            tracing::debug!("Running critical task inline: {}", task.info.description);
            return task.execute().await;
        }

        let connection_id = task.connection_id().to_string();
        let global_cancel = self.inner.cancelled.load(Ordering::SeqCst);
        let accepted = self.with_queue(&connection_id, |queue| {
            if global_cancel || queue.cancelled {
                return false;
            }
            queue.buckets[task.priority().index()].push_back(task);
            true
        });

        if accepted {
            self.drain(&connection_id);
        } else {
            tracing::debug!("Dropped task for cancelled connection {}", connection_id);
        }
        Ok(())
    }

    /// Launch every admissible pending task for a connection.
    ///
    /// Re-entrant calls while a pass is in flight only flag a rerun.
    pub fn drain(&self, connection_id: &str) {
        loop {
            let batch = {
                let mut queues = self.inner.queues.lock();
                let Some(queue) = queues.get_mut(connection_id) else {
                    return;
                };
                if queue.draining {
                    queue.redrain = true;
                    return;
                }
                queue.draining = true;
                queue.redrain = false;

                let mut batch = Vec::new();
                while let Some(task) = queue.next_admissible() {
                    queue.active.insert(task.id().to_string());
                    batch.push(task);
                }
                batch
            };

            for task in batch {
                self.launch(task);
            }

            let mut queues = self.inner.queues.lock();
            let Some(queue) = queues.get_mut(connection_id) else {
                return;
            };
            queue.draining = false;
            if !queue.redrain {
                return;
            }
        }
    }

    fn launch(&self, task: QueueTask) {
        let info = task.info().clone();
        self.inner.running.insert(
            info.id.clone(),
            ActiveTask {
                info: info.clone(),
                started_at: chrono::Utc::now().timestamp_millis(),
            },
        );

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::error!("No async runtime; dropping task '{}'", info.description);
                self.finish(&info);
                return;
            }
        };

        let scheduler = self.clone();
        handle.spawn(async move {
            tracing::debug!("Task started on {}: {}", info.connection_id, info.description);
            match AssertUnwindSafe(task.execute()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Task '{}' on {} failed: {}", info.description, info.connection_id, e);
                }
                Err(_) => {
                    tracing::error!("Task '{}' on {} panicked", info.description, info.connection_id);
                }
            }
            scheduler.finish(&info);
        });
    }

    fn finish(&self, info: &TaskInfo) {
        self.inner.running.remove(&info.id);
        {
            let mut queues = self.inner.queues.lock();
            if let Some(queue) = queues.get_mut(&info.connection_id) {
                if queue.active.remove(&info.id) {
                    queue.completed += 1;
                }
            }
        }
        self.drain(&info.connection_id);
    }

    /// Drop all pending work and ignore non-critical submissions until `reset`
    pub fn cancel_all(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let dropped: usize = self
            .inner
            .queues
            .lock()
            .values_mut()
            .map(ConnectionQueue::discard_pending)
            .sum();
        tracing::info!("Cancelled all scheduled work ({} pending dropped)", dropped);
    }

    /// `cancel_all` scoped to one connection
    pub fn cancel_connection(&self, connection_id: &str) {
        let dropped = self.with_queue(connection_id, |queue| {
            queue.cancelled = true;
            queue.discard_pending()
        });
        tracing::info!(
            "Cancelled scheduled work for {} ({} pending dropped)",
            connection_id,
            dropped
        );
    }

    /// Clear every cancellation flag and counter
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
        for queue in self.inner.queues.lock().values_mut() {
            queue.cancelled = false;
            queue.completed = 0;
        }
        tracing::debug!("Scheduler reset");
    }

    pub fn reset_connection(&self, connection_id: &str) {
        self.with_queue(connection_id, |queue| {
            queue.cancelled = false;
            queue.completed = 0;
        });
    }

    /// Forget a connection's queue and counters entirely
    pub fn clear_connection(&self, connection_id: &str) {
        if let Some(queue) = self.inner.queues.lock().remove(connection_id) {
            tracing::debug!(
                "Cleared scheduler queue for {} ({} pending dropped)",
                connection_id,
                queue.queued()
            );
        }
    }

    /// Change a connection's ceiling; raising it starts waiting work
    pub fn set_concurrency(&self, connection_id: &str, ceiling: usize) {
        self.inner
            .ceilings
            .lock()
            .insert(connection_id.to_string(), ceiling);
        self.with_queue(connection_id, |queue| queue.ceiling = ceiling);
        if tokio::runtime::Handle::try_current().is_ok() {
            self.drain(connection_id);
        }
    }

    /// Queued tasks for a connection, in the order they would be drained
    pub fn pending(&self, connection_id: &str) -> Vec<TaskInfo> {
        self.inner
            .queues
            .lock()
            .get(connection_id)
            .map(|queue| {
                queue
                    .buckets
                    .iter()
                    .flat_map(|bucket| bucket.iter().map(|t| t.info().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Running tasks across all connections, oldest first
    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut tasks: Vec<ActiveTask> = self.inner.running.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub fn status(&self) -> SchedulerStatus {
        let queues = self.inner.queues.lock();
        let mut status = SchedulerStatus {
            active: self.inner.running.len(),
            ..SchedulerStatus::default()
        };
        for priority in Priority::ALL {
            status.by_priority.insert(priority, 0);
        }
        for queue in queues.values() {
            status.queued += queue.queued();
            status.completed += queue.completed;
            for (priority, count) in queue.by_priority() {
                *status.by_priority.entry(priority).or_default() += count;
            }
        }
        status.total = (status.active + status.queued) as u64 + status.completed;
        status
    }

    pub fn connection_status(&self, connection_id: &str) -> ConnectionStatus {
        let queues = self.inner.queues.lock();
        match queues.get(connection_id) {
            Some(queue) => queue.status(connection_id),
            None => ConnectionQueue::new(self.ceiling_for(connection_id)).status(connection_id),
        }
    }

    /// Cancel everything pending. Running tasks finish on their own.
    pub fn shutdown(&self) {
        self.cancel_all();
        let running = self.inner.running.len();
        if running > 0 {
            tracing::info!("Scheduler shut down with {} task(s) still running", running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const CONN: &str = "h:22:u";

    fn scheduler() -> Scheduler {
        Scheduler::new(&SchedulerSettings::default())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Enqueue `n` tasks that hold their slot until the gate opens
    async fn occupy(scheduler: &Scheduler, gate: &Arc<Semaphore>, n: usize) {
        for i in 0..n {
            let gate = Arc::clone(gate);
            scheduler
                .enqueue(CONN, &format!("blocker {}", i), Priority::High, move || async move {
                    let _permit = gate.acquire().await;
                    Ok(())
                })
                .await
                .unwrap();
        }
        wait_until(|| scheduler.connection_status(CONN).active == n).await;
    }

    #[test]
    fn test_admission_table() {
        assert!(admits(Priority::Critical, 5, 5));
        assert!(admits(Priority::High, 5, 4));
        assert!(!admits(Priority::High, 5, 5));
        assert!(admits(Priority::Medium, 5, 3));
        assert!(!admits(Priority::Medium, 5, 4));
        assert!(admits(Priority::Low, 5, 2));
        assert!(!admits(Priority::Low, 5, 3));
        assert!(admits(Priority::Idle, 5, 1));
        assert!(!admits(Priority::Idle, 5, 2));
        assert!(admits(Priority::Idle, 5, 0));

        // Small ceilings cap the threshold, zero pauses
        assert!(admits(Priority::Idle, 2, 0));
        assert!(!admits(Priority::Idle, 2, 1));
        assert!(!admits(Priority::High, 0, 0));
    }

    #[tokio::test]
    async fn test_full_connection_blocks_high_but_not_critical() {
        let scheduler = scheduler();
        let gate = Arc::new(Semaphore::new(0));
        occupy(&scheduler, &gate, 5).await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler
            .enqueue(CONN, "user click", Priority::High, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(scheduler.pending(CONN).len(), 1);
        assert!(!ran.load(Ordering::SeqCst));

        let critical = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&critical);
        scheduler
            .enqueue(CONN, "open file", Priority::Critical, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(critical.load(Ordering::SeqCst));
        assert_eq!(scheduler.connection_status(CONN).active, 5);

        gate.add_permits(10);
        wait_until(|| ran.load(Ordering::SeqCst)).await;
        wait_until(|| scheduler.connection_status(CONN).completed == 6).await;
        assert!(scheduler.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_idle_admitted_on_quiet_connection() {
        let scheduler = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler
            .enqueue(CONN, "prefetch", Priority::Idle, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| ran.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_graded_backoff() {
        let scheduler = scheduler();
        let gate = Arc::new(Semaphore::new(0));
        occupy(&scheduler, &gate, 2).await;

        for priority in [Priority::Medium, Priority::Low, Priority::Idle] {
            let gate = Arc::clone(&gate);
            scheduler
                .enqueue(CONN, &priority.to_string(), priority, move || async move {
                    let _permit = gate.acquire().await;
                    Ok(())
                })
                .await
                .unwrap();
        }

        // Medium fits in 3 free slots; Low and Idle then lack room
        let pending: Vec<Priority> = scheduler.pending(CONN).iter().map(|t| t.priority).collect();
        assert_eq!(pending, vec![Priority::Low, Priority::Idle]);
        assert_eq!(scheduler.connection_status(CONN).active, 3);

        gate.add_permits(10);
        wait_until(|| scheduler.connection_status(CONN).completed == 5).await;
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let scheduler = scheduler();
        scheduler.set_concurrency(CONN, 1);
        let gate = Arc::new(Semaphore::new(0));
        occupy(&scheduler, &gate, 1).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [
            ("a", Priority::Low),
            ("b", Priority::Idle),
            ("c", Priority::Low),
            ("d", Priority::High),
        ] {
            let order = Arc::clone(&order);
            scheduler
                .enqueue(CONN, name, priority, move || async move {
                    order.lock().push(name);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let queued: Vec<String> = scheduler.pending(CONN).into_iter().map(|t| t.description).collect();
        assert_eq!(queued, vec!["d", "a", "c", "b"]);

        gate.add_permits(1);
        wait_until(|| order.lock().len() == 4).await;
        assert_eq!(*order.lock(), vec!["d", "a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_connection_drops_silently() {
        let scheduler = scheduler();
        scheduler.cancel_connection(CONN);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = scheduler
            .enqueue(CONN, "prefetch", Priority::Medium, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_ok());
        assert!(scheduler.pending(CONN).is_empty());

        let critical = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&critical);
        scheduler
            .enqueue(CONN, "open", Priority::Critical, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(critical.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));

        scheduler.reset_connection(CONN);
        let flag = Arc::clone(&ran);
        scheduler
            .enqueue(CONN, "prefetch", Priority::Medium, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| ran.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_cancel_all_keeps_running_tasks() {
        let scheduler = scheduler();
        let gate = Arc::new(Semaphore::new(0));
        occupy(&scheduler, &gate, 5).await;
        scheduler
            .enqueue(CONN, "waiting", Priority::High, || async { Ok(()) })
            .await
            .unwrap();
        scheduler.set_concurrency("other:22:u", 0);
        scheduler
            .enqueue("other:22:u", "waiting", Priority::Low, || async { Ok(()) })
            .await
            .unwrap();

        scheduler.cancel_all();
        assert_eq!(scheduler.status().queued, 0);
        assert_eq!(scheduler.status().active, 5);

        scheduler
            .enqueue("third:22:u", "late", Priority::High, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(scheduler.status().queued, 0);

        gate.add_permits(10);
        wait_until(|| scheduler.status().active == 0).await;
        assert_eq!(scheduler.connection_status(CONN).completed, 5);

        scheduler.reset();
        assert_eq!(scheduler.status().completed, 0);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_counted() {
        let scheduler = scheduler();
        let result = scheduler
            .enqueue(CONN, "doomed", Priority::Low, || async {
                Err(EngineError::sftp("remote went away"))
            })
            .await;
        assert!(result.is_ok());
        wait_until(|| scheduler.connection_status(CONN).completed == 1).await;
    }

    async fn explode() -> EngineResult<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_task_frees_its_slot() {
        let scheduler = scheduler();
        scheduler.set_concurrency(CONN, 1);
        scheduler
            .enqueue(CONN, "panics", Priority::High, explode)
            .await
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler
            .enqueue(CONN, "after", Priority::High, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| ran.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_critical_error_propagates() {
        let scheduler = scheduler();
        let err = scheduler
            .enqueue(CONN, "open", Priority::Critical, || async {
                Err(EngineError::not_found("/x"))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(scheduler.connection_status(CONN).total, 0);
    }

    #[tokio::test]
    async fn test_status_and_clear_connection() {
        let scheduler = scheduler();
        scheduler.set_concurrency(CONN, 0);
        let count = Arc::new(AtomicUsize::new(0));
        for priority in [Priority::High, Priority::Low, Priority::Low] {
            let count = Arc::clone(&count);
            scheduler
                .enqueue(CONN, "p", priority, move || async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let status = scheduler.connection_status(CONN);
        assert_eq!(status.queued, 3);
        assert_eq!(status.total, 3);
        assert_eq!(status.ceiling, 0);
        assert_eq!(status.by_priority[&Priority::Low], 2);
        assert_eq!(scheduler.status().by_priority[&Priority::High], 1);

        scheduler.clear_connection(CONN);
        assert_eq!(scheduler.status().queued, 0);

        // Ceiling survives the clear; raising it runs new work
        scheduler.set_concurrency(CONN, 5);
        let count2 = Arc::clone(&count);
        scheduler
            .enqueue(CONN, "fresh", Priority::Idle, move || async move {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| count.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_raising_ceiling_drains_waiting_work() {
        let scheduler = scheduler();
        scheduler.set_concurrency(CONN, 0);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler
            .enqueue(CONN, "held", Priority::Medium, move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(scheduler.pending(CONN).len(), 1);

        scheduler.set_concurrency(CONN, 3);
        wait_until(|| ran.load(Ordering::SeqCst)).await;
    }

    #[test]
    fn test_task_ids_are_unique_and_tagged() {
        let a = QueueTask::new(CONN, "a", Priority::Low, || async { Ok(()) });
        let b = QueueTask::new(CONN, "b", Priority::Low, || async { Ok(()) });
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("h:22:u-"));
        assert_eq!(a.connection_id(), CONN);
    }
}
