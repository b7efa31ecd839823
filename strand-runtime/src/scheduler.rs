//! Per-service scheduler
//!
//! Each service owns one dedicated thread driving a current-thread Tokio
//! runtime. Everything the service executes — autorun callbacks, event
//! handlers, and background tasks — goes through this one queue, so a
//! slow or faulting service can never stall dispatch or another service.
//! There is no other way for service code to spawn work, which removes
//! the wrong-scheduler class of bugs entirely.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use strand_core::CallbackExecutor;
use strand_types::{ServiceId, TaskId};

/// Terminal and running states of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
    Faulted,
}

/// Public view of one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
}

/// Status registry for a service's scheduled tasks
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: DashMap<TaskId, TaskInfo>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: TaskId, name: String) {
        self.tasks.insert(
            id,
            TaskInfo {
                id,
                name,
                status: TaskStatus::Running,
            },
        );
    }

    pub fn set_status(&self, id: TaskId, status: TaskStatus) {
        if let Some(mut info) = self.tasks.get_mut(&id) {
            info.status = status;
        }
    }

    /// Tasks still running when the scheduler gave up draining are marked
    /// cancelled; their futures were aborted
    pub fn mark_unfinished_cancelled(&self) {
        for mut entry in self.tasks.iter_mut() {
            if entry.status == TaskStatus::Running {
                entry.status = TaskStatus::Cancelled;
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|e| e.status == TaskStatus::Running)
            .count()
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

/// Work item on a service's queue
pub(crate) enum Job {
    /// Autorun callback or event handler
    Run(Box<dyn FnOnce() + Send>),
    /// Background task, already wrapped for fault and status capture
    Task {
        id: TaskId,
        future: Pin<Box<dyn Future<Output = ()> + Send>>,
    },
    /// Break the loop and drain
    Shutdown,
}

/// Cloneable submission side of a service's queue
///
/// Implements [`CallbackExecutor`] so the store can post autorun callbacks
/// and event handlers into the owner's context.
#[derive(Clone)]
pub struct SchedulerHandle {
    service: ServiceId,
    tx: mpsc::UnboundedSender<Job>,
    open: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub(crate) fn new(service: ServiceId, tx: mpsc::UnboundedSender<Job>) -> Self {
        Self {
            service,
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub(crate) fn submit(&self, job: Job) -> bool {
        self.open.load(Ordering::Acquire) && self.tx.send(job).is_ok()
    }

    /// Reject further submissions and ask the loop to drain
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.tx.send(Job::Shutdown);
    }
}

impl CallbackExecutor for SchedulerHandle {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) -> bool {
        self.submit(Job::Run(job))
    }
}

/// Drive a service's queue until shutdown, then drain its tasks
///
/// Runs inside the service thread's current-thread runtime. On shutdown,
/// tasks get `stop_timeout` to observe their cancel tokens and finish;
/// stragglers are aborted and marked cancelled.
pub(crate) async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    stop_timeout: Duration,
    tasks: Arc<TaskRegistry>,
) {
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                None | Some(Job::Shutdown) => break,
                Some(Job::Run(f)) => {
                    // Queued callbacks are already guarded by the store;
                    // this keeps a stray panic from killing the thread
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                        tracing::warn!(
                            "queued callback panicked: {}",
                            strand_core::error::panic_message(payload)
                        );
                    }
                }
                Some(Job::Task { id, future }) => {
                    tracing::trace!(task = %id, "task started");
                    running.spawn(future);
                }
            },
            Some(_result) = running.join_next(), if !running.is_empty() => {}
        }
    }

    let drain = async {
        while running.join_next().await.is_some() {}
    };
    if tokio::time::timeout(stop_timeout, drain).await.is_err() {
        tracing::warn!("tasks did not drain within {stop_timeout:?}; aborting the rest");
        running.abort_all();
        while running.join_next().await.is_some() {}
    }
    tasks.mark_unfinished_cancelled();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_registry_statuses() {
        let registry = TaskRegistry::new();
        let id = TaskId::next();

        registry.insert(id, "worker".to_string());
        assert_eq!(registry.running_count(), 1);

        registry.set_status(id, TaskStatus::Completed);
        assert_eq!(registry.running_count(), 0);
        assert_eq!(registry.snapshot()[0].status, TaskStatus::Completed);
    }

    #[test]
    fn test_mark_unfinished_cancelled() {
        let registry = TaskRegistry::new();
        let done = TaskId::next();
        let stuck = TaskId::next();

        registry.insert(done, "done".to_string());
        registry.insert(stuck, "stuck".to_string());
        registry.set_status(done, TaskStatus::Completed);

        registry.mark_unfinished_cancelled();

        let statuses: Vec<TaskStatus> =
            registry.snapshot().into_iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Completed, TaskStatus::Cancelled]);
    }

    #[tokio::test]
    async fn test_run_loop_executes_jobs_then_drains() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle::new(ServiceId::new("svc"), tx);
        let tasks = Arc::new(TaskRegistry::new());

        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_job = Arc::clone(&ran);
        assert!(handle.execute(Box::new(move || {
            ran_in_job.store(true, Ordering::SeqCst);
        })));

        handle.close();
        run_loop(rx, Duration::from_millis(100), Arc::clone(&tasks)).await;

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_jobs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle::new(ServiceId::new("svc"), tx);
        handle.close();
        assert!(!handle.execute(Box::new(|| {})));
    }
}
