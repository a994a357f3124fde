use super::{Task, TaskContext, TaskError, TaskHandle, TaskStatus};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_TASK: TaskHandle;
}

/// Result of [`TaskEngine::queue_if_possible`]
#[must_use = "an unqueued task does nothing until submitted"]
pub enum QueueAttempt {
    /// Attached as a child of the task running on this call stack
    Queued(TaskHandle),
    /// No task context; the caller decides what to do with it
    Unqueued { engine: TaskEngine, task: Task },
}

impl QueueAttempt {
    pub fn is_queued(&self) -> bool {
        matches!(self, QueueAttempt::Queued(_))
    }

    /// Submit as a top-level task when nothing was there to queue under
    pub fn or_submit_async(self) -> TaskHandle {
        match self {
            QueueAttempt::Queued(handle) => handle,
            QueueAttempt::Unqueued { engine, task } => engine.submit(task),
        }
    }
}

struct EngineInner {
    workers: Arc<Semaphore>,
    worker_count: usize,
    tasks: DashMap<Uuid, TaskHandle>,
    submitted: AtomicU64,
}

/// Bounded worker pool running task bodies.
///
/// Cheap to clone; clones share the pool and the task registry.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            inner: Arc::new(EngineInner {
                workers: Arc::new(Semaphore::new(worker_count)),
                worker_count,
                tasks: DashMap::new(),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `task` as a top-level task
    pub fn submit(&self, task: Task) -> TaskHandle {
        self.spawn(task, None)
    }

    /// Queue under the task executing on this call stack, if any
    pub fn queue_if_possible(&self, task: Task) -> QueueAttempt {
        match Self::current_task() {
            Some(parent) => QueueAttempt::Queued(self.spawn(task, Some(&parent))),
            None => QueueAttempt::Unqueued {
                engine: self.clone(),
                task,
            },
        }
    }

    /// Task whose body is running on this call stack
    pub fn current_task() -> Option<TaskHandle> {
        CURRENT_TASK.try_with(TaskHandle::clone).ok()
    }

    pub fn get(&self, id: Uuid) -> Option<TaskHandle> {
        self.inner.tasks.get(&id).map(|h| h.value().clone())
    }

    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.inner.tasks.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop terminal tasks from the registry. Returns how many were removed.
    pub fn prune_completed(&self) -> usize {
        let before = self.inner.tasks.len();
        self.inner.tasks.retain(|_, handle| !handle.is_done());
        before.saturating_sub(self.inner.tasks.len())
    }

    pub fn submitted_count(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Workers not currently running a body
    pub fn idle_workers(&self) -> usize {
        self.inner.workers.available_permits()
    }

    pub(crate) fn workers(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.workers)
    }

    pub(crate) fn spawn(&self, task: Task, parent: Option<&TaskHandle>) -> TaskHandle {
        let Task {
            name,
            entity,
            dependencies,
            body,
        } = task;

        let handle = TaskHandle::new(name, entity, parent);
        let predecessor = parent.and_then(|p| p.add_child(handle.clone()));

        self.inner.tasks.insert(handle.id(), handle.clone());
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        debug!(
            task_id = %handle.id(),
            task = %handle.name(),
            parent = ?handle.parent_id(),
            dependencies = dependencies.len(),
            "Task submitted"
        );

        // Cancelled parent: never start
        if parent.is_some_and(TaskHandle::is_cancelled) {
            handle.cancel();
        }

        let engine = self.clone();
        let driven = handle.clone();
        tokio::spawn(async move {
            engine.drive(driven, dependencies, predecessor, body).await;
        });

        handle
    }

    async fn drive(
        self,
        handle: TaskHandle,
        dependencies: Vec<TaskHandle>,
        predecessor: Option<TaskHandle>,
        body: super::TaskBody,
    ) {
        let token = handle.token().clone();

        for upstream in &dependencies {
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    handle.finish(Err(TaskError::Cancelled));
                    return;
                }
                outcome = upstream.join() => outcome,
            };
            if outcome.is_err() {
                self.conclude(
                    &handle,
                    Err(TaskError::DependencyFailed(upstream.name().to_string())),
                );
                return;
            }
        }

        if let Some(previous) = predecessor {
            tokio::select! {
                _ = token.cancelled() => {
                    handle.finish(Err(TaskError::Cancelled));
                    return;
                }
                _ = previous.wait_started() => {}
            }
        }

        let permit = tokio::select! {
            _ = token.cancelled() => {
                handle.finish(Err(TaskError::Cancelled));
                return;
            }
            permit = self.workers().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            self.conclude(&handle, Err(TaskError::failed("worker pool closed")));
            return;
        };

        if !handle.mark_running() {
            return;
        }

        let worker: Arc<Mutex<Option<OwnedSemaphorePermit>>> = Arc::new(Mutex::new(Some(permit)));
        let ctx = TaskContext::new(self.clone(), handle.clone(), Arc::clone(&worker));

        let run = AssertUnwindSafe(body(ctx)).catch_unwind();
        let result = match CURRENT_TASK.scope(handle.clone(), run).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::failed("task body panicked")),
        };

        // Release the worker before waiting on children
        drop(worker.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take());

        let result = match result {
            Ok(value) => self.join_children(&handle).await.map(|_| value),
            Err(e) => {
                for child in handle.children() {
                    child.cancel();
                }
                Err(e)
            }
        };

        self.conclude(&handle, result);
    }

    async fn join_children(&self, handle: &TaskHandle) -> Result<(), TaskError> {
        let mut failure = None;
        for child in handle.children() {
            match child.join().await {
                Ok(_) => {}
                Err(TaskError::Cancelled) if handle.is_cancelled() => {}
                Err(e) => {
                    failure.get_or_insert(TaskError::ChildFailed {
                        name: child.name().to_string(),
                        cause: e.to_string(),
                    });
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn conclude(&self, handle: &TaskHandle, result: Result<Value, TaskError>) {
        if !handle.finish(result) {
            return;
        }
        match handle.status() {
            TaskStatus::Succeeded(_) => {
                debug!(task_id = %handle.id(), task = %handle.name(), "Task succeeded");
            }
            TaskStatus::Cancelled => {
                info!(task_id = %handle.id(), task = %handle.name(), "Task cancelled");
            }
            TaskStatus::Failed(e) => {
                warn!(
                    task_id = %handle.id(),
                    task = %handle.name(),
                    entity = ?handle.entity(),
                    error = %e,
                    "Task failed"
                );
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new(8)
    }
}
