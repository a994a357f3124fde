//! DAG task execution.
//!
//! A task is a one-shot async body plus the bookkeeping around it:
//! upstream dependencies it waits on before taking a worker, an optional
//! parent whose cancellation it inherits, and a terminal outcome that never
//! changes once reached. Task bodies run on a bounded worker pool; any wait
//! inside a body (`TaskContext::await_value`, `TaskContext::join`) hands the
//! worker back to the pool for its duration.
//!
//! ```text
//!   submit / queue
//!        |
//!   [Pending] --deps ok--> predecessor started --> worker permit --> [Running]
//!        |                                                              |
//!        +--cancel--> [Cancelled]                body done, children joined
//!                                                                       |
//!                                           [Succeeded | Failed | Cancelled]
//! ```

mod context;
mod engine;

pub use context::TaskContext;
pub use engine::{QueueAttempt, TaskEngine};

use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;


/// Why a task did not succeed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Remote call or command failed; safe to resubmit
    #[error("{0}")]
    Failed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("dependency '{0}' did not succeed")]
    DependencyFailed(String),

    #[error("child task '{name}' failed: {cause}")]
    ChildFailed { name: String, cause: String },
}

impl TaskError {
    pub fn failed(message: impl fmt::Display) -> Self {
        TaskError::Failed(message.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded(Value),
    Failed(TaskError),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded(_) => "succeeded",
            TaskStatus::Failed(_) => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Result view of a terminal status, `None` while still in flight
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        match self {
            TaskStatus::Pending | TaskStatus::Running => None,
            TaskStatus::Succeeded(v) => Some(Ok(v.clone())),
            TaskStatus::Failed(e) => Some(Err(e.clone())),
            TaskStatus::Cancelled => Some(Err(TaskError::Cancelled)),
        }
    }

    fn from_result(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(v) => TaskStatus::Succeeded(v),
            Err(TaskError::Cancelled) => TaskStatus::Cancelled,
            Err(e) => TaskStatus::Failed(e),
        }
    }
}

type TaskBody = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<Value, TaskError>> + Send>;

/// Unit of work not yet handed to the engine
pub struct Task {
    name: String,
    entity: Option<EntityId>,
    dependencies: Vec<TaskHandle>,
    body: TaskBody,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            entity: None,
            dependencies: Vec::new(),
            body: Box::new(move |ctx| Box::pin(body(ctx))),
        }
    }

    /// Run "as" this entity
    pub fn entity(mut self, id: impl Into<EntityId>) -> Self {
        self.entity = Some(id.into());
        self
    }

    /// Stay pending until `upstream` succeeds
    pub fn depends_on(mut self, upstream: &TaskHandle) -> Self {
        self.dependencies.push(upstream.clone());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

pub(crate) struct TaskState {
    id: Uuid,
    name: String,
    entity: Option<EntityId>,
    parent: Option<Uuid>,
    submitted_at: DateTime<Utc>,
    status: watch::Sender<TaskStatus>,

    /// Flips once the task has left `Pending`; gates the next sibling
    started: watch::Sender<bool>,

    cancel: CancellationToken,
    children: Mutex<Vec<TaskHandle>>,
}

/// Shared handle to a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new(name: String, entity: Option<EntityId>, parent: Option<&TaskHandle>) -> Self {
        let cancel = match parent {
            Some(p) => p.inner.cancel.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            inner: Arc::new(TaskState {
                id: Uuid::now_v7(),
                name,
                entity,
                parent: parent.map(|p| p.id()),
                submitted_at: Utc::now(),
                status: watch::Sender::new(TaskStatus::Pending),
                started: watch::Sender::new(false),
                cancel,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn entity(&self) -> Option<&str> {
        self.inner.entity.as_deref()
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.inner.parent
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.status.borrow().is_terminal()
    }

    pub fn children(&self) -> Vec<TaskHandle> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel this task and everything queued under it.
    ///
    /// Pending tasks become `Cancelled` immediately. A running body only
    /// sees the signal and may still complete normally.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.inner.status.send_if_modified(|status| {
            if matches!(status, TaskStatus::Pending) {
                *status = TaskStatus::Cancelled;
                true
            } else {
                false
            }
        });
        self.inner.started.send_replace(true);

        for child in self.children() {
            child.cancel();
        }
    }

    /// Wait for the terminal outcome. Returns immediately once terminal.
    pub async fn join(&self) -> Result<Value, TaskError> {
        let mut rx = self.inner.status.subscribe();
        let outcome = match rx.wait_for(TaskStatus::is_terminal).await {
            Ok(status) => status.outcome(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(TaskError::Cancelled))
    }

    pub async fn join_timeout(&self, timeout: Duration) -> Result<Value, TaskError> {
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::Timeout(format!("task '{}'", self.name()))),
        }
    }

    pub fn summary(&self) -> TaskSummary {
        let status = self.status();
        TaskSummary {
            id: self.id(),
            name: self.inner.name.clone(),
            entity: self.inner.entity.clone(),
            parent: self.inner.parent,
            status: status.label(),
            error: match &status {
                TaskStatus::Failed(e) => Some(e.to_string()),
                _ => None,
            },
            submitted_at: self.inner.submitted_at,
            children: self.children().iter().map(TaskHandle::id).collect(),
        }
    }

    pub(crate) fn add_child(&self, child: TaskHandle) -> Option<TaskHandle> {
        let mut children = self.inner.children.lock().unwrap_or_else(PoisonError::into_inner);
        let predecessor = children.last().cloned();
        children.push(child);
        predecessor
    }

    /// Pending -> Running. False when the task was cancelled meanwhile.
    pub(crate) fn mark_running(&self) -> bool {
        let moved = self.inner.status.send_if_modified(|status| {
            if matches!(status, TaskStatus::Pending) {
                *status = TaskStatus::Running;
                true
            } else {
                false
            }
        });
        self.inner.started.send_replace(true);
        moved
    }

    /// Record the outcome unless one is already recorded
    pub(crate) fn finish(&self, result: Result<Value, TaskError>) -> bool {
        let next = TaskStatus::from_result(result);
        let changed = self.inner.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = next;
                true
            }
        });
        self.inner.started.send_replace(true);
        changed
    }

    pub(crate) async fn wait_started(&self) {
        let mut rx = self.inner.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.inner.status.borrow().label())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Read-only projection of a task for administrative front-ends
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub name: String,
    pub entity: Option<EntityId>,
    pub parent: Option<Uuid>,
    pub status: &'static str,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub children: Vec<Uuid>,
}
