use super::{Task, TaskEngine, TaskError, TaskHandle};
use crate::config::{ConfigValue, Deferred};
use crate::entity::Entity;
use crate::sensor::Sensor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Handle a task body receives to interact with the engine.
///
/// Every wait offered here releases the body's worker for its duration and
/// returns `TaskError::Cancelled` as soon as the task is cancelled.
#[derive(Clone)]
pub struct TaskContext {
    engine: TaskEngine,
    handle: TaskHandle,
    worker: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl TaskContext {
    pub(crate) fn new(
        engine: TaskEngine,
        handle: TaskHandle,
        worker: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
    ) -> Self {
        Self { engine, handle, worker }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Resolves once this task is cancelled
    pub async fn cancelled(&self) {
        self.handle.token().cancelled().await
    }

    /// Queue `task` as a child of this one
    pub fn queue(&self, task: Task) -> TaskHandle {
        self.engine.spawn(task, Some(&self.handle))
    }

    /// Await `fut` without holding a worker
    pub async fn suspend<F: Future>(&self, fut: F) -> Result<F::Output, TaskError> {
        let released = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();

        let output = tokio::select! {
            _ = self.handle.token().cancelled() => None,
            output = fut => Some(output),
        };

        if released {
            let permit = self
                .engine
                .workers()
                .acquire_owned()
                .await
                .map_err(|_| TaskError::failed("worker pool closed"))?;
            *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
        }

        output.ok_or(TaskError::Cancelled)
    }

    /// Wait for another task's outcome
    pub async fn join(&self, other: &TaskHandle) -> Result<Value, TaskError> {
        self.suspend(other.join()).await?
    }

    /// Wait until `sensor` on `entity` holds a value.
    ///
    /// Returns at once when the value is already set. `timeout` of `None`
    /// waits for as long as the entity lives.
    pub async fn await_value<T: DeserializeOwned>(
        &self,
        entity: &Entity,
        sensor: &Sensor<T>,
        timeout: Option<Duration>,
    ) -> Result<T, TaskError> {
        let value = self.await_attribute(entity, sensor.name(), timeout).await?;
        sensor.decode(&value).ok_or_else(|| {
            TaskError::Failed(format!(
                "sensor '{}' on {} does not hold a {}",
                sensor.name(),
                entity.id(),
                sensor.type_name()
            ))
        })
    }

    /// Untyped form of [`TaskContext::await_value`]
    pub async fn await_attribute(
        &self,
        entity: &Entity,
        sensor: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, TaskError> {
        if let Some(value) = entity.attribute_value(sensor) {
            return Ok(value);
        }

        debug!(
            task_id = %self.handle.id(),
            entity_id = %entity.id(),
            sensor = %sensor,
            timeout = ?timeout,
            "Awaiting sensor value"
        );

        let ready = entity.attribute_when_ready(sensor);
        let waited = match timeout {
            Some(limit) => match self.suspend(tokio::time::timeout(limit, ready)).await? {
                Ok(value) => value,
                Err(_) => return Err(TaskError::Timeout(format!("{}/{}", entity.id(), sensor))),
            },
            None => self.suspend(ready).await?,
        };

        waited.ok_or_else(|| {
            TaskError::Failed(format!(
                "entity {} was destroyed while awaiting '{}'",
                entity.id(),
                sensor
            ))
        })
    }

    /// Resolve a configuration value, waiting on deferred ones
    pub async fn resolve(&self, value: &ConfigValue) -> Result<Value, TaskError> {
        match value {
            ConfigValue::Immediate(v) => Ok(v.clone()),
            ConfigValue::Deferred(Deferred::Supplier(supplier)) => Ok(supplier.supply()),
            ConfigValue::Deferred(Deferred::WhenReady { entity, sensor }) => {
                self.await_attribute(entity, sensor, None).await
            }
        }
    }
}
