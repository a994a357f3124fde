use super::{EntityError, EntityId, Lifecycle, GROUP_SIZE, LIFECYCLE, MEMBER_ADDED, MEMBER_REMOVED};
use crate::attribute::AttributeStore;
use crate::bus::{EventBus, Scope, SubscriptionId};
use crate::config::{ConfigBag, ConfigKey, ConfigValue, ValidationError};
use crate::policy::{Policy, PolicyError};
use crate::sensor::{Sensor, SensorEvent};
use crate::task::{Task, TaskEngine, TaskHandle};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Named operation exposed by an entity. Builds the task for one invocation.
pub type Effector = Arc<dyn Fn(&Entity, Value) -> Task + Send + Sync>;

struct EntityInner {
    id: EntityId,
    display_name: String,
    parent: Option<EntityId>,
    created_at: DateTime<Utc>,

    /// Bound configuration; writable only while initializing
    config: RwLock<ConfigBag>,

    /// Arbitrary attachments, unique by equality
    tags: RwLock<Vec<Value>>,

    attributes: AttributeStore,
    lifecycle: RwLock<Lifecycle>,

    /// Owned children, destroyed with this entity
    children: RwLock<Vec<EntityId>>,

    policies: Mutex<Vec<Arc<Policy>>>,
    effectors: DashMap<String, Effector>,

    bus: Arc<EventBus>,
    tasks: TaskEngine,
}

/// Shared handle to a managed entity
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn new(
        display_name: String,
        parent: Option<EntityId>,
        config: ConfigBag,
        tags: Vec<Value>,
        bus: Arc<EventBus>,
        tasks: TaskEngine,
    ) -> Self {
        let id = Uuid::now_v7().to_string();
        Self {
            inner: Arc::new(EntityInner {
                attributes: AttributeStore::new(id.clone()),
                id,
                display_name,
                parent,
                created_at: Utc::now(),
                config: RwLock::new(config),
                tags: RwLock::new(tags),
                lifecycle: RwLock::new(Lifecycle::Created),
                children: RwLock::new(Vec::new()),
                policies: Mutex::new(Vec::new()),
                effectors: DashMap::new(),
                bus,
                tasks,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.inner.tasks
    }

    pub(crate) fn set_lifecycle(&self, next: Lifecycle) {
        let previous = {
            let mut state = self.inner.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, next)
        };
        debug!(entity_id = %self.id(), from = ?previous, to = ?next, "Lifecycle transition");
        self.set_attribute(&LIFECYCLE, next);
    }

    // --- configuration ---

    pub fn config<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.inner.config.read().unwrap_or_else(PoisonError::into_inner).get(key)
    }

    pub fn config_value(&self, name: &str) -> Option<ConfigValue> {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .raw(name)
            .cloned()
    }

    /// Store a derived configuration value. Only allowed during init.
    pub fn seed_config(
        &self,
        name: &str,
        value: impl Into<ConfigValue>,
    ) -> Result<(), ValidationError> {
        if !matches!(self.lifecycle(), Lifecycle::Created | Lifecycle::Initializing) {
            return Err(ValidationError::Immutable {
                entity: self.id().to_string(),
            });
        }
        self.inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .seed(name, value.into());
        Ok(())
    }

    pub fn config_json(&self) -> Map<String, Value> {
        self.inner.config.read().unwrap_or_else(PoisonError::into_inner).to_json()
    }

    // --- tags ---

    pub fn tags(&self) -> Vec<Value> {
        self.inner.tags.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns false when an equal tag is already present
    pub fn add_tag(&self, tag: impl Into<Value>) -> Result<bool, ValidationError> {
        let tag = tag.into();
        if tag.is_null() {
            return Err(ValidationError::NullTag);
        }
        let mut tags = self.inner.tags.write().unwrap_or_else(PoisonError::into_inner);
        if tags.contains(&tag) {
            return Ok(false);
        }
        tags.push(tag);
        Ok(true)
    }

    pub fn remove_tag(&self, tag: &Value) -> bool {
        let mut tags = self.inner.tags.write().unwrap_or_else(PoisonError::into_inner);
        let before = tags.len();
        tags.retain(|t| t != tag);
        tags.len() != before
    }

    pub fn has_tag(&self, tag: &Value) -> bool {
        self.inner
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tag)
    }

    // --- attributes ---

    /// Current value, `None` when unset
    pub fn get_attribute<T: DeserializeOwned>(&self, sensor: &Sensor<T>) -> Option<T> {
        self.inner.attributes.get(sensor.name()).and_then(|v| sensor.decode(&v))
    }

    /// Raw stored value; `null` reads as unset
    pub fn attribute_value(&self, sensor: &str) -> Option<Value> {
        self.inner.attributes.get(sensor).filter(|v| !v.is_null())
    }

    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.inner.attributes.snapshot()
    }

    /// Store and publish. Every call emits one event, equal values included.
    pub fn set_attribute<T: Serialize>(&self, sensor: &Sensor<T>, value: T) -> SensorEvent {
        let encoded = sensor.encode(&value).unwrap_or_else(|e| {
            warn!(
                entity_id = %self.id(),
                sensor = %sensor.name(),
                error = %e,
                "Sensor value not encodable, storing unset"
            );
            Value::Null
        });
        self.set_attribute_value(sensor.name(), encoded)
    }

    pub fn set_attribute_value(&self, sensor: &str, value: Value) -> SensorEvent {
        let bus = &self.inner.bus;
        self.inner.attributes.set(sensor, value, |event| {
            bus.publish(event);
        })
    }

    /// Reset to unset
    pub fn clear_attribute<T>(&self, sensor: &Sensor<T>) -> SensorEvent {
        self.set_attribute_value(sensor.name(), Value::Null)
    }

    /// Compare-and-set through the entity's write serialization point
    pub fn update_attribute(
        &self,
        sensor: &str,
        decide: impl FnOnce(Option<&Value>) -> Option<Value>,
    ) -> Option<SensorEvent> {
        let bus = &self.inner.bus;
        self.inner.attributes.update(sensor, decide, |event| {
            bus.publish(event);
        })
    }

    /// Claim a guard marker. True only for the caller that flipped it.
    pub fn claim_marker(&self, marker: &Sensor<bool>) -> bool {
        self.update_attribute(marker.name(), |current| match current {
            Some(Value::Bool(true)) => None,
            _ => Some(Value::Bool(true)),
        })
        .is_some()
    }

    /// Release a claimed marker so the guarded operation may run again
    pub fn release_marker(&self, marker: &Sensor<bool>) {
        self.set_attribute(marker, false);
    }

    /// Resolves with the sensor's value once it is set; `None` if the entity
    /// is torn down first. The continuation lives on the bus, not on a thread.
    pub fn attribute_when_ready(
        &self,
        sensor: &str,
    ) -> impl Future<Output = Option<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let listener_slot = Arc::clone(&slot);
        let scope = Scope::Entity(self.id().to_string());
        let id = self.inner.bus.subscribe(None, scope, sensor, move |event| {
            if !event.value.is_null() {
                let pending = listener_slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = pending {
                    let _ = tx.send(event.value.clone());
                }
            }
            Ok(())
        });

        // A set between the caller's check and the subscription is already stored
        if let Some(value) = self.attribute_value(sensor) {
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(value);
            }
        }

        let guard = SubscriptionGuard {
            bus: Arc::clone(&self.inner.bus),
            id,
        };
        async move {
            let _guard = guard;
            rx.await.ok()
        }
    }

    // --- subscriptions ---

    /// Listen to `sensor` on `target`. Released when this entity is destroyed.
    pub fn subscribe<F>(&self, target: &Entity, sensor: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .bus
            .subscribe(Some(self.id()), Scope::Entity(target.id().to_string()), sensor, listener)
    }

    /// Listen to `sensor` on current and future members of this entity
    pub fn subscribe_to_members<F>(&self, sensor: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .bus
            .subscribe(Some(self.id()), Scope::Members(self.id().to_string()), sensor, listener)
    }

    // --- membership ---

    pub fn members(&self) -> Vec<EntityId> {
        self.inner.bus.membership().members(self.id())
    }

    pub fn has_member(&self, member: &Entity) -> bool {
        self.inner.bus.membership().is_member(self.id(), member.id())
    }

    /// Track `member` without owning it. Returns false if already a member.
    pub fn add_member(&self, member: &Entity) -> bool {
        match self.inner.bus.membership().add(self.id(), member.id()) {
            Some(size) => {
                info!(group = %self.id(), member = %member.id(), size, "Member added");
                self.set_attribute(&MEMBER_ADDED, member.id().to_string());
                self.set_attribute(&GROUP_SIZE, size);
                true
            }
            None => false,
        }
    }

    pub fn remove_member(&self, member: &Entity) -> bool {
        self.remove_member_id(member.id())
    }

    pub(crate) fn remove_member_id(&self, member: &str) -> bool {
        match self.inner.bus.membership().remove(self.id(), member) {
            Some(size) => {
                self.member_left(member, size);
                true
            }
            None => false,
        }
    }

    pub(crate) fn member_left(&self, member: &str, size: usize) {
        info!(group = %self.id(), member = %member, size, "Member removed");
        self.set_attribute(&MEMBER_REMOVED, member.to_string());
        self.set_attribute(&GROUP_SIZE, size);
    }

    // --- ownership ---

    pub fn children(&self) -> Vec<EntityId> {
        self.inner.children.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn add_child(&self, child: &str) {
        self.inner
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child.to_string());
    }

    pub(crate) fn remove_child(&self, child: &str) {
        self.inner
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| c != child);
    }

    // --- policies ---

    pub fn add_policy(&self, policy: Arc<Policy>) -> Result<(), EntityError> {
        if matches!(self.lifecycle(), Lifecycle::Stopping | Lifecycle::Destroyed) {
            return Err(EntityError::NotRunning {
                entity: self.id().to_string(),
                state: self.lifecycle(),
            });
        }
        policy.attach(self.id(), Arc::clone(&self.inner.bus), self.inner.tasks.clone())?;
        self.inner
            .policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(policy);
        Ok(())
    }

    pub fn policies(&self) -> Vec<Arc<Policy>> {
        self.inner
            .policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Detach and destroy `policy`
    pub fn remove_policy(&self, policy: &Arc<Policy>) -> Result<(), PolicyError> {
        let mut policies = self.inner.policies.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(position) = policies.iter().position(|p| Arc::ptr_eq(p, policy)) else {
            return Err(PolicyError::NotAttached);
        };
        let removed = policies.remove(position);
        drop(policies);
        removed.destroy();
        Ok(())
    }

    pub(crate) fn take_policies(&self) -> Vec<Arc<Policy>> {
        std::mem::take(&mut *self.inner.policies.lock().unwrap_or_else(PoisonError::into_inner))
    }

    // --- effectors and tasks ---

    pub(crate) fn register_effector(&self, name: String, effector: Effector) {
        self.inner.effectors.insert(name, effector);
    }

    pub fn effector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.effectors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Invoke a named effector. Always asynchronous: the result is a handle.
    pub fn invoke(&self, effector: &str, args: Value) -> Result<TaskHandle, EntityError> {
        if !self.is_running() {
            return Err(EntityError::NotRunning {
                entity: self.id().to_string(),
                state: self.lifecycle(),
            });
        }
        let build = self
            .inner
            .effectors
            .get(effector)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EntityError::UnknownEffector {
                entity: self.id().to_string(),
                effector: effector.to_string(),
            })?;

        info!(entity_id = %self.id(), effector = %effector, "Invoking effector");
        Ok(self.submit(build(self, args)))
    }

    /// Run `task` as this entity, under the current task when there is one
    pub fn submit(&self, task: Task) -> TaskHandle {
        self.inner
            .tasks
            .queue_if_possible(task.entity(self.id()))
            .or_submit_async()
    }

    // --- projection ---

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            id: self.id().to_string(),
            display_name: self.display_name().to_string(),
            parent: self.inner.parent.clone(),
            lifecycle: self.lifecycle(),
            tags: self.tags(),
            config: self.config_json(),
            attributes: self.attributes(),
            members: self.members(),
            children: self.children(),
            effectors: self.effector_names(),
            policies: self.policies().iter().map(|p| p.name().to_string()).collect(),
            created_at: self.inner.created_at,
            last_updated: self.inner.attributes.last_updated(),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("display_name", &self.inner.display_name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Read-only projection of an entity
#[derive(Debug, Clone, Serialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub display_name: String,
    pub parent: Option<EntityId>,
    pub lifecycle: Lifecycle,
    pub tags: Vec<Value>,
    pub config: Map<String, Value>,
    pub attributes: BTreeMap<String, Value>,
    pub members: Vec<EntityId>,
    pub children: Vec<EntityId>,
    pub effectors: Vec<String>,
    pub policies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

struct SubscriptionGuard {
    bus: Arc<EventBus>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
