//! Suspendable reactive controllers attached to one entity.
//!
//! A policy reacts to bus events and schedules tasks as its entity. While
//! suspended its listeners still receive events but nothing they try to
//! submit is scheduled. Destruction suspends first, then releases every
//! subscription, and happens at most once.

use crate::bus::{EventBus, Scope, SubscriptionId};
use crate::config::{ConfigBag, ConfigKey, ConfigValue, Flags, KeyDecl, ValidationError};
use crate::entity::EntityId;
use crate::sensor::SensorEvent;
use crate::task::{Task, TaskEngine, TaskHandle};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;


pub const NAME: ConfigKey<String> = ConfigKey::new("name", "Name of the policy");
pub const ID: ConfigKey<String> = ConfigKey::new("id", "Identity of the policy");

/// Legacy alias for [`NAME`]
const DISPLAY_NAME_ALIAS: &str = "displayName";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("policy is not attached to an entity")]
    NotAttached,

    #[error("policy is already attached to '{0}'")]
    AlreadyAttached(EntityId),

    #[error("policy '{0}' is destroyed")]
    Destroyed(String),
}

struct Attachment {
    entity: EntityId,
    bus: Arc<EventBus>,
    tasks: TaskEngine,
}

pub struct Policy {
    id: String,
    name: String,
    config: ConfigBag,
    suspended: AtomicBool,
    destroyed: AtomicBool,
    attachment: RwLock<Option<Attachment>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    submitted: AtomicU64,
}

impl Policy {
    pub fn new(flags: Flags) -> Result<Arc<Self>, ValidationError> {
        Self::with_keys(flags, &[])
    }

    /// Bind `flags` against the base keys plus `keys`; the rest stays in the
    /// leftover bag for the concrete policy to interpret.
    pub fn with_keys(flags: Flags, keys: &[KeyDecl]) -> Result<Arc<Self>, ValidationError> {
        let mut declared = vec![NAME.decl(), ID.decl()];
        declared.extend_from_slice(keys);
        let mut config = ConfigBag::configure(&declared, flags)?;

        let name = match config.get(&NAME) {
            Some(name) => name,
            None => match config.take_leftover(DISPLAY_NAME_ALIAS) {
                Some(ConfigValue::Immediate(Value::String(alias))) => {
                    config.seed(NAME.name(), ConfigValue::from(alias.clone()));
                    alias
                }
                None | Some(ConfigValue::Immediate(Value::Null)) => "Policy".to_string(),
                Some(_) => {
                    return Err(ValidationError::InvalidType {
                        key: DISPLAY_NAME_ALIAS.to_string(),
                        expected: "string".to_string(),
                    })
                }
            },
        };
        let id = config.get(&ID).unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Arc::new(Self {
            id,
            name,
            config,
            suspended: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            attachment: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            submitted: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.config.get(key)
    }

    /// Raw value of a declared or leftover key
    pub fn config_value(&self, name: &str) -> Option<&ConfigValue> {
        self.config.raw(name)
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.entity.clone())
    }

    pub(crate) fn attach(
        &self,
        entity: &str,
        bus: Arc<EventBus>,
        tasks: TaskEngine,
    ) -> Result<(), PolicyError> {
        if self.is_destroyed() {
            return Err(PolicyError::Destroyed(self.name.clone()));
        }
        let mut attachment = self.attachment.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = attachment.as_ref() {
            return Err(PolicyError::AlreadyAttached(existing.entity.clone()));
        }
        *attachment = Some(Attachment {
            entity: entity.to_string(),
            bus,
            tasks,
        });
        info!(policy = %self.name, policy_id = %self.id, entity_id = %entity, "Policy attached");
        Ok(())
    }

    /// Subscribe on behalf of this policy. The listener is skipped while the
    /// policy is not running.
    pub fn subscribe<F>(
        self: &Arc<Self>,
        scope: Scope,
        sensor: &str,
        listener: F,
    ) -> Result<SubscriptionId, PolicyError>
    where
        F: Fn(&Policy, &SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Err(PolicyError::Destroyed(self.name.clone()));
        }
        let bus = self.bus()?;

        let policy: Weak<Policy> = Arc::downgrade(self);
        let id = bus.subscribe(Some(self.id.as_str()), scope, sensor, move |event| {
            let Some(policy) = policy.upgrade() else {
                return Ok(());
            };
            if !policy.is_running() {
                debug!(
                    policy = %policy.name,
                    sensor = %event.sensor,
                    "Policy not running, event ignored"
                );
                return Ok(());
            }
            listener(&*policy, event)
        });

        // Recheck under the lock: destroy() marks first, then drains
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_destroyed() {
            drop(subscriptions);
            bus.unsubscribe(id);
            return Err(PolicyError::Destroyed(self.name.clone()));
        }
        subscriptions.push(id);
        Ok(id)
    }

    /// Subscribe to `sensor` on the entity this policy is attached to
    pub fn subscribe_to_entity<F>(
        self: &Arc<Self>,
        sensor: &str,
        listener: F,
    ) -> Result<SubscriptionId, PolicyError>
    where
        F: Fn(&Policy, &SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entity = self.entity_id().ok_or(PolicyError::NotAttached)?;
        self.subscribe(Scope::Entity(entity), sensor, listener)
    }

    /// Subscribe to `sensor` on current and future members of the attached entity
    pub fn subscribe_to_members<F>(
        self: &Arc<Self>,
        sensor: &str,
        listener: F,
    ) -> Result<SubscriptionId, PolicyError>
    where
        F: Fn(&Policy, &SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entity = self.entity_id().ok_or(PolicyError::NotAttached)?;
        self.subscribe(Scope::Members(entity), sensor, listener)
    }

    /// Schedule `task` as the attached entity. `None` when the policy is
    /// suspended, destroyed or detached.
    pub fn submit(&self, task: Task) -> Option<TaskHandle> {
        if !self.is_running() {
            return None;
        }
        let attachment = self.attachment.read().unwrap_or_else(PoisonError::into_inner);
        let attachment = attachment.as_ref()?;
        let handle = attachment
            .tasks
            .queue_if_possible(task.entity(attachment.entity.clone()))
            .or_submit_async();
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Some(handle)
    }

    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::AcqRel) {
            debug!(policy = %self.name, "Policy suspended");
        }
    }

    /// No effect once destroyed
    pub fn resume(&self) {
        if self.is_destroyed() {
            return;
        }
        if self.suspended.swap(false, Ordering::AcqRel) {
            debug!(policy = %self.name, "Policy resumed");
        }
    }

    pub fn destroy(&self) {
        self.suspend();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        let released = match self.bus() {
            Ok(bus) => subscriptions.into_iter().filter(|id| bus.unsubscribe(*id)).count(),
            Err(_) => 0,
        };
        info!(policy = %self.name, policy_id = %self.id, released, "Policy destroyed");
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.is_suspended() && !self.is_destroyed()
    }

    /// Tasks scheduled through [`Policy::submit`]
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn bus(&self) -> Result<Arc<EventBus>, PolicyError> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| Arc::clone(&a.bus))
            .ok_or(PolicyError::NotAttached)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("suspended", &self.is_suspended())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
