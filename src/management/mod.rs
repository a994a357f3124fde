//! Registry of live entities and the entry point for creating, invoking and
//! destroying them. Owns the shared event bus and task engine.

use crate::bus::EventBus;
use crate::config::{ConfigBag, TopoConfig, ValidationError};
use crate::entity::{Entity, EntityError, EntityId, EntitySnapshot, EntitySpec, Lifecycle};
use crate::task::{TaskEngine, TaskHandle};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};


pub struct ManagementContext {
    config: TopoConfig,
    bus: Arc<EventBus>,
    tasks: TaskEngine,

    /// Running entities only; half-initialized ones are never registered
    entities: DashMap<EntityId, Entity>,
}

impl ManagementContext {
    pub fn new(config: TopoConfig) -> Self {
        info!(
            worker_count = config.tasks.worker_count,
            listener_concurrency = config.bus.listener_concurrency,
            "Management context created"
        );
        Self {
            bus: Arc::new(EventBus::new(config.bus.listener_concurrency)),
            tasks: TaskEngine::new(config.tasks.worker_count),
            entities: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TopoConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    /// Configure, initialize and register a new entity.
    ///
    /// Validation and init failures leave nothing registered, no membership
    /// and no subscriptions behind.
    pub fn create_entity(&self, spec: EntitySpec) -> Result<Entity, EntityError> {
        let EntitySpec {
            display_name,
            parent,
            flags,
            keys,
            tags,
            init,
            effectors,
        } = spec;

        let parent_entity = match &parent {
            Some(id) => {
                let p = self.entity(id).ok_or_else(|| EntityError::NotFound(id.clone()))?;
                if !p.is_running() {
                    return Err(EntityError::NotRunning {
                        entity: id.clone(),
                        state: p.lifecycle(),
                    });
                }
                Some(p)
            }
            None => None,
        };

        let bag = ConfigBag::configure(&keys, flags)?;

        let mut unique_tags: Vec<Value> = Vec::with_capacity(tags.len());
        for tag in tags {
            if tag.is_null() {
                return Err(ValidationError::NullTag.into());
            }
            if !unique_tags.contains(&tag) {
                unique_tags.push(tag);
            }
        }

        let entity = Entity::new(
            display_name,
            parent,
            bag,
            unique_tags,
            Arc::clone(&self.bus),
            self.tasks.clone(),
        );

        entity.set_lifecycle(Lifecycle::Initializing);
        for (name, effector) in effectors {
            entity.register_effector(name, effector);
        }

        for hook in &init {
            if let Err(e) = hook(&entity) {
                warn!(
                    entity_id = %entity.id(),
                    name = %entity.display_name(),
                    error = %format!("{:#}", e),
                    "Entity init failed, discarding"
                );
                self.release(&entity);
                return Err(EntityError::Init {
                    entity: entity.display_name().to_string(),
                    cause: format!("{:#}", e),
                });
            }
        }

        entity.set_lifecycle(Lifecycle::Running);
        self.entities.insert(entity.id().to_string(), entity.clone());
        if let Some(p) = parent_entity {
            p.add_child(entity.id());
        }

        info!(
            entity_id = %entity.id(),
            name = %entity.display_name(),
            parent = ?entity.parent_id(),
            "Entity created"
        );
        Ok(entity)
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|e| e.value().clone())
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.entities.iter().map(|e| e.value().clone()).collect()
    }

    /// Top-level entities
    pub fn applications(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.value().parent_id().is_none())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.entities.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Asynchronous effector invocation for front-ends
    pub fn invoke(
        &self,
        entity_id: &str,
        effector: &str,
        args: Value,
    ) -> Result<TaskHandle, EntityError> {
        let entity = self
            .entity(entity_id)
            .ok_or_else(|| EntityError::NotFound(entity_id.to_string()))?;
        entity.invoke(effector, args)
    }

    /// Destroy `id` and everything it owns, children first
    pub fn destroy_entity(&self, id: &str) -> Result<(), EntityError> {
        let entity = self.entity(id).ok_or_else(|| EntityError::NotFound(id.to_string()))?;

        for child in entity.children() {
            match self.destroy_entity(&child) {
                Ok(()) | Err(EntityError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        entity.set_lifecycle(Lifecycle::Stopping);
        self.release(&entity);
        entity.set_lifecycle(Lifecycle::Destroyed);

        self.entities.remove(id);
        if let Some(parent) = entity.parent_id().and_then(|p| self.entity(p)) {
            parent.remove_child(id);
        }

        info!(entity_id = %id, name = %entity.display_name(), "Entity destroyed");
        Ok(())
    }

    /// Tear down adjunct state: policies, then subscriptions, then membership
    fn release(&self, entity: &Entity) {
        for policy in entity.take_policies() {
            policy.destroy();
        }

        let owned = self.bus.unsubscribe_owner(entity.id());

        for (group, size) in self.bus.membership().forget(entity.id()) {
            if let Some(group) = self.entity(&group) {
                group.member_left(entity.id(), size);
            }
        }

        let scoped = self.bus.remove_scope(entity.id());
        debug!(
            entity_id = %entity.id(),
            owned_subscriptions = owned,
            scoped_subscriptions = scoped,
            "Entity subscriptions released"
        );
    }

    /// Destroy every top-level entity
    pub fn shutdown(&self) {
        let applications = self.applications();
        info!(count = applications.len(), "Shutting down applications");
        for app in applications {
            if let Err(e) = self.destroy_entity(app.id()) {
                warn!(entity_id = %app.id(), error = %e, "Failed to destroy application");
            }
        }
    }
}

impl Default for ManagementContext {
    fn default() -> Self {
        Self::new(TopoConfig::default())
    }
}
