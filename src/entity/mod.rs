//! Managed entities: identity, configuration, tags, attributes, lifecycle,
//! and the ownership-free member relation used by container entities.

mod model;
mod spec;

pub use model::{Effector, Entity, EntitySnapshot};
pub use spec::{EntitySpec, InitHook};

use crate::config::ValidationError;
use crate::sensor::Sensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;


/// Stable entity identity
pub type EntityId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Initializing,
    Running,
    Stopping,
    Destroyed,
}

/// Published on every lifecycle transition
pub const LIFECYCLE: Sensor<Lifecycle> =
    Sensor::new("entity.lifecycle", "Lifecycle state of the entity");

/// Published by a group when an entity joins it
pub const MEMBER_ADDED: Sensor<EntityId> =
    Sensor::new("group.members.added", "Entity that joined the group");

/// Published by a group when an entity leaves it
pub const MEMBER_REMOVED: Sensor<EntityId> =
    Sensor::new("group.members.removed", "Entity that left the group");

pub const GROUP_SIZE: Sensor<usize> = Sensor::new("group.size", "Current number of group members");

#[derive(Debug, Error)]
pub enum EntityError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("init of '{entity}' failed: {cause}")]
    Init { entity: String, cause: String },

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("entity '{entity}' is {state:?}, not running")]
    NotRunning { entity: String, state: Lifecycle },

    #[error("entity '{entity}' has no effector '{effector}'")]
    UnknownEffector { entity: String, effector: String },

    #[error("policy could not be attached: {0}")]
    PolicyAttached(#[from] crate::policy::PolicyError),
}
