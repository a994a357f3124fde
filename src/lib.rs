// Typed sensor handles and change events
pub mod sensor;

// Per-entity attribute storage
pub mod attribute;

// Event bus, subscriptions and group membership
pub mod bus;

// Runtime configuration and per-entity config bags
pub mod config;

// Task engine: submission, dependencies, cancellation
pub mod task;

// Entities and their lifecycle
pub mod entity;

// Entity registry and creation/destruction
pub mod management;

// Policies attached to entities
pub mod policy;

// Remote command execution on nodes
pub mod node;

// Compute provisioning
pub mod provision;

// Replicated primary/follower clusters
pub mod cluster;

#[cfg(test)]
mod testing;

pub use config::{load_config, TopoConfig};
pub use entity::{Entity, EntityError, EntityId, EntitySpec, Lifecycle};
pub use management::ManagementContext;
pub use sensor::{Sensor, SensorEvent};
pub use task::{Task, TaskEngine, TaskError, TaskHandle, TaskStatus};
