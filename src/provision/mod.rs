//! Boundary to an external compute provider.
//!
//! The core only needs three capabilities from a provider: create a node,
//! destroy it, and list the locations the current credentials may use.
//! Credential checks go through [`validate_credentials`] before any local
//! state is written.

use crate::entity::Entity;
use crate::node::{ADDRESS, HOSTNAME, SERVICE_UP, SUBNET_ADDRESS};
use crate::sensor::Sensor;
use crate::task::{Task, TaskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};


/// Provider handle of the node backing an entity
pub const NODE: Sensor<NodeHandle> =
    Sensor::new("provision.node", "Provider handle of the backing node");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHandle {
    pub id: String,
    pub location: String,
    pub hostname: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CredentialError {
    #[error("credentials rejected by provider: {0}")]
    Rejected(String),

    #[error("no assignable locations for these credentials")]
    NoLocations,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("location '{0}' is not available")]
    UnknownLocation(String),

    #[error("provider error: {0:#}")]
    Provider(#[from] anyhow::Error),
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn create_node(&self, spec: &NodeSpec) -> Result<NodeHandle, ProvisionError>;

    async fn destroy_node(&self, node: &NodeHandle) -> Result<(), ProvisionError>;

    async fn list_available_locations(&self) -> Result<BTreeSet<String>, ProvisionError>;
}

/// Fail fast unless the provider accepts the credentials and offers at
/// least one location. Returns the usable locations.
pub async fn validate_credentials(
    service: &dyn ComputeService,
) -> Result<BTreeSet<String>, CredentialError> {
    let locations = match service.list_available_locations().await {
        Ok(locations) => locations,
        Err(ProvisionError::Credential(e)) => return Err(e),
        Err(e) => return Err(CredentialError::Rejected(e.to_string())),
    };
    if locations.is_empty() {
        return Err(CredentialError::NoLocations);
    }
    Ok(locations)
}

/// Task that creates the node backing `entity` and publishes its identity
pub fn start_node_task(service: Arc<dyn ComputeService>, entity: Entity, spec: NodeSpec) -> Task {
    let name = format!("Provision node {} in {}", spec.name, spec.location);
    let entity_id = entity.id().to_string();

    Task::new(name, move |_ctx| async move {
        let locations = validate_credentials(service.as_ref())
            .await
            .map_err(TaskError::failed)?;
        if !locations.contains(&spec.location) {
            return Err(TaskError::failed(ProvisionError::UnknownLocation(spec.location)));
        }

        let node = service.create_node(&spec).await.map_err(TaskError::failed)?;
        info!(
            entity_id = %entity.id(),
            node_id = %node.id,
            location = %node.location,
            address = %node.address,
            "Node provisioned"
        );

        entity.set_attribute(&HOSTNAME, node.hostname.clone());
        entity.set_attribute(&ADDRESS, node.address.clone());
        if let Some(subnet) = &node.subnet_address {
            entity.set_attribute(&SUBNET_ADDRESS, subnet.clone());
        }
        entity.set_attribute(&NODE, node.clone());

        serde_json::to_value(&node).map_err(TaskError::failed)
    })
    .entity(entity_id)
}

/// Task that releases the node recorded on `entity`, if any
pub fn stop_node_task(service: Arc<dyn ComputeService>, entity: Entity) -> Task {
    let entity_id = entity.id().to_string();

    Task::new("Release node", move |_ctx| async move {
        let Some(node) = entity.get_attribute(&NODE) else {
            return Ok(Value::Null);
        };

        entity.set_attribute(&SERVICE_UP, false);
        if let Err(e) = service.destroy_node(&node).await {
            warn!(
                entity_id = %entity.id(),
                node_id = %node.id,
                error = %e,
                "Failed to release node"
            );
            return Err(TaskError::failed(e));
        }

        entity.clear_attribute(&NODE);
        entity.clear_attribute(&ADDRESS);
        entity.clear_attribute(&SUBNET_ADDRESS);
        info!(entity_id = %entity.id(), node_id = %node.id, "Node released");
        Ok(Value::String(node.id))
    })
    .entity(entity_id)
}
