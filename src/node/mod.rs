//! Managed-node surface: the sensors a running service advertises and the
//! opaque command channel used to administer it.

use crate::entity::Entity;
use crate::sensor::Sensor;
use crate::task::TaskError;
use async_trait::async_trait;
use tracing::{debug, warn};

pub const SERVICE_UP: Sensor<bool> =
    Sensor::new("service.isUp", "Whether the service is up and answering");
pub const HOSTNAME: Sensor<String> = Sensor::new("host.name", "Host name of the node");
pub const ADDRESS: Sensor<String> = Sensor::new("host.address", "Public address of the node");
pub const SUBNET_ADDRESS: Sensor<String> =
    Sensor::new("host.subnet.address", "Address of the node inside its subnet");
pub const SERVICE_PORT: Sensor<u16> = Sensor::new("service.port", "Port the service listens on");

/// Executes administrative command text on a managed node.
///
/// Implementations own transport and authentication. A non-zero exit or a
/// transport failure is an error; the returned string is raw output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, node: &Entity, command: &str) -> anyhow::Result<String>;
}

/// Run `command` on `node`, surfacing failures as a resubmittable task error
pub async fn run_command(
    executor: &dyn CommandExecutor,
    node: &Entity,
    command: &str,
) -> Result<String, TaskError> {
    debug!(entity_id = %node.id(), command = %redact(command), "Executing command");
    executor.execute(node, command).await.map_err(|e| {
        warn!(
            entity_id = %node.id(),
            command = %redact(command),
            error = %format!("{:#}", e),
            "Command failed"
        );
        TaskError::Failed(format!("command on {} failed: {:#}", node.display_name(), e))
    })
}

/// Leading keywords only; command text may carry credentials
fn redact(command: &str) -> String {
    command
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}
