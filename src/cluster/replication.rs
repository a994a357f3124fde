use super::commands::{self, LogPosition};
use super::{
    FIRST, FOLLOWER_INITIALIZED, PRIMARY_LOG_FILE, PRIMARY_LOG_POSITION, PRIMARY_ROLE_ID,
    PRIMARY_SETUP_CLAIMED, REPLICATION_PASSWORD, REPLICATION_USER, ROLE_ID,
};
use crate::entity::{Entity, EntityId};
use crate::management::ManagementContext;
use crate::node::{run_command, CommandExecutor, ADDRESS, SUBNET_ADDRESS};
use crate::sensor::SensorEvent;
use crate::task::{Task, TaskContext, TaskError};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub(crate) const CONFIGURE_TASK: &str = "Configure primary-follower replication on node";

/// State shared by the cluster's member listeners
#[derive(Clone)]
pub(crate) struct Replication {
    pub(crate) mgmt: Weak<ManagementContext>,
    pub(crate) cluster: EntityId,
    pub(crate) executor: Arc<dyn CommandExecutor>,
    pub(crate) primary_wait: Option<Duration>,
}

struct Credentials {
    user: String,
    password: String,
}

impl Replication {
    /// Member's "up" sensor changed: queue role-specific initialization
    pub(crate) fn on_member_up(&self, event: &SensorEvent) -> anyhow::Result<()> {
        if event.value_as::<bool>() != Some(true) {
            return Ok(());
        }
        let Some(mgmt) = self.mgmt.upgrade() else {
            return Ok(());
        };
        let Some(member) = mgmt.entity(&event.source) else {
            return Ok(());
        };
        let Some(role) = member.config(&ROLE_ID) else {
            debug!(entity_id = %member.id(), "Member up before its role id resolved, ignoring");
            return Ok(());
        };

        let replication = self.clone();
        let node = member.clone();
        let task = Task::new(CONFIGURE_TASK, move |ctx| async move {
            match role {
                PRIMARY_ROLE_ID => replication.init_primary(&node).await,
                r if r > PRIMARY_ROLE_ID => replication.init_follower(&ctx, &node).await,
                _ => Ok(Value::Null),
            }
        })
        .entity(member.id());

        let handle = mgmt.tasks().queue_if_possible(task).or_submit_async();
        debug!(entity_id = %member.id(), role, task_id = %handle.id(), "Replication setup queued");
        Ok(())
    }

    /// Copy the current primary's endpoint sensors onto the cluster
    pub(crate) fn propagate_from_primary(&self, event: &SensorEvent) -> anyhow::Result<()> {
        let Some(mgmt) = self.mgmt.upgrade() else {
            return Ok(());
        };
        let Some(member) = mgmt.entity(&event.source) else {
            return Ok(());
        };
        if member.config(&ROLE_ID) != Some(PRIMARY_ROLE_ID) {
            return Ok(());
        }
        if let Some(cluster) = mgmt.entity(&self.cluster) {
            cluster.set_attribute_value(&event.sensor, event.value.clone());
        }
        Ok(())
    }

    fn cluster(&self) -> Result<(Arc<ManagementContext>, Entity), TaskError> {
        let mgmt = self
            .mgmt
            .upgrade()
            .ok_or_else(|| TaskError::failed("management context is gone"))?;
        let cluster = mgmt
            .entity(&self.cluster)
            .ok_or_else(|| {
                TaskError::Failed(format!("cluster {} no longer exists", self.cluster))
            })?;
        Ok((mgmt, cluster))
    }

    fn credentials(&self, cluster: &Entity) -> Result<Credentials, TaskError> {
        let user = cluster
            .config(&REPLICATION_USER)
            .ok_or_else(|| TaskError::failed("replication user is not configured"))?;
        let password = cluster
            .config(&REPLICATION_PASSWORD)
            .ok_or_else(|| TaskError::failed("replication password is not configured"))?;
        Ok(Credentials { user, password })
    }

    /// One-time setup on the primary: replication account and log position
    async fn init_primary(&self, primary: &Entity) -> Result<Value, TaskError> {
        if primary.get_attribute(&PRIMARY_LOG_FILE).is_some()
            && primary.get_attribute(&PRIMARY_LOG_POSITION).is_some()
        {
            debug!(entity_id = %primary.id(), "Primary already publishes its log position");
            return Ok(Value::Null);
        }
        if !primary.claim_marker(&PRIMARY_SETUP_CLAIMED) {
            debug!(entity_id = %primary.id(), "Primary setup already claimed");
            return Ok(Value::Null);
        }

        let result = self.setup_primary(primary).await;
        if result.is_err() {
            primary.release_marker(&PRIMARY_SETUP_CLAIMED);
        }
        result
    }

    async fn setup_primary(&self, primary: &Entity) -> Result<Value, TaskError> {
        let (_, cluster) = self.cluster()?;
        let credentials = self.credentials(&cluster)?;
        let executor = self.executor.as_ref();

        run_command(
            executor,
            primary,
            &commands::create_replication_user(&credentials.user, &credentials.password),
        )
        .await?;

        let status = run_command(executor, primary, commands::CAPTURE_LOG_POSITION).await?;
        let position = commands::parse_log_position(&status)
            .ok_or_else(|| {
                TaskError::Failed(format!("no log position in primary status output: {:?}", status))
            })?;

        primary.set_attribute(&PRIMARY_LOG_FILE, position.file.clone());
        primary.set_attribute(&PRIMARY_LOG_POSITION, position.position);

        info!(
            entity_id = %primary.id(),
            log_file = %position.file,
            log_position = position.position,
            "Primary replication initialized"
        );
        Ok(json!(position))
    }

    /// Point a follower at the primary once the primary publishes its position
    async fn init_follower(
        &self,
        ctx: &TaskContext,
        follower: &Entity,
    ) -> Result<Value, TaskError> {
        if !follower.claim_marker(&FOLLOWER_INITIALIZED) {
            debug!(entity_id = %follower.id(), "Follower already initialized");
            return Ok(Value::Null);
        }

        let result = self.setup_follower(ctx, follower).await;
        if result.is_err() {
            follower.release_marker(&FOLLOWER_INITIALIZED);
        }
        result
    }

    async fn setup_follower(
        &self,
        ctx: &TaskContext,
        follower: &Entity,
    ) -> Result<Value, TaskError> {
        let (mgmt, cluster) = self.cluster()?;
        let credentials = self.credentials(&cluster)?;

        // One budget covers every wait on the primary
        let deadline = self.primary_wait.map(|wait| Instant::now() + wait);

        let primary_id = ctx.await_value(&cluster, &FIRST, remaining(deadline)).await?;
        let primary = mgmt
            .entity(&primary_id)
            .ok_or_else(|| TaskError::Failed(format!("primary {} no longer exists", primary_id)))?;

        let file = ctx
            .await_value(&primary, &PRIMARY_LOG_FILE, remaining(deadline))
            .await?;
        let offset = ctx
            .await_value(&primary, &PRIMARY_LOG_POSITION, remaining(deadline))
            .await?;
        let position = LogPosition { file, position: offset };

        let host = match primary.get_attribute(&SUBNET_ADDRESS) {
            Some(host) => host,
            None => ctx.await_value(&primary, &ADDRESS, remaining(deadline)).await?,
        };

        let command = commands::change_primary_command(
            &host,
            &credentials.user,
            &credentials.password,
            &position,
        );
        run_command(self.executor.as_ref(), follower, &command).await?;

        info!(
            entity_id = %follower.id(),
            primary = %primary.id(),
            host = %host,
            log_file = %position.file,
            log_position = position.position,
            "Follower connected to primary"
        );
        Ok(json!({ "primary": primary.id(), "host": host, "position": position }))
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|at| at.saturating_duration_since(Instant::now()))
}
