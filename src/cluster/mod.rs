//! Replicated cluster bootstrap built only from entities, sensors, the bus
//! and tasks.
//!
//! ```text
//!                         +--------------------+
//!                         |  cluster entity    |  cluster.first, host.*, service.port
//!                         +---------+----------+
//!            members scope: service.isUp | host.* / service.port
//!          +------------------------+------------------------+
//!          |                        |                        |
//!   +------+------+          +------+------+          +------+------+
//!   | primary (1) |          | follower(10)|          | follower(11)|
//!   +-------------+          +-------------+          +-------------+
//!    up -> create user,       up -> await primary log file/position,
//!    capture log position        issue CHANGE MASTER TO ...
//! ```
//!
//! Ordering between members comes from guard sensors and `await_value`, never
//! from locks spanning entities.

mod commands;
mod config;
mod replication;
mod roles;

pub use commands::{
    change_primary_command, create_replication_user, parse_log_position, LogPosition,
    CAPTURE_LOG_POSITION,
};
pub use config::ClusterConfig;
pub use roles::RoleIdAllocator;

use crate::config::{ConfigKey, ConfigValue, Flags, ValidationError, ValueSupplier};
use crate::entity::{Entity, EntityError, EntityId, EntitySpec};
use crate::management::ManagementContext;
use crate::node::{CommandExecutor, ADDRESS, HOSTNAME, SERVICE_PORT, SERVICE_UP};
use crate::sensor::Sensor;
use crate::task::{Task, TaskError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use replication::Replication;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{info, warn};

#[cfg(test)]
mod tests;

/// Role id of the primary member
pub const PRIMARY_ROLE_ID: i64 = 1;

pub const ROLE_ID: ConfigKey<i64> =
    ConfigKey::new("replication.role_id", "Replication role id of a member (1 = primary)");
pub const REPLICATION_USER: ConfigKey<String> =
    ConfigKey::new("replication.user", "Account followers replicate as");
pub const REPLICATION_PASSWORD: ConfigKey<String> =
    ConfigKey::new("replication.password", "Password of the replication account").secret();
pub const INITIAL_SIZE: ConfigKey<usize> =
    ConfigKey::new("cluster.initial_size", "Members created with the cluster")
        .with_default(|| json!(1));

pub const FIRST: Sensor<EntityId> =
    Sensor::new("cluster.first", "First member, holder of the primary role");
pub const PRIMARY_LOG_FILE: Sensor<String> =
    Sensor::new("replication.primary.log_file", "Binary log file the primary is writing to");
pub const PRIMARY_LOG_POSITION: Sensor<i64> =
    Sensor::new(
        "replication.primary.log_position",
        "Position in the log file to start replication from",
    );

/// Set on a follower before it connects to the primary
pub const FOLLOWER_INITIALIZED: Sensor<bool> =
    Sensor::new("replication.follower.initialized", "Follower replication setup claimed");
pub const PRIMARY_SETUP_CLAIMED: Sensor<bool> =
    Sensor::new("replication.primary.setup_claimed", "Primary replication setup claimed");

const PASSWORD_LENGTH: usize = 16;

/// Parameters for [`ReplicatedCluster::create`]
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    name: String,
    parent: Option<EntityId>,
    flags: Flags,
    primary: EntitySpec,
    follower: EntitySpec,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            flags: Flags::new(),
            primary: EntitySpec::new("primary"),
            follower: EntitySpec::new("follower"),
        }
    }

    pub fn initial_size(self, size: usize) -> Self {
        self.flag(INITIAL_SIZE.name(), size as i64)
    }

    pub fn flag(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.flags.insert(key, value);
        self
    }

    pub fn parent(mut self, parent: &Entity) -> Self {
        self.parent = Some(parent.id().to_string());
        self
    }

    /// Template for the first member
    pub fn primary_template(mut self, spec: EntitySpec) -> Self {
        self.primary = spec;
        self
    }

    /// Template for every later member
    pub fn follower_template(mut self, spec: EntitySpec) -> Self {
        self.follower = spec;
        self
    }
}

/// Creates members from the templates. Shared with the `resize` effector.
struct MemberFactory {
    mgmt: Weak<ManagementContext>,
    primary: EntitySpec,
    follower: EntitySpec,
    allocator: Arc<RoleIdAllocator>,
    resize_lock: Mutex<()>,
}

impl MemberFactory {
    fn mgmt(&self) -> Result<Arc<ManagementContext>, EntityError> {
        self.mgmt
            .upgrade()
            .ok_or_else(|| EntityError::NotFound("management context".to_string()))
    }

    fn grow(&self, cluster: &Entity) -> Result<Entity, EntityError> {
        let _guard = self.resize_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.grow_locked(cluster)
    }

    fn grow_locked(&self, cluster: &Entity) -> Result<Entity, EntityError> {
        let mgmt = self.mgmt()?;
        let first = match cluster.get_attribute(&FIRST) {
            Some(primary) if cluster.members().contains(&primary) => false,
            Some(gone) => {
                forget_primary(cluster, &gone);
                true
            }
            None => true,
        };

        let spec = if first {
            self.primary.clone().flag(ROLE_ID.name(), PRIMARY_ROLE_ID)
        } else if self.follower.flags.contains_key(ROLE_ID.name()) {
            self.follower.clone()
        } else {
            let allocator: Arc<dyn ValueSupplier> = self.allocator.clone();
            self.follower.clone().flag(ROLE_ID.name(), ConfigValue::supplied(allocator))
        };

        let member = mgmt.create_entity(spec.key(&ROLE_ID).parent(cluster))?;
        cluster.add_member(&member);
        if first {
            cluster.set_attribute(&FIRST, member.id().to_string());
        }

        info!(
            cluster = %cluster.id(),
            member = %member.id(),
            role = ?member.config(&ROLE_ID),
            "Cluster member created"
        );
        Ok(member)
    }

    /// Grow or shrink to `desired` members. Followers go newest first; the
    /// primary is never removed by a resize.
    fn resize(&self, cluster: &Entity, desired: usize) -> Result<usize, EntityError> {
        let _guard = self.resize_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mgmt = self.mgmt()?;

        while cluster.members().len() < desired {
            self.grow_locked(cluster)?;
        }

        let primary = cluster.get_attribute(&FIRST);
        while cluster.members().len() > desired.max(1) {
            let Some(victim) = ordered_members(&mgmt, cluster)
                .into_iter()
                .rev()
                .find(|m| Some(m.id()) != primary.as_deref())
            else {
                break;
            };
            mgmt.destroy_entity(victim.id())?;
        }

        Ok(cluster.members().len())
    }

    fn remove(&self, cluster: &Entity, member: &str) -> Result<(), EntityError> {
        let _guard = self.resize_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !cluster.members().iter().any(|m| m == member) {
            return Err(EntityError::NotFound(member.to_string()));
        }
        if cluster.get_attribute(&FIRST).as_deref() == Some(member) {
            return Err(ValidationError::invalid_value(
                "member",
                format!("{} holds the primary role and cannot be removed", member),
            )
            .into());
        }
        self.mgmt()?.destroy_entity(member)
    }
}

/// Container entity whose members bootstrap primary/follower replication
/// among themselves.
pub struct ReplicatedCluster {
    entity: Entity,
    members: Arc<MemberFactory>,
}

impl ReplicatedCluster {
    pub fn create(
        mgmt: &Arc<ManagementContext>,
        spec: ClusterSpec,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, EntityError> {
        let settings = mgmt.config().cluster.clone();
        let allocator = Arc::new(RoleIdAllocator::new(settings.follower_id_floor)?);

        let members = Arc::new(MemberFactory {
            mgmt: Arc::downgrade(mgmt),
            primary: spec.primary,
            follower: spec.follower,
            allocator,
            resize_lock: Mutex::new(()),
        });

        let weak_mgmt = Arc::downgrade(mgmt);
        let primary_wait = settings.primary_wait_timeout();

        let mut entity_spec = EntitySpec::new(spec.name)
            .key(&REPLICATION_USER)
            .key(&REPLICATION_PASSWORD)
            .key(&INITIAL_SIZE)
            .flag(REPLICATION_USER.name(), settings.replication_user)
            .flags(spec.flags)
            .on_init(move |cluster| {
                if cluster.config(&REPLICATION_PASSWORD).is_none() {
                    cluster.seed_config(REPLICATION_PASSWORD.name(), generate_password())?;
                }

                let replication = Replication {
                    mgmt: weak_mgmt.clone(),
                    cluster: cluster.id().to_string(),
                    executor: Arc::clone(&executor),
                    primary_wait,
                };

                let up = replication.clone();
                cluster
                    .subscribe_to_members(SERVICE_UP.name(), move |event| up.on_member_up(event));

                for sensor in [HOSTNAME.name(), ADDRESS.name(), SERVICE_PORT.name()] {
                    let propagate = replication.clone();
                    cluster.subscribe_to_members(sensor, move |event| {
                        propagate.propagate_from_primary(event)
                    });
                }
                Ok(())
            });

        let resizer = Arc::clone(&members);
        entity_spec = entity_spec.effector("resize", move |cluster, args| {
            let members = Arc::clone(&resizer);
            let cluster = cluster.clone();
            Task::new("Resize cluster", move |_ctx| async move {
                let desired = desired_size(&args)?;
                let size = members.resize(&cluster, desired).map_err(TaskError::failed)?;
                Ok(json!(size))
            })
        });

        if let Some(parent) = spec.parent {
            entity_spec = entity_spec.parent_id(parent);
        }

        let entity = mgmt.create_entity(entity_spec)?;
        let cluster = Self { entity, members };

        let initial = cluster.entity.config(&INITIAL_SIZE).unwrap_or(1);
        cluster.resize(initial)?;
        Ok(cluster)
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn id(&self) -> &str {
        self.entity.id()
    }

    /// Add one member: the primary if none exists yet, a follower otherwise
    pub fn grow(&self) -> Result<Entity, EntityError> {
        self.members.grow(&self.entity)
    }

    pub fn resize(&self, desired: usize) -> Result<usize, EntityError> {
        self.members.resize(&self.entity, desired)
    }

    /// Destroy a follower. The primary is refused.
    pub fn remove_member(&self, member: &str) -> Result<(), EntityError> {
        self.members.remove(&self.entity, member)
    }

    /// Current members, primary first, then followers in role id order
    pub fn members(&self) -> Vec<Entity> {
        match self.members.mgmt.upgrade() {
            Some(mgmt) => ordered_members(&mgmt, &self.entity),
            None => Vec::new(),
        }
    }

    pub fn primary(&self) -> Option<Entity> {
        let id = self.entity.get_attribute(&FIRST)?;
        self.members.mgmt.upgrade()?.entity(&id)
    }

    /// Id the next follower will receive
    pub fn next_role_id(&self) -> i64 {
        self.members.allocator.peek()
    }
}

/// The recorded primary is no longer a member: drop it and the endpoint
/// copied from it so the next member created takes the primary role.
fn forget_primary(cluster: &Entity, primary: &str) {
    cluster.clear_attribute(&FIRST);
    cluster.clear_attribute(&HOSTNAME);
    cluster.clear_attribute(&ADDRESS);
    cluster.clear_attribute(&SERVICE_PORT);
    warn!(cluster = %cluster.id(), primary = %primary, "Primary left the cluster");
}

/// Role ids only grow, so this is also creation order. Members whose role is
/// still deferred sort last.
fn ordered_members(mgmt: &ManagementContext, cluster: &Entity) -> Vec<Entity> {
    let mut members: Vec<Entity> =
        cluster.members().iter().filter_map(|id| mgmt.entity(id)).collect();
    members.sort_by_key(|m| m.config(&ROLE_ID).unwrap_or(i64::MAX));
    members
}

fn desired_size(args: &Value) -> Result<usize, TaskError> {
    args.get("desired_size")
        .unwrap_or(args)
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| TaskError::Failed(format!("resize expects a desired size, got {}", args)))
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
