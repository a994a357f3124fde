use super::replication::CONFIGURE_TASK;
use super::*;
use crate::config::TopoConfig;
use crate::testing::{eventually, settle};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

#[derive(Default)]
struct RecordingExecutor {
    commands: StdMutex<Vec<(EntityId, String)>>,
}

impl RecordingExecutor {
    fn commands_on(&self, node: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, node: &Entity, command: &str) -> anyhow::Result<String> {
        self.commands.lock().unwrap().push((node.id().to_string(), command.to_string()));
        if command == CAPTURE_LOG_POSITION {
            return Ok("File: bin.000001\nPosition: 4".to_string());
        }
        Ok(String::new())
    }
}

fn context(floor: i64) -> Arc<ManagementContext> {
    let mut config = TopoConfig::default();
    config.tasks.worker_count = 4;
    config.cluster.follower_id_floor = floor;
    config.cluster.primary_wait_timeout_seconds = 5;
    Arc::new(ManagementContext::new(config))
}

fn configure_tasks(mgmt: &ManagementContext) -> usize {
    mgmt.tasks().tasks().iter().filter(|t| t.name() == CONFIGURE_TASK).count()
}

#[test]
fn test_allocator_rejects_floor_at_primary() {
    assert!(RoleIdAllocator::new(1).is_err());
    assert!(RoleIdAllocator::new(0).is_err());

    let allocator = RoleIdAllocator::new(2).unwrap();
    assert_eq!(allocator.allocate(), 2);
    assert_eq!(allocator.allocate(), 3);
    assert_eq!(allocator.peek(), 4);
}

#[test]
fn test_concurrent_allocations_are_distinct() {
    let allocator = Arc::new(RoleIdAllocator::new(10).unwrap());
    let threads: Vec<_> = (0..5)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || allocator.allocate())
        })
        .collect();

    let ids: HashSet<i64> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.iter().all(|id| *id >= 10));
}

#[test]
fn test_desired_size_argument_forms() {
    assert_eq!(desired_size(&json!({"desired_size": 3})), Ok(3));
    assert_eq!(desired_size(&json!(2)), Ok(2));
    assert!(desired_size(&json!("three")).is_err());
}

#[tokio::test]
async fn test_initial_members_get_roles() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(3),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();

    let members = cluster.members();
    assert_eq!(members.len(), 3);

    let primary = cluster.primary().unwrap();
    assert_eq!(primary.id(), members[0].id());
    assert_eq!(primary.config(&ROLE_ID), Some(PRIMARY_ROLE_ID));
    assert_eq!(primary.parent_id(), Some(cluster.id()));

    let follower_roles: Vec<_> = members[1..].iter().map(|m| m.config(&ROLE_ID)).collect();
    assert_eq!(follower_roles, vec![Some(10), Some(11)]);
    assert_eq!(cluster.next_role_id(), 12);
}

#[tokio::test]
async fn test_password_generated_unless_given() {
    let mgmt = context(10);
    let generated = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("generated").initial_size(0),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    let password = generated.entity().config(&REPLICATION_PASSWORD).unwrap();
    assert_eq!(password.len(), 16);
    assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(generated.entity().config(&REPLICATION_USER).as_deref(), Some("replicator"));

    let explicit = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("explicit")
            .initial_size(0)
            .flag(REPLICATION_PASSWORD.name(), "s3cret")
            .flag(REPLICATION_USER.name(), "repl"),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    assert_eq!(explicit.entity().config(&REPLICATION_PASSWORD).as_deref(), Some("s3cret"));
    assert_eq!(explicit.entity().config(&REPLICATION_USER).as_deref(), Some("repl"));
}

#[tokio::test]
async fn test_resize_keeps_primary_and_never_reuses_ids() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(3),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    let primary = cluster.primary().unwrap().id().to_string();

    assert_eq!(cluster.resize(0).unwrap(), 1);
    assert_eq!(cluster.entity().members(), vec![primary.clone()]);
    assert!(mgmt.entity(&primary).is_some());

    let added = cluster.grow().unwrap();
    assert_eq!(added.config(&ROLE_ID), Some(12));

    cluster.remove_member(added.id()).unwrap();
    assert!(mgmt.entity(added.id()).is_none());
    assert!(matches!(cluster.remove_member(added.id()), Err(EntityError::NotFound(_))));

    assert_eq!(cluster.resize(2).unwrap(), 2);
    assert_eq!(cluster.members()[1].config(&ROLE_ID), Some(13));
}

#[tokio::test]
async fn test_resize_effector() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster"),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    assert_eq!(cluster.members().len(), 1);
    assert!(cluster.entity().effector_names().contains(&"resize".to_string()));

    let handle = mgmt.invoke(cluster.id(), "resize", json!({"desired_size": 3})).unwrap();
    assert_eq!(handle.join().await, Ok(json!(3)));
    assert_eq!(cluster.members().len(), 3);

    let bad = mgmt.invoke(cluster.id(), "resize", json!("lots")).unwrap();
    assert!(matches!(bad.join().await, Err(TaskError::Failed(_))));
}

#[tokio::test]
async fn test_member_without_resolved_role_is_ignored() {
    let mgmt = context(10);
    let source = mgmt.create_entity(EntitySpec::new("role-source")).unwrap();
    const ROLE_SOURCE: Sensor<i64> = Sensor::new("test.role", "Role published later");

    let executor = Arc::new(RecordingExecutor::default());
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster")
            .initial_size(2)
            .follower_template(
                EntitySpec::new("follower")
                    .flag(ROLE_ID.name(), ConfigValue::when_ready(&source, &ROLE_SOURCE)),
            ),
        executor.clone(),
    )
    .unwrap();

    let follower = cluster.members()[1].clone();
    assert_eq!(follower.config(&ROLE_ID), None);

    follower.set_attribute(&SERVICE_UP, true);
    settle().await;

    assert_eq!(configure_tasks(&mgmt), 0);
    assert!(executor.commands_on(follower.id()).is_empty());
}

#[tokio::test]
async fn test_primary_endpoint_propagates_to_cluster() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(2),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    let members = cluster.members();

    members[1].set_attribute(&HOSTNAME, "follower.local".to_string());
    members[0].set_attribute(&HOSTNAME, "primary.local".to_string());
    members[0].set_attribute(&SERVICE_PORT, 3306);

    let entity = cluster.entity().clone();
    assert!(
        eventually(|| {
            entity.get_attribute(&HOSTNAME).as_deref() == Some("primary.local")
                && entity.get_attribute(&SERVICE_PORT) == Some(3306)
        })
        .await
    );
    settle().await;
    assert_eq!(entity.get_attribute(&HOSTNAME).as_deref(), Some("primary.local"));
}

#[tokio::test]
async fn test_primary_setup_runs_once() {
    let mgmt = context(10);
    let executor = Arc::new(RecordingExecutor::default());
    let cluster =
        ReplicatedCluster::create(&mgmt, ClusterSpec::new("db-cluster"), executor.clone()).unwrap();
    let primary = cluster.primary().unwrap();

    primary.set_attribute(&SERVICE_UP, true);
    primary.set_attribute(&SERVICE_UP, false);
    primary.set_attribute(&SERVICE_UP, true);

    let node = primary.clone();
    assert!(eventually(|| node.get_attribute(&PRIMARY_LOG_POSITION) == Some(4)).await);
    settle().await;

    assert_eq!(primary.get_attribute(&PRIMARY_LOG_FILE).as_deref(), Some("bin.000001"));
    let commands = executor.commands_on(primary.id());
    assert_eq!(commands.iter().filter(|c| c.as_str() == CAPTURE_LOG_POSITION).count(), 1);
    assert!(commands[0].starts_with("CREATE USER IF NOT EXISTS 'replicator'@'%'"));
}

#[tokio::test]
async fn test_primary_cannot_be_removed() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(2),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    let primary = cluster.primary().unwrap();

    let err = cluster.remove_member(primary.id()).unwrap_err();
    assert!(matches!(err, EntityError::Validation(ValidationError::InvalidValue { .. })));
    assert!(mgmt.entity(primary.id()).is_some());
    assert_eq!(cluster.members().len(), 2);
}

#[tokio::test]
async fn test_destroyed_primary_replaced_on_grow() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(2),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();
    let old_primary = cluster.primary().unwrap();
    old_primary.set_attribute(&HOSTNAME, "old-primary.local".to_string());

    let entity = cluster.entity().clone();
    assert!(eventually(|| entity.get_attribute(&HOSTNAME).is_some()).await);

    mgmt.destroy_entity(old_primary.id()).unwrap();
    assert!(cluster.primary().is_none());

    let replacement = cluster.grow().unwrap();
    assert_eq!(replacement.config(&ROLE_ID), Some(PRIMARY_ROLE_ID));
    assert_eq!(entity.get_attribute(&FIRST).as_deref(), Some(replacement.id()));
    assert_eq!(entity.get_attribute(&HOSTNAME), None);

    let roles: Vec<_> = cluster.members().iter().map(|m| m.config(&ROLE_ID)).collect();
    assert_eq!(roles, vec![Some(1), Some(10)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_grow_assigns_distinct_roles() {
    let mgmt = context(10);
    let cluster = Arc::new(
        ReplicatedCluster::create(
            &mgmt,
            ClusterSpec::new("db-cluster"),
            Arc::new(RecordingExecutor::default()),
        )
        .unwrap(),
    );

    let growers: Vec<_> = (0..5)
        .map(|_| {
            let cluster = Arc::clone(&cluster);
            tokio::task::spawn_blocking(move || cluster.grow().map(|m| m.config(&ROLE_ID)))
        })
        .collect();

    let mut roles = HashSet::new();
    for grower in growers {
        let role = grower.await.unwrap().unwrap().unwrap();
        assert!(role >= 10);
        roles.insert(role);
    }
    assert_eq!(roles.len(), 5);

    assert_eq!(cluster.resize(8).unwrap(), 8);
    let all: HashSet<i64> = cluster.members().iter().filter_map(|m| m.config(&ROLE_ID)).collect();
    assert_eq!(all.len(), 8);
    assert!(all.contains(&PRIMARY_ROLE_ID));
    assert!(all.iter().filter(|r| **r != PRIMARY_ROLE_ID).all(|r| *r >= 10));
}

#[tokio::test]
async fn test_snapshot_masks_replication_password() {
    let mgmt = context(10);
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster")
            .initial_size(0)
            .flag(REPLICATION_PASSWORD.name(), "s3cret"),
        Arc::new(RecordingExecutor::default()),
    )
    .unwrap();

    let snapshot = cluster.entity().snapshot();
    assert_eq!(
        snapshot.config.get(REPLICATION_PASSWORD.name()),
        Some(&json!(crate::config::REDACTED))
    );
    assert_eq!(snapshot.config.get(REPLICATION_USER.name()), Some(&json!("replicator")));
    assert_eq!(cluster.entity().config(&REPLICATION_PASSWORD).as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn test_follower_wait_shares_one_deadline() {
    let mut config = TopoConfig::default();
    config.cluster.follower_id_floor = 10;
    config.cluster.primary_wait_timeout_seconds = 1;
    let mgmt = Arc::new(ManagementContext::new(config));
    let executor = Arc::new(RecordingExecutor::default());
    let cluster = ReplicatedCluster::create(
        &mgmt,
        ClusterSpec::new("db-cluster").initial_size(2),
        executor.clone(),
    )
    .unwrap();
    let members = cluster.members();
    let (primary, follower) = (members[0].clone(), members[1].clone());

    let started = tokio::time::Instant::now();
    follower.set_attribute(&SERVICE_UP, true);

    // The log file lands late and the position never does
    tokio::time::sleep(Duration::from_millis(700)).await;
    primary.set_attribute(&PRIMARY_LOG_FILE, "bin.000001".to_string());

    let mgmt_ref = Arc::clone(&mgmt);
    let follower_id = follower.id().to_string();
    let find_task = move || {
        mgmt_ref
            .tasks()
            .tasks()
            .into_iter()
            .find(|t| t.name() == CONFIGURE_TASK && t.entity() == Some(follower_id.as_str()))
    };
    assert!(eventually(|| find_task().is_some()).await);
    let task = find_task().unwrap();

    let result = task.join().await;
    assert!(matches!(result, Err(TaskError::Timeout(_))), "{:?}", result);
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(executor.commands_on(follower.id()).is_empty());
    assert_eq!(follower.get_attribute(&FOLLOWER_INITIALIZED), Some(false));
}
