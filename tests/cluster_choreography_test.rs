use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use topo::cluster::{
    ClusterSpec, ReplicatedCluster, CAPTURE_LOG_POSITION, FOLLOWER_INITIALIZED, PRIMARY_LOG_FILE,
    PRIMARY_LOG_POSITION, REPLICATION_PASSWORD, ROLE_ID,
};
use topo::node::{CommandExecutor, ADDRESS, SERVICE_UP};
use topo::{Entity, ManagementContext, Task, TaskError, TaskStatus, TopoConfig};

/// Records every command and answers the log position capture
#[derive(Default)]
struct RecordingExecutor {
    commands: Mutex<Vec<(String, String)>>,
}

impl RecordingExecutor {
    fn on(&self, node: &Entity) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node.id())
            .map(|(_, command)| command.clone())
            .collect()
    }

    fn change_commands(&self, node: &Entity) -> Vec<String> {
        self.on(node)
            .into_iter()
            .filter(|c| c.starts_with("CHANGE MASTER TO"))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, node: &Entity, command: &str) -> anyhow::Result<String> {
        self.commands
            .lock()
            .unwrap()
            .push((node.id().to_string(), command.to_string()));
        if command == CAPTURE_LOG_POSITION {
            // Give followers a chance to start waiting before the position lands
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Ok("File: bin.000001\nPosition: 4".to_string());
        }
        Ok(String::new())
    }
}

fn management(floor: i64, workers: usize) -> Arc<ManagementContext> {
    let mut config = TopoConfig::default();
    config.cluster.follower_id_floor = floor;
    config.cluster.primary_wait_timeout_seconds = 10;
    config.tasks.worker_count = workers;
    Arc::new(ManagementContext::new(config))
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn start_cluster(
    mgmt: &Arc<ManagementContext>,
    executor: &Arc<RecordingExecutor>,
) -> ReplicatedCluster {
    let cluster = ReplicatedCluster::create(
        mgmt,
        ClusterSpec::new("mysql-cluster").initial_size(3),
        executor.clone(),
    )
    .unwrap();
    for member in cluster.members() {
        member.set_attribute(&ADDRESS, format!("10.0.0.{}", member.config(&ROLE_ID).unwrap()));
    }
    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_up_before_primary() {
    let mgmt = management(2, 2);
    let executor = Arc::new(RecordingExecutor::default());
    let cluster = start_cluster(&mgmt, &executor);

    let members = cluster.members();
    let (primary, followers) = (members[0].clone(), members[1..].to_vec());
    assert_eq!(primary.config(&ROLE_ID), Some(1));
    assert_eq!(
        followers.iter().map(|f| f.config(&ROLE_ID)).collect::<Vec<_>>(),
        vec![Some(2), Some(3)]
    );

    // Followers come up first and hold their tasks waiting on the primary
    for follower in followers.iter().rev() {
        follower.set_attribute(&SERVICE_UP, true);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(followers.iter().all(|f| executor.change_commands(f).is_empty()));

    primary.set_attribute(&SERVICE_UP, true);

    assert!(wait_until(|| followers.iter().all(|f| executor.change_commands(f).len() == 1)).await);
    assert_eq!(primary.get_attribute(&PRIMARY_LOG_FILE).as_deref(), Some("bin.000001"));
    assert_eq!(primary.get_attribute(&PRIMARY_LOG_POSITION), Some(4));

    let password = cluster.entity().config(&REPLICATION_PASSWORD).unwrap();
    for follower in &followers {
        let change = &executor.change_commands(follower)[0];
        assert!(change.contains("MASTER_HOST='10.0.0.1'"));
        assert!(change.contains("MASTER_USER='replicator'"));
        assert!(change.contains(&format!("MASTER_PASSWORD='{}'", password)));
        assert!(change.contains("MASTER_LOG_FILE='bin.000001'"));
        assert!(change.ends_with("MASTER_LOG_POS=4"));
        assert_eq!(follower.get_attribute(&FOLLOWER_INITIALIZED), Some(true));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_up_configures_once() {
    let mgmt = management(2, 4);
    let executor = Arc::new(RecordingExecutor::default());
    let cluster = start_cluster(&mgmt, &executor);
    let members = cluster.members();

    members[0].set_attribute(&SERVICE_UP, true);
    for follower in &members[1..] {
        follower.set_attribute(&SERVICE_UP, true);
        follower.set_attribute(&SERVICE_UP, true);
    }

    assert!(
        wait_until(|| members[1..].iter().all(|f| executor.change_commands(f).len() == 1)).await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    for follower in &members[1..] {
        assert_eq!(executor.change_commands(follower).len(), 1);
    }
    let captures = executor
        .on(&members[0])
        .into_iter()
        .filter(|c| c == CAPTURE_LOG_POSITION)
        .count();
    assert_eq!(captures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_added_after_primary_ready() {
    let mgmt = management(2, 2);
    let executor = Arc::new(RecordingExecutor::default());
    let cluster =
        ReplicatedCluster::create(&mgmt, ClusterSpec::new("late-join"), executor.clone()).unwrap();

    let primary = cluster.primary().unwrap();
    primary.set_attribute(&ADDRESS, "10.0.0.1".to_string());
    primary.set_attribute(&SERVICE_UP, true);
    assert!(wait_until(|| primary.get_attribute(&PRIMARY_LOG_POSITION).is_some()).await);

    let follower = cluster.grow().unwrap();
    assert_eq!(follower.config(&ROLE_ID), Some(2));
    follower.set_attribute(&SERVICE_UP, true);

    assert!(wait_until(|| executor.change_commands(&follower).len() == 1).await);
}

#[tokio::test]
async fn test_cancelled_parent_leaves_children_cancelled() {
    let mgmt = management(2, 1);
    let (tx, rx) = tokio::sync::oneshot::channel();

    let parent = mgmt.tasks().submit(Task::new("parent", move |ctx| async move {
        let mut children = Vec::new();
        for i in 0..3 {
            let child = Task::new(format!("child-{}", i), |_ctx| async { Ok(Value::Null) });
            children.push(ctx.queue(child));
        }
        let _ = tx.send(children);
        ctx.cancelled().await;
        Err::<Value, _>(TaskError::Cancelled)
    }));

    let children = rx.await.unwrap();
    parent.cancel();

    assert!(matches!(parent.join().await, Err(TaskError::Cancelled)));
    for child in &children {
        assert_eq!(child.status(), TaskStatus::Cancelled);
        assert!(matches!(child.join().await, Err(TaskError::Cancelled)));
    }
}

#[tokio::test]
async fn test_resize_effector_returns_handle() {
    let mgmt = management(10, 2);
    let executor = Arc::new(RecordingExecutor::default());
    let cluster =
        ReplicatedCluster::create(&mgmt, ClusterSpec::new("resizable"), executor).unwrap();

    let handle = mgmt.invoke(cluster.id(), "resize", json!({"desired_size": 4})).unwrap();
    assert_eq!(handle.join().await, Ok(json!(4)));

    let roles: Vec<_> = cluster.members().iter().map(|m| m.config(&ROLE_ID).unwrap()).collect();
    assert_eq!(roles, vec![1, 10, 11, 12]);

    let handle = mgmt.invoke(cluster.id(), "resize", json!(1)).unwrap();
    assert_eq!(handle.join().await, Ok(json!(1)));
    assert_eq!(
        cluster.primary().map(|p| p.id().to_string()),
        cluster.entity().members().first().cloned()
    );
}
