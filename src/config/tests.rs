use super::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NAME: ConfigKey<String> = ConfigKey::new("name", "Display name");
const PORT: ConfigKey<i64> = ConfigKey::new("port", "Listen port").with_default(|| json!(3306));
const HOST: ConfigKey<String> = ConfigKey::new("host", "Host to bind").required();

#[test]
fn test_default_config() {
    let config = TopoConfig::default();
    assert_eq!(config.tasks.worker_count, 8);
    assert_eq!(config.bus.listener_concurrency, 4);
    assert_eq!(config.cluster.follower_id_floor, 10);
    assert_eq!(config.cluster.primary_wait_timeout_seconds, 600);
    assert_eq!(config.cluster.replication_user, "replicator");
}

#[test]
fn test_config_deserialization() {
    let toml = r#"
        [tasks]
        worker_count = 2

        [bus]
        listener_concurrency = 1

        [cluster]
        follower_id_floor = 2
        primary_wait_timeout_seconds = 0
        replication_user = "repl"
    "#;

    let config: TopoConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.tasks.worker_count, 2);
    assert_eq!(config.bus.listener_concurrency, 1);
    assert_eq!(config.cluster.follower_id_floor, 2);
    assert_eq!(config.cluster.primary_wait_timeout(), None);
    assert_eq!(config.cluster.replication_user, "repl");
}

#[test]
fn test_partial_config() {
    // Missing sections use defaults
    let toml = r#"
        [bus]
        listener_concurrency = 16
    "#;

    let config: TopoConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.bus.listener_concurrency, 16);
    assert_eq!(config.tasks.worker_count, 8); // Default
    assert_eq!(config.cluster.follower_id_floor, 10); // Default
}

#[test]
fn test_load_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topo.toml");
    std::fs::write(&path, "[tasks]\nworker_count = 3\n").unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.tasks.worker_count, 3);

    let missing = load_config(dir.path().join("absent.toml"));
    assert!(missing.is_err());
}

#[test]
fn test_bag_merges_defaults_and_keeps_leftovers() {
    let flags = Flags::new()
        .with("host", "db-1")
        .with("displayName", "legacy")
        .with("custom.setting", json!({"a": 1}));

    let bag = ConfigBag::configure(&[NAME.decl(), PORT.decl(), HOST.decl()], flags).unwrap();

    assert_eq!(bag.get(&HOST).as_deref(), Some("db-1"));
    assert_eq!(bag.get(&PORT), Some(3306));
    assert_eq!(bag.get(&NAME), None);
    assert_eq!(bag.leftover().len(), 2);
    assert_eq!(
        bag.raw("custom.setting").and_then(ConfigValue::as_immediate),
        Some(&json!({"a": 1}))
    );
}

#[test]
fn test_bag_rejects_missing_required() {
    let err = ConfigBag::configure(&[HOST.decl()], Flags::new()).unwrap_err();
    assert_eq!(err, ValidationError::MissingRequired("host".into()));

    // Explicit null is the same as absent
    let err =
        ConfigBag::configure(&[HOST.decl()], Flags::new().with("host", Value::Null)).unwrap_err();
    assert_eq!(err, ValidationError::MissingRequired("host".into()));
}

#[test]
fn test_bag_rejects_wrong_type() {
    let err = ConfigBag::configure(&[PORT.decl()], Flags::new().with("port", "not-a-number"))
        .unwrap_err();
    assert!(matches!(err, ValidationError::InvalidType { ref key, .. } if key == "port"));
}

struct Counting(AtomicUsize);

impl ValueSupplier for Counting {
    fn supply(&self) -> Value {
        json!(self.0.fetch_add(1, Ordering::SeqCst) as i64 + 100)
    }
}

#[test]
fn test_supplier_resolved_once_at_bind() {
    let supplier = Arc::new(Counting(AtomicUsize::new(0)));
    let flags = Flags::new().with("port", ConfigValue::supplied(supplier.clone()));

    let bag = ConfigBag::configure(&[PORT.decl()], flags).unwrap();
    assert_eq!(bag.get(&PORT), Some(100));
    assert_eq!(bag.get(&PORT), Some(100));
    assert_eq!(supplier.0.load(Ordering::SeqCst), 1);
}

#[test]
fn test_flags_merge_prefers_explicit() {
    let defaults = Flags::new().with("port", 1i64).with("host", "a");
    let flags = Flags::new().with("port", 2i64).merged_over(&defaults);

    assert_eq!(flags.get("port").and_then(ConfigValue::as_immediate), Some(&json!(2)));
    assert_eq!(flags.get("host").and_then(ConfigValue::as_immediate), Some(&json!("a")));
}

#[test]
fn test_secret_values_masked_in_json() {
    const TOKEN: ConfigKey<String> = ConfigKey::new("api.token", "Access token").secret();
    assert!(TOKEN.is_secret());
    assert!(!HOST.is_secret());

    let flags = Flags::new().with("api.token", "hunter2").with("host", "db-1");
    let bag = ConfigBag::configure(&[TOKEN.decl(), HOST.decl()], flags).unwrap();

    assert_eq!(bag.get(&TOKEN).as_deref(), Some("hunter2"));
    let json = bag.to_json();
    assert_eq!(json.get("api.token"), Some(&json!(REDACTED)));
    assert_eq!(json.get("host"), Some(&json!("db-1")));
}
