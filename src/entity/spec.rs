use super::{Effector, Entity, EntityId};
use crate::config::{ConfigKey, Flags, KeyDecl};
use crate::task::Task;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Runs while the entity is initializing. May subscribe, seed derived
/// config and register members; an error aborts creation.
pub type InitHook = Arc<dyn Fn(&Entity) -> anyhow::Result<()> + Send + Sync>;

/// Everything needed to create an entity
#[derive(Clone)]
pub struct EntitySpec {
    pub(crate) display_name: String,
    pub(crate) parent: Option<EntityId>,
    pub(crate) flags: Flags,
    pub(crate) keys: Vec<KeyDecl>,
    pub(crate) tags: Vec<Value>,
    pub(crate) init: Vec<InitHook>,
    pub(crate) effectors: Vec<(String, Effector)>,
}

impl EntitySpec {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            parent: None,
            flags: Flags::new(),
            keys: Vec::new(),
            tags: Vec::new(),
            init: Vec::new(),
            effectors: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: &Entity) -> Self {
        self.parent = Some(parent.id().to_string());
        self
    }

    pub fn parent_id(mut self, parent: impl Into<EntityId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Explicit values; merged over anything already set
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags.merged_over(&self.flags);
        self
    }

    pub fn flag(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::config::ConfigValue>,
    ) -> Self {
        self.flags.insert(key, value);
        self
    }

    /// Declare a recognized key
    pub fn key<T: DeserializeOwned>(mut self, key: &ConfigKey<T>) -> Self {
        self.keys.push(key.decl());
        self
    }

    pub fn keys(mut self, keys: impl IntoIterator<Item = KeyDecl>) -> Self {
        self.keys.extend(keys);
        self
    }

    pub fn tag(mut self, tag: impl Into<Value>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Entity) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.init.push(Arc::new(hook));
        self
    }

    /// Register a named operation; each invocation yields a fresh task
    pub fn effector<F>(mut self, name: impl Into<String>, effector: F) -> Self
    where
        F: Fn(&Entity, Value) -> Task + Send + Sync + 'static,
    {
        self.effectors.push((name.into(), Arc::new(effector)));
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Debug for EntitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySpec")
            .field("display_name", &self.display_name)
            .field("parent", &self.parent)
            .field("flags", &self.flags)
            .field("keys", &self.keys)
            .field("tags", &self.tags)
            .field("init_hooks", &self.init.len())
            .finish()
    }
}
