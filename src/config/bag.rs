use super::keys::{ConfigKey, KeyDecl};
use super::validation::ValidationError;
use crate::entity::Entity;
use crate::sensor::Sensor;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Shown in place of secret values
pub const REDACTED: &str = "<redacted>";

/// Computation producing a configuration value at construction time.
///
/// Resolved exactly once, when the owning entity's flags are bound.
pub trait ValueSupplier: Send + Sync {
    fn supply(&self) -> Value;
}

/// Value whose content is not known when the flag bag is built
#[derive(Clone)]
pub enum Deferred {
    /// Resolved once while binding flags
    Supplier(Arc<dyn ValueSupplier>),
    /// Resolved inside a task, once `sensor` on `entity` holds a value
    WhenReady { entity: Entity, sensor: String },
}

#[derive(Clone)]
pub enum ConfigValue {
    Immediate(Value),
    Deferred(Deferred),
}

impl ConfigValue {
    pub fn supplied(supplier: Arc<dyn ValueSupplier>) -> Self {
        ConfigValue::Deferred(Deferred::Supplier(supplier))
    }

    pub fn when_ready<T>(entity: &Entity, sensor: &Sensor<T>) -> Self {
        ConfigValue::Deferred(Deferred::WhenReady {
            entity: entity.clone(),
            sensor: sensor.name().to_string(),
        })
    }

    pub fn as_immediate(&self) -> Option<&Value> {
        match self {
            ConfigValue::Immediate(v) => Some(v),
            ConfigValue::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ConfigValue::Deferred(_))
    }

    /// Read-only rendering for projections
    pub fn to_json(&self) -> Value {
        match self {
            ConfigValue::Immediate(v) => v.clone(),
            ConfigValue::Deferred(Deferred::Supplier(_)) => Value::String("<supplier>".into()),
            ConfigValue::Deferred(Deferred::WhenReady { entity, sensor }) => {
                Value::String(format!("<when-ready {}/{}>", entity.id(), sensor))
            }
        }
    }
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Immediate(v) => write!(f, "Immediate({})", v),
            ConfigValue::Deferred(_) => write!(f, "Deferred({})", self.to_json()),
        }
    }
}

impl From<Value> for ConfigValue {
    fn from(value: Value) -> Self {
        ConfigValue::Immediate(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Immediate(Value::from(value))
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Immediate(Value::from(value))
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Immediate(Value::from(value))
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Immediate(Value::from(value))
    }
}

/// Flat key -> value bag accepted at construction
#[derive(Clone, Debug, Default)]
pub struct Flags(BTreeMap<String, ConfigValue>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ConfigValue>,
    ) -> Option<ConfigValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Explicit values in `self` win over `defaults`
    pub fn merged_over(mut self, defaults: &Flags) -> Self {
        for (k, v) in &defaults.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    pub fn into_inner(self) -> BTreeMap<String, ConfigValue> {
        self.0
    }
}

impl From<Map<String, Value>> for Flags {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, ConfigValue::Immediate(v))).collect())
    }
}

impl FromIterator<(String, ConfigValue)> for Flags {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Bound configuration of one entity or policy.
///
/// Declared keys are merged over their defaults and type-checked; anything
/// undeclared is kept verbatim in the leftover bag for the next layer.
#[derive(Clone, Debug, Default)]
pub struct ConfigBag {
    values: BTreeMap<String, ConfigValue>,
    leftover: BTreeMap<String, ConfigValue>,
    secrets: BTreeSet<String>,
}

impl ConfigBag {
    /// Bind `flags` against `declared`, failing fast on the first invalid key
    pub fn configure(declared: &[KeyDecl], flags: Flags) -> Result<Self, ValidationError> {
        let mut leftover = flags.into_inner();
        let mut values = BTreeMap::new();
        let secrets = declared
            .iter()
            .filter(|d| d.secret)
            .map(|d| d.name.to_string())
            .collect();

        for decl in declared {
            let value = match leftover.remove(decl.name) {
                Some(ConfigValue::Deferred(Deferred::Supplier(supplier))) => {
                    ConfigValue::Immediate(supplier.supply())
                }
                Some(explicit) => explicit,
                None => match decl.default {
                    Some(default) => ConfigValue::Immediate(default()),
                    None if decl.required => {
                        return Err(ValidationError::MissingRequired(decl.name.to_string()))
                    }
                    None => continue,
                },
            };

            if let ConfigValue::Immediate(v) = &value {
                if v.is_null() {
                    if decl.required {
                        return Err(ValidationError::MissingRequired(decl.name.to_string()));
                    }
                } else if !(decl.accepts)(v) {
                    return Err(ValidationError::InvalidType {
                        key: decl.name.to_string(),
                        expected: decl.type_name.to_string(),
                    });
                }
            }

            values.insert(decl.name.to_string(), value);
        }

        Ok(Self {
            values,
            leftover,
            secrets,
        })
    }

    /// Immediate value of `key`, falling back to the leftover bag and then
    /// to the key's default. Deferred values read as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        match self.raw(key.name()) {
            Some(ConfigValue::Immediate(v)) => key.decode(v),
            Some(ConfigValue::Deferred(_)) => None,
            None => key.default_value().and_then(|v| key.decode(&v)),
        }
    }

    pub fn raw(&self, name: &str) -> Option<&ConfigValue> {
        self.values.get(name).or_else(|| self.leftover.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw(name).is_some()
    }

    pub fn leftover(&self) -> &BTreeMap<String, ConfigValue> {
        &self.leftover
    }

    pub fn take_leftover(&mut self, name: &str) -> Option<ConfigValue> {
        self.leftover.remove(name)
    }

    /// Store a value derived during init
    pub(crate) fn seed(&mut self, name: &str, value: ConfigValue) {
        self.leftover.remove(name);
        self.values.insert(name.to_string(), value);
    }

    /// JSON view with secret keys masked
    pub fn to_json(&self) -> Map<String, Value> {
        self.values
            .iter()
            .chain(self.leftover.iter())
            .map(|(k, v)| {
                let shown = if self.secrets.contains(k) {
                    Value::String(REDACTED.to_string())
                } else {
                    v.to_json()
                };
                (k.clone(), shown)
            })
            .collect()
    }
}
