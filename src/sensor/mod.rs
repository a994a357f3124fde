use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// Typed, named slot in an entity's attribute store.
///
/// Sensors are plain declarations: the same sensor may be published by any
/// number of entities, uniqueness only holds inside one entity's store.
/// Values travel as JSON, `T` only drives encoding and decoding at the edges.
pub struct Sensor<T> {
    name: &'static str,
    description: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Sensor<T> {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Declared type of the sensor (e.g. "alloc::string::String")
    pub fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<T: Serialize> Sensor<T> {
    pub(crate) fn encode(&self, value: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(value)
    }
}

impl<T: DeserializeOwned> Sensor<T> {
    /// Decode a stored value. `null` is the unset marker and never decodes.
    pub fn decode(&self, value: &Value) -> Option<T> {
        if value.is_null() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl<T> Clone for Sensor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Sensor<T> {}

impl<T> fmt::Debug for Sensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("name", &self.name)
            .field("type", &self.type_name())
            .finish()
    }
}

impl<T> fmt::Display for Sensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Sensor change delivered to subscribers.
///
/// Emitted on every explicit set, including sets that store a value equal
/// to the previous one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorEvent {
    pub source: EntityId,
    pub sensor: String,
    pub old_value: Option<Value>,
    pub value: Value,
    pub timestamp: DateTime<Utc>,

    /// Per-entity write sequence, increases by one for every set
    pub sequence: u64,
}

impl SensorEvent {
    /// Decode the new value as `T`, `None` if unset or of another shape
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        if self.value.is_null() {
            return None;
        }
        serde_json::from_value(self.value.clone()).ok()
    }

    pub fn is<T>(&self, sensor: &Sensor<T>) -> bool {
        self.sensor == sensor.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOG_FILE: Sensor<String> = Sensor::new("test.log_file", "Binary log file");

    #[test]
    fn test_sensor_declaration() {
        assert_eq!(LOG_FILE.name(), "test.log_file");
        assert_eq!(LOG_FILE.description(), "Binary log file");
        assert!(LOG_FILE.type_name().ends_with("String"));
        assert_eq!(LOG_FILE.to_string(), "test.log_file");
    }

    #[test]
    fn test_null_is_unset() {
        assert_eq!(LOG_FILE.decode(&Value::Null), None);
        assert_eq!(LOG_FILE.decode(&json!("bin.000001")), Some("bin.000001".to_string()));
        assert_eq!(LOG_FILE.decode(&json!(4)), None);
    }

    #[test]
    fn test_event_value_as() {
        let event = SensorEvent {
            source: "e1".to_string(),
            sensor: "test.position".to_string(),
            old_value: None,
            value: json!(4),
            timestamp: Utc::now(),
            sequence: 1,
        };
        assert_eq!(event.value_as::<i64>(), Some(4));
        assert_eq!(event.value_as::<String>(), None);
        assert!(!event.is(&LOG_FILE));
    }
}
