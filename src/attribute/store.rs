use crate::entity::EntityId;
use crate::sensor::SensorEvent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// Attribute store for a single entity.
///
/// Reads go straight to the concurrent map and never take the write lock.
/// Every write goes through one serialization point so that store order and
/// publish order agree for a given sensor.
pub struct AttributeStore {
    entity_id: EntityId,

    /// Lock-free concurrent map for fast reads
    values: DashMap<String, Value>,

    /// Single-writer gate; held while storing and handing the event to the bus
    write_lock: Mutex<()>,

    /// Write sequence number (one per set)
    sequence: AtomicU64,

    /// Last write timestamp
    last_updated: RwLock<DateTime<Utc>>,
}

impl AttributeStore {
    pub fn new(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            values: DashMap::new(),
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            last_updated: RwLock::new(Utc::now()),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Last stored value, `None` when the sensor was never set
    pub fn get(&self, sensor: &str) -> Option<Value> {
        self.values.get(sensor).map(|v| v.value().clone())
    }

    /// Point-in-time copy of every stored value
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        *self
            .last_updated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` and hand the resulting event to `publish`.
    ///
    /// The event is produced unconditionally, equal values included.
    pub fn set(
        &self,
        sensor: &str,
        value: Value,
        publish: impl FnOnce(&SensorEvent),
    ) -> SensorEvent {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let event = self.store_locked(sensor, value);
        publish(&event);
        event
    }

    /// Compare-and-set under the write lock.
    ///
    /// `decide` sees the current value and returns the value to store, or
    /// `None` to leave the store untouched (no event is produced).
    pub fn update(
        &self,
        sensor: &str,
        decide: impl FnOnce(Option<&Value>) -> Option<Value>,
        publish: impl FnOnce(&SensorEvent),
    ) -> Option<SensorEvent> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.get(sensor);
        let next = decide(current.as_ref())?;
        let event = self.store_locked(sensor, next);
        publish(&event);
        Some(event)
    }

    fn store_locked(&self, sensor: &str, value: Value) -> SensorEvent {
        let now = Utc::now();

        // Get old value for delta tracking
        let old_value = self.values.insert(sensor.to_string(), value.clone());
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        *self
            .last_updated
            .write()
            .unwrap_or_else(PoisonError::into_inner) = now;

        SensorEvent {
            source: self.entity_id.clone(),
            sensor: sensor.to_string(),
            old_value,
            value,
            timestamp: now,
            sequence,
        }
    }
}
