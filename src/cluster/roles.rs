use super::PRIMARY_ROLE_ID;
use crate::config::{ValidationError, ValueSupplier};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out follower role ids from a counter that only moves up.
///
/// Ids of removed followers are never handed out again.
#[derive(Debug)]
pub struct RoleIdAllocator {
    next: AtomicI64,
}

impl RoleIdAllocator {
    pub fn new(floor: i64) -> Result<Self, ValidationError> {
        if floor <= PRIMARY_ROLE_ID {
            return Err(ValidationError::invalid_value(
                "follower_id_floor",
                format!("must be greater than the primary role id {}", PRIMARY_ROLE_ID),
            ));
        }
        Ok(Self {
            next: AtomicI64::new(floor),
        })
    }

    pub fn allocate(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Id the next allocation will return
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl ValueSupplier for RoleIdAllocator {
    fn supply(&self) -> Value {
        Value::from(self.allocate())
    }
}
