use crate::entity::EntityId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct Tables {
    /// group -> members
    members: HashMap<EntityId, BTreeSet<EntityId>>,
    /// member -> groups (reverse index used at publish time)
    groups: HashMap<EntityId, BTreeSet<EntityId>>,
}

/// Ownership-free member relation between container entities and the
/// entities they track.
///
/// One lock guards both directions of the relation. Publishing resolves group
/// scopes under the read side and delivery re-checks membership, so a member
/// removed under the write side is not observed by group listeners afterwards.
#[derive(Default)]
pub struct Membership {
    tables: RwLock<Tables>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` to `group`. Returns the new group size if it changed.
    pub fn add(&self, group: &str, member: &str) -> Option<usize> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let members = tables.members.entry(group.to_string()).or_default();
        if !members.insert(member.to_string()) {
            return None;
        }
        let size = members.len();
        tables
            .groups
            .entry(member.to_string())
            .or_default()
            .insert(group.to_string());
        Some(size)
    }

    /// Remove `member` from `group`. Returns the new group size if it changed.
    pub fn remove(&self, group: &str, member: &str) -> Option<usize> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let members = tables.members.get_mut(group)?;
        if !members.remove(member) {
            return None;
        }
        let size = members.len();
        if let Some(groups) = tables.groups.get_mut(member) {
            groups.remove(group);
            if groups.is_empty() {
                tables.groups.remove(member);
            }
        }
        Some(size)
    }

    pub fn members(&self, group: &str) -> Vec<EntityId> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .members
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn size(&self, group: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.members.get(group).map_or(0, |m| m.len())
    }

    pub fn is_member(&self, group: &str, member: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .members
            .get(group)
            .map_or(false, |m| m.contains(member))
    }

    pub fn groups_of(&self, member: &str) -> BTreeSet<EntityId> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.groups.get(member).cloned().unwrap_or_default()
    }

    /// Drop `entity` from the relation entirely: its own member list (if it
    /// is a group) and its membership in other groups.
    ///
    /// Returns `(group, new_size)` for every group the entity was removed from.
    pub fn forget(&self, entity: &str) -> Vec<(EntityId, usize)> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(members) = tables.members.remove(entity) {
            for member in members {
                if let Some(groups) = tables.groups.get_mut(&member) {
                    groups.remove(entity);
                    if groups.is_empty() {
                        tables.groups.remove(&member);
                    }
                }
            }
        }

        let mut left = Vec::new();
        if let Some(groups) = tables.groups.remove(entity) {
            for group in groups {
                if let Some(members) = tables.members.get_mut(&group) {
                    members.remove(entity);
                    left.push((group, members.len()));
                }
            }
        }
        left
    }
}
