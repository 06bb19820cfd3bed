//! Handle Registry
//!
//! Stable, copyable identifiers for every record in a sketch, and the
//! insertion-ordered registry that stores records by handle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Identifier of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

/// Identifier of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

/// Identifier of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{:03}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{:03}", self.0)
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{:03}", self.0)
    }
}

/// What produced an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityOrigin {
    /// Expanded from a user request
    Request(RequestId),
    /// Fixed entities a group always creates (e.g. its workplane)
    Predefined(GroupId),
    /// Produced by a group's transform; the index is a remap slot
    Derived(GroupId),
}

/// Identifier of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub origin: EntityOrigin,
    pub index: u32,
}

impl EntityId {
    /// Entity `index` of a request
    pub const fn request(request: RequestId, index: u32) -> Self {
        Self {
            origin: EntityOrigin::Request(request),
            index,
        }
    }

    /// Predefined entity `index` of a group
    pub const fn predefined(group: GroupId, index: u32) -> Self {
        Self {
            origin: EntityOrigin::Predefined(group),
            index,
        }
    }

    /// Derived entity stored in remap slot `slot` of a group
    pub const fn derived(group: GroupId, slot: u32) -> Self {
        Self {
            origin: EntityOrigin::Derived(group),
            index: slot,
        }
    }

    /// The request this entity was expanded from, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self.origin {
            EntityOrigin::Request(r) => Some(r),
            _ => None,
        }
    }

    /// Check if this entity comes from a request
    pub fn is_from_request(&self) -> bool {
        matches!(self.origin, EntityOrigin::Request(_))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            EntityOrigin::Request(r) => write!(f, "{}.e{}", r, self.index),
            EntityOrigin::Predefined(g) => write!(f, "{}.p{}", g, self.index),
            EntityOrigin::Derived(g) => write!(f, "{}.d{}", g, self.index),
        }
    }
}

/// Who owns a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamOwner {
    Request(RequestId),
    Group(GroupId),
    Constraint(ConstraintId),
}

/// Identifier of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId {
    pub owner: ParamOwner,
    pub index: u32,
}

impl ParamId {
    pub const fn request(request: RequestId, index: u32) -> Self {
        Self {
            owner: ParamOwner::Request(request),
            index,
        }
    }

    pub const fn group(group: GroupId, index: u32) -> Self {
        Self {
            owner: ParamOwner::Group(group),
            index,
        }
    }

    pub const fn constraint(constraint: ConstraintId, index: u32) -> Self {
        Self {
            owner: ParamOwner::Constraint(constraint),
            index,
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            ParamOwner::Request(r) => write!(f, "{}.p{}", r, self.index),
            ParamOwner::Group(g) => write!(f, "{}.p{}", g, self.index),
            ParamOwner::Constraint(c) => write!(f, "{}.p{}", c, self.index),
        }
    }
}

/// Who owns an equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EquationOwner {
    Constraint(ConstraintId),
    Entity(EntityId),
    Group(GroupId),
}

/// Identifier of an equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EquationId {
    pub owner: EquationOwner,
    pub index: u32,
}

impl EquationId {
    pub const fn constraint(constraint: ConstraintId, index: u32) -> Self {
        Self {
            owner: EquationOwner::Constraint(constraint),
            index,
        }
    }

    pub const fn entity(entity: EntityId, index: u32) -> Self {
        Self {
            owner: EquationOwner::Entity(entity),
            index,
        }
    }

    pub const fn group(group: GroupId, index: u32) -> Self {
        Self {
            owner: EquationOwner::Group(group),
            index,
        }
    }

    /// The constraint that produced this equation, if any
    pub fn constraint_id(&self) -> Option<ConstraintId> {
        match self.owner {
            EquationOwner::Constraint(c) => Some(c),
            _ => None,
        }
    }
}

/// A record that is stored in a [`Registry`] under its own handle
pub trait Keyed {
    type Key: Copy + Eq + Hash + fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// Insertion-ordered store with handle lookup
///
/// Records keep the order they were inserted in; lookups by handle go
/// through a side index. Keys must not be changed through `iter_mut`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    from = "Vec<T>",
    into = "Vec<T>",
    bound(
        serialize = "T: Serialize + Clone",
        deserialize = "T: Deserialize<'de>"
    )
)]
pub struct Registry<T: Keyed> {
    items: Vec<T>,
    index: HashMap<T::Key, usize>,
}

impl<T: Keyed> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.index.contains_key(&key)
    }

    pub fn get(&self, key: T::Key) -> Option<&T> {
        self.index.get(&key).map(|&i| &self.items[i])
    }

    pub fn get_mut(&mut self, key: T::Key) -> Option<&mut T> {
        match self.index.get(&key) {
            Some(&i) => Some(&mut self.items[i]),
            None => None,
        }
    }

    /// Position of a record in insertion order
    pub fn position(&self, key: T::Key) -> Option<usize> {
        self.index.get(&key).copied()
    }

    /// Insert a record, replacing (in place) any record with the same key
    pub fn insert(&mut self, item: T) -> Option<T> {
        let key = item.key();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.items[i], item)),
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
                None
            }
        }
    }

    /// Remove a record, keeping the order of the others
    pub fn remove(&mut self, key: T::Key) -> Option<T> {
        let i = self.index.remove(&key)?;
        let item = self.items.remove(i);
        for (pos, other) in self.items.iter().enumerate().skip(i) {
            self.index.insert(other.key(), pos);
        }
        Some(item)
    }

    /// Keep only the records matching the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.items.retain(|item| keep(item));
        self.reindex();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = T::Key> + '_ {
        self.items.iter().map(|item| item.key())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key(), i))
            .collect();
    }
}

impl<T: Keyed> From<Vec<T>> for Registry<T> {
    fn from(items: Vec<T>) -> Self {
        let mut registry = Self {
            items,
            index: HashMap::new(),
        };
        registry.reindex();
        registry
    }
}

impl<T: Keyed> From<Registry<T>> for Vec<T> {
    fn from(registry: Registry<T>) -> Self {
        registry.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: RequestId,
        name: &'static str,
    }

    impl Keyed for Item {
        type Key = RequestId;

        fn key(&self) -> RequestId {
            self.id
        }
    }

    fn item(id: u32, name: &'static str) -> Item {
        Item {
            id: RequestId(id),
            name,
        }
    }

    #[test]
    fn test_insertion_order_and_lookup() {
        let mut registry = Registry::new();
        registry.insert(item(7, "a"));
        registry.insert(item(3, "b"));
        registry.insert(item(5, "c"));

        let names: Vec<_> = registry.iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(registry.get(RequestId(3)).unwrap().name, "b");
        assert_eq!(registry.position(RequestId(5)), Some(2));
    }

    #[test]
    fn test_remove_reindexes_tail() {
        let mut registry = Registry::new();
        registry.insert(item(1, "a"));
        registry.insert(item(2, "b"));
        registry.insert(item(3, "c"));

        assert_eq!(registry.remove(RequestId(1)).unwrap().name, "a");
        assert!(registry.get(RequestId(1)).is_none());
        assert_eq!(registry.get(RequestId(3)).unwrap().name, "c");
        assert_eq!(registry.position(RequestId(3)), Some(1));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut registry = Registry::new();
        registry.insert(item(1, "a"));
        registry.insert(item(2, "b"));
        let old = registry.insert(item(1, "z"));

        assert_eq!(old.unwrap().name, "a");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.iter().next().unwrap().name, "z");
    }

    #[test]
    fn test_retain() {
        let mut registry = Registry::new();
        for i in 0..6 {
            registry.insert(item(i, "x"));
        }
        registry.retain(|item| item.id.0 % 2 == 0);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.position(RequestId(4)), Some(2));
    }

    #[test]
    fn test_entity_id_display() {
        let e = EntityId::request(RequestId(4), 2);
        assert_eq!(e.to_string(), "r004.e2");
        assert_eq!(e.request_id(), Some(RequestId(4)));
        assert!(!EntityId::derived(GroupId(1), 9).is_from_request());
    }
}
