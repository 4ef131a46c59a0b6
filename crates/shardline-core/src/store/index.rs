//! A single undoable object index
//!
//! Rows live in an id-keyed map; an object is always addressed by its
//! `ObjectId`, never by a reference held across mutations. A unique key map
//! mirrors the rows and is restored together with them on undo.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::ops::RangeBounds;

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Stable row handle. Valid until that exact row is removed, or its
/// creation is undone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row type storable in an `Index`
pub trait ChainObject: Clone + Default + fmt::Debug {
    const TYPE_NAME: &'static str;

    /// Unique secondary key
    type Key: Ord + Clone + fmt::Debug;

    fn id(&self) -> ObjectId;
    fn set_id(&mut self, id: ObjectId);
    fn key(&self) -> Self::Key;
}

/// Changes recorded by one undo session on one index
#[derive(Debug, Clone)]
pub struct UndoState<T> {
    /// Prior value of rows modified in this session
    pub old_values: BTreeMap<ObjectId, T>,
    /// Full value of rows removed in this session
    pub removed_values: BTreeMap<ObjectId, T>,
    /// Rows created in this session
    pub new_ids: BTreeSet<ObjectId>,
    pub old_next_id: u64,
    pub revision: i64,
}

impl<T> UndoState<T> {
    fn new(old_next_id: u64, revision: i64) -> Self {
        Self {
            old_values: BTreeMap::new(),
            removed_values: BTreeMap::new(),
            new_ids: BTreeSet::new(),
            old_next_id,
            revision,
        }
    }
}

pub struct Index<T: ChainObject> {
    rows: BTreeMap<ObjectId, T>,
    by_key: BTreeMap<T::Key, ObjectId>,
    next_id: u64,
    stack: VecDeque<UndoState<T>>,
    revision: i64,
}

impl<T: ChainObject> Default for Index<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_key: BTreeMap::new(),
            next_id: 0,
            stack: VecDeque::new(),
            revision: 0,
        }
    }
}

impl<T: ChainObject> Index<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        self.rows.get(&id)
    }

    pub fn find(&self, key: &T::Key) -> Option<&T> {
        self.by_key.get(key).and_then(|id| self.rows.get(id))
    }

    pub fn find_id(&self, key: &T::Key) -> Option<ObjectId> {
        self.by_key.get(key).copied()
    }

    /// Rows in creation order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    /// Rows whose key falls in `range`, in key order
    pub fn range(&self, range: impl RangeBounds<T::Key>) -> impl Iterator<Item = &T> {
        self.by_key
            .range(range)
            .filter_map(|(_, id)| self.rows.get(id))
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn undo_stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn last_undo_state(&self) -> Option<&UndoState<T>> {
        self.stack.back()
    }

    // ── Mutation ───────────────────────────────────────

    pub fn create(&mut self, init: impl FnOnce(&mut T)) -> Result<ObjectId, StoreError> {
        let id = ObjectId(self.next_id);
        let mut obj = T::default();
        init(&mut obj);
        obj.set_id(id);
        let key = obj.key();
        if self.by_key.contains_key(&key) {
            return Err(StoreError::UniqueConstraint {
                type_name: T::TYPE_NAME,
                key: format!("{:?}", key),
            });
        }
        self.by_key.insert(key, id);
        self.rows.insert(id, obj);
        self.next_id += 1;
        if let Some(head) = self.stack.back_mut() {
            head.new_ids.insert(id);
        }
        Ok(id)
    }

    /// Apply `f` to a copy of the row and swap it in. A key change that
    /// collides with another row leaves the index untouched.
    pub fn modify(&mut self, id: ObjectId, f: impl FnOnce(&mut T)) -> Result<(), StoreError> {
        let old = self.rows.get(&id).ok_or(StoreError::NotFound {
            type_name: T::TYPE_NAME,
            id,
        })?;
        let mut updated = old.clone();
        f(&mut updated);
        updated.set_id(id);

        let old_key = old.key();
        let new_key = updated.key();
        if old_key != new_key {
            if self.by_key.contains_key(&new_key) {
                return Err(StoreError::UniqueConstraint {
                    type_name: T::TYPE_NAME,
                    key: format!("{:?}", new_key),
                });
            }
            self.by_key.remove(&old_key);
            self.by_key.insert(new_key, id);
        }

        let previous = std::mem::replace(
            self.rows.get_mut(&id).ok_or(StoreError::NotFound {
                type_name: T::TYPE_NAME,
                id,
            })?,
            updated,
        );
        if let Some(head) = self.stack.back_mut() {
            if !head.new_ids.contains(&id) && !head.old_values.contains_key(&id) {
                head.old_values.insert(id, previous);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, id: ObjectId) -> Result<T, StoreError> {
        let obj = self.rows.remove(&id).ok_or(StoreError::NotFound {
            type_name: T::TYPE_NAME,
            id,
        })?;
        self.by_key.remove(&obj.key());
        if let Some(head) = self.stack.back_mut() {
            if head.new_ids.remove(&id) {
                return Ok(obj);
            }
            if let Some(original) = head.old_values.remove(&id) {
                head.removed_values.insert(id, original);
                return Ok(obj);
            }
            head.removed_values.insert(id, obj.clone());
        }
        Ok(obj)
    }

    // ── Undo stack ─────────────────────────────────────

    pub(crate) fn start_undo_session(&mut self) {
        self.revision += 1;
        self.stack
            .push_back(UndoState::new(self.next_id, self.revision));
    }

    /// Restore the state before the most recent session and pop it
    pub(crate) fn undo(&mut self) {
        let Some(head) = self.stack.pop_back() else {
            return;
        };

        for id in &head.new_ids {
            if let Some(obj) = self.rows.remove(id) {
                self.unlink_key(&obj.key(), *id);
            }
        }
        for id in head.old_values.keys() {
            if let Some(current) = self.rows.get(id) {
                let key = current.key();
                self.unlink_key(&key, *id);
            }
        }
        for (id, old) in head.old_values {
            self.by_key.insert(old.key(), id);
            self.rows.insert(id, old);
        }
        for (id, removed) in head.removed_values {
            self.by_key.insert(removed.key(), id);
            self.rows.insert(id, removed);
        }

        self.next_id = head.old_next_id;
        self.revision -= 1;
    }

    fn unlink_key(&mut self, key: &T::Key, id: ObjectId) {
        if self.by_key.get(key) == Some(&id) {
            self.by_key.remove(key);
        }
    }

    /// Fold the most recent session into the one below it
    pub(crate) fn squash(&mut self) {
        if self.stack.len() < 2 {
            if self.stack.pop_back().is_some() {
                self.revision -= 1;
            }
            return;
        }
        let Some(state) = self.stack.pop_back() else {
            return;
        };
        let Some(prev) = self.stack.back_mut() else {
            return;
        };

        for (id, old) in state.old_values {
            // new + modify stays new; modify + modify keeps the older value
            if prev.new_ids.contains(&id) || prev.old_values.contains_key(&id) {
                continue;
            }
            prev.old_values.insert(id, old);
        }

        prev.new_ids.extend(state.new_ids);

        for (id, removed) in state.removed_values {
            // new + remove cancels out
            if prev.new_ids.remove(&id) {
                continue;
            }
            // modify + remove restores the pre-modify value
            if let Some(original) = prev.old_values.remove(&id) {
                prev.removed_values.insert(id, original);
                continue;
            }
            prev.removed_values.insert(id, removed);
        }

        self.revision -= 1;
    }

    /// Forget undo history at or below `revision`
    pub(crate) fn commit(&mut self, revision: i64) {
        while self
            .stack
            .front()
            .is_some_and(|state| state.revision <= revision)
        {
            self.stack.pop_front();
        }
    }

    pub(crate) fn set_revision(&mut self, revision: i64) -> Result<(), StoreError> {
        if !self.stack.is_empty() {
            return Err(StoreError::RevisionWithUndoStack);
        }
        self.revision = revision;
        Ok(())
    }
}
