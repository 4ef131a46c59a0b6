//! One tier of the object store: a fixed set of typed indices sharing a
//! single undo stack

use std::ops::RangeBounds;

use tracing::trace;

use super::index::{ChainObject, Index, ObjectId};
use super::session::Session;
use super::StoreError;
use crate::objects::{
    AccountMetadataObject, AccountObject, DynamicGlobalPropertyObject, GeneratedTransactionObject,
    KeyValueObject, PermissionObject, RamCorrectionObject,
};

/// Access to the index holding `T`
pub trait HasIndex<T: ChainObject> {
    fn index(&self) -> &Index<T>;
    fn index_mut(&mut self) -> &mut Index<T>;
}

/// Undo-stack operations common to every index
trait UndoIndex {
    fn start_undo_session(&mut self);
    fn undo(&mut self);
    fn squash(&mut self);
    fn commit(&mut self, revision: i64);
    fn set_revision(&mut self, revision: i64) -> Result<(), StoreError>;
}

impl<T: ChainObject> UndoIndex for Index<T> {
    fn start_undo_session(&mut self) {
        Index::start_undo_session(self)
    }

    fn undo(&mut self) {
        Index::undo(self)
    }

    fn squash(&mut self) {
        Index::squash(self)
    }

    fn commit(&mut self, revision: i64) {
        Index::commit(self, revision)
    }

    fn set_revision(&mut self, revision: i64) -> Result<(), StoreError> {
        Index::set_revision(self, revision)
    }
}

#[derive(Default)]
pub struct Database {
    accounts: Index<AccountObject>,
    account_metadata: Index<AccountMetadataObject>,
    permissions: Index<PermissionObject>,
    generated_transactions: Index<GeneratedTransactionObject>,
    global_properties: Index<DynamicGlobalPropertyObject>,
    ram_corrections: Index<RamCorrectionObject>,
    key_values: Index<KeyValueObject>,
    revision: i64,
    undo_depth: usize,
}

macro_rules! has_index {
    ($ty:ty, $field:ident) => {
        impl HasIndex<$ty> for Database {
            fn index(&self) -> &Index<$ty> {
                &self.$field
            }

            fn index_mut(&mut self) -> &mut Index<$ty> {
                &mut self.$field
            }
        }
    };
}

has_index!(AccountObject, accounts);
has_index!(AccountMetadataObject, account_metadata);
has_index!(PermissionObject, permissions);
has_index!(GeneratedTransactionObject, generated_transactions);
has_index!(DynamicGlobalPropertyObject, global_properties);
has_index!(RamCorrectionObject, ram_corrections);
has_index!(KeyValueObject, key_values);

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    fn undo_indices(&mut self) -> [&mut dyn UndoIndex; 7] {
        [
            &mut self.accounts,
            &mut self.account_metadata,
            &mut self.permissions,
            &mut self.generated_transactions,
            &mut self.global_properties,
            &mut self.ram_corrections,
            &mut self.key_values,
        ]
    }

    // ── Rows ───────────────────────────────────────────

    pub fn create<T: ChainObject>(&mut self, init: impl FnOnce(&mut T)) -> Result<ObjectId, StoreError>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index_mut(self).create(init)
    }

    pub fn get<T: ChainObject>(&self, id: ObjectId) -> Result<&T, StoreError>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self)
            .get(id)
            .ok_or(StoreError::NotFound {
                type_name: T::TYPE_NAME,
                id,
            })
    }

    pub fn find<T: ChainObject>(&self, key: &T::Key) -> Option<&T>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).find(key)
    }

    /// Row handle for `key`
    pub fn find_by_key<T: ChainObject>(&self, key: &T::Key) -> Option<ObjectId>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).find_id(key)
    }

    /// Like `find`, failing when the key is absent
    pub fn get_by_key<T: ChainObject>(&self, key: &T::Key) -> Result<&T, StoreError>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).find(key).ok_or_else(|| StoreError::KeyNotFound {
            type_name: T::TYPE_NAME,
            key: format!("{:?}", key),
        })
    }

    pub fn modify<T: ChainObject>(
        &mut self,
        id: ObjectId,
        f: impl FnOnce(&mut T),
    ) -> Result<(), StoreError>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index_mut(self).modify(id, f)
    }

    pub fn remove<T: ChainObject>(&mut self, id: ObjectId) -> Result<T, StoreError>
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index_mut(self).remove(id)
    }

    /// Rows of `T` in creation order
    pub fn walk<'a, T: ChainObject + 'a>(&'a self) -> impl Iterator<Item = &'a T> + 'a
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).iter()
    }

    /// Rows of `T` whose key falls in `range`, in key order
    pub fn range<'a, T: ChainObject + 'a>(
        &'a self,
        range: impl RangeBounds<T::Key> + 'a,
    ) -> impl Iterator<Item = &'a T> + 'a
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).range(range)
    }

    pub fn len<T: ChainObject>(&self) -> usize
    where
        Self: HasIndex<T>,
    {
        HasIndex::<T>::index(self).len()
    }

    // ── Undo sessions ──────────────────────────────────

    /// Open a session. A disabled session records nothing and its guard
    /// has no effect.
    pub fn start_undo_session(&mut self, enabled: bool) -> Session<'_> {
        if enabled {
            self.push_undo_state();
        }
        Session::new(self, enabled)
    }

    pub(crate) fn push_undo_state(&mut self) {
        for index in self.undo_indices() {
            index.start_undo_session();
        }
        self.revision += 1;
        self.undo_depth += 1;
        trace!(revision = self.revision, "undo session started");
    }

    /// Revert the most recent session
    pub fn undo(&mut self) {
        if self.undo_depth == 0 {
            return;
        }
        for index in self.undo_indices() {
            index.undo();
        }
        self.revision -= 1;
        self.undo_depth -= 1;
        trace!(revision = self.revision, "undo session reverted");
    }

    /// Merge the most recent session into its parent
    pub fn squash(&mut self) {
        if self.undo_depth == 0 {
            return;
        }
        for index in self.undo_indices() {
            index.squash();
        }
        self.revision -= 1;
        self.undo_depth -= 1;
        trace!(revision = self.revision, "undo session squashed");
    }

    /// Revert every open session
    pub fn undo_all(&mut self) {
        while self.undo_depth > 0 {
            self.undo();
        }
    }

    /// Make every revision at or below `revision` irreversible
    pub fn commit(&mut self, revision: i64) {
        for index in self.undo_indices() {
            index.commit(revision);
        }
        let first_open = self.revision - self.undo_depth as i64 + 1;
        if revision >= first_open {
            let dropped = (revision.min(self.revision) - first_open + 1) as usize;
            self.undo_depth -= dropped;
        }
        trace!(revision, "undo history committed");
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: i64) -> Result<(), StoreError> {
        if self.undo_depth > 0 {
            return Err(StoreError::RevisionWithUndoStack);
        }
        for index in self.undo_indices() {
            index.set_revision(revision)?;
        }
        self.revision = revision;
        Ok(())
    }

    /// Number of sessions that can still be undone
    pub fn undo_stack_len(&self) -> usize {
        self.undo_depth
    }
}
