//! Scope guards over undo sessions

use std::ops::{Deref, DerefMut};

use super::database::Database;
use super::manager::DatabaseManager;
use super::StoreError;
use crate::name::Name;

/// Guard over one undo session of a single `Database`.
///
/// Dropping the guard reverts the session unless `push` or `squash` was
/// called first; this covers early returns and `?` unwinding.
pub struct Session<'a> {
    db: &'a mut Database,
    apply: bool,
    revision: i64,
}

impl<'a> Session<'a> {
    pub(super) fn new(db: &'a mut Database, apply: bool) -> Self {
        let revision = db.revision();
        Self { db, apply, revision }
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Keep the changes on the undo stack and release the guard
    pub fn push(mut self) {
        self.apply = false;
    }

    /// Merge the changes into the enclosing session
    pub fn squash(mut self) {
        if self.apply {
            self.db.squash();
        }
        self.apply = false;
    }

    /// Revert the changes now
    pub fn undo(mut self) {
        if self.apply {
            self.db.undo();
        }
        self.apply = false;
    }
}

impl Deref for Session<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        &*self.db
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        &mut *self.db
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.apply {
            self.db.undo();
        }
    }
}

/// Guard over one transaction's session, opened on every tier.
///
/// `shard` names the tier the transaction writes to; all tiers are pushed,
/// squashed or undone together so their revisions never drift apart.
pub struct TieredSession<'a> {
    dbm: &'a mut DatabaseManager,
    shard: Name,
    apply: bool,
}

impl<'a> TieredSession<'a> {
    pub(super) fn new(
        dbm: &'a mut DatabaseManager,
        shard: Name,
        apply: bool,
    ) -> Result<Self, StoreError> {
        dbm.db(shard)?;
        if apply {
            for db in dbm.tiers_mut() {
                db.push_undo_state();
            }
        }
        Ok(Self { dbm, shard, apply })
    }

    pub fn shard(&self) -> Name {
        self.shard
    }

    pub fn push(mut self) {
        self.apply = false;
    }

    pub fn squash(mut self) {
        if self.apply {
            self.for_each_tier(Database::squash);
        }
        self.apply = false;
    }

    pub fn undo(mut self) {
        if self.apply {
            self.for_each_tier(Database::undo);
        }
        self.apply = false;
    }

    fn for_each_tier(&mut self, op: fn(&mut Database)) {
        for db in self.dbm.tiers_mut() {
            op(db);
        }
    }
}

impl Deref for TieredSession<'_> {
    type Target = DatabaseManager;

    fn deref(&self) -> &DatabaseManager {
        &*self.dbm
    }
}

impl DerefMut for TieredSession<'_> {
    fn deref_mut(&mut self) -> &mut DatabaseManager {
        &mut *self.dbm
    }
}

impl Drop for TieredSession<'_> {
    fn drop(&mut self) {
        if self.apply {
            self.for_each_tier(Database::undo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::AccountObject;

    fn n(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn test_drop_undoes() {
        let mut db = Database::new();
        {
            let mut session = db.start_undo_session(true);
            session
                .create::<AccountObject>(|a| a.name = n("alice"))
                .unwrap();
            assert_eq!(session.len::<AccountObject>(), 1);
        }
        assert_eq!(db.len::<AccountObject>(), 0);
        assert_eq!(db.undo_stack_len(), 0);
    }

    #[test]
    fn test_push_keeps_changes_undoable() {
        let mut db = Database::new();
        let session = db.start_undo_session(true);
        assert_eq!(session.revision(), 1);
        session.push();
        db.create::<AccountObject>(|a| a.name = n("alice")).unwrap();
        assert_eq!(db.undo_stack_len(), 1);
        db.undo();
        assert_eq!(db.len::<AccountObject>(), 0);
    }

    #[test]
    fn test_disabled_session_is_inert() {
        let mut db = Database::new();
        {
            let mut session = db.start_undo_session(false);
            session
                .create::<AccountObject>(|a| a.name = n("alice"))
                .unwrap();
        }
        assert_eq!(db.len::<AccountObject>(), 1);
        assert_eq!(db.revision(), 0);
    }

    #[test]
    fn test_nested_sessions() {
        let mut db = Database::new();
        let mut outer = db.start_undo_session(true);
        let x = outer
            .create::<AccountObject>(|a| a.name = n("x"))
            .unwrap();
        {
            let mut inner = outer.start_undo_session(true);
            inner.create::<AccountObject>(|a| a.name = n("y")).unwrap();
            inner.undo();
        }
        assert!(outer.get::<AccountObject>(x).is_ok());
        assert!(outer.find::<AccountObject>(&n("y")).is_none());
        outer.undo();
        assert!(db.find::<AccountObject>(&n("x")).is_none());
    }

    #[test]
    fn test_squash_into_parent() {
        let mut db = Database::new();
        let mut outer = db.start_undo_session(true);
        {
            let mut inner = outer.start_undo_session(true);
            inner.create::<AccountObject>(|a| a.name = n("y")).unwrap();
            inner.squash();
        }
        assert!(outer.find::<AccountObject>(&n("y")).is_some());
        assert_eq!(outer.undo_stack_len(), 1);
        drop(outer);
        assert!(db.find::<AccountObject>(&n("y")).is_none());
    }
}
