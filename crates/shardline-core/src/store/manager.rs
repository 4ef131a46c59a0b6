//! Shared, main and per-shard tiers

use std::collections::BTreeMap;

use tracing::debug;

use super::database::Database;
use super::index::ObjectId;
use super::session::TieredSession;
use super::StoreError;
use crate::config::MAIN_SHARD;
use crate::name::Name;
use crate::objects::AccountObject;
use crate::types::TimePoint;

/// Owner of every store tier.
///
/// The shared tier holds cross-shard identity (accounts, permissions); each
/// shard tier holds shard-local state. Nothing written to a shard tier is
/// visible from another shard unless mirrored into the shared tier.
///
/// Tiered sessions open, undo, squash and commit on every tier at once, so
/// all tiers share one revision number.
#[derive(Default)]
pub struct DatabaseManager {
    shared: Database,
    main: Database,
    shards: BTreeMap<Name, Database>,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_db(&self) -> &Database {
        &self.shared
    }

    pub fn shared_db_mut(&mut self) -> &mut Database {
        &mut self.shared
    }

    pub fn main_db(&self) -> &Database {
        &self.main
    }

    pub fn main_db_mut(&mut self) -> &mut Database {
        &mut self.main
    }

    /// Register a new shard tier.
    ///
    /// The new tier joins at the current revision with one empty session
    /// per open tiered session.
    pub fn add_shard(&mut self, name: Name) -> Result<(), StoreError> {
        if name == MAIN_SHARD || self.shards.contains_key(&name) {
            return Err(StoreError::ShardExists(name));
        }
        let depth = self.shared.undo_stack_len();
        let mut db = Database::new();
        db.set_revision(self.shared.revision() - depth as i64)?;
        for _ in 0..depth {
            db.push_undo_state();
        }
        self.shards.insert(name, db);
        debug!(shard = %name, revision = self.shared.revision(), "shard added");
        Ok(())
    }

    pub fn has_shard(&self, name: Name) -> bool {
        name == MAIN_SHARD || self.shards.contains_key(&name)
    }

    /// Names of the non-main shards
    pub fn shard_names(&self) -> impl Iterator<Item = Name> + '_ {
        self.shards.keys().copied()
    }

    /// A registered non-main shard
    pub fn shard_db(&self, name: Name) -> Result<&Database, StoreError> {
        self.shards.get(&name).ok_or(StoreError::UnknownShard(name))
    }

    pub fn shard_db_mut(&mut self, name: Name) -> Result<&mut Database, StoreError> {
        self.shards
            .get_mut(&name)
            .ok_or(StoreError::UnknownShard(name))
    }

    /// Tier for `shard`, the main tier included
    pub fn db(&self, shard: Name) -> Result<&Database, StoreError> {
        if shard == MAIN_SHARD {
            Ok(&self.main)
        } else {
            self.shard_db(shard)
        }
    }

    pub fn db_mut(&mut self, shard: Name) -> Result<&mut Database, StoreError> {
        if shard == MAIN_SHARD {
            Ok(&mut self.main)
        } else {
            self.shard_db_mut(shard)
        }
    }

    /// Every tier: shared, main, then the shards in name order
    pub(crate) fn tiers_mut(&mut self) -> impl Iterator<Item = &mut Database> + '_ {
        std::iter::once(&mut self.shared)
            .chain(std::iter::once(&mut self.main))
            .chain(self.shards.values_mut())
    }

    /// Revision shared by every tier
    pub fn revision(&self) -> i64 {
        self.shared.revision()
    }

    /// Shared tier and shard tier borrowed together
    pub fn split_mut(&mut self, shard: Name) -> Result<(&mut Database, &mut Database), StoreError> {
        let shard_db = if shard == MAIN_SHARD {
            &mut self.main
        } else {
            self.shards
                .get_mut(&shard)
                .ok_or(StoreError::UnknownShard(shard))?
        };
        Ok((&mut self.shared, shard_db))
    }

    /// Create an account in `shard` and mirror it into the shared tier.
    ///
    /// Returns the shared-tier handle, which is the authoritative one.
    pub fn create_account(
        &mut self,
        shard: Name,
        name: Name,
        creation_date: TimePoint,
        privileged: bool,
    ) -> Result<ObjectId, StoreError> {
        let (shared, shard_db) = self.split_mut(shard)?;
        if shared.find::<AccountObject>(&name).is_some() {
            return Err(StoreError::UniqueConstraint {
                type_name: "account_object",
                key: name.to_string(),
            });
        }
        let init = |a: &mut AccountObject| {
            a.name = name;
            a.creation_date = creation_date;
            a.privileged = privileged;
        };
        shard_db.create::<AccountObject>(init)?;
        let id = shared.create::<AccountObject>(init)?;
        debug!(account = %name, shard = %shard, "account created");
        Ok(id)
    }

    /// Apply `f` to an account in the shared tier and, if present, in the
    /// shard tier
    pub fn modify_account(
        &mut self,
        shard: Name,
        name: Name,
        f: impl Fn(&mut AccountObject),
    ) -> Result<(), StoreError> {
        let (shared, shard_db) = self.split_mut(shard)?;
        let id = shared
            .find_by_key::<AccountObject>(&name)
            .ok_or_else(|| StoreError::KeyNotFound {
                type_name: "account_object",
                key: name.to_string(),
            })?;
        shared.modify::<AccountObject>(id, &f)?;
        if let Some(local) = shard_db.find_by_key::<AccountObject>(&name) {
            shard_db.modify::<AccountObject>(local, &f)?;
        }
        Ok(())
    }

    /// Open one undo session for a transaction on `shard`.
    ///
    /// The session spans every tier so that revisions stay aligned.
    pub fn start_undo_session(
        &mut self,
        shard: Name,
        enabled: bool,
    ) -> Result<TieredSession<'_>, StoreError> {
        TieredSession::new(self, shard, enabled)
    }

    /// Revert the most recent session on every tier
    pub fn undo(&mut self) {
        for db in self.tiers_mut() {
            db.undo();
        }
    }

    /// Make revisions at or below `revision` irreversible on every tier
    pub fn commit(&mut self, revision: i64) {
        for db in self.tiers_mut() {
            db.commit(revision);
        }
        debug!(revision, "tiers committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn names(db: &Database) -> Vec<String> {
        db.walk::<AccountObject>()
            .map(|a| a.name.to_string())
            .collect()
    }

    #[test]
    fn test_shared_tier_mirrors_accounts_in_order() {
        let mut dbm = DatabaseManager::new();
        dbm.add_shard(n("shard1")).unwrap();
        dbm.add_shard(n("shard2")).unwrap();

        dbm.create_account(MAIN_SHARD, n("alice"), TimePoint::default(), false)
            .unwrap();
        dbm.create_account(n("shard1"), n("bob"), TimePoint::default(), false)
            .unwrap();
        dbm.create_account(n("shard2"), n("carol"), TimePoint::default(), false)
            .unwrap();

        assert_eq!(names(dbm.shared_db()), ["alice", "bob", "carol"]);
        assert_eq!(names(dbm.main_db()), ["alice"]);
        assert_eq!(names(dbm.shard_db(n("shard1")).unwrap()), ["bob"]);
        // shard-local state stays isolated
        assert!(dbm
            .shard_db(n("shard2"))
            .unwrap()
            .find::<AccountObject>(&n("bob"))
            .is_none());
    }

    #[test]
    fn test_unknown_and_duplicate_shards() {
        let mut dbm = DatabaseManager::new();
        assert!(matches!(
            dbm.shard_db(n("nope")),
            Err(StoreError::UnknownShard(_))
        ));
        assert!(dbm.db(MAIN_SHARD).is_ok());
        dbm.add_shard(n("shard1")).unwrap();
        assert!(dbm.add_shard(n("shard1")).is_err());
        assert!(dbm.add_shard(MAIN_SHARD).is_err());
        assert_eq!(dbm.shard_names().collect::<Vec<_>>(), [n("shard1")]);
    }

    #[test]
    fn test_duplicate_account_rejected_everywhere() {
        let mut dbm = DatabaseManager::new();
        dbm.add_shard(n("shard1")).unwrap();
        dbm.create_account(MAIN_SHARD, n("alice"), TimePoint::default(), false)
            .unwrap();
        // unique in the shared tier even though shard1 has no alice
        assert!(dbm
            .create_account(n("shard1"), n("alice"), TimePoint::default(), false)
            .is_err());
    }

    #[test]
    fn test_modify_account_updates_both_tiers() {
        let mut dbm = DatabaseManager::new();
        dbm.create_account(MAIN_SHARD, n("alice"), TimePoint::default(), false)
            .unwrap();
        dbm.modify_account(MAIN_SHARD, n("alice"), |a| a.code_sequence += 1)
            .unwrap();
        let shared = dbm.shared_db().find::<AccountObject>(&n("alice")).unwrap();
        let local = dbm.main_db().find::<AccountObject>(&n("alice")).unwrap();
        assert_eq!(shared.code_sequence, 1);
        assert_eq!(local.code_sequence, 1);
    }

    #[test]
    fn test_tiered_session_undo_on_drop() {
        let mut dbm = DatabaseManager::new();
        dbm.add_shard(n("shard1")).unwrap();
        {
            let mut session = dbm.start_undo_session(n("shard1"), true).unwrap();
            session
                .create_account(n("shard1"), n("bob"), TimePoint::default(), false)
                .unwrap();
            assert_eq!(session.shared_db().len::<AccountObject>(), 1);
        }
        assert_eq!(dbm.shared_db().len::<AccountObject>(), 0);
        assert_eq!(dbm.shard_db(n("shard1")).unwrap().len::<AccountObject>(), 0);
    }

    #[test]
    fn test_tiered_session_push_then_commit() {
        let mut dbm = DatabaseManager::new();
        let session = dbm.start_undo_session(MAIN_SHARD, true).unwrap();
        session.push();
        dbm.create_account(MAIN_SHARD, n("alice"), TimePoint::default(), false)
            .unwrap();
        assert_eq!(dbm.shared_db().undo_stack_len(), 1);
        dbm.commit(dbm.shared_db().revision());
        assert_eq!(dbm.shared_db().undo_stack_len(), 0);
        assert_eq!(dbm.main_db().undo_stack_len(), 0);
        assert_eq!(dbm.shared_db().len::<AccountObject>(), 1);
    }

    fn push_account(dbm: &mut DatabaseManager, shard: Name, name: &str) {
        let mut session = dbm.start_undo_session(shard, true).unwrap();
        session
            .create_account(shard, n(name), TimePoint::default(), false)
            .unwrap();
        session.push();
    }

    fn revisions(dbm: &DatabaseManager) -> [i64; 3] {
        [
            dbm.shared_db().revision(),
            dbm.main_db().revision(),
            dbm.shard_db(n("shard1")).unwrap().revision(),
        ]
    }

    #[test]
    fn test_commit_keeps_tiers_aligned_across_shards() {
        let mut dbm = DatabaseManager::new();
        dbm.add_shard(n("shard1")).unwrap();
        push_account(&mut dbm, MAIN_SHARD, "alice");
        push_account(&mut dbm, n("shard1"), "bob");
        assert_eq!(revisions(&dbm), [2, 2, 2]);

        // finalize only the first transaction
        dbm.commit(1);
        assert_eq!(dbm.shared_db().undo_stack_len(), 1);
        assert_eq!(dbm.main_db().undo_stack_len(), 1);
        assert_eq!(dbm.shard_db(n("shard1")).unwrap().undo_stack_len(), 1);

        dbm.undo();
        assert!(dbm.shared_db().find::<AccountObject>(&n("bob")).is_none());
        assert!(dbm
            .shard_db(n("shard1"))
            .unwrap()
            .find::<AccountObject>(&n("bob"))
            .is_none());
        assert!(dbm.shared_db().find::<AccountObject>(&n("alice")).is_some());
        assert_eq!(revisions(&dbm), [1, 1, 1]);

        // the committed transaction can no longer be reverted
        dbm.undo();
        assert!(dbm.shared_db().find::<AccountObject>(&n("alice")).is_some());
        assert!(dbm.main_db().find::<AccountObject>(&n("alice")).is_some());
    }

    #[test]
    fn test_shard_added_mid_session_joins_revision() {
        let mut dbm = DatabaseManager::new();
        push_account(&mut dbm, MAIN_SHARD, "alice");
        dbm.add_shard(n("shard1")).unwrap();
        assert_eq!(revisions(&dbm), [1, 1, 1]);
        assert_eq!(dbm.shard_db(n("shard1")).unwrap().undo_stack_len(), 1);

        push_account(&mut dbm, n("shard1"), "bob");
        dbm.commit(2);
        assert_eq!(dbm.shard_db(n("shard1")).unwrap().undo_stack_len(), 0);
        assert_eq!(dbm.shared_db().undo_stack_len(), 0);
    }

    #[test]
    fn test_tiered_session_unknown_shard() {
        let mut dbm = DatabaseManager::new();
        assert!(dbm.start_undo_session(n("nope"), true).is_err());
        assert_eq!(dbm.shared_db().undo_stack_len(), 0);
    }
}
