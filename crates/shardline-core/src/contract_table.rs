//! Contract table rows
//!
//! Contracts keep their state in rows addressed by
//! `(code, scope, table, primary_key)`. Two views are exposed through the
//! apply context:
//!
//! ```text
//! table_context()        → rows in the shard tier of the running transaction
//! shared_table_context() → rows in the shared tier, visible from every shard
//! ```
//!
//! Writes are allowed only under the receiver's own code and are billed to
//! the row payer through `update_db_usage`, so the notify-context RAM rules
//! apply to table writes as well.

use tracing::trace;

use crate::apply_context::ApplyContext;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::objects::KeyValueObject;
use crate::store::{Database, StoreError};

/// Tier a `ContractTable` reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTier {
    Shard,
    Shared,
}

/// Row access for the running action on one tier
pub struct ContractTable<'a, 't, 'c> {
    ctx: &'a mut ApplyContext<'t, 'c>,
    tier: TableTier,
}

impl<'t, 'c> ApplyContext<'t, 'c> {
    /// Rows in the shard the transaction runs on
    pub fn table_context(&mut self) -> ContractTable<'_, 't, 'c> {
        ContractTable {
            ctx: self,
            tier: TableTier::Shard,
        }
    }

    /// Rows in the shared tier
    pub fn shared_table_context(&mut self) -> ContractTable<'_, 't, 'c> {
        ContractTable {
            ctx: self,
            tier: TableTier::Shared,
        }
    }
}

impl ContractTable<'_, '_, '_> {
    pub fn tier(&self) -> TableTier {
        self.tier
    }

    fn tier_db(&self) -> Result<&Database> {
        match self.tier {
            TableTier::Shard => self.ctx.db(),
            TableTier::Shared => Ok(self.ctx.shared_db()),
        }
    }

    fn tier_db_mut(&mut self) -> Result<&mut Database> {
        match self.tier {
            TableTier::Shard => self.ctx.db_mut(),
            TableTier::Shared => Ok(self.ctx.db_manager_mut().shared_db_mut()),
        }
    }

    fn check_readable(&self) -> Result<()> {
        if self.ctx.is_context_free() {
            return Err(Error::TableAccess(
                "context free actions cannot access state".into(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self, op: &str) -> Result<()> {
        self.check_readable()?;
        if self.ctx.trx_context().is_read_only() {
            return Err(Error::TableAccess(format!(
                "cannot {} a db record when executing a readonly transaction",
                op
            )));
        }
        Ok(())
    }

    fn row_key(&self, scope: Name, table: Name, primary_key: u64) -> (Name, Name, Name, u64) {
        (self.ctx.get_receiver(), scope, table, primary_key)
    }

    /// Insert a row under the receiver's code, billing `payer`
    pub fn store(
        &mut self,
        scope: Name,
        table: Name,
        payer: Name,
        primary_key: u64,
        value: &[u8],
    ) -> Result<()> {
        self.check_writable("store")?;
        if payer.is_empty() {
            return Err(Error::TableAccess(
                "must specify a valid account to pay for new record".into(),
            ));
        }
        let code = self.ctx.get_receiver();
        let db = self.tier_db_mut()?;
        let id = db.create::<KeyValueObject>(|row| {
            row.code = code;
            row.scope = scope;
            row.table = table;
            row.primary_key = primary_key;
            row.payer = payer;
            row.value = value.to_vec();
        })?;
        let billable = db.get::<KeyValueObject>(id)?.billable_size();
        self.ctx.update_db_usage(payer, billable)?;
        trace!(code = %code, scope = %scope, table = %table, primary_key, tier = ?self.tier, "row stored");
        Ok(())
    }

    /// Replace the value of a receiver row. An empty `payer` keeps the
    /// current one; a new payer takes over the whole row.
    pub fn update(
        &mut self,
        scope: Name,
        table: Name,
        primary_key: u64,
        payer: Name,
        value: &[u8],
    ) -> Result<()> {
        self.check_writable("update")?;
        let key = self.row_key(scope, table, primary_key);
        let db = self.tier_db_mut()?;
        let old = db.get_by_key::<KeyValueObject>(&key)?.clone();
        let payer = if payer.is_empty() { old.payer } else { payer };
        db.modify::<KeyValueObject>(old.id, |row| {
            row.payer = payer;
            row.value = value.to_vec();
        })?;
        let new_size = db.get::<KeyValueObject>(old.id)?.billable_size();

        if payer != old.payer {
            self.ctx.update_db_usage(old.payer, -old.billable_size())?;
            self.ctx.update_db_usage(payer, new_size)?;
        } else if new_size != old.billable_size() {
            self.ctx.update_db_usage(payer, new_size - old.billable_size())?;
        }
        Ok(())
    }

    /// Delete a receiver row, refunding its payer
    pub fn remove(&mut self, scope: Name, table: Name, primary_key: u64) -> Result<()> {
        self.check_writable("remove")?;
        let key = self.row_key(scope, table, primary_key);
        let db = self.tier_db_mut()?;
        let id = db
            .find_by_key::<KeyValueObject>(&key)
            .ok_or_else(|| StoreError::KeyNotFound {
                type_name: "key_value_object",
                key: format!("{:?}", key),
            })?;
        let row = db.remove::<KeyValueObject>(id)?;
        self.ctx.update_db_usage(row.payer, -row.billable_size())?;
        Ok(())
    }

    /// Value of a row under any code
    pub fn get(
        &self,
        code: Name,
        scope: Name,
        table: Name,
        primary_key: u64,
    ) -> Result<Option<Vec<u8>>> {
        self.check_readable()?;
        Ok(self
            .tier_db()?
            .find::<KeyValueObject>(&(code, scope, table, primary_key))
            .map(|row| row.value.clone()))
    }

    /// Rows of one table scope with primary key at or above `lower_bound`,
    /// in key order
    pub fn lower_bound(
        &self,
        code: Name,
        scope: Name,
        table: Name,
        lower_bound: u64,
    ) -> Result<Vec<KeyValueObject>> {
        self.check_readable()?;
        Ok(self
            .tier_db()?
            .range::<KeyValueObject>((code, scope, table, lower_bound)..=(code, scope, table, u64::MAX))
            .cloned()
            .collect())
    }

    /// Payer of a row under any code
    pub fn payer(&self, code: Name, scope: Name, table: Name, primary_key: u64) -> Result<Option<Name>> {
        self.check_readable()?;
        Ok(self
            .tier_db()?
            .find::<KeyValueObject>(&(code, scope, table, primary_key))
            .map(|row| row.payer))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::action::AccountDelta;
    use crate::config::{Config, KEY_VALUE_BILLABLE_SIZE};
    use crate::testing::{n, Chain};
    use crate::transaction::{Transaction, TransactionShard};
    use crate::transaction_context::{TransactionOptions, TransactionTrace};

    fn chain_with(config: Config) -> Chain {
        let mut chain = Chain::with_config(config);
        for name in ["alice", "bob", "counter", "reader"] {
            chain.create_account(name);
        }
        chain.dbm.add_shard(n("shard1")).unwrap();
        chain
    }

    fn push_on(chain: &mut Chain, shard: &str, account: &str, actors: &[&str]) -> TransactionTrace {
        let mut trx = Transaction {
            actions: vec![chain.action(account, "act", actors)],
            ..Default::default()
        };
        if shard != "main" {
            trx.set_shard(TransactionShard {
                shard_name: n(shard),
                ..Default::default()
            });
        }
        chain
            .push_transaction(trx, &TransactionOptions::default())
            .unwrap()
    }

    fn row(db: &Database, primary_key: u64) -> Option<KeyValueObject> {
        db.find::<KeyValueObject>(&(n("counter"), n("counter"), n("rows"), primary_key))
            .cloned()
    }

    #[test]
    fn test_shard_rows_stay_in_their_shard() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.table_context()
                .store(n("counter"), n("rows"), n("counter"), 1, b"one")
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        chain.set_contract("reader", move |ctx| {
            let value = ctx
                .table_context()
                .get(n("counter"), n("counter"), n("rows"), 1)?;
            sink.borrow_mut().push(value);
            Ok(())
        });

        let trace = push_on(&mut chain, "shard1", "counter", &["counter"]);
        assert!(trace.succeeded(), "{:?}", trace.except);
        assert_eq!(row(chain.dbm.shard_db(n("shard1")).unwrap(), 1).unwrap().value, b"one");
        assert!(row(chain.dbm.main_db(), 1).is_none());
        assert!(row(chain.dbm.shared_db(), 1).is_none());

        push_on(&mut chain, "main", "reader", &["reader"]);
        push_on(&mut chain, "shard1", "reader", &["reader"]);
        assert_eq!(*seen.borrow(), [None, Some(b"one".to_vec())]);
    }

    #[test]
    fn test_shared_rows_visible_from_every_shard() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.shared_table_context()
                .store(n("counter"), n("rows"), n("counter"), 7, b"shared")
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        chain.set_contract("reader", move |ctx| {
            let value = ctx
                .shared_table_context()
                .get(n("counter"), n("counter"), n("rows"), 7)?;
            sink.borrow_mut().push(value);
            Ok(())
        });

        let trace = push_on(&mut chain, "shard1", "counter", &["counter"]);
        assert!(trace.succeeded(), "{:?}", trace.except);
        assert!(row(chain.dbm.shared_db(), 7).is_some());
        assert!(row(chain.dbm.shard_db(n("shard1")).unwrap(), 7).is_none());

        push_on(&mut chain, "main", "reader", &["reader"]);
        push_on(&mut chain, "shard1", "reader", &["reader"]);
        let shared = Some(b"shared".to_vec());
        assert_eq!(*seen.borrow(), [shared.clone(), shared]);
    }

    #[test]
    fn test_failed_action_discards_rows_on_both_tiers() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.table_context()
                .store(n("counter"), n("rows"), n("counter"), 1, b"local")?;
            ctx.shared_table_context()
                .store(n("counter"), n("rows"), n("counter"), 1, b"shared")?;
            Err(Error::Interpreter("abort".into()))
        });
        let trace = push_on(&mut chain, "shard1", "counter", &["counter"]);
        assert!(!trace.succeeded());
        assert!(row(chain.dbm.shared_db(), 1).is_none());
        assert!(row(chain.dbm.shard_db(n("shard1")).unwrap(), 1).is_none());
    }

    #[test]
    fn test_row_billing_follows_payer() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            let mut table = ctx.table_context();
            table.store(n("counter"), n("rows"), n("counter"), 1, b"abcd")?;
            // grow by two bytes, then hand the row to alice
            table.update(n("counter"), n("rows"), 1, Name::default(), b"abcdef")?;
            table.update(n("counter"), n("rows"), 1, n("alice"), b"abcdef")
        });
        let trace = push_on(&mut chain, "main", "counter", &["counter", "alice"]);
        assert!(trace.succeeded(), "{:?}", trace.except);
        let size = KEY_VALUE_BILLABLE_SIZE + 6;
        // counter was billed and then fully refunded
        assert_eq!(
            trace.account_ram_deltas,
            [AccountDelta { account: n("alice"), delta: size }]
        );
        assert_eq!(
            trace.action_traces[0].account_ram_deltas,
            [
                AccountDelta { account: n("alice"), delta: size },
                AccountDelta { account: n("counter"), delta: 0 },
            ]
        );
        assert_eq!(row(chain.dbm.main_db(), 1).unwrap().payer, n("alice"));

        chain.set_contract("counter", |ctx| {
            ctx.table_context().remove(n("counter"), n("rows"), 1)
        });
        let trace = push_on(&mut chain, "main", "counter", &["counter"]);
        assert!(trace.succeeded(), "{:?}", trace.except);
        assert_eq!(
            trace.account_ram_deltas,
            [AccountDelta { account: n("alice"), delta: -size }]
        );
        assert!(row(chain.dbm.main_db(), 1).is_none());
    }

    #[test]
    fn test_writes_limited_to_receiver_code() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.table_context()
                .store(n("counter"), n("rows"), n("counter"), 1, b"v")
        });
        push_on(&mut chain, "main", "counter", &["counter"]);

        // reader can see the row but its writes address its own code
        chain.set_contract("reader", |ctx| {
            let mut table = ctx.table_context();
            assert!(table.get(n("counter"), n("counter"), n("rows"), 1)?.is_some());
            table.remove(n("counter"), n("rows"), 1)
        });
        let trace = push_on(&mut chain, "main", "reader", &["reader"]);
        assert!(trace.except.unwrap().message.contains("key_value_object"));
        assert!(row(chain.dbm.main_db(), 1).is_some());
    }

    #[test]
    fn test_store_rejects_duplicate_and_empty_payer() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.table_context()
                .store(n("counter"), n("rows"), Name::default(), 1, b"v")
        });
        let trace = push_on(&mut chain, "main", "counter", &["counter"]);
        assert!(trace
            .except
            .unwrap()
            .message
            .contains("must specify a valid account to pay for new record"));

        chain.set_contract("counter", |ctx| {
            let mut table = ctx.table_context();
            table.store(n("counter"), n("rows"), n("counter"), 1, b"v")?;
            table.store(n("counter"), n("rows"), n("counter"), 1, b"w")
        });
        let trace = push_on(&mut chain, "main", "counter", &["counter"]);
        assert!(trace.except.unwrap().message.contains("already exists"));
    }

    #[test]
    fn test_lower_bound_scans_in_key_order() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            let mut table = ctx.table_context();
            for key in [9u64, 2, 5] {
                table.store(n("counter"), n("rows"), n("counter"), key, &key.to_le_bytes())?;
            }
            table.store(n("counter"), n("other"), n("counter"), 3, b"x")?;
            let keys: Vec<u64> = table
                .lower_bound(n("counter"), n("counter"), n("rows"), 3)?
                .iter()
                .map(|row| row.primary_key)
                .collect();
            assert_eq!(keys, [5, 9]);
            Ok(())
        });
        let trace = push_on(&mut chain, "main", "counter", &["counter"]);
        assert!(trace.succeeded(), "{:?}", trace.except);
    }

    #[test]
    fn test_table_writes_obey_notify_ram_rules() {
        let mut chain = chain_with(Config::with_all_features());
        chain.set_contract("counter", |ctx| ctx.require_recipient(n("reader")));
        chain.set_contract("reader", |ctx| {
            ctx.table_context()
                .store(n("reader"), n("rows"), n("alice"), 1, b"v")
        });
        let trace = push_on(&mut chain, "main", "counter", &["alice"]);
        assert!(trace
            .except
            .unwrap()
            .message
            .contains("within a notify context: alice"));
        assert_eq!(chain.dbm.main_db().len::<KeyValueObject>(), 0);
    }

    #[test]
    fn test_read_only_transaction_cannot_write() {
        let mut chain = chain_with(Config::default());
        chain.set_contract("counter", |ctx| {
            ctx.table_context()
                .store(n("counter"), n("rows"), n("counter"), 1, b"v")
        });
        let options = TransactionOptions {
            read_only: true,
            ..Default::default()
        };
        let trace = chain
            .push_with(vec![chain.action("counter", "act", &[])], &options)
            .unwrap();
        assert!(trace
            .except
            .unwrap()
            .message
            .contains("cannot store a db record when executing a readonly transaction"));
    }
}
