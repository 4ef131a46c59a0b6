//! Per-transaction execution state
//!
//! A `TransactionContext` owns the ordered action trace log, the running
//! net and RAM totals and the deadline for one transaction. It drives the
//! explicit inline-action worklist; each entry is dispatched through a
//! fresh [`ApplyContext`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::action::{AccountDelta, Action, ActionTrace, TraceError};
use crate::apply_context::ApplyContext;
use crate::config::{HASHING_CHECKTIME_BLOCK_SIZE, TRANSACTION_ID_NET_USAGE};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::objects::AccountObject;
use crate::store::{Database, DatabaseManager};
use crate::transaction::{PackedTransaction, Transaction};
use crate::types::{Digest, DigestWriter, Microseconds, TimePoint, TransactionId};

/// Execution mode switches for one transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// No persistent side effects; sequence numbers report 0
    pub read_only: bool,
    /// Run every check but report authorization failures as success
    pub dry_run: bool,
    /// Executed for inspection only, never included in a block
    pub transient: bool,
    pub deadline: Option<Instant>,
    /// Overrides the node's white/blacklist enforcement
    pub enforce_whiteblacklist: Option<bool>,
}

/// Outcome of one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub shard_name: Name,
    pub action_traces: Vec<ActionTrace>,
    pub net_usage: u64,
    pub account_ram_deltas: Vec<AccountDelta>,
    /// Merkle root over the executed receipt digests
    pub action_mroot: Digest,
    pub except: Option<TraceError>,
    pub error_code: Option<u64>,
    pub elapsed: Microseconds,
}

impl TransactionTrace {
    pub fn succeeded(&self) -> bool {
        self.except.is_none()
    }
}

/// Actions scheduled by one dispatch, in scheduling order
#[derive(Debug, Default)]
pub(crate) struct ScheduledActions {
    pub context_free: Vec<u32>,
    pub inline: Vec<u32>,
}

pub struct TransactionContext<'c> {
    control: &'c dyn Controller,
    dbm: &'c mut DatabaseManager,
    packed_trx: &'c PackedTransaction,
    id: TransactionId,
    shard_name: Name,
    pub(crate) published: TimePoint,
    read_only: bool,
    dry_run: bool,
    transient: bool,
    pub(crate) enforce_whiteblacklist: bool,
    deadline: Option<Instant>,
    action_traces: Vec<ActionTrace>,
    pub(crate) executed_action_receipt_digests: Vec<Digest>,
    net_usage: u64,
    net_limit: u64,
    ram_deltas: BTreeMap<Name, i64>,
    start: Instant,
}

impl<'c> TransactionContext<'c> {
    pub fn new(
        control: &'c dyn Controller,
        dbm: &'c mut DatabaseManager,
        packed_trx: &'c PackedTransaction,
        options: &TransactionOptions,
    ) -> Result<Self> {
        let trx = packed_trx.transaction();
        let shard = trx.shard()?;
        if !dbm.has_shard(shard.shard_name) {
            return Err(Error::Transaction(format!(
                "transaction targets unknown shard '{}'",
                shard.shard_name
            )));
        }

        let chain = control.chain_config();
        let mut net_limit = chain.max_transaction_net_usage as u64;
        if trx.header.max_net_usage_words > 0 {
            net_limit = net_limit.min(trx.header.max_net_usage_words as u64 * 8);
        }

        Ok(Self {
            control,
            dbm,
            packed_trx,
            id: packed_trx.id(),
            shard_name: shard.shard_name,
            published: control.pending_block_time(),
            read_only: options.read_only,
            dry_run: options.dry_run,
            transient: options.transient || options.read_only || options.dry_run,
            enforce_whiteblacklist: options
                .enforce_whiteblacklist
                .unwrap_or(control.node_config().enforce_whitelist_blacklist),
            deadline: options.deadline,
            action_traces: Vec::new(),
            executed_action_receipt_digests: Vec::new(),
            net_usage: 0,
            net_limit,
            ram_deltas: BTreeMap::new(),
            start: Instant::now(),
        })
    }

    // ── Accessors ──────────────────────────────────────

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn shard_name(&self) -> Name {
        self.shard_name
    }

    pub fn control(&self) -> &'c dyn Controller {
        self.control
    }

    pub fn packed_trx(&self) -> &'c PackedTransaction {
        self.packed_trx
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn net_usage(&self) -> u64 {
        self.net_usage
    }

    pub fn action_traces(&self) -> &[ActionTrace] {
        &self.action_traces
    }

    pub(crate) fn dbm_mut(&mut self) -> &mut DatabaseManager {
        &mut *self.dbm
    }

    pub(crate) fn shared_db(&self) -> &Database {
        self.dbm.shared_db()
    }

    /// Store tier of the shard this transaction runs on
    pub(crate) fn shard_db(&self) -> Result<&Database> {
        Ok(self.dbm.db(self.shard_name)?)
    }

    pub(crate) fn shard_db_mut(&mut self) -> Result<&mut Database> {
        Ok(self.dbm.db_mut(self.shard_name)?)
    }

    // ── Resources ──────────────────────────────────────

    /// Fail once the deadline has passed
    pub fn checktime(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// SHA-256 of `data`, checking the deadline between fixed-size blocks
    pub fn hash_with_checktime(&self, data: &[u8]) -> Result<Digest> {
        let mut writer = DigestWriter::default();
        for chunk in data.chunks(HASHING_CHECKTIME_BLOCK_SIZE) {
            self.checktime()?;
            writer.update(chunk);
        }
        Ok(writer.finish())
    }

    pub fn add_net_usage(&mut self, usage: u64) -> Result<()> {
        self.net_usage = self.net_usage.saturating_add(usage);
        if self.net_usage > self.net_limit {
            return Err(Error::NetUsageExceeded {
                used: self.net_usage,
                limit: self.net_limit,
            });
        }
        Ok(())
    }

    pub fn add_ram_usage(&mut self, account: Name, delta: i64) {
        *self.ram_deltas.entry(account).or_insert(0) += delta;
    }

    // ── Traces ─────────────────────────────────────────

    /// Trace for a 1-based action ordinal
    pub fn get_action_trace(&self, action_ordinal: u32) -> Result<&ActionTrace> {
        action_ordinal
            .checked_sub(1)
            .and_then(|i| self.action_traces.get(i as usize))
            .ok_or_else(|| {
                Error::Transaction(format!("action_ordinal {} is outside allowed range", action_ordinal))
            })
    }

    pub fn get_action_trace_mut(&mut self, action_ordinal: u32) -> Result<&mut ActionTrace> {
        action_ordinal
            .checked_sub(1)
            .and_then(|i| self.action_traces.get_mut(i as usize))
            .ok_or_else(|| {
                Error::Transaction(format!("action_ordinal {} is outside allowed range", action_ordinal))
            })
    }

    /// Append a trace for `act` and return its ordinal
    pub fn schedule_action(
        &mut self,
        act: Action,
        receiver: Name,
        context_free: bool,
        creator_action_ordinal: u32,
        closest_unnotified_ancestor_action_ordinal: u32,
    ) -> u32 {
        let ordinal = self.action_traces.len() as u32 + 1;
        self.action_traces.push(ActionTrace::new(
            self.id,
            act,
            receiver,
            context_free,
            ordinal,
            creator_action_ordinal,
            closest_unnotified_ancestor_action_ordinal,
        ));
        ordinal
    }

    /// Schedule a copy of the action at `ordinal_to_copy` for `receiver`
    pub fn schedule_action_copy(
        &mut self,
        ordinal_to_copy: u32,
        receiver: Name,
        context_free: bool,
        creator_action_ordinal: u32,
        closest_unnotified_ancestor_action_ordinal: u32,
    ) -> Result<u32> {
        let act = self.get_action_trace(ordinal_to_copy)?.act.clone();
        Ok(self.schedule_action(
            act,
            receiver,
            context_free,
            creator_action_ordinal,
            closest_unnotified_ancestor_action_ordinal,
        ))
    }

    /// Packed action at `index`: type 0 reads context-free actions, type 1
    /// regular actions. An index past the end yields `None`.
    pub fn get_action(&self, action_type: u32, index: u32) -> Result<Option<Vec<u8>>> {
        let trx = self.packed_trx.transaction();
        let actions = match action_type {
            0 => &trx.context_free_actions,
            1 => &trx.actions,
            _ => return Err(Error::ActionNotFound),
        };
        Ok(actions.get(index as usize).map(|act| crate::codec::pack(act)))
    }

    pub fn get_context_free_data(&self, index: u32) -> Option<&'c [u8]> {
        self.packed_trx
            .context_free_data()
            .get(index as usize)
            .map(Vec::as_slice)
    }

    // ── Execution ──────────────────────────────────────

    /// Validate the transaction and charge its base net usage
    pub fn init(&mut self) -> Result<()> {
        let trx = self.packed_trx.transaction();
        if trx.header.delay_sec != 0 {
            return Err(Error::Transaction(
                "delayed input transactions are not supported".into(),
            ));
        }
        if trx.actions.is_empty() {
            return Err(Error::Transaction(
                "there must be at least one authorized action in a transaction".into(),
            ));
        }
        trx.validate_and_extract_extensions()?;

        let base = self.control.chain_config().base_per_transaction_net_usage as u64;
        self.add_net_usage(
            base + self.packed_trx.unprunable_size() + self.packed_trx.prunable_size(),
        )?;

        if !self.control.skip_trx_checks() {
            let enforce = self.enforce_whiteblacklist && self.control.is_speculative_block();
            self.validate_referenced_accounts(trx, enforce)?;
        }
        debug!(trx_id = %self.id, shard = %self.shard_name, net_usage = self.net_usage, "transaction initialized");
        Ok(())
    }

    /// Every referenced code account, actor and permission must exist
    pub fn validate_referenced_accounts(
        &self,
        trx: &Transaction,
        enforce_actor_whitelist_blacklist: bool,
    ) -> Result<()> {
        let db = self.shared_db();
        let auth_manager = self.control.authorization_manager();

        for a in &trx.context_free_actions {
            if db.find::<AccountObject>(&a.account).is_none() {
                return Err(Error::Transaction(format!(
                    "action's code account '{}' does not exist",
                    a.account
                )));
            }
            if !a.authorization.is_empty() {
                return Err(Error::Transaction(
                    "context-free actions cannot have authorizations".into(),
                ));
            }
        }

        let mut actors = BTreeSet::new();
        let mut one_auth = false;
        for a in &trx.actions {
            if db.find::<AccountObject>(&a.account).is_none() {
                return Err(Error::Transaction(format!(
                    "action's code account '{}' does not exist",
                    a.account
                )));
            }
            for auth in &a.authorization {
                one_auth = true;
                if db.find::<AccountObject>(&auth.actor).is_none() {
                    return Err(Error::Transaction(format!(
                        "action's authorizing actor '{}' does not exist",
                        auth.actor
                    )));
                }
                if !auth_manager.find_permission(db, auth) {
                    return Err(Error::Transaction(format!(
                        "action's authorizations include a non-existent permission: {}",
                        auth
                    )));
                }
                if enforce_actor_whitelist_blacklist {
                    actors.insert(auth.actor);
                }
            }
        }
        // read-only transactions may run without any authorization
        if !one_auth && !self.read_only {
            return Err(Error::Transaction(
                "transaction must have at least one authorization".into(),
            ));
        }

        if enforce_actor_whitelist_blacklist {
            self.control.check_actor_list(&actors)?;
        }
        Ok(())
    }

    /// Schedule and run context-free actions, then actions
    pub fn exec(&mut self) -> Result<()> {
        let trx = self.packed_trx.transaction();
        for act in &trx.context_free_actions {
            self.schedule_action(act.clone(), act.account, true, 0, 0);
        }
        for act in &trx.actions {
            self.schedule_action(act.clone(), act.account, false, 0, 0);
        }

        let top_level = self.action_traces.len() as u32;
        for ordinal in 1..=top_level {
            self.execute_action(ordinal, 0)?;
        }
        Ok(())
    }

    /// Run one action and everything it schedules, depth first.
    ///
    /// Children go onto an explicit stack; context-free children are
    /// popped before regular inline children, each in scheduling order.
    pub fn execute_action(&mut self, action_ordinal: u32, recurse_depth: u32) -> Result<()> {
        let mut pending = vec![(action_ordinal, recurse_depth)];
        while let Some((ordinal, depth)) = pending.pop() {
            let scheduled = ApplyContext::new(self, ordinal, depth)?.exec()?;
            trace!(
                ordinal,
                depth,
                context_free = scheduled.context_free.len(),
                inline = scheduled.inline.len(),
                "action dispatched"
            );
            pending.extend(scheduled.inline.iter().rev().map(|&child| (child, depth + 1)));
            pending.extend(
                scheduled
                    .context_free
                    .iter()
                    .rev()
                    .map(|&child| (child, depth + 1)),
            );
        }
        Ok(())
    }

    /// Consume the context into its trace
    pub fn into_trace(self, error: Option<&Error>) -> TransactionTrace {
        let account_ram_deltas = self
            .ram_deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(&account, &delta)| AccountDelta { account, delta })
            .collect();
        TransactionTrace {
            id: self.id,
            shard_name: self.shard_name,
            action_mroot: merkle(&self.executed_action_receipt_digests),
            action_traces: self.action_traces,
            net_usage: self.net_usage,
            account_ram_deltas,
            except: error.map(TraceError::from),
            error_code: error.and_then(Error::error_code),
            elapsed: Microseconds(i64::try_from(self.start.elapsed().as_micros()).unwrap_or(i64::MAX)),
        }
    }
}

/// Pairwise SHA-256 root; an odd trailing node is paired with itself
pub fn merkle(digests: &[Digest]) -> Digest {
    if digests.is_empty() {
        return Digest::default();
    }
    let mut level = digests.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut writer = DigestWriter::default();
                writer.update(pair[0].as_bytes());
                writer.update(pair[1].as_bytes());
                writer.finish()
            })
            .collect();
    }
    level[0]
}

/// Net charged up front for retiring a deferred transaction
pub(crate) fn deferred_retirement_net_usage(control: &dyn Controller) -> u64 {
    control.chain_config().base_per_transaction_net_usage as u64 + TRANSACTION_ID_NET_USAGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ACTIVE_PERMISSION};
    use crate::controller::LocalController;
    use crate::testing::{n, Chain};
    use crate::transaction::SignedTransaction;

    fn packed(actions: Vec<Action>) -> PackedTransaction {
        let trx = Transaction {
            actions,
            ..Default::default()
        };
        PackedTransaction::new(SignedTransaction::new(trx), Default::default()).unwrap()
    }

    // ── Merkle ─────────────────────────────────────────

    #[test]
    fn test_merkle_shapes() {
        assert_eq!(merkle(&[]), Digest::default());
        let a = Digest::hash(b"a");
        assert_eq!(merkle(&[a]), a);

        let b = Digest::hash(b"b");
        let mut writer = DigestWriter::default();
        writer.update(a.as_bytes());
        writer.update(b.as_bytes());
        let ab = writer.finish();
        assert_eq!(merkle(&[a, b]), ab);
        // odd count pairs the last node with itself
        assert_ne!(merkle(&[a, b, a]), ab);
    }

    // ── Resources ──────────────────────────────────────

    #[test]
    fn test_net_limit_from_header() {
        let control = LocalController::new(Config::default()).unwrap();
        let mut dbm = DatabaseManager::new();
        let mut trx = Transaction::default();
        trx.header.max_net_usage_words = 4;
        let packed = PackedTransaction::new(SignedTransaction::new(trx), Default::default()).unwrap();
        let mut ctx = TransactionContext::new(&control, &mut dbm, &packed, &TransactionOptions::default()).unwrap();
        assert!(ctx.add_net_usage(32).is_ok());
        assert!(matches!(
            ctx.add_net_usage(1),
            Err(Error::NetUsageExceeded { used: 33, limit: 32 })
        ));
    }

    #[test]
    fn test_checktime_deadline() {
        let control = LocalController::new(Config::default()).unwrap();
        let mut dbm = DatabaseManager::new();
        let packed = packed(vec![]);
        let options = TransactionOptions {
            deadline: Some(Instant::now()),
            ..Default::default()
        };
        let ctx = TransactionContext::new(&control, &mut dbm, &packed, &options).unwrap();
        assert!(matches!(ctx.checktime(), Err(Error::DeadlineExceeded)));
        assert!(matches!(
            ctx.hash_with_checktime(b"abc"),
            Err(Error::DeadlineExceeded)
        ));
    }

    #[test]
    fn test_hash_with_checktime_matches_plain_hash() {
        let control = LocalController::new(Config::default()).unwrap();
        let mut dbm = DatabaseManager::new();
        let packed = packed(vec![]);
        let ctx = TransactionContext::new(&control, &mut dbm, &packed, &TransactionOptions::default()).unwrap();
        let data = vec![7u8; HASHING_CHECKTIME_BLOCK_SIZE * 2 + 3];
        assert_eq!(ctx.hash_with_checktime(&data).unwrap(), Digest::hash(&data));
    }

    #[test]
    fn test_unknown_shard_rejected() {
        let control = LocalController::new(Config::default()).unwrap();
        let mut dbm = DatabaseManager::new();
        let mut trx = Transaction::default();
        trx.set_shard(crate::transaction::TransactionShard {
            shard_name: n("nowhere"),
            ..Default::default()
        });
        let packed = PackedTransaction::new(SignedTransaction::new(trx), Default::default()).unwrap();
        assert!(TransactionContext::new(&control, &mut dbm, &packed, &TransactionOptions::default()).is_err());
    }

    // ── Scheduling ─────────────────────────────────────

    #[test]
    fn test_schedule_assigns_ordinals() {
        let control = LocalController::new(Config::default()).unwrap();
        let mut dbm = DatabaseManager::new();
        let packed = packed(vec![]);
        let mut ctx = TransactionContext::new(&control, &mut dbm, &packed, &TransactionOptions::default()).unwrap();
        let act = Action::new(n("token"), n("transfer"), vec![], vec![1]);
        assert_eq!(ctx.schedule_action(act, n("token"), false, 0, 0), 1);
        assert_eq!(ctx.schedule_action_copy(1, n("alice"), false, 1, 1).unwrap(), 2);
        let copy = ctx.get_action_trace(2).unwrap();
        assert_eq!(copy.receiver, n("alice"));
        assert_eq!(copy.act.data, vec![1]);
        assert_eq!(copy.creator_action_ordinal, 1);
        assert!(ctx.get_action_trace(0).is_err());
        assert!(ctx.get_action_trace(3).is_err());
    }

    // ── Validation ─────────────────────────────────────

    #[test]
    fn test_validate_referenced_accounts() {
        let mut chain = Chain::new();
        chain.create_account("alice");
        let auth = crate::action::PermissionLevel::new(n("alice"), ACTIVE_PERMISSION);

        let trx = Transaction {
            actions: vec![Action::new(n("alice"), n("hi"), vec![], vec![])],
            ..Default::default()
        };
        let err = chain.validate(&trx).unwrap_err();
        assert!(err.to_string().contains("at least one authorization"));

        let trx = Transaction {
            actions: vec![Action::new(n("nobody"), n("hi"), vec![auth], vec![])],
            ..Default::default()
        };
        let err = chain.validate(&trx).unwrap_err();
        assert!(err.to_string().contains("'nobody' does not exist"));

        let trx = Transaction {
            actions: vec![Action::new(n("alice"), n("hi"), vec![auth], vec![])],
            ..Default::default()
        };
        assert!(chain.validate(&trx).is_ok());
    }

    #[test]
    fn test_read_only_transaction_needs_no_authorization() {
        let mut chain = Chain::new();
        chain.create_account("alice");
        let trx = Transaction {
            actions: vec![Action::new(n("alice"), n("hi"), vec![], vec![])],
            ..Default::default()
        };
        let options = TransactionOptions {
            read_only: true,
            ..Default::default()
        };
        let packed = PackedTransaction::new(SignedTransaction::new(trx.clone()), Default::default()).unwrap();
        {
            let ctx = TransactionContext::new(&chain.control, &mut chain.dbm, &packed, &options).unwrap();
            assert!(ctx.validate_referenced_accounts(&trx, false).is_ok());
        }

        let trace = chain.push_transaction(trx, &options).unwrap();
        assert!(trace.succeeded(), "{:?}", trace.except);
    }
}
