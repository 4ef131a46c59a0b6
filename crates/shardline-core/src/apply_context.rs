//! Action execution context
//!
//! An `ApplyContext` executes one action against its first receiver and
//! then against every recipient that receiver (or a later recipient)
//! registers. It owns the per-dispatch state: the notified list, the
//! inline and context-free inline actions scheduled so far, pending
//! console output, RAM deltas and the return value.
//!
//! # Dispatch
//!
//! ```text
//! exec ──► exec_one(first receiver) ──► exec_one(notified 1) ──► ...
//!               │
//!               ├─ native handler (receiver, code, action)
//!               ├─ interpreter, when the receiver carries code
//!               ├─ RAM delta validation (ram_restrictions)
//!               └─ receipt: global / recv / auth sequences
//! ```
//!
//! Children scheduled during `exec` are handed back to the transaction
//! context, which runs them depth first through its worklist.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::action::{
    generate_action_digest, AccountDelta, Action, ActionReceipt, PermissionLevel, TraceError,
};
use crate::authorization::AuthorizationCheck;
use crate::codec::pack;
use crate::config::{
    BuiltinProtocolFeature, CODE_PERMISSION, GENERATED_TRANSACTION_BILLABLE_SIZE, MAIN_SHARD,
    RAM_DELTA_CHECKTIME_INTERVAL, SETCODE_ACTION, SYSTEM_ACCOUNT,
};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::objects::{
    AccountMetadataObject, AccountObject, DynamicGlobalPropertyObject, GeneratedTransactionObject,
    RamCorrectionObject,
};
use crate::store::{Database, DatabaseManager, ObjectId};
use crate::transaction::{
    DeferredTransactionGenerationContext, Transaction, TransactionExtension,
};
use crate::transaction_context::{deferred_retirement_net_usage, ScheduledActions, TransactionContext};
use crate::types::{Digest, Microseconds, TimePointSec};

/// Installed code of an account, as reported to contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeHash {
    pub code_sequence: u32,
    pub code_hash: Digest,
    pub vm_type: u8,
    pub vm_version: u8,
}

pub struct ApplyContext<'t, 'c> {
    trx_context: &'t mut TransactionContext<'c>,
    control: &'c dyn Controller,
    shard_name: Name,
    recurse_depth: u32,
    first_receiver_action_ordinal: u32,
    action_ordinal: u32,
    receiver: Name,
    act: Action,
    context_free: bool,
    privileged: bool,
    notified: Vec<(Name, u32)>,
    inline_actions: Vec<u32>,
    cfa_inline_actions: Vec<u32>,
    pending_console_output: String,
    account_ram_deltas: BTreeMap<Name, i64>,
    action_return_value: Vec<u8>,
}

impl<'t, 'c> ApplyContext<'t, 'c> {
    pub(crate) fn new(
        trx_context: &'t mut TransactionContext<'c>,
        action_ordinal: u32,
        recurse_depth: u32,
    ) -> Result<Self> {
        let trace = trx_context.get_action_trace(action_ordinal)?;
        let act = trace.act.clone();
        let receiver = trace.receiver;
        let context_free = trace.context_free;
        Ok(Self {
            control: trx_context.control(),
            shard_name: trx_context.shard_name(),
            trx_context,
            recurse_depth,
            first_receiver_action_ordinal: action_ordinal,
            action_ordinal,
            receiver,
            act,
            context_free,
            privileged: false,
            notified: Vec::new(),
            inline_actions: Vec::new(),
            cfa_inline_actions: Vec::new(),
            pending_console_output: String::new(),
            account_ram_deltas: BTreeMap::new(),
            action_return_value: Vec::new(),
        })
    }

    // ── Dispatch ───────────────────────────────────────

    /// Run the first receiver and every notified recipient in FIFO order,
    /// returning the children to run next
    pub(crate) fn exec(mut self) -> Result<ScheduledActions> {
        self.notified.push((self.receiver, self.action_ordinal));
        self.exec_one()?;
        let mut i = 1;
        while i < self.notified.len() {
            let (receiver, ordinal) = self.notified[i];
            self.receiver = receiver;
            self.action_ordinal = ordinal;
            self.exec_one()?;
            i += 1;
        }

        if !self.cfa_inline_actions.is_empty() || !self.inline_actions.is_empty() {
            let max_depth = self.control.chain_config().max_inline_action_depth as u32;
            if self.recurse_depth >= max_depth {
                return Err(Error::Transaction(
                    "max inline action depth per transaction reached".into(),
                ));
            }
        }

        Ok(ScheduledActions {
            context_free: std::mem::take(&mut self.cfa_inline_actions),
            inline: std::mem::take(&mut self.inline_actions),
        })
    }

    fn exec_one(&mut self) -> Result<()> {
        let start = Instant::now();
        trace!(
            receiver = %self.receiver,
            account = %self.act.account,
            action = %self.act.name,
            ordinal = self.action_ordinal,
            "dispatching action"
        );

        let act_digest = match self.dispatch() {
            Ok(digest) => digest,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(
                    receiver = %self.receiver,
                    account = %self.act.account,
                    action = %self.act.name,
                    error = %err,
                    "action failed"
                );
                let trace = self.trx_context.get_action_trace_mut(self.action_ordinal)?;
                trace.error_code = err.error_code();
                trace.except = Some(TraceError::from(&err));
                self.finalize_trace(start)?;
                return Err(err);
            }
        };

        let global_sequence = self.next_global_sequence()?;
        let recv_sequence = self.next_recv_sequence(self.receiver)?;

        // read after execution so the action's own setcode/setabi is visible
        let first_receiver = self
            .trx_context
            .shared_db()
            .get_by_key::<AccountObject>(&self.act.account)?;
        let code_sequence = first_receiver.code_sequence;
        let abi_sequence = first_receiver.abi_sequence;

        let actors: Vec<Name> = self.act.authorization.iter().map(|a| a.actor).collect();
        let mut auth_sequence = BTreeMap::new();
        for actor in actors {
            let sequence = self.next_auth_sequence(actor)?;
            auth_sequence.insert(actor, sequence);
        }

        let receipt = ActionReceipt {
            receiver: self.receiver,
            act_digest,
            global_sequence,
            recv_sequence,
            auth_sequence,
            code_sequence,
            abi_sequence,
        };
        self.trx_context
            .executed_action_receipt_digests
            .push(receipt.digest());

        if self.control.contracts_console() && !self.pending_console_output.is_empty() {
            debug!(
                receiver = %self.receiver,
                console = %self.pending_console_output,
                "contract console"
            );
        }

        let return_value = std::mem::take(&mut self.action_return_value);
        let trace = self.trx_context.get_action_trace_mut(self.action_ordinal)?;
        trace.return_value = return_value;
        trace.receipt = Some(receipt);
        self.finalize_trace(start)?;

        debug!(
            receiver = %self.receiver,
            account = %self.act.account,
            action = %self.act.name,
            global_sequence,
            "action executed"
        );
        Ok(())
    }

    /// Run handlers for the current receiver and compute the action digest
    fn dispatch(&mut self) -> Result<Digest> {
        self.action_return_value.clear();
        self.trx_context
            .shared_db()
            .get_by_key::<AccountObject>(&self.receiver)?;
        self.get_account_metadata(self.receiver)?;

        if !(self.context_free && self.control.skip_trx_checks()) {
            if let Err(err) = self.run_handlers() {
                return Err(err.context(format!(
                    "pending console output: {}",
                    self.pending_console_output
                )));
            }
        }

        if self
            .control
            .is_builtin_activated(BuiltinProtocolFeature::ActionReturnValue)
        {
            let trx_context = &*self.trx_context;
            generate_action_digest(
                |data| trx_context.hash_with_checktime(data),
                &self.act,
                &self.action_return_value,
            )
        } else {
            Ok(Digest::of(&self.act))
        }
    }

    fn run_handlers(&mut self) -> Result<()> {
        let control = self.control;
        self.privileged = self
            .trx_context
            .shared_db()
            .get_by_key::<AccountObject>(&self.receiver)?
            .privileged;
        let enforce_lists =
            self.trx_context.enforce_whiteblacklist && control.is_speculative_block();

        if let Some(native) = control.find_apply_handler(self.receiver, self.act.account, self.act.name) {
            if enforce_lists {
                control.check_contract_list(self.receiver)?;
                control.check_action_list(self.act.account, self.act.name)?;
            }
            native(self)?;
        }

        // the native handler may have just installed or cleared code
        let account = self
            .trx_context
            .shared_db()
            .get_by_key::<AccountObject>(&self.receiver)?;
        let (code_hash, vm_type, vm_version) = (account.code_hash, account.vm_type, account.vm_version);
        let system_setcode = self.act.account == SYSTEM_ACCOUNT
            && self.act.name == SETCODE_ACTION
            && self.receiver == SYSTEM_ACCOUNT;
        if !code_hash.is_zero()
            && (!system_setcode
                || control.is_builtin_activated(BuiltinProtocolFeature::ForwardSetcode))
        {
            if enforce_lists {
                control.check_contract_list(self.receiver)?;
                control.check_action_list(self.act.account, self.act.name)?;
            }
            control
                .interpreter()
                .apply(&code_hash, vm_type, vm_version, self)?;
        }

        if !self.privileged && control.is_builtin_activated(BuiltinProtocolFeature::RamRestrictions) {
            self.validate_ram_deltas()?;
        }
        Ok(())
    }

    fn validate_ram_deltas(&self) -> Result<()> {
        let not_in_notify_context = self.receiver == self.act.account;
        for (counter, (&account, &delta)) in self.account_ram_deltas.iter().enumerate() {
            if counter > 0 && counter % RAM_DELTA_CHECKTIME_INTERVAL == 0 {
                self.trx_context.checktime()?;
            }
            if delta > 0 && account != self.receiver {
                if !not_in_notify_context {
                    return Err(Error::UnauthorizedRamUsageIncrease(format!(
                        "unprivileged contract cannot increase RAM usage of another account within a notify context: {}",
                        account
                    )));
                }
                if !self.has_authorization(account) {
                    return Err(Error::UnauthorizedRamUsageIncrease(format!(
                        "unprivileged contract cannot increase RAM usage of another account that has not authorized the action: {}",
                        account
                    )));
                }
            }
        }
        Ok(())
    }

    fn finalize_trace(&mut self, start: Instant) -> Result<()> {
        let deltas = std::mem::take(&mut self.account_ram_deltas)
            .into_iter()
            .map(|(account, delta)| AccountDelta { account, delta })
            .collect();
        let console = std::mem::take(&mut self.pending_console_output);
        let trace = self.trx_context.get_action_trace_mut(self.action_ordinal)?;
        trace.account_ram_deltas = deltas;
        trace.console = console;
        trace.elapsed = Microseconds(i64::try_from(start.elapsed().as_micros()).unwrap_or(i64::MAX));
        Ok(())
    }

    // ── Authorization ──────────────────────────────────

    pub fn require_authorization(&self, account: Name) -> Result<()> {
        if self.has_authorization(account) {
            Ok(())
        } else {
            Err(Error::missing_auth(account))
        }
    }

    pub fn require_authorization_with_permission(&self, account: Name, permission: Name) -> Result<()> {
        let level = PermissionLevel::new(account, permission);
        if self.act.authorization.contains(&level) {
            Ok(())
        } else {
            Err(Error::missing_permission(&level))
        }
    }

    pub fn has_authorization(&self, account: Name) -> bool {
        self.act.authorization.iter().any(|auth| auth.actor == account)
    }

    // ── Notifications ──────────────────────────────────

    pub fn has_recipient(&self, code: Name) -> bool {
        self.notified.iter().any(|(recipient, _)| *recipient == code)
    }

    /// Have `recipient` observe the current action after this receiver.
    /// Registering a recipient twice is a no-op.
    pub fn require_recipient(&mut self, recipient: Name) -> Result<()> {
        if self.has_recipient(recipient) {
            return Ok(());
        }
        let ordinal = self.trx_context.schedule_action_copy(
            self.action_ordinal,
            recipient,
            false,
            self.action_ordinal,
            self.first_receiver_action_ordinal,
        )?;
        self.notified.push((recipient, ordinal));
        trace!(recipient = %recipient, ordinal, "recipient registered");
        Ok(())
    }

    // ── Inline actions ─────────────────────────────────

    fn check_inline_size(&self, a: &Action) -> Result<()> {
        if !self.privileged && self.control.is_speculative_block() {
            let limit = self
                .control
                .chain_config()
                .max_inline_action_size
                .min(self.control.get_max_nonprivileged_inline_action_size());
            if a.data.len() >= limit as usize {
                return Err(Error::InlineActionTooBig { account: a.account });
            }
        }
        Ok(())
    }

    /// Decide the fate of an authorization failure on a send-to-self
    /// path: propagate, convert to a subjective fault, or swallow it
    fn send_to_self_failure(&self, err: Error, propagate: bool, message: &str) -> Result<()> {
        if err.is_fatal() || propagate {
            return Err(err);
        }
        if self.control.is_speculative_block() {
            warn!(receiver = %self.receiver, error = %err, "{}", message);
            return Err(Error::subjective(message, &err));
        }
        Ok(())
    }

    /// Schedule `a` to run after the current action, authorized by the
    /// receiver's code permission
    pub fn execute_inline(&mut self, a: Action) -> Result<()> {
        let control = self.control;
        let shared = self.trx_context.shared_db();
        if shared.find::<AccountObject>(&a.account).is_none() {
            return Err(Error::ActionValidate(format!(
                "inline action's code account {} does not exist",
                a.account
            )));
        }

        let enforce_actor_list =
            self.trx_context.enforce_whiteblacklist && control.is_speculative_block();
        let disallow_send_to_self_bypass =
            control.is_builtin_activated(BuiltinProtocolFeature::RestrictActionToSelf);
        let send_to_self = a.account == self.receiver;
        let inherit_parent_authorizations = !disallow_send_to_self_bypass
            && send_to_self
            && self.receiver == self.act.account
            && control.is_speculative_block();

        let mut actors = BTreeSet::new();
        let mut inherited_authorizations = BTreeSet::new();
        for auth in &a.authorization {
            if shared.find::<AccountObject>(&auth.actor).is_none() {
                return Err(Error::ActionValidate(format!(
                    "inline action's authorizing actor {} does not exist",
                    auth.actor
                )));
            }
            if !control.authorization_manager().find_permission(shared, auth) {
                return Err(Error::ActionValidate(format!(
                    "inline action's authorizations include a non-existent permission: {}",
                    auth
                )));
            }
            if enforce_actor_list {
                actors.insert(auth.actor);
            }
            if inherit_parent_authorizations && self.act.authorization.contains(auth) {
                inherited_authorizations.insert(*auth);
            }
        }
        if enforce_actor_list {
            control.check_actor_list(&actors)?;
        }

        self.check_inline_size(&a)?;

        if !control.skip_auth_check() && !self.privileged && !self.trx_context.is_read_only() {
            let provided = BTreeSet::from([PermissionLevel::new(self.receiver, CODE_PERMISSION)]);
            let trx_context = &*self.trx_context;
            let result = control.authorization_manager().check_authorization(
                shared,
                &AuthorizationCheck {
                    actions: std::slice::from_ref(&a),
                    provided_permissions: &provided,
                    provided_delay: control.pending_block_time() - trx_context.published,
                    check_but_dont_fail: trx_context.is_dry_run(),
                    satisfied_authorizations: &inherited_authorizations,
                },
                &|| trx_context.checktime(),
            );
            if let Err(err) = result {
                self.send_to_self_failure(
                    err,
                    disallow_send_to_self_bypass || !send_to_self,
                    "Authorization failure with inline action sent to self",
                )?;
            }
        }

        let inline_receiver = a.account;
        let ordinal = self.trx_context.schedule_action(
            a,
            inline_receiver,
            false,
            self.action_ordinal,
            self.first_receiver_action_ordinal,
        );
        self.inline_actions.push(ordinal);
        trace!(receiver = %inline_receiver, ordinal, "inline action scheduled");
        Ok(())
    }

    /// Schedule a context-free action; it carries no authorizations
    pub fn execute_context_free_inline(&mut self, a: Action) -> Result<()> {
        if self.trx_context.shared_db().find::<AccountObject>(&a.account).is_none() {
            return Err(Error::ActionValidate(format!(
                "inline action's code account {} does not exist",
                a.account
            )));
        }
        if !a.authorization.is_empty() {
            return Err(Error::ActionValidate(
                "context-free actions cannot have authorizations".into(),
            ));
        }
        self.check_inline_size(&a)?;

        let inline_receiver = a.account;
        let ordinal = self.trx_context.schedule_action(
            a,
            inline_receiver,
            true,
            self.action_ordinal,
            self.first_receiver_action_ordinal,
        );
        self.cfa_inline_actions.push(ordinal);
        trace!(receiver = %inline_receiver, ordinal, "context-free inline action scheduled");
        Ok(())
    }

    // ── Deferred transactions ──────────────────────────

    /// Persist `trx` for later execution under (receiver, sender_id)
    pub fn schedule_deferred_transaction(
        &mut self,
        sender_id: u128,
        payer: Name,
        mut trx: Transaction,
        replace_existing: bool,
    ) -> Result<()> {
        if self.trx_context.is_read_only() {
            return Err(Error::Transaction(
                "cannot schedule a deferred transaction from within a readonly transaction".into(),
            ));
        }
        if !trx.context_free_actions.is_empty() {
            return Err(Error::CfaInsideGeneratedTx);
        }
        if self.shard_name != MAIN_SHARD {
            return Err(Error::Transaction(format!(
                "deferred transactions cannot be scheduled from shard {}",
                self.shard_name
            )));
        }

        let control = self.control;
        let receiver = self.receiver;
        let enforce_actor_list = self.trx_context.enforce_whiteblacklist
            && control.is_speculative_block()
            && !control.sender_avoids_whitelist_blacklist_enforcement(receiver);
        self.trx_context
            .validate_referenced_accounts(&trx, enforce_actor_list)?;

        if control.is_builtin_activated(BuiltinProtocolFeature::NoDuplicateDeferredId) {
            let exts = trx.validate_and_extract_extensions()?;
            if exts.is_empty() {
                let context = DeferredTransactionGenerationContext {
                    sender_trx_id: self.trx_context.id(),
                    sender_id,
                    sender: receiver,
                };
                trx.emplace_extension(DeferredTransactionGenerationContext::EXTENSION_ID, pack(&context));
            } else {
                let [TransactionExtension::GenerationContext(context)] = exts.as_slice() else {
                    return Err(Error::InvalidTransactionExtension(
                        "only the deferred_transaction_generation_context extension is currently supported for deferred transactions".into(),
                    ));
                };
                self.check_generation_context(context, sender_id)?;
            }
            trx.header.expiration = TimePointSec::default();
            trx.header.ref_block_num = 0;
            trx.header.ref_block_prefix = 0;
        } else {
            // rounds up to the next second
            trx.header.expiration =
                TimePointSec::from(control.pending_block_time() + Microseconds(999_999));
            trx.header.set_reference_block(&control.head_block_id());
        }

        self.trx_context
            .add_net_usage(deferred_retirement_net_usage(control))?;

        let delay = Microseconds::seconds(trx.header.delay_sec as i64);
        let ram_restrictions_activated =
            control.is_builtin_activated(BuiltinProtocolFeature::RamRestrictions);

        if !control.skip_auth_check() && !self.privileged {
            if payer != receiver {
                if ram_restrictions_activated {
                    if receiver != self.act.account {
                        return Err(Error::ActionValidate(
                            "cannot bill RAM usage of deferred transactions to another account within notify context".into(),
                        ));
                    }
                    if !self.has_authorization(payer) {
                        return Err(Error::ActionValidate(format!(
                            "cannot bill RAM usage of deferred transaction to another account that has not authorized the action: {}",
                            payer
                        )));
                    }
                } else {
                    self.require_authorization(payer)?;
                }
            }

            let disallow_send_to_self_bypass =
                control.is_builtin_activated(BuiltinProtocolFeature::RestrictActionToSelf);
            let sending_only_to_self = trx.actions.iter().all(|a| a.account == receiver);
            let provided = BTreeSet::from([PermissionLevel::new(receiver, CODE_PERMISSION)]);
            let trx_context = &*self.trx_context;
            let result = control.authorization_manager().check_authorization(
                trx_context.shared_db(),
                &AuthorizationCheck {
                    actions: &trx.actions,
                    provided_permissions: &provided,
                    provided_delay: delay,
                    check_but_dont_fail: false,
                    satisfied_authorizations: &BTreeSet::new(),
                },
                &|| trx_context.checktime(),
            );
            if let Err(err) = result {
                self.send_to_self_failure(
                    err,
                    disallow_send_to_self_bypass || !sending_only_to_self,
                    "Authorization failure with sent deferred transaction consisting only of actions to self",
                )?;
            }
        }

        let existing = self
            .trx_context
            .shard_db()?
            .find::<GeneratedTransactionObject>(&(receiver, sender_id))
            .map(|gto| (gto.id, gto.payer, gto.trx_id, gto.packed_trx.len() as i64));

        let mut trx_id = trx.id();
        if let Some((existing_id, original_payer, original_trx_id, original_size)) = existing {
            if !replace_existing {
                return Err(Error::DeferredTxDuplicate);
            }
            let replace_deferred_activated =
                control.is_builtin_activated(BuiltinProtocolFeature::ReplaceDeferred);
            if !(replace_deferred_activated
                || !control.is_speculative_block()
                || control.all_subjective_mitigations_disabled())
            {
                return Err(Error::SubjectiveBlockProduction {
                    message: "Replacing a deferred transaction is temporarily disabled.".into(),
                    log: Vec::new(),
                });
            }

            let original_ram_bytes = GENERATED_TRANSACTION_BILLABLE_SIZE + original_size;
            if replace_deferred_activated {
                self.add_ram_usage(original_payer, -original_ram_bytes);
            } else {
                self.add_to_ram_correction(original_payer, original_ram_bytes as u64)?;
                trx_id = original_trx_id;
            }

            // remove and recreate; the id and trx_id fields are never modified in place
            self.trx_context
                .shard_db_mut()?
                .remove::<GeneratedTransactionObject>(existing_id)?;
            debug!(sender = %receiver, sender_id, payer = %original_payer, "deferred transaction replaced");
        }

        let published = control.pending_block_time();
        let expiration_window = control.chain_config().deferred_trx_expiration_window();
        let shard_name = self.shard_name;
        let mut trx_size = 0;
        self.trx_context
            .shard_db_mut()?
            .create::<GeneratedTransactionObject>(|gtx| {
                gtx.trx_id = trx_id;
                gtx.sender = receiver;
                gtx.sender_id = sender_id;
                gtx.payer = payer;
                gtx.published = published;
                gtx.delay_until = published + delay;
                gtx.expiration = gtx.delay_until + expiration_window;
                trx_size = gtx.set(&trx);
                gtx.shard_name = shard_name;
            })?;

        if !(ram_restrictions_activated
            || control.is_ram_billing_in_notify_allowed()
            || receiver == self.act.account
            || receiver == payer
            || self.privileged)
        {
            return Err(Error::SubjectiveBlockProduction {
                message: "Cannot charge RAM to other accounts during notify.".into(),
                log: Vec::new(),
            });
        }
        self.add_ram_usage(payer, GENERATED_TRANSACTION_BILLABLE_SIZE + trx_size as i64);
        debug!(sender = %receiver, sender_id, payer = %payer, trx_id = %trx_id, "deferred transaction scheduled");
        Ok(())
    }

    fn check_generation_context(
        &self,
        context: &DeferredTransactionGenerationContext,
        sender_id: u128,
    ) -> Result<()> {
        if context.sender != self.receiver {
            return Err(Error::IllFormedGenerationContext {
                field: "sender",
                expected: self.receiver.to_string(),
                actual: context.sender.to_string(),
            });
        }
        if context.sender_id != sender_id {
            return Err(Error::IllFormedGenerationContext {
                field: "sender_id",
                expected: sender_id.to_string(),
                actual: context.sender_id.to_string(),
            });
        }
        let sender_trx_id = self.trx_context.id();
        if context.sender_trx_id != sender_trx_id {
            return Err(Error::IllFormedGenerationContext {
                field: "sender_trx_id",
                expected: sender_trx_id.to_string(),
                actual: context.sender_trx_id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove the record for (sender, sender_id) and credit its RAM back.
    /// Returns whether a record existed.
    pub fn cancel_deferred_transaction(&mut self, sender_id: u128, sender: Name) -> Result<bool> {
        if self.trx_context.is_read_only() {
            return Err(Error::Transaction(
                "cannot cancel a deferred transaction from within a readonly transaction".into(),
            ));
        }
        let found = self
            .trx_context
            .shard_db()?
            .find::<GeneratedTransactionObject>(&(sender, sender_id))
            .map(|gto| (gto.id, gto.payer, gto.packed_trx.len() as i64));
        let Some((id, payer, size)) = found else {
            return Ok(false);
        };
        self.add_ram_usage(payer, -(GENERATED_TRANSACTION_BILLABLE_SIZE + size));
        self.trx_context
            .shard_db_mut()?
            .remove::<GeneratedTransactionObject>(id)?;
        debug!(sender = %sender, sender_id, payer = %payer, "deferred transaction cancelled");
        Ok(true)
    }

    fn add_to_ram_correction(&mut self, account: Name, ram_bytes: u64) -> Result<()> {
        let db = self.trx_context.shard_db_mut()?;
        match db.find_by_key::<RamCorrectionObject>(&account) {
            Some(id) => db.modify::<RamCorrectionObject>(id, |rco| rco.ram_correction += ram_bytes)?,
            None => {
                db.create::<RamCorrectionObject>(|rco| {
                    rco.name = account;
                    rco.ram_correction = ram_bytes;
                })?;
            }
        }
        trace!(account = %account, ram_bytes, "ram correction recorded");
        Ok(())
    }

    // ── RAM ────────────────────────────────────────────

    pub fn add_ram_usage(&mut self, account: Name, ram_delta: i64) {
        self.trx_context.add_ram_usage(account, ram_delta);
        *self.account_ram_deltas.entry(account).or_insert(0) += ram_delta;
    }

    /// Bill a storage change to `payer`, enforcing the notify-context rules
    pub fn update_db_usage(&mut self, payer: Name, delta: i64) -> Result<()> {
        if delta > 0
            && !(self.privileged
                || payer == self.receiver
                || self
                    .control
                    .is_builtin_activated(BuiltinProtocolFeature::RamRestrictions))
        {
            if !(self.control.is_ram_billing_in_notify_allowed() || self.receiver == self.act.account) {
                return Err(Error::SubjectiveBlockProduction {
                    message: "Cannot charge RAM to other accounts during notify.".into(),
                    log: Vec::new(),
                });
            }
            self.require_authorization(payer)?;
        }
        self.add_ram_usage(payer, delta);
        Ok(())
    }

    // ── Sequences ──────────────────────────────────────

    fn get_account_metadata(&mut self, account: Name) -> Result<ObjectId> {
        let db = self.trx_context.shard_db_mut()?;
        if let Some(id) = db.find_by_key::<AccountMetadataObject>(&account) {
            return Ok(id);
        }
        // first touch of this account in this shard
        Ok(db.create::<AccountMetadataObject>(|m| m.name = account)?)
    }

    pub fn next_global_sequence(&mut self) -> Result<u64> {
        if self.trx_context.is_read_only() {
            return Ok(0);
        }
        let db = self.trx_context.shard_db_mut()?;
        let id = match db.find_by_key::<DynamicGlobalPropertyObject>(&()) {
            Some(id) => {
                db.modify::<DynamicGlobalPropertyObject>(id, |d| d.global_action_sequence += 1)?;
                id
            }
            None => db.create::<DynamicGlobalPropertyObject>(|d| d.global_action_sequence += 1)?,
        };
        Ok(db.get::<DynamicGlobalPropertyObject>(id)?.global_action_sequence)
    }

    pub fn next_recv_sequence(&mut self, receiver: Name) -> Result<u64> {
        if self.trx_context.is_read_only() {
            return Ok(0);
        }
        let id = self.get_account_metadata(receiver)?;
        let db = self.trx_context.shard_db_mut()?;
        db.modify::<AccountMetadataObject>(id, |m| m.recv_sequence += 1)?;
        Ok(db.get::<AccountMetadataObject>(id)?.recv_sequence)
    }

    pub fn next_auth_sequence(&mut self, actor: Name) -> Result<u64> {
        if self.trx_context.is_read_only() {
            return Ok(0);
        }
        let id = self.get_account_metadata(actor)?;
        let db = self.trx_context.shard_db_mut()?;
        db.modify::<AccountMetadataObject>(id, |m| m.auth_sequence += 1)?;
        Ok(db.get::<AccountMetadataObject>(id)?.auth_sequence)
    }

    // ── Introspection ──────────────────────────────────

    pub fn get_receiver(&self) -> Name {
        self.receiver
    }

    pub fn get_action(&self) -> &Action {
        &self.act
    }

    pub fn action_ordinal(&self) -> u32 {
        self.action_ordinal
    }

    pub fn recurse_depth(&self) -> u32 {
        self.recurse_depth
    }

    pub fn shard_name(&self) -> Name {
        self.shard_name
    }

    pub fn is_context_free(&self) -> bool {
        self.context_free
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn control(&self) -> &'c dyn Controller {
        self.control
    }

    pub fn trx_context(&self) -> &TransactionContext<'c> {
        &*self.trx_context
    }

    /// Receiver of the action that scheduled this one, empty for top level
    pub fn get_sender(&self) -> Result<Name> {
        let trace = self.trx_context.get_action_trace(self.action_ordinal)?;
        if trace.creator_action_ordinal > 0 {
            let creator = self
                .trx_context
                .get_action_trace(trace.creator_action_ordinal)?;
            return Ok(creator.receiver);
        }
        Ok(Name::default())
    }

    pub fn is_account(&self, account: Name) -> bool {
        self.trx_context
            .shared_db()
            .find::<AccountObject>(&account)
            .is_some()
    }

    pub fn get_code_hash(&self, account: Name) -> CodeHash {
        match self.trx_context.shared_db().find::<AccountObject>(&account) {
            Some(obj) if !obj.code_hash.is_zero() => CodeHash {
                code_sequence: obj.code_sequence,
                code_hash: obj.code_hash,
                vm_type: obj.vm_type,
                vm_version: obj.vm_version,
            },
            _ => CodeHash::default(),
        }
    }

    /// Packed action of the enclosing transaction; type 0 selects
    /// context-free actions, type 1 regular actions
    pub fn get_packed_action(&self, action_type: u32, index: u32) -> Result<Option<Vec<u8>>> {
        self.trx_context.get_action(action_type, index)
    }

    pub fn get_context_free_data(&self, index: u32) -> Option<&[u8]> {
        self.trx_context.get_context_free_data(index)
    }

    pub fn set_action_return_value(&mut self, value: Vec<u8>) {
        self.action_return_value = value;
    }

    pub fn console_append(&mut self, text: &str) {
        self.pending_console_output.push_str(text);
    }

    // ── Store access ───────────────────────────────────

    pub fn shared_db(&self) -> &Database {
        self.trx_context.shared_db()
    }

    /// Tier of the shard this action runs on
    pub fn db(&self) -> Result<&Database> {
        self.trx_context.shard_db()
    }

    pub fn db_mut(&mut self) -> Result<&mut Database> {
        self.trx_context.shard_db_mut()
    }

    pub(crate) fn db_manager_mut(&mut self) -> &mut DatabaseManager {
        self.trx_context.dbm_mut()
    }
}
