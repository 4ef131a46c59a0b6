//! Test fixtures: a single-node chain with scripted contracts

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::action::{Action, PermissionLevel};
use crate::apply_context::ApplyContext;
use crate::authority::{Authority, PermissionLevelWeight};
use crate::config::{BuiltinProtocolFeature, Config, ACTIVE_PERMISSION, CODE_PERMISSION, MAIN_SHARD, SYSTEM_ACCOUNT};
use crate::controller::{Interpreter, LocalController};
use crate::error::{Error, Result};
use crate::executor::execute_transaction;
use crate::name::Name;
use crate::native::initialize_account;
use crate::objects::{AccountMetadataObject, GeneratedTransactionObject, PermissionObject};
use crate::store::DatabaseManager;
use crate::transaction::{CompressionType, PackedTransaction, SignedTransaction, Transaction};
use crate::transaction_context::{TransactionContext, TransactionOptions, TransactionTrace};
use crate::types::{Digest, TimePoint};

pub(crate) fn n(s: &str) -> Name {
    s.parse().unwrap()
}

type Contract = Rc<dyn Fn(&mut ApplyContext<'_, '_>) -> Result<()>>;

/// Interpreter dispatching code hashes to Rust closures
#[derive(Clone, Default)]
pub(crate) struct ScriptedInterpreter {
    contracts: Rc<RefCell<BTreeMap<Digest, Contract>>>,
}

impl Interpreter for ScriptedInterpreter {
    fn apply(
        &self,
        code_hash: &Digest,
        _vm_type: u8,
        _vm_version: u8,
        context: &mut ApplyContext<'_, '_>,
    ) -> Result<()> {
        let contract = self.contracts.borrow().get(code_hash).cloned();
        match contract {
            Some(contract) => contract(context),
            None => Err(Error::Interpreter(format!("no contract for {}", code_hash))),
        }
    }
}

pub(crate) struct Chain {
    pub(crate) control: LocalController,
    pub(crate) dbm: DatabaseManager,
    contracts: ScriptedInterpreter,
}

impl Chain {
    pub(crate) fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Chain with a privileged `system` account
    pub(crate) fn with_config(config: Config) -> Self {
        let contracts = ScriptedInterpreter::default();
        let control = LocalController::new(config)
            .unwrap()
            .with_interpreter(Box::new(contracts.clone()));
        let mut chain = Self {
            control,
            dbm: DatabaseManager::new(),
            contracts,
        };
        chain.genesis(MAIN_SHARD, SYSTEM_ACCOUNT, true);
        chain
    }

    fn genesis(&mut self, shard: Name, name: Name, privileged: bool) {
        let key = format!("PUB_{}", name);
        initialize_account(
            &mut self.dbm,
            shard,
            name,
            Authority::from_key(key.clone()),
            Authority::from_key(key),
            privileged,
            TimePoint::default(),
        )
        .unwrap();
    }

    pub(crate) fn create_account(&mut self, name: &str) {
        self.genesis(MAIN_SHARD, n(name), false);
    }

    pub(crate) fn set_privileged(&mut self, name: &str) {
        self.dbm
            .modify_account(MAIN_SHARD, n(name), |a| a.privileged = true)
            .unwrap();
    }

    pub(crate) fn activate(&mut self, feature: BuiltinProtocolFeature) {
        self.control.activate(feature);
    }

    /// Let `code@system.code` satisfy `owner@active`
    pub(crate) fn grant_code_permission(&mut self, owner: &str, code: &str) {
        let db = self.dbm.shared_db_mut();
        let id = db
            .find_by_key::<PermissionObject>(&(n(owner), ACTIVE_PERMISSION))
            .unwrap();
        let permission = PermissionLevel::new(n(code), CODE_PERMISSION);
        db.modify::<PermissionObject>(id, |p| {
            p.auth.accounts.push(PermissionLevelWeight {
                permission,
                weight: 1,
            })
        })
        .unwrap();
    }

    /// Install `contract` as the code of `account`, replacing any earlier one
    pub(crate) fn set_contract(
        &mut self,
        account: &str,
        contract: impl Fn(&mut ApplyContext<'_, '_>) -> Result<()> + 'static,
    ) {
        let code_hash = Digest::hash(format!("contract:{}", account).as_bytes());
        self.contracts
            .contracts
            .borrow_mut()
            .insert(code_hash, Rc::new(contract));
        self.dbm
            .modify_account(MAIN_SHARD, n(account), |a| {
                if a.code_hash != code_hash {
                    a.code_hash = code_hash;
                    a.code_sequence += 1;
                }
            })
            .unwrap();
    }

    pub(crate) fn action(&self, account: &str, name: &str, actors: &[&str]) -> Action {
        let authorization = actors
            .iter()
            .map(|actor| PermissionLevel::new(n(actor), ACTIVE_PERMISSION))
            .collect();
        Action::new(n(account), n(name), authorization, Vec::new())
    }

    pub(crate) fn push(&mut self, actions: Vec<Action>) -> Result<TransactionTrace> {
        self.push_with(actions, &TransactionOptions::default())
    }

    pub(crate) fn push_with(
        &mut self,
        actions: Vec<Action>,
        options: &TransactionOptions,
    ) -> Result<TransactionTrace> {
        let trx = Transaction {
            actions,
            ..Default::default()
        };
        self.push_transaction(trx, options)
    }

    pub(crate) fn push_transaction(
        &mut self,
        trx: Transaction,
        options: &TransactionOptions,
    ) -> Result<TransactionTrace> {
        let packed = PackedTransaction::new(SignedTransaction::new(trx), CompressionType::None)?;
        execute_transaction(&mut self.dbm, &self.control, &packed, options)
    }

    pub(crate) fn validate(&mut self, trx: &Transaction) -> Result<()> {
        let packed = PackedTransaction::new(SignedTransaction::new(trx.clone()), CompressionType::None)?;
        let ctx = TransactionContext::new(&self.control, &mut self.dbm, &packed, &TransactionOptions::default())?;
        ctx.validate_referenced_accounts(trx, false)
    }

    pub(crate) fn metadata(&self, account: &str) -> Option<AccountMetadataObject> {
        self.dbm
            .main_db()
            .find::<AccountMetadataObject>(&n(account))
            .cloned()
    }

    pub(crate) fn generated(&self, sender: &str, sender_id: u128) -> Option<GeneratedTransactionObject> {
        self.dbm
            .main_db()
            .find::<GeneratedTransactionObject>(&(n(sender), sender_id))
            .cloned()
    }
}
