//! Transaction executor
//!
//! Runs one packed transaction inside an undo session that spans every
//! store tier, with writes landing in the shared tier and the
//! transaction's shard.
//!
//! # Outcomes
//!
//! - success: the session is pushed (read-only and dry-run sessions are
//!   undone instead) and the trace is returned
//! - objective or subjective failure: the session is undone and the
//!   trace is returned with the captured error
//! - fatal failure: the session is undone and the error propagates
//!
//! # Determinism
//!
//! Execution reads no wall clock except for the optional deadline and the
//! elapsed-time fields of traces. The same store, controller and
//! transaction always yield the same receipts and state.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::authority::Authority;
use crate::config::{Config, MAIN_SHARD, SYSTEM_ACCOUNT};
use crate::controller::{Controller, LocalController};
use crate::error::{Error, Result};
use crate::name::Name;
use crate::native::initialize_account;
use crate::store::DatabaseManager;
use crate::transaction::{CompressionType, PackedTransaction, SignedTransaction};
use crate::transaction_context::{TransactionContext, TransactionOptions, TransactionTrace};
use crate::types::{BlockId, TimePoint};

/// Execute `packed` against `dbm` and return its trace
pub fn execute_transaction(
    dbm: &mut DatabaseManager,
    control: &dyn Controller,
    packed: &PackedTransaction,
    options: &TransactionOptions,
) -> Result<TransactionTrace> {
    let shard = packed.transaction().shard()?.shard_name;
    let mut session = dbm.start_undo_session(shard, true)?;
    let mut trx_context = TransactionContext::new(control, &mut session, packed, options)?;

    match run(&mut trx_context) {
        Ok(()) => {
            let trace = trx_context.into_trace(None);
            if options.read_only || options.dry_run {
                session.undo();
            } else {
                session.push();
            }
            info!(
                trx_id = %trace.id,
                shard = %trace.shard_name,
                actions = trace.action_traces.len(),
                net_usage = trace.net_usage,
                "transaction executed"
            );
            Ok(trace)
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            let trace = trx_context.into_trace(Some(&err));
            session.undo();
            warn!(trx_id = %trace.id, error = %err, "transaction failed");
            Ok(trace)
        }
    }
}

fn run(trx_context: &mut TransactionContext<'_>) -> Result<()> {
    trx_context.init()?;
    trx_context.exec()
}

// ── Scenarios ──────────────────────────────────────────

fn main_shard() -> Name {
    MAIN_SHARD
}

/// Account present before the first transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub name: Name,
    #[serde(default = "main_shard")]
    pub shard: Name,
    #[serde(default)]
    pub privileged: bool,
}

/// A transaction and the mode it runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTransaction {
    #[serde(flatten)]
    pub transaction: SignedTransaction,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub compression: CompressionType,
}

/// A genesis state plus a list of transactions, run in order on one node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    pub config: Config,
    pub block_time: TimePoint,
    pub head_block_id: BlockId,
    /// Non-main shards to register
    pub shards: Vec<Name>,
    pub accounts: Vec<GenesisAccount>,
    pub transactions: Vec<ScenarioTransaction>,
}

impl Scenario {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid scenario: {}", e)))
    }

    /// Build the genesis state and run every transaction.
    ///
    /// Failed transactions yield traces with `except` set; only fatal or
    /// setup errors abort the run.
    pub fn run(&self) -> Result<Vec<TransactionTrace>> {
        let mut control = LocalController::new(self.config.clone())?;
        control.set_block_time(self.block_time);
        control.set_head_block_id(self.head_block_id);

        let mut dbm = DatabaseManager::new();
        for &shard in &self.shards {
            dbm.add_shard(shard)?;
        }
        genesis_account(&mut dbm, MAIN_SHARD, SYSTEM_ACCOUNT, true, self.block_time)?;
        for account in &self.accounts {
            genesis_account(&mut dbm, account.shard, account.name, account.privileged, self.block_time)?;
        }
        debug!(
            shards = self.shards.len(),
            accounts = self.accounts.len() + 1,
            "genesis state built"
        );

        let mut traces = Vec::with_capacity(self.transactions.len());
        for entry in &self.transactions {
            let packed = PackedTransaction::new(entry.transaction.clone(), entry.compression)?;
            let options = TransactionOptions {
                read_only: entry.read_only,
                dry_run: entry.dry_run,
                ..Default::default()
            };
            traces.push(execute_transaction(&mut dbm, &control, &packed, &options)?);
        }
        Ok(traces)
    }
}

fn genesis_account(
    dbm: &mut DatabaseManager,
    shard: Name,
    name: Name,
    privileged: bool,
    creation_date: TimePoint,
) -> Result<()> {
    let key = format!("PUB_{}", name);
    initialize_account(
        dbm,
        shard,
        name,
        Authority::from_key(key.clone()),
        Authority::from_key(key),
        privileged,
        creation_date,
    )?;
    Ok(())
}

/// Run a JSON scenario and render its traces as pretty JSON
pub fn execute_scenario(json: &str) -> Result<String> {
    let scenario = Scenario::from_json_str(json)?;
    let traces = scenario.run()?;
    serde_json::to_string_pretty(&traces)
        .map_err(|e| Error::Codec(format!("failed to serialize traces: {}", e)))
}
