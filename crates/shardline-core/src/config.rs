//! Chain constants and configuration
//!
//! `ChainConfig` holds consensus-wide limits every node must agree on;
//! `NodeConfig` holds node-local policy (subjective limits, white/blacklists,
//! speculative mode). Both load from JSON and default every field.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::types::Microseconds;

// ── Well-known names ───────────────────────────────────

pub const SYSTEM_ACCOUNT: Name = Name::from_const("system");
pub const NULL_ACCOUNT: Name = Name::from_const("system.null");
pub const PRODUCERS_ACCOUNT: Name = Name::from_const("system.prods");

pub const OWNER_PERMISSION: Name = Name::from_const("owner");
pub const ACTIVE_PERMISSION: Name = Name::from_const("active");
/// Permission a contract holds over accounts that delegate to its code
pub const CODE_PERMISSION: Name = Name::from_const("system.code");

pub const MAIN_SHARD: Name = Name::from_const("main");

pub const NEWACCOUNT_ACTION: Name = Name::from_const("newaccount");
pub const SETCODE_ACTION: Name = Name::from_const("setcode");
pub const SETABI_ACTION: Name = Name::from_const("setabi");

// ── Billing constants ──────────────────────────────────

pub const TRANSACTION_ID_NET_USAGE: u64 = 32;
pub const FIXED_NET_OVERHEAD_OF_PACKED_TRX: u64 = 16;
pub const OVERHEAD_PER_ROW_PER_INDEX_RAM_BYTES: i64 = 32;
pub const OVERHEAD_PER_ACCOUNT_RAM_BYTES: i64 = 2 * 1024;
pub const SETCODE_RAM_BYTES_MULTIPLIER: i64 = 10;
/// Fixed fields of a permission row plus five index entries, 16-byte aligned
pub const PERMISSION_BILLABLE_SIZE: i64 = 368;
/// Fixed fields of a deferred record plus five index entries, 16-byte aligned
pub const GENERATED_TRANSACTION_BILLABLE_SIZE: i64 = 272;
/// Fixed fields of a contract table row plus two index entries
pub const KEY_VALUE_BILLABLE_SIZE: i64 = 44 + 2 * OVERHEAD_PER_ROW_PER_INDEX_RAM_BYTES;
/// Bytes hashed between deadline checks
pub const HASHING_CHECKTIME_BLOCK_SIZE: usize = 10 * 1024;
/// RAM deltas validated between deadline checks
pub const RAM_DELTA_CHECKTIME_INTERVAL: usize = 10;

// ── Protocol features ──────────────────────────────────

/// Consensus upgrades that change execution rules once activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinProtocolFeature {
    /// System contract code runs even for its own `setcode`
    ForwardSetcode,
    /// Closes the notification RAM billing loophole
    RamRestrictions,
    /// Action digests commit to return values
    ActionReturnValue,
    /// Retires the send-to-self authorization inheritance
    RestrictActionToSelf,
    /// Deferred transactions carry a generation-context extension
    NoDuplicateDeferredId,
    /// Replaced deferred records take the new transaction id
    ReplaceDeferred,
}

// ── Configuration ──────────────────────────────────────

/// Consensus-wide limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
    pub max_inline_action_size: u32,
    pub max_inline_action_depth: u16,
    /// Seconds a deferred transaction stays valid after its delay
    pub deferred_trx_expiration_window: u32,
    pub base_per_transaction_net_usage: u32,
    pub max_authority_depth: u16,
    pub max_transaction_net_usage: u32,
}

impl ChainConfig {
    pub const DEFAULT: Self = Self {
        max_inline_action_size: 512 * 1024,
        max_inline_action_depth: 4,
        deferred_trx_expiration_window: 10 * 60,
        base_per_transaction_net_usage: 12,
        max_authority_depth: 6,
        max_transaction_net_usage: 512 * 1024,
    };

    pub fn deferred_trx_expiration_window(&self) -> Microseconds {
        Microseconds::seconds(self.deferred_trx_expiration_window as i64)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Node-local policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub max_nonprivileged_inline_action_size: u32,
    pub contracts_console: bool,
    pub ram_billing_in_notify_allowed: bool,
    pub all_subjective_mitigations_disabled: bool,
    pub enforce_whitelist_blacklist: bool,
    /// Producing or speculatively executing, as opposed to replaying
    pub speculative: bool,
    pub skip_auth_check: bool,
    pub skip_trx_checks: bool,
    pub actor_whitelist: BTreeSet<Name>,
    pub actor_blacklist: BTreeSet<Name>,
    pub contract_whitelist: BTreeSet<Name>,
    pub contract_blacklist: BTreeSet<Name>,
    pub action_blacklist: BTreeSet<(Name, Name)>,
    pub sender_bypass_whiteblacklist: BTreeSet<Name>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_nonprivileged_inline_action_size: 4 * 1024,
            contracts_console: false,
            ram_billing_in_notify_allowed: false,
            all_subjective_mitigations_disabled: false,
            enforce_whitelist_blacklist: true,
            speculative: true,
            skip_auth_check: false,
            skip_trx_checks: false,
            actor_whitelist: BTreeSet::new(),
            actor_blacklist: BTreeSet::new(),
            contract_whitelist: BTreeSet::new(),
            contract_blacklist: BTreeSet::new(),
            action_blacklist: BTreeSet::new(),
            sender_bypass_whiteblacklist: BTreeSet::new(),
        }
    }
}

/// Complete configuration of a local chain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chain: ChainConfig,
    pub node: NodeConfig,
    pub activated_features: BTreeSet<BuiltinProtocolFeature>,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Configuration with every builtin feature activated
    pub fn with_all_features() -> Self {
        use BuiltinProtocolFeature::*;
        Self {
            activated_features: [
                ForwardSetcode,
                RamRestrictions,
                ActionReturnValue,
                RestrictActionToSelf,
                NoDuplicateDeferredId,
                ReplaceDeferred,
            ]
            .into_iter()
            .collect(),
            ..Self::default()
        }
    }

    pub fn with_feature(mut self, feature: BuiltinProtocolFeature) -> Self {
        self.activated_features.insert(feature);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain.max_inline_action_depth == 0 {
            return Err(Error::Config("max_inline_action_depth must be positive".into()));
        }
        if self.chain.max_authority_depth == 0 {
            return Err(Error::Config("max_authority_depth must be positive".into()));
        }
        if self.node.max_nonprivileged_inline_action_size > self.chain.max_inline_action_size {
            tracing::warn!(
                node = self.node.max_nonprivileged_inline_action_size,
                chain = self.chain.max_inline_action_size,
                "node inline action cap exceeds chain cap; chain cap applies"
            );
        }
        Ok(())
    }
}
