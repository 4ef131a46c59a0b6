//! Chain-level collaborators consumed by the execution core
//!
//! `Controller` supplies feature activation, block time, configuration,
//! list policy, native handlers and the interpreter. `LocalController` is a
//! config-driven implementation for a single node.

use std::collections::BTreeSet;

use tracing::debug;

use crate::apply_context::ApplyContext;
use crate::authorization::{AuthorizationManager, StoreAuthorizationManager};
use crate::config::{BuiltinProtocolFeature, ChainConfig, Config, NodeConfig};
use crate::error::{Error, Result};
use crate::name::Name;
use crate::native::NativeHandlers;
use crate::types::{BlockId, Digest, TimePoint};

/// Native action handler, run in place of contract code
pub type ApplyHandler = fn(&mut ApplyContext<'_, '_>) -> Result<()>;

/// Runs contract code for a receiver
pub trait Interpreter {
    /// Execute `code_hash` against the current action of `context`. A
    /// contract that exits early returns `Ok`.
    fn apply(
        &self,
        code_hash: &Digest,
        vm_type: u8,
        vm_version: u8,
        context: &mut ApplyContext<'_, '_>,
    ) -> Result<()>;
}

/// Interpreter for nodes without a virtual machine
#[derive(Debug, Default)]
pub struct NullInterpreter;

impl Interpreter for NullInterpreter {
    fn apply(
        &self,
        code_hash: &Digest,
        _vm_type: u8,
        _vm_version: u8,
        context: &mut ApplyContext<'_, '_>,
    ) -> Result<()> {
        Err(Error::Interpreter(format!(
            "no interpreter available to run code {} for {}",
            code_hash,
            context.get_receiver()
        )))
    }
}

pub trait Controller {
    fn chain_config(&self) -> &ChainConfig;
    fn node_config(&self) -> &NodeConfig;
    fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool;
    fn pending_block_time(&self) -> TimePoint;
    fn head_block_id(&self) -> BlockId;
    fn find_apply_handler(&self, receiver: Name, scope: Name, action: Name) -> Option<ApplyHandler>;
    fn interpreter(&self) -> &dyn Interpreter;
    fn authorization_manager(&self) -> &dyn AuthorizationManager;

    /// Producing or speculatively executing, as opposed to replaying
    fn is_speculative_block(&self) -> bool {
        self.node_config().speculative
    }

    fn skip_auth_check(&self) -> bool {
        self.node_config().skip_auth_check
    }

    fn skip_trx_checks(&self) -> bool {
        self.node_config().skip_trx_checks
    }

    fn contracts_console(&self) -> bool {
        self.node_config().contracts_console
    }

    fn all_subjective_mitigations_disabled(&self) -> bool {
        self.node_config().all_subjective_mitigations_disabled
    }

    fn is_ram_billing_in_notify_allowed(&self) -> bool {
        self.node_config().ram_billing_in_notify_allowed
    }

    fn get_max_nonprivileged_inline_action_size(&self) -> u32 {
        self.node_config().max_nonprivileged_inline_action_size
    }

    fn sender_avoids_whitelist_blacklist_enforcement(&self, sender: Name) -> bool {
        self.node_config()
            .sender_bypass_whiteblacklist
            .contains(&sender)
    }

    fn check_actor_list(&self, actors: &BTreeSet<Name>) -> Result<()> {
        let node = self.node_config();
        if !node.actor_whitelist.is_empty() {
            let excluded: Vec<String> = actors
                .iter()
                .filter(|a| !node.actor_whitelist.contains(a))
                .map(|a| a.to_string())
                .collect();
            if !excluded.is_empty() {
                return Err(Error::ActorList(format!(
                    "authorizing actor(s) in transaction are not on the actor whitelist: [{}]",
                    excluded.join(", ")
                )));
            }
        }
        if !node.actor_blacklist.is_empty() {
            let blacklisted: Vec<String> = actors
                .iter()
                .filter(|a| node.actor_blacklist.contains(a))
                .map(|a| a.to_string())
                .collect();
            if !blacklisted.is_empty() {
                return Err(Error::ActorList(format!(
                    "authorizing actor(s) in transaction are on the actor blacklist: [{}]",
                    blacklisted.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn check_contract_list(&self, code: Name) -> Result<()> {
        let node = self.node_config();
        if !node.contract_whitelist.is_empty() && !node.contract_whitelist.contains(&code) {
            return Err(Error::ContractList(format!(
                "account '{}' is not on the contract whitelist",
                code
            )));
        }
        if node.contract_blacklist.contains(&code) {
            return Err(Error::ContractList(format!(
                "account '{}' is on the contract blacklist",
                code
            )));
        }
        Ok(())
    }

    fn check_action_list(&self, code: Name, action: Name) -> Result<()> {
        if self.node_config().action_blacklist.contains(&(code, action)) {
            return Err(Error::ActionList(format!(
                "action '{}::{}' is on the action blacklist",
                code, action
            )));
        }
        Ok(())
    }
}

// ── Local controller ───────────────────────────────────

/// Single-node controller driven by a `Config`
pub struct LocalController {
    config: Config,
    block_time: TimePoint,
    head_block_id: BlockId,
    natives: NativeHandlers,
    interpreter: Box<dyn Interpreter>,
    authorization: StoreAuthorizationManager,
}

impl LocalController {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let authorization = StoreAuthorizationManager::new(config.chain.max_authority_depth);
        debug!(
            features = config.activated_features.len(),
            speculative = config.node.speculative,
            "local controller configured"
        );
        Ok(Self {
            config,
            block_time: TimePoint::default(),
            head_block_id: BlockId::default(),
            natives: NativeHandlers::system(),
            interpreter: Box::new(NullInterpreter),
            authorization,
        })
    }

    pub fn with_interpreter(mut self, interpreter: Box<dyn Interpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn natives_mut(&mut self) -> &mut NativeHandlers {
        &mut self.natives
    }

    pub fn set_block_time(&mut self, time: TimePoint) {
        self.block_time = time;
    }

    pub fn set_head_block_id(&mut self, id: BlockId) {
        self.head_block_id = id;
    }

    pub fn activate(&mut self, feature: BuiltinProtocolFeature) {
        self.config.activated_features.insert(feature);
    }
}

impl Controller for LocalController {
    fn chain_config(&self) -> &ChainConfig {
        &self.config.chain
    }

    fn node_config(&self) -> &NodeConfig {
        &self.config.node
    }

    fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool {
        self.config.activated_features.contains(&feature)
    }

    fn pending_block_time(&self) -> TimePoint {
        self.block_time
    }

    fn head_block_id(&self) -> BlockId {
        self.head_block_id
    }

    fn find_apply_handler(&self, receiver: Name, scope: Name, action: Name) -> Option<ApplyHandler> {
        self.natives.find(receiver, scope, action)
    }

    fn interpreter(&self) -> &dyn Interpreter {
        self.interpreter.as_ref()
    }

    fn authorization_manager(&self) -> &dyn AuthorizationManager {
        &self.authorization
    }
}
