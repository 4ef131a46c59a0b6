//! Native system handlers
//!
//! Handlers are looked up by (receiver, code account, action). The system
//! account ships `newaccount`, `setcode` and `setabi`; nodes may register
//! more through [`NativeHandlers::register`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::apply_context::ApplyContext;
use crate::authority::Authority;
use crate::codec::{DataStream, Pack, Unpack};
use crate::config::{
    ACTIVE_PERMISSION, CODE_PERMISSION, NEWACCOUNT_ACTION, OVERHEAD_PER_ACCOUNT_RAM_BYTES,
    OWNER_PERMISSION, PERMISSION_BILLABLE_SIZE, SETABI_ACTION, SETCODE_ACTION,
    SETCODE_RAM_BYTES_MULTIPLIER, SYSTEM_ACCOUNT,
};
use crate::controller::ApplyHandler;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::objects::{AccountMetadataObject, AccountObject, PermissionObject};
use crate::store::DatabaseManager;
use crate::types::{Digest, TimePoint};

/// Registry of native handlers keyed by (receiver, code, action)
#[derive(Default)]
pub struct NativeHandlers {
    handlers: BTreeMap<(Name, Name, Name), ApplyHandler>,
}

impl NativeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for the system account's built-in actions
    pub fn system() -> Self {
        let mut natives = Self::new();
        natives.register(SYSTEM_ACCOUNT, SYSTEM_ACCOUNT, NEWACCOUNT_ACTION, apply_system_newaccount);
        natives.register(SYSTEM_ACCOUNT, SYSTEM_ACCOUNT, SETCODE_ACTION, apply_system_setcode);
        natives.register(SYSTEM_ACCOUNT, SYSTEM_ACCOUNT, SETABI_ACTION, apply_system_setabi);
        natives
    }

    pub fn register(&mut self, receiver: Name, code: Name, action: Name, handler: ApplyHandler) {
        self.handlers.insert((receiver, code, action), handler);
    }

    pub fn find(&self, receiver: Name, code: Name, action: Name) -> Option<ApplyHandler> {
        self.handlers.get(&(receiver, code, action)).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Payloads ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub creator: Name,
    pub name: Name,
    pub owner: Authority,
    pub active: Authority,
}

impl Pack for NewAccount {
    fn pack(&self, out: &mut Vec<u8>) {
        self.creator.pack(out);
        self.name.pack(out);
        self.owner.pack(out);
        self.active.pack(out);
    }
}

impl Unpack for NewAccount {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            creator: Name::unpack(stream)?,
            name: Name::unpack(stream)?,
            owner: Authority::unpack(stream)?,
            active: Authority::unpack(stream)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCode {
    pub account: Name,
    pub vm_type: u8,
    pub vm_version: u8,
    pub code: Vec<u8>,
}

impl Pack for SetCode {
    fn pack(&self, out: &mut Vec<u8>) {
        self.account.pack(out);
        self.vm_type.pack(out);
        self.vm_version.pack(out);
        self.code.pack(out);
    }
}

impl Unpack for SetCode {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            account: Name::unpack(stream)?,
            vm_type: u8::unpack(stream)?,
            vm_version: u8::unpack(stream)?,
            code: Vec::unpack(stream)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAbi {
    pub account: Name,
    pub abi: Vec<u8>,
}

impl Pack for SetAbi {
    fn pack(&self, out: &mut Vec<u8>) {
        self.account.pack(out);
        self.abi.pack(out);
    }
}

impl Unpack for SetAbi {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            account: Name::unpack(stream)?,
            abi: Vec::unpack(stream)?,
        })
    }
}

// ── Account creation ───────────────────────────────────

/// Create an account with owner and active permissions in `shard`.
///
/// Returns the RAM the new account must be billed for.
pub fn initialize_account(
    dbm: &mut DatabaseManager,
    shard: Name,
    name: Name,
    owner: Authority,
    active: Authority,
    privileged: bool,
    creation_date: TimePoint,
) -> Result<i64> {
    dbm.create_account(shard, name, creation_date, privileged)?;

    let shard_db = dbm.db_mut(shard)?;
    if shard_db.find::<AccountMetadataObject>(&name).is_none() {
        shard_db.create::<AccountMetadataObject>(|m| m.name = name)?;
    }

    let ram_delta = OVERHEAD_PER_ACCOUNT_RAM_BYTES
        + 2 * PERMISSION_BILLABLE_SIZE
        + owner.packed_size() as i64
        + active.packed_size() as i64;

    let shared = dbm.shared_db_mut();
    shared.create::<PermissionObject>(|p| {
        p.owner = name;
        p.name = OWNER_PERMISSION;
        p.auth = owner;
        p.last_updated = creation_date;
    })?;
    shared.create::<PermissionObject>(|p| {
        p.owner = name;
        p.name = ACTIVE_PERMISSION;
        p.parent = OWNER_PERMISSION;
        p.auth = active;
        p.last_updated = creation_date;
    })?;
    Ok(ram_delta)
}

/// Delegated permissions must name existing accounts and permissions
fn validate_authority_precondition(context: &ApplyContext<'_, '_>, auth: &Authority) -> Result<()> {
    let control = context.control();
    for weight in &auth.accounts {
        let level = &weight.permission;
        if !context.is_account(level.actor) {
            return Err(Error::ActionValidate(format!(
                "account '{}' does not exist",
                level.actor
            )));
        }
        // owner and active exist for every account; system.code is virtual
        if level.permission == OWNER_PERMISSION
            || level.permission == ACTIVE_PERMISSION
            || level.permission == CODE_PERMISSION
        {
            continue;
        }
        if !control
            .authorization_manager()
            .find_permission(context.shared_db(), level)
        {
            return Err(Error::ActionValidate(format!(
                "permission '{}' does not exist",
                level
            )));
        }
    }
    Ok(())
}

fn apply_system_newaccount(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let create: NewAccount = context.get_action().data_as()?;
    context.require_authorization(create.creator)?;

    if !create.owner.validate() {
        return Err(Error::ActionValidate("Invalid owner authority".into()));
    }
    if !create.active.validate() {
        return Err(Error::ActionValidate("Invalid active authority".into()));
    }
    if create.name.is_empty() {
        return Err(Error::ActionValidate("account name cannot be empty".into()));
    }
    let name_str = create.name.to_string();
    if name_str.len() > 12 {
        return Err(Error::ActionValidate(
            "account names can only be 12 chars long".into(),
        ));
    }

    let creator = context
        .shared_db()
        .get_by_key::<AccountObject>(&create.creator)?;
    if !creator.privileged && name_str.starts_with("system.") {
        return Err(Error::ActionValidate(
            "only privileged accounts can have names that start with 'system.'".into(),
        ));
    }
    if context.is_account(create.name) {
        return Err(Error::ActionValidate(format!(
            "Cannot create account named {}, as that name is already taken",
            create.name
        )));
    }

    validate_authority_precondition(context, &create.owner)?;
    validate_authority_precondition(context, &create.active)?;

    let shard = context.shard_name();
    let creation_date = context.control().pending_block_time();
    let ram_delta = initialize_account(
        context.db_manager_mut(),
        shard,
        create.name,
        create.owner,
        create.active,
        false,
        creation_date,
    )?;
    context.add_ram_usage(create.name, ram_delta);
    debug!(account = %create.name, creator = %create.creator, shard = %shard, "account created");
    Ok(())
}

fn apply_system_setcode(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let act: SetCode = context.get_action().data_as()?;
    context.require_authorization(act.account)?;

    if act.vm_type != 0 {
        return Err(Error::ActionValidate("code should be 0".into()));
    }
    if act.vm_version != 0 {
        return Err(Error::ActionValidate("version should be 0".into()));
    }

    let code_hash = if act.code.is_empty() {
        Digest::default()
    } else {
        Digest::hash(&act.code)
    };

    let account = context.shared_db().get_by_key::<AccountObject>(&act.account)?;
    let existing_code = !account.code_hash.is_zero();
    if act.code.is_empty() && !existing_code {
        return Err(Error::ActionValidate("contract is already cleared".into()));
    }
    if account.code_hash == code_hash {
        return Err(Error::ActionValidate(
            "contract is already running this version of code".into(),
        ));
    }
    let old_size = if existing_code {
        account.code_size as i64 * SETCODE_RAM_BYTES_MULTIPLIER
    } else {
        0
    };
    let new_size = act.code.len() as i64 * SETCODE_RAM_BYTES_MULTIPLIER;

    let shard = context.shard_name();
    let code_size = act.code.len() as u32;
    context
        .db_manager_mut()
        .modify_account(shard, act.account, |a| {
            a.code_hash = code_hash;
            a.vm_type = act.vm_type;
            a.vm_version = act.vm_version;
            a.code_size = code_size;
            a.code_sequence += 1;
        })?;

    if new_size != old_size {
        context.add_ram_usage(act.account, new_size - old_size);
    }
    debug!(account = %act.account, code_hash = %code_hash, "code set");
    Ok(())
}

fn apply_system_setabi(context: &mut ApplyContext<'_, '_>) -> Result<()> {
    let act: SetAbi = context.get_action().data_as()?;
    context.require_authorization(act.account)?;

    let old_size = context
        .shared_db()
        .get_by_key::<AccountObject>(&act.account)?
        .abi
        .len() as i64;
    let new_size = act.abi.len() as i64;

    let shard = context.shard_name();
    context
        .db_manager_mut()
        .modify_account(shard, act.account, |a| {
            a.abi = act.abi.clone();
            a.abi_sequence += 1;
        })?;

    if new_size != old_size {
        context.add_ram_usage(act.account, new_size - old_size);
    }
    Ok(())
}
