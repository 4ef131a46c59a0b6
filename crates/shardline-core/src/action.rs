//! Actions, receipts and action traces

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{pack, DataStream, Pack, Unpack, VarUint32};
use crate::error::{Error, Result};
use crate::name::Name;
use crate::types::{hex_bytes, Digest, Microseconds, TransactionId};

/// An (actor, permission) pair declared as authorizing an action
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PermissionLevel {
    pub actor: Name,
    pub permission: Name,
}

impl PermissionLevel {
    pub fn new(actor: Name, permission: Name) -> Self {
        Self { actor, permission }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.permission)
    }
}

impl Pack for PermissionLevel {
    fn pack(&self, out: &mut Vec<u8>) {
        self.actor.pack(out);
        self.permission.pack(out);
    }
}

impl Unpack for PermissionLevel {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            actor: Name::unpack(stream)?,
            permission: Name::unpack(stream)?,
        })
    }
}

/// A single contract invocation: target code account, action name,
/// declared authorizations and an opaque argument payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Action {
    pub account: Name,
    pub name: Name,
    #[serde(default)]
    pub authorization: Vec<PermissionLevel>,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
}

impl Action {
    pub fn new(
        account: Name,
        name: Name,
        authorization: Vec<PermissionLevel>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            account,
            name,
            authorization,
            data,
        }
    }

    /// Decode the payload as `T`
    pub fn data_as<T: Unpack>(&self) -> Result<T> {
        crate::codec::unpack(&self.data)
            .map_err(|e| e.context(format!("unable to decode {}::{} payload", self.account, self.name)))
    }

    /// Packed account, name and authorization, without the payload
    pub fn pack_base(&self, out: &mut Vec<u8>) {
        self.account.pack(out);
        self.name.pack(out);
        self.authorization.pack(out);
    }
}

impl Pack for Action {
    fn pack(&self, out: &mut Vec<u8>) {
        self.pack_base(out);
        self.data.pack(out);
    }
}

impl Unpack for Action {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            account: Name::unpack(stream)?,
            name: Name::unpack(stream)?,
            authorization: Vec::unpack(stream)?,
            data: Vec::unpack(stream)?,
        })
    }
}

/// Digest committing to an action together with its return value.
///
/// `hash` is invoked for every hashing step so callers can interleave
/// deadline checks.
pub fn generate_action_digest<H>(mut hash: H, act: &Action, return_value: &[u8]) -> Result<Digest>
where
    H: FnMut(&[u8]) -> Result<Digest>,
{
    let mut base = Vec::new();
    act.pack_base(&mut base);
    let hashes_0 = hash(&base)?;

    let mut data = pack(&act.data);
    return_value.to_vec().pack(&mut data);
    let hashes_1 = hash(&data)?;

    let mut both = Vec::with_capacity(64);
    both.extend_from_slice(&hashes_0.0);
    both.extend_from_slice(&hashes_1.0);
    hash(&both)
}

// ── Receipts ───────────────────────────────────────────

/// Proof that an action executed on a receiver
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub receiver: Name,
    pub act_digest: Digest,
    pub global_sequence: u64,
    pub recv_sequence: u64,
    pub auth_sequence: BTreeMap<Name, u64>,
    pub code_sequence: u32,
    pub abi_sequence: u32,
}

impl ActionReceipt {
    pub fn digest(&self) -> Digest {
        Digest::of(self)
    }
}

impl Pack for ActionReceipt {
    fn pack(&self, out: &mut Vec<u8>) {
        self.receiver.pack(out);
        self.act_digest.pack(out);
        self.global_sequence.pack(out);
        self.recv_sequence.pack(out);
        self.auth_sequence.pack(out);
        VarUint32(self.code_sequence).pack(out);
        VarUint32(self.abi_sequence).pack(out);
    }
}

impl Unpack for ActionReceipt {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            receiver: Name::unpack(stream)?,
            act_digest: Digest::unpack(stream)?,
            global_sequence: u64::unpack(stream)?,
            recv_sequence: u64::unpack(stream)?,
            auth_sequence: BTreeMap::unpack(stream)?,
            code_sequence: VarUint32::unpack(stream)?.0,
            abi_sequence: VarUint32::unpack(stream)?.0,
        })
    }
}

// ── Traces ─────────────────────────────────────────────

/// Net storage delta attributed to one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountDelta {
    pub account: Name,
    pub delta: i64,
}

/// Serializable snapshot of a captured fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceError {
    pub message: String,
    pub log: Vec<String>,
}

impl From<&Error> for TraceError {
    fn from(err: &Error) -> Self {
        Self {
            message: err.root().to_string(),
            log: err.log(),
        }
    }
}

/// Per-action execution record within a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    /// 1-based position in the transaction's trace list
    pub action_ordinal: u32,
    /// Ordinal of the action that scheduled this one, 0 for top level
    pub creator_action_ordinal: u32,
    pub closest_unnotified_ancestor_action_ordinal: u32,
    pub receipt: Option<ActionReceipt>,
    pub receiver: Name,
    pub act: Action,
    pub context_free: bool,
    pub elapsed: Microseconds,
    pub console: String,
    pub trx_id: TransactionId,
    pub account_ram_deltas: Vec<AccountDelta>,
    pub except: Option<TraceError>,
    pub error_code: Option<u64>,
    #[serde(with = "hex_bytes")]
    pub return_value: Vec<u8>,
}

impl ActionTrace {
    pub fn new(
        trx_id: TransactionId,
        act: Action,
        receiver: Name,
        context_free: bool,
        action_ordinal: u32,
        creator_action_ordinal: u32,
        closest_unnotified_ancestor_action_ordinal: u32,
    ) -> Self {
        Self {
            action_ordinal,
            creator_action_ordinal,
            closest_unnotified_ancestor_action_ordinal,
            receipt: None,
            receiver,
            act,
            context_free,
            elapsed: Microseconds::default(),
            console: String::new(),
            trx_id,
            account_ram_deltas: Vec::new(),
            except: None,
            error_code: None,
            return_value: Vec::new(),
        }
    }
}
