//! Persistent chain objects

use serde::{Deserialize, Serialize};

use crate::authority::Authority;
use crate::codec::{pack, DataStream, Pack, Unpack};
use crate::config::KEY_VALUE_BILLABLE_SIZE;
use crate::error::Result;
use crate::name::Name;
use crate::store::{ChainObject, ObjectId};
use crate::transaction::Transaction;
use crate::types::{hex_bytes, Digest, TimePoint, TransactionId};

macro_rules! chain_object {
    ($ty:ty, $type_name:literal, $key:ty, |$obj:ident| $key_expr:expr) => {
        impl ChainObject for $ty {
            const TYPE_NAME: &'static str = $type_name;
            type Key = $key;

            fn id(&self) -> ObjectId {
                self.id
            }

            fn set_id(&mut self, id: ObjectId) {
                self.id = id;
            }

            fn key(&self) -> $key {
                let $obj = self;
                $key_expr
            }
        }
    };
}

/// Account identity and installed code. Accounts are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountObject {
    pub id: ObjectId,
    pub name: Name,
    pub creation_date: TimePoint,
    pub privileged: bool,
    pub code_hash: Digest,
    pub vm_type: u8,
    pub vm_version: u8,
    pub code_sequence: u32,
    pub abi_sequence: u32,
    pub code_size: u32,
    #[serde(with = "hex_bytes")]
    pub abi: Vec<u8>,
}

chain_object!(AccountObject, "account_object", Name, |o| o.name);

/// Per-shard monotonic counters for an account, created on first use
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountMetadataObject {
    pub id: ObjectId,
    pub name: Name,
    pub recv_sequence: u64,
    pub auth_sequence: u64,
}

chain_object!(AccountMetadataObject, "account_metadata_object", Name, |o| o.name);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionObject {
    pub id: ObjectId,
    pub owner: Name,
    pub name: Name,
    /// Parent permission name, empty for `owner`
    pub parent: Name,
    pub auth: Authority,
    pub last_updated: TimePoint,
}

chain_object!(PermissionObject, "permission_object", (Name, Name), |o| (o.owner, o.name));

/// A scheduled deferred transaction, unique on (sender, sender_id)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeneratedTransactionObject {
    pub id: ObjectId,
    pub trx_id: TransactionId,
    pub sender: Name,
    pub sender_id: u128,
    pub payer: Name,
    pub delay_until: TimePoint,
    pub expiration: TimePoint,
    pub published: TimePoint,
    #[serde(with = "hex_bytes")]
    pub packed_trx: Vec<u8>,
    pub shard_name: Name,
}

chain_object!(
    GeneratedTransactionObject,
    "generated_transaction_object",
    (Name, u128),
    |o| (o.sender, o.sender_id)
);

impl GeneratedTransactionObject {
    /// Store the packed transaction, returning its size
    pub fn set(&mut self, trx: &Transaction) -> u32 {
        self.packed_trx = pack(trx);
        self.packed_trx.len() as u32
    }

    pub fn transaction(&self) -> Result<Transaction> {
        crate::codec::unpack(&self.packed_trx)
    }
}

impl Pack for GeneratedTransactionObject {
    fn pack(&self, out: &mut Vec<u8>) {
        self.trx_id.pack(out);
        self.sender.pack(out);
        self.sender_id.pack(out);
        self.payer.pack(out);
        self.published.pack(out);
        self.delay_until.pack(out);
        self.expiration.pack(out);
        self.packed_trx.pack(out);
        self.shard_name.pack(out);
    }
}

impl Unpack for GeneratedTransactionObject {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            id: ObjectId::default(),
            trx_id: Digest::unpack(stream)?,
            sender: Name::unpack(stream)?,
            sender_id: u128::unpack(stream)?,
            payer: Name::unpack(stream)?,
            published: TimePoint::unpack(stream)?,
            delay_until: TimePoint::unpack(stream)?,
            expiration: TimePoint::unpack(stream)?,
            packed_trx: Vec::unpack(stream)?,
            shard_name: Name::unpack(stream)?,
        })
    }
}

/// Chain-wide counters; a single row created lazily
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DynamicGlobalPropertyObject {
    pub id: ObjectId,
    pub global_action_sequence: u64,
}

chain_object!(DynamicGlobalPropertyObject, "dynamic_global_property_object", (), |_o| ());

/// RAM owed back to an account when a replaced deferred record could not
/// be credited directly
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RamCorrectionObject {
    pub id: ObjectId,
    pub name: Name,
    pub ram_correction: u64,
}

chain_object!(RamCorrectionObject, "account_ram_correction_object", Name, |o| o.name);

/// One contract table row, unique on (code, scope, table, primary_key)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyValueObject {
    pub id: ObjectId,
    pub code: Name,
    pub scope: Name,
    pub table: Name,
    pub primary_key: u64,
    pub payer: Name,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

chain_object!(
    KeyValueObject,
    "key_value_object",
    (Name, Name, Name, u64),
    |o| (o.code, o.scope, o.table, o.primary_key)
);

impl KeyValueObject {
    /// RAM billed to the payer for this row
    pub fn billable_size(&self) -> i64 {
        KEY_VALUE_BILLABLE_SIZE + self.value.len() as i64
    }
}
