//! Transactions, extensions and the packed wire form

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::codec::{pack, unpack, DataStream, Pack, Unpack, VarUint32};
use crate::config::{FIXED_NET_OVERHEAD_OF_PACKED_TRX, MAIN_SHARD};
use crate::error::{Error, Result};
use crate::name::Name;
use crate::types::{hex_bytes, hex_bytes_vec, BlockId, Digest, TimePointSec, TransactionId};

/// Upper bound on decompressed payloads
const MAX_DECOMPRESSED_SIZE: u64 = 10 * 1024 * 1024;

// ── Header ─────────────────────────────────────────────

/// Fields shared by every transaction regardless of content
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionHeader {
    pub expiration: TimePointSec,
    pub ref_block_num: u16,
    pub ref_block_prefix: u32,
    /// Upper limit on net usage in 8-byte words, 0 for no limit
    pub max_net_usage_words: u32,
    /// Upper limit on cpu time in milliseconds, 0 for no limit
    pub max_cpu_usage_ms: u8,
    /// Seconds to delay execution
    pub delay_sec: u32,
}

impl TransactionHeader {
    /// Bind the transaction to `reference_block` for TaPoS
    pub fn set_reference_block(&mut self, reference_block: &BlockId) {
        let first = u32::from_be_bytes([
            reference_block.0[0],
            reference_block.0[1],
            reference_block.0[2],
            reference_block.0[3],
        ]);
        self.ref_block_num = first as u16;
        self.ref_block_prefix = reference_block.word(1) as u32;
    }

    pub fn verify_reference_block(&self, reference_block: &BlockId) -> bool {
        let mut expected = self.clone();
        expected.set_reference_block(reference_block);
        expected.ref_block_num == self.ref_block_num
            && expected.ref_block_prefix == self.ref_block_prefix
    }
}

impl Pack for TransactionHeader {
    fn pack(&self, out: &mut Vec<u8>) {
        self.expiration.pack(out);
        self.ref_block_num.pack(out);
        self.ref_block_prefix.pack(out);
        VarUint32(self.max_net_usage_words).pack(out);
        self.max_cpu_usage_ms.pack(out);
        VarUint32(self.delay_sec).pack(out);
    }
}

impl Unpack for TransactionHeader {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            expiration: TimePointSec::unpack(stream)?,
            ref_block_num: u16::unpack(stream)?,
            ref_block_prefix: u32::unpack(stream)?,
            max_net_usage_words: VarUint32::unpack(stream)?.0,
            max_cpu_usage_ms: u8::unpack(stream)?,
            delay_sec: VarUint32::unpack(stream)?.0,
        })
    }
}

// ── Extensions ─────────────────────────────────────────

/// Raw `(id, payload)` extension entry as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionEntry {
    pub id: u16,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl Pack for ExtensionEntry {
    fn pack(&self, out: &mut Vec<u8>) {
        self.id.pack(out);
        self.data.pack(out);
    }
}

impl Unpack for ExtensionEntry {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            id: u16::unpack(stream)?,
            data: Vec::unpack(stream)?,
        })
    }
}

/// Provenance stamped on a deferred transaction by its sender
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeferredTransactionGenerationContext {
    pub sender_trx_id: TransactionId,
    pub sender_id: u128,
    pub sender: Name,
}

impl DeferredTransactionGenerationContext {
    pub const EXTENSION_ID: u16 = 0;
}

impl Pack for DeferredTransactionGenerationContext {
    fn pack(&self, out: &mut Vec<u8>) {
        self.sender_trx_id.pack(out);
        self.sender_id.pack(out);
        self.sender.pack(out);
    }
}

impl Unpack for DeferredTransactionGenerationContext {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            sender_trx_id: Digest::unpack(stream)?,
            sender_id: u128::unpack(stream)?,
            sender: Name::unpack(stream)?,
        })
    }
}

/// Kind of shard a transaction targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardType {
    #[default]
    Normal,
    Privacy,
}

impl Pack for ShardType {
    fn pack(&self, out: &mut Vec<u8>) {
        let tag: u8 = match self {
            ShardType::Normal => 0,
            ShardType::Privacy => 1,
        };
        tag.pack(out);
    }
}

impl Unpack for ShardType {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        match u8::unpack(stream)? {
            0 => Ok(ShardType::Normal),
            1 => Ok(ShardType::Privacy),
            other => Err(Error::Codec(format!("unknown shard type {}", other))),
        }
    }
}

/// Shard a transaction executes against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionShard {
    pub shard_name: Name,
    pub shard_type: ShardType,
}

impl TransactionShard {
    pub const EXTENSION_ID: u16 = 1;
}

impl Default for TransactionShard {
    fn default() -> Self {
        Self {
            shard_name: MAIN_SHARD,
            shard_type: ShardType::Normal,
        }
    }
}

impl Pack for TransactionShard {
    fn pack(&self, out: &mut Vec<u8>) {
        self.shard_name.pack(out);
        self.shard_type.pack(out);
    }
}

impl Unpack for TransactionShard {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            shard_name: Name::unpack(stream)?,
            shard_type: ShardType::unpack(stream)?,
        })
    }
}

/// Decoded transaction extension.
///
/// Ids this build does not know stay opaque so they survive a round trip;
/// call sites that need to reject them do so explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionExtension {
    GenerationContext(DeferredTransactionGenerationContext),
    Shard(TransactionShard),
    Unknown { id: u16, data: Vec<u8> },
}

impl TransactionExtension {
    pub fn id(&self) -> u16 {
        match self {
            TransactionExtension::GenerationContext(_) => {
                DeferredTransactionGenerationContext::EXTENSION_ID
            }
            TransactionExtension::Shard(_) => TransactionShard::EXTENSION_ID,
            TransactionExtension::Unknown { id, .. } => *id,
        }
    }

    fn decode(entry: &ExtensionEntry) -> Result<Self> {
        let decoded = match entry.id {
            DeferredTransactionGenerationContext::EXTENSION_ID => {
                TransactionExtension::GenerationContext(unpack(&entry.data)?)
            }
            TransactionShard::EXTENSION_ID => TransactionExtension::Shard(unpack(&entry.data)?),
            id => TransactionExtension::Unknown {
                id,
                data: entry.data.clone(),
            },
        };
        Ok(decoded)
    }
}

// ── Transaction ────────────────────────────────────────

/// A header plus context-free actions, regular actions and extensions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub header: TransactionHeader,
    #[serde(default)]
    pub context_free_actions: Vec<Action>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub transaction_extensions: Vec<ExtensionEntry>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        Digest::of(self)
    }

    /// Decode extensions, enforcing ascending ids and uniqueness of known ids
    pub fn validate_and_extract_extensions(&self) -> Result<Vec<TransactionExtension>> {
        let mut results: Vec<TransactionExtension> = Vec::new();
        let mut previous: Option<u16> = None;
        for entry in &self.transaction_extensions {
            if let Some(prev) = previous {
                if entry.id < prev {
                    return Err(Error::InvalidTransactionExtension(
                        "transaction extensions are not in the correct order (ascending id types required)".into(),
                    ));
                }
            }
            let decoded = TransactionExtension::decode(entry).map_err(|e| {
                Error::InvalidTransactionExtension(format!(
                    "unable to decode extension with id {}: {}",
                    entry.id, e
                ))
            })?;
            let known = !matches!(decoded, TransactionExtension::Unknown { .. });
            if known && previous == Some(entry.id) {
                return Err(Error::InvalidTransactionExtension(format!(
                    "transaction extension with id type {} is not allowed to repeat",
                    entry.id
                )));
            }
            previous = Some(entry.id);
            results.push(decoded);
        }
        Ok(results)
    }

    /// Insert an extension after any existing entries with the same or lower id
    pub fn emplace_extension(&mut self, id: u16, data: Vec<u8>) {
        let pos = self
            .transaction_extensions
            .iter()
            .position(|e| e.id > id)
            .unwrap_or(self.transaction_extensions.len());
        self.transaction_extensions
            .insert(pos, ExtensionEntry { id, data });
    }

    /// Target shard, the main shard when no shard extension is present
    pub fn shard(&self) -> Result<TransactionShard> {
        for ext in self.validate_and_extract_extensions()? {
            if let TransactionExtension::Shard(shard) = ext {
                return Ok(shard);
            }
        }
        Ok(TransactionShard::default())
    }

    /// Replace or add the shard extension
    pub fn set_shard(&mut self, shard: TransactionShard) {
        self.transaction_extensions
            .retain(|e| e.id != TransactionShard::EXTENSION_ID);
        self.emplace_extension(TransactionShard::EXTENSION_ID, pack(&shard));
    }

    /// Actor of the first authorization on any action
    pub fn first_authorizer(&self) -> Option<Name> {
        self.actions
            .iter()
            .flat_map(|a| a.authorization.iter())
            .map(|level| level.actor)
            .next()
    }

    pub fn total_actions(&self) -> usize {
        self.context_free_actions.len() + self.actions.len()
    }

    /// Full 32-bit block number implied by the 16-bit reference
    pub fn get_ref_blocknum(&self, head_blocknum: u32) -> u32 {
        ((head_blocknum / 0xffff) * 0xffff) + head_blocknum % 0xffff
    }
}

impl Pack for Transaction {
    fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        self.context_free_actions.pack(out);
        self.actions.pack(out);
        self.transaction_extensions.pack(out);
    }
}

impl Unpack for Transaction {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            header: TransactionHeader::unpack(stream)?,
            context_free_actions: Vec::unpack(stream)?,
            actions: Vec::unpack(stream)?,
            transaction_extensions: Vec::unpack(stream)?,
        })
    }
}

/// Derive a deferred sender id from a transaction id
pub fn transaction_id_to_sender_id(tid: &TransactionId) -> u128 {
    ((tid.word(3) as u128) << 64) | tid.word(2) as u128
}

/// Transaction with signatures and context-free data attached
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    #[serde(with = "hex_bytes_vec", default)]
    pub signatures: Vec<Vec<u8>>,
    #[serde(with = "hex_bytes_vec", default)]
    pub context_free_data: Vec<Vec<u8>>,
}

impl SignedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            ..Default::default()
        }
    }
}

// ── Packed form ────────────────────────────────────────

/// Payload compression of a packed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    #[default]
    None,
    Zlib,
}

impl Pack for CompressionType {
    fn pack(&self, out: &mut Vec<u8>) {
        let tag: u8 = match self {
            CompressionType::None => 0,
            CompressionType::Zlib => 1,
        };
        tag.pack(out);
    }
}

impl Unpack for CompressionType {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        match u8::unpack(stream)? {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zlib),
            other => Err(Error::Codec(format!("unknown compression type {}", other))),
        }
    }
}

fn compress(data: Vec<u8>, compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data),
        CompressionType::Zlib => {
            let codec_err = |e: std::io::Error| Error::Codec(format!("zlib compression failed: {}", e));
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data).map_err(codec_err)?;
            encoder.finish().map_err(codec_err)
        }
    }
}

fn decompress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zlib => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .take(MAX_DECOMPRESSED_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| Error::Codec(format!("zlib decompression failed: {}", e)))?;
            if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
                return Err(Error::Codec("decompressed payload exceeds limit".into()));
            }
            Ok(out)
        }
    }
}

/// Wire form of a signed transaction, with the decoded copy and id cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTransaction {
    compression: CompressionType,
    packed_context_free_data: Vec<u8>,
    packed_trx: Vec<u8>,
    unpacked: SignedTransaction,
    id: TransactionId,
}

impl PackedTransaction {
    pub fn new(trx: SignedTransaction, compression: CompressionType) -> Result<Self> {
        let packed_trx = compress(pack(&trx.transaction), compression)?;
        let packed_context_free_data = if trx.context_free_data.is_empty() {
            Vec::new()
        } else {
            compress(pack(&trx.context_free_data), compression)?
        };
        let id = trx.transaction.id();
        Ok(Self {
            compression,
            packed_context_free_data,
            packed_trx,
            unpacked: trx,
            id,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn transaction(&self) -> &Transaction {
        &self.unpacked.transaction
    }

    pub fn signed_transaction(&self) -> &SignedTransaction {
        &self.unpacked
    }

    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.unpacked.signatures
    }

    pub fn context_free_data(&self) -> &[Vec<u8>] {
        &self.unpacked.context_free_data
    }

    pub fn packed_trx(&self) -> &[u8] {
        &self.packed_trx
    }

    /// Uncompressed transaction encoding
    pub fn raw_transaction(&self) -> Vec<u8> {
        match self.compression {
            CompressionType::None => self.packed_trx.clone(),
            CompressionType::Zlib => pack(&self.unpacked.transaction),
        }
    }

    pub fn unprunable_size(&self) -> u64 {
        FIXED_NET_OVERHEAD_OF_PACKED_TRX + self.packed_trx.len() as u64
    }

    pub fn prunable_size(&self) -> u64 {
        (self.unpacked.signatures.packed_size() + self.packed_context_free_data.len()) as u64
    }
}

impl Pack for PackedTransaction {
    fn pack(&self, out: &mut Vec<u8>) {
        self.unpacked.signatures.pack(out);
        self.compression.pack(out);
        self.packed_context_free_data.pack(out);
        self.packed_trx.pack(out);
    }
}

impl Unpack for PackedTransaction {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        let signatures: Vec<Vec<u8>> = Vec::unpack(stream)?;
        let compression = CompressionType::unpack(stream)?;
        let packed_context_free_data: Vec<u8> = Vec::unpack(stream)?;
        let packed_trx: Vec<u8> = Vec::unpack(stream)?;

        let transaction: Transaction = unpack(&decompress(&packed_trx, compression)?)?;
        let context_free_data = if packed_context_free_data.is_empty() {
            Vec::new()
        } else {
            unpack(&decompress(&packed_context_free_data, compression)?)?
        };
        let id = transaction.id();
        Ok(Self {
            compression,
            packed_context_free_data,
            packed_trx,
            unpacked: SignedTransaction {
                transaction,
                signatures,
                context_free_data,
            },
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PermissionLevel;

    fn n(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn sample() -> Transaction {
        Transaction {
            header: TransactionHeader {
                expiration: TimePointSec(1_000),
                ref_block_num: 7,
                ref_block_prefix: 0xdead_beef,
                max_net_usage_words: 300,
                max_cpu_usage_ms: 5,
                delay_sec: 0,
            },
            context_free_actions: vec![],
            actions: vec![Action::new(
                n("token"),
                n("transfer"),
                vec![PermissionLevel::new(n("alice"), n("active"))],
                vec![0xab; 64],
            )],
            transaction_extensions: vec![],
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = pack(&sample().header);
        // 4 + 2 + 4 + varuint(300)=2 + 1 + varuint(0)=1
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[10..12], &[0xac, 0x02]);
    }

    #[test]
    fn test_id_is_digest_of_packed_form() {
        let trx = sample();
        assert_eq!(trx.id(), Digest::hash(&pack(&trx)));
    }

    #[test]
    fn test_reference_block() {
        let mut block = [0u8; 32];
        block[0..4].copy_from_slice(&[0x00, 0x00, 0x12, 0x34]);
        block[8..12].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        let block = Digest(block);
        let mut header = TransactionHeader::default();
        header.set_reference_block(&block);
        assert_eq!(header.ref_block_num, 0x1234);
        assert_eq!(header.ref_block_prefix, 0x1234_5678);
        assert!(header.verify_reference_block(&block));
        assert!(!header.verify_reference_block(&Digest::default()));
    }

    #[test]
    fn test_default_shard_is_main() {
        assert_eq!(sample().shard().unwrap().shard_name, MAIN_SHARD);
    }

    #[test]
    fn test_set_shard_replaces_existing() {
        let mut trx = sample();
        trx.set_shard(TransactionShard {
            shard_name: n("shard1"),
            shard_type: ShardType::Normal,
        });
        trx.set_shard(TransactionShard {
            shard_name: n("shard2"),
            shard_type: ShardType::Privacy,
        });
        assert_eq!(trx.transaction_extensions.len(), 1);
        let shard = trx.shard().unwrap();
        assert_eq!(shard.shard_name, n("shard2"));
        assert_eq!(shard.shard_type, ShardType::Privacy);
    }

    #[test]
    fn test_extensions_must_ascend() {
        let mut trx = sample();
        trx.transaction_extensions = vec![
            ExtensionEntry {
                id: 1,
                data: pack(&TransactionShard::default()),
            },
            ExtensionEntry {
                id: 0,
                data: pack(&DeferredTransactionGenerationContext::default()),
            },
        ];
        assert!(matches!(
            trx.validate_and_extract_extensions(),
            Err(Error::InvalidTransactionExtension(_))
        ));
    }

    #[test]
    fn test_known_extension_must_not_repeat() {
        let mut trx = sample();
        let ctx = pack(&DeferredTransactionGenerationContext::default());
        trx.emplace_extension(0, ctx.clone());
        trx.emplace_extension(0, ctx);
        assert!(trx.validate_and_extract_extensions().is_err());
    }

    #[test]
    fn test_unknown_extension_survives_roundtrip() {
        let mut trx = sample();
        trx.emplace_extension(9, vec![1, 2, 3]);
        trx.emplace_extension(0, pack(&DeferredTransactionGenerationContext::default()));
        assert_eq!(trx.transaction_extensions[0].id, 0);

        let decoded: Transaction = unpack(&pack(&trx)).unwrap();
        assert_eq!(decoded, trx);
        let exts = decoded.validate_and_extract_extensions().unwrap();
        assert_eq!(
            exts[1],
            TransactionExtension::Unknown {
                id: 9,
                data: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn test_malformed_known_extension_rejected() {
        let mut trx = sample();
        trx.emplace_extension(1, vec![1, 2]);
        assert!(matches!(
            trx.validate_and_extract_extensions(),
            Err(Error::InvalidTransactionExtension(_))
        ));
    }

    #[test]
    fn test_sender_id_uses_upper_words() {
        let mut bytes = [0u8; 32];
        bytes[16] = 0x01;
        bytes[24] = 0x02;
        let id = transaction_id_to_sender_id(&Digest(bytes));
        assert_eq!(id, (2u128 << 64) | 1);
    }

    #[test]
    fn test_packed_zlib_roundtrip() {
        let mut signed = SignedTransaction::new(sample());
        signed.context_free_data = vec![vec![5; 10]];
        signed.signatures = vec![vec![1; 65]];
        let packed = PackedTransaction::new(signed.clone(), CompressionType::Zlib).unwrap();
        assert_eq!(packed.raw_transaction(), pack(&signed.transaction));

        let decoded: PackedTransaction = unpack(&pack(&packed)).unwrap();
        assert_eq!(decoded.id(), signed.transaction.id());
        assert_eq!(decoded.signed_transaction(), &signed);
        assert_eq!(decoded.compression(), CompressionType::Zlib);
    }

    #[test]
    fn test_packed_sizes() {
        let packed = PackedTransaction::new(SignedTransaction::new(sample()), CompressionType::None)
            .unwrap();
        assert_eq!(
            packed.unprunable_size(),
            FIXED_NET_OVERHEAD_OF_PACKED_TRX + pack(packed.transaction()).len() as u64
        );
        // empty signature list packs as one length byte
        assert_eq!(packed.prunable_size(), 1);
    }

    #[test]
    fn test_transaction_json_flattens_header() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["ref_block_num"], 7);
        assert_eq!(json["actions"][0]["account"], "token");
    }
}
