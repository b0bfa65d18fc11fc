//! Block header, xfield and block types.

use tapd_consensus::constants::AGGREGATE_PUBKEY_SIZE;
use tapd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum XFieldKind {
    AggregatePubkey = 1,
    MaxBlockSize = 2,
}

impl XFieldKind {
    pub const ALL: [XFieldKind; 2] = [XFieldKind::AggregatePubkey, XFieldKind::MaxBlockSize];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(XFieldKind::AggregatePubkey),
            2 => Some(XFieldKind::MaxBlockSize),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XFieldKind::AggregatePubkey => "aggpubkey",
            XFieldKind::MaxBlockSize => "maxblocksize",
        }
    }
}

/// Auxiliary header field announcing a federation parameter change.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum XField {
    #[default]
    None,
    /// New aggregate signer key. Must be a 33-byte compressed point to be well-formed.
    AggregatePubkey(Vec<u8>),
    MaxBlockSize(u32),
}

impl XField {
    pub fn kind(&self) -> Option<XFieldKind> {
        match self {
            XField::None => None,
            XField::AggregatePubkey(_) => Some(XFieldKind::AggregatePubkey),
            XField::MaxBlockSize(_) => Some(XFieldKind::MaxBlockSize),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        match self {
            XField::None => true,
            XField::AggregatePubkey(key) => {
                key.len() == AGGREGATE_PUBKEY_SIZE && matches!(key[0], 0x02 | 0x03)
            }
            XField::MaxBlockSize(size) => *size > 0,
        }
    }

    /// Encodes the payload only, without the kind byte.
    pub fn encode_value(&self, encoder: &mut Encoder) {
        match self {
            XField::None => {}
            XField::AggregatePubkey(key) => encoder.write_var_bytes(key),
            XField::MaxBlockSize(size) => encoder.write_u32_le(*size),
        }
    }

    pub fn decode_value(kind: XFieldKind, decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match kind {
            XFieldKind::AggregatePubkey => Ok(XField::AggregatePubkey(decoder.read_var_bytes()?)),
            XFieldKind::MaxBlockSize => Ok(XField::MaxBlockSize(decoder.read_u32_le()?)),
        }
    }
}

impl Encodable for XField {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.kind().map(|kind| kind as u8).unwrap_or(0));
        self.encode_value(encoder);
    }
}

impl Decodable for XField {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            0 => Ok(XField::None),
            raw => {
                let kind =
                    XFieldKind::from_u8(raw).ok_or(DecodeError::InvalidData("unknown xfield type"))?;
                XField::decode_value(kind, decoder)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    /// Merkle root over malleability-fixed transaction ids.
    pub im_merkle_root: Hash256,
    pub time: u32,
    pub xfield: XField,
    /// Aggregate signature over [`BlockHeader::signable_hash`].
    pub proof: Vec<u8>,
}

impl BlockHeader {
    fn encode_with_mode(&self, include_proof: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(180);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_hash(&self.im_merkle_root);
        encoder.write_u32_le(self.time);
        self.xfield.consensus_encode(&mut encoder);
        if include_proof {
            encoder.write_var_bytes(&self.proof);
        }
        encoder.into_inner()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_mode(true)
    }

    /// Message the federation signs: every field except the proof.
    pub fn signable_hash(&self) -> Hash256 {
        sha256d(&self.encode_with_mode(false))
    }

    /// Block identity, proof included.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            im_merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            xfield: XField::consensus_decode(decoder)?,
            proof: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            Encodable::consensus_encode(tx, &mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        let count = decoder.read_compact_size()?;
        let mut transactions = Vec::with_capacity(count.min(4096) as usize);
        for index in 0..count {
            let tx = <Transaction as Decodable>::consensus_decode(&mut decoder)
                .map_err(|error| BlockDecodeError::Transaction { index, error })?;
            transactions.push(tx);
        }
        if !decoder.is_empty() {
            return Err(BlockDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    /// Returns the transaction merkle root and whether the tree was mutated.
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        let leaves: Vec<Hash256> = self.transactions.iter().map(Transaction::hash).collect();
        compute_merkle_root(&leaves)
    }

    pub fn compute_im_merkle_root(&self) -> (Hash256, bool) {
        let leaves: Vec<Hash256> = self.transactions.iter().map(Transaction::txid).collect();
        compute_merkle_root(&leaves)
    }
}

/// Bitcoin merkle tree. The flag reports a duplicated adjacent pair at any
/// level, which lets two distinct transaction lists share a root.
pub fn compute_merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    (level[0], mutated)
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Transaction { index: u64, error: DecodeError },
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
            BlockDecodeError::Transaction { index, error } => {
                write!(f, "transaction {index}: {error}")
            }
        }
    }
}

impl std::error::Error for BlockDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(xfield: XField) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            im_merkle_root: [3u8; 32],
            time: 1_600_000_000,
            xfield,
            proof: vec![0x30, 0x44, 0x01],
        }
    }

    #[test]
    fn proof_is_excluded_from_signable_hash() {
        let a = header(XField::None);
        let mut b = a.clone();
        b.proof = vec![0x30, 0x45, 0x02];
        assert_eq!(a.signable_hash(), b.signable_hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn xfield_round_trips_through_header() {
        for xfield in [
            XField::None,
            XField::AggregatePubkey(vec![0x02; 33]),
            XField::MaxBlockSize(2_000_000),
        ] {
            let original = header(xfield);
            let decoded =
                BlockHeader::consensus_decode(&original.consensus_encode()).expect("decode");
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn aggregate_pubkey_length_decides_well_formedness() {
        assert!(XField::AggregatePubkey(vec![0x03; 33]).is_well_formed());
        assert!(!XField::AggregatePubkey(vec![0x03; 10]).is_well_formed());
        assert!(!XField::MaxBlockSize(0).is_well_formed());
    }

    #[test]
    fn unknown_xfield_type_fails_decode() {
        let mut bytes = header(XField::None).consensus_encode();
        // kind byte sits right after version, three hashes and time.
        bytes[4 + 96 + 4] = 9;
        assert!(BlockHeader::consensus_decode(&bytes).is_err());
    }

    #[test]
    fn merkle_detects_duplicate_pair() {
        let (root, mutated) = compute_merkle_root(&[[1u8; 32], [2u8; 32], [3u8; 32]]);
        let (dup_root, dup_mutated) =
            compute_merkle_root(&[[1u8; 32], [2u8; 32], [3u8; 32], [3u8; 32]]);
        assert_eq!(root, dup_root);
        assert!(!mutated);
        assert!(dup_mutated);
    }
}
