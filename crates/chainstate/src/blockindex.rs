//! Per-header metadata kept in the block index.

use tapd_consensus::Hash256;
use tapd_primitives::block::BlockHeader;
use tapd_primitives::encoding::{Decodable, DecodeError, Decoder, Encoder};

use crate::flatfiles::FileLocation;

/// Validity levels occupy the low three bits and only ever increase.
pub const BLOCK_VALID_UNKNOWN: u32 = 0;
/// Parsed, version and xfield checked, proof verified, prev known.
pub const BLOCK_VALID_HEADER: u32 = 1;
/// All parents at least header-valid and contextual header checks passed.
pub const BLOCK_VALID_TREE: u32 = 2;
/// Context-free block checks passed; the chain transaction count is known.
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
/// Outputs do not overspend inputs, no double spends, coinbase within fees.
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 0x07;

pub const BLOCK_HAVE_DATA: u32 = 1 << 3;
pub const BLOCK_HAVE_UNDO: u32 = 1 << 4;
pub const BLOCK_HAVE_MASK: u32 = BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO;

pub const BLOCK_FAILED_VALID: u32 = 1 << 5;
pub const BLOCK_FAILED_CHILD: u32 = 1 << 6;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

pub const BLOCK_OPT_WITNESS: u32 = 1 << 7;

/// Stable arena handle for a [`BlockIndexEntry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub parent: Option<EntryId>,
    pub skip: Option<EntryId>,
    /// Order in which the header was first accepted; lower wins height ties.
    /// Loaded entries get zero on the active chain and one elsewhere.
    pub sequence_id: u64,
    pub time_max: u32,
    pub tx_count: u32,
    /// Transactions in this block and all ancestors. Zero until every
    /// ancestor's data is present.
    pub chain_tx: u64,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
}

impl BlockIndexEntry {
    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_block
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    /// Failed entries are never valid at any level.
    pub fn is_valid(&self, level: u32) -> bool {
        !self.is_failed() && self.validity() >= level
    }

    /// Returns `true` if the level went up.
    pub fn raise_validity(&mut self, level: u32) -> bool {
        if self.is_failed() {
            return false;
        }
        if self.validity() < level {
            self.status = (self.status & !BLOCK_VALID_MASK) | level;
            return true;
        }
        false
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        encoder.write_u32_le(self.time_max);
        write_location(&mut encoder, self.data_pos);
        write_location(&mut encoder, self.undo_pos);
        encoder.into_inner()
    }

    /// Links and sequence id are rebuilt by the index on load.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let time_max = decoder.read_u32_le()?;
        let data_pos = read_location(&mut decoder)?;
        let undo_pos = read_location(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash: header.hash(),
            header,
            height,
            status,
            parent: None,
            skip: None,
            sequence_id: 0,
            time_max,
            tx_count,
            chain_tx: 0,
            data_pos,
            undo_pos,
        })
    }
}

fn write_location(encoder: &mut Encoder, location: Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_u8(1);
            encoder.write_bytes(&location.encode());
        }
        None => encoder.write_u8(0),
    }
}

fn read_location(decoder: &mut Decoder) -> Result<Option<FileLocation>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => {
            let bytes = decoder.read_fixed::<{ FileLocation::ENCODED_LEN }>()?;
            FileLocation::decode(&bytes)
                .map(Some)
                .ok_or(DecodeError::InvalidData("file location"))
        }
        _ => Err(DecodeError::InvalidData("file location tag")),
    }
}
