//! Legacy signature hashing.

use tapd_consensus::Hash256;
use tapd_primitives::encoding::{Encodable, Encoder};
use tapd_primitives::hash::sha256d;
use tapd_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined(self) -> bool {
        matches!(self.base_type(), SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE)
            && self.0 & !(0x1f | SIGHASH_ANYONECANPAY) == 0
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Serialization pieces shared by every input's SIGHASH_ALL digest.
#[derive(Clone, Debug)]
pub struct PrecomputedTxData {
    outputs: Vec<u8>,
}

impl PrecomputedTxData {
    pub fn new(tx: &Transaction) -> Self {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(tx.vout.len() as u64);
        for output in &tx.vout {
            output.consensus_encode(&mut encoder);
        }
        Self {
            outputs: encoder.into_inner(),
        }
    }
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
    precomputed: Option<&PrecomputedTxData>,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return Err(SighashError::MissingOutput);
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    let mut encoder = Encoder::with_capacity(tx.vin.len() * 41 + script_code.len() + 64);
    encoder.write_i32_le(tx.features);

    let signing_inputs: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.vin.len()).collect()
    };
    encoder.write_compact_size(signing_inputs.len() as u64);
    for index in signing_inputs {
        let input = &tx.vin[index];
        input.prevout.consensus_encode(&mut encoder);
        if index == input_index {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_compact_size(0);
        }
        if index != input_index && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    if hash_none {
        encoder.write_compact_size(0);
    } else if hash_single {
        encoder.write_compact_size(input_index as u64 + 1);
        for _ in 0..input_index {
            encoder.write_i64_le(-1);
            encoder.write_compact_size(0);
        }
        tx.vout[input_index].consensus_encode(&mut encoder);
    } else if let Some(precomputed) = precomputed {
        encoder.write_bytes(&precomputed.outputs);
    } else {
        encoder.write_bytes(&PrecomputedTxData::new(tx).outputs);
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    Ok(sha256d(&encoder.into_inner()))
}
