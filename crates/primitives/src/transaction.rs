//! Transaction types and serialization.

use tapd_consensus::money::{checked_money_add, Amount};
use tapd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn encode_into(&self, encoder: &mut Encoder, blank_script_sig: bool) {
        self.prevout.consensus_encode(encoder);
        if blank_script_sig {
            encoder.write_compact_size(0);
        } else {
            encoder.write_var_bytes(&self.script_sig);
        }
        encoder.write_u32_le(self.sequence);
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_into(encoder, false);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Serialized in the slot Bitcoin uses for the version.
    pub features: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub const CURRENT_FEATURES: i32 = 1;

    fn encode_with(&self, blank_script_sigs: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(10 + self.vin.len() * 41 + self.vout.len() * 34);
        encoder.write_i32_le(self.features);
        encoder.write_compact_size(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_into(&mut encoder, blank_script_sigs);
        }
        encoder.write_compact_size(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with(false)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    /// Malleability-fixed identifier: unlocking scripts are left out, so a
    /// third party re-encoding signatures cannot change it.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_with(true))
    }

    /// Hash over the full serialization, unlocking scripts included.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn total_size(&self) -> usize {
        self.consensus_encode().len()
    }

    /// A coinbase spends a single input with an all-zero previous hash; its
    /// previous index carries the block height.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.hash == [0u8; 32]
    }

    /// Sum of output values, `None` if any value or the running total leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        self.vout
            .iter()
            .try_fold(0, |total, output| checked_money_add(total, output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.encode_with(false));
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let features = decoder.read_i32_le()?;
        let input_count = decoder.read_compact_size()?;
        let mut vin = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_compact_size()?;
        let mut vout = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            features,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            features: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn txid_ignores_unlocking_script() {
        let tx = sample();
        let mut resigned = tx.clone();
        resigned.vin[0].script_sig = vec![0x00, 0x51];
        assert_eq!(tx.txid(), resigned.txid());
        assert_ne!(tx.hash(), resigned.hash());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = sample().consensus_encode();
        assert_eq!(Transaction::consensus_decode(&bytes), Ok(sample()));
        bytes.push(0);
        assert_eq!(
            Transaction::consensus_decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn coinbase_shape() {
        let mut tx = sample();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::new([0u8; 32], 12);
        assert!(tx.is_coinbase());
    }
}
