use tapd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// Coins consumed by one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Everything needed to roll a connected block back. The coinbase has no entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_compact_size(tx.spent.len() as u64);
            for coin in &tx.spent {
                encoder.write_bytes(&coin.encode());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_compact_size()? as usize;
        let mut txs = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let spent_count = decoder.read_compact_size()? as usize;
            let mut spent = Vec::with_capacity(spent_count.min(4096));
            for _ in 0..spent_count {
                spent.push(Coin::decode_from(&mut decoder)?);
            }
            txs.push(TxUndo { spent });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }

    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|tx| tx.spent.len()).sum()
    }
}
