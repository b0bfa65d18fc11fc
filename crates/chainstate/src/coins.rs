//! Coin records and the layered views over them.

use std::collections::HashMap;
use std::sync::Arc;

use tapd_consensus::money::Amount;
use tapd_consensus::Hash256;
use tapd_primitives::color::{color_of_script, ColorIdentifier};
use tapd_primitives::encoding::{DecodeError, Decoder, Encoder};
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::Transaction;
use tapd_script::standard::is_unspendable;
use tapd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
    /// Only set on overlay entries shadowing a coin spent in a lower layer.
    pub spent: bool,
}

impl Coin {
    pub fn new(value: Amount, script_pubkey: Vec<u8>, height: u32, is_coinbase: bool) -> Self {
        Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
            spent: false,
        }
    }

    pub fn color(&self) -> ColorIdentifier {
        color_of_script(&self.script_pubkey)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.script_pubkey.len() + 16);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        Ok(Self::new(value, script_pubkey, height, is_coinbase))
    }
}

/// Read side of every coin layer.
pub trait CoinView {
    /// Unspent coin at `outpoint`, if any.
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    fn best_block(&self) -> Result<Hash256, StoreError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.coin(outpoint)?.is_some())
    }
}

impl<T: CoinView + ?Sized> CoinView for &T {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        (**self).coin(outpoint)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        (**self).best_block()
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; OutPoint::ENCODED_LEN] {
    outpoint.to_bytes()
}

/// Coins persisted in the `Coins` column.
pub struct CoinsViewDb<S> {
    store: Arc<S>,
}

impl<S> CoinsViewDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsViewDb<S> {
    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, coin: &Coin) {
        batch.put(Column::Coins, outpoint_key(outpoint), coin.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Coins, outpoint_key(outpoint));
    }

    pub fn set_best_block(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.store.scan_prefix(Column::Coins, &[])?.len())
    }
}

impl<S: KeyValueStore> CoinView for CoinsViewDb<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.store.get(Column::Coins, &outpoint_key(outpoint))? {
            Some(bytes) => Coin::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::corrupt(Column::Coins, err.to_string())),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::corrupt(Column::Meta, "best block hash length")),
            None => Ok([0u8; 32]),
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coin: Coin,
    /// Created in this layer; spending it drops the entry instead of shadowing.
    fresh: bool,
}

/// A discardable overlay over another view. Nothing reaches the base until
/// the caller writes [`CoinsViewCache::changes`] out.
pub struct CoinsViewCache<'a> {
    base: &'a dyn CoinView,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<Hash256>,
}

/// Net effect of an overlay on its base.
#[derive(Clone, Debug, Default)]
pub struct CoinChanges {
    pub added: Vec<(OutPoint, Coin)>,
    pub spent: Vec<OutPoint>,
    pub best_block: Option<Hash256>,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(base: &'a dyn CoinView) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    /// Unspent coin or `None`, caching base lookups.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok((!entry.coin.spent).then(|| entry.coin.clone()));
        }
        let coin = self.base.coin(outpoint)?;
        if let Some(coin) = &coin {
            self.entries.insert(
                *outpoint,
                CacheEntry {
                    coin: coin.clone(),
                    fresh: false,
                },
            );
        }
        Ok(coin)
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        let fresh = match self.entries.get(&outpoint) {
            Some(existing) => existing.fresh,
            None => true,
        };
        self.entries.insert(outpoint, CacheEntry { coin, fresh });
    }

    /// Adds every spendable output of `tx`. Unspendable scripts never enter the set.
    pub fn add_transaction_outputs(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            self.add_coin(
                OutPoint::new(txid, index as u32),
                Coin::new(output.value, output.script_pubkey.clone(), height, is_coinbase),
            );
        }
    }

    /// Marks the coin spent and returns it, or `None` when it is not available.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let Some(coin) = self.access_coin(outpoint)? else {
            return Ok(None);
        };
        let fresh = self
            .entries
            .get(outpoint)
            .map(|entry| entry.fresh)
            .unwrap_or(false);
        if fresh {
            self.entries.remove(outpoint);
        } else {
            let mut shadow = coin.clone();
            shadow.spent = true;
            self.entries.insert(
                *outpoint,
                CacheEntry {
                    coin: shadow,
                    fresh: false,
                },
            );
        }
        Ok(Some(coin))
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    /// Writes added coins and spent shadows out. Base lookups cached unchanged
    /// are skipped.
    pub fn changes(self) -> Result<CoinChanges, StoreError> {
        let mut changes = CoinChanges {
            best_block: self.best_block,
            ..CoinChanges::default()
        };
        for (outpoint, entry) in self.entries {
            if entry.coin.spent {
                changes.spent.push(outpoint);
            } else if entry.fresh {
                changes.added.push((outpoint, entry.coin));
            } else if self.base.coin(&outpoint)?.as_ref() != Some(&entry.coin) {
                changes.added.push((outpoint, entry.coin));
            }
        }
        changes.added.sort_by(|a, b| a.0.cmp(&b.0));
        changes.spent.sort();
        Ok(changes)
    }
}

impl CoinView for CoinsViewCache<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.entries.get(outpoint) {
            Some(entry) if entry.coin.spent => Ok(None),
            Some(entry) => Ok(Some(entry.coin.clone())),
            None => self.base.coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => self.base.best_block(),
        }
    }
}

impl<S: KeyValueStore> CoinsViewDb<S> {
    pub fn apply(&self, batch: &mut WriteBatch, changes: &CoinChanges) {
        for outpoint in &changes.spent {
            self.delete(batch, outpoint);
        }
        for (outpoint, coin) in &changes.added {
            self.put(batch, outpoint, coin);
        }
        if let Some(hash) = &changes.best_block {
            self.set_best_block(batch, hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapd_storage::memory::MemoryStore;

    fn coin(value: Amount) -> Coin {
        Coin::new(value, vec![0x51], 1, false)
    }

    #[test]
    fn overlay_shadows_base_until_written() {
        let store = Arc::new(MemoryStore::new());
        let db = CoinsViewDb::new(Arc::clone(&store));
        let existing = OutPoint::new([1u8; 32], 0);
        let mut batch = WriteBatch::new();
        db.put(&mut batch, &existing, &coin(50));
        store.write_batch(&batch).expect("write");

        let mut cache = CoinsViewCache::new(&db);
        assert_eq!(cache.spend_coin(&existing).expect("spend"), Some(coin(50)));
        assert_eq!(cache.coin(&existing).expect("coin"), None);
        assert!(db.have_coin(&existing).expect("base"));

        let created = OutPoint::new([2u8; 32], 1);
        cache.add_coin(created, coin(7));
        let changes = cache.changes().expect("changes");
        assert_eq!(changes.spent, vec![existing]);
        assert_eq!(changes.added, vec![(created, coin(7))]);
    }

    #[test]
    fn spending_a_fresh_coin_leaves_no_trace() {
        let store = Arc::new(MemoryStore::new());
        let db = CoinsViewDb::new(store);
        let mut cache = CoinsViewCache::new(&db);
        let outpoint = OutPoint::new([3u8; 32], 0);
        cache.add_coin(outpoint, coin(1));
        assert!(cache.spend_coin(&outpoint).expect("spend").is_some());
        assert!(cache.spend_coin(&outpoint).expect("spend").is_none());
        let changes = cache.changes().expect("changes");
        assert!(changes.added.is_empty());
        assert!(changes.spent.is_empty());
    }

    #[test]
    fn coin_encoding_round_trips() {
        let original = Coin::new(1_234, vec![0x76, 0xa9], 99, true);
        assert_eq!(Coin::decode(&original.encode()).expect("decode"), original);
        let mut bytes = original.encode();
        bytes.push(0);
        assert!(Coin::decode(&bytes).is_err());
    }
}
