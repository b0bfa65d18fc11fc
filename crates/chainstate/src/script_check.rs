//! Whole-transaction script verification with a shared execution cache.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use rand::RngCore;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tapd_consensus::money::{checked_money_add, Amount};
use tapd_consensus::Hash256;
use tapd_log::Category;
use tapd_primitives::color::ColorIdentifier;
use tapd_primitives::hash::hash_to_hex;
use tapd_primitives::transaction::Transaction;
use tapd_script::interpreter::STANDARD_NOT_MANDATORY_VERIFY_FLAGS;
use tapd_script::{verify_script, PrecomputedTxData, ScriptError, ScriptFlags};

use crate::coins::{Coin, CoinView};
use crate::validation::{RejectCode, Rejection, ValidationFailure};

const SHARD_COUNT: usize = 16;
pub const DEFAULT_SCRIPT_CACHE_ENTRIES: usize = 1 << 17;

/// Value consumed per color, uncolored value under [`ColorIdentifier::None`].
pub type ColorAmounts = BTreeMap<ColorIdentifier, Amount>;

#[derive(Default)]
struct Shard {
    keys: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

/// Set of (transaction, flags) pairs whose scripts already verified.
///
/// Keys are salted with a per-process nonce so peers cannot aim collisions
/// at it. Shards evict oldest-first once full.
pub struct ScriptExecutionCache {
    nonce: [u8; 32],
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
}

impl ScriptExecutionCache {
    pub fn new(capacity: usize) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            nonce,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            shard_capacity: (capacity / SHARD_COUNT).max(1),
        }
    }

    pub fn entry_key(&self, tx_hash: &Hash256, flags: ScriptFlags) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce);
        hasher.update(tx_hash);
        hasher.update(flags.to_le_bytes());
        hasher.finalize().into()
    }

    fn shard(&self, key: &[u8; 32]) -> &Mutex<Shard> {
        &self.shards[key[0] as usize % SHARD_COUNT]
    }

    /// A poisoned shard reads as a miss.
    pub fn contains(&self, key: &[u8; 32]) -> bool {
        self.shard(key)
            .lock()
            .map(|shard| shard.keys.contains(key))
            .unwrap_or(false)
    }

    pub fn insert(&self, key: [u8; 32]) {
        let Ok(mut shard) = self.shard(&key).lock() else {
            return;
        };
        if !shard.keys.insert(key) {
            return;
        }
        shard.order.push_back(key);
        while shard.order.len() > self.shard_capacity {
            if let Some(oldest) = shard.order.pop_front() {
                shard.keys.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|shard| shard.lock().ok().map(|shard| shard.keys.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScriptExecutionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_CACHE_ENTRIES)
    }
}

pub fn color_sums(coins: &[Coin]) -> Result<ColorAmounts, Rejection> {
    let mut sums = ColorAmounts::new();
    for coin in coins {
        let entry = sums.entry(coin.color().matching_key()).or_insert(0);
        *entry = checked_money_add(*entry, coin.value).ok_or_else(|| {
            Rejection::consensus(100, RejectCode::Invalid, "bad-txns-inputvalues-outofrange")
        })?;
    }
    Ok(sums)
}

fn first_failure(
    tx: &Transaction,
    coins: &[Coin],
    flags: ScriptFlags,
    precomputed: &PrecomputedTxData,
) -> Option<(usize, ScriptError)> {
    tx.vin
        .par_iter()
        .zip(coins.par_iter())
        .enumerate()
        .filter_map(|(index, (input, coin))| {
            verify_script(
                &input.script_sig,
                &coin.script_pubkey,
                tx,
                index,
                flags,
                Some(precomputed),
            )
            .err()
            .map(|err| (index, err))
        })
        .min_by_key(|(index, _)| *index)
}

/// Verifies every input script of `tx` against the coins it spends, one coin
/// per input in input order. Returns the consumed value per color.
///
/// A cached key skips the script work. With `store_result`, a full pass
/// records the key.
pub fn check_inputs_with_coins(
    tx: &Transaction,
    coins: &[Coin],
    flags: ScriptFlags,
    cache: Option<&ScriptExecutionCache>,
    store_result: bool,
) -> Result<ColorAmounts, ValidationFailure> {
    if tx.is_coinbase() {
        return Ok(ColorAmounts::new());
    }
    if coins.len() != tx.vin.len() {
        return Err(ValidationFailure::Internal(format!(
            "{} coins supplied for {} inputs",
            coins.len(),
            tx.vin.len()
        )));
    }
    let sums = color_sums(coins)?;
    let key = cache.map(|cache| cache.entry_key(&tx.hash(), flags));
    if let (Some(cache), Some(key)) = (cache, key.as_ref()) {
        if cache.contains(key) {
            return Ok(sums);
        }
    }

    let precomputed = PrecomputedTxData::new(tx);
    if let Some((index, err)) = first_failure(tx, coins, flags, &precomputed) {
        let soft = flags & !STANDARD_NOT_MANDATORY_VERIFY_FLAGS;
        let passes_without_policy = flags & STANDARD_NOT_MANDATORY_VERIFY_FLAGS != 0
            && verify_script(
                &tx.vin[index].script_sig,
                &coins[index].script_pubkey,
                tx,
                index,
                soft,
                Some(&precomputed),
            )
            .is_ok();
        tapd_log::log_debug!(
            cat: Category::Validation,
            "script failure in {} input {index}: {err}",
            hash_to_hex(&tx.txid())
        );
        let rejection = if passes_without_policy {
            Rejection::policy(
                RejectCode::NonStandard,
                format!("non-mandatory-script-verify-flag ({err})"),
            )
        } else {
            Rejection::consensus(
                100,
                RejectCode::Invalid,
                format!("mandatory-script-verify-flag-failed ({err})"),
            )
        };
        return Err(rejection.into());
    }

    if store_result {
        if let (Some(cache), Some(key)) = (cache, key) {
            cache.insert(key);
        }
    }
    Ok(sums)
}

/// As [`check_inputs_with_coins`], reading the spent coins from `view`.
/// Every input must be present; a missing coin is a caller bug.
pub fn check_inputs(
    tx: &Transaction,
    view: &dyn CoinView,
    flags: ScriptFlags,
    cache: Option<&ScriptExecutionCache>,
    store_result: bool,
) -> Result<ColorAmounts, ValidationFailure> {
    let mut coins = Vec::with_capacity(tx.vin.len());
    for input in &tx.vin {
        match view.coin(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None if tx.is_coinbase() => {}
            None => {
                return Err(ValidationFailure::Internal(format!(
                    "input {} is not in the coin view",
                    input.prevout
                )))
            }
        }
    }
    check_inputs_with_coins(tx, &coins, flags, cache, store_result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
    use tapd_primitives::hash::hash160;
    use tapd_primitives::outpoint::OutPoint;
    use tapd_primitives::transaction::{TxIn, TxOut};
    use tapd_script::interpreter::{MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS};
    use tapd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
    use tapd_script::standard::{p2pkh_script, push_data};

    struct Key {
        secret: SecretKey,
        public: Vec<u8>,
    }

    fn key(seed: u8) -> Key {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).expect("secret");
        let public = PublicKey::from_secret_key(&secp, &secret).serialize().to_vec();
        Key { secret, public }
    }

    fn spend(key: &Key, coin: &Coin) -> Transaction {
        let mut tx = Transaction {
            features: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([8u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: coin.value - 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let digest = signature_hash(
            &tx,
            0,
            &coin.script_pubkey,
            SighashType(SIGHASH_ALL),
            None,
        )
        .expect("sighash");
        let secp = Secp256k1::new();
        let mut sig = secp
            .sign_ecdsa(&Message::from_digest(digest), &key.secret)
            .serialize_der()
            .to_vec();
        sig.push(SIGHASH_ALL as u8);
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &key.public);
        tx.vin[0].script_sig = script_sig;
        tx
    }

    fn p2pkh_coin(key: &Key, value: Amount) -> Coin {
        Coin::new(value, p2pkh_script(&hash160(&key.public)), 1, false)
    }

    #[test]
    fn valid_spend_is_cached_only_when_asked() {
        let key = key(3);
        let coin = p2pkh_coin(&key, 1_000);
        let tx = spend(&key, &coin);
        let cache = ScriptExecutionCache::new(64);

        let sums = check_inputs_with_coins(
            &tx,
            &[coin.clone()],
            STANDARD_SCRIPT_VERIFY_FLAGS,
            Some(&cache),
            false,
        )
        .expect("valid");
        assert_eq!(sums.get(&ColorIdentifier::None), Some(&1_000));
        assert!(cache.is_empty());

        check_inputs_with_coins(&tx, &[coin], STANDARD_SCRIPT_VERIFY_FLAGS, Some(&cache), true)
            .expect("valid");
        assert!(cache.contains(&cache.entry_key(&tx.hash(), STANDARD_SCRIPT_VERIFY_FLAGS)));
        assert!(!cache.contains(&cache.entry_key(&tx.hash(), MANDATORY_SCRIPT_VERIFY_FLAGS)));
    }

    #[test]
    fn wrong_key_is_a_mandatory_failure() {
        let owner = key(3);
        let thief = key(4);
        let coin = p2pkh_coin(&owner, 1_000);
        let tx = spend(&thief, &coin);
        let failure =
            check_inputs_with_coins(&tx, &[coin], STANDARD_SCRIPT_VERIFY_FLAGS, None, false)
                .expect_err("wrong key");
        match failure {
            ValidationFailure::Rejected(rejection) => {
                assert!(rejection.reason.starts_with("mandatory-script-verify-flag-failed"));
                assert_eq!(rejection.dos, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn policy_only_failure_is_not_mandatory() {
        let key = key(5);
        let coin = p2pkh_coin(&key, 1_000);
        let mut tx = spend(&key, &coin);
        // leave an extra item on the stack: only CLEANSTACK objects
        let mut script_sig = vec![0x51];
        script_sig.extend_from_slice(&tx.vin[0].script_sig);
        tx.vin[0].script_sig = script_sig;
        let failure = check_inputs_with_coins(
            &tx,
            &[coin.clone()],
            STANDARD_SCRIPT_VERIFY_FLAGS,
            None,
            false,
        )
        .expect_err("cleanstack");
        match failure {
            ValidationFailure::Rejected(rejection) => {
                assert!(rejection.reason.starts_with("non-mandatory-script-verify-flag"));
                assert_eq!(rejection.code, RejectCode::NonStandard);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(
            check_inputs_with_coins(&tx, &[coin], MANDATORY_SCRIPT_VERIFY_FLAGS, None, false)
                .is_ok()
        );
    }

    #[test]
    fn cache_evicts_oldest_per_shard() {
        let cache = ScriptExecutionCache::new(SHARD_COUNT * 2);
        let mut keys = Vec::new();
        for n in 0..3u8 {
            let mut key = [n; 32];
            key[0] = 0;
            cache.insert(key);
            keys.push(key);
        }
        assert!(!cache.contains(&keys[0]));
        assert!(cache.contains(&keys[1]));
        assert!(cache.contains(&keys[2]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn missing_coin_is_an_internal_error() {
        struct Empty;
        impl CoinView for Empty {
            fn coin(
                &self,
                _: &OutPoint,
            ) -> Result<Option<Coin>, tapd_storage::StoreError> {
                Ok(None)
            }
            fn best_block(&self) -> Result<Hash256, tapd_storage::StoreError> {
                Ok([0u8; 32])
            }
        }
        let key = key(6);
        let coin = p2pkh_coin(&key, 50);
        let tx = spend(&key, &coin);
        assert!(matches!(
            check_inputs(&tx, &Empty, STANDARD_SCRIPT_VERIFY_FLAGS, None, false),
            Err(ValidationFailure::Internal(_))
        ));
    }
}
