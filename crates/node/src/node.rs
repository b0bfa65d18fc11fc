//! Node facade: one lock around the chain state, a nested lock around the
//! mempool, and the glue that keeps the pool consistent with the tip.
//!
//! Lock order is always chain then mempool. Operations that only touch the
//! pool take the mempool lock alone.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tapd_chainstate::flatfiles::BlockStorage;
use tapd_chainstate::state::{ChainState, ChainStateError, ChainUpdate};
use tapd_chainstate::validation::{
    evaluate_sequence_locks, is_final_tx, SequenceLocks, ValidationState,
};
use tapd_consensus::constants::LOCKTIME_MEDIAN_TIME_PAST;
use tapd_consensus::money::Amount;
use tapd_consensus::Hash256;
use tapd_log::Category;
use tapd_primitives::block::{Block, BlockHeader};
use tapd_primitives::hash::hash_to_hex;
use tapd_primitives::transaction::Transaction;
use tapd_storage::KeyValueStore;

use crate::admission::{accept_to_memory_pool, lookup_coins, sequence_lock_points, AcceptOptions};
use crate::mempool::{Mempool, MempoolEntry, RemovalReason, MEMPOOL_HEIGHT};
use crate::package::{submit_package, PackageResult};
use crate::policy::MempoolPolicy;

#[derive(Debug)]
pub enum NodeError {
    ChainState(ChainStateError),
    Poisoned(&'static str),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::ChainState(err) => write!(f, "{err}"),
            NodeError::Poisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ChainStateError> for NodeError {
    fn from(err: ChainStateError) -> Self {
        NodeError::ChainState(err)
    }
}

#[derive(Clone, Debug)]
pub struct MempoolAcceptResult {
    pub txid: Hash256,
    pub state: ValidationState,
    pub fee: Option<Amount>,
    pub replaced: Vec<Hash256>,
}

impl MempoolAcceptResult {
    pub fn accepted(&self) -> bool {
        self.state.is_valid()
    }
}

#[derive(Clone, Debug)]
pub struct ProcessedBlock {
    pub state: ValidationState,
    pub new_block: bool,
    pub tip: Option<Hash256>,
    pub height: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct MempoolInfo {
    pub size: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub min_fee_per_kb: Amount,
    pub min_relay_fee_per_kb: Amount,
    pub sequence: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub network: &'static str,
    pub height: i32,
    pub best_block: Option<String>,
    pub median_time_past: i64,
    pub known_blocks: usize,
    pub candidates: usize,
    pub aggregate_pubkey: Option<String>,
    pub max_block_size: Option<u32>,
    pub script_cache_entries: usize,
    pub mempool: MempoolInfo,
}

pub struct Node<S, B> {
    chain: Mutex<ChainState<S, B>>,
    mempool: Mutex<Mempool>,
    policy: MempoolPolicy,
    mock_time: AtomicU64,
}

impl<S: KeyValueStore, B: BlockStorage> Node<S, B> {
    pub fn new(chain: ChainState<S, B>, policy: MempoolPolicy) -> Self {
        Self {
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new(policy.incremental_relay_fee)),
            policy,
            mock_time: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    /// Pins the clock used for admission and block timestamps; zero restores
    /// the system clock.
    pub fn set_mock_time(&self, secs: u64) {
        self.mock_time.store(secs, Ordering::Relaxed);
    }

    pub fn now(&self) -> u64 {
        match self.mock_time.load(Ordering::Relaxed) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            mocked => mocked,
        }
    }

    fn lock_chain(&self) -> Result<MutexGuard<'_, ChainState<S, B>>, NodeError> {
        self.chain.lock().map_err(|_| NodeError::Poisoned("chain state"))
    }

    fn lock_mempool(&self) -> Result<MutexGuard<'_, Mempool>, NodeError> {
        self.mempool.lock().map_err(|_| NodeError::Poisoned("mempool"))
    }

    /// Runs `f` under the chain lock.
    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainState<S, B>) -> R) -> Result<R, NodeError> {
        let chain = self.lock_chain()?;
        Ok(f(&chain))
    }

    pub fn accept_to_mempool(
        &self,
        tx: &Transaction,
        options: AcceptOptions,
    ) -> Result<MempoolAcceptResult, NodeError> {
        let now = self.now();
        let chain = self.lock_chain()?;
        let mut pool = self.lock_mempool()?;
        let txid = tx.txid();
        let outcome =
            accept_to_memory_pool(&*chain, &mut *pool, &self.policy, tx, &options, None, now);
        let result = match outcome {
            Ok(accepted) => {
                if !options.test_accept {
                    tapd_log::log_debug!(
                        cat: Category::Mempool,
                        "accepted {} (fee {}, {} bytes, pool size {} txs, {} bytes)",
                        hash_to_hex(&txid),
                        accepted.fee,
                        accepted.size,
                        pool.len(),
                        pool.bytes()
                    );
                }
                MempoolAcceptResult {
                    txid,
                    state: ValidationState::Valid,
                    fee: Some(accepted.fee),
                    replaced: accepted.replaced,
                }
            }
            Err(failure) => {
                tapd_log::log_debug!(
                    cat: Category::MempoolRej,
                    "{} rejected: {failure}",
                    hash_to_hex(&txid)
                );
                MempoolAcceptResult {
                    txid,
                    state: failure.into(),
                    fee: None,
                    replaced: Vec::new(),
                }
            }
        };
        Ok(result)
    }

    /// Dry run of admission. The pool is left untouched.
    pub fn test_accept(&self, tx: &Transaction) -> Result<MempoolAcceptResult, NodeError> {
        self.accept_to_mempool(
            tx,
            AcceptOptions {
                test_accept: true,
                ..AcceptOptions::default()
            },
        )
    }

    pub fn submit_package(
        &self,
        txs: &[Transaction],
        test_accept: bool,
    ) -> Result<PackageResult, NodeError> {
        let now = self.now();
        let chain = self.lock_chain()?;
        let mut pool = self.lock_mempool()?;
        let result = submit_package(&*chain, &mut *pool, &self.policy, txs, test_accept, now);
        if !result.success {
            tapd_log::log_debug!(
                cat: Category::MempoolRej,
                "package of {} rejected: {}",
                txs.len(),
                if result.package_state.is_valid() {
                    "member failed".to_string()
                } else {
                    result.package_state.to_string()
                }
            );
        }
        Ok(result)
    }

    pub fn process_new_block_headers(
        &self,
        headers: &[BlockHeader],
    ) -> Result<ValidationState, NodeError> {
        let now = self.now();
        let mut chain = self.lock_chain()?;
        Ok(chain.process_new_block_headers(headers, clock(now))?)
    }

    pub fn process_new_block(&self, block: &Block) -> Result<ProcessedBlock, NodeError> {
        let now = self.now();
        let mut chain = self.lock_chain()?;
        let outcome = chain.process_new_block(block, clock(now))?;
        self.apply_chain_update(&*chain, &outcome.update, now)?;
        Ok(ProcessedBlock {
            state: outcome.state,
            new_block: outcome.new_block,
            tip: chain.tip().map(|tip| tip.hash),
            height: chain.tip_height(),
        })
    }

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), NodeError> {
        let now = self.now();
        let mut chain = self.lock_chain()?;
        let update = chain.invalidate_block(hash)?;
        self.apply_chain_update(&*chain, &update, now)
    }

    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), NodeError> {
        let now = self.now();
        let mut chain = self.lock_chain()?;
        let update = chain.reconsider_block(hash)?;
        self.apply_chain_update(&*chain, &update, now)
    }

    pub fn prioritise_transaction(&self, txid: Hash256, delta: Amount) -> Result<(), NodeError> {
        self.lock_mempool()?.prioritise_transaction(txid, delta);
        Ok(())
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> Result<bool, NodeError> {
        Ok(self.lock_mempool()?.contains(txid))
    }

    pub fn mempool_entry(&self, txid: &Hash256) -> Result<Option<MempoolEntry>, NodeError> {
        Ok(self.lock_mempool()?.get(txid).cloned())
    }

    pub fn mempool_txids(&self) -> Result<Vec<Hash256>, NodeError> {
        Ok(self.lock_mempool()?.txids())
    }

    pub fn mempool_info(&self) -> Result<MempoolInfo, NodeError> {
        let now = self.now();
        let mut pool = self.lock_mempool()?;
        Ok(self.mempool_info_locked(&mut pool, now))
    }

    fn mempool_info_locked(&self, pool: &mut Mempool, now: u64) -> MempoolInfo {
        let min_fee = pool
            .min_fee(now, self.policy.max_bytes)
            .max(self.policy.min_relay_fee);
        MempoolInfo {
            size: pool.len(),
            bytes: pool.bytes(),
            max_bytes: self.policy.max_bytes,
            min_fee_per_kb: min_fee.as_per_kb(),
            min_relay_fee_per_kb: self.policy.min_relay_fee.as_per_kb(),
            sequence: pool.sequence(),
        }
    }

    pub fn status(&self) -> Result<NodeStatus, NodeError> {
        let now = self.now();
        let chain = self.lock_chain()?;
        let height = chain.tip_height();
        let next_height = u32::try_from(height + 1).unwrap_or(0);
        let xfields = chain.xfields();
        let aggregate_pubkey = xfields
            .latest_aggregate_pubkey(next_height)
            .ok()
            .map(|key| hex_encode(&key));
        let max_block_size = xfields.latest_max_block_size(next_height).ok();
        let mut pool = self.lock_mempool()?;
        Ok(NodeStatus {
            network: chain.params().network.as_str(),
            height,
            best_block: chain.tip().map(|tip| hash_to_hex(&tip.hash)),
            median_time_past: chain.tip_median_time_past(),
            known_blocks: chain.index().len(),
            candidates: chain.candidate_count(),
            aggregate_pubkey,
            max_block_size,
            script_cache_entries: chain.script_cache().len(),
            mempool: self.mempool_info_locked(&mut pool, now),
        })
    }

    /// Brings the pool in line with a changed active chain. Confirmed and
    /// conflicting entries leave; transactions from disconnected blocks are
    /// re-admitted and entries the new tip invalidates are dropped.
    fn apply_chain_update(
        &self,
        chain: &ChainState<S, B>,
        update: &ChainUpdate,
        now: u64,
    ) -> Result<(), NodeError> {
        if update.connected.is_empty() && update.disconnected.is_empty() {
            return Ok(());
        }
        let mut pool = self.lock_mempool()?;
        for block in &update.connected {
            pool.remove_for_block(&block.transactions, now);
        }
        if update.disconnected.is_empty() {
            return Ok(());
        }

        let confirmed: HashSet<Hash256> = update
            .connected
            .iter()
            .flat_map(|block| block.transactions.iter().map(Transaction::txid))
            .collect();
        let options = AcceptOptions {
            bypass_limits: true,
            ..AcceptOptions::default()
        };
        let mut readmitted = 0usize;
        let mut dropped = 0usize;
        // Disconnected blocks arrive tip first; replay them oldest first.
        for block in update.disconnected.iter().rev() {
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                let txid = tx.txid();
                if confirmed.contains(&txid) {
                    continue;
                }
                let outcome =
                    accept_to_memory_pool(chain, &mut *pool, &self.policy, tx, &options, None, now);
                match outcome {
                    Ok(_) => readmitted += 1,
                    Err(failure) => {
                        dropped += 1;
                        tapd_log::log_debug!(
                            cat: Category::MempoolRej,
                            "disconnected {} not re-admitted: {failure}",
                            hash_to_hex(&txid)
                        );
                        pool.remove_spenders_of(tx, RemovalReason::Reorg);
                    }
                }
            }
        }
        let stale = self.remove_for_reorg(chain, &mut *pool, now);
        pool.expire(now.saturating_sub(self.policy.expiry_secs));
        pool.trim_to_size(self.policy.max_bytes);
        tapd_log::log_info!(
            cat: Category::Mempool,
            "reorg: {} blocks disconnected, {} connected; re-admitted {readmitted} txs, dropped {dropped}, removed {stale} stale entries",
            update.disconnected.len(),
            update.connected.len()
        );
        Ok(())
    }

    /// Drops entries the new tip makes unminable: non-final ones, failing
    /// sequence locks, spending an immature coinbase or a coin that no
    /// longer exists.
    fn remove_for_reorg(&self, chain: &ChainState<S, B>, pool: &mut Mempool, now: u64) -> usize {
        let next_height = chain.tip_height() + 1;
        let tip_median_time = chain.tip_median_time_past();
        let flags = self.policy.locktime_flags;
        let lock_time_cutoff = if flags & LOCKTIME_MEDIAN_TIME_PAST != 0 {
            tip_median_time
        } else {
            clock(now)
        };
        let maturity = chain.params().coinbase_maturity;

        let mut stale = Vec::new();
        let mut refreshed = Vec::new();
        for entry in pool.entries() {
            if !is_final_tx(&entry.tx, next_height, lock_time_cutoff) {
                stale.push(entry.txid);
                continue;
            }
            let Some(coins) = lookup_coins(chain, pool, &entry.tx) else {
                stale.push(entry.txid);
                continue;
            };
            let lock_points_valid = entry
                .lock_points
                .max_input_block
                .map_or(true, |hash| chain.is_on_active_chain(&hash));
            let lock_points = if lock_points_valid {
                entry.lock_points
            } else {
                let (_, lock_points) = sequence_lock_points(chain, &entry.tx, &coins, flags);
                refreshed.push((entry.txid, lock_points));
                lock_points
            };
            let locks = SequenceLocks {
                min_height: lock_points.height,
                min_time: lock_points.time,
            };
            if !evaluate_sequence_locks(next_height, tip_median_time, locks) {
                stale.push(entry.txid);
                continue;
            }
            let immature = entry.spends_coinbase
                && coins.iter().any(|coin| {
                    coin.is_coinbase
                        && coin.height != MEMPOOL_HEIGHT
                        && next_height - (coin.height as i32) < maturity
                });
            if immature {
                stale.push(entry.txid);
            }
        }

        for (txid, lock_points) in refreshed {
            pool.set_lock_points(&txid, lock_points);
        }
        stale
            .iter()
            .map(|txid| pool.remove_with_descendants(txid, RemovalReason::Reorg).len())
            .sum()
    }
}

fn clock(now: u64) -> i64 {
    i64::try_from(now).unwrap_or(i64::MAX)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
