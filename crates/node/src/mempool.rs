//! In-memory pool of validated, unconfirmed transactions.
//!
//! Entries link to their in-pool parents and children so ancestor and
//! descendant packages can be walked for chain limits, replacement and
//! eviction. The pool itself never validates; see [`crate::admission`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tapd_chainstate::coins::{Coin, CoinView};
use tapd_consensus::money::Amount;
use tapd_consensus::Hash256;
use tapd_primitives::hash::hash_to_hex;
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::Transaction;
use tapd_storage::StoreError;

use crate::policy::FeeRate;

/// Height reported for coins created by unconfirmed transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;
pub const ROLLING_FEE_HALFLIFE_SECS: u64 = 60 * 60 * 12;
/// Cap on the entries a single replacement may evict.
pub const MAX_REPLACEMENT_CANDIDATES: usize = 100;

/// Sequence lock constraints computed at entry, valid while
/// `max_input_block` stays on the active chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
    pub max_input_block: Option<Hash256>,
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub fee: Amount,
    pub fee_delta: Amount,
    pub size: usize,
    pub sigops: u32,
    /// Seconds since the epoch when the entry was accepted.
    pub time: u64,
    /// Chain height when the entry was accepted.
    pub height: i32,
    pub spends_coinbase: bool,
    pub lock_points: LockPoints,
    parents: BTreeSet<Hash256>,
    children: BTreeSet<Hash256>,
}

impl MempoolEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: Transaction,
        fee: Amount,
        size: usize,
        sigops: u32,
        time: u64,
        height: i32,
        spends_coinbase: bool,
        lock_points: LockPoints,
    ) -> Self {
        Self {
            txid: tx.txid(),
            tx,
            fee,
            fee_delta: 0,
            size,
            sigops,
            time,
            height,
            spends_coinbase,
            lock_points,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_fee(self.modified_fee(), self.size)
    }

    pub fn parents(&self) -> &BTreeSet<Hash256> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<Hash256> {
        &self.children
    }
}

/// Totals over an entry plus its in-pool descendants or ancestors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PackageStats {
    pub count: usize,
    pub size: usize,
    pub fees: Amount,
}

impl PackageStats {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_fee(self.fees, self.size)
    }
}

/// Chain limits applied when computing an incoming transaction's ancestors.
#[derive(Clone, Copy, Debug)]
pub struct AncestorLimits {
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub descendant_count: usize,
    pub descendant_size: usize,
}

impl AncestorLimits {
    pub const UNLIMITED: AncestorLimits = AncestorLimits {
        ancestor_count: usize::MAX,
        ancestor_size: usize::MAX,
        descendant_count: usize::MAX,
        descendant_size: usize::MAX,
    };
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemovalReason {
    Block,
    Conflict,
    Replaced,
    SizeLimit,
    Expiry,
    Reorg,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Block => "block",
            RemovalReason::Conflict => "conflict",
            RemovalReason::Replaced => "replaced",
            RemovalReason::SizeLimit => "sizelimit",
            RemovalReason::Expiry => "expiry",
            RemovalReason::Reorg => "reorg",
        }
    }
}

type EvictionKey = (FeeRate, Reverse<u64>, Hash256);

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    /// Manual fee deltas, kept for transactions that are not (yet) in the pool.
    deltas: HashMap<Hash256, Amount>,
    total_bytes: usize,
    /// Per-kB floor raised by size-limit evictions; decays once blocks arrive.
    rolling_min_fee: f64,
    last_rolling_update: u64,
    block_since_bump: bool,
    incremental_relay_fee: FeeRate,
    sequence: u64,
}

impl Mempool {
    pub fn new(incremental_relay_fee: FeeRate) -> Self {
        Self {
            incremental_relay_fee,
            ..Self::default()
        }
    }

    /// Bumped on every change; lets readers detect staleness cheaply.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    /// In-pool transaction spending `outpoint`.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    /// Output `outpoint` of an in-pool transaction, as a coin at [`MEMPOOL_HEIGHT`].
    pub fn output_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let entry = self.entries.get(&outpoint.hash)?;
        let output = entry.tx.vout.get(usize::try_from(outpoint.index).ok()?)?;
        Some(Coin::new(
            output.value,
            output.script_pubkey.clone(),
            MEMPOOL_HEIGHT,
            false,
        ))
    }

    pub fn fee_delta(&self, txid: &Hash256) -> Amount {
        self.deltas.get(txid).copied().unwrap_or(0)
    }

    /// Adds `delta` to the fee used for mining and eviction decisions.
    pub fn prioritise_transaction(&mut self, txid: Hash256, delta: Amount) {
        let total = self.deltas.entry(txid).or_insert(0);
        *total = total.saturating_add(delta);
        let total = *total;
        if let Some(entry) = self.entries.get_mut(&txid) {
            entry.fee_delta = total;
        }
        if total == 0 {
            self.deltas.remove(&txid);
        }
        self.sequence += 1;
        tapd_log::log_debug!(
            cat: tapd_log::Category::Mempool,
            "prioritised {} by {delta} (total delta {total})",
            hash_to_hex(&txid)
        );
    }

    pub fn clear_prioritisation(&mut self, txid: &Hash256) {
        self.deltas.remove(txid);
    }

    pub fn set_lock_points(&mut self, txid: &Hash256, lock_points: LockPoints) {
        if let Some(entry) = self.entries.get_mut(txid) {
            entry.lock_points = lock_points;
        }
    }

    /// In-pool transactions `tx` spends from.
    pub fn in_pool_parents(&self, tx: &Transaction) -> BTreeSet<Hash256> {
        tx.vin
            .iter()
            .map(|input| input.prevout.hash)
            .filter(|hash| self.entries.contains_key(hash))
            .collect()
    }

    /// `txid` and everything spending from it, directly or not.
    pub fn descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.walk(txid, |entry| &entry.children)
    }

    /// `txid` and everything it spends from inside the pool.
    pub fn ancestors(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.walk(txid, |entry| &entry.parents)
    }

    fn walk(
        &self,
        txid: &Hash256,
        links: impl Fn(&MempoolEntry) -> &BTreeSet<Hash256>,
    ) -> HashSet<Hash256> {
        let mut seen = HashSet::new();
        if !self.entries.contains_key(txid) {
            return seen;
        }
        let mut queue = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                queue.extend(links(entry).iter().filter(|next| !seen.contains(*next)));
            }
        }
        seen
    }

    pub fn descendant_stats(&self, txid: &Hash256) -> PackageStats {
        self.stats(&self.descendants(txid))
    }

    pub fn ancestor_stats(&self, txid: &Hash256) -> PackageStats {
        self.stats(&self.ancestors(txid))
    }

    fn stats(&self, txids: &HashSet<Hash256>) -> PackageStats {
        txids
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .fold(PackageStats::default(), |acc, entry| PackageStats {
                count: acc.count + 1,
                size: acc.size + entry.size,
                fees: acc.fees.saturating_add(entry.modified_fee()),
            })
    }

    /// In-pool ancestors of a prospective entry of `size` bytes with the
    /// given direct parents. Fails with a reason when a chain limit would
    /// be exceeded, either for the new entry or for any ancestor's
    /// descendant package.
    pub fn calculate_ancestors(
        &self,
        parents: &BTreeSet<Hash256>,
        size: usize,
        limits: &AncestorLimits,
    ) -> Result<HashSet<Hash256>, String> {
        if parents.len().saturating_add(1) > limits.ancestor_count {
            return Err(format!(
                "too many unconfirmed parents [limit: {}]",
                limits.ancestor_count
            ));
        }
        let mut ancestors = HashSet::new();
        let mut staged: Vec<Hash256> = parents.iter().copied().collect();
        let mut total_size = size;
        while let Some(txid) = staged.pop() {
            if !ancestors.insert(txid) {
                continue;
            }
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            total_size = total_size.saturating_add(entry.size);
            let descendants = self.descendant_stats(&txid);
            if descendants.size.saturating_add(size) > limits.descendant_size {
                return Err(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    hash_to_hex(&txid),
                    limits.descendant_size
                ));
            }
            if descendants.count.saturating_add(1) > limits.descendant_count {
                return Err(format!(
                    "too many descendants for tx {} [limit: {}]",
                    hash_to_hex(&txid),
                    limits.descendant_count
                ));
            }
            if total_size > limits.ancestor_size {
                return Err(format!(
                    "exceeds ancestor size limit [limit: {}]",
                    limits.ancestor_size
                ));
            }
            for parent in &entry.parents {
                if !ancestors.contains(parent) && !staged.contains(parent) {
                    staged.push(*parent);
                }
            }
            if staged.len() + ancestors.len() + 1 > limits.ancestor_count {
                return Err(format!(
                    "too many unconfirmed ancestors [limit: {}]",
                    limits.ancestor_count
                ));
            }
        }
        Ok(ancestors)
    }

    /// Inserts an already validated entry. Parents and children already in
    /// the pool are linked, including children that were accepted while this
    /// transaction was confirmed in a block that has since been disconnected.
    pub fn add_unchecked(&mut self, mut entry: MempoolEntry) {
        let txid = entry.txid;
        entry.fee_delta = self.fee_delta(&txid);
        entry.parents = self.in_pool_parents(&entry.tx);
        entry.children.clear();
        for index in 0..entry.tx.vout.len() {
            if let Some(child) = self.spent.get(&OutPoint::new(txid, index as u32)) {
                entry.children.insert(*child);
            }
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(txid);
            }
        }
        for child in &entry.children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.insert(txid);
            }
        }
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout, txid);
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.size);
        self.entries.insert(txid, entry);
        self.sequence += 1;
    }

    /// Removes one entry, detaching it from its parents and children.
    pub fn remove(&mut self, txid: &Hash256, reason: RemovalReason) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.remove(txid);
            }
        }
        self.sequence += 1;
        tapd_log::log_debug!(
            cat: tapd_log::Category::Mempool,
            "removed {} ({})",
            hash_to_hex(txid),
            reason.as_str()
        );
        Some(entry)
    }

    /// Removes `txid` and all its descendants, children before parents.
    pub fn remove_with_descendants(
        &mut self,
        txid: &Hash256,
        reason: RemovalReason,
    ) -> Vec<MempoolEntry> {
        let mut order: Vec<Hash256> = Vec::new();
        let mut visited: HashSet<Hash256> = HashSet::new();

        fn visit(
            mempool: &Mempool,
            txid: Hash256,
            visited: &mut HashSet<Hash256>,
            order: &mut Vec<Hash256>,
        ) {
            if !visited.insert(txid) {
                return;
            }
            if let Some(entry) = mempool.entries.get(&txid) {
                for child in &entry.children {
                    visit(mempool, *child, visited, order);
                }
            }
            order.push(txid);
        }

        visit(self, *txid, &mut visited, &mut order);
        order
            .iter()
            .filter_map(|txid| self.remove(txid, reason.clone()))
            .collect()
    }

    /// Removes every in-pool spender of `tx`'s outputs, with descendants.
    /// `tx` itself need not be in the pool.
    pub fn remove_spenders_of(&mut self, tx: &Transaction, reason: RemovalReason) -> usize {
        let txid = tx.txid();
        let mut removed = 0;
        for index in 0..tx.vout.len() {
            if let Some(child) = self.spender(&OutPoint::new(txid, index as u32)) {
                removed += self.remove_with_descendants(&child, reason.clone()).len();
            }
        }
        removed
    }

    /// Drops transactions confirmed by a block and everything conflicting
    /// with them; their children stay with one parent fewer.
    pub fn remove_for_block(&mut self, txs: &[Transaction], now: u64) -> usize {
        let mut removed = 0;
        for tx in txs {
            let txid = tx.txid();
            if self.remove(&txid, RemovalReason::Block).is_some() {
                removed += 1;
            }
            for input in &tx.vin {
                if let Some(conflict) = self.spender(&input.prevout) {
                    if conflict != txid {
                        removed += self
                            .remove_with_descendants(&conflict, RemovalReason::Conflict)
                            .len();
                    }
                }
            }
            self.clear_prioritisation(&txid);
        }
        self.last_rolling_update = now;
        self.block_since_bump = true;
        removed
    }

    /// Removes entries accepted before `cutoff`, with their descendants.
    pub fn expire(&mut self, cutoff: u64) -> usize {
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut removed = 0;
        for txid in expired {
            removed += self.remove_with_descendants(&txid, RemovalReason::Expiry).len();
        }
        removed
    }

    /// Higher is better: the entry's own rate or, if it pays for cheap
    /// children, the rate of its descendant package, whichever is larger.
    fn descendant_score(&self, entry: &MempoolEntry) -> FeeRate {
        entry.fee_rate().max(self.descendant_stats(&entry.txid).fee_rate())
    }

    /// Lowest key is evicted first; ties go to the newest entry.
    fn eviction_key(&self, entry: &MempoolEntry) -> EvictionKey {
        (self.descendant_score(entry), Reverse(entry.time), entry.txid)
    }

    /// Evicts the lowest-scoring descendant packages until the pool fits in
    /// `max_bytes`, raising the rolling minimum fee past each evicted package.
    /// Scores are computed once; an eviction only rescores the in-pool
    /// ancestors of what it removed.
    pub fn trim_to_size(&mut self, max_bytes: usize) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        if self.total_bytes <= max_bytes {
            return evicted;
        }
        let mut keys: HashMap<Hash256, EvictionKey> = self
            .entries
            .values()
            .map(|entry| (entry.txid, self.eviction_key(entry)))
            .collect();
        let mut order: BTreeSet<EvictionKey> = keys.values().copied().collect();
        let mut max_removed_rate = FeeRate::ZERO;
        while self.total_bytes > max_bytes {
            let Some((_, _, worst)) = order.pop_first() else {
                break;
            };
            let package = self.descendant_stats(&worst);
            let removed_rate = package.fee_rate().saturating_add(self.incremental_relay_fee);
            self.track_package_removed(removed_rate);
            max_removed_rate = max_removed_rate.max(removed_rate);

            let removed = self.remove_with_descendants(&worst, RemovalReason::SizeLimit);
            let mut rescore = HashSet::new();
            for entry in &removed {
                if let Some(key) = keys.remove(&entry.txid) {
                    order.remove(&key);
                }
                for parent in entry.parents.iter().filter(|parent| self.contains(parent)) {
                    rescore.extend(self.ancestors(parent));
                }
                evicted.push(entry.txid);
            }
            for txid in rescore {
                let Some(entry) = self.entries.get(&txid) else {
                    continue;
                };
                let key = self.eviction_key(entry);
                if let Some(stale) = keys.insert(txid, key) {
                    order.remove(&stale);
                }
                order.insert(key);
            }
        }
        if !evicted.is_empty() {
            tapd_log::log_debug!(
                cat: tapd_log::Category::Mempool,
                "removed {} transactions to fit the size limit, new minimum fee {max_removed_rate}",
                evicted.len()
            );
        }
        evicted
    }

    fn track_package_removed(&mut self, rate: FeeRate) {
        if rate.as_per_kb() as f64 > self.rolling_min_fee {
            self.rolling_min_fee = rate.as_per_kb() as f64;
            self.block_since_bump = false;
        }
    }

    /// Fee rate needed to enter a pool limited to `max_bytes`. Decays with a
    /// twelve hour half-life, faster while the pool is small, but only once a
    /// block has arrived since the last bump.
    pub fn min_fee(&mut self, now: u64, max_bytes: usize) -> FeeRate {
        if !self.block_since_bump || self.rolling_min_fee == 0.0 {
            return FeeRate::per_kb(self.rolling_min_fee.round() as Amount);
        }
        if now > self.last_rolling_update + 10 {
            let mut halflife = ROLLING_FEE_HALFLIFE_SECS as f64;
            if self.total_bytes < max_bytes / 4 {
                halflife /= 4.0;
            } else if self.total_bytes < max_bytes / 2 {
                halflife /= 2.0;
            }
            let elapsed = (now - self.last_rolling_update) as f64;
            self.rolling_min_fee /= 2f64.powf(elapsed / halflife);
            self.last_rolling_update = now;
            if self.rolling_min_fee < self.incremental_relay_fee.as_per_kb() as f64 / 2.0 {
                self.rolling_min_fee = 0.0;
                return FeeRate::ZERO;
            }
        }
        FeeRate::per_kb(self.rolling_min_fee.round() as Amount).max(self.incremental_relay_fee)
    }

    /// Read-only form of [`Mempool::min_fee`] without applying decay.
    pub fn rolling_min_fee(&self) -> FeeRate {
        FeeRate::per_kb(self.rolling_min_fee.round() as Amount)
    }
}

/// Chain coins overlaid with in-pool outputs and, for package dry runs,
/// outputs of earlier package members.
pub struct MempoolCoinView<'a> {
    base: &'a dyn CoinView,
    pool: &'a Mempool,
    package: Option<&'a HashMap<OutPoint, Coin>>,
}

impl<'a> MempoolCoinView<'a> {
    pub fn new(
        base: &'a dyn CoinView,
        pool: &'a Mempool,
        package: Option<&'a HashMap<OutPoint, Coin>>,
    ) -> Self {
        Self { base, pool, package }
    }

    pub fn base(&self) -> &'a dyn CoinView {
        self.base
    }
}

impl CoinView for MempoolCoinView<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(coin) = self.pool.output_coin(outpoint) {
            return Ok(Some(coin));
        }
        if let Some(coin) = self.package.and_then(|package| package.get(outpoint)) {
            return Ok(Some(coin.clone()));
        }
        self.base.coin(outpoint)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        self.base.best_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapd_primitives::transaction::{TxIn, TxOut};

    fn tx(prevouts: &[OutPoint], outputs: usize, salt: u8) -> Transaction {
        Transaction {
            features: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn {
                    prevout: *prevout,
                    script_sig: vec![0x01, salt],
                    sequence: u32::MAX,
                })
                .collect(),
            vout: (0..outputs)
                .map(|_| TxOut {
                    value: 1_000,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn entry(tx: Transaction, fee: Amount, size: usize, time: u64) -> MempoolEntry {
        MempoolEntry::new(tx, fee, size, 0, time, 1, false, LockPoints::default())
    }

    fn chain(pool: &mut Mempool, len: usize, fee: Amount) -> Vec<Hash256> {
        let mut prevout = OutPoint::new([9u8; 32], 0);
        let mut txids = Vec::new();
        for salt in 0..len {
            let next = tx(&[prevout], 1, salt as u8);
            let txid = next.txid();
            pool.add_unchecked(entry(next, fee, 200, 100));
            prevout = OutPoint::new(txid, 0);
            txids.push(txid);
        }
        txids
    }

    #[test]
    fn remove_mined_parent_detaches_children() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let txids = chain(&mut pool, 2, 500);
        assert!(pool.get(&txids[0]).expect("parent").children().contains(&txids[1]));

        let parent = pool.get(&txids[0]).expect("parent").tx.clone();
        assert_eq!(pool.remove_for_block(&[parent], 0), 1);
        let child = pool.get(&txids[1]).expect("child stays");
        assert!(child.parents().is_empty());
        assert_eq!(pool.bytes(), 200);
    }

    #[test]
    fn remove_with_descendants_removes_entire_subtree() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let txids = chain(&mut pool, 4, 500);
        let removed = pool.remove_with_descendants(&txids[1], RemovalReason::Conflict);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed.last().map(|entry| entry.txid), Some(txids[1]));
        assert_eq!(pool.txids(), vec![txids[0]]);
        assert!(pool.get(&txids[0]).expect("root").children().is_empty());
        assert_eq!(pool.spender(&OutPoint::new(txids[0], 0)), None);
    }

    #[test]
    fn ancestor_and_descendant_limits() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let txids = chain(&mut pool, 3, 500);
        let tip: BTreeSet<_> = [txids[2]].into_iter().collect();
        let ancestors = pool
            .calculate_ancestors(&tip, 200, &AncestorLimits::UNLIMITED)
            .expect("unlimited");
        assert_eq!(ancestors.len(), 3);

        let tight = AncestorLimits {
            ancestor_count: 3,
            ..AncestorLimits::UNLIMITED
        };
        let err = pool.calculate_ancestors(&tip, 200, &tight).expect_err("four deep");
        assert!(err.contains("too many unconfirmed ancestors"), "{err}");

        let root: BTreeSet<_> = [txids[0]].into_iter().collect();
        let narrow = AncestorLimits {
            descendant_count: 3,
            ..AncestorLimits::UNLIMITED
        };
        let err = pool.calculate_ancestors(&root, 200, &narrow).expect_err("root has 3");
        assert!(err.contains("too many descendants"), "{err}");

        let small = AncestorLimits {
            ancestor_size: 700,
            ..AncestorLimits::UNLIMITED
        };
        assert!(pool.calculate_ancestors(&tip, 200, &small).is_err());
    }

    #[test]
    fn readded_parent_relinks_existing_children() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let txids = chain(&mut pool, 2, 500);
        let parent = pool.remove(&txids[0], RemovalReason::Block).expect("parent");
        assert!(pool.get(&txids[1]).expect("child").parents().is_empty());

        pool.add_unchecked(parent);
        assert!(pool.get(&txids[1]).expect("child").parents().contains(&txids[0]));
        assert_eq!(pool.descendants(&txids[0]).len(), 2);
    }

    #[test]
    fn prioritisation_survives_until_entry_arrives() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let pending = tx(&[OutPoint::new([3u8; 32], 0)], 1, 1);
        let txid = pending.txid();
        pool.prioritise_transaction(txid, 700);
        pool.prioritise_transaction(txid, 300);
        pool.add_unchecked(entry(pending, 100, 250, 5));
        assert_eq!(pool.get(&txid).expect("entry").modified_fee(), 1_100);
        pool.prioritise_transaction(txid, -1_000);
        assert_eq!(pool.get(&txid).expect("entry").modified_fee(), 100);
        assert_eq!(pool.fee_delta(&txid), 0);
    }

    #[test]
    fn trimming_evicts_cheapest_package_and_raises_min_fee() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let cheap = tx(&[OutPoint::new([4u8; 32], 0)], 1, 1);
        let rich = tx(&[OutPoint::new([5u8; 32], 0)], 1, 2);
        let cheap_id = cheap.txid();
        let rich_id = rich.txid();
        pool.add_unchecked(entry(cheap, 200, 1000, 1));
        pool.add_unchecked(entry(rich, 5_000, 1000, 2));

        let evicted = pool.trim_to_size(1500);
        assert_eq!(evicted, vec![cheap_id]);
        assert!(pool.contains(&rich_id));
        assert_eq!(pool.min_fee(10, 1500), FeeRate::per_kb(1200));
    }

    #[test]
    fn trimming_many_entries_goes_cheapest_first() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let mut singles = Vec::new();
        for index in 0..100u8 {
            let single = tx(&[OutPoint::new([index; 32], 7)], 1, index);
            singles.push(single.txid());
            pool.add_unchecked(entry(single, (Amount::from(index) + 1) * 1_000, 1000, 5));
        }
        let parent = tx(&[OutPoint::new([200u8; 32], 0)], 1, 1);
        let parent_id = parent.txid();
        let child = tx(&[OutPoint::new(parent_id, 0)], 1, 2);
        let child_id = child.txid();
        pool.add_unchecked(entry(parent, 0, 1000, 5));
        pool.add_unchecked(entry(child, 300_000, 1000, 5));

        let evicted = pool.trim_to_size(12_000);
        assert_eq!(evicted, singles[..90].to_vec());
        assert_eq!(pool.len(), 12);
        assert!(pool.contains(&parent_id));
        assert!(pool.contains(&child_id));
        assert_eq!(pool.min_fee(10, 12_000), FeeRate::per_kb(91_000));

        let rich = tx(&[OutPoint::new([201u8; 32], 0)], 1, 3);
        let rich_id = rich.txid();
        let cheap_child = tx(&[OutPoint::new(rich_id, 0)], 1, 4);
        let cheap_child_id = cheap_child.txid();
        pool.add_unchecked(entry(rich, 500_000, 1000, 6));
        pool.add_unchecked(entry(cheap_child, 100, 1000, 6));
        let evicted = pool.trim_to_size(13_000);
        assert_eq!(evicted, vec![cheap_child_id]);
        assert!(pool.contains(&rich_id));
    }

    #[test]
    fn rolling_min_fee_decays_only_after_a_block() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        pool.add_unchecked(entry(tx(&[OutPoint::new([6u8; 32], 0)], 1, 1), 10_000, 1000, 1));
        pool.add_unchecked(entry(tx(&[OutPoint::new([7u8; 32], 0)], 1, 2), 20_000, 1000, 1));
        pool.trim_to_size(1000);
        let bumped = pool.min_fee(0, 4000);
        assert_eq!(bumped, FeeRate::per_kb(11_000));
        assert_eq!(pool.min_fee(ROLLING_FEE_HALFLIFE_SECS * 10, 4000), bumped);

        pool.remove_for_block(&[], 1_000);
        // Under half full the half-life is halved.
        let later = pool.min_fee(1_000 + ROLLING_FEE_HALFLIFE_SECS / 2, 4000);
        assert_eq!(later, FeeRate::per_kb(5_500));
        assert_eq!(pool.min_fee(1_000 + ROLLING_FEE_HALFLIFE_SECS * 20, 4000), FeeRate::ZERO);
    }

    #[test]
    fn expiry_takes_descendants() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let old = chain(&mut pool, 2, 500);
        let fresh = tx(&[OutPoint::new([8u8; 32], 0)], 1, 9);
        let fresh_id = fresh.txid();
        pool.add_unchecked(entry(fresh, 500, 200, 1_000));
        assert_eq!(pool.expire(500), 2);
        assert!(!pool.contains(&old[0]));
        assert!(pool.contains(&fresh_id));
    }

    #[test]
    fn conflicts_with_a_block_are_removed() {
        let mut pool = Mempool::new(FeeRate::per_kb(1000));
        let txids = chain(&mut pool, 2, 500);
        let double_spend = tx(&[OutPoint::new([9u8; 32], 0)], 2, 77);
        assert_eq!(pool.remove_for_block(&[double_spend], 0), 2);
        assert!(pool.is_empty());
        assert!(!pool.contains(&txids[1]));
    }
}
