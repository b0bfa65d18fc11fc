//! Block tree, active chain and the transitions between tips.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tapd_consensus::constants::{LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS};
use tapd_consensus::money::{checked_money_add, Amount};
use tapd_consensus::{ConsensusParams, Hash256};
use tapd_log::Category;
use tapd_primitives::block::{Block, BlockHeader};
use tapd_primitives::encoding::DecodeError;
use tapd_primitives::hash::hash_to_hex;
use tapd_primitives::outpoint::OutPoint;
use tapd_script::interpreter::{ScriptFlags, BLOCK_SCRIPT_VERIFY_FLAGS};
use tapd_script::standard::is_unspendable;
use tapd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{
    BlockIndexEntry, EntryId, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK, BLOCK_FAILED_VALID,
    BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO, BLOCK_VALID_SCRIPTS, BLOCK_VALID_TRANSACTIONS,
    BLOCK_VALID_TREE,
};
use crate::coins::{Coin, CoinView, CoinsViewCache, CoinsViewDb};
use crate::colored::{check_colored_outputs, verify_balances};
use crate::flatfiles::{BlockStorage, FlatFileError};
use crate::header::{check_block_header, HeaderError};
use crate::index::{ActiveChain, BlockIndex, CandidateKey};
use crate::script_check::{check_inputs_with_coins, ScriptExecutionCache};
use crate::undo::{BlockUndo, TxUndo};
use crate::validation::{
    calculate_sequence_locks, check_block, check_tx_inputs, collect_coins,
    contextual_check_block, contextual_check_header, evaluate_sequence_locks,
    legacy_sigop_count, p2sh_sigop_count, RejectCode, Rejection, ValidationFailure,
    ValidationState,
};
use crate::xfield::{XFieldChange, XFieldHistory, XFieldHistoryError, XFieldView};

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    FlatFile(FlatFileError),
    XField(XFieldHistoryError),
    Decode(DecodeError),
    UnknownBlock(Hash256),
    MissingBlockData(Hash256),
    Corrupt(String),
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::XField(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::UnknownBlock(hash) => write!(f, "unknown block {}", hash_to_hex(hash)),
            ChainStateError::MissingBlockData(hash) => {
                write!(f, "block data missing for {}", hash_to_hex(hash))
            }
            ChainStateError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<XFieldHistoryError> for ChainStateError {
    fn from(err: XFieldHistoryError) -> Self {
        ChainStateError::XField(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<ChainStateError> for ValidationFailure {
    fn from(err: ChainStateError) -> Self {
        ValidationFailure::Internal(err.to_string())
    }
}

/// Outcome of a unit of block work: the data was bad, or the node was.
#[derive(Debug)]
enum Failure {
    Invalid(Rejection),
    Fatal(ChainStateError),
}

impl From<Rejection> for Failure {
    fn from(rejection: Rejection) -> Self {
        Failure::Invalid(rejection)
    }
}

impl From<ChainStateError> for Failure {
    fn from(err: ChainStateError) -> Self {
        Failure::Fatal(err)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Fatal(err.into())
    }
}

impl From<FlatFileError> for Failure {
    fn from(err: FlatFileError) -> Self {
        Failure::Fatal(err.into())
    }
}

impl From<XFieldHistoryError> for Failure {
    fn from(err: XFieldHistoryError) -> Self {
        Failure::Fatal(err.into())
    }
}

impl From<HeaderError> for Failure {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::History(err) => Failure::Fatal(err.into()),
            other => match other.rejection() {
                Some(rejection) => Failure::Invalid(rejection),
                None => Failure::Fatal(ChainStateError::Corrupt(other.to_string())),
            },
        }
    }
}

impl From<ValidationFailure> for Failure {
    fn from(err: ValidationFailure) -> Self {
        match err {
            ValidationFailure::Rejected(rejection) => Failure::Invalid(rejection),
            ValidationFailure::MissingInputs(missing) => Failure::Invalid(
                missing_inputs().with_debug(format!("{} inputs missing", missing.len())),
            ),
            ValidationFailure::Internal(message) => Failure::Fatal(ChainStateError::Corrupt(message)),
        }
    }
}

fn missing_inputs() -> Rejection {
    Rejection::consensus(100, RejectCode::Invalid, "bad-txns-inputs-missingorspent")
}

fn invalid(reason: &'static str) -> Rejection {
    Rejection::consensus(100, RejectCode::Invalid, reason)
}

/// Blocks that left and joined the active chain during one activation, in order.
#[derive(Debug, Default)]
pub struct ChainUpdate {
    pub disconnected: Vec<Block>,
    pub connected: Vec<Block>,
    pub invalid: Vec<(Hash256, Rejection)>,
}

impl ChainUpdate {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty() && self.invalid.is_empty()
    }

    fn extend(&mut self, other: ChainUpdate) {
        self.disconnected.extend(other.disconnected);
        self.connected.extend(other.connected);
        self.invalid.extend(other.invalid);
    }
}

#[derive(Debug)]
pub struct BlockProcessOutcome {
    pub state: ValidationState,
    /// `false` when the block was already stored.
    pub new_block: bool,
    pub update: ChainUpdate,
}

/// Owns the block index, the active chain and the persisted coin set. All
/// mutation goes through `&mut self`; callers serialize access with one lock.
pub struct ChainState<S, B> {
    params: ConsensusParams,
    store: Arc<S>,
    blocks: B,
    index: BlockIndex,
    chain: ActiveChain,
    candidates: BTreeSet<CandidateKey>,
    /// Blocks with data whose parent's chain transaction count is still unknown.
    unlinked: HashMap<EntryId, SmallVec<[EntryId; 2]>>,
    xfields: Arc<XFieldHistory>,
    script_cache: Arc<ScriptExecutionCache>,
    coins: CoinsViewDb<S>,
}

impl<S: KeyValueStore, B: BlockStorage> ChainState<S, B> {
    pub fn new(
        params: ConsensusParams,
        store: Arc<S>,
        blocks: B,
        xfields: Arc<XFieldHistory>,
        script_cache: Arc<ScriptExecutionCache>,
    ) -> Self {
        Self {
            params,
            coins: CoinsViewDb::new(Arc::clone(&store)),
            store,
            blocks,
            index: BlockIndex::new(),
            chain: ActiveChain::new(),
            candidates: BTreeSet::new(),
            unlinked: HashMap::new(),
            xfields,
            script_cache,
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn coins(&self) -> &dyn CoinView {
        &self.coins
    }

    pub fn xfields(&self) -> &Arc<XFieldHistory> {
        &self.xfields
    }

    pub fn script_cache(&self) -> &Arc<ScriptExecutionCache> {
        &self.script_cache
    }

    pub fn tip(&self) -> Option<&BlockIndexEntry> {
        self.chain.tip().map(|id| self.index.get(id))
    }

    pub fn tip_height(&self) -> i32 {
        self.chain.height()
    }

    pub fn tip_median_time_past(&self) -> i64 {
        self.chain
            .tip()
            .map(|id| self.index.median_time_past(id))
            .unwrap_or(0)
    }

    /// Median-time-past of the active block at `height`, or 0 off the chain.
    pub fn median_time_past_at(&self, height: i32) -> i64 {
        self.chain
            .at(height)
            .map(|id| self.index.median_time_past(id))
            .unwrap_or(0)
    }

    pub fn is_on_active_chain(&self, hash: &Hash256) -> bool {
        self.index
            .lookup(hash)
            .is_some_and(|id| self.chain.contains(&self.index, id))
    }

    /// Script flags enforced for a block at the next height.
    pub fn block_script_flags(&self) -> ScriptFlags {
        BLOCK_SCRIPT_VERIFY_FLAGS
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Best candidate tip, which is the active tip once activation has run.
    pub fn best_candidate(&self) -> Option<&BlockIndexEntry> {
        self.candidates
            .iter()
            .next_back()
            .map(|key| self.index.get(key.id))
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Block, ChainStateError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        let location = self
            .index
            .get(id)
            .data_pos
            .ok_or(ChainStateError::MissingBlockData(*hash))?;
        Ok(self.blocks.read_block(location)?)
    }

    /// Stores `genesis` as the root of an empty index and seeds the xfield history.
    pub fn init_genesis(&mut self, genesis: &Block) -> Result<(), ChainStateError> {
        let hash = genesis.hash();
        if !self.index.is_empty() {
            return match self.chain.genesis() {
                Some(id) if self.index.get(id).hash == hash => Ok(()),
                _ => Err(ChainStateError::Corrupt(
                    "index holds a different genesis block".to_string(),
                )),
            };
        }
        self.xfields
            .seed_from_genesis(genesis, self.params.default_max_block_size)?;
        let location = self.blocks.write_block(genesis)?;
        let id = self.index.insert_header(&genesis.header);
        let entry = self.index.get_mut(id);
        entry.data_pos = Some(location);
        entry.status |= BLOCK_HAVE_DATA;
        entry.tx_count = genesis.transactions.len() as u32;
        entry.chain_tx = u64::from(entry.tx_count);
        entry.raise_validity(BLOCK_VALID_SCRIPTS);

        self.chain.set_tip(&self.index, Some(id));
        self.candidates.insert(self.index.candidate_key(id));

        // Genesis outputs are the initial distribution and can never be
        // reorganized away, so they are spendable at once.
        let mut view = CoinsViewCache::new(&self.coins);
        for tx in &genesis.transactions {
            let txid = tx.txid();
            for (vout, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                view.add_coin(
                    OutPoint::new(txid, vout as u32),
                    Coin::new(output.value, output.script_pubkey.clone(), 0, false),
                );
            }
        }
        view.set_best_block(hash);
        let changes = view.changes()?;

        let mut batch = WriteBatch::new();
        self.coins.apply(&mut batch, &changes);
        let flushed = self.queue_dirty_index(&mut batch, None);
        self.xfields.save_all(&mut batch)?;
        self.store.write_batch(&batch)?;
        self.index.mark_clean(&flushed);
        tapd_log::log_info!(
            cat: Category::Validation,
            "initialized chain at genesis {}",
            hash_to_hex(&hash)
        );
        Ok(())
    }

    /// Rebuilds the in-memory index from storage. Returns `false` on an empty store.
    pub fn load(&mut self) -> Result<bool, ChainStateError> {
        let rows = self.store.scan_prefix(Column::BlockIndex, &[])?;
        if rows.is_empty() {
            return Ok(false);
        }
        let mut entries = rows
            .iter()
            .map(|(_, value)| BlockIndexEntry::decode(value))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.height);
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(self.index.insert_loaded(entry));
        }
        for id in ids {
            let entry = self.index.get(id);
            if !entry.have_data() {
                continue;
            }
            match entry.parent {
                Some(parent) if self.index.get(parent).chain_tx == 0 => {
                    self.unlinked.entry(parent).or_default().push(id);
                }
                parent => {
                    let base = parent.map(|p| self.index.get(p).chain_tx).unwrap_or(0);
                    let entry = self.index.get_mut(id);
                    entry.chain_tx = base + u64::from(entry.tx_count);
                }
            }
        }
        self.index.take_dirty();
        self.xfields.load(&*self.store)?;

        let best = self.coins.best_block()?;
        let tip = self.index.lookup(&best).ok_or_else(|| {
            ChainStateError::Corrupt(format!("best block {} not in index", hash_to_hex(&best)))
        })?;
        self.chain.set_tip(&self.index, Some(tip));
        self.index.rank_loaded(&self.chain);
        let tip_key = self.index.candidate_key(tip);
        let eligible: Vec<CandidateKey> = self
            .index
            .iter()
            .filter(|(_, entry)| entry.is_valid(BLOCK_VALID_TRANSACTIONS) && entry.chain_tx > 0)
            .map(|(id, _)| self.index.candidate_key(id))
            .filter(|key| *key >= tip_key)
            .collect();
        self.candidates.extend(eligible);
        tapd_log::log_info!(
            cat: Category::Validation,
            "loaded {} block index entries, tip {} at height {}",
            self.index.len(),
            hash_to_hex(&best),
            self.chain.height()
        );
        Ok(true)
    }

    /// Validates and indexes headers in order. Stops at the first rejection.
    pub fn process_new_block_headers(
        &mut self,
        headers: &[BlockHeader],
        adjusted_time: i64,
    ) -> Result<ValidationState, ChainStateError> {
        let mut state = ValidationState::Valid;
        for header in headers {
            match self.accept_header(header, adjusted_time) {
                Ok(_) => {}
                Err(Failure::Invalid(rejection)) => {
                    tapd_log::log_debug!(
                        cat: Category::Validation,
                        "header {} rejected: {rejection}",
                        hash_to_hex(&header.hash())
                    );
                    state = ValidationState::Invalid(rejection);
                    break;
                }
                Err(Failure::Fatal(err)) => return Err(err),
            }
        }
        self.flush_index()?;
        Ok(state)
    }

    /// Stores a block if it is new and valid in isolation, then moves the tip
    /// toward the best candidate.
    pub fn process_new_block(
        &mut self,
        block: &Block,
        adjusted_time: i64,
    ) -> Result<BlockProcessOutcome, ChainStateError> {
        let accepted = self.accept_block(block, adjusted_time);
        self.flush_index()?;
        let (state, new_block) = match accepted {
            Ok(new_block) => (ValidationState::Valid, new_block),
            Err(Failure::Invalid(rejection)) => {
                tapd_log::log_warn!(
                    cat: Category::Validation,
                    "block {} rejected: {rejection}",
                    hash_to_hex(&block.hash())
                );
                return Ok(BlockProcessOutcome {
                    state: ValidationState::Invalid(rejection),
                    new_block: false,
                    update: ChainUpdate::default(),
                });
            }
            Err(Failure::Fatal(err)) => return Err(err),
        };
        let update = self.activate_best_chain()?;
        Ok(BlockProcessOutcome {
            state,
            new_block,
            update,
        })
    }

    fn accept_header(
        &mut self,
        header: &BlockHeader,
        adjusted_time: i64,
    ) -> Result<EntryId, Failure> {
        let hash = header.hash();
        if let Some(id) = self.index.lookup(&hash) {
            if self.index.get(id).is_failed() {
                return Err(Rejection::consensus(0, RejectCode::Duplicate, "duplicate")
                    .with_debug("block is marked invalid")
                    .into());
            }
            return Ok(id);
        }
        let parent = self
            .index
            .lookup(&header.prev_block)
            .ok_or_else(|| Rejection::consensus(10, RejectCode::Invalid, "prev-blk-not-found"))?;
        if self.index.get(parent).is_failed() {
            return Err(invalid("bad-prevblk").into());
        }
        let height = self.index.get(parent).height + 1;
        check_block_header(header, height as u32, &self.xfield_view(parent))?;
        contextual_check_header(header, self.index.median_time_past(parent), adjusted_time)?;

        let id = self.index.insert_header(header);
        self.index.get_mut(id).raise_validity(BLOCK_VALID_TREE);
        Ok(id)
    }

    /// Key lookups for a header whose parent is `parent`, which may sit on a side branch.
    fn xfield_view(&self, parent: EntryId) -> XFieldView<'_> {
        let fork = self.chain.find_fork(&self.index, Some(parent));
        let mut view = XFieldView::new(&self.xfields);
        let mut walk = Some(parent);
        while let Some(id) = walk {
            if Some(id) == fork {
                break;
            }
            let entry = self.index.get(id);
            view.record(entry.height as u32, &entry.header.xfield);
            walk = entry.parent;
        }
        match fork {
            Some(fork) => view.with_fork_height(self.index.get(fork).height as u32),
            None => view,
        }
    }

    /// Returns `true` when the block data was stored by this call.
    fn accept_block(&mut self, block: &Block, adjusted_time: i64) -> Result<bool, Failure> {
        let id = self.accept_header(&block.header, adjusted_time)?;
        if self.index.get(id).have_data() {
            return Ok(false);
        }
        if let Err(failure) = self.check_block_body(id, block) {
            if let Failure::Invalid(rejection) = &failure {
                if !rejection.corruption_possible {
                    self.index.get_mut(id).status |= BLOCK_FAILED_VALID;
                }
            }
            return Err(failure);
        }

        let location = self.blocks.write_block(block)?;
        let entry = self.index.get_mut(id);
        entry.data_pos = Some(location);
        entry.status |= BLOCK_HAVE_DATA;
        entry.tx_count = block.transactions.len() as u32;
        entry.raise_validity(BLOCK_VALID_TRANSACTIONS);
        self.link_chain_tx(id);
        Ok(true)
    }

    fn check_block_body(&self, id: EntryId, block: &Block) -> Result<(), Failure> {
        let entry = self.index.get(id);
        let parent = entry
            .parent
            .ok_or_else(|| ChainStateError::Corrupt("second genesis block".to_string()))?;
        let max_block_size = self
            .xfield_view(parent)
            .max_block_size(entry.height as u32)?;
        check_block(block, max_block_size)?;
        contextual_check_block(block, entry.height, self.index.median_time_past(parent))?;
        Ok(())
    }

    /// Sets chain transaction counts for `id` and any waiting descendants,
    /// admitting each as a tip candidate.
    fn link_chain_tx(&mut self, id: EntryId) {
        if let Some(parent) = self.index.get(id).parent {
            if self.index.get(parent).chain_tx == 0 {
                self.unlinked.entry(parent).or_default().push(id);
                return;
            }
        }
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let base = self
                .index
                .get(current)
                .parent
                .map(|parent| self.index.get(parent).chain_tx)
                .unwrap_or(0);
            let entry = self.index.get_mut(current);
            entry.chain_tx = base + u64::from(entry.tx_count);
            self.consider_candidate(current);
            if let Some(children) = self.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
    }

    fn consider_candidate(&mut self, id: EntryId) {
        let entry = self.index.get(id);
        if !entry.is_valid(BLOCK_VALID_TRANSACTIONS) || entry.chain_tx == 0 {
            return;
        }
        let not_worse = match self.chain.tip() {
            Some(tip) => !self.index.candidate_order(id, tip),
            None => true,
        };
        if not_worse {
            self.candidates.insert(self.index.candidate_key(id));
        }
    }

    /// Moves the tip to the best candidate, disconnecting and connecting as
    /// needed. Invalid blocks found on the way are marked and skipped.
    pub fn activate_best_chain(&mut self) -> Result<ChainUpdate, ChainStateError> {
        let mut update = ChainUpdate::default();
        while let Some(best) = self.find_best_candidate() {
            if Some(best) == self.chain.tip() {
                break;
            }
            self.activate_step(best, &mut update)?;
        }
        self.prune_candidates();
        Ok(update)
    }

    /// Highest candidate whose branch down to the active chain is usable.
    /// Unusable candidates are dropped on the way.
    fn find_best_candidate(&mut self) -> Option<EntryId> {
        loop {
            let best = self.candidates.iter().next_back()?.id;
            let fork = self.chain.find_fork(&self.index, Some(best));
            let mut walk = Some(best);
            let mut blocker = None;
            while let Some(id) = walk {
                if Some(id) == fork {
                    break;
                }
                let entry = self.index.get(id);
                if entry.is_failed() || !entry.have_data() {
                    blocker = Some((id, entry.is_failed()));
                    break;
                }
                walk = entry.parent;
            }
            let Some((blocker, failed)) = blocker else {
                return Some(best);
            };
            let mut walk = Some(best);
            while let Some(id) = walk {
                self.candidates.remove(&self.index.candidate_key(id));
                if id == blocker {
                    break;
                }
                if failed {
                    self.index.get_mut(id).status |= BLOCK_FAILED_CHILD;
                }
                walk = self.index.get(id).parent;
            }
        }
    }

    fn activate_step(&mut self, best: EntryId, update: &mut ChainUpdate) -> Result<(), ChainStateError> {
        let fork = self.chain.find_fork(&self.index, Some(best)).ok_or_else(|| {
            ChainStateError::Corrupt("candidate does not descend from genesis".to_string())
        })?;
        while self.chain.tip() != Some(fork) {
            update.disconnected.push(self.disconnect_tip()?);
        }
        let mut path = Vec::new();
        let mut walk = Some(best);
        while let Some(id) = walk {
            if id == fork {
                break;
            }
            path.push(id);
            walk = self.index.get(id).parent;
        }
        for id in path.into_iter().rev() {
            let hash = self.index.get(id).hash;
            match self.connect_tip(id) {
                Ok(block) => update.connected.push(block),
                Err(Failure::Invalid(rejection)) => {
                    tapd_log::log_warn!(
                        cat: Category::Validation,
                        "invalid block {} at height {}: {rejection}",
                        hash_to_hex(&hash),
                        self.index.get(id).height
                    );
                    self.invalid_block_found(id, &rejection);
                    self.flush_index()?;
                    update.invalid.push((hash, rejection));
                    return Ok(());
                }
                Err(Failure::Fatal(err)) => return Err(err),
            }
        }
        Ok(())
    }

    fn invalid_block_found(&mut self, id: EntryId, rejection: &Rejection) {
        if !rejection.corruption_possible {
            self.index.get_mut(id).status |= BLOCK_FAILED_VALID;
        }
        self.fail_descendants(id, !rejection.corruption_possible);
    }

    /// Removes `id` and every descendant from the candidates, optionally
    /// marking the descendants as failed children.
    fn fail_descendants(&mut self, id: EntryId, mark: bool) {
        let height = self.index.get(id).height;
        let descendants: Vec<EntryId> = self
            .index
            .iter()
            .filter(|(_, entry)| entry.height >= height)
            .map(|(other, _)| other)
            .filter(|other| self.index.is_ancestor(id, *other))
            .collect();
        for other in descendants {
            self.candidates.remove(&self.index.candidate_key(other));
            if mark && other != id {
                self.index.get_mut(other).status |= BLOCK_FAILED_CHILD;
            }
        }
    }

    fn prune_candidates(&mut self) {
        let Some(tip) = self.chain.tip() else {
            return;
        };
        let tip_key = self.index.candidate_key(tip);
        self.candidates = self.candidates.split_off(&tip_key);
        self.candidates.insert(tip_key);
    }

    fn connect_tip(&mut self, id: EntryId) -> Result<Block, Failure> {
        let entry = self.index.get(id);
        let location = entry
            .data_pos
            .ok_or(ChainStateError::MissingBlockData(entry.hash))?;
        let block = self.blocks.read_block(location)?;
        self.connect_block(id, &block)?;
        Ok(block)
    }

    /// Applies `block` on top of its parent, which must be the active tip.
    /// Nothing is written unless every check passes.
    fn connect_block(&mut self, id: EntryId, block: &Block) -> Result<(), Failure> {
        let entry = self.index.get(id);
        let hash = entry.hash;
        let height = entry.height;
        let parent = entry
            .parent
            .ok_or_else(|| ChainStateError::Corrupt("connecting a parentless block".to_string()))?;
        if self.chain.tip() != Some(parent) {
            return Err(ChainStateError::Corrupt(format!(
                "block {} does not extend the tip",
                hash_to_hex(&hash)
            ))
            .into());
        }
        let prev_median_time = self.index.median_time_past(parent);
        let index = &self.index;
        let median_time_at = |h: i32| {
            index
                .ancestor(parent, h)
                .map(|ancestor| index.median_time_past(ancestor))
                .unwrap_or(0)
        };

        let mut view = CoinsViewCache::new(&self.coins);
        let mut undo = BlockUndo::default();
        let mut fees: Amount = 0;
        let mut sigops: u32 = 0;
        for tx in &block.transactions {
            sigops = sigops.saturating_add(legacy_sigop_count(tx));
            if tx.is_coinbase() {
                view.add_transaction_outputs(tx, height as u32);
                continue;
            }
            let coins = match collect_coins(tx, &view)? {
                Ok(coins) => coins,
                Err(missing) => {
                    return Err(missing_inputs()
                        .with_debug(format!("{} in {}", missing[0], hash_to_hex(&tx.txid())))
                        .into())
                }
            };
            let fee = check_tx_inputs(tx, &coins, height)?;
            fees = checked_money_add(fees, fee)
                .ok_or_else(|| invalid("bad-txns-accumulated-fee-outofrange"))?;

            let mut prev_heights: Vec<i32> = coins.iter().map(|coin| coin.height as i32).collect();
            let locks = calculate_sequence_locks(
                tx,
                LOCKTIME_VERIFY_SEQUENCE,
                &mut prev_heights,
                median_time_at,
            );
            if !evaluate_sequence_locks(height, prev_median_time, locks) {
                return Err(invalid("bad-txns-nonfinal")
                    .with_debug("contains a non-BIP68-final transaction")
                    .into());
            }

            sigops = sigops.saturating_add(p2sh_sigop_count(tx, &coins));
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(invalid("bad-blk-sigops").into());
            }

            check_colored_outputs(tx, &coins)?;
            let input_sums = check_inputs_with_coins(
                tx,
                &coins,
                BLOCK_SCRIPT_VERIFY_FLAGS,
                Some(self.script_cache.as_ref()),
                false,
            )?;
            verify_balances(tx, &input_sums, 0)?;

            let mut spent = Vec::with_capacity(tx.vin.len());
            for input in &tx.vin {
                match view.spend_coin(&input.prevout)? {
                    Some(coin) => spent.push(coin),
                    None => return Err(missing_inputs().into()),
                }
            }
            undo.txs.push(TxUndo { spent });
            view.add_transaction_outputs(tx, height as u32);
        }

        let coinbase_value = block
            .transactions
            .first()
            .and_then(|coinbase| coinbase.value_out())
            .ok_or_else(|| invalid("bad-txns-txouttotal-toolarge"))?;
        if coinbase_value > fees {
            return Err(invalid("bad-cb-amount")
                .with_debug(format!("coinbase pays too much (actual={coinbase_value} vs limit={fees})"))
                .into());
        }
        view.set_best_block(hash);
        let changes = view.changes()?;

        let undo_pos = self.blocks.write_undo(&undo)?;
        let mut connected = self.index.get(id).clone();
        connected.undo_pos = Some(undo_pos);
        connected.status |= BLOCK_HAVE_UNDO;
        connected.raise_validity(BLOCK_VALID_SCRIPTS);
        let xfield_change = block.header.xfield.kind().map(|_| XFieldChange {
            value: block.header.xfield.clone(),
            height: height as u32 + 1,
            block_hash: hash,
        });

        // Nothing in memory changes until the batch is durable.
        let mut batch = WriteBatch::new();
        self.coins.apply(&mut batch, &changes);
        let mut flushed = self.queue_dirty_index(&mut batch, Some(id));
        batch.put(Column::BlockIndex, hash, connected.encode());
        match &xfield_change {
            Some(change) => self.xfields.save_all_with(&mut batch, change)?,
            None => self.xfields.save_all(&mut batch)?,
        }
        self.store.write_batch(&batch)?;

        *self.index.get_mut(id) = connected;
        flushed.push(id);
        self.index.mark_clean(&flushed);
        if let Some(change) = xfield_change {
            self.xfields.add(change)?;
        }
        self.chain.set_tip(&self.index, Some(id));
        tapd_log::log_info!(
            cat: Category::Validation,
            "new tip {} height={} txs={} fees={}",
            hash_to_hex(&hash),
            height,
            block.transactions.len(),
            fees
        );
        Ok(())
    }

    /// Rolls the tip back onto its parent using the stored undo record.
    fn disconnect_tip(&mut self) -> Result<Block, ChainStateError> {
        let tip = self
            .chain
            .tip()
            .ok_or_else(|| ChainStateError::Corrupt("no tip to disconnect".to_string()))?;
        let entry = self.index.get(tip);
        let hash = entry.hash;
        let parent = entry
            .parent
            .ok_or_else(|| ChainStateError::Corrupt("cannot disconnect genesis".to_string()))?;
        let data_pos = entry.data_pos.ok_or(ChainStateError::MissingBlockData(hash))?;
        let undo_pos = entry.undo_pos.ok_or(ChainStateError::MissingBlockData(hash))?;
        let block = self.blocks.read_block(data_pos)?;
        let undo = self.blocks.read_undo(undo_pos)?;
        if undo.txs.len() + 1 != block.transactions.len() {
            return Err(ChainStateError::Corrupt(format!(
                "undo for {} covers {} transactions, block has {}",
                hash_to_hex(&hash),
                undo.txs.len(),
                block.transactions.len()
            )));
        }

        let mut view = CoinsViewCache::new(&self.coins);
        let mut unclean = false;
        for (position, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            for (vout, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                if view.spend_coin(&OutPoint::new(txid, vout as u32))?.is_none() {
                    unclean = true;
                }
            }
            if position == 0 {
                continue;
            }
            let tx_undo = &undo.txs[position - 1];
            if tx_undo.spent.len() != tx.vin.len() {
                return Err(ChainStateError::Corrupt(format!(
                    "undo input count mismatch in {}",
                    hash_to_hex(&txid)
                )));
            }
            for (input, coin) in tx.vin.iter().zip(&tx_undo.spent) {
                if view.have_coin(&input.prevout)? {
                    unclean = true;
                }
                view.add_coin(input.prevout, coin.clone());
            }
        }
        let parent_hash = self.index.get(parent).hash;
        view.set_best_block(parent_hash);
        let changes = view.changes()?;
        if unclean {
            tapd_log::log_warn!(
                cat: Category::Validation,
                "coin set did not match block {} while disconnecting",
                hash_to_hex(&hash)
            );
        }

        self.xfields.remove_introduced_by(&hash)?;
        let mut batch = WriteBatch::new();
        self.coins.apply(&mut batch, &changes);
        let flushed = self.queue_dirty_index(&mut batch, None);
        self.xfields.save_all(&mut batch)?;
        self.store.write_batch(&batch)?;
        self.index.mark_clean(&flushed);
        self.chain.set_tip(&self.index, Some(parent));
        tapd_log::log_info!(
            cat: Category::Validation,
            "disconnected {} height={}",
            hash_to_hex(&hash),
            self.index.get(tip).height
        );
        Ok(block)
    }

    /// Marks a block and its descendants invalid and moves the tip off them.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<ChainUpdate, ChainStateError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if self.index.get(id).parent.is_none() {
            return Err(ChainStateError::Corrupt("cannot invalidate genesis".to_string()));
        }
        let mut update = ChainUpdate::default();
        while self.chain.contains(&self.index, id) {
            update.disconnected.push(self.disconnect_tip()?);
        }
        self.index.get_mut(id).status |= BLOCK_FAILED_VALID;
        self.fail_descendants(id, true);
        self.readmit_candidates();
        self.flush_index()?;
        tapd_log::log_info!(
            cat: Category::Validation,
            "invalidated {}",
            hash_to_hex(hash)
        );
        update.extend(self.activate_best_chain()?);
        Ok(update)
    }

    /// Clears failure marks on a block, its ancestors and its descendants.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<ChainUpdate, ChainStateError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        let affected: Vec<EntryId> = self
            .index
            .iter()
            .filter(|(_, entry)| entry.is_failed())
            .map(|(other, _)| other)
            .filter(|other| self.index.is_ancestor(id, *other) || self.index.is_ancestor(*other, id))
            .collect();
        for other in affected {
            self.index.get_mut(other).status &= !BLOCK_FAILED_MASK;
        }
        self.readmit_candidates();
        self.flush_index()?;
        self.activate_best_chain()
    }

    /// Re-adds every usable entry that is not worse than the tip.
    fn readmit_candidates(&mut self) {
        let usable: Vec<EntryId> = self
            .index
            .iter()
            .filter(|(_, entry)| entry.is_valid(BLOCK_VALID_TRANSACTIONS) && entry.chain_tx > 0)
            .map(|(id, _)| id)
            .collect();
        for id in usable {
            self.consider_candidate(id);
        }
    }

    /// Queues dirty entries other than `skip` without clearing them; callers
    /// mark the returned ids clean once the batch is written.
    fn queue_dirty_index(&self, batch: &mut WriteBatch, skip: Option<EntryId>) -> Vec<EntryId> {
        let mut dirty = self.index.dirty_ids();
        dirty.retain(|id| Some(*id) != skip);
        for id in &dirty {
            let entry = self.index.get(*id);
            batch.put(Column::BlockIndex, entry.hash, entry.encode());
        }
        dirty
    }

    fn flush_index(&mut self) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        let flushed = self.queue_dirty_index(&mut batch, None);
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        self.index.mark_clean(&flushed);
        Ok(())
    }
}
