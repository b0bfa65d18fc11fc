//! In-memory block index arena and the active chain view.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tapd_consensus::constants::MEDIAN_TIME_SPAN;
use tapd_consensus::Hash256;
use tapd_primitives::block::BlockHeader;

use crate::blockindex::{BlockIndexEntry, EntryId, BLOCK_VALID_HEADER};

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip link of an entry at `height` points to.
fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Sort key of a tip candidate. Ascending order puts the preferred tip last:
/// higher first, then lower sequence id, then lower arena id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CandidateKey {
    pub height: i32,
    pub sequence_id: u64,
    pub id: EntryId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, EntryId>,
    next_sequence_id: u64,
    dirty: HashSet<EntryId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            next_sequence_id: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    /// Mutable access also schedules the entry for the next index flush.
    pub fn get_mut(&mut self, id: EntryId) -> &mut BlockIndexEntry {
        self.dirty.insert(id);
        &mut self.entries[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &BlockIndexEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (EntryId(index as u32), entry))
    }

    /// Adds a newly accepted header. The parent, when the header has one, must
    /// already be indexed. Returns the existing handle for a known hash.
    pub fn insert_header(&mut self, header: &BlockHeader) -> EntryId {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        let parent = self.lookup(&header.prev_block);
        let (height, parent_time_max) = match parent {
            Some(parent) => {
                let parent = self.get(parent);
                (parent.height + 1, parent.time_max)
            }
            None => (0, 0),
        };
        let mut entry = BlockIndexEntry {
            hash,
            header: header.clone(),
            height,
            status: 0,
            parent,
            skip: None,
            sequence_id,
            time_max: parent_time_max.max(header.time),
            tx_count: 0,
            chain_tx: 0,
            data_pos: None,
            undo_pos: None,
        };
        entry.raise_validity(BLOCK_VALID_HEADER);
        self.push(entry)
    }

    /// Adds an entry read back from storage. Entries must arrive parents first.
    pub fn insert_loaded(&mut self, mut entry: BlockIndexEntry) -> EntryId {
        if let Some(id) = self.lookup(&entry.hash) {
            return id;
        }
        entry.parent = self.lookup(&entry.header.prev_block);
        entry.sequence_id = 0;
        let id = self.push(entry);
        self.dirty.remove(&id);
        id
    }

    /// Ranks loaded entries after a restart: the active chain keeps sequence
    /// zero, every other loaded entry gets one, and new headers start above
    /// both. A loaded tip therefore wins any height tie.
    pub fn rank_loaded(&mut self, active: &ActiveChain) {
        let off_chain: Vec<usize> = self
            .iter()
            .filter(|(id, entry)| entry.sequence_id == 0 && !active.contains(self, *id))
            .map(|(id, _)| id.index())
            .collect();
        for index in off_chain {
            self.entries[index].sequence_id = 1;
        }
        self.next_sequence_id = self.next_sequence_id.max(2);
    }

    fn push(&mut self, mut entry: BlockIndexEntry) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        entry.skip = entry
            .parent
            .and_then(|parent| self.ancestor(parent, get_skip_height(entry.height)));
        self.by_hash.insert(entry.hash, id);
        self.entries.push(entry);
        self.dirty.insert(id);
        id
    }

    pub fn take_dirty(&mut self) -> Vec<EntryId> {
        let dirty = self.dirty_ids();
        self.dirty.clear();
        dirty
    }

    /// Entries awaiting a flush, in arena order. They stay dirty until
    /// `mark_clean`.
    pub fn dirty_ids(&self) -> Vec<EntryId> {
        let mut dirty: Vec<EntryId> = self.dirty.iter().copied().collect();
        dirty.sort();
        dirty
    }

    pub fn mark_clean(&mut self, ids: &[EntryId]) {
        for id in ids {
            self.dirty.remove(id);
        }
    }

    /// Ancestor of `id` at `height`, following skip links where they do not overshoot.
    pub fn ancestor(&self, id: EntryId, height: i32) -> Option<EntryId> {
        let mut walk = id;
        let mut walk_height = self.get(walk).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let entry = self.get(walk);
            let skip_height = get_skip_height(walk_height);
            let skip_height_prev = get_skip_height(walk_height - 1);
            let take_skip = entry.skip.is_some()
                && (skip_height == height
                    || (skip_height > height
                        && !(skip_height_prev < skip_height - 2 && skip_height_prev >= height)));
            match (take_skip, entry.skip, entry.parent) {
                (true, Some(skip), _) => {
                    walk = skip;
                    walk_height = skip_height;
                }
                (_, _, Some(parent)) => {
                    walk = parent;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    /// `None` only when the entries do not share a genesis.
    pub fn last_common_ancestor(&self, a: EntryId, b: EntryId) -> Option<EntryId> {
        let height = self.get(a).height.min(self.get(b).height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.get(a).parent?;
            b = self.get(b).parent?;
        }
        Some(a)
    }

    pub fn is_ancestor(&self, ancestor: EntryId, id: EntryId) -> bool {
        self.ancestor(id, self.get(ancestor).height) == Some(ancestor)
    }

    pub fn candidate_key(&self, id: EntryId) -> CandidateKey {
        let entry = self.get(id);
        CandidateKey {
            height: entry.height,
            sequence_id: entry.sequence_id,
            id,
        }
    }

    /// `true` when `a` sorts strictly before `b` in the candidate set.
    pub fn candidate_order(&self, a: EntryId, b: EntryId) -> bool {
        self.candidate_key(a) < self.candidate_key(b)
    }

    pub fn median_time_past(&self, id: EntryId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.get(current);
            times.push(i64::from(entry.time()));
            walk = entry.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }
}

/// Contiguous genesis-to-tip view over the index.
#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    entries: Vec<EntryId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<EntryId> {
        self.entries.first().copied()
    }

    pub fn tip(&self) -> Option<EntryId> {
        self.entries.last().copied()
    }

    /// `-1` for an empty chain.
    pub fn height(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<EntryId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.entries.get(height).copied())
    }

    pub fn contains(&self, index: &BlockIndex, id: EntryId) -> bool {
        self.at(index.get(id).height) == Some(id)
    }

    pub fn next(&self, index: &BlockIndex, id: EntryId) -> Option<EntryId> {
        if self.contains(index, id) {
            self.at(index.get(id).height + 1)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = EntryId> + '_ {
        self.entries.iter().copied()
    }

    /// Points the chain at `tip`, keeping the shared prefix. `None` clears it.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<EntryId>) {
        let Some(tip) = tip else {
            self.entries.clear();
            return;
        };
        let mut suffix = Vec::new();
        let mut walk = Some(tip);
        let mut keep = 0usize;
        while let Some(id) = walk {
            let height = index.get(id).height as usize;
            if self.entries.get(height) == Some(&id) {
                keep = height + 1;
                break;
            }
            suffix.push(id);
            walk = index.get(id).parent;
        }
        self.entries.truncate(keep);
        self.entries.extend(suffix.into_iter().rev());
    }

    /// Highest entry shared by this chain and the branch ending at `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: Option<EntryId>) -> Option<EntryId> {
        let id = id?;
        let mut walk = if index.get(id).height > self.height() {
            index.ancestor(id, self.height())
        } else {
            Some(id)
        };
        while let Some(current) = walk {
            if self.contains(index, current) {
                return Some(current);
            }
            walk = index.get(current).parent;
        }
        None
    }
}
