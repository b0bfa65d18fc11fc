//! Height-indexed history of federation parameter changes.
//!
//! Each xfield kind keeps its own list ordered by the height at which the
//! change takes effect. Lists are seeded once from the genesis block; reads
//! before that fail with [`XFieldHistoryError::NotSeeded`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tapd_consensus::Hash256;
use tapd_log::Category;
use tapd_primitives::block::{Block, XField, XFieldKind};
use tapd_primitives::encoding::{DecodeError, Decoder, Encoder};
use tapd_primitives::hash::hash_to_hex;
use tapd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XFieldChange {
    pub value: XField,
    /// First height at which `value` is in force.
    pub height: u32,
    /// Block that carried the change.
    pub block_hash: Hash256,
}

#[derive(Debug)]
pub enum XFieldHistoryError {
    NotSeeded(XFieldKind),
    NotNew {
        kind: XFieldKind,
        height: u32,
        latest: u32,
    },
    EmptyValue,
    MissingGenesisKey,
    Timeout(XFieldKind),
    Poisoned,
    Store(StoreError),
    Decode(DecodeError),
}

impl fmt::Display for XFieldHistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XFieldHistoryError::NotSeeded(kind) => {
                write!(f, "{} history has not been seeded", kind.as_str())
            }
            XFieldHistoryError::NotNew {
                kind,
                height,
                latest,
            } => write!(
                f,
                "{} change at height {height} is not newer than {latest}",
                kind.as_str()
            ),
            XFieldHistoryError::EmptyValue => write!(f, "xfield change carries no value"),
            XFieldHistoryError::MissingGenesisKey => {
                write!(f, "genesis block does not carry an aggregate public key")
            }
            XFieldHistoryError::Timeout(kind) => {
                write!(f, "timed out waiting for {} history", kind.as_str())
            }
            XFieldHistoryError::Poisoned => write!(f, "xfield history lock poisoned"),
            XFieldHistoryError::Store(err) => write!(f, "{err}"),
            XFieldHistoryError::Decode(err) => write!(f, "xfield history record: {err}"),
        }
    }
}

impl std::error::Error for XFieldHistoryError {}

impl From<StoreError> for XFieldHistoryError {
    fn from(err: StoreError) -> Self {
        XFieldHistoryError::Store(err)
    }
}

impl From<DecodeError> for XFieldHistoryError {
    fn from(err: DecodeError) -> Self {
        XFieldHistoryError::Decode(err)
    }
}

#[derive(Debug, Default)]
struct Lists {
    aggregate_pubkey: Vec<XFieldChange>,
    max_block_size: Vec<XFieldChange>,
}

impl Lists {
    fn get(&self, kind: XFieldKind) -> &Vec<XFieldChange> {
        match kind {
            XFieldKind::AggregatePubkey => &self.aggregate_pubkey,
            XFieldKind::MaxBlockSize => &self.max_block_size,
        }
    }

    fn get_mut(&mut self, kind: XFieldKind) -> &mut Vec<XFieldChange> {
        match kind {
            XFieldKind::AggregatePubkey => &mut self.aggregate_pubkey,
            XFieldKind::MaxBlockSize => &mut self.max_block_size,
        }
    }
}

/// Shared by every validation call through an `Arc`.
#[derive(Debug, Default)]
pub struct XFieldHistory {
    lists: Mutex<Lists>,
    seeded: Condvar,
}

impl XFieldHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Lists>, XFieldHistoryError> {
        self.lists.lock().map_err(|_| XFieldHistoryError::Poisoned)
    }

    /// Appends a change. Rejected when a record at the same or a later height exists.
    pub fn add(&self, change: XFieldChange) -> Result<(), XFieldHistoryError> {
        let kind = change.value.kind().ok_or(XFieldHistoryError::EmptyValue)?;
        let mut lists = self.lock()?;
        let list = lists.get_mut(kind);
        ensure_newer(list, kind, &change)?;
        tapd_log::log_info!(
            cat: Category::XField,
            "{} change effective at height {} from block {}",
            kind.as_str(),
            change.height,
            hash_to_hex(&change.block_hash)
        );
        list.push(change);
        drop(lists);
        self.seeded.notify_all();
        Ok(())
    }

    /// Installs the genesis aggregate key and the default block size limit at height 0.
    pub fn seed_from_genesis(
        &self,
        genesis: &Block,
        default_max_block_size: u32,
    ) -> Result<(), XFieldHistoryError> {
        let block_hash = genesis.hash();
        let key = match &genesis.header.xfield {
            value @ XField::AggregatePubkey(_) if value.is_well_formed() => value.clone(),
            _ => return Err(XFieldHistoryError::MissingGenesisKey),
        };
        if self.is_seeded(XFieldKind::AggregatePubkey)? {
            return Ok(());
        }
        self.add(XFieldChange {
            value: key,
            height: 0,
            block_hash,
        })?;
        self.add(XFieldChange {
            value: XField::MaxBlockSize(default_max_block_size),
            height: 0,
            block_hash,
        })
    }

    pub fn is_seeded(&self, kind: XFieldKind) -> Result<bool, XFieldHistoryError> {
        Ok(!self.lock()?.get(kind).is_empty())
    }

    /// Blocks until `kind` has at least one record or `timeout` passes.
    pub fn wait_until_seeded(
        &self,
        kind: XFieldKind,
        timeout: Duration,
    ) -> Result<(), XFieldHistoryError> {
        let deadline = Instant::now() + timeout;
        let mut lists = self.lock()?;
        while lists.get(kind).is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(XFieldHistoryError::Timeout(kind));
            }
            let (guard, _) = self
                .seeded
                .wait_timeout(lists, deadline - now)
                .map_err(|_| XFieldHistoryError::Poisoned)?;
            lists = guard;
        }
        Ok(())
    }

    /// Value in force at `height`.
    pub fn latest(&self, kind: XFieldKind, height: u32) -> Result<XField, XFieldHistoryError> {
        let lists = self.lock()?;
        let list = lists.get(kind);
        let first = list.first().ok_or(XFieldHistoryError::NotSeeded(kind))?;
        Ok(list
            .iter()
            .rev()
            .find(|change| change.height <= height)
            .unwrap_or(first)
            .value
            .clone())
    }

    pub fn latest_aggregate_pubkey(&self, height: u32) -> Result<Vec<u8>, XFieldHistoryError> {
        match self.latest(XFieldKind::AggregatePubkey, height)? {
            XField::AggregatePubkey(key) => Ok(key),
            _ => Err(XFieldHistoryError::EmptyValue),
        }
    }

    pub fn latest_max_block_size(&self, height: u32) -> Result<u32, XFieldHistoryError> {
        match self.latest(XFieldKind::MaxBlockSize, height)? {
            XField::MaxBlockSize(size) => Ok(size),
            _ => Err(XFieldHistoryError::EmptyValue),
        }
    }

    pub fn records(&self, kind: XFieldKind) -> Result<Vec<XFieldChange>, XFieldHistoryError> {
        Ok(self.lock()?.get(kind).clone())
    }

    /// Drops every change carried by `block_hash`. Genesis records stay.
    pub fn remove_introduced_by(
        &self,
        block_hash: &Hash256,
    ) -> Result<Vec<XFieldChange>, XFieldHistoryError> {
        let mut lists = self.lock()?;
        let mut removed = Vec::new();
        for kind in XFieldKind::ALL {
            let list = lists.get_mut(kind);
            let mut index = 0;
            while index < list.len() {
                if list[index].height > 0 && list[index].block_hash == *block_hash {
                    removed.push(list.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for change in &removed {
            tapd_log::log_info!(
                cat: Category::XField,
                "removed {} change at height {}",
                change.value.kind().map(XFieldKind::as_str).unwrap_or("none"),
                change.height
            );
        }
        Ok(removed)
    }

    /// Queues every list as it would read after adding `pending`. The
    /// history itself is unchanged until the caller adds it.
    pub fn save_all_with(
        &self,
        batch: &mut WriteBatch,
        pending: &XFieldChange,
    ) -> Result<(), XFieldHistoryError> {
        let pending_kind = pending.value.kind().ok_or(XFieldHistoryError::EmptyValue)?;
        let lists = self.lock()?;
        for kind in XFieldKind::ALL {
            let list = lists.get(kind);
            if kind != pending_kind {
                batch.put(Column::XFieldHistory, [kind as u8], encode_changes(list));
                continue;
            }
            ensure_newer(list, kind, pending)?;
            let mut extended = list.clone();
            extended.push(pending.clone());
            batch.put(Column::XFieldHistory, [kind as u8], encode_changes(&extended));
        }
        Ok(())
    }

    /// Queues the full list for `kind` into `batch`.
    pub fn save(&self, batch: &mut WriteBatch, kind: XFieldKind) -> Result<(), XFieldHistoryError> {
        let lists = self.lock()?;
        batch.put(Column::XFieldHistory, [kind as u8], encode_changes(lists.get(kind)));
        Ok(())
    }

    pub fn save_all(&self, batch: &mut WriteBatch) -> Result<(), XFieldHistoryError> {
        for kind in XFieldKind::ALL {
            self.save(batch, kind)?;
        }
        Ok(())
    }

    /// Replaces the in-memory lists with what `store` holds.
    pub fn load<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<(), XFieldHistoryError> {
        let mut loaded = Lists::default();
        for kind in XFieldKind::ALL {
            if let Some(bytes) = store.get(Column::XFieldHistory, &[kind as u8])? {
                *loaded.get_mut(kind) = decode_changes(kind, &bytes)?;
            }
        }
        let seeded = !loaded.aggregate_pubkey.is_empty();
        *self.lock()? = loaded;
        if seeded {
            self.seeded.notify_all();
        }
        Ok(())
    }
}

/// Concatenated `<value><u32 height><block hash>` records, no count prefix.
fn ensure_newer(
    list: &[XFieldChange],
    kind: XFieldKind,
    change: &XFieldChange,
) -> Result<(), XFieldHistoryError> {
    match list.last() {
        Some(last) if last.height >= change.height => Err(XFieldHistoryError::NotNew {
            kind,
            height: change.height,
            latest: last.height,
        }),
        _ => Ok(()),
    }
}

pub fn encode_changes(changes: &[XFieldChange]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(changes.len() * 72);
    for change in changes {
        change.value.encode_value(&mut encoder);
        encoder.write_u32_le(change.height);
        encoder.write_hash(&change.block_hash);
    }
    encoder.into_inner()
}

pub fn decode_changes(kind: XFieldKind, bytes: &[u8]) -> Result<Vec<XFieldChange>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let mut changes = Vec::new();
    while !decoder.is_empty() {
        let value = XField::decode_value(kind, &mut decoder)?;
        let height = decoder.read_u32_le()?;
        let block_hash = decoder.read_hash()?;
        changes.push(XFieldChange {
            value,
            height,
            block_hash,
        });
    }
    Ok(changes)
}

/// Lookup for headers that are not yet part of the permanent history.
///
/// Records in the history above `fork_height + 1` belong to another branch
/// and are ignored; changes carried by the branch itself come from `pending`.
pub struct XFieldView<'a> {
    history: &'a XFieldHistory,
    fork_height: Option<u32>,
    pending_keys: BTreeMap<u32, Vec<u8>>,
    pending_sizes: BTreeMap<u32, u32>,
}

impl<'a> XFieldView<'a> {
    pub fn new(history: &'a XFieldHistory) -> Self {
        Self {
            history,
            fork_height: None,
            pending_keys: BTreeMap::new(),
            pending_sizes: BTreeMap::new(),
        }
    }

    pub fn with_fork_height(mut self, fork_height: u32) -> Self {
        self.fork_height = Some(fork_height);
        self
    }

    /// Records the xfield carried by a header at `height`; it applies from `height + 1`.
    pub fn record(&mut self, height: u32, xfield: &XField) {
        match xfield {
            XField::AggregatePubkey(key) => {
                self.pending_keys.insert(height + 1, key.clone());
            }
            XField::MaxBlockSize(size) => {
                self.pending_sizes.insert(height + 1, *size);
            }
            XField::None => {}
        }
    }

    fn history_height(&self, height: u32) -> u32 {
        match self.fork_height {
            Some(fork) => height.min(fork.saturating_add(1)),
            None => height,
        }
    }

    pub fn aggregate_pubkey(&self, height: u32) -> Result<Vec<u8>, XFieldHistoryError> {
        if let Some((_, key)) = self.pending_keys.range(..=height).next_back() {
            return Ok(key.clone());
        }
        self.history
            .latest_aggregate_pubkey(self.history_height(height))
    }

    pub fn max_block_size(&self, height: u32) -> Result<u32, XFieldHistoryError> {
        if let Some((_, size)) = self.pending_sizes.range(..=height).next_back() {
            return Ok(*size);
        }
        self.history.latest_max_block_size(self.history_height(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tapd_storage::memory::MemoryStore;

    fn key(tag: u8) -> XField {
        let mut bytes = vec![0x02];
        bytes.extend_from_slice(&[tag; 32]);
        XField::AggregatePubkey(bytes)
    }

    fn change(value: XField, height: u32, hash: u8) -> XFieldChange {
        XFieldChange {
            value,
            height,
            block_hash: [hash; 32],
        }
    }

    #[test]
    fn unseeded_reads_fail_fast() {
        let history = XFieldHistory::new();
        match history.latest(XFieldKind::AggregatePubkey, 10) {
            Err(XFieldHistoryError::NotSeeded(XFieldKind::AggregatePubkey)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            history.wait_until_seeded(XFieldKind::MaxBlockSize, Duration::from_millis(5)),
            Err(XFieldHistoryError::Timeout(_))
        ));
    }

    #[test]
    fn latest_follows_effective_height() {
        let history = XFieldHistory::new();
        history.add(change(key(1), 0, 0)).expect("genesis");
        history.add(change(key(2), 11, 10)).expect("rotation");
        history.add(change(key(3), 21, 20)).expect("rotation");

        assert_eq!(history.latest(XFieldKind::AggregatePubkey, 0).expect("h0"), key(1));
        assert_eq!(history.latest(XFieldKind::AggregatePubkey, 10).expect("h10"), key(1));
        assert_eq!(history.latest(XFieldKind::AggregatePubkey, 11).expect("h11"), key(2));
        assert_eq!(history.latest(XFieldKind::AggregatePubkey, 500).expect("h500"), key(3));

        match history.add(change(key(4), 21, 30)) {
            Err(XFieldHistoryError::NotNew { latest: 21, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(history.add(change(key(4), 5, 30)).is_err());
    }

    #[test]
    fn removing_a_block_restores_the_previous_value() {
        let history = XFieldHistory::new();
        history.add(change(XField::MaxBlockSize(1_000), 0, 0)).expect("genesis");
        history.add(change(XField::MaxBlockSize(2_000), 8, 7)).expect("bump");
        assert_eq!(history.latest_max_block_size(9).expect("size"), 2_000);
        let removed = history.remove_introduced_by(&[7u8; 32]).expect("remove");
        assert_eq!(removed.len(), 1);
        assert_eq!(history.latest_max_block_size(9).expect("size"), 1_000);
    }

    #[test]
    fn persisted_lists_round_trip_through_the_store() {
        let history = XFieldHistory::new();
        history.add(change(key(1), 0, 0)).expect("genesis");
        history.add(change(key(9), 4, 3)).expect("rotation");
        history.add(change(XField::MaxBlockSize(500), 0, 0)).expect("size");

        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        history.save_all(&mut batch).expect("save");
        store.write_batch(&batch).expect("write");

        let loaded = XFieldHistory::new();
        loaded.load(&store).expect("load");
        assert_eq!(
            loaded.records(XFieldKind::AggregatePubkey).expect("records"),
            history.records(XFieldKind::AggregatePubkey).expect("records")
        );
        assert_eq!(loaded.latest_max_block_size(100).expect("size"), 500);
    }

    #[test]
    fn pending_change_is_persisted_without_touching_memory() {
        let history = XFieldHistory::new();
        history.add(change(key(1), 0, 0)).expect("genesis");
        history.add(change(XField::MaxBlockSize(500), 0, 0)).expect("size");

        let pending = change(key(2), 6, 5);
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        history.save_all_with(&mut batch, &pending).expect("save");
        store.write_batch(&batch).expect("write");
        assert_eq!(history.records(XFieldKind::AggregatePubkey).expect("records").len(), 1);

        let loaded = XFieldHistory::new();
        loaded.load(&store).expect("load");
        assert_eq!(loaded.latest(XFieldKind::AggregatePubkey, 6).expect("key"), key(2));
        assert_eq!(loaded.latest_max_block_size(6).expect("size"), 500);

        let stale = change(key(3), 0, 9);
        assert!(matches!(
            history.save_all_with(&mut WriteBatch::new(), &stale),
            Err(XFieldHistoryError::NotNew { .. })
        ));
    }

    #[test]
    fn record_encoding_has_no_count_prefix() {
        let records = vec![change(XField::MaxBlockSize(7), 3, 9)];
        let bytes = encode_changes(&records);
        assert_eq!(bytes.len(), 4 + 4 + 32);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(
            decode_changes(XFieldKind::MaxBlockSize, &bytes).expect("decode"),
            records
        );
        assert!(decode_changes(XFieldKind::MaxBlockSize, &bytes[..10]).is_err());
    }

    #[test]
    fn waiting_reader_wakes_when_seeded() {
        let history = Arc::new(XFieldHistory::new());
        let reader = {
            let history = Arc::clone(&history);
            thread::spawn(move || {
                history
                    .wait_until_seeded(XFieldKind::AggregatePubkey, Duration::from_secs(10))
                    .expect("seeded");
                history.latest_aggregate_pubkey(0).expect("key")
            })
        };
        thread::sleep(Duration::from_millis(20));
        history.add(change(key(5), 0, 0)).expect("seed");
        let XField::AggregatePubkey(expected) = key(5) else {
            unreachable!()
        };
        assert_eq!(reader.join().expect("join"), expected);
    }

    #[test]
    fn view_ignores_records_from_other_branches() {
        let history = XFieldHistory::new();
        history.add(change(key(1), 0, 0)).expect("genesis");
        history.add(change(key(2), 31, 30)).expect("active branch rotation");

        let mut view = XFieldView::new(&history).with_fork_height(20);
        let XField::AggregatePubkey(genesis_key) = key(1) else {
            unreachable!()
        };
        assert_eq!(view.aggregate_pubkey(40).expect("key"), genesis_key);

        view.record(25, &key(7));
        let XField::AggregatePubkey(branch_key) = key(7) else {
            unreachable!()
        };
        assert_eq!(view.aggregate_pubkey(25).expect("key"), genesis_key);
        assert_eq!(view.aggregate_pubkey(26).expect("key"), branch_key);
    }
}
