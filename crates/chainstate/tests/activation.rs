use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use tapd_chainstate::blockindex::BLOCK_VALID_SCRIPTS;
use tapd_chainstate::coins::CoinView;
use tapd_chainstate::flatfiles::{FlatBlockStorage, MemoryBlockStorage};
use tapd_chainstate::script_check::ScriptExecutionCache;
use tapd_chainstate::state::{BlockProcessOutcome, ChainState};
use tapd_chainstate::xfield::XFieldHistory;
use tapd_consensus::constants::TAPYRUS_BLOCK_VERSION;
use tapd_consensus::money::{Amount, COIN};
use tapd_consensus::{consensus_params, Hash256, Network};
use tapd_primitives::block::{Block, BlockHeader, XField, XFieldKind};
use tapd_primitives::hash::hash160;
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::{Transaction, TxIn, TxOut};
use tapd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use tapd_script::standard::{p2pkh_script, push_data};
use tapd_storage::memory::MemoryStore;
use tapd_storage::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch};

const GENESIS_TIME: u32 = 1_600_000_000;
const NOW: i64 = 1_700_000_000;

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

fn coinbase(height: u32, salt: u8, value: Amount) -> Transaction {
    Transaction {
        features: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0u8; 32], height),
            script_sig: vec![0x01, salt],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x6a, 0x01, salt],
        }],
        lock_time: 0,
    }
}

fn seal(
    prev_block: Hash256,
    time: u32,
    transactions: Vec<Transaction>,
    xfield: XField,
    signer: &Key,
) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: TAPYRUS_BLOCK_VERSION,
            prev_block,
            merkle_root: [0u8; 32],
            im_merkle_root: [0u8; 32],
            time,
            xfield,
            proof: Vec::new(),
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block.header.im_merkle_root = block.compute_im_merkle_root().0;
    resign(&mut block.header, signer);
    block
}

fn resign(header: &mut BlockHeader, signer: &Key) {
    let secp = Secp256k1::new();
    let digest = Message::from_digest(header.signable_hash());
    header.proof = secp
        .sign_ecdsa(&digest, &signer.secret)
        .serialize_der()
        .to_vec();
}

/// Pays `value` from a p2pkh coin owned by `owner` back to `owner`.
fn spend(owner: &Key, prevout: OutPoint, value: Amount) -> Transaction {
    let script_pubkey = p2pkh_script(&hash160(&owner.public));
    let mut tx = Transaction {
        features: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script_pubkey.clone(),
        }],
        lock_time: 0,
    };
    let digest = signature_hash(&tx, 0, &script_pubkey, SighashType(SIGHASH_ALL), None)
        .expect("sighash");
    let secp = Secp256k1::new();
    let mut sig = secp
        .sign_ecdsa(&Message::from_digest(digest), &owner.secret)
        .serialize_der()
        .to_vec();
    sig.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &owner.public);
    tx.vin[0].script_sig = script_sig;
    tx
}

struct Fixture<B, S = MemoryStore> {
    state: ChainState<S, B>,
    signer: Key,
    wallet: Key,
    genesis: Block,
}

fn genesis_block(signer: &Key, wallet: &Key) -> Block {
    let distribution = Transaction {
        features: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0u8; 32], 0),
            script_sig: vec![0x01, 0x00],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: p2pkh_script(&hash160(&wallet.public)),
        }],
        lock_time: 0,
    };
    seal(
        [0u8; 32],
        GENESIS_TIME,
        vec![distribution],
        XField::AggregatePubkey(signer.public.clone()),
        signer,
    )
}

impl<B: tapd_chainstate::flatfiles::BlockStorage, S: KeyValueStore> Fixture<B, S> {
    fn with_storage(store: Arc<S>, blocks: B) -> Self {
        let signer = key(0x11);
        let wallet = key(0x22);
        let genesis = genesis_block(&signer, &wallet);
        let mut state = ChainState::new(
            consensus_params(Network::Dev),
            store,
            blocks,
            Arc::new(XFieldHistory::new()),
            Arc::new(ScriptExecutionCache::new(1024)),
        );
        if !state.load().expect("load") {
            state.init_genesis(&genesis).expect("genesis");
        }
        Self {
            state,
            signer,
            wallet,
            genesis,
        }
    }

    fn height_of(&self, block: &Block) -> u32 {
        let id = self
            .state
            .index()
            .lookup(&block.hash())
            .expect("parent indexed");
        self.state.index().get(id).height as u32
    }

    fn child(&self, parent: &Block, salt: u8, txs: Vec<Transaction>) -> Block {
        self.child_signed(parent, salt, txs, XField::None, &self.signer)
    }

    fn child_signed(
        &self,
        parent: &Block,
        salt: u8,
        txs: Vec<Transaction>,
        xfield: XField,
        signer: &Key,
    ) -> Block {
        let height = self.height_of(parent) + 1;
        let mut transactions = vec![coinbase(height, salt, 0)];
        transactions.extend(txs);
        seal(
            parent.hash(),
            parent.header.time + 60 + u32::from(salt),
            transactions,
            xfield,
            signer,
        )
    }

    fn submit(&mut self, block: &Block) -> BlockProcessOutcome {
        self.state.process_new_block(block, NOW).expect("process")
    }

    fn tip_hash(&self) -> Hash256 {
        self.state.tip().expect("tip").hash
    }

    fn genesis_coin(&self) -> OutPoint {
        OutPoint::new(self.genesis.transactions[0].txid(), 0)
    }
}

/// Memory store whose batches fail while armed, once they touch the coin set.
#[derive(Default)]
struct FailingStore {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl KeyValueStore for FailingStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let touches_coins = batch.iter().any(|op| op.column() == Column::Coins);
        if touches_coins && self.armed.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

fn fixture() -> Fixture<MemoryBlockStorage> {
    Fixture::with_storage(Arc::new(MemoryStore::new()), MemoryBlockStorage::new())
}

fn hashes(blocks: &[Block]) -> Vec<Hash256> {
    blocks.iter().map(Block::hash).collect()
}

#[test]
fn extends_chain_and_spends_the_genesis_distribution() {
    let mut fx = fixture();
    assert_eq!(fx.state.tip_height(), 0);
    let genesis_coin = fx.genesis_coin();
    assert!(fx.state.coins().have_coin(&genesis_coin).expect("coin lookup"));

    let tx = spend(&fx.wallet, genesis_coin, 50 * COIN - 1_000);
    let block = fx.child(&fx.genesis.clone(), 1, vec![tx.clone()]);
    let outcome = fx.submit(&block);
    assert!(outcome.state.is_valid(), "{}", outcome.state);
    assert!(outcome.new_block);
    assert_eq!(hashes(&outcome.update.connected), vec![block.hash()]);
    assert_eq!(fx.state.tip_height(), 1);
    assert!(!fx.state.coins().have_coin(&genesis_coin).expect("coin lookup"));
    let created = fx
        .state
        .coins()
        .coin(&OutPoint::new(tx.txid(), 0))
        .expect("coin lookup")
        .expect("new coin");
    assert_eq!(created.value, 50 * COIN - 1_000);
    assert_eq!(created.height, 1);

    let again = fx.submit(&block);
    assert!(again.state.is_valid());
    assert!(!again.new_block);
    assert!(again.update.is_empty());
}

#[test]
fn coinbase_may_only_claim_fees() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let greedy = seal(
        genesis.hash(),
        GENESIS_TIME + 60,
        vec![coinbase(1, 9, 1)],
        XField::None,
        &fx.signer,
    );
    let outcome = fx.submit(&greedy);
    assert!(outcome.state.is_valid());
    assert_eq!(outcome.update.invalid.len(), 1);
    assert_eq!(outcome.update.invalid[0].1.reason, "bad-cb-amount");
    assert_eq!(fx.state.tip_height(), 0);
    let id = fx.state.index().lookup(&greedy.hash()).expect("indexed");
    assert!(fx.state.index().get(id).is_failed());

    let honest = fx.child(&genesis, 1, Vec::new());
    assert!(fx.submit(&honest).state.is_valid());
    assert_eq!(fx.tip_hash(), honest.hash());
}

#[test]
fn equal_height_fork_keeps_the_first_seen_tip_until_outgrown() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let a1 = fx.child(&genesis, 1, Vec::new());
    let b1 = fx.child(&genesis, 2, Vec::new());
    fx.submit(&a1);
    let outcome = fx.submit(&b1);
    assert!(outcome.state.is_valid());
    assert!(outcome.update.is_empty());
    assert_eq!(fx.tip_hash(), a1.hash());

    let b2 = fx.child(&b1, 3, Vec::new());
    let outcome = fx.submit(&b2);
    assert_eq!(hashes(&outcome.update.disconnected), vec![a1.hash()]);
    assert_eq!(hashes(&outcome.update.connected), vec![b1.hash(), b2.hash()]);
    assert_eq!(fx.tip_hash(), b2.hash());
    assert!(!fx.state.is_on_active_chain(&a1.hash()));
    assert_eq!(fx.state.best_candidate().expect("candidate").hash, b2.hash());
}

#[test]
fn reorg_restores_coins_spent_on_the_abandoned_branch() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let genesis_coin = fx.genesis_coin();
    let tx = spend(&fx.wallet, genesis_coin, 49 * COIN);
    let a1 = fx.child(&genesis, 1, vec![tx.clone()]);
    fx.submit(&a1);
    assert!(!fx.state.coins().have_coin(&genesis_coin).expect("lookup"));

    let b1 = fx.child(&genesis, 2, Vec::new());
    fx.submit(&b1);
    let b2 = fx.child(&b1, 3, Vec::new());
    fx.submit(&b2);
    assert_eq!(fx.tip_hash(), b2.hash());
    assert!(fx.state.coins().have_coin(&genesis_coin).expect("lookup"));
    assert!(!fx
        .state
        .coins()
        .have_coin(&OutPoint::new(tx.txid(), 0))
        .expect("lookup"));
    assert_eq!(fx.state.coins().best_block().expect("best"), b2.hash());
}

#[test]
fn double_spend_inside_a_block_is_invalid() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let coin = fx.genesis_coin();
    let first = spend(&fx.wallet, coin, 10 * COIN);
    let second = spend(&fx.wallet, coin, 20 * COIN);
    let block = fx.child(&genesis, 1, vec![first, second]);
    let outcome = fx.submit(&block);
    assert_eq!(outcome.update.invalid.len(), 1);
    assert_eq!(
        outcome.update.invalid[0].1.reason,
        "bad-txns-inputs-missingorspent"
    );
    assert_eq!(fx.state.tip_height(), 0);
}

#[test]
fn aggregate_key_rotation_applies_from_the_next_block() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let next_signer = key(0x33);
    let rotate = fx.child_signed(
        &genesis,
        1,
        Vec::new(),
        XField::AggregatePubkey(next_signer.public.clone()),
        &fx.signer,
    );
    assert!(fx.submit(&rotate).state.is_valid());
    assert_eq!(fx.tip_hash(), rotate.hash());

    let stale = fx.child_signed(&rotate, 2, Vec::new(), XField::None, &fx.signer);
    let outcome = fx.submit(&stale);
    assert_eq!(outcome.state.reject_reason(), "bad-proof");
    assert!(fx.state.index().lookup(&stale.hash()).is_none());

    let fresh = fx.child_signed(&rotate, 3, Vec::new(), XField::None, &next_signer);
    assert!(fx.submit(&fresh).state.is_valid());
    assert_eq!(fx.tip_hash(), fresh.hash());
    assert_eq!(
        fx.state.xfields().latest_aggregate_pubkey(2).expect("key"),
        next_signer.public
    );

    fx.state.invalidate_block(&rotate.hash()).expect("invalidate");
    assert_eq!(fx.state.tip_height(), 0);
    assert_eq!(
        fx.state.xfields().latest_aggregate_pubkey(2).expect("key"),
        fx.signer.public
    );
    let sibling = fx.child(&genesis, 4, Vec::new());
    assert!(fx.submit(&sibling).state.is_valid());
    assert_eq!(fx.tip_hash(), sibling.hash());
}

#[test]
fn headers_on_a_side_branch_use_the_branch_key() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let main1 = fx.child(&genesis, 1, Vec::new());
    let main2 = fx.child(&main1, 2, Vec::new());
    fx.submit(&main1);
    fx.submit(&main2);

    let branch_signer = key(0x44);
    let side1 = fx.child_signed(
        &genesis,
        3,
        Vec::new(),
        XField::AggregatePubkey(branch_signer.public.clone()),
        &fx.signer,
    );
    fx.submit(&side1);
    let side2 = fx.child_signed(&side1, 4, Vec::new(), XField::None, &branch_signer);
    let state = fx
        .state
        .process_new_block_headers(&[side2.header.clone()], NOW)
        .expect("headers");
    assert!(state.is_valid(), "{state}");
    assert_eq!(fx.tip_hash(), main2.hash());

    let side3 = fx.child_signed(&side2, 5, Vec::new(), XField::None, &branch_signer);
    fx.submit(&side2);
    let outcome = fx.submit(&side3);
    assert_eq!(outcome.update.connected.len(), 3);
    assert_eq!(fx.tip_hash(), side3.hash());
}

#[test]
fn header_context_rules() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let mut orphan = fx.child(&genesis, 1, Vec::new());
    orphan.header.prev_block = [0xee; 32];
    resign(&mut orphan.header, &fx.signer);
    let state = fx
        .state
        .process_new_block_headers(&[orphan.header.clone()], NOW)
        .expect("headers");
    assert_eq!(state.reject_reason(), "prev-blk-not-found");

    let mut old = fx.child(&genesis, 1, Vec::new());
    old.header.time = GENESIS_TIME;
    resign(&mut old.header, &fx.signer);
    assert_eq!(fx.submit(&old).state.reject_reason(), "time-too-old");

    let mut future = fx.child(&genesis, 1, Vec::new());
    future.header.time = (NOW + 3 * 60 * 60) as u32;
    resign(&mut future.header, &fx.signer);
    assert_eq!(fx.submit(&future).state.reject_reason(), "time-too-new");

    let mut unsigned = fx.child(&genesis, 1, Vec::new());
    unsigned.header.proof.clear();
    assert_eq!(fx.submit(&unsigned).state.reject_reason(), "bad-proof-missing");
}

#[test]
fn tampered_body_is_not_cached_as_invalid() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let good = fx.child(&genesis, 1, Vec::new());
    let mut tampered = good.clone();
    tampered.transactions[0].vout[0].value = 5;
    let outcome = fx.submit(&tampered);
    assert_eq!(outcome.state.reject_reason(), "bad-txnmrklroot");
    let id = fx.state.index().lookup(&good.hash()).expect("header indexed");
    assert!(!fx.state.index().get(id).is_failed());

    assert!(fx.submit(&good).state.is_valid());
    assert_eq!(fx.tip_hash(), good.hash());
}

#[test]
fn invalidate_then_reconsider_restores_the_tip() {
    let mut fx = fixture();
    let genesis = fx.genesis.clone();
    let b1 = fx.child(&genesis, 1, Vec::new());
    fx.submit(&b1);
    let b2 = fx.child(&b1, 2, Vec::new());
    fx.submit(&b2);

    let update = fx.state.invalidate_block(&b1.hash()).expect("invalidate");
    assert_eq!(hashes(&update.disconnected), vec![b2.hash(), b1.hash()]);
    assert_eq!(fx.state.tip_height(), 0);
    let child = fx.state.index().lookup(&b2.hash()).expect("indexed");
    assert!(fx.state.index().get(child).is_failed());
    assert_eq!(
        fx.submit(&b2).state.reject_reason(),
        "duplicate",
        "failed blocks are not reprocessed"
    );

    let update = fx.state.reconsider_block(&b1.hash()).expect("reconsider");
    assert_eq!(hashes(&update.connected), vec![b1.hash(), b2.hash()]);
    assert_eq!(fx.tip_hash(), b2.hash());
}

#[test]
fn reload_from_storage_keeps_tip_coins_and_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let magic = consensus_params(Network::Dev).message_start();
    let (tip, spent_into) = {
        let blocks = FlatBlockStorage::open(dir.path(), magic).expect("open");
        let mut fx = Fixture::with_storage(Arc::clone(&store), blocks);
        let genesis = fx.genesis.clone();
        let tx = spend(&fx.wallet, fx.genesis_coin(), 30 * COIN);
        let b1 = fx.child(&genesis, 1, vec![tx.clone()]);
        fx.submit(&b1);
        let b2 = fx.child(&b1, 2, Vec::new());
        fx.submit(&b2);
        (b2.hash(), OutPoint::new(tx.txid(), 0))
    };

    let blocks = FlatBlockStorage::open(dir.path(), magic).expect("reopen");
    let fx = Fixture::with_storage(store, blocks);
    assert_eq!(fx.tip_hash(), tip);
    assert_eq!(fx.state.tip_height(), 2);
    assert!(fx.state.coins().have_coin(&spent_into).expect("lookup"));
    assert!(fx.state.xfields().latest_aggregate_pubkey(3).is_ok());
    let loaded = fx.state.index().lookup(&tip).expect("indexed");
    assert_eq!(fx.state.index().get(loaded).sequence_id, 0);
    assert_eq!(fx.state.index().get(loaded).chain_tx, 4);
    fx.state.read_block(&tip).expect("block readable");
}

#[test]
fn reload_keeps_the_first_seen_tip_over_a_stored_sibling() {
    let magic = consensus_params(Network::Dev).message_start();
    for salt in (1u8..13).step_by(2) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let (a1, b1) = {
            let blocks = FlatBlockStorage::open(dir.path(), magic).expect("open");
            let mut fx = Fixture::with_storage(Arc::clone(&store), blocks);
            let genesis = fx.genesis.clone();
            let a1 = fx.child(&genesis, salt, Vec::new());
            let b1 = fx.child(&genesis, salt + 1, Vec::new());
            fx.submit(&a1);
            fx.submit(&b1);
            assert_eq!(fx.tip_hash(), a1.hash());
            (a1, b1)
        };

        let blocks = FlatBlockStorage::open(dir.path(), magic).expect("reopen");
        let mut fx = Fixture::with_storage(store, blocks);
        assert_eq!(fx.tip_hash(), a1.hash());
        let sibling = fx.state.index().lookup(&b1.hash()).expect("indexed");
        assert_eq!(fx.state.index().get(sibling).sequence_id, 1);

        for block in [&a1, &b1] {
            let outcome = fx.submit(block);
            assert!(outcome.state.is_valid(), "{}", outcome.state);
            assert!(outcome.update.disconnected.is_empty());
            assert_eq!(fx.tip_hash(), a1.hash());
        }

        let b2 = fx.child(&b1, salt + 2, Vec::new());
        let outcome = fx.submit(&b2);
        assert_eq!(hashes(&outcome.update.disconnected), vec![a1.hash()]);
        assert_eq!(fx.tip_hash(), b2.hash());
    }
}

#[test]
fn failed_connect_write_leaves_no_partial_state() {
    let store = Arc::new(FailingStore::default());
    let mut fx = Fixture::with_storage(Arc::clone(&store), MemoryBlockStorage::new());
    let genesis = fx.genesis.clone();
    let genesis_coin = fx.genesis_coin();
    let next_signer = key(0x44);
    let tx = spend(&fx.wallet, genesis_coin, 50 * COIN - 1_000);
    let rotate = fx.child_signed(
        &genesis,
        1,
        vec![tx],
        XField::AggregatePubkey(next_signer.public.clone()),
        &fx.signer,
    );

    store.armed.store(true, Ordering::SeqCst);
    assert!(fx.state.process_new_block(&rotate, NOW).is_err());
    assert_eq!(fx.state.tip_height(), 0);
    let id = fx.state.index().lookup(&rotate.hash()).expect("indexed");
    let entry = fx.state.index().get(id);
    assert!(entry.undo_pos.is_none());
    assert!(!entry.have_undo());
    assert!(!entry.is_valid(BLOCK_VALID_SCRIPTS));
    assert_eq!(
        fx.state
            .xfields()
            .records(XFieldKind::AggregatePubkey)
            .expect("records")
            .len(),
        1
    );
    assert_eq!(
        fx.state.xfields().latest_aggregate_pubkey(2).expect("key"),
        fx.signer.public
    );
    assert!(fx.state.coins().have_coin(&genesis_coin).expect("lookup"));

    store.armed.store(false, Ordering::SeqCst);
    let update = fx.state.activate_best_chain().expect("retry");
    assert_eq!(hashes(&update.connected), vec![rotate.hash()]);
    assert_eq!(fx.tip_hash(), rotate.hash());
    assert!(fx.state.index().get(id).have_undo());
    assert_eq!(
        fx.state.xfields().latest_aggregate_pubkey(2).expect("key"),
        next_signer.public
    );
    assert!(!fx.state.coins().have_coin(&genesis_coin).expect("lookup"));
}
