#![allow(dead_code)]

use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use tapd::node::{MempoolAcceptResult, Node, ProcessedBlock};
use tapd::policy::MempoolPolicy;
use tapd_chainstate::flatfiles::MemoryBlockStorage;
use tapd_chainstate::script_check::ScriptExecutionCache;
use tapd_chainstate::state::ChainState;
use tapd_chainstate::xfield::XFieldHistory;
use tapd_consensus::constants::TAPYRUS_BLOCK_VERSION;
use tapd_consensus::money::{Amount, COIN};
use tapd_consensus::{consensus_params, Hash256, Network};
use tapd_primitives::block::{Block, BlockHeader, XField};
use tapd_primitives::color::{colored_script, ColorIdentifier};
use tapd_primitives::hash::hash160;
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::{Transaction, TxIn, TxOut};
use tapd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use tapd_script::standard::{p2pkh_script, push_data};
use tapd_storage::memory::MemoryStore;

pub const GENESIS_TIME: u32 = 1_600_000_000;
pub const NOW: u64 = 1_700_000_000;
pub const GENESIS_OUTPUTS: u32 = 8;
pub const GENESIS_VALUE: Amount = 5 * COIN;
pub const FEE: Amount = 10_000;

pub struct Key {
    pub secret: SecretKey,
    pub public: Vec<u8>,
}

pub fn key(seed: u8) -> Key {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("secret");
    let public = PublicKey::from_secret_key(&secp, &secret)
        .serialize()
        .to_vec();
    Key { secret, public }
}

pub fn coinbase(height: u32, salt: u8) -> Transaction {
    Transaction {
        features: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0u8; 32], height),
            script_sig: vec![0x01, salt],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 0,
            script_pubkey: vec![0x6a, 0x01, salt],
        }],
        lock_time: 0,
    }
}

pub fn seal(
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
    let secp = Secp256k1::new();
    let digest = Message::from_digest(block.header.signable_hash());
    block.header.proof = secp
        .sign_ecdsa(&digest, &signer.secret)
        .serialize_der()
        .to_vec();
    block
}

pub struct Harness {
    pub node: Node<MemoryStore, MemoryBlockStorage>,
    pub signer: Key,
    pub wallet: Key,
    pub genesis: Block,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(MempoolPolicy::standard(Network::Prod))
    }

    pub fn with_policy(policy: MempoolPolicy) -> Self {
        let signer = key(0x11);
        let wallet = key(0x22);
        let distribution = Transaction {
            features: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([0u8; 32], 0),
                script_sig: vec![0x01, 0x00],
                sequence: u32::MAX,
            }],
            vout: (0..GENESIS_OUTPUTS)
                .map(|_| TxOut {
                    value: GENESIS_VALUE,
                    script_pubkey: p2pkh_script(&hash160(&wallet.public)),
                })
                .collect(),
            lock_time: 0,
        };
        let genesis = seal(
            [0u8; 32],
            GENESIS_TIME,
            vec![distribution],
            XField::AggregatePubkey(signer.public.clone()),
            &signer,
        );
        let mut chain = ChainState::new(
            consensus_params(Network::Dev),
            Arc::new(MemoryStore::new()),
            MemoryBlockStorage::new(),
            Arc::new(XFieldHistory::new()),
            Arc::new(ScriptExecutionCache::new(4096)),
        );
        chain.init_genesis(&genesis).expect("genesis");
        let node = Node::new(chain, policy);
        node.set_mock_time(NOW);
        Self {
            node,
            signer,
            wallet,
            genesis,
        }
    }

    pub fn genesis_coin(&self, index: u32) -> OutPoint {
        OutPoint::new(self.genesis.transactions[0].txid(), index)
    }

    /// Spends wallet-owned p2pkh coins into wallet-owned outputs.
    pub fn pay(&self, inputs: &[OutPoint], outputs: &[Amount], sequence: u32) -> Transaction {
        let script_pubkey = p2pkh_script(&hash160(&self.wallet.public));
        let mut tx = Transaction {
            features: 1,
            vin: inputs
                .iter()
                .map(|prevout| TxIn {
                    prevout: *prevout,
                    script_sig: Vec::new(),
                    sequence,
                })
                .collect(),
            vout: outputs
                .iter()
                .map(|value| TxOut {
                    value: *value,
                    script_pubkey: script_pubkey.clone(),
                })
                .collect(),
            lock_time: 0,
        };
        self.sign(&mut tx);
        tx
    }

    pub fn wallet_script(&self) -> Vec<u8> {
        p2pkh_script(&hash160(&self.wallet.public))
    }

    pub fn sign(&self, tx: &mut Transaction) {
        let spent = vec![self.wallet_script(); tx.vin.len()];
        self.sign_spending(tx, &spent);
    }

    /// Signs every input against the locking script it spends.
    pub fn sign_spending(&self, tx: &mut Transaction, spent: &[Vec<u8>]) {
        let secp = Secp256k1::new();
        let mut script_sigs = Vec::with_capacity(tx.vin.len());
        for (index, script_pubkey) in spent.iter().enumerate().take(tx.vin.len()) {
            let digest =
                signature_hash(tx, index, script_pubkey, SighashType(SIGHASH_ALL), None)
                    .expect("sighash");
            let mut sig = secp
                .sign_ecdsa(&Message::from_digest(digest), &self.wallet.secret)
                .serialize_der()
                .to_vec();
            sig.push(SIGHASH_ALL as u8);
            let mut script_sig = Vec::new();
            push_data(&mut script_sig, &sig);
            push_data(&mut script_sig, &self.wallet.public);
            script_sigs.push(script_sig);
        }
        for (input, script_sig) in tx.vin.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
    }

    /// Spends wallet coins, colored or not, into wallet outputs of the given
    /// colors. `inputs` pairs each outpoint with the color it carries.
    pub fn pay_colored(
        &self,
        inputs: &[(OutPoint, ColorIdentifier)],
        outputs: &[(ColorIdentifier, Amount)],
    ) -> Transaction {
        let base = self.wallet_script();
        let mut tx = Transaction {
            features: 1,
            vin: inputs
                .iter()
                .map(|(prevout, _)| TxIn {
                    prevout: *prevout,
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                })
                .collect(),
            vout: outputs
                .iter()
                .map(|(color, value)| TxOut {
                    value: *value,
                    script_pubkey: colored_script(color, &base),
                })
                .collect(),
            lock_time: 0,
        };
        let spent: Vec<Vec<u8>> = inputs
            .iter()
            .map(|(_, color)| colored_script(color, &base))
            .collect();
        self.sign_spending(&mut tx, &spent);
        tx
    }

    /// Spends one genesis coin to a single output, paying `fee`.
    pub fn spend_genesis(&self, index: u32, fee: Amount, sequence: u32) -> Transaction {
        self.pay(&[self.genesis_coin(index)], &[GENESIS_VALUE - fee], sequence)
    }

    pub fn block(&self, parent: &Block, height: u32, salt: u8, txs: Vec<Transaction>) -> Block {
        let mut transactions = vec![coinbase(height, salt)];
        transactions.extend(txs);
        seal(
            parent.hash(),
            parent.header.time + 60 + u32::from(salt),
            transactions,
            XField::None,
            &self.signer,
        )
    }

    pub fn submit_block(&self, block: &Block) -> ProcessedBlock {
        self.node.process_new_block(block).expect("process block")
    }

    pub fn accept(&self, tx: &Transaction) -> MempoolAcceptResult {
        self.node
            .accept_to_mempool(tx, Default::default())
            .expect("accept")
    }

    pub fn in_pool(&self, tx: &Transaction) -> bool {
        self.node.mempool_contains(&tx.txid()).expect("mempool")
    }
}

pub fn reason(result: &MempoolAcceptResult) -> &str {
    result.state.reject_reason()
}
