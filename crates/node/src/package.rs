//! Ordered groups of related transactions submitted together.

use std::collections::{HashMap, HashSet};

use tapd_chainstate::coins::Coin;
use tapd_chainstate::flatfiles::BlockStorage;
use tapd_chainstate::state::ChainState;
use tapd_chainstate::validation::{RejectCode, Rejection, ValidationState};
use tapd_consensus::money::Amount;
use tapd_consensus::Hash256;
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::Transaction;
use tapd_storage::KeyValueStore;

use crate::admission::{accept_to_memory_pool, AcceptOptions};
use crate::mempool::{Mempool, MEMPOOL_HEIGHT};
use crate::policy::MempoolPolicy;

pub const MAX_PACKAGE_COUNT: usize = 25;
pub const MAX_PACKAGE_SIZE: usize = 101_000;

#[derive(Clone, Debug)]
pub struct PackageMemberResult {
    pub txid: Hash256,
    pub state: ValidationState,
    pub fee: Option<Amount>,
}

#[derive(Clone, Debug)]
pub struct PackageResult {
    /// Outcome of the package-wide checks. Member outcomes are in `members`.
    pub package_state: ValidationState,
    pub members: Vec<PackageMemberResult>,
    /// Every member was accepted by this call.
    pub success: bool,
}

impl PackageResult {
    pub fn state_of(&self, txid: &Hash256) -> Option<&ValidationState> {
        self.members
            .iter()
            .find(|member| &member.txid == txid)
            .map(|member| &member.state)
    }
}

/// Context-free package rules: bounded count and size, distinct members,
/// parents before children and no two members spending the same outpoint.
pub fn check_package(txs: &[Transaction]) -> Result<(), Rejection> {
    if txs.len() > MAX_PACKAGE_COUNT {
        return Err(package_rejection("package-too-many-transactions"));
    }
    let total_size: usize = txs.iter().map(Transaction::total_size).sum();
    if txs.len() > 1 && total_size > MAX_PACKAGE_SIZE {
        return Err(package_rejection("package-too-large"));
    }

    let mut positions = HashMap::with_capacity(txs.len());
    for (position, tx) in txs.iter().enumerate() {
        if positions.insert(tx.txid(), position).is_some() {
            return Err(package_rejection("package-contains-duplicates"));
        }
    }

    let mut spent = HashSet::new();
    for (position, tx) in txs.iter().enumerate() {
        for input in &tx.vin {
            if positions
                .get(&input.prevout.hash)
                .is_some_and(|parent| *parent >= position)
            {
                return Err(package_rejection("package-not-sorted"));
            }
            if !spent.insert(input.prevout) {
                return Err(package_rejection("conflict-in-package"));
            }
        }
    }
    Ok(())
}

fn package_rejection(reason: &'static str) -> Rejection {
    Rejection::policy(RejectCode::Invalid, reason)
}

/// Validates the members in order. With `test_accept` nothing enters the
/// pool; outputs of members that passed are visible to later members.
pub fn submit_package<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    pool: &mut Mempool,
    policy: &MempoolPolicy,
    txs: &[Transaction],
    test_accept: bool,
    now: u64,
) -> PackageResult {
    if let Err(rejection) = check_package(txs) {
        return PackageResult {
            package_state: ValidationState::Invalid(rejection),
            members: Vec::new(),
            success: false,
        };
    }

    let options = AcceptOptions {
        test_accept,
        ..AcceptOptions::default()
    };
    let mut overlay: HashMap<OutPoint, Coin> = HashMap::new();
    let mut members = Vec::with_capacity(txs.len());
    let mut success = true;
    for tx in txs {
        let txid = tx.txid();
        if pool.contains(&txid) {
            success = false;
            members.push(PackageMemberResult {
                txid,
                state: ValidationState::Invalid(Rejection::policy(
                    RejectCode::Duplicate,
                    "txn-already-in-mempool",
                )),
                fee: None,
            });
            continue;
        }
        let package = if test_accept { Some(&overlay) } else { None };
        match accept_to_memory_pool(chain, pool, policy, tx, &options, package, now) {
            Ok(accepted) => {
                if test_accept {
                    for (index, output) in tx.vout.iter().enumerate() {
                        overlay.insert(
                            OutPoint::new(txid, index as u32),
                            Coin::new(
                                output.value,
                                output.script_pubkey.clone(),
                                MEMPOOL_HEIGHT,
                                false,
                            ),
                        );
                    }
                }
                members.push(PackageMemberResult {
                    txid,
                    state: ValidationState::Valid,
                    fee: Some(accepted.fee),
                });
            }
            Err(failure) => {
                success = false;
                members.push(PackageMemberResult {
                    txid,
                    state: failure.into(),
                    fee: None,
                });
            }
        }
    }
    PackageResult {
        package_state: ValidationState::Valid,
        members,
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapd_primitives::transaction::{TxIn, TxOut};

    fn tx(inputs: &[(Hash256, u32)], salt: u8) -> Transaction {
        Transaction {
            features: 1,
            vin: inputs
                .iter()
                .map(|(hash, index)| TxIn {
                    prevout: OutPoint::new(*hash, *index),
                    script_sig: vec![0x51],
                    sequence: u32::MAX,
                })
                .collect(),
            vout: vec![TxOut {
                value: 1_000,
                script_pubkey: vec![0x76, 0xa9, 0x14, salt],
            }],
            lock_time: 0,
        }
    }

    fn reason(result: Result<(), Rejection>) -> String {
        result.expect_err("package rejected").reason
    }

    #[test]
    fn parents_must_precede_children() {
        let parent = tx(&[([1u8; 32], 0)], 1);
        let child = tx(&[(parent.txid(), 0)], 2);
        check_package(&[parent.clone(), child.clone()]).expect("sorted package");
        assert_eq!(reason(check_package(&[child, parent])), "package-not-sorted");
    }

    #[test]
    fn duplicates_and_internal_conflicts() {
        let a = tx(&[([1u8; 32], 0)], 1);
        assert_eq!(
            reason(check_package(&[a.clone(), a.clone()])),
            "package-contains-duplicates"
        );
        let b = tx(&[([1u8; 32], 0)], 2);
        assert_eq!(reason(check_package(&[a, b])), "conflict-in-package");
    }

    #[test]
    fn member_count_is_bounded() {
        let txs: Vec<_> = (0..=MAX_PACKAGE_COUNT as u8)
            .map(|salt| tx(&[([salt; 32], 0)], salt))
            .collect();
        assert_eq!(
            reason(check_package(&txs)),
            "package-too-many-transactions"
        );
        check_package(&txs[..MAX_PACKAGE_COUNT]).expect("full package");
    }
}
