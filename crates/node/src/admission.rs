//! Admission of a single transaction into the mempool.
//!
//! Checks run cheapest first and stop at the first failure. Nothing in the
//! pool changes until every check has passed.

use std::collections::{BTreeSet, HashMap, HashSet};

use tapd_chainstate::coins::{Coin, CoinView};
use tapd_chainstate::colored::{check_colored_outputs, verify_balances};
use tapd_chainstate::flatfiles::BlockStorage;
use tapd_chainstate::script_check::{check_inputs_with_coins, ColorAmounts};
use tapd_chainstate::state::ChainState;
use tapd_chainstate::validation::{
    calculate_sequence_locks, check_transaction, check_tx_inputs, collect_coins,
    evaluate_sequence_locks, is_final_tx, legacy_sigop_count, p2sh_sigop_count, RejectCode,
    Rejection, SequenceLocks, ValidationFailure,
};
use tapd_consensus::constants::{
    LOCKTIME_MEDIAN_TIME_PAST, MAX_REPLACEABLE_SEQUENCE, MIN_TRANSACTION_SIZE,
};
use tapd_consensus::money::Amount;
use tapd_consensus::Hash256;
use tapd_log::Category;
use tapd_primitives::hash::hash_to_hex;
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::Transaction;
use tapd_script::interpreter::STANDARD_SCRIPT_VERIFY_FLAGS;
use tapd_storage::KeyValueStore;

use crate::mempool::{
    AncestorLimits, LockPoints, Mempool, MempoolCoinView, MempoolEntry, RemovalReason,
    MAX_REPLACEMENT_CANDIDATES, MEMPOOL_HEIGHT,
};
use crate::policy::{FeeRate, MempoolPolicy, MAX_STANDARD_TX_SIGOPS, MIN_STANDARD_TX_SIZE};

#[derive(Clone, Debug, Default)]
pub struct AcceptOptions {
    /// Skip the fee floors, the absurd fee guard and size trimming. Used for
    /// transactions returning from disconnected blocks.
    pub bypass_limits: bool,
    /// Run every check but leave the pool untouched.
    pub test_accept: bool,
    /// Overrides the configured absurd fee ceiling; zero disables it.
    pub max_fee: Option<Amount>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Accepted {
    pub txid: Hash256,
    pub fee: Amount,
    pub size: usize,
    /// Entries evicted because this transaction replaced them.
    pub replaced: Vec<Hash256>,
    /// Entries evicted by expiry or the size limit after insertion.
    pub evicted: Vec<Hash256>,
}

/// State carried from the policy checks into script checks and insertion.
struct Workspace {
    txid: Hash256,
    size: usize,
    coins: Vec<Coin>,
    fee: Amount,
    sigops: u32,
    spends_coinbase: bool,
    lock_points: LockPoints,
    all_conflicting: HashSet<Hash256>,
}

/// Runs the full admission pipeline for `tx`. `package` supplies outputs of
/// earlier members of a package dry run that are not in the pool.
pub fn accept_to_memory_pool<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    pool: &mut Mempool,
    policy: &MempoolPolicy,
    tx: &Transaction,
    options: &AcceptOptions,
    package: Option<&HashMap<OutPoint, Coin>>,
    now: u64,
) -> Result<Accepted, ValidationFailure> {
    let workspace = pre_checks(chain, pool, policy, tx, options, package, now)?;
    let input_sums = script_checks(chain, tx, &workspace, options)?;
    verify_balances(tx, &input_sums, policy.min_relay_fee.fee_for(workspace.size))?;
    if options.test_accept {
        let mut replaced: Vec<_> = workspace.all_conflicting.into_iter().collect();
        replaced.sort();
        return Ok(Accepted {
            txid: workspace.txid,
            fee: workspace.fee,
            size: workspace.size,
            replaced,
            evicted: Vec::new(),
        });
    }
    finalize(chain, pool, policy, tx, workspace, options, now)
}

fn pre_checks<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    pool: &mut Mempool,
    policy: &MempoolPolicy,
    tx: &Transaction,
    options: &AcceptOptions,
    package: Option<&HashMap<OutPoint, Coin>>,
    now: u64,
) -> Result<Workspace, ValidationFailure> {
    let txid = tx.txid();
    let size = tx.total_size();

    check_transaction(tx)?;
    if size < MIN_TRANSACTION_SIZE {
        return Err(Rejection::structural("bad-txns-undersize").into());
    }
    if tx.is_coinbase() {
        return Err(Rejection::consensus(100, RejectCode::Invalid, "coinbase").into());
    }
    if policy.require_standard {
        policy.check_standard_tx(tx)?;
    }
    if size < MIN_STANDARD_TX_SIZE {
        return Err(Rejection::policy(RejectCode::NonStandard, "tx-size-small").into());
    }

    let next_height = chain.tip_height() + 1;
    let tip_median_time = chain.tip_median_time_past();
    let lock_time_cutoff = if policy.locktime_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 {
        tip_median_time
    } else {
        i64::try_from(now).unwrap_or(i64::MAX)
    };
    if !is_final_tx(tx, next_height, lock_time_cutoff) {
        return Err(Rejection::policy(RejectCode::NonStandard, "non-final").into());
    }
    if pool.contains(&txid) {
        return Err(Rejection::policy(RejectCode::AlreadyKnown, "txn-already-in-mempool").into());
    }

    let conflicts = find_conflicts(pool, policy, tx)?;

    let coins = {
        let view = MempoolCoinView::new(chain.coins(), pool, package);
        match collect_coins(tx, &view)? {
            Ok(coins) => coins,
            Err(missing) => {
                for index in 0..tx.vout.len() {
                    if chain.coins().have_coin(&OutPoint::new(txid, index as u32))? {
                        return Err(
                            Rejection::policy(RejectCode::AlreadyKnown, "txn-already-known").into()
                        );
                    }
                }
                return Err(ValidationFailure::MissingInputs(missing));
            }
        }
    };

    check_colored_outputs(tx, &coins)?;

    let (locks, lock_points) = sequence_lock_points(chain, tx, &coins, policy.locktime_flags);
    if !evaluate_sequence_locks(next_height, tip_median_time, locks) {
        return Err(Rejection::policy(RejectCode::NonStandard, "non-BIP68-final").into());
    }

    let fee = check_tx_inputs(tx, &coins, next_height)?;

    let sigops = legacy_sigop_count(tx).saturating_add(p2sh_sigop_count(tx, &coins));
    if sigops > MAX_STANDARD_TX_SIGOPS {
        return Err(Rejection::policy(RejectCode::NonStandard, "bad-txns-too-many-sigops")
            .with_debug(format!("{sigops}"))
            .into());
    }
    if policy.require_standard {
        policy.check_standard_inputs(tx, &coins)?;
    }

    let modified_fee = fee.saturating_add(pool.fee_delta(&txid));
    if !options.bypass_limits {
        let pool_min = pool.min_fee(now, policy.max_bytes).fee_for(size);
        if modified_fee < pool_min {
            return Err(Rejection::resource(RejectCode::InsufficientFee, "mempool min fee not met")
                .with_debug(format!("{modified_fee} < {pool_min}"))
                .into());
        }
        let relay_min = policy.min_relay_fee.fee_for(size);
        if modified_fee < relay_min {
            return Err(Rejection::policy(RejectCode::InsufficientFee, "min relay fee not met")
                .with_debug(format!("{modified_fee} < {relay_min}"))
                .into());
        }
        let max_fee = options.max_fee.unwrap_or(policy.max_tx_fee);
        if max_fee > 0 && fee > max_fee {
            return Err(Rejection::policy(RejectCode::HighFee, "absurdly-high-fee")
                .with_debug(format!("{fee} > {max_fee}"))
                .into());
        }
    }

    let limits = AncestorLimits {
        ancestor_count: policy.ancestor_count,
        ancestor_size: policy.ancestor_size,
        descendant_count: policy.descendant_count,
        descendant_size: policy.descendant_size,
    };
    let ancestors = pool
        .calculate_ancestors(&pool.in_pool_parents(tx), size, &limits)
        .map_err(|reason| {
            Rejection::resource(RejectCode::NonStandard, "too-long-mempool-chain").with_debug(reason)
        })?;
    if let Some(spent_conflict) = ancestors.iter().find(|ancestor| conflicts.contains(*ancestor)) {
        return Err(Rejection::consensus(10, RejectCode::Invalid, "bad-txns-spends-conflicting-tx")
            .with_debug(format!("spends conflicting transaction {}", hash_to_hex(spent_conflict)))
            .into());
    }

    let all_conflicting = if conflicts.is_empty() {
        HashSet::new()
    } else {
        check_replacement(pool, policy, tx, &conflicts, modified_fee, size)?
    };

    Ok(Workspace {
        txid,
        size,
        spends_coinbase: coins.iter().any(|coin| coin.is_coinbase),
        coins,
        fee,
        sigops,
        lock_points,
        all_conflicting,
    })
}

/// In-pool transactions spending the same outpoints as `tx`. Fails when any
/// of them may not be replaced.
fn find_conflicts(
    pool: &Mempool,
    policy: &MempoolPolicy,
    tx: &Transaction,
) -> Result<BTreeSet<Hash256>, Rejection> {
    let mut conflicts = BTreeSet::new();
    for input in &tx.vin {
        let Some(spender) = pool.spender(&input.prevout) else {
            continue;
        };
        if conflicts.contains(&spender) {
            continue;
        }
        let signals = pool.get(&spender).is_some_and(|entry| {
            entry
                .tx
                .vin
                .iter()
                .any(|input| input.sequence <= MAX_REPLACEABLE_SEQUENCE)
        });
        if !policy.replacement_enabled || !signals {
            return Err(Rejection::policy(RejectCode::Conflict, "txn-mempool-conflict").with_debug(
                format!("input {} already spent by {}", input.prevout, hash_to_hex(&spender)),
            ));
        }
        conflicts.insert(spender);
    }
    Ok(conflicts)
}

/// Replacement economics. Returns every entry the replacement evicts.
fn check_replacement(
    pool: &Mempool,
    policy: &MempoolPolicy,
    tx: &Transaction,
    conflicts: &BTreeSet<Hash256>,
    modified_fee: Amount,
    size: usize,
) -> Result<HashSet<Hash256>, Rejection> {
    let txid = tx.txid();
    let new_rate = FeeRate::from_fee(modified_fee, size);
    let mut conflict_parents = HashSet::new();
    let mut candidate_count = 0usize;
    for conflict in conflicts {
        let Some(entry) = pool.get(conflict) else {
            continue;
        };
        if new_rate <= entry.fee_rate() {
            return Err(insufficient_fee(format!(
                "rejecting replacement {}; new feerate {new_rate} <= old feerate {}",
                hash_to_hex(&txid),
                entry.fee_rate()
            )));
        }
        conflict_parents.extend(entry.tx.vin.iter().map(|input| input.prevout.hash));
        candidate_count += pool.descendant_stats(conflict).count;
    }
    if candidate_count > MAX_REPLACEMENT_CANDIDATES {
        return Err(Rejection::policy(RejectCode::NonStandard, "too many potential replacements")
            .with_debug(format!(
                "rejecting replacement {}; too many potential replacements ({candidate_count} > {MAX_REPLACEMENT_CANDIDATES})",
                hash_to_hex(&txid)
            )));
    }

    let mut all_conflicting = HashSet::new();
    for conflict in conflicts {
        all_conflicting.extend(pool.descendants(conflict));
    }

    for (index, input) in tx.vin.iter().enumerate() {
        if !conflict_parents.contains(&input.prevout.hash) && pool.contains(&input.prevout.hash) {
            return Err(Rejection::policy(RejectCode::NonStandard, "replacement-adds-unconfirmed")
                .with_debug(format!(
                    "replacement {} adds unconfirmed input, idx {index}",
                    hash_to_hex(&txid)
                )));
        }
    }

    let conflicting_fees: Amount = all_conflicting
        .iter()
        .filter_map(|txid| pool.get(txid))
        .map(MempoolEntry::modified_fee)
        .fold(0, Amount::saturating_add);
    if modified_fee < conflicting_fees {
        return Err(insufficient_fee(format!(
            "rejecting replacement {}, less fees than conflicting txs; {modified_fee} < {conflicting_fees}",
            hash_to_hex(&txid)
        )));
    }
    let additional = modified_fee - conflicting_fees;
    let relay_cost = policy.incremental_relay_fee.fee_for(size);
    if additional < relay_cost {
        return Err(insufficient_fee(format!(
            "rejecting replacement {}, not enough additional fees to relay; {additional} < {relay_cost}",
            hash_to_hex(&txid)
        )));
    }
    Ok(all_conflicting)
}

fn insufficient_fee(debug: String) -> Rejection {
    Rejection::policy(RejectCode::InsufficientFee, "insufficient fee").with_debug(debug)
}

/// Script checks under the relay flags, then again under the flags the next
/// block must satisfy. The second pass fills the execution cache for block
/// connection; a disagreement between the two passes is a bug.
fn script_checks<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    tx: &Transaction,
    workspace: &Workspace,
    options: &AcceptOptions,
) -> Result<ColorAmounts, ValidationFailure> {
    let cache = chain.script_cache().as_ref();
    let sums = check_inputs_with_coins(
        tx,
        &workspace.coins,
        STANDARD_SCRIPT_VERIFY_FLAGS,
        Some(cache),
        false,
    )?;
    match check_inputs_with_coins(
        tx,
        &workspace.coins,
        chain.block_script_flags(),
        Some(cache),
        !options.test_accept,
    ) {
        Ok(_) => Ok(sums),
        Err(ValidationFailure::Rejected(rejection)) => {
            let message = format!(
                "BUG! PLEASE REPORT THIS! {}: script checks passed under relay flags but failed under block flags: {rejection}",
                hash_to_hex(&workspace.txid)
            );
            tapd_log::log_error!(cat: Category::Mempool, "{message}");
            Err(ValidationFailure::Internal(message))
        }
        Err(other) => Err(other),
    }
}

fn finalize<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    pool: &mut Mempool,
    policy: &MempoolPolicy,
    tx: &Transaction,
    workspace: Workspace,
    options: &AcceptOptions,
    now: u64,
) -> Result<Accepted, ValidationFailure> {
    let mut replaced: Vec<Hash256> = workspace.all_conflicting.into_iter().collect();
    replaced.sort();
    for conflict in &replaced {
        if let Some(entry) = pool.remove(conflict, RemovalReason::Replaced) {
            tapd_log::log_debug!(
                cat: Category::Mempool,
                "replacing {} (fee {}) with {} (fee {})",
                hash_to_hex(conflict),
                entry.modified_fee(),
                hash_to_hex(&workspace.txid),
                workspace.fee
            );
        }
    }

    pool.add_unchecked(MempoolEntry::new(
        tx.clone(),
        workspace.fee,
        workspace.size,
        workspace.sigops,
        now,
        chain.tip_height(),
        workspace.spends_coinbase,
        workspace.lock_points,
    ));

    let mut evicted = Vec::new();
    if !options.bypass_limits {
        pool.expire(now.saturating_sub(policy.expiry_secs));
        evicted = pool.trim_to_size(policy.max_bytes);
        if !pool.contains(&workspace.txid) {
            return Err(Rejection::resource(RejectCode::InsufficientFee, "mempool full").into());
        }
    }
    Ok(Accepted {
        txid: workspace.txid,
        fee: workspace.fee,
        size: workspace.size,
        replaced,
        evicted,
    })
}

/// Sequence locks of `tx` for the next block, and the lock points recording
/// which block they depend on. Coins created in the pool count as confirmed
/// in the next block.
pub fn sequence_lock_points<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    tx: &Transaction,
    coins: &[Coin],
    flags: u32,
) -> (SequenceLocks, LockPoints) {
    let next_height = chain.tip_height() + 1;
    let mut prev_heights: Vec<i32> = coins
        .iter()
        .map(|coin| {
            if coin.height == MEMPOOL_HEIGHT {
                next_height
            } else {
                coin.height as i32
            }
        })
        .collect();
    let max_input_height = coins
        .iter()
        .filter(|coin| coin.height != MEMPOOL_HEIGHT)
        .map(|coin| coin.height as i32)
        .max()
        .unwrap_or(0);
    let locks = calculate_sequence_locks(tx, flags, &mut prev_heights, |height| {
        chain.median_time_past_at(height)
    });
    let max_input_block = chain
        .chain()
        .at(max_input_height)
        .map(|id| chain.index().get(id).hash);
    (
        locks,
        LockPoints {
            height: locks.min_height,
            time: locks.min_time,
            max_input_block,
        },
    )
}

/// Coins for `tx` from the chain and the pool, or `None` if any is missing.
pub fn lookup_coins<S: KeyValueStore, B: BlockStorage>(
    chain: &ChainState<S, B>,
    pool: &Mempool,
    tx: &Transaction,
) -> Option<Vec<Coin>> {
    let view = MempoolCoinView::new(chain.coins(), pool, None);
    tx.vin
        .iter()
        .map(|input| view.coin(&input.prevout).ok().flatten())
        .collect()
}
