//! Validation outcomes and context-free/contextual consensus checks.

use std::collections::HashSet;
use std::fmt;

use tapd_consensus::constants::{
    COINBASE_MATURITY, DEFAULT_MAX_BLOCK_SIZE, LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE,
    MAX_BLOCK_SIGOPS, MAX_FUTURE_BLOCK_TIME, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use tapd_consensus::money::{checked_money_add, money_range, Amount};
use tapd_primitives::block::{Block, BlockHeader};
use tapd_primitives::color::{color_of_script, ColorIdentifier};
use tapd_primitives::outpoint::OutPoint;
use tapd_primitives::transaction::Transaction;
use tapd_script::standard::{count_sigops, p2sh_sigops};
use tapd_storage::StoreError;

use crate::coins::{Coin, CoinView};

/// BIP61 reject codes plus node-local codes that never go on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    InsufficientFee,
    HighFee,
    AlreadyKnown,
    Conflict,
}

impl RejectCode {
    pub fn as_u32(self) -> u32 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::NonStandard => 0x40,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::HighFee => 0x100,
            RejectCode::AlreadyKnown => 0x101,
            RejectCode::Conflict => 0x102,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureClass {
    Structural,
    Policy,
    Consensus,
    /// Transient: pool full, chain limits. May succeed later.
    Resource,
    /// Two equivalent checks disagreed.
    InternalConsistency,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub code: RejectCode,
    pub reason: String,
    pub debug: Option<String>,
    pub dos: u32,
    pub corruption_possible: bool,
    pub class: FailureClass,
}

impl Rejection {
    fn new(class: FailureClass, dos: u32, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            debug: None,
            dos,
            corruption_possible: false,
            class,
        }
    }

    pub fn structural(reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Structural, 100, RejectCode::Malformed, reason)
    }

    pub fn consensus(dos: u32, code: RejectCode, reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Consensus, dos, code, reason)
    }

    pub fn policy(code: RejectCode, reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Policy, 0, code, reason)
    }

    pub fn resource(code: RejectCode, reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Resource, 0, code, reason)
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    /// The data may have been damaged in transit, so the block hash must not be marked failed.
    pub fn corruption_possible(mut self) -> Self {
        self.corruption_possible = true;
        self
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.reason, self.code.as_u32())?;
        if let Some(debug) = &self.debug {
            write!(f, ", {debug}")?;
        }
        Ok(())
    }
}

/// Outcome of any check, folded at public boundaries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ValidationState {
    #[default]
    Valid,
    Invalid(Rejection),
    /// Not an error: retry once these outpoints exist.
    MissingInputs(Vec<OutPoint>),
    Error(String),
}

impl ValidationState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationState::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationState::Invalid(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationState::Error(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ValidationState::Invalid(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> &str {
        match self {
            ValidationState::Valid => "",
            ValidationState::Invalid(rejection) => &rejection.reason,
            ValidationState::MissingInputs(_) => "missing-inputs",
            ValidationState::Error(message) => message,
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationState::Valid => write!(f, "valid"),
            ValidationState::Invalid(rejection) => write!(f, "{rejection}"),
            ValidationState::MissingInputs(missing) => {
                write!(f, "missing {} input(s)", missing.len())
            }
            ValidationState::Error(message) => write!(f, "internal error: {message}"),
        }
    }
}

/// Early-exit error used inside multi-stage checks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationFailure {
    Rejected(Rejection),
    MissingInputs(Vec<OutPoint>),
    Internal(String),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::Rejected(rejection) => write!(f, "{rejection}"),
            ValidationFailure::MissingInputs(missing) => {
                write!(f, "missing {} input(s)", missing.len())
            }
            ValidationFailure::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationFailure {}

impl From<Rejection> for ValidationFailure {
    fn from(rejection: Rejection) -> Self {
        ValidationFailure::Rejected(rejection)
    }
}

impl From<StoreError> for ValidationFailure {
    fn from(err: StoreError) -> Self {
        ValidationFailure::Internal(err.to_string())
    }
}

impl From<ValidationFailure> for ValidationState {
    fn from(failure: ValidationFailure) -> Self {
        match failure {
            ValidationFailure::Rejected(rejection) => ValidationState::Invalid(rejection),
            ValidationFailure::MissingInputs(missing) => ValidationState::MissingInputs(missing),
            ValidationFailure::Internal(message) => ValidationState::Error(message),
        }
    }
}

impl From<Result<(), ValidationFailure>> for ValidationState {
    fn from(result: Result<(), ValidationFailure>) -> Self {
        match result {
            Ok(()) => ValidationState::Valid,
            Err(failure) => failure.into(),
        }
    }
}

fn invalid(reason: &'static str) -> Rejection {
    Rejection::consensus(100, RejectCode::Invalid, reason)
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), Rejection> {
    if tx.vin.is_empty() {
        return Err(Rejection::consensus(10, RejectCode::Invalid, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(Rejection::consensus(10, RejectCode::Invalid, "bad-txns-vout-empty"));
    }
    if tx.total_size() > DEFAULT_MAX_BLOCK_SIZE as usize {
        return Err(invalid("bad-txns-oversize"));
    }
    let mut total: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(invalid("bad-txns-vout-negative"));
        }
        if !money_range(output.value) {
            return Err(invalid("bad-txns-vout-toolarge"));
        }
        total = checked_money_add(total, output.value)
            .ok_or_else(|| invalid("bad-txns-txouttotal-toolarge"))?;
    }
    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(invalid("bad-txns-inputs-duplicate"));
        }
    }
    if tx.is_coinbase() {
        if tx.vin[0].script_sig.len() > 100 {
            return Err(invalid("bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.hash == [0u8; 32]) {
        return Err(Rejection::consensus(10, RejectCode::Invalid, "bad-txns-prevout-null"));
    }
    Ok(())
}

/// Final when the lock time has passed at (`height`, `time`) or every input opts out.
pub fn is_final_tx(tx: &Transaction, height: i32, time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Minimum height and time that must both be exceeded; `-1` means unconstrained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequenceLocks {
    pub min_height: i32,
    pub min_time: i64,
}

impl Default for SequenceLocks {
    fn default() -> Self {
        Self {
            min_height: -1,
            min_time: -1,
        }
    }
}

/// Relative lock constraints of `tx` given the confirmation height of each
/// input's coin. Inputs without a relative lock get their height zeroed in
/// `prev_heights`. `median_time_at(h)` returns the median-time-past of the
/// active ancestor at height `h`.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &mut [i32],
    median_time_at: impl Fn(i32) -> i64,
) -> SequenceLocks {
    let mut locks = SequenceLocks::default();
    let enforce = tx.features >= 2 && flags & LOCKTIME_VERIFY_SEQUENCE != 0;
    if !enforce {
        return locks;
    }
    for (input, coin_height) in tx.vin.iter().zip(prev_heights.iter_mut()) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            *coin_height = 0;
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = median_time_at((*coin_height - 1).max(0));
            let time = coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            locks.min_time = locks.min_time.max(time);
        } else {
            let height = *coin_height + value as i32 - 1;
            locks.min_height = locks.min_height.max(height);
        }
    }
    locks
}

pub fn evaluate_sequence_locks(block_height: i32, block_median_time: i64, locks: SequenceLocks) -> bool {
    locks.min_height < block_height && locks.min_time < block_median_time
}

/// Signature operations counted without looking at spent outputs.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| count_sigops(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Signature operations inside P2SH redeem scripts, one coin per input.
pub fn p2sh_sigop_count(tx: &Transaction, coins: &[Coin]) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .zip(coins)
        .map(|(input, coin)| p2sh_sigops(&coin.script_pubkey, &input.script_sig))
        .sum()
}

/// Context-free block checks. `max_block_size` is the limit in force at the block's height.
pub fn check_block(block: &Block, max_block_size: u32) -> Result<(), Rejection> {
    let (merkle_root, mutated) = block.compute_merkle_root();
    if merkle_root != block.header.merkle_root {
        return Err(invalid("bad-txnmrklroot").corruption_possible());
    }
    if mutated {
        return Err(invalid("bad-txns-duplicate").corruption_possible());
    }
    let (im_merkle_root, im_mutated) = block.compute_im_merkle_root();
    if im_merkle_root != block.header.im_merkle_root || im_mutated {
        return Err(invalid("bad-immrklroot").corruption_possible());
    }
    if block.transactions.is_empty() || block.serialized_size() > max_block_size as usize {
        return Err(invalid("bad-blk-length"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(invalid("bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(invalid("bad-cb-multiple"));
    }
    let mut seen = HashSet::with_capacity(block.transactions.len());
    let mut sigops = 0u32;
    for tx in &block.transactions {
        check_transaction(tx).map_err(|rejection| {
            let debug = format!("transaction check failed: {}", rejection.reason);
            rejection.with_debug(debug)
        })?;
        if !seen.insert(tx.txid()) {
            return Err(invalid("bad-txns-duplicate"));
        }
        sigops = sigops.saturating_add(legacy_sigop_count(tx));
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(invalid("bad-blk-sigops"));
    }
    Ok(())
}

/// Header checks that need the parent: time window around median-time-past.
pub fn contextual_check_header(
    header: &BlockHeader,
    prev_median_time: i64,
    adjusted_time: i64,
) -> Result<(), Rejection> {
    let time = i64::from(header.time);
    if time <= prev_median_time {
        return Err(invalid("time-too-old"));
    }
    if time > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(Rejection::consensus(0, RejectCode::Invalid, "time-too-new"));
    }
    Ok(())
}

/// Finality against the parent's median-time-past and the coinbase height commitment.
pub fn contextual_check_block(
    block: &Block,
    height: i32,
    prev_median_time: i64,
) -> Result<(), Rejection> {
    for tx in &block.transactions {
        if !is_final_tx(tx, height, prev_median_time) {
            return Err(Rejection::consensus(10, RejectCode::Invalid, "bad-txns-nonfinal"));
        }
    }
    let coinbase_height = block
        .transactions
        .first()
        .and_then(|tx| tx.vin.first())
        .map(|input| input.prevout.index);
    if coinbase_height != Some(height as u32) {
        return Err(invalid("bad-cb-height"));
    }
    Ok(())
}

/// Input availability, coinbase maturity and uncolored value balance.
/// Returns the fee, which is paid in uncolored value only.
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &[Coin],
    spend_height: i32,
) -> Result<Amount, Rejection> {
    if coins.len() != tx.vin.len() {
        return Err(Rejection::consensus(
            0,
            RejectCode::Invalid,
            "bad-txns-inputs-missingorspent",
        ));
    }
    let mut value_in: Amount = 0;
    for coin in coins {
        if coin.is_coinbase && spend_height - (coin.height as i32) < COINBASE_MATURITY {
            return Err(Rejection::consensus(
                0,
                RejectCode::Invalid,
                "bad-txns-premature-spend-of-coinbase",
            )
            .with_debug(format!(
                "tried to spend coinbase at depth {}",
                spend_height - coin.height as i32
            )));
        }
        if !money_range(coin.value) {
            return Err(invalid("bad-txns-inputvalues-outofrange"));
        }
        if coin.color().matching_key() == ColorIdentifier::None {
            value_in = checked_money_add(value_in, coin.value)
                .ok_or_else(|| invalid("bad-txns-inputvalues-outofrange"))?;
        }
    }
    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if color_of_script(&output.script_pubkey).matching_key() == ColorIdentifier::None {
            value_out = checked_money_add(value_out, output.value)
                .ok_or_else(|| invalid("bad-txns-txouttotal-toolarge"))?;
        }
    }
    if value_in < value_out {
        return Err(invalid("bad-txns-in-belowout")
            .with_debug(format!("value in ({value_in}) < value out ({value_out})")));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(invalid("bad-txns-fee-outofrange"));
    }
    Ok(fee)
}

/// Fetches the coin for every input, collecting the outpoints that are absent.
pub fn collect_coins(
    tx: &Transaction,
    view: &dyn CoinView,
) -> Result<Result<Vec<Coin>, Vec<OutPoint>>, StoreError> {
    let mut coins = Vec::with_capacity(tx.vin.len());
    let mut missing = Vec::new();
    for input in &tx.vin {
        match view.coin(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None => missing.push(input.prevout),
        }
    }
    if missing.is_empty() {
        Ok(Ok(coins))
    } else {
        Ok(Err(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapd_primitives::block::XField;
    use tapd_primitives::transaction::{TxIn, TxOut};

    fn input(hash: u8, index: u32, sequence: u32) -> TxIn {
        TxIn {
            prevout: OutPoint::new([hash; 32], index),
            script_sig: vec![0x51],
            sequence,
        }
    }

    fn tx(vin: Vec<TxIn>, values: &[Amount]) -> Transaction {
        Transaction {
            features: 1,
            vin,
            vout: values
                .iter()
                .map(|value| TxOut {
                    value: *value,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn coinbase(height: u32) -> Transaction {
        Transaction {
            features: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([0u8; 32], height),
                script_sig: vec![0x01, 0x02],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                im_merkle_root: [0u8; 32],
                time: 10,
                xfield: XField::None,
                proof: vec![0x30],
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block.header.im_merkle_root = block.compute_im_merkle_root().0;
        block
    }

    #[test]
    fn transaction_shape_rules() {
        assert!(check_transaction(&tx(vec![input(1, 0, 0)], &[5])).is_ok());
        assert_eq!(
            check_transaction(&tx(Vec::new(), &[5])).expect_err("empty").reason,
            "bad-txns-vin-empty"
        );
        assert_eq!(
            check_transaction(&tx(vec![input(1, 0, 0)], &[])).expect_err("no outputs").reason,
            "bad-txns-vout-empty"
        );
        assert_eq!(
            check_transaction(&tx(vec![input(1, 0, 0)], &[-1])).expect_err("negative").reason,
            "bad-txns-vout-negative"
        );
        assert_eq!(
            check_transaction(&tx(vec![input(1, 0, 0), input(1, 0, 0)], &[1]))
                .expect_err("duplicate")
                .reason,
            "bad-txns-inputs-duplicate"
        );
        let max = tapd_consensus::money::MAX_MONEY;
        assert_eq!(
            check_transaction(&tx(vec![input(1, 0, 0)], &[max, 1]))
                .expect_err("total")
                .reason,
            "bad-txns-txouttotal-toolarge"
        );
    }

    #[test]
    fn finality_uses_height_or_time() {
        let mut locked = tx(vec![input(1, 0, 0)], &[1]);
        locked.lock_time = 100;
        assert!(!is_final_tx(&locked, 100, 0));
        assert!(is_final_tx(&locked, 101, 0));
        locked.lock_time = LOCKTIME_THRESHOLD + 50;
        assert!(!is_final_tx(&locked, 1_000, i64::from(LOCKTIME_THRESHOLD)));
        assert!(is_final_tx(&locked, 1_000, i64::from(LOCKTIME_THRESHOLD) + 51));
        locked.vin[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&locked, 0, 0));
    }

    #[test]
    fn sequence_locks_need_features_two() {
        let mut spend = tx(vec![input(1, 0, 5), input(2, 0, SEQUENCE_LOCKTIME_DISABLE_FLAG)], &[1]);
        let mut heights = vec![10, 12];
        let locks = calculate_sequence_locks(&spend, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        assert_eq!(locks, SequenceLocks::default());

        spend.features = 2;
        let locks = calculate_sequence_locks(&spend, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        assert_eq!(locks.min_height, 14);
        assert_eq!(heights[1], 0);
        assert!(!evaluate_sequence_locks(14, 0, locks));
        assert!(evaluate_sequence_locks(15, 0, locks));

        spend.vin[0].sequence = SEQUENCE_LOCKTIME_TYPE_FLAG | 2;
        let mut heights = vec![10, 12];
        let locks =
            calculate_sequence_locks(&spend, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |h| {
                1_000 + i64::from(h)
            });
        assert_eq!(locks.min_time, 1_009 + 1_024 - 1);
        assert!(!evaluate_sequence_locks(100, 2_032, locks));
        assert!(evaluate_sequence_locks(100, 2_033, locks));
    }

    #[test]
    fn block_structure_rules() {
        let good = block(vec![coinbase(3), tx(vec![input(1, 0, 0)], &[1])]);
        assert!(check_block(&good, DEFAULT_MAX_BLOCK_SIZE).is_ok());
        assert!(contextual_check_block(&good, 3, 0).is_ok());
        assert_eq!(
            contextual_check_block(&good, 4, 0).expect_err("height").reason,
            "bad-cb-height"
        );
        assert_eq!(
            check_block(&good, 50).expect_err("size").reason,
            "bad-blk-length"
        );

        let mut bad_root = good.clone();
        bad_root.header.merkle_root = [1u8; 32];
        let rejection = check_block(&bad_root, DEFAULT_MAX_BLOCK_SIZE).expect_err("root");
        assert_eq!(rejection.reason, "bad-txnmrklroot");
        assert!(rejection.corruption_possible);

        let no_coinbase = block(vec![tx(vec![input(1, 0, 0)], &[1])]);
        assert_eq!(
            check_block(&no_coinbase, DEFAULT_MAX_BLOCK_SIZE).expect_err("cb").reason,
            "bad-cb-missing"
        );
        let two_coinbases = block(vec![coinbase(1), coinbase(2)]);
        assert_eq!(
            check_block(&two_coinbases, DEFAULT_MAX_BLOCK_SIZE).expect_err("cb").reason,
            "bad-cb-multiple"
        );
    }

    #[test]
    fn header_time_window() {
        let header = block(vec![coinbase(1)]).header;
        assert!(contextual_check_header(&header, 9, 0).is_ok());
        assert_eq!(
            contextual_check_header(&header, 10, 0).expect_err("old").reason,
            "time-too-old"
        );
        assert_eq!(
            contextual_check_header(&header, 0, 10 - MAX_FUTURE_BLOCK_TIME - 1)
                .expect_err("new")
                .reason,
            "time-too-new"
        );
    }

    #[test]
    fn inputs_must_cover_uncolored_outputs() {
        let spend = tx(vec![input(1, 0, 0)], &[40]);
        let coins = vec![Coin::new(50, vec![0x51], 5, false)];
        assert_eq!(check_tx_inputs(&spend, &coins, 10).expect("fee"), 10);

        let coins = vec![Coin::new(30, vec![0x51], 5, false)];
        assert_eq!(
            check_tx_inputs(&spend, &coins, 10).expect_err("below").reason,
            "bad-txns-in-belowout"
        );

        let coins = vec![Coin::new(50, vec![0x51], 5, true)];
        assert_eq!(
            check_tx_inputs(&spend, &coins, 104).expect_err("immature").reason,
            "bad-txns-premature-spend-of-coinbase"
        );
        assert!(check_tx_inputs(&spend, &coins, 105).is_ok());
    }

    #[test]
    fn failure_folds_into_state() {
        let missing: Result<(), ValidationFailure> =
            Err(ValidationFailure::MissingInputs(vec![OutPoint::new([1u8; 32], 0)]));
        let state: ValidationState = missing.into();
        assert_eq!(state.reject_reason(), "missing-inputs");
        let passed: Result<(), ValidationFailure> = Ok(());
        let state: ValidationState = passed.into();
        assert!(state.is_valid());
        let state: ValidationState =
            ValidationFailure::from(Rejection::policy(RejectCode::NonStandard, "dust")).into();
        assert_eq!(state.rejection().map(|r| r.dos), Some(0));
    }
}
