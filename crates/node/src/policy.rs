//! Relay policy: what this node forwards, independent of consensus.

use std::fmt;

use tapd_chainstate::coins::Coin;
use tapd_chainstate::validation::{RejectCode, Rejection};
use tapd_consensus::constants::{MAX_BLOCK_SIGOPS, STANDARD_LOCKTIME_VERIFY_FLAGS};
use tapd_consensus::money::Amount;
use tapd_primitives::encoding::compact_size_len;
use tapd_primitives::transaction::{Transaction, TxOut};
use tapd_script::interpreter::MAX_SCRIPT_ELEMENT_SIZE;
use tapd_script::opcodes::Instructions;
use tapd_script::standard::{
    classify_script_pubkey, count_sigops, is_push_only, is_unspendable, ScriptType,
    MAX_STANDARD_MULTISIG_KEYS,
};

use crate::config::MempoolLimits;

pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
/// Smallest relayed transaction; anything shorter can be confused with a 64-byte merkle node.
pub const MIN_STANDARD_TX_SIZE: usize = 82;
pub const MAX_STANDARD_VERSION: i32 = 2;
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
pub const MAX_P2SH_SIGOPS: u32 = 15;
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;
/// Outpoint, script length, an uncompressed-key signature and sequence.
const SPEND_INPUT_SIZE: usize = 32 + 4 + 1 + 107 + 4;

/// Fee per 1000 bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FeeRate(Amount);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub fn per_kb(amount: Amount) -> Self {
        FeeRate(amount.max(0))
    }

    /// Rate paid by `fee` over `size` bytes.
    pub fn from_fee(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return FeeRate(0);
        }
        let rate = i128::from(fee) * 1000 / size as i128;
        FeeRate(rate.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    pub fn as_per_kb(self) -> Amount {
        self.0
    }

    /// Fee for `size` bytes; never rounds a positive rate down to zero.
    pub fn fee_for(self, size: usize) -> Amount {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let fee = self.0.saturating_mul(size) / 1000;
        if fee == 0 && size != 0 && self.0 > 0 {
            1
        } else {
            fee
        }
    }

    pub fn saturating_add(self, other: FeeRate) -> Self {
        FeeRate(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/kB", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub require_standard: bool,
    pub min_relay_fee: FeeRate,
    pub incremental_relay_fee: FeeRate,
    pub dust_relay_fee: FeeRate,
    pub max_tx_fee: Amount,
    pub max_bytes: usize,
    pub expiry_secs: u64,
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub descendant_count: usize,
    pub descendant_size: usize,
    pub replacement_enabled: bool,
    /// Lock time flags for finality and sequence locks; without
    /// median-time-past the wall clock is used.
    pub locktime_flags: u32,
    pub max_op_return_relay: usize,
}

impl MempoolPolicy {
    pub fn from_limits(limits: &MempoolLimits) -> Self {
        Self {
            require_standard: limits.require_standard,
            min_relay_fee: FeeRate::per_kb(limits.min_relay_fee_per_kb),
            incremental_relay_fee: FeeRate::per_kb(limits.incremental_relay_fee_per_kb),
            dust_relay_fee: FeeRate::per_kb(limits.dust_relay_fee_per_kb),
            max_tx_fee: limits.max_tx_fee,
            max_bytes: limits.max_bytes,
            expiry_secs: limits.expiry_secs,
            ancestor_count: limits.ancestor_count,
            ancestor_size: limits.ancestor_size,
            descendant_count: limits.descendant_count,
            descendant_size: limits.descendant_size,
            replacement_enabled: limits.replacement_enabled,
            locktime_flags: STANDARD_LOCKTIME_VERIFY_FLAGS,
            max_op_return_relay: tapd_script::standard::MAX_OP_RETURN_RELAY,
        }
    }

    pub fn standard(network: tapd_consensus::Network) -> Self {
        Self::from_limits(&MempoolLimits::for_network(network))
    }

    /// Shape checks on the transaction alone.
    pub fn check_standard_tx(&self, tx: &Transaction) -> Result<(), Rejection> {
        if tx.features < 1 || tx.features > MAX_STANDARD_VERSION {
            return Err(nonstandard("version"));
        }
        if tx.total_size() > MAX_STANDARD_TX_SIZE {
            return Err(nonstandard("tx-size"));
        }
        for input in &tx.vin {
            if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
                return Err(nonstandard("scriptsig-size"));
            }
            if !is_push_only(&input.script_sig) {
                return Err(nonstandard("scriptsig-not-pushonly"));
            }
        }

        let mut null_data = 0usize;
        for output in &tx.vout {
            match classify_script_pubkey(&output.script_pubkey) {
                ScriptType::NonStandard => return Err(nonstandard("scriptpubkey")),
                ScriptType::NullData => {
                    if output.script_pubkey.len() > self.max_op_return_relay {
                        return Err(nonstandard("scriptpubkey"));
                    }
                    null_data += 1;
                    continue;
                }
                ScriptType::MultiSig { keys, .. } if usize::from(keys) > MAX_STANDARD_MULTISIG_KEYS => {
                    return Err(nonstandard("scriptpubkey"));
                }
                ScriptType::ColoredP2Pkh | ScriptType::ColoredP2Sh => continue,
                _ => {}
            }
            if self.is_dust(output) {
                return Err(nonstandard("dust"));
            }
        }
        if null_data > 1 {
            return Err(nonstandard("multi-op-return"));
        }
        Ok(())
    }

    /// Checks the spent scripts: every input must spend a standard output,
    /// and P2SH redeem scripts stay within the sigop budget.
    pub fn check_standard_inputs(&self, tx: &Transaction, coins: &[Coin]) -> Result<(), Rejection> {
        for (input, coin) in tx.vin.iter().zip(coins) {
            let redeem_check = match classify_script_pubkey(&coin.script_pubkey) {
                ScriptType::NonStandard => {
                    return Err(nonstandard_inputs("spends a non-standard output"))
                }
                ScriptType::P2Sh | ScriptType::ColoredP2Sh => true,
                _ => false,
            };
            if !redeem_check {
                continue;
            }
            let Some(redeem) = last_push(&input.script_sig) else {
                return Err(nonstandard_inputs("p2sh input without a redeem script"));
            };
            if redeem.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(nonstandard_inputs("redeem script too large"));
            }
            if count_sigops(redeem, true) > MAX_P2SH_SIGOPS {
                return Err(nonstandard_inputs("redeem script sigops"));
            }
        }
        Ok(())
    }

    /// An output worth less than the fee to spend it at the dust rate.
    pub fn is_dust(&self, output: &TxOut) -> bool {
        output.value < dust_threshold(output, self.dust_relay_fee)
    }
}

pub fn dust_threshold(output: &TxOut, dust_relay_fee: FeeRate) -> Amount {
    if is_unspendable(&output.script_pubkey) {
        return 0;
    }
    let out_size = 8 + compact_size_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
    dust_relay_fee.fee_for(out_size + SPEND_INPUT_SIZE)
}

fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut last = None;
    for instruction in Instructions::new(script) {
        let (_, data) = instruction?;
        last = Some(data);
    }
    last.filter(|data| !data.is_empty())
}

fn nonstandard(reason: &'static str) -> Rejection {
    Rejection::policy(RejectCode::NonStandard, reason)
}

fn nonstandard_inputs(debug: &'static str) -> Rejection {
    nonstandard("bad-txns-nonstandard-inputs").with_debug(debug)
}
